use crate::jvm::class_file::{invalid_data, parse_bytes, Parse, Serialize};
use crate::jvm::class_file::{ClassConstantIndex, ConstantsPool, Utf8ConstantIndex};
use crate::jvm::verifier::VerificationType;
use crate::jvm::Error;
use byteorder::{ReadBytesExt, WriteBytesExt};

/// Attributes (used in classes, fields, methods, and even on some attributes)
///
/// Attributes the instrumentor doesn't need to understand stay in this raw form and are written
/// back out byte for byte.
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.7
#[derive(Clone, Debug)]
pub struct Attribute {
    pub name_index: Utf8ConstantIndex,
    pub info: Vec<u8>,
}

impl Attribute {
    /// Name of the attribute (`None` if the name isn't a valid utf8 constant)
    pub fn name<'p>(&self, constants: &'p ConstantsPool) -> Option<&'p str> {
        constants.utf8(self.name_index).ok()
    }

    /// Is this the attribute `A`?
    pub fn is<A: AttributeLike>(&self, constants: &ConstantsPool) -> bool {
        self.name(constants) == Some(A::NAME)
    }

    /// Decode the attribute contents
    pub fn decode<A: Parse>(&self) -> Result<A, Error> {
        let mut info: &[u8] = &self.info;
        let decoded = A::parse(&mut info).map_err(Error::IoError)?;
        if info.is_empty() {
            Ok(decoded)
        } else {
            Err(Error::MalformedClassFile(format!(
                "attribute has {} trailing bytes",
                info.len()
            )))
        }
    }
}

impl Serialize for Attribute {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.name_index.serialize(writer)?;

        // Attribute info length is 4 bytes
        (self.info.len() as u32).serialize(writer)?;
        writer.write_all(&self.info)?;

        Ok(())
    }
}

impl Parse for Attribute {
    fn parse<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        let name_index = Utf8ConstantIndex::parse(reader)?;
        let len = u32::parse(reader)? as usize;
        let info = parse_bytes(reader, len)?;
        Ok(Attribute { name_index, info })
    }
}

/// Attributes are all stored in the same way (see `Attribute`), but internally
/// they represent very different things. This trait is implemented by things
/// which can be turned into (or read out of) attributes.
pub trait AttributeLike {
    /// Name of the attribute
    const NAME: &'static str;
}

/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.7.3
#[derive(Debug)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code_array: BytecodeArray,
    pub exception_table: Vec<ExceptionHandler>,
    pub attributes: Vec<Attribute>,
}

impl Serialize for Code {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.max_stack.serialize(writer)?;
        self.max_locals.serialize(writer)?;
        self.code_array.serialize(writer)?;
        self.exception_table.serialize(writer)?;
        self.attributes.serialize(writer)?;
        Ok(())
    }
}

impl Parse for Code {
    fn parse<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        Ok(Code {
            max_stack: u16::parse(reader)?,
            max_locals: u16::parse(reader)?,
            code_array: BytecodeArray::parse(reader)?,
            exception_table: Vec::parse(reader)?,
            attributes: Vec::parse(reader)?,
        })
    }
}

impl AttributeLike for Code {
    const NAME: &'static str = "Code";
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Start of exception handler range (inclusive)
    pub start_pc: BytecodeIndex,

    /// End of exception handler range (exclusive)
    pub end_pc: BytecodeIndex,

    /// Start of the exception handler
    pub handler_pc: BytecodeIndex,

    /// Zero means "any exception" (used for `finally`)
    pub catch_type: ClassConstantIndex,
}

impl Serialize for ExceptionHandler {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.start_pc.serialize(writer)?;
        self.end_pc.serialize(writer)?;
        self.handler_pc.serialize(writer)?;
        self.catch_type.serialize(writer)?;
        Ok(())
    }
}

impl Parse for ExceptionHandler {
    fn parse<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        Ok(ExceptionHandler {
            start_pc: BytecodeIndex::parse(reader)?,
            end_pc: BytecodeIndex::parse(reader)?,
            handler_pc: BytecodeIndex::parse(reader)?,
            catch_type: ClassConstantIndex::parse(reader)?,
        })
    }
}

/// Encoded bytecode instructions
#[derive(Debug)]
pub struct BytecodeArray(pub Vec<u8>);

impl Serialize for BytecodeArray {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        let len = self.0.len() as u32;
        len.serialize(writer)?;
        writer.write_all(&self.0)?;
        Ok(())
    }
}

impl Parse for BytecodeArray {
    fn parse<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        let len = u32::parse(reader)? as usize;
        if len == 0 || len > u16::MAX as usize {
            return Err(invalid_data(format!("Invalid code length {}", len)));
        }
        parse_bytes(reader, len).map(BytecodeArray)
    }
}

/// Index into `BytecodeArray`
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BytecodeIndex(pub u16);

impl Serialize for BytecodeIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl Parse for BytecodeIndex {
    fn parse<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        u16::parse(reader).map(BytecodeIndex)
    }
}

/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.7.12
#[derive(Debug, Default)]
pub struct LineNumberTable(pub Vec<LineNumber>);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LineNumber {
    pub start_pc: BytecodeIndex,
    pub line_number: u16,
}

impl AttributeLike for LineNumberTable {
    const NAME: &'static str = "LineNumberTable";
}

impl Serialize for LineNumberTable {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl Parse for LineNumberTable {
    fn parse<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        Vec::parse(reader).map(LineNumberTable)
    }
}

impl Serialize for LineNumber {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.start_pc.serialize(writer)?;
        self.line_number.serialize(writer)?;
        Ok(())
    }
}

impl Parse for LineNumber {
    fn parse<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        Ok(LineNumber {
            start_pc: BytecodeIndex::parse(reader)?,
            line_number: u16::parse(reader)?,
        })
    }
}

/// Shared layout of `LocalVariableTable` and `LocalVariableTypeTable` entries
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.7.13
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LocalVariable {
    pub start_pc: BytecodeIndex,
    pub length: u16,
    pub name_index: Utf8ConstantIndex,

    /// Descriptor (for `LocalVariableTable`) or signature (for `LocalVariableTypeTable`)
    pub descriptor_index: Utf8ConstantIndex,
    pub index: u16,
}

impl Serialize for LocalVariable {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.start_pc.serialize(writer)?;
        self.length.serialize(writer)?;
        self.name_index.serialize(writer)?;
        self.descriptor_index.serialize(writer)?;
        self.index.serialize(writer)?;
        Ok(())
    }
}

impl Parse for LocalVariable {
    fn parse<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        Ok(LocalVariable {
            start_pc: BytecodeIndex::parse(reader)?,
            length: u16::parse(reader)?,
            name_index: Utf8ConstantIndex::parse(reader)?,
            descriptor_index: Utf8ConstantIndex::parse(reader)?,
            index: u16::parse(reader)?,
        })
    }
}

#[derive(Debug, Default)]
pub struct LocalVariableTable(pub Vec<LocalVariable>);

impl AttributeLike for LocalVariableTable {
    const NAME: &'static str = "LocalVariableTable";
}

impl Serialize for LocalVariableTable {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl Parse for LocalVariableTable {
    fn parse<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        Vec::parse(reader).map(LocalVariableTable)
    }
}

/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.7.14
#[derive(Debug, Default)]
pub struct LocalVariableTypeTable(pub Vec<LocalVariable>);

impl AttributeLike for LocalVariableTypeTable {
    const NAME: &'static str = "LocalVariableTypeTable";
}

impl Serialize for LocalVariableTypeTable {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl Parse for LocalVariableTypeTable {
    fn parse<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        Vec::parse(reader).map(LocalVariableTypeTable)
    }
}

/// [0]: https://docs.oracle.com/javase/specs/jvms/se7/html/jvms-4.html#jvms-4.7.4
#[derive(Debug)]
pub struct StackMapTable(pub Vec<StackMapFrame>);

impl AttributeLike for StackMapTable {
    const NAME: &'static str = "StackMapTable";
}

impl Serialize for StackMapTable {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

#[derive(Debug)]
pub enum StackMapFrame {
    /// Frame has the same locals as the previous frame and number of stack items is zero
    /// Tags: 0-63 or 251
    SameLocalsNoStack { offset_delta: u16 },

    /// Frame has the same locals as the previous frame and number of stack items is one
    /// Tags: 64-127 or 247
    SameLocalsOneStack {
        offset_delta: u16,
        stack: VerificationType<ClassConstantIndex, u16>,
    },

    /// Frame is like the previous frame, but without the last `chopped_k` locals
    ///
    /// Note: `chopped_k` must be in the range 1 to 3 inclusive
    /// Tags: 248-250
    ChopLocalsNoStack { offset_delta: u16, chopped_k: u8 },

    /// Frame is like the previous frame, but with extra locals
    /// Tags: 252-254
    AppendLocalsNoStack {
        offset_delta: u16,
        locals: Vec<VerificationType<ClassConstantIndex, u16>>,
    },

    /// Frame has exactly the locals and stack specified
    /// Tag: 255
    Full {
        offset_delta: u16,
        locals: Vec<VerificationType<ClassConstantIndex, u16>>,
        stack: Vec<VerificationType<ClassConstantIndex, u16>>,
    },
}

impl Serialize for StackMapFrame {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            // `same_frame` and `same_frame_extended`
            StackMapFrame::SameLocalsNoStack { offset_delta } => {
                if *offset_delta <= 63 {
                    (*offset_delta as u8).serialize(writer)?;
                } else {
                    251u8.serialize(writer)?;
                    offset_delta.serialize(writer)?;
                }
            }

            // `same_locals_1_stack_item_frame` and `same_locals_1_stack_item_frame_extended`
            StackMapFrame::SameLocalsOneStack {
                offset_delta,
                stack,
            } => {
                if *offset_delta <= 63 {
                    (*offset_delta as u8 + 64).serialize(writer)?;
                } else {
                    247u8.serialize(writer)?;
                    offset_delta.serialize(writer)?;
                }
                stack.serialize(writer)?;
            }

            // `chop_frame`
            StackMapFrame::ChopLocalsNoStack {
                offset_delta,
                chopped_k,
            } => {
                assert!(
                    0 < *chopped_k && *chopped_k < 4,
                    "ChopLocalsNoStack chops 1-3 locals"
                );
                (251 - chopped_k).serialize(writer)?;
                offset_delta.serialize(writer)?;
            }

            // `append_frame`
            StackMapFrame::AppendLocalsNoStack {
                offset_delta,
                locals,
            } => {
                let added_k = locals.len();
                assert!(
                    0 < added_k && added_k < 4,
                    "AppendLocalsNoStack adds 1-3 locals"
                );
                (251 + added_k as u8).serialize(writer)?;
                offset_delta.serialize(writer)?;
                for local in locals {
                    local.serialize(writer)?;
                }
            }

            // `full_frame`
            StackMapFrame::Full {
                offset_delta,
                locals,
                stack,
            } => {
                255u8.serialize(writer)?;
                offset_delta.serialize(writer)?;
                locals.serialize(writer)?;
                stack.serialize(writer)?;
            }
        };
        Ok(())
    }
}

/// Annotations retained in the class file
///
/// Only the annotation types are kept: matching by annotation never looks at element values,
/// which are skipped over.
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.7.16
#[derive(Debug, Default)]
pub struct RuntimeVisibleAnnotations(pub Vec<Utf8ConstantIndex>);

/// Same layout as `RuntimeVisibleAnnotations`
#[derive(Debug, Default)]
pub struct RuntimeInvisibleAnnotations(pub Vec<Utf8ConstantIndex>);

impl AttributeLike for RuntimeVisibleAnnotations {
    const NAME: &'static str = "RuntimeVisibleAnnotations";
}

impl AttributeLike for RuntimeInvisibleAnnotations {
    const NAME: &'static str = "RuntimeInvisibleAnnotations";
}

impl Parse for RuntimeVisibleAnnotations {
    fn parse<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        parse_annotation_types(reader).map(RuntimeVisibleAnnotations)
    }
}

impl Parse for RuntimeInvisibleAnnotations {
    fn parse<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        parse_annotation_types(reader).map(RuntimeInvisibleAnnotations)
    }
}

fn parse_annotation_types<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Vec<Utf8ConstantIndex>> {
    let count = u16::parse(reader)?;
    let mut types = Vec::with_capacity(count as usize);
    for _ in 0..count {
        types.push(skip_annotation(reader)?);
    }
    Ok(types)
}

/// Skip over an `annotation` structure, returning its type
fn skip_annotation<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Utf8ConstantIndex> {
    let type_index = Utf8ConstantIndex::parse(reader)?;
    let pairs = u16::parse(reader)?;
    for _ in 0..pairs {
        let _element_name = u16::parse(reader)?;
        skip_element_value(reader)?;
    }
    Ok(type_index)
}

fn skip_element_value<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<()> {
    match u8::parse(reader)? {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' | b'c' => {
            u16::parse(reader)?;
        }
        b'e' => {
            u16::parse(reader)?;
            u16::parse(reader)?;
        }
        b'@' => {
            skip_annotation(reader)?;
        }
        b'[' => {
            let len = u16::parse(reader)?;
            for _ in 0..len {
                skip_element_value(reader)?;
            }
        }
        other => {
            return Err(invalid_data(format!(
                "Unknown annotation element tag {:?}",
                other as char
            )))
        }
    }
    Ok(())
}

/// Records which trace classes have already been woven into a class
///
/// Each entry is a utf8 constant holding a trace class name. The JVM ignores attributes it
/// doesn't know about, so the marker has no runtime effect.
#[derive(Debug, Default)]
pub struct AppliedTraces(pub Vec<Utf8ConstantIndex>);

impl Serialize for AppliedTraces {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl Parse for AppliedTraces {
    fn parse<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        Vec::parse(reader).map(AppliedTraces)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_file::ConstantIndex;

    #[test]
    fn code_attribute_round_trip() {
        let code = Code {
            max_stack: 2,
            max_locals: 1,
            code_array: BytecodeArray(vec![0x2a, 0xb1]),
            exception_table: vec![ExceptionHandler {
                start_pc: BytecodeIndex(0),
                end_pc: BytecodeIndex(1),
                handler_pc: BytecodeIndex(1),
                catch_type: ClassConstantIndex(ConstantIndex(0)),
            }],
            attributes: vec![],
        };
        let mut bytes = vec![];
        code.serialize(&mut bytes).unwrap();
        let attribute = Attribute {
            name_index: Utf8ConstantIndex(ConstantIndex(1)),
            info: bytes,
        };
        let parsed: Code = attribute.decode().unwrap();
        assert_eq!(parsed.max_stack, 2);
        assert_eq!(parsed.code_array.0, vec![0x2a, 0xb1]);
        assert_eq!(parsed.exception_table, code.exception_table);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let attribute = Attribute {
            name_index: Utf8ConstantIndex(ConstantIndex(1)),
            info: vec![0, 0, 0xff],
        };
        assert!(attribute.decode::<LineNumberTable>().is_err());
    }

    #[test]
    fn annotation_types_skip_element_values() {
        // one annotation, type #7, with pairs: x = int #3, y = array [enum(#4, #5), nested @#6{}]
        let info: Vec<u8> = vec![
            0, 1, 0, 7, 0, 2, 0, 8, b'I', 0, 3, 0, 9, b'[', 0, 2, b'e', 0, 4, 0, 5, b'@', 0, 6,
            0, 0,
        ];
        let attribute = Attribute {
            name_index: Utf8ConstantIndex(ConstantIndex(1)),
            info,
        };
        let annotations: RuntimeVisibleAnnotations = attribute.decode().unwrap();
        assert_eq!(annotations.0, vec![Utf8ConstantIndex(ConstantIndex(7))]);
    }
}
