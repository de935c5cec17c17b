use crate::jvm::class_file::{
    invalid_data, parse_bytes, Attribute, AttributeLike, Parse, Serialize,
};
use crate::jvm::descriptors::{ParseDescriptor, RenderDescriptor};
use crate::jvm::names::Name;
use crate::jvm::{BinaryName, Error, FieldType, MethodDescriptor, RefType, UnqualifiedName};
use crate::util::{Offset, OffsetResult, OffsetVec, Width};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::borrow::{Borrow, Cow};
use std::collections::HashMap;
use std::result::Result;

/// Constant pool of a class being rewritten
///
/// The pool starts out as whatever was parsed from the input class (every existing entry keeps
/// its index) and is append only from there on. Lookups for new entries are deduplicated
/// against both the parsed and the appended entries.
pub struct ConstantsPool {
    constants: OffsetVec<Constant>,

    classes: HashMap<Utf8ConstantIndex, ClassConstantIndex>,
    fieldrefs: HashMap<(ClassConstantIndex, NameAndTypeConstantIndex), FieldRefConstantIndex>,
    methodrefs:
        HashMap<(ClassConstantIndex, NameAndTypeConstantIndex, bool), MethodRefConstantIndex>,
    strings: HashMap<Utf8ConstantIndex, StringConstantIndex>,
    integers: HashMap<i32, ConstantIndex>,
    longs: HashMap<i64, ConstantIndex>,
    name_and_types: HashMap<(Utf8ConstantIndex, Utf8ConstantIndex), NameAndTypeConstantIndex>,
    utf8s: HashMap<String, Utf8ConstantIndex>,
}

/// Resolved `CONSTANT_Fieldref_info`
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FieldRef {
    pub owner: BinaryName,
    pub name: UnqualifiedName,
    pub descriptor: FieldType<BinaryName>,
}

/// Resolved `CONSTANT_Methodref_info` or `CONSTANT_InterfaceMethodref_info`
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MethodRef {
    /// Usually a class, but methods like `clone` can be called on array types
    pub owner: RefType<BinaryName>,
    pub name: UnqualifiedName,
    pub descriptor: MethodDescriptor<BinaryName>,
    pub is_interface: bool,
}

impl ConstantsPool {
    /// Make a fresh empty constants pool
    pub fn new() -> ConstantsPool {
        ConstantsPool::from_parsed(OffsetVec::new_starting_at(Offset(1)))
    }

    /// Wrap constants parsed from a class file, indexing them for deduplication
    pub fn from_parsed(constants: OffsetVec<Constant>) -> ConstantsPool {
        let mut pool = ConstantsPool {
            constants: OffsetVec::new_starting_at(Offset(1)),
            classes: HashMap::new(),
            fieldrefs: HashMap::new(),
            methodrefs: HashMap::new(),
            strings: HashMap::new(),
            integers: HashMap::new(),
            longs: HashMap::new(),
            name_and_types: HashMap::new(),
            utf8s: HashMap::new(),
        };
        for (offset, _, constant) in &constants {
            let idx = ConstantIndex(offset.0 as u16);
            match constant {
                Constant::Utf8(string) => {
                    pool.utf8s.entry(string.clone()).or_insert(Utf8ConstantIndex(idx));
                }
                Constant::Class(name) => {
                    pool.classes.entry(*name).or_insert(ClassConstantIndex(idx));
                }
                Constant::String(utf8) => {
                    pool.strings.entry(*utf8).or_insert(StringConstantIndex(idx));
                }
                Constant::Integer(integer) => {
                    pool.integers.entry(*integer).or_insert(idx);
                }
                Constant::Long(long) => {
                    pool.longs.entry(*long).or_insert(idx);
                }
                Constant::NameAndType { name, descriptor } => {
                    pool.name_and_types
                        .entry((*name, *descriptor))
                        .or_insert(NameAndTypeConstantIndex(idx));
                }
                Constant::FieldRef(class, name_and_type) => {
                    pool.fieldrefs
                        .entry((*class, *name_and_type))
                        .or_insert(FieldRefConstantIndex(idx));
                }
                Constant::MethodRef {
                    class,
                    name_and_type,
                    is_interface,
                } => {
                    pool.methodrefs
                        .entry((*class, *name_and_type, *is_interface))
                        .or_insert(MethodRefConstantIndex(idx));
                }
                _ => (),
            }
        }
        pool.constants = constants;
        pool
    }

    /// Push a constant into the constant pool, provided there is space for it
    ///
    /// Note: the largest valid index is 65535, indexing starts at 1, and some constants take two
    /// spaces.
    fn push_constant(&mut self, constant: Constant) -> Result<ConstantIndex, ConstantPoolOverflow> {
        // Compute the offset at which this constant will be inserted
        let offset = self.constants.offset_len().0;

        // Detect if the next constant would overflow the pool
        if offset + constant.width() > u16::MAX as usize {
            return Err(ConstantPoolOverflow { constant, offset });
        }

        self.constants.push(constant);
        Ok(ConstantIndex(offset as u16))
    }

    /// Number of pool slots in use (one more than the largest index)
    pub fn offset_len(&self) -> usize {
        self.constants.offset_len().0
    }

    /// Consume the pool and return the final vector of constants
    pub fn into_offset_vec(self) -> OffsetVec<Constant> {
        self.constants
    }

    /// Look up a constant
    pub fn get(&self, index: impl Into<ConstantIndex>) -> Result<&Constant, Error> {
        let index = index.into();
        match self.constants.get_offset(Offset(index.0 as usize)) {
            OffsetResult::Ok(_, constant) => Ok(constant),
            _ => Err(Error::MissingConstant(index)),
        }
    }

    /// Look up a utf8 constant
    pub fn utf8(&self, index: Utf8ConstantIndex) -> Result<&str, Error> {
        match self.get(index)? {
            Constant::Utf8(string) => Ok(string),
            _ => Err(Error::UnexpectedConstant {
                index: index.0,
                expected: "Utf8",
            }),
        }
    }

    /// Look up a utf8 constant holding a binary class name
    pub fn binary_name(&self, index: Utf8ConstantIndex) -> Result<BinaryName, Error> {
        BinaryName::from_string(String::from(self.utf8(index)?)).map_err(Error::BadName)
    }

    /// Look up a utf8 constant holding a field or method name
    pub fn unqualified_name(&self, index: Utf8ConstantIndex) -> Result<UnqualifiedName, Error> {
        UnqualifiedName::from_string(String::from(self.utf8(index)?)).map_err(Error::BadName)
    }

    /// Look up a utf8 constant holding a field descriptor
    pub fn field_descriptor(&self, index: Utf8ConstantIndex) -> Result<FieldType<BinaryName>, Error> {
        let descriptor = self.utf8(index)?;
        FieldType::parse(descriptor).map_err(|err| Error::BadDescriptor(err.to_string()))
    }

    /// Look up a utf8 constant holding a method descriptor
    pub fn method_descriptor(
        &self,
        index: Utf8ConstantIndex,
    ) -> Result<MethodDescriptor<BinaryName>, Error> {
        let descriptor = self.utf8(index)?;
        MethodDescriptor::parse(descriptor).map_err(|err| Error::BadDescriptor(err.to_string()))
    }

    /// Look up a class constant
    pub fn class(&self, index: ClassConstantIndex) -> Result<RefType<BinaryName>, Error> {
        match self.get(index)? {
            Constant::Class(name) => {
                let name = self.utf8(*name)?;
                RefType::from_class_constant_name(name)
                    .map_err(|err| Error::BadDescriptor(err.to_string()))
            }
            _ => Err(Error::UnexpectedConstant {
                index: index.0,
                expected: "Class",
            }),
        }
    }

    /// Look up a class constant which must name a class (not an array)
    pub fn class_name(&self, index: ClassConstantIndex) -> Result<BinaryName, Error> {
        match self.class(index)? {
            RefType::Object(name) => Ok(name),
            other => Err(Error::BadName(other.render())),
        }
    }

    /// Look up a name and type constant
    pub fn name_and_type(
        &self,
        index: NameAndTypeConstantIndex,
    ) -> Result<(Utf8ConstantIndex, Utf8ConstantIndex), Error> {
        match self.get(index)? {
            Constant::NameAndType { name, descriptor } => Ok((*name, *descriptor)),
            _ => Err(Error::UnexpectedConstant {
                index: index.0,
                expected: "NameAndType",
            }),
        }
    }

    /// Look up and resolve a field reference
    pub fn field_ref(&self, index: FieldRefConstantIndex) -> Result<FieldRef, Error> {
        match self.get(index)? {
            Constant::FieldRef(class, name_and_type) => {
                let (name, descriptor) = self.name_and_type(*name_and_type)?;
                Ok(FieldRef {
                    owner: self.class_name(*class)?,
                    name: self.unqualified_name(name)?,
                    descriptor: self.field_descriptor(descriptor)?,
                })
            }
            _ => Err(Error::UnexpectedConstant {
                index: index.0,
                expected: "Fieldref",
            }),
        }
    }

    /// Look up and resolve a method reference
    pub fn method_ref(&self, index: MethodRefConstantIndex) -> Result<MethodRef, Error> {
        match self.get(index)? {
            Constant::MethodRef {
                class,
                name_and_type,
                is_interface,
            } => {
                let (name, descriptor) = self.name_and_type(*name_and_type)?;
                Ok(MethodRef {
                    owner: self.class(*class)?,
                    name: self.unqualified_name(name)?,
                    descriptor: self.method_descriptor(descriptor)?,
                    is_interface: *is_interface,
                })
            }
            _ => Err(Error::UnexpectedConstant {
                index: index.0,
                expected: "Methodref",
            }),
        }
    }

    /// Look up the name and descriptor of an invoke dynamic call site
    pub fn invoke_dynamic(
        &self,
        index: InvokeDynamicConstantIndex,
    ) -> Result<(UnqualifiedName, MethodDescriptor<BinaryName>), Error> {
        match self.get(index)? {
            Constant::InvokeDynamic {
                method_descriptor, ..
            } => {
                let (name, descriptor) = self.name_and_type(*method_descriptor)?;
                Ok((
                    self.unqualified_name(name)?,
                    self.method_descriptor(descriptor)?,
                ))
            }
            _ => Err(Error::UnexpectedConstant {
                index: index.0,
                expected: "InvokeDynamic",
            }),
        }
    }

    /// Get or insert a utf8 constant from the constant pool
    pub fn get_utf8<'a, S: Into<Cow<'a, str>>>(
        &mut self,
        utf8: S,
    ) -> Result<Utf8ConstantIndex, ConstantPoolOverflow> {
        let cow = utf8.into();

        if let Some(idx) = self.utf8s.get::<str>(cow.borrow()) {
            Ok(*idx)
        } else {
            let owned = cow.into_owned();
            let constant = Constant::Utf8(owned.clone());
            let idx = Utf8ConstantIndex(self.push_constant(constant)?);
            self.utf8s.insert(owned, idx);
            Ok(idx)
        }
    }

    /// Get or insert a string constant from the constant pool
    pub fn get_string<'a, S: Into<Cow<'a, str>>>(
        &mut self,
        string: S,
    ) -> Result<StringConstantIndex, ConstantPoolOverflow> {
        let utf8 = self.get_utf8(string)?;
        if let Some(idx) = self.strings.get(&utf8) {
            Ok(*idx)
        } else {
            let constant = Constant::String(utf8);
            let idx = StringConstantIndex(self.push_constant(constant)?);
            self.strings.insert(utf8, idx);
            Ok(idx)
        }
    }

    /// Get or insert an integer constant from the constant pool
    pub fn get_integer(&mut self, integer: i32) -> Result<ConstantIndex, ConstantPoolOverflow> {
        if let Some(idx) = self.integers.get(&integer) {
            Ok(*idx)
        } else {
            let idx = self.push_constant(Constant::Integer(integer))?;
            self.integers.insert(integer, idx);
            Ok(idx)
        }
    }

    /// Get or insert a long constant from the constant pool
    pub fn get_long(&mut self, long: i64) -> Result<ConstantIndex, ConstantPoolOverflow> {
        if let Some(idx) = self.longs.get(&long) {
            Ok(*idx)
        } else {
            let idx = self.push_constant(Constant::Long(long))?;
            self.longs.insert(long, idx);
            Ok(idx)
        }
    }

    /// Get or insert a name & type constant from the constant pool
    pub fn get_name_and_type(
        &mut self,
        name: Utf8ConstantIndex,
        descriptor: Utf8ConstantIndex,
    ) -> Result<NameAndTypeConstantIndex, ConstantPoolOverflow> {
        let name_and_type_key = (name, descriptor);
        if let Some(idx) = self.name_and_types.get(&name_and_type_key) {
            Ok(*idx)
        } else {
            let constant = Constant::NameAndType { name, descriptor };
            let idx = NameAndTypeConstantIndex(self.push_constant(constant)?);
            self.name_and_types.insert(name_and_type_key, idx);
            Ok(idx)
        }
    }

    /// Get or insert a class constant
    ///
    /// When making a `CONSTANT_Class_info`, reference types are almost always objects. However,
    /// array types are named by their descriptor (eg. for a `checkcast` to an array type).
    pub fn get_class(
        &mut self,
        class: &RefType<BinaryName>,
    ) -> Result<ClassConstantIndex, ConstantPoolOverflow> {
        let name = self.get_utf8(class.class_constant_name())?;
        if let Some(idx) = self.classes.get(&name) {
            Ok(*idx)
        } else {
            let idx = ClassConstantIndex(self.push_constant(Constant::Class(name))?);
            self.classes.insert(name, idx);
            Ok(idx)
        }
    }

    /// Get or insert a field reference
    pub fn get_field_ref(
        &mut self,
        owner: &BinaryName,
        name: &UnqualifiedName,
        descriptor: &FieldType<BinaryName>,
    ) -> Result<FieldRefConstantIndex, ConstantPoolOverflow> {
        let class = self.get_class(&RefType::Object(owner.clone()))?;
        let name = self.get_utf8(name.as_str())?;
        let descriptor = self.get_utf8(descriptor.render())?;
        let name_and_type = self.get_name_and_type(name, descriptor)?;
        if let Some(idx) = self.fieldrefs.get(&(class, name_and_type)) {
            Ok(*idx)
        } else {
            let constant = Constant::FieldRef(class, name_and_type);
            let idx = FieldRefConstantIndex(self.push_constant(constant)?);
            self.fieldrefs.insert((class, name_and_type), idx);
            Ok(idx)
        }
    }

    /// Get or insert a method reference
    pub fn get_method_ref(
        &mut self,
        owner: &BinaryName,
        name: &UnqualifiedName,
        descriptor: &MethodDescriptor<BinaryName>,
        is_interface: bool,
    ) -> Result<MethodRefConstantIndex, ConstantPoolOverflow> {
        let class = self.get_class(&RefType::Object(owner.clone()))?;
        let name = self.get_utf8(name.as_str())?;
        let descriptor = self.get_utf8(descriptor.render())?;
        let name_and_type = self.get_name_and_type(name, descriptor)?;
        let key = (class, name_and_type, is_interface);
        if let Some(idx) = self.methodrefs.get(&key) {
            Ok(*idx)
        } else {
            let constant = Constant::MethodRef {
                class,
                name_and_type,
                is_interface,
            };
            let idx = MethodRefConstantIndex(self.push_constant(constant)?);
            self.methodrefs.insert(key, idx);
            Ok(idx)
        }
    }

    /// Add an attribute to the constant pool
    pub fn get_attribute<A: AttributeLike + Serialize>(&mut self, attribute: A) -> Result<Attribute, Error> {
        let name_index = self.get_utf8(A::NAME)?;
        let mut info = vec![];

        attribute.serialize(&mut info).map_err(Error::IoError)?;

        Ok(Attribute { name_index, info })
    }
}

impl Default for ConstantsPool {
    fn default() -> Self {
        ConstantsPool::new()
    }
}

impl Parse for ConstantsPool {
    fn parse<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        let count = u16::parse(reader)? as usize;
        let mut constants = OffsetVec::new_starting_at(Offset(1));
        while constants.offset_len().0 < count {
            constants.push(Constant::parse(reader)?);
        }
        if constants.offset_len().0 != count {
            return Err(invalid_data("8-byte constant overruns the constant pool"));
        }
        Ok(ConstantsPool::from_parsed(constants))
    }
}

impl Serialize for ConstantsPool {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        (self.constants.offset_len().0 as u16).serialize(writer)?;
        for (_, _, constant) in &self.constants {
            constant.serialize(writer)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ConstantPoolOverflow {
    pub constant: Constant,
    pub offset: usize,
}

/// Constants as in the constant pool
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.4
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// Class or an interface
    Class(Utf8ConstantIndex),

    /// Field
    FieldRef(ClassConstantIndex, NameAndTypeConstantIndex),

    /// Method (this combines `Methodref` and `InterfaceMethodref`
    MethodRef {
        class: ClassConstantIndex,
        name_and_type: NameAndTypeConstantIndex,
        is_interface: bool,
    },

    /// Constant object of type `java.lang.String`
    String(Utf8ConstantIndex),

    /// Constant primitive of type `int`
    Integer(i32),

    /// Constant primitive of type `float`
    ///
    /// Stored as raw bits so that NaN payloads survive.
    Float(u32),

    /// Constant primitive of type `long`
    Long(i64),

    /// Constant primitive of type `double`
    ///
    /// Stored as raw bits so that NaN payloads survive.
    Double(u64),

    /// Name and a type (eg. for a field or a method)
    NameAndType {
        name: Utf8ConstantIndex,
        descriptor: Utf8ConstantIndex,
    },

    /// Constant UTF-8 encoded raw string value
    ///
    /// Despite the name, the encoding is not quite UTF-8 (the encoding of the
    /// null character `\u{0000}` and the encoding of supplementary characters
    /// is different).
    Utf8(String),

    /// Utf8 constant whose bytes don't decode to a Rust string (eg. lone surrogates)
    Utf8Bytes(Vec<u8>),

    /// Constant object of type `java.lang.invoke.MethodHandle`
    MethodHandle {
        handle_kind: HandleKind,

        /// Depending on the method kind, this points to different things:
        ///
        ///   - `FieldRef` for `GetField`, `GetStatic`, `PutField`, `PutStatic`
        ///   - `MethodRef` for the rest
        member: ConstantIndex,
    },

    /// Method type
    MethodType { descriptor: Utf8ConstantIndex },

    /// Dynamically-computed constant
    Dynamic {
        bootstrap_method: u16,
        name_and_type: NameAndTypeConstantIndex,
    },

    /// Dynamically-computed call site
    InvokeDynamic {
        /// Index into the `BootstrapMethods` attribute
        bootstrap_method: u16,
        method_descriptor: NameAndTypeConstantIndex,
    },

    /// Module (only in `module-info` classes)
    Module(Utf8ConstantIndex),

    /// Package (only in `module-info` classes)
    Package(Utf8ConstantIndex),
}

impl Serialize for Constant {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            Constant::Utf8(string) => {
                1u8.serialize(writer)?;
                let buffer: Vec<u8> = encode_modified_utf8(string);
                (buffer.len() as u16).serialize(writer)?;
                writer.write_all(&buffer)?;
            }
            Constant::Utf8Bytes(buffer) => {
                1u8.serialize(writer)?;
                (buffer.len() as u16).serialize(writer)?;
                writer.write_all(buffer)?;
            }
            Constant::Integer(integer) => {
                3u8.serialize(writer)?;
                integer.serialize(writer)?;
            }
            Constant::Float(bits) => {
                4u8.serialize(writer)?;
                bits.serialize(writer)?;
            }
            Constant::Long(long) => {
                5u8.serialize(writer)?;
                long.serialize(writer)?;
            }
            Constant::Double(bits) => {
                6u8.serialize(writer)?;
                writer.write_all(&bits.to_be_bytes())?;
            }
            Constant::Class(name) => {
                7u8.serialize(writer)?;
                name.serialize(writer)?;
            }
            Constant::String(bytes) => {
                8u8.serialize(writer)?;
                bytes.serialize(writer)?;
            }
            Constant::FieldRef(class, name_and_type) => {
                9u8.serialize(writer)?;
                class.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::MethodRef {
                class,
                name_and_type,
                is_interface,
            } => {
                (if !is_interface { 10u8 } else { 11u8 }).serialize(writer)?;
                class.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::NameAndType { name, descriptor } => {
                12u8.serialize(writer)?;
                name.serialize(writer)?;
                descriptor.serialize(writer)?;
            }
            Constant::MethodHandle {
                handle_kind,
                member,
            } => {
                15u8.serialize(writer)?;
                handle_kind.serialize(writer)?;
                member.serialize(writer)?;
            }
            Constant::MethodType { descriptor } => {
                16u8.serialize(writer)?;
                descriptor.serialize(writer)?;
            }
            Constant::Dynamic {
                bootstrap_method,
                name_and_type,
            } => {
                17u8.serialize(writer)?;
                bootstrap_method.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::InvokeDynamic {
                bootstrap_method,
                method_descriptor,
            } => {
                18u8.serialize(writer)?;
                bootstrap_method.serialize(writer)?;
                method_descriptor.serialize(writer)?;
            }
            Constant::Module(name) => {
                19u8.serialize(writer)?;
                name.serialize(writer)?;
            }
            Constant::Package(name) => {
                20u8.serialize(writer)?;
                name.serialize(writer)?;
            }
        };
        Ok(())
    }
}

impl Parse for Constant {
    fn parse<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        let constant = match u8::parse(reader)? {
            1 => {
                let len = u16::parse(reader)? as usize;
                let bytes = parse_bytes(reader, len)?;
                match decode_modified_utf8(&bytes) {
                    Some(string) => Constant::Utf8(string),
                    None => Constant::Utf8Bytes(bytes),
                }
            }
            3 => Constant::Integer(i32::parse(reader)?),
            4 => Constant::Float(u32::parse(reader)?),
            5 => Constant::Long(i64::parse(reader)?),
            6 => Constant::Double(i64::parse(reader)? as u64),
            7 => Constant::Class(Utf8ConstantIndex::parse(reader)?),
            8 => Constant::String(Utf8ConstantIndex::parse(reader)?),
            9 => {
                let class = ClassConstantIndex::parse(reader)?;
                let name_and_type = NameAndTypeConstantIndex(ConstantIndex::parse(reader)?);
                Constant::FieldRef(class, name_and_type)
            }
            tag @ (10 | 11) => Constant::MethodRef {
                class: ClassConstantIndex::parse(reader)?,
                name_and_type: NameAndTypeConstantIndex(ConstantIndex::parse(reader)?),
                is_interface: tag == 11,
            },
            12 => Constant::NameAndType {
                name: Utf8ConstantIndex::parse(reader)?,
                descriptor: Utf8ConstantIndex::parse(reader)?,
            },
            15 => Constant::MethodHandle {
                handle_kind: HandleKind::parse(reader)?,
                member: ConstantIndex::parse(reader)?,
            },
            16 => Constant::MethodType {
                descriptor: Utf8ConstantIndex::parse(reader)?,
            },
            17 => Constant::Dynamic {
                bootstrap_method: u16::parse(reader)?,
                name_and_type: NameAndTypeConstantIndex(ConstantIndex::parse(reader)?),
            },
            18 => Constant::InvokeDynamic {
                bootstrap_method: u16::parse(reader)?,
                method_descriptor: NameAndTypeConstantIndex(ConstantIndex::parse(reader)?),
            },
            19 => Constant::Module(Utf8ConstantIndex::parse(reader)?),
            20 => Constant::Package(Utf8ConstantIndex::parse(reader)?),
            other => return Err(invalid_data(format!("Unknown constant tag {}", other))),
        };
        Ok(constant)
    }
}

/// Modified UTF-8 format used in class files.
///
/// See [this `DataInput` section for details][0]. Quoting from that section:
///
/// > The differences between this format and the standard UTF-8 format are the following:
/// >
/// >  * The null byte `\u0000` is encoded in 2-byte format rather than 1-byte, so that the encoded
/// >    strings never have embedded nulls.
/// >  * Only the 1-byte, 2-byte, and 3-byte formats are used.
/// >  * Supplementary characters are represented in the form of surrogate pairs.
///
/// [0]: https://docs.oracle.com/en/java/javase/17/docs/api/java.base/java/io/DataInput.html#modified-utf-8
pub fn encode_modified_utf8(string: &str) -> Vec<u8> {
    let mut buffer: Vec<u8> = vec![];
    for c in string.chars() {
        // Handle the exception for how `\u{0000}` is represented
        let len: usize = if c == '\u{0000}' { 2 } else { c.len_utf8() };
        let code: u32 = c as u32;

        match len {
            1 => buffer.push(code as u8),
            2 => {
                buffer.push((code >> 6 & 0x1F) as u8 | 0b1100_0000);
                buffer.push((code & 0x3F) as u8 | 0b1000_0000);
            }
            3 => {
                buffer.push((code >> 12 & 0x0F) as u8 | 0b1110_0000);
                buffer.push((code >> 6 & 0x3F) as u8 | 0b1000_0000);
                buffer.push((code & 0x3F) as u8 | 0b1000_0000);
            }

            // Supplementary characters: main divergence from unicode
            _ => {
                buffer.push(0b1110_1101);
                buffer.push(((code >> 16 & 0x0F) as u8).wrapping_sub(1) & 0x0F | 0b1010_0000);
                buffer.push((code >> 10 & 0x3F) as u8 | 0b1000_0000);

                buffer.push(0b1110_1101);
                buffer.push(((code >> 6 & 0x1F) as u8) | 0b1011_0000);
                buffer.push((code & 0x3F) as u8 | 0b1000_0000);
            }
        }
    }
    buffer
}

/// Inverse of [`encode_modified_utf8`]
///
/// Returns `None` for byte sequences that don't re-encode to exactly the same bytes (lone
/// surrogates, overlong forms, stray continuation bytes). Such constants are carried through as
/// raw bytes so they survive a round trip.
pub fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        let b0 = bytes[idx] as u16;
        if b0 & 0x80 == 0 {
            units.push(b0);
            idx += 1;
        } else if b0 & 0xE0 == 0xC0 {
            let b1 = *bytes.get(idx + 1)? as u16;
            units.push(((b0 & 0x1F) << 6) | (b1 & 0x3F));
            idx += 2;
        } else if b0 & 0xF0 == 0xE0 {
            let b1 = *bytes.get(idx + 1)? as u16;
            let b2 = *bytes.get(idx + 2)? as u16;
            units.push(((b0 & 0x0F) << 12) | ((b1 & 0x3F) << 6) | (b2 & 0x3F));
            idx += 3;
        } else {
            return None;
        }
    }
    let decoded = String::from_utf16(&units).ok()?;
    if encode_modified_utf8(&decoded) == bytes {
        Some(decoded)
    } else {
        None
    }
}


/// Almost all constants have width 1, except for `Constant::Long` and `Constant::Double`. Quoting
/// the JVM specification:
///
/// > All 8-byte constants take up two entries in the constant_pool table of the class file. If a
/// > CONSTANT_Long_info or CONSTANT_Double_info structure is the item in the constant_pool table
/// > at index n, then the next usable item in the pool is located at index n+2. The constant_pool
/// > index n+1 must be valid but is considered unusable.
/// >
/// > In retrospect, making 8-byte constants take two constant pool entries was a poor choice.
impl Width for Constant {
    fn width(&self) -> usize {
        match self {
            Constant::Long(_) | Constant::Double(_) => 2,
            _ => 1,
        }
    }
}

#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct ConstantIndex(pub u16);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct Utf8ConstantIndex(pub ConstantIndex);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct StringConstantIndex(pub ConstantIndex);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct NameAndTypeConstantIndex(pub ConstantIndex);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct ClassConstantIndex(pub ConstantIndex);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct FieldRefConstantIndex(pub ConstantIndex);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct MethodRefConstantIndex(pub ConstantIndex);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct InvokeDynamicConstantIndex(pub ConstantIndex);

impl Into<ConstantIndex> for Utf8ConstantIndex {
    fn into(self) -> ConstantIndex {
        self.0
    }
}
impl Into<ConstantIndex> for StringConstantIndex {
    fn into(self) -> ConstantIndex {
        self.0
    }
}
impl Into<ConstantIndex> for NameAndTypeConstantIndex {
    fn into(self) -> ConstantIndex {
        self.0
    }
}
impl Into<ConstantIndex> for ClassConstantIndex {
    fn into(self) -> ConstantIndex {
        self.0
    }
}
impl Into<ConstantIndex> for FieldRefConstantIndex {
    fn into(self) -> ConstantIndex {
        self.0
    }
}
impl Into<ConstantIndex> for MethodRefConstantIndex {
    fn into(self) -> ConstantIndex {
        self.0
    }
}
impl Into<ConstantIndex> for InvokeDynamicConstantIndex {
    fn into(self) -> ConstantIndex {
        self.0
    }
}

impl Serialize for ConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl Parse for ConstantIndex {
    fn parse<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        u16::parse(reader).map(ConstantIndex)
    }
}

impl Parse for Utf8ConstantIndex {
    fn parse<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        ConstantIndex::parse(reader).map(Utf8ConstantIndex)
    }
}

impl Parse for ClassConstantIndex {
    fn parse<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        ConstantIndex::parse(reader).map(ClassConstantIndex)
    }
}
impl Serialize for Utf8ConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}
impl Serialize for StringConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}
impl Serialize for NameAndTypeConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}
impl Serialize for ClassConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}
impl Serialize for FieldRefConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}
impl Serialize for MethodRefConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}
impl Serialize for InvokeDynamicConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

/// Type of method handle
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-5.html#jvms-5.4.3.5-220
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum HandleKind {
    GetField,
    GetStatic,
    PutField,
    PutStatic,
    InvokeVirtual,
    InvokeStatic,
    InvokeSpecial,
    NewInvokeSpecial,
    InvokeInterface,
}

impl Serialize for HandleKind {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        let byte: u8 = match self {
            HandleKind::GetField => 1,
            HandleKind::GetStatic => 2,
            HandleKind::PutField => 3,
            HandleKind::PutStatic => 4,
            HandleKind::InvokeVirtual => 5,
            HandleKind::InvokeStatic => 6,
            HandleKind::InvokeSpecial => 7,
            HandleKind::NewInvokeSpecial => 8,
            HandleKind::InvokeInterface => 9,
        };
        byte.serialize(writer)
    }
}

impl Parse for HandleKind {
    fn parse<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        let kind = match u8::parse(reader)? {
            1 => HandleKind::GetField,
            2 => HandleKind::GetStatic,
            3 => HandleKind::PutField,
            4 => HandleKind::PutStatic,
            5 => HandleKind::InvokeVirtual,
            6 => HandleKind::InvokeStatic,
            7 => HandleKind::InvokeSpecial,
            8 => HandleKind::NewInvokeSpecial,
            9 => HandleKind::InvokeInterface,
            other => return Err(invalid_data(format!("Unknown method handle kind {}", other))),
        };
        Ok(kind)
    }
}

#[cfg(test)]
mod pool_tests {
    use super::*;

    fn parsed_pool() -> ConstantsPool {
        // #1 Utf8 "java/lang/Object", #2 Class #1, #3 Long (two slots), #5 Utf8 "hi", #6 String #5
        let mut bytes = vec![];
        7u16.serialize(&mut bytes).unwrap();
        Constant::Utf8(String::from("java/lang/Object"))
            .serialize(&mut bytes)
            .unwrap();
        Constant::Class(Utf8ConstantIndex(ConstantIndex(1)))
            .serialize(&mut bytes)
            .unwrap();
        Constant::Long(42).serialize(&mut bytes).unwrap();
        Constant::Utf8(String::from("hi"))
            .serialize(&mut bytes)
            .unwrap();
        Constant::String(Utf8ConstantIndex(ConstantIndex(5)))
            .serialize(&mut bytes)
            .unwrap();
        ConstantsPool::parse(&mut bytes.as_slice()).unwrap()
    }

    #[test]
    fn parsed_entries_keep_their_indices() {
        let pool = parsed_pool();
        assert_eq!(pool.offset_len(), 7);
        assert_eq!(
            pool.class_name(ClassConstantIndex(ConstantIndex(2))).unwrap(),
            BinaryName::OBJECT
        );
        assert_eq!(pool.get(ConstantIndex(3)).unwrap(), &Constant::Long(42));
        assert!(matches!(
            pool.get(ConstantIndex(4)),
            Err(Error::MissingConstant(ConstantIndex(4)))
        ));
        assert!(matches!(
            pool.utf8(Utf8ConstantIndex(ConstantIndex(2))),
            Err(Error::UnexpectedConstant { .. })
        ));
    }

    #[test]
    fn lookups_reuse_parsed_entries() {
        let mut pool = parsed_pool();
        let object = pool.get_class(&RefType::Object(BinaryName::OBJECT)).unwrap();
        assert_eq!(object, ClassConstantIndex(ConstantIndex(2)));
        assert_eq!(pool.get_string("hi").unwrap().0, ConstantIndex(6));
        assert_eq!(pool.get_long(42).unwrap(), ConstantIndex(3));

        // New entries go at the end
        let utf8 = pool.get_utf8("fresh").unwrap();
        assert_eq!(utf8.0, ConstantIndex(7));
        assert_eq!(pool.offset_len(), 8);
    }

    #[test]
    fn member_refs_resolve() {
        let mut pool = ConstantsPool::new();
        let desc = MethodDescriptor {
            parameters: vec![FieldType::long()],
            return_type: Some(FieldType::object(BinaryName::LONG)),
        };
        let idx = pool
            .get_method_ref(&BinaryName::LONG, &UnqualifiedName::VALUEOF, &desc, false)
            .unwrap();
        let again = pool
            .get_method_ref(&BinaryName::LONG, &UnqualifiedName::VALUEOF, &desc, false)
            .unwrap();
        assert_eq!(idx, again);

        let resolved = pool.method_ref(idx).unwrap();
        assert_eq!(resolved.owner, RefType::Object(BinaryName::LONG));
        assert_eq!(resolved.name, UnqualifiedName::VALUEOF);
        assert_eq!(resolved.descriptor, desc);
        assert!(!resolved.is_interface);
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let bytes = [0u8, 2, 2, 0, 0];
        assert!(ConstantsPool::parse(&mut &bytes[..]).is_err());
    }
}
