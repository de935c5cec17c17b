//! Turn a rewritten method body back into a `Code` attribute
//!
//! Encoding goes through a fixed pipeline:
//!
//!   1. analyze the body (which also verifies it)
//!   2. drop unreachable instructions, since there would be no frame to give them
//!   3. widen jumps that no longer fit in 16 bits (see [`jump_encoding`])
//!   4. lay out and serialize the instructions, resolving labels into relative offsets
//!   5. rebuild the exception table and the debug tables from labels
//!   6. regenerate the `StackMapTable` from the analysis
//!
//! Any attribute of the original `Code` which refers to bytecode offsets and isn't rebuilt here
//! would be stale, so it is dropped.

use crate::jvm::class_file::{
    self, BytecodeArray, BytecodeIndex, ClassConstantIndex, ConstantIndex, ConstantsPool,
    ExceptionHandler, LineNumber, LineNumberTable, LocalVariableTable, LocalVariableTypeTable,
    Serialize, StackMapTable, Version,
};
use crate::jvm::code::{jump_encoding, Code, LocalVariable, Node, SynLabel};
use crate::jvm::verifier::{analyze, Analysis, Frame, MethodContext, VerifierFrame};
use crate::jvm::Error;
use crate::util::Offset;
use std::collections::{BTreeMap, HashMap};

/// Largest permitted length of a code array
pub const MAX_CODE_LENGTH: usize = u16::MAX as usize;

/// Remove unreachable instructions (labels and line markers are kept)
///
/// Returns the number of instructions removed.
pub fn remove_unreachable(code: &mut Code, analysis: &Analysis) -> usize {
    let before = code.nodes.len();
    let nodes = std::mem::take(&mut code.nodes);
    code.nodes = nodes
        .into_iter()
        .enumerate()
        .filter(|(idx, node)| !node.is_instruction() || analysis.is_reachable(*idx))
        .map(|(_, node)| node)
        .collect();
    before - code.nodes.len()
}

/// Encode a method body
///
/// The result is verified in the process: a body which doesn't type-check is an error.
pub fn encode(
    mut code: Code,
    context: &MethodContext,
    constants: &mut ConstantsPool,
    version: Version,
) -> Result<class_file::Code, Error> {
    let mut analysis = analyze(&code, context, constants)?;

    let removed = remove_unreachable(&mut code, &analysis);
    if removed > 0 {
        log::debug!("Removed {} unreachable instructions", removed);
        analysis = analyze(&code, context, constants)?;
    }

    let mut widened = false;
    while jump_encoding::widen_oversized_jumps(
        &mut code.nodes,
        &mut code.labels,
        &jump_encoding::SIGNED_16BIT_JUMP_RANGE,
    ) {
        widened = true;
    }
    if widened {
        analysis = analyze(&code, context, constants)?;
    }

    let layout = jump_encoding::layout(&mut code.nodes);
    if layout.len() > MAX_CODE_LENGTH {
        return Err(Error::MethodCodeOverflow(Offset(layout.len())));
    }
    let label_offset = |label: &SynLabel| -> Result<usize, Error> {
        layout
            .labels
            .get(label)
            .copied()
            .ok_or(Error::UnplacedLabel(*label))
    };

    // Serialize the instructions
    let mut code_array = BytecodeArray(Vec::with_capacity(layout.len()));
    for (idx, node) in code.nodes.iter().enumerate() {
        let offset = layout.offsets[idx] as i64;
        match node {
            Node::Label(_) | Node::Line(_) => (),
            Node::Insn(insn) => insn.serialize(&mut code_array.0)?,
            Node::Branch(branch) => {
                let relative = |label: &SynLabel| -> Result<i64, Error> {
                    Ok(label_offset(label)? as i64 - offset)
                };
                let encoded = branch.map_labels(
                    |lbl| {
                        let relative = relative(lbl)?;
                        i16::try_from(relative)
                            .map_err(|_| Error::MethodCodeOverflow(Offset(relative.unsigned_abs() as usize)))
                    },
                    |lbl| {
                        let relative = relative(lbl)?;
                        i32::try_from(relative)
                            .map_err(|_| Error::MethodCodeOverflow(Offset(relative.unsigned_abs() as usize)))
                    },
                )?;
                encoded.serialize(&mut code_array.0)?;
            }
        }
    }

    // Exception table (empty ranges are not allowed)
    let mut exception_table = vec![];
    for try_catch in &code.try_catches {
        let start = label_offset(&try_catch.start)?;
        let end = label_offset(&try_catch.end)?;
        if start >= end {
            log::trace!("Dropping empty exception range {:?}", try_catch);
            continue;
        }
        exception_table.push(ExceptionHandler {
            start_pc: BytecodeIndex(start as u16),
            end_pc: BytecodeIndex(end as u16),
            handler_pc: BytecodeIndex(label_offset(&try_catch.handler)? as u16),
            catch_type: try_catch
                .catch_type
                .unwrap_or(ClassConstantIndex(ConstantIndex(0))),
        });
    }

    let mut attributes = vec![];

    let line_numbers: Vec<LineNumber> = code
        .nodes
        .iter()
        .enumerate()
        .filter_map(|(idx, node)| match node {
            Node::Line(line) if layout.offsets[idx] < layout.len() => Some(LineNumber {
                start_pc: BytecodeIndex(layout.offsets[idx] as u16),
                line_number: *line,
            }),
            _ => None,
        })
        .collect();
    if !line_numbers.is_empty() {
        attributes.push(constants.get_attribute(LineNumberTable(line_numbers))?);
    }

    let local_variables = encode_local_variables(&code.local_variables, &label_offset)?;
    if !local_variables.is_empty() {
        attributes.push(constants.get_attribute(LocalVariableTable(local_variables))?);
    }
    let local_variable_types = encode_local_variables(&code.local_variable_types, &label_offset)?;
    if !local_variable_types.is_empty() {
        attributes.push(constants.get_attribute(LocalVariableTypeTable(local_variable_types))?);
    }

    if version.uses_stack_map_frames() {
        if let Some(stack_map_table) = stack_map_table(&code, &analysis, &layout, context, constants)? {
            attributes.push(constants.get_attribute(stack_map_table)?);
        }
    }

    let max_stack = analysis.max_stack.max(code.max_stack as usize);
    let max_stack = u16::try_from(max_stack).map_err(|_| Error::MethodCodeMaxStackOverflow(max_stack))?;
    let max_locals = analysis.max_locals.max(code.max_locals as usize);
    let max_locals =
        u16::try_from(max_locals).map_err(|_| Error::MethodCodeMaxLocalsOverflow(max_locals))?;

    Ok(class_file::Code {
        max_stack,
        max_locals,
        code_array,
        exception_table,
        attributes,
    })
}

fn encode_local_variables(
    local_variables: &[LocalVariable],
    label_offset: &impl Fn(&SynLabel) -> Result<usize, Error>,
) -> Result<Vec<class_file::LocalVariable>, Error> {
    let mut encoded = vec![];
    for local_variable in local_variables {
        let start = label_offset(&local_variable.start)?;
        let end = label_offset(&local_variable.end)?;
        if end < start {
            continue;
        }
        encoded.push(class_file::LocalVariable {
            start_pc: BytecodeIndex(start as u16),
            length: (end - start) as u16,
            name_index: local_variable.name,
            descriptor_index: local_variable.descriptor,
            index: local_variable.index,
        });
    }
    Ok(encoded)
}

/// Compute the stack map table, with one frame for every jump target and handler start
fn stack_map_table(
    code: &Code,
    analysis: &Analysis,
    layout: &jump_encoding::Layout,
    context: &MethodContext,
    constants: &mut ConstantsPool,
) -> Result<Option<StackMapTable>, Error> {
    let label_nodes: HashMap<SynLabel, usize> = code.label_positions();

    let mut targets: Vec<SynLabel> = code
        .try_catches
        .iter()
        .filter(|try_catch| {
            matches!(
                (layout.labels.get(&try_catch.start), layout.labels.get(&try_catch.end)),
                (Some(start), Some(end)) if start < end
            )
        })
        .map(|try_catch| try_catch.handler)
        .collect();
    for node in &code.nodes {
        if let Node::Branch(branch) = node {
            targets.extend(branch.jump_targets().targets().iter().copied());
        }
    }

    // The frame of a label is the frame at the instruction it precedes, since several labels
    // can share an offset
    let mut frame_nodes: BTreeMap<usize, usize> = BTreeMap::new();
    for target in targets {
        let label_node = *label_nodes.get(&target).ok_or(Error::UnplacedLabel(target))?;
        let insn_node = (label_node..code.nodes.len())
            .find(|idx| code.nodes[*idx].is_instruction())
            .ok_or(Error::InvalidCodeOffset(layout.len()))?;
        frame_nodes.insert(layout.offsets[insn_node], insn_node);
    }
    if frame_nodes.is_empty() {
        return Ok(None);
    }

    let node_offset = |node: usize| layout.offsets.get(node).map(|offset| *offset as u16);
    let mut previous_frame: Frame<ClassConstantIndex, u16> =
        VerifierFrame::method_entry(context).into_serializable(constants, node_offset)?;
    let mut previous_offset: Option<usize> = None;
    let mut stack_map_frames = vec![];
    for (offset, node) in frame_nodes {
        let frame = analysis
            .frame(node)
            .ok_or(Error::InvalidCodeOffset(offset))?
            .into_serializable(constants, node_offset)?;
        let offset_delta = match previous_offset {
            None => offset,
            Some(previous_offset) => offset - previous_offset - 1,
        };
        stack_map_frames.push(frame.stack_map_frame(offset_delta as u16, &previous_frame));
        previous_frame = frame;
        previous_offset = Some(offset);
    }

    Ok(Some(StackMapTable(stack_map_frames)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::{
        BranchInstruction, Instruction, OrdComparison, SynLabelGenerator, TryCatch,
    };
    use crate::jvm::hierarchy::KnownClasses;
    use crate::jvm::{BinaryName, FieldType, MethodDescriptor, Name};

    fn context(hierarchy: &KnownClasses) -> MethodContext<'_> {
        MethodContext {
            this_class: BinaryName::from_string(String::from("app/Main")).unwrap(),
            descriptor: MethodDescriptor {
                parameters: vec![FieldType::int()],
                return_type: Some(FieldType::int()),
            },
            is_static: true,
            is_constructor: false,
            hierarchy,
        }
    }

    fn empty_code() -> Code {
        Code {
            max_stack: 0,
            max_locals: 0,
            nodes: vec![],
            try_catches: vec![],
            local_variables: vec![],
            local_variable_types: vec![],
            labels: SynLabelGenerator::default(),
        }
    }

    #[test]
    fn conditional_with_frames() {
        let hierarchy = KnownClasses::with_java_lang();
        let context = context(&hierarchy);
        let mut constants = ConstantsPool::new();
        let mut code = empty_code();
        let else_label = code.fresh_label();
        code.nodes = vec![
            Node::Line(10),
            Node::Insn(Instruction::ILoad(0)),
            Node::Branch(BranchInstruction::If(OrdComparison::EQ, else_label)),
            Node::Line(11),
            Node::Insn(Instruction::IConst1),
            Node::Branch(BranchInstruction::IReturn),
            Node::Insn(Instruction::Nop),
            Node::Label(else_label),
            Node::Insn(Instruction::IConst2),
            Node::Branch(BranchInstruction::IReturn),
        ];

        let encoded = encode(code, &context, &mut constants, Version::JAVA8).unwrap();

        // The unreachable `nop` is gone
        assert_eq!(
            encoded.code_array.0,
            vec![0x1a, 0x99, 0x00, 0x05, 0x04, 0xac, 0x05, 0xac]
        );
        assert_eq!(encoded.max_stack, 1);
        assert_eq!(encoded.max_locals, 1);

        let mut names: Vec<&str> = encoded
            .attributes
            .iter()
            .filter_map(|attribute| attribute.name(&constants))
            .collect();
        names.sort_unstable();
        assert_eq!(names, vec!["LineNumberTable", "StackMapTable"]);

        // Old class files get no stack map table
        let mut code = empty_code();
        code.nodes = vec![
            Node::Insn(Instruction::ILoad(0)),
            Node::Branch(BranchInstruction::IReturn),
        ];
        let encoded = encode(code, &context, &mut constants, Version::JAVA5).unwrap();
        assert!(encoded.attributes.is_empty());
    }

    #[test]
    fn handler_frames_and_exception_table() {
        let hierarchy = KnownClasses::with_java_lang();
        let context = context(&hierarchy);
        let mut constants = ConstantsPool::new();
        let mut code = empty_code();
        let start = code.fresh_label();
        let end = code.fresh_label();
        let handler = code.fresh_label();
        let empty = code.fresh_label();
        code.nodes = vec![
            Node::Label(start),
            Node::Label(empty),
            Node::Insn(Instruction::ILoad(0)),
            Node::Label(end),
            Node::Branch(BranchInstruction::IReturn),
            Node::Label(handler),
            Node::Insn(Instruction::Pop),
            Node::Insn(Instruction::IConst0),
            Node::Branch(BranchInstruction::IReturn),
        ];
        code.try_catches = vec![
            TryCatch {
                start,
                end,
                handler,
                catch_type: None,
            },
            TryCatch {
                start: empty,
                end: empty,
                handler,
                catch_type: None,
            },
        ];

        let encoded = encode(code, &context, &mut constants, Version::JAVA8).unwrap();
        assert_eq!(encoded.exception_table.len(), 1);
        let entry = &encoded.exception_table[0];
        assert_eq!(
            (entry.start_pc.0, entry.end_pc.0, entry.handler_pc.0),
            (0, 1, 2)
        );
        assert_eq!(entry.catch_type.0 .0, 0);

        let table = encoded
            .attributes
            .iter()
            .find(|attribute| attribute.is::<StackMapTable>(&constants))
            .unwrap();

        // `same_locals_1_stack_item_frame` at offset 2 with a `Throwable`
        assert_eq!(table.info[0..3], [0x00, 0x01, 64 + 2]);
        assert_eq!(table.info[3], 7);
    }

    #[test]
    fn frames_at_the_same_offset_are_merged() {
        let hierarchy = KnownClasses::with_java_lang();
        let context = context(&hierarchy);
        let mut constants = ConstantsPool::new();
        let mut code = empty_code();
        let first = code.fresh_label();
        let second = code.fresh_label();
        code.nodes = vec![
            Node::Insn(Instruction::ILoad(0)),
            Node::Branch(BranchInstruction::If(OrdComparison::EQ, first)),
            Node::Insn(Instruction::ILoad(0)),
            Node::Branch(BranchInstruction::If(OrdComparison::NE, second)),
            Node::Label(first),
            Node::Label(second),
            Node::Insn(Instruction::IConst0),
            Node::Branch(BranchInstruction::IReturn),
        ];

        let encoded = encode(code, &context, &mut constants, Version::JAVA8).unwrap();
        let table = encoded
            .attributes
            .iter()
            .find(|attribute| attribute.is::<StackMapTable>(&constants))
            .unwrap();

        // One frame (count is 1), a `same_frame` at offset 8
        assert_eq!(table.info, vec![0x00, 0x01, 8]);
    }

    #[test]
    fn ill_typed_code_is_rejected() {
        let hierarchy = KnownClasses::with_java_lang();
        let context = context(&hierarchy);
        let mut constants = ConstantsPool::new();
        let mut code = empty_code();
        code.nodes = vec![
            Node::Insn(Instruction::FConst0),
            Node::Branch(BranchInstruction::IReturn),
        ];

        assert!(matches!(
            encode(code, &context, &mut constants, Version::JAVA8),
            Err(Error::VerifierError { node: 1, .. })
        ));
    }
}
