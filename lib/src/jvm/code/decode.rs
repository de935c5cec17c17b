use super::{
    switch_padding, BranchInstruction, Code, CompareMode, EqComparison, Instruction, InvokeType,
    LabelGenerator, LocalVariable, Node, OrdComparison, ShiftType, SynLabel, SynLabelGenerator,
    TryCatch,
};
use crate::jvm::class_file::{
    self, ClassConstantIndex, ConstantIndex, ConstantsPool, FieldRefConstantIndex,
    InvokeDynamicConstantIndex, LineNumberTable, LocalVariableTable, LocalVariableTypeTable,
    MethodRefConstantIndex,
};
use crate::jvm::{BaseType, Error};
use byteorder::{BigEndian, ReadBytesExt};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::Cursor;

/// Instruction decoded from the code array, with jump targets as absolute offsets
enum Decoded {
    Insn(Instruction),
    Branch(BranchInstruction<usize, usize>),
}

/// Decode a `Code` attribute into a list of nodes
///
/// Every offset that something refers to (jump targets, exception table ranges and handlers,
/// local variable scopes) gets a label. Line numbers become [`Node::Line`] markers. The
/// `StackMapTable` and any other offset-bearing attributes are not kept: they are recomputed or
/// dropped when the code is encoded again.
pub fn decode(code: &class_file::Code, constants: &ConstantsPool) -> Result<Code, Error> {
    let bytes: &[u8] = &code.code_array.0;
    let decoded = decode_instructions(bytes)?;

    let mut boundaries: HashSet<usize> = decoded.iter().map(|(offset, _)| *offset).collect();
    boundaries.insert(bytes.len());

    // Collect everything that needs a label
    let mut targets: BTreeSet<usize> = BTreeSet::new();
    for (_, insn) in &decoded {
        if let Decoded::Branch(branch) = insn {
            targets.extend(branch.jump_targets().targets());
        }
    }
    for handler in &code.exception_table {
        targets.insert(handler.start_pc.0 as usize);
        targets.insert(handler.end_pc.0 as usize);
        targets.insert(handler.handler_pc.0 as usize);
    }

    let mut line_numbers: BTreeMap<usize, Vec<u16>> = BTreeMap::new();
    let mut local_variable_entries: Vec<class_file::LocalVariable> = vec![];
    let mut local_variable_type_entries: Vec<class_file::LocalVariable> = vec![];
    for attribute in &code.attributes {
        if attribute.is::<LineNumberTable>(constants) {
            for entry in attribute.decode::<LineNumberTable>()?.0 {
                let start = entry.start_pc.0 as usize;
                if boundaries.contains(&start) {
                    line_numbers.entry(start).or_default().push(entry.line_number);
                } else {
                    log::debug!("Dropping line {} at bad offset {}", entry.line_number, start);
                }
            }
        } else if attribute.is::<LocalVariableTable>(constants) {
            local_variable_entries.extend(attribute.decode::<LocalVariableTable>()?.0);
        } else if attribute.is::<LocalVariableTypeTable>(constants) {
            local_variable_type_entries.extend(attribute.decode::<LocalVariableTypeTable>()?.0);
        } else {
            log::trace!(
                "Dropping code attribute {:?}",
                attribute.name(constants).unwrap_or("<unnamed>")
            );
        }
    }
    for entry in local_variable_entries
        .iter()
        .chain(local_variable_type_entries.iter())
    {
        targets.insert(entry.start_pc.0 as usize);
        targets.insert(entry.start_pc.0 as usize + entry.length as usize);
    }

    // Assign labels in offset order
    let mut label_generator = SynLabelGenerator::new(SynLabel::START);
    let mut labels: HashMap<usize, SynLabel> = HashMap::new();
    for target in targets {
        if !boundaries.contains(&target) {
            return Err(Error::InvalidCodeOffset(target));
        }
        labels.insert(target, label_generator.fresh_label());
    }
    let label_at = |offset: &usize| -> Result<SynLabel, Error> {
        labels
            .get(offset)
            .copied()
            .ok_or(Error::InvalidCodeOffset(*offset))
    };

    // Lay out the nodes
    let mut nodes: Vec<Node> = Vec::with_capacity(decoded.len() + labels.len());
    for (offset, insn) in decoded {
        if let Some(label) = labels.get(&offset) {
            nodes.push(Node::Label(*label));
        }
        if let Some(lines) = line_numbers.get(&offset) {
            nodes.extend(lines.iter().map(|line| Node::Line(*line)));
        }
        nodes.push(match insn {
            Decoded::Insn(insn) => Node::Insn(insn),
            Decoded::Branch(branch) => Node::Branch(branch.map_labels(label_at, label_at)?),
        });
    }
    if let Some(label) = labels.get(&bytes.len()) {
        nodes.push(Node::Label(*label));
    }

    let try_catches = code
        .exception_table
        .iter()
        .map(|handler| {
            Ok(TryCatch {
                start: label_at(&(handler.start_pc.0 as usize))?,
                end: label_at(&(handler.end_pc.0 as usize))?,
                handler: label_at(&(handler.handler_pc.0 as usize))?,
                catch_type: match handler.catch_type {
                    ClassConstantIndex(ConstantIndex(0)) => None,
                    catch_type => Some(catch_type),
                },
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let resolve_local = |entry: &class_file::LocalVariable| -> Result<LocalVariable, Error> {
        let start = entry.start_pc.0 as usize;
        Ok(LocalVariable {
            start: label_at(&start)?,
            end: label_at(&(start + entry.length as usize))?,
            name: entry.name_index,
            descriptor: entry.descriptor_index,
            index: entry.index,
        })
    };
    let local_variables = local_variable_entries
        .iter()
        .map(resolve_local)
        .collect::<Result<_, _>>()?;
    let local_variable_types = local_variable_type_entries
        .iter()
        .map(resolve_local)
        .collect::<Result<_, _>>()?;

    Ok(Code {
        max_stack: code.max_stack,
        max_locals: code.max_locals,
        nodes,
        try_catches,
        local_variables,
        local_variable_types,
        labels: label_generator,
    })
}

/// Decode every instruction in the code array, keyed by offset
fn decode_instructions(bytes: &[u8]) -> Result<Vec<(usize, Decoded)>, Error> {
    let mut cursor = Cursor::new(bytes);
    let mut decoded = vec![];
    while (cursor.position() as usize) < bytes.len() {
        let offset = cursor.position() as usize;
        let insn = decode_instruction(&mut cursor, offset).map_err(|err| match err {
            Error::IoError(_) => Error::MalformedClassFile(format!(
                "Truncated instruction at offset {}",
                offset
            )),
            other => other,
        })?;
        decoded.push((offset, insn));
    }
    Ok(decoded)
}

/// Compute an absolute jump target
fn jump_target(offset: usize, relative: i64) -> Result<usize, Error> {
    let target = offset as i64 + relative;
    usize::try_from(target).map_err(|_| Error::InvalidCodeOffset(offset))
}

fn decode_instruction(cursor: &mut Cursor<&[u8]>, offset: usize) -> Result<Decoded, Error> {
    use Decoded::{Branch, Insn};
    use Instruction::*;

    const ORD_COMPARISONS: [OrdComparison; 6] = [
        OrdComparison::EQ,
        OrdComparison::NE,
        OrdComparison::LT,
        OrdComparison::GE,
        OrdComparison::GT,
        OrdComparison::LE,
    ];

    let opcode = cursor.read_u8()?;
    let constant = |idx: u16| ConstantIndex(idx);

    let decoded = match opcode {
        0x00 => Insn(Nop),
        0x01 => Insn(AConstNull),
        0x02 => Insn(IConstM1),
        0x03 => Insn(IConst0),
        0x04 => Insn(IConst1),
        0x05 => Insn(IConst2),
        0x06 => Insn(IConst3),
        0x07 => Insn(IConst4),
        0x08 => Insn(IConst5),
        0x09 => Insn(LConst0),
        0x0a => Insn(LConst1),
        0x0b => Insn(FConst0),
        0x0c => Insn(FConst1),
        0x0d => Insn(FConst2),
        0x0e => Insn(DConst0),
        0x0f => Insn(DConst1),
        0x10 => Insn(BiPush(cursor.read_i8()?)),
        0x11 => Insn(SiPush(cursor.read_i16::<BigEndian>()?)),
        0x12 => Insn(Ldc(constant(cursor.read_u8()? as u16))),
        0x13 => Insn(Ldc(constant(cursor.read_u16::<BigEndian>()?))),
        0x14 => Insn(Ldc2(constant(cursor.read_u16::<BigEndian>()?))),
        0x15..=0x19 => Insn(load(opcode - 0x15, cursor.read_u8()? as u16)),
        0x1a..=0x2d => Insn(load((opcode - 0x1a) / 4, ((opcode - 0x1a) % 4) as u16)),
        0x2e => Insn(IALoad),
        0x2f => Insn(LALoad),
        0x30 => Insn(FALoad),
        0x31 => Insn(DALoad),
        0x32 => Insn(AALoad),
        0x33 => Insn(BALoad),
        0x34 => Insn(CALoad),
        0x35 => Insn(SALoad),
        0x36..=0x3a => Insn(store(opcode - 0x36, cursor.read_u8()? as u16)),
        0x3b..=0x4e => Insn(store((opcode - 0x3b) / 4, ((opcode - 0x3b) % 4) as u16)),
        0x4f => Insn(IAStore),
        0x50 => Insn(LAStore),
        0x51 => Insn(FAStore),
        0x52 => Insn(DAStore),
        0x53 => Insn(AAStore),
        0x54 => Insn(BAStore),
        0x55 => Insn(CAStore),
        0x56 => Insn(SAStore),
        0x57 => Insn(Pop),
        0x58 => Insn(Pop2),
        0x59 => Insn(Dup),
        0x5a => Insn(DupX1),
        0x5b => Insn(DupX2),
        0x5c => Insn(Dup2),
        0x5d => Insn(Dup2X1),
        0x5e => Insn(Dup2X2),
        0x5f => Insn(Swap),
        0x60..=0x77 => {
            const ARITHMETIC: [Instruction; 24] = [
                IAdd, LAdd, FAdd, DAdd, ISub, LSub, FSub, DSub, IMul, LMul, FMul, DMul, IDiv,
                LDiv, FDiv, DDiv, IRem, LRem, FRem, DRem, INeg, LNeg, FNeg, DNeg,
            ];
            Insn(ARITHMETIC[(opcode - 0x60) as usize].clone())
        }
        0x78 => Insn(ISh(ShiftType::Left)),
        0x79 => Insn(LSh(ShiftType::Left)),
        0x7a => Insn(ISh(ShiftType::ArithmeticRight)),
        0x7b => Insn(LSh(ShiftType::ArithmeticRight)),
        0x7c => Insn(ISh(ShiftType::LogicalRight)),
        0x7d => Insn(LSh(ShiftType::LogicalRight)),
        0x7e => Insn(IAnd),
        0x7f => Insn(LAnd),
        0x80 => Insn(IOr),
        0x81 => Insn(LOr),
        0x82 => Insn(IXor),
        0x83 => Insn(LXor),
        0x84 => Insn(IInc(cursor.read_u8()? as u16, cursor.read_i8()? as i16)),
        0x85..=0x93 => {
            const CONVERSIONS: [Instruction; 15] = [
                I2L, I2F, I2D, L2I, L2F, L2D, F2I, F2L, F2D, D2I, D2L, D2F, I2B, I2C, I2S,
            ];
            Insn(CONVERSIONS[(opcode - 0x85) as usize].clone())
        }
        0x94 => Insn(LCmp),
        0x95 => Insn(FCmp(CompareMode::L)),
        0x96 => Insn(FCmp(CompareMode::G)),
        0x97 => Insn(DCmp(CompareMode::L)),
        0x98 => Insn(DCmp(CompareMode::G)),
        0x99..=0x9e => {
            let target = jump_target(offset, cursor.read_i16::<BigEndian>()? as i64)?;
            Branch(BranchInstruction::If(
                ORD_COMPARISONS[(opcode - 0x99) as usize],
                target,
            ))
        }
        0x9f..=0xa4 => {
            let target = jump_target(offset, cursor.read_i16::<BigEndian>()? as i64)?;
            Branch(BranchInstruction::IfICmp(
                ORD_COMPARISONS[(opcode - 0x9f) as usize],
                target,
            ))
        }
        0xa5 | 0xa6 => {
            let target = jump_target(offset, cursor.read_i16::<BigEndian>()? as i64)?;
            let comparison = if opcode == 0xa5 {
                EqComparison::EQ
            } else {
                EqComparison::NE
            };
            Branch(BranchInstruction::IfACmp(comparison, target))
        }
        0xa7 => {
            let target = jump_target(offset, cursor.read_i16::<BigEndian>()? as i64)?;
            Branch(BranchInstruction::Goto(target))
        }
        0xaa => {
            for _ in 0..switch_padding(offset) {
                cursor.read_u8()?;
            }
            let default = jump_target(offset, cursor.read_i32::<BigEndian>()? as i64)?;
            let low = cursor.read_i32::<BigEndian>()?;
            let high = cursor.read_i32::<BigEndian>()?;
            if high < low {
                return Err(Error::MalformedClassFile(format!(
                    "tableswitch at {} has low {} above high {}",
                    offset, low, high
                )));
            }
            let mut targets = vec![];
            for _ in low..=high {
                targets.push(jump_target(offset, cursor.read_i32::<BigEndian>()? as i64)?);
            }
            Branch(BranchInstruction::TableSwitch {
                padding: switch_padding(offset),
                default,
                low,
                targets,
            })
        }
        0xab => {
            for _ in 0..switch_padding(offset) {
                cursor.read_u8()?;
            }
            let default = jump_target(offset, cursor.read_i32::<BigEndian>()? as i64)?;
            let pairs = cursor.read_i32::<BigEndian>()?;
            if pairs < 0 {
                return Err(Error::MalformedClassFile(format!(
                    "lookupswitch at {} has {} pairs",
                    offset, pairs
                )));
            }
            let mut targets = vec![];
            for _ in 0..pairs {
                let key = cursor.read_i32::<BigEndian>()?;
                let target = jump_target(offset, cursor.read_i32::<BigEndian>()? as i64)?;
                targets.push((key, target));
            }
            Branch(BranchInstruction::LookupSwitch {
                padding: switch_padding(offset),
                default,
                targets,
            })
        }
        0xac => Branch(BranchInstruction::IReturn),
        0xad => Branch(BranchInstruction::LReturn),
        0xae => Branch(BranchInstruction::FReturn),
        0xaf => Branch(BranchInstruction::DReturn),
        0xb0 => Branch(BranchInstruction::AReturn),
        0xb1 => Branch(BranchInstruction::Return),
        0xb2 => Insn(GetStatic(FieldRefConstantIndex(constant(
            cursor.read_u16::<BigEndian>()?,
        )))),
        0xb3 => Insn(PutStatic(FieldRefConstantIndex(constant(
            cursor.read_u16::<BigEndian>()?,
        )))),
        0xb4 => Insn(GetField(FieldRefConstantIndex(constant(
            cursor.read_u16::<BigEndian>()?,
        )))),
        0xb5 => Insn(PutField(FieldRefConstantIndex(constant(
            cursor.read_u16::<BigEndian>()?,
        )))),
        0xb6..=0xb8 => {
            let invoke_type = match opcode {
                0xb6 => InvokeType::Virtual,
                0xb7 => InvokeType::Special,
                _ => InvokeType::Static,
            };
            let method = MethodRefConstantIndex(constant(cursor.read_u16::<BigEndian>()?));
            Insn(Invoke(invoke_type, method))
        }
        0xb9 => {
            let method = MethodRefConstantIndex(constant(cursor.read_u16::<BigEndian>()?));
            let count = cursor.read_u8()?;
            let _zero = cursor.read_u8()?;
            Insn(Invoke(InvokeType::Interface(count), method))
        }
        0xba => {
            let call_site = InvokeDynamicConstantIndex(constant(cursor.read_u16::<BigEndian>()?));
            let _zero = cursor.read_u16::<BigEndian>()?;
            Insn(InvokeDynamic(call_site))
        }
        0xbb => Insn(New(ClassConstantIndex(constant(
            cursor.read_u16::<BigEndian>()?,
        )))),
        0xbc => {
            let base_type = match cursor.read_u8()? {
                4 => BaseType::Boolean,
                5 => BaseType::Char,
                6 => BaseType::Float,
                7 => BaseType::Double,
                8 => BaseType::Byte,
                9 => BaseType::Short,
                10 => BaseType::Int,
                11 => BaseType::Long,
                other => {
                    return Err(Error::MalformedClassFile(format!(
                        "newarray at {} has bad type {}",
                        offset, other
                    )))
                }
            };
            Insn(NewArray(base_type))
        }
        0xbd => Insn(ANewArray(ClassConstantIndex(constant(
            cursor.read_u16::<BigEndian>()?,
        )))),
        0xbe => Insn(ArrayLength),
        0xbf => Branch(BranchInstruction::AThrow),
        0xc0 => Insn(CheckCast(ClassConstantIndex(constant(
            cursor.read_u16::<BigEndian>()?,
        )))),
        0xc1 => Insn(InstanceOf(ClassConstantIndex(constant(
            cursor.read_u16::<BigEndian>()?,
        )))),
        0xc2 => Insn(MonitorEnter),
        0xc3 => Insn(MonitorExit),
        0xc4 => {
            let modified = cursor.read_u8()?;
            match modified {
                0x15..=0x19 => Insn(load(modified - 0x15, cursor.read_u16::<BigEndian>()?)),
                0x36..=0x3a => Insn(store(modified - 0x36, cursor.read_u16::<BigEndian>()?)),
                0x84 => Insn(IInc(
                    cursor.read_u16::<BigEndian>()?,
                    cursor.read_i16::<BigEndian>()?,
                )),
                0xa9 => {
                    return Err(Error::UnsupportedOpcode {
                        opcode: modified,
                        offset,
                    })
                }
                _ => {
                    return Err(Error::InvalidOpcode {
                        opcode: modified,
                        offset,
                    })
                }
            }
        }
        0xc5 => {
            let class = ClassConstantIndex(constant(cursor.read_u16::<BigEndian>()?));
            Insn(MultiANewArray(class, cursor.read_u8()?))
        }
        0xc6 | 0xc7 => {
            let target = jump_target(offset, cursor.read_i16::<BigEndian>()? as i64)?;
            let comparison = if opcode == 0xc6 {
                EqComparison::EQ
            } else {
                EqComparison::NE
            };
            Branch(BranchInstruction::IfNull(comparison, target))
        }
        0xc8 => {
            let target = jump_target(offset, cursor.read_i32::<BigEndian>()? as i64)?;
            Branch(BranchInstruction::GotoW(target))
        }

        // Subroutines predate stack map frames and are not worth supporting
        0xa8 | 0xa9 | 0xc9 => return Err(Error::UnsupportedOpcode { opcode, offset }),

        _ => return Err(Error::InvalidOpcode { opcode, offset }),
    };

    Ok(decoded)
}

/// Load instruction, where `kind` counts from `iload` in opcode order
fn load(kind: u8, index: u16) -> Instruction {
    match kind {
        0 => Instruction::ILoad(index),
        1 => Instruction::LLoad(index),
        2 => Instruction::FLoad(index),
        3 => Instruction::DLoad(index),
        _ => Instruction::ALoad(index),
    }
}

/// Store instruction, where `kind` counts from `istore` in opcode order
fn store(kind: u8, index: u16) -> Instruction {
    match kind {
        0 => Instruction::IStore(index),
        1 => Instruction::LStore(index),
        2 => Instruction::FStore(index),
        3 => Instruction::DStore(index),
        _ => Instruction::AStore(index),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_file::{BytecodeArray, BytecodeIndex, ExceptionHandler};

    fn code(bytes: Vec<u8>, exception_table: Vec<ExceptionHandler>) -> class_file::Code {
        class_file::Code {
            max_stack: 2,
            max_locals: 2,
            code_array: BytecodeArray(bytes),
            exception_table,
            attributes: vec![],
        }
    }

    #[test]
    fn straight_line() {
        let constants = ConstantsPool::new();
        let decoded = decode(
            &code(vec![0x1b, 0x15, 0x05, 0x60, 0xc4, 0x84, 0x01, 0x00, 0x01, 0x00, 0xac], vec![]),
            &constants,
        )
        .unwrap();
        assert_eq!(
            decoded.nodes,
            vec![
                Node::Insn(Instruction::ILoad(1)),
                Node::Insn(Instruction::ILoad(5)),
                Node::Insn(Instruction::IAdd),
                Node::Insn(Instruction::IInc(256, 256)),
                Node::Branch(BranchInstruction::IReturn),
            ]
        );
    }

    #[test]
    fn jumps_get_labels() {
        // 0: iload_0; 1: ifeq +5; 4: iconst_1; 5: ireturn; 6: iconst_0; 7: ireturn
        let constants = ConstantsPool::new();
        let decoded = decode(
            &code(vec![0x1a, 0x99, 0x00, 0x05, 0x04, 0xac, 0x03, 0xac], vec![]),
            &constants,
        )
        .unwrap();
        let target = match &decoded.nodes[1] {
            Node::Branch(BranchInstruction::If(OrdComparison::EQ, target)) => *target,
            other => panic!("unexpected node {:?}", other),
        };
        assert_eq!(decoded.nodes[4], Node::Label(target));
        assert_eq!(decoded.nodes[5], Node::Insn(Instruction::IConst0));
    }

    #[test]
    fn exception_ranges_get_labels() {
        // 0: aload_0; 1: monitorexit; 2: return; 3: astore_1; 4: aload_1; 5: athrow
        let constants = ConstantsPool::new();
        let handler = ExceptionHandler {
            start_pc: BytecodeIndex(0),
            end_pc: BytecodeIndex(2),
            handler_pc: BytecodeIndex(3),
            catch_type: ClassConstantIndex(ConstantIndex(0)),
        };
        let decoded = decode(
            &code(vec![0x2a, 0xc3, 0xb1, 0x4c, 0x2b, 0xbf], vec![handler]),
            &constants,
        )
        .unwrap();
        assert_eq!(decoded.try_catches.len(), 1);
        let try_catch = &decoded.try_catches[0];
        assert_eq!(try_catch.catch_type, None);
        let positions = decoded.label_positions();
        assert!(positions[&try_catch.start] < positions[&try_catch.end]);
        assert_eq!(
            decoded.nodes[positions[&try_catch.handler] + 1],
            Node::Insn(Instruction::AStore(1))
        );
    }

    #[test]
    fn subroutines_are_unsupported() {
        let constants = ConstantsPool::new();
        let result = decode(&code(vec![0xa8, 0x00, 0x03, 0xb1], vec![]), &constants);
        assert!(matches!(
            result,
            Err(Error::UnsupportedOpcode {
                opcode: 0xa8,
                offset: 0
            })
        ));
    }

    #[test]
    fn jump_into_instruction_is_rejected() {
        let constants = ConstantsPool::new();
        let result = decode(&code(vec![0xa7, 0x00, 0x01, 0xb1], vec![]), &constants);
        assert!(matches!(result, Err(Error::InvalidCodeOffset(1))));
    }
}
