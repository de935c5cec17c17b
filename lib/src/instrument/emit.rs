use crate::jvm::class_file::{ConstantsPool, Version};
use crate::jvm::code::{
    BranchInstruction, Instruction, InvokeType, LabelGenerator, Node, SynLabel, SynLabelGenerator,
};
use crate::jvm::{
    BaseType, BinaryName, Error, FieldType, MethodDescriptor, RefType, UnqualifiedName,
};
use std::borrow::Cow;

/// Builder for a chunk of injected code
///
/// The chunk is a plain list of nodes which the caller splices into the method body. Constants
/// are added to the class' pool as the code is built, and labels come from the method's own
/// generator so they never collide with labels already in the body.
pub struct Emitter<'a> {
    pub constants: &'a mut ConstantsPool,
    labels: &'a mut SynLabelGenerator,
    version: Version,
    nodes: Vec<Node>,
}

impl<'a> Emitter<'a> {
    pub fn new(
        constants: &'a mut ConstantsPool,
        labels: &'a mut SynLabelGenerator,
        version: Version,
    ) -> Emitter<'a> {
        Emitter {
            constants,
            labels,
            version,
            nodes: vec![],
        }
    }

    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes
    }

    pub fn fresh_label(&mut self) -> SynLabel {
        self.labels.fresh_label()
    }

    pub fn place_label(&mut self, label: SynLabel) {
        self.nodes.push(Node::Label(label));
    }

    pub fn push_instruction(&mut self, insn: Instruction) {
        self.nodes.push(Node::Insn(insn));
    }

    pub fn push_branch_instruction(&mut self, insn: BranchInstruction<SynLabel, SynLabel>) {
        self.nodes.push(Node::Branch(insn));
    }

    /// Push an integer constant onto the stack
    pub fn const_int(&mut self, integer: i32) -> Result<(), Error> {
        let insn = match integer {
            -1 => Instruction::IConstM1,
            0 => Instruction::IConst0,
            1 => Instruction::IConst1,
            2 => Instruction::IConst2,
            3 => Instruction::IConst3,
            4 => Instruction::IConst4,
            5 => Instruction::IConst5,
            -128..=127 => Instruction::BiPush(integer as i8),
            -32768..=32767 => Instruction::SiPush(integer as i16),
            _ => Instruction::Ldc(self.constants.get_integer(integer)?),
        };
        self.push_instruction(insn);
        Ok(())
    }

    /// Push a long constant onto the stack
    ///
    /// Small values use `int` instructions followed by a conversion, which keeps them out of the
    /// constant pool.
    pub fn const_long(&mut self, long: i64) -> Result<(), Error> {
        let (insn, needs_int_to_long_conversion) = match long {
            -1 => (Instruction::IConstM1, true),
            0 => (Instruction::LConst0, false),
            1 => (Instruction::LConst1, false),
            2 => (Instruction::IConst2, true),
            3 => (Instruction::IConst3, true),
            4 => (Instruction::IConst4, true),
            5 => (Instruction::IConst5, true),
            -128..=127 => (Instruction::BiPush(long as i8), true),
            -32768..=32767 => (Instruction::SiPush(long as i16), true),
            _ => (Instruction::Ldc2(self.constants.get_long(long)?), false),
        };
        self.push_instruction(insn);
        if needs_int_to_long_conversion {
            self.push_instruction(Instruction::I2L);
        }
        Ok(())
    }

    /// Push a constant string to the stack
    pub fn const_string<'s>(&mut self, string: impl Into<Cow<'s, str>>) -> Result<(), Error> {
        let index = self.constants.get_string(string)?;
        self.push_instruction(Instruction::Ldc(index.0));
        Ok(())
    }

    /// Push a value of type `java/lang/Class` onto the stack
    ///
    /// Before Java 5, `ldc` can't load classes, so this goes through `Class.forName`.
    pub fn const_class(&mut self, ref_type: &RefType<BinaryName>) -> Result<(), Error> {
        if self.version.supports_class_literals() {
            let index = self.constants.get_class(ref_type)?;
            self.push_instruction(Instruction::Ldc(index.0));
        } else {
            self.const_string(ref_type.class_constant_name().replace('/', "."))?;
            let for_name = MethodDescriptor {
                parameters: vec![FieldType::object(BinaryName::STRING)],
                return_type: Some(FieldType::object(BinaryName::CLASS)),
            };
            self.invoke_static(&BinaryName::CLASS, &UnqualifiedName::FORNAME, &for_name)?;
        }
        Ok(())
    }

    /// Get a local at a particular offset
    pub fn get_local(&mut self, offset: u16, field_type: &FieldType<BinaryName>) {
        let insn = match field_type {
            FieldType::Base(
                BaseType::Int | BaseType::Char | BaseType::Short | BaseType::Byte | BaseType::Boolean,
            ) => Instruction::ILoad(offset),
            FieldType::Base(BaseType::Float) => Instruction::FLoad(offset),
            FieldType::Base(BaseType::Long) => Instruction::LLoad(offset),
            FieldType::Base(BaseType::Double) => Instruction::DLoad(offset),
            FieldType::Ref(_) => Instruction::ALoad(offset),
        };
        self.push_instruction(insn);
    }

    /// Set a local at a particular offset
    pub fn set_local(&mut self, offset: u16, field_type: &FieldType<BinaryName>) {
        let insn = match field_type {
            FieldType::Base(
                BaseType::Int | BaseType::Char | BaseType::Short | BaseType::Byte | BaseType::Boolean,
            ) => Instruction::IStore(offset),
            FieldType::Base(BaseType::Float) => Instruction::FStore(offset),
            FieldType::Base(BaseType::Long) => Instruction::LStore(offset),
            FieldType::Base(BaseType::Double) => Instruction::DStore(offset),
            FieldType::Ref(_) => Instruction::AStore(offset),
        };
        self.push_instruction(insn);
    }

    /// Duplicate the top of the stack, accounting for the different possible type widths
    pub fn dup(&mut self, width: usize) {
        self.push_instruction(if width == 2 {
            Instruction::Dup2
        } else {
            Instruction::Dup
        });
    }

    /// Pop the top of the stack, accounting for the different possible type widths
    pub fn pop(&mut self, width: usize) {
        self.push_instruction(if width == 2 {
            Instruction::Pop2
        } else {
            Instruction::Pop
        });
    }

    /// Return from the method
    pub fn return_(&mut self, field_type: Option<&FieldType<BinaryName>>) {
        let insn = match field_type {
            None => BranchInstruction::Return,
            Some(FieldType::Base(
                BaseType::Int | BaseType::Char | BaseType::Short | BaseType::Byte | BaseType::Boolean,
            )) => BranchInstruction::IReturn,
            Some(FieldType::Base(BaseType::Float)) => BranchInstruction::FReturn,
            Some(FieldType::Base(BaseType::Long)) => BranchInstruction::LReturn,
            Some(FieldType::Base(BaseType::Double)) => BranchInstruction::DReturn,
            Some(FieldType::Ref(_)) => BranchInstruction::AReturn,
        };
        self.push_branch_instruction(insn);
    }

    /// Invoke a static method on a class
    pub fn invoke_static(
        &mut self,
        owner: &BinaryName,
        name: &UnqualifiedName,
        descriptor: &MethodDescriptor<BinaryName>,
    ) -> Result<(), Error> {
        let method = self.constants.get_method_ref(owner, name, descriptor, false)?;
        self.push_instruction(Instruction::Invoke(InvokeType::Static, method));
        Ok(())
    }

    /// Read a static field
    pub fn get_static(
        &mut self,
        owner: &BinaryName,
        name: &UnqualifiedName,
        field_type: &FieldType<BinaryName>,
    ) -> Result<(), Error> {
        let field = self.constants.get_field_ref(owner, name, field_type)?;
        self.push_instruction(Instruction::GetStatic(field));
        Ok(())
    }

    /// Box the primitive on top of the stack using the wrapper class' `valueOf`
    pub fn box_value(&mut self, base_type: BaseType) -> Result<(), Error> {
        let boxed = base_type.boxed_class();
        let value_of = MethodDescriptor {
            parameters: vec![FieldType::Base(base_type)],
            return_type: Some(FieldType::object(boxed.clone())),
        };
        self.invoke_static(&boxed, &UnqualifiedName::VALUEOF, &value_of)
    }

    /// Construct a new array of references, with the length on top of the stack
    pub fn new_ref_array(&mut self, element_type: &RefType<BinaryName>) -> Result<(), Error> {
        let class = self.constants.get_class(element_type)?;
        self.push_instruction(Instruction::ANewArray(class));
        Ok(())
    }

    /// Push `System.nanoTime()`
    pub fn nano_time(&mut self) -> Result<(), Error> {
        let descriptor = MethodDescriptor {
            parameters: vec![],
            return_type: Some(FieldType::long()),
        };
        self.invoke_static(&BinaryName::SYSTEM, &UnqualifiedName::NANOTIME, &descriptor)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constants_pick_the_shortest_form() {
        let mut constants = ConstantsPool::new();
        let mut labels = SynLabelGenerator::default();
        let mut emitter = Emitter::new(&mut constants, &mut labels, Version::JAVA8);
        emitter.const_int(3).unwrap();
        emitter.const_int(-100).unwrap();
        emitter.const_int(1000).unwrap();
        emitter.const_long(0).unwrap();
        emitter.const_long(7).unwrap();
        let nodes = emitter.into_nodes();

        assert_eq!(
            nodes,
            vec![
                Node::Insn(Instruction::IConst3),
                Node::Insn(Instruction::BiPush(-100)),
                Node::Insn(Instruction::SiPush(1000)),
                Node::Insn(Instruction::LConst0),
                Node::Insn(Instruction::BiPush(7)),
                Node::Insn(Instruction::I2L),
            ]
        );
    }

    #[test]
    fn class_literals_before_java5() {
        let mut constants = ConstantsPool::new();
        let mut labels = SynLabelGenerator::default();

        let mut modern = Emitter::new(&mut constants, &mut labels, Version::JAVA8);
        modern.const_class(&RefType::Object(BinaryName::STRING)).unwrap();
        assert_eq!(modern.into_nodes().len(), 1);

        let mut old = Emitter::new(&mut constants, &mut labels, Version::JAVA1_4);
        old.const_class(&RefType::Object(BinaryName::STRING)).unwrap();
        let nodes = old.into_nodes();
        assert_eq!(nodes.len(), 2);
        let for_name = match &nodes[1] {
            Node::Insn(Instruction::Invoke(InvokeType::Static, method)) => {
                constants.method_ref(*method).unwrap()
            }
            other => panic!("unexpected node {:?}", other),
        };
        assert_eq!(for_name.name, UnqualifiedName::FORNAME);
        assert_eq!(constants.get_string("java.lang.String").unwrap().0, match &nodes[0] {
            Node::Insn(Instruction::Ldc(index)) => *index,
            other => panic!("unexpected node {:?}", other),
        });
    }
}
