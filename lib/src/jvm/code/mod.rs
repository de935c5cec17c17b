//! Method bodies in a form suitable for rewriting
//!
//! ### Structure
//!
//! Despite being pushed off into [just another method attribute](crate::jvm::class_file::Code),
//! the bytecode is arguably the most important part of the class file - it contains the actual
//! executable instructions. We split up the [list of bytecode instructions][0] into two groups:
//!
//!   - [`Instruction`] for straight-line instructions
//!   - [`BranchInstruction`] for instructions that may branch
//!
//! A decoded method body ([`Code`]) is a flat list of [`Node`]s: instructions, labels marking
//! positions that something refers to (jumps, exception ranges, local variable scopes), and line
//! number markers. Nothing in that list knows its byte offset. Offsets only come back into
//! existence when the body is [encoded](encode) again, which is what makes it cheap to splice
//! new instructions anywhere.
//!
//! [0]: https://docs.oracle.com/javase/specs/jvms/se18/html/jvms-6.html#jvms-6.5

mod decode;
pub mod encode;
mod instructions;
pub mod jump_encoding;

pub use decode::*;
pub use instructions::*;

use crate::jvm::class_file::{ClassConstantIndex, Utf8ConstantIndex};
use std::collections::HashMap;
use std::fmt;

/// Opaque label
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct SynLabel(usize);

impl SynLabel {
    /// First label handed out by a fresh generator
    pub const START: SynLabel = SynLabel(0);

    /// Get the next fresh label
    pub fn next(&self) -> SynLabel {
        SynLabel(self.0 + 1)
    }
}

impl fmt::Debug for SynLabel {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("l{}", self.0))
    }
}

/// Generates new labels
pub trait LabelGenerator<Label> {
    /// Generate a fresh label
    fn fresh_label(&mut self) -> Label;
}

/// Label generator for [`SynLabel`]
///
/// Cloning does not split the generator source - the cloned generator will produce the same
/// sequence of labels as the original.
#[derive(Clone, Debug)]
pub struct SynLabelGenerator(SynLabel);

impl SynLabelGenerator {
    pub fn new(start: SynLabel) -> SynLabelGenerator {
        SynLabelGenerator(start)
    }
}

impl Default for SynLabelGenerator {
    fn default() -> SynLabelGenerator {
        SynLabelGenerator::new(SynLabel::START)
    }
}

impl LabelGenerator<SynLabel> for SynLabelGenerator {
    fn fresh_label(&mut self) -> SynLabel {
        let to_return = self.0;
        self.0 = self.0.next();
        to_return
    }
}

/// One element of a decoded method body
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    /// Position marker (takes no space in the encoded bytecode)
    Label(SynLabel),

    /// Source line starting at the next instruction
    Line(u16),

    /// Straight-line instruction
    Insn(Instruction),

    /// Instruction which may jump, return, or throw
    Branch(BranchInstruction<SynLabel, SynLabel>),
}

impl Node {
    /// Does this node correspond to bytes in the encoded method?
    pub fn is_instruction(&self) -> bool {
        matches!(self, Node::Insn(_) | Node::Branch(_))
    }
}

/// Entry in the exception table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TryCatch {
    /// Start of the protected range (inclusive)
    pub start: SynLabel,

    /// End of the protected range (exclusive)
    pub end: SynLabel,

    /// Start of the handler code
    pub handler: SynLabel,

    /// Type of exception caught (`None` catches everything)
    pub catch_type: Option<ClassConstantIndex>,
}

/// Entry in the `LocalVariableTable` or `LocalVariableTypeTable`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalVariable {
    pub start: SynLabel,
    pub end: SynLabel,
    pub name: Utf8ConstantIndex,

    /// Field descriptor (for `LocalVariableTable`) or signature (for `LocalVariableTypeTable`)
    pub descriptor: Utf8ConstantIndex,

    pub index: u16,
}

/// Decoded method body
#[derive(Clone, Debug)]
pub struct Code {
    /// Maximum size of the stack, as declared by the class file
    pub max_stack: u16,

    /// Number of local variable slots, as declared by the class file
    pub max_locals: u16,

    /// Instructions, labels, and line markers in order
    pub nodes: Vec<Node>,

    /// Exception table (earlier entries take priority)
    pub try_catches: Vec<TryCatch>,

    pub local_variables: Vec<LocalVariable>,
    pub local_variable_types: Vec<LocalVariable>,

    /// Generator to produce the next label
    pub labels: SynLabelGenerator,
}

impl Code {
    /// Make a fresh label which is not yet placed anywhere
    pub fn fresh_label(&mut self) -> SynLabel {
        self.labels.fresh_label()
    }

    /// Node index of every placed label
    pub fn label_positions(&self) -> HashMap<SynLabel, usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(idx, node)| match node {
                Node::Label(lbl) => Some((*lbl, idx)),
                _ => None,
            })
            .collect()
    }

    /// Number of instructions (labels and line markers excluded)
    pub fn instruction_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_instruction()).count()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_labels_are_distinct() {
        let mut generator = SynLabelGenerator::default();
        let first = generator.fresh_label();
        let second = generator.fresh_label();
        assert_eq!(first, SynLabel::START);
        assert_ne!(first, second);
        assert_eq!(format!("{:?}", second), "l1");
    }

    #[test]
    fn label_positions_skip_other_nodes() {
        let mut code = Code {
            max_stack: 0,
            max_locals: 0,
            nodes: vec![],
            try_catches: vec![],
            local_variables: vec![],
            local_variable_types: vec![],
            labels: SynLabelGenerator::default(),
        };
        let start = code.fresh_label();
        let end = code.fresh_label();
        code.nodes = vec![
            Node::Label(start),
            Node::Line(3),
            Node::Insn(Instruction::Nop),
            Node::Label(end),
            Node::Branch(BranchInstruction::Return),
        ];

        let positions = code.label_positions();
        assert_eq!(positions[&start], 0);
        assert_eq!(positions[&end], 3);
        assert_eq!(code.instruction_count(), 2);
    }
}
