//! Lay out method bodies and fix jumps that are too far for their encoding
//!
//! Most jump instructions only have a signed 16-bit relative offset. When instrumentation makes a
//! method body long enough that some jump no longer fits, that jump gets rewritten to go through
//! a `goto_w` (which has a 32-bit offset).
//!
//! ### Termination
//!
//! The `goto_w` rewrites are themselves longer than the initial jump instruction, so rewriting
//! one jump risks pushing other jumps out of range. Layout and rewriting are repeated until
//! nothing is out of range. We know this process finishes because the number of rewritable
//! 16-bit jump instructions only ever decreases:
//!
//!   - once a jump is rewritten, it can be discarded from consideration (`goto_w` is definitely
//!     enough)
//!
//!   - any extra 16-bit jump instruction introduced in a rewrite is always jumping a small
//!     _fixed_ distance so it never needs to be rewritten
//!
//! Switch padding depends on the offset of the switch, so it is recomputed on every layout.
//!
//! ### Rewriting
//!
//! There are two categories of 16-bit jumps that need to be rewritten: `goto` and `if*`.
//! A `goto` is replaced by a `goto_w` in place. Conditional jumps are inverted to skip over a
//! `goto_w`:
//!
//! ```text,ignore,no_run
//!                           ifnot* L3
//!     if* L2                goto_w L2
//! L1: ...         =>    L3:
//!     ...               L1: ...
//! L2: ...                   ...
//!                       L2: ...
//! ```
//!

use crate::jvm::code::{
    switch_padding, BranchInstruction, JumpTargets, LabelGenerator, Node, SynLabel,
};
use crate::util::Width;
use std::collections::{HashMap, HashSet};
use std::ops::{RangeBounds, RangeInclusive};

/// Range of relative jump offsets supported by `goto` and `if*` branch instructions
pub const SIGNED_16BIT_JUMP_RANGE: RangeInclusive<isize> =
    RangeInclusive::new(i16::MIN as isize, i16::MAX as isize);

/// Byte offsets of a laid out method body
#[derive(Debug)]
pub struct Layout {
    /// Offset of every node, plus one final entry for the end of the code
    ///
    /// Labels and line markers share the offset of the next instruction.
    pub offsets: Vec<usize>,

    /// Offset of every placed label
    pub labels: HashMap<SynLabel, usize>,
}

impl Layout {
    /// Total length of the code array
    pub fn len(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Width for Node {
    fn width(&self) -> usize {
        match self {
            Node::Label(_) | Node::Line(_) => 0,
            Node::Insn(insn) => insn.width(),
            Node::Branch(branch) => branch.width(),
        }
    }
}

/// Compute offsets for every node, fixing up switch padding along the way
pub fn layout(nodes: &mut [Node]) -> Layout {
    let mut offsets = Vec::with_capacity(nodes.len() + 1);
    let mut labels = HashMap::new();
    let mut offset: usize = 0;

    for node in nodes.iter_mut() {
        match node {
            Node::Label(label) => {
                labels.insert(*label, offset);
            }
            Node::Branch(
                BranchInstruction::TableSwitch { padding, .. }
                | BranchInstruction::LookupSwitch { padding, .. },
            ) => {
                *padding = switch_padding(offset);
            }
            _ => (),
        }
        offsets.push(offset);
        offset += node.width();
    }
    offsets.push(offset);

    Layout { offsets, labels }
}

/// Detect which regular jumps are out of range in the current layout and rewrite them
///
/// Returns whether anything was rewritten (in which case the layout has to be redone). The
/// `small_jump_range` parameter should always be `SIGNED_16BIT_JUMP_RANGE` - it is a parameter
/// only for unit testing purposes.
pub fn widen_oversized_jumps(
    nodes: &mut Vec<Node>,
    label_generator: &mut impl LabelGenerator<SynLabel>,
    small_jump_range: &impl RangeBounds<isize>,
) -> bool {
    let layout = layout(nodes);

    let mut oversized: HashSet<usize> = HashSet::new();
    for (idx, node) in nodes.iter().enumerate() {
        if let Node::Branch(branch) = node {
            if let JumpTargets::Regular(target) = branch.jump_targets() {
                if let Some(target_offset) = layout.labels.get(&target) {
                    let relative = *target_offset as isize - layout.offsets[idx] as isize;
                    if !small_jump_range.contains(&relative) {
                        oversized.insert(idx);
                    }
                }
            }
        }
    }
    if oversized.is_empty() {
        return false;
    }
    log::debug!("Widening {} oversized jumps", oversized.len());

    let original = std::mem::take(nodes);
    nodes.reserve(original.len() + 3 * oversized.len());
    for (idx, node) in original.into_iter().enumerate() {
        if !oversized.contains(&idx) {
            nodes.push(node);
            continue;
        }
        let branch = match node {
            Node::Branch(branch) => branch,
            other => {
                nodes.push(other);
                continue;
            }
        };
        let skip = label_generator.fresh_label();
        let (inverted, target) = match branch {
            BranchInstruction::Goto(target) => {
                nodes.push(Node::Branch(BranchInstruction::GotoW(target)));
                continue;
            }
            BranchInstruction::If(op, target) => (BranchInstruction::If(!op, skip), target),
            BranchInstruction::IfICmp(op, target) => {
                (BranchInstruction::IfICmp(!op, skip), target)
            }
            BranchInstruction::IfACmp(op, target) => {
                (BranchInstruction::IfACmp(!op, skip), target)
            }
            BranchInstruction::IfNull(op, target) => {
                (BranchInstruction::IfNull(!op, skip), target)
            }
            other => {
                nodes.push(Node::Branch(other));
                continue;
            }
        };
        nodes.push(Node::Branch(inverted));
        nodes.push(Node::Branch(BranchInstruction::GotoW(target)));
        nodes.push(Node::Label(skip));
    }

    true
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::{Instruction, OrdComparison, SynLabelGenerator};

    fn padding(count: usize) -> Vec<Node> {
        vec![Node::Insn(Instruction::Nop); count]
    }

    #[test]
    fn layout_offsets_and_switch_padding() {
        let mut labels = SynLabelGenerator::new(SynLabel::START);
        let target = labels.fresh_label();
        let mut nodes = vec![
            Node::Insn(Instruction::IConst0),
            Node::Branch(BranchInstruction::TableSwitch {
                padding: 0,
                default: target,
                low: 0,
                targets: vec![target],
            }),
            Node::Label(target),
            Node::Line(7),
            Node::Branch(BranchInstruction::Return),
        ];

        let layout = layout(&mut nodes);
        match &nodes[1] {
            Node::Branch(BranchInstruction::TableSwitch { padding, .. }) => {
                assert_eq!(*padding, 2)
            }
            other => panic!("unexpected node {:?}", other),
        }
        let switch_end = 1 + 1 + 2 + 4 * 4;
        assert_eq!(layout.labels[&target], switch_end);
        assert_eq!(layout.offsets[3], switch_end);
        assert_eq!(layout.len(), switch_end + 1);
    }

    #[test]
    fn short_jumps_are_untouched() {
        let mut labels = SynLabelGenerator::new(SynLabel::START);
        let target = labels.fresh_label();
        let mut nodes = vec![Node::Branch(BranchInstruction::Goto(target))];
        nodes.extend(padding(4));
        nodes.push(Node::Label(target));
        nodes.push(Node::Branch(BranchInstruction::Return));

        let before = nodes.clone();
        assert!(!widen_oversized_jumps(&mut nodes, &mut labels, &(-8..=8)));
        assert_eq!(nodes, before);
    }

    #[test]
    fn long_goto_becomes_goto_w() {
        let mut labels = SynLabelGenerator::new(SynLabel::START);
        let target = labels.fresh_label();
        let mut nodes = vec![Node::Branch(BranchInstruction::Goto(target))];
        nodes.extend(padding(10));
        nodes.push(Node::Label(target));
        nodes.push(Node::Branch(BranchInstruction::Return));

        assert!(widen_oversized_jumps(&mut nodes, &mut labels, &(-8..=8)));
        assert_eq!(nodes[0], Node::Branch(BranchInstruction::GotoW(target)));
        assert!(!widen_oversized_jumps(&mut nodes, &mut labels, &(-8..=8)));
    }

    #[test]
    fn long_conditional_is_inverted() {
        let mut labels = SynLabelGenerator::new(SynLabel::START);
        let target = labels.fresh_label();
        let mut nodes = vec![Node::Branch(BranchInstruction::If(OrdComparison::LT, target))];
        nodes.extend(padding(10));
        nodes.push(Node::Label(target));
        nodes.push(Node::Branch(BranchInstruction::Return));

        assert!(widen_oversized_jumps(&mut nodes, &mut labels, &(-8..=8)));
        let skip = match &nodes[0] {
            Node::Branch(BranchInstruction::If(OrdComparison::GE, skip)) => *skip,
            other => panic!("unexpected node {:?}", other),
        };
        assert_eq!(nodes[1], Node::Branch(BranchInstruction::GotoW(target)));
        assert_eq!(nodes[2], Node::Label(skip));

        // The inverted jump only skips over the `goto_w`
        let layout = layout(&mut nodes);
        assert_eq!(layout.labels[&skip], 8);
        assert!(!widen_oversized_jumps(&mut nodes, &mut labels, &(-8..=8)));
    }

    #[test]
    fn backward_jumps_are_measured_from_the_branch() {
        let mut labels = SynLabelGenerator::new(SynLabel::START);
        let target = labels.fresh_label();
        let mut nodes = vec![Node::Label(target)];
        nodes.extend(padding(8));
        nodes.push(Node::Branch(BranchInstruction::Goto(target)));

        assert!(!widen_oversized_jumps(&mut nodes, &mut labels, &(-8..=8)));
        nodes.insert(1, Node::Insn(Instruction::Nop));
        assert!(widen_oversized_jumps(&mut nodes, &mut labels, &(-8..=8)));
        assert_eq!(nodes[10], Node::Branch(BranchInstruction::GotoW(target)));
    }
}
