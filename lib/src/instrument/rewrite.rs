use crate::jvm::code::{Code, LabelGenerator, LocalVariable, Node, SynLabel, TryCatch};
use std::collections::{BTreeMap, HashMap};

/// Handlers added at the end of a rewritten method
///
/// A handler's rethrow must only be seen by handlers in later tiers (never by its own range),
/// so every tier gets a label right before its code which ends the whole-body ranges of that
/// tier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandlerTier {
    /// Exits of `monitorenter`/`monitorexit` regions without a catch-all handler
    Monitor,

    /// Exit from a `synchronized` method
    SynchronizedMethod,

    /// Exception propagating out of the method
    Error,
}

/// Pending changes to a method body
///
/// Changes are recorded against node indices of the original body, so recording them never
/// invalidates the analysis they are based on. [`MethodRewrite::apply`] then builds the new node
/// list in a single pass.
#[derive(Default)]
pub struct MethodRewrite {
    /// Code run before anything else (timer initialization)
    prologue: Vec<Node>,

    before: HashMap<usize, Vec<Node>>,
    after: HashMap<usize, Vec<Node>>,

    handlers: BTreeMap<HandlerTier, Vec<Node>>,
    tier_starts: BTreeMap<HandlerTier, SynLabel>,
    try_catches: Vec<(HandlerTier, TryCatch)>,

    local_variables: Vec<LocalVariable>,

    /// Labels around the whole rewritten body
    bounds: Option<(SynLabel, SynLabel)>,

    changes: usize,
}

impl MethodRewrite {
    /// Has anything been recorded?
    pub fn is_empty(&self) -> bool {
        self.changes == 0
    }

    pub fn prepend(&mut self, nodes: Vec<Node>) {
        self.changes += 1;
        self.prologue.extend(nodes);
    }

    pub fn insert_before(&mut self, node: usize, nodes: Vec<Node>) {
        self.changes += 1;
        self.before.entry(node).or_default().extend(nodes);
    }

    pub fn insert_after(&mut self, node: usize, nodes: Vec<Node>) {
        self.changes += 1;
        self.after.entry(node).or_default().extend(nodes);
    }

    /// Put a label before everything else inserted before a node
    pub fn label_before(&mut self, node: usize, label: SynLabel) {
        self.before.entry(node).or_default().insert(0, Node::Label(label));
    }

    /// Put a label after everything else inserted after a node
    pub fn label_after(&mut self, node: usize, label: SynLabel) {
        self.after.entry(node).or_default().push(Node::Label(label));
    }

    /// Label just before the handlers of a tier (the end of ranges protected by that tier)
    pub fn tier_start(&mut self, tier: HandlerTier, labels: &mut impl LabelGenerator<SynLabel>) -> SynLabel {
        *self
            .tier_starts
            .entry(tier)
            .or_insert_with(|| labels.fresh_label())
    }

    pub fn add_handler(&mut self, tier: HandlerTier, try_catch: TryCatch, nodes: Vec<Node>) {
        self.changes += 1;
        self.handlers.entry(tier).or_default().extend(nodes);
        self.try_catches.push((tier, try_catch));
    }

    /// Put labels at the very start and the very end of the rewritten body
    pub fn label_method(&mut self, start: SynLabel, end: SynLabel) {
        self.bounds = Some((start, end));
    }

    pub fn add_local_variable(&mut self, local_variable: LocalVariable) {
        self.local_variables.push(local_variable);
    }

    /// Splice everything into the body
    ///
    /// New exception table entries go after the existing ones, so handlers already in the
    /// method keep priority. Among the new ones, earlier tiers come first.
    pub fn apply(mut self, code: &mut Code) {
        let original = std::mem::take(&mut code.nodes);
        let mut nodes = Vec::with_capacity(original.len() + 2 * self.changes);
        if let Some((start, _)) = self.bounds {
            nodes.push(Node::Label(start));
        }
        nodes.append(&mut self.prologue);
        for (idx, node) in original.into_iter().enumerate() {
            if let Some(before) = self.before.remove(&idx) {
                nodes.extend(before);
            }
            nodes.push(node);
            if let Some(after) = self.after.remove(&idx) {
                nodes.extend(after);
            }
        }

        let mut tiers: Vec<HandlerTier> = self
            .tier_starts
            .keys()
            .chain(self.handlers.keys())
            .copied()
            .collect();
        tiers.sort();
        tiers.dedup();
        for tier in tiers {
            if let Some(start) = self.tier_starts.get(&tier) {
                nodes.push(Node::Label(*start));
            }
            if let Some(handler) = self.handlers.remove(&tier) {
                nodes.extend(handler);
            }
        }
        if let Some((_, end)) = self.bounds {
            nodes.push(Node::Label(end));
        }
        code.nodes = nodes;

        self.try_catches.sort_by_key(|(tier, _)| *tier);
        code.try_catches
            .extend(self.try_catches.into_iter().map(|(_, try_catch)| try_catch));
        code.local_variables.append(&mut self.local_variables);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::{BranchInstruction, Instruction, SynLabelGenerator};

    fn code(nodes: Vec<Node>) -> Code {
        Code {
            max_stack: 1,
            max_locals: 1,
            nodes,
            try_catches: vec![],
            local_variables: vec![],
            local_variable_types: vec![],
            labels: SynLabelGenerator::default(),
        }
    }

    #[test]
    fn patches_land_around_their_nodes() {
        let mut body = code(vec![
            Node::Insn(Instruction::IConst0),
            Node::Branch(BranchInstruction::IReturn),
        ]);
        let mut rewrite = MethodRewrite::default();
        assert!(rewrite.is_empty());
        rewrite.insert_before(1, vec![Node::Insn(Instruction::Dup)]);
        rewrite.insert_after(0, vec![Node::Insn(Instruction::Nop)]);
        rewrite.prepend(vec![Node::Insn(Instruction::LConst0), Node::Insn(Instruction::LStore(1))]);
        assert!(!rewrite.is_empty());
        rewrite.apply(&mut body);

        assert_eq!(
            body.nodes,
            vec![
                Node::Insn(Instruction::LConst0),
                Node::Insn(Instruction::LStore(1)),
                Node::Insn(Instruction::IConst0),
                Node::Insn(Instruction::Nop),
                Node::Insn(Instruction::Dup),
                Node::Branch(BranchInstruction::IReturn),
            ]
        );
    }

    #[test]
    fn handler_tiers_are_ordered() {
        let mut body = code(vec![Node::Branch(BranchInstruction::Return)]);
        let mut labels = body.labels.clone();
        let start = labels.fresh_label();
        let mut rewrite = MethodRewrite::default();
        rewrite.label_before(0, start);

        let error_end = rewrite.tier_start(HandlerTier::Error, &mut labels);
        let error_handler = labels.fresh_label();
        rewrite.add_handler(
            HandlerTier::Error,
            TryCatch {
                start,
                end: error_end,
                handler: error_handler,
                catch_type: None,
            },
            vec![Node::Label(error_handler), Node::Branch(BranchInstruction::AThrow)],
        );
        let monitor_end = rewrite.tier_start(HandlerTier::Monitor, &mut labels);
        let monitor_handler = labels.fresh_label();
        rewrite.add_handler(
            HandlerTier::Monitor,
            TryCatch {
                start,
                end: monitor_end,
                handler: monitor_handler,
                catch_type: None,
            },
            vec![Node::Label(monitor_handler), Node::Branch(BranchInstruction::AThrow)],
        );
        rewrite.apply(&mut body);

        assert_eq!(
            body.nodes,
            vec![
                Node::Label(start),
                Node::Branch(BranchInstruction::Return),
                Node::Label(monitor_end),
                Node::Label(monitor_handler),
                Node::Branch(BranchInstruction::AThrow),
                Node::Label(error_end),
                Node::Label(error_handler),
                Node::Branch(BranchInstruction::AThrow),
            ]
        );
        let handlers: Vec<SynLabel> = body.try_catches.iter().map(|try_catch| try_catch.handler).collect();
        assert_eq!(handlers, vec![monitor_handler, error_handler]);
    }
}
