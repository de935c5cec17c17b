use super::*;
use crate::jvm::class_file::ConstantsPool;
use crate::jvm::code::{Code, Node, SynLabel};
use crate::jvm::hierarchy::ClassHierarchy;
use crate::jvm::{BinaryName, Error, MethodDescriptor, RefType, VerifierErrorKind};
use std::collections::{BTreeSet, HashMap};

/// What the analysis needs to know about the method whose body is analyzed
pub struct MethodContext<'a> {
    pub this_class: BinaryName,
    pub descriptor: MethodDescriptor<BinaryName>,
    pub is_static: bool,

    /// Is this an `<init>` method? (`this` starts out uninitialized)
    pub is_constructor: bool,

    pub hierarchy: &'a dyn ClassHierarchy,
}

/// Result of analyzing a method body
#[derive(Debug)]
pub struct Analysis {
    /// Frame on entry to every node (`None` for unreachable nodes)
    pub frames: Vec<Option<VerifierFrame>>,

    /// Largest stack height reached anywhere
    pub max_stack: usize,

    /// Number of local slots used anywhere
    pub max_locals: usize,
}

impl Analysis {
    /// Is the node reachable from the method entry?
    pub fn is_reachable(&self, node: usize) -> bool {
        matches!(self.frames.get(node), Some(Some(_)))
    }

    /// Frame on entry to a node, if the node is reachable
    pub fn frame(&self, node: usize) -> Option<&VerifierFrame> {
        self.frames.get(node).and_then(Option::as_ref)
    }
}

/// Exception handler edge out of a protected node
struct HandlerEdge {
    handler: usize,
    caught: VType,
}

/// Run the type-checking analysis over a method body
///
/// This is a standard fix-point iteration: frames flow forward from the method entry through
/// instructions, jumps, and exception handler edges, merging wherever control flow joins.
/// Nodes never reached keep a `None` frame. Any instruction that doesn't type-check in the
/// frame reaching it fails the whole analysis.
pub fn analyze(
    code: &Code,
    context: &MethodContext,
    constants: &ConstantsPool,
) -> Result<Analysis, Error> {
    let nodes = &code.nodes;
    let labels = code.label_positions();
    let label_node = |label: SynLabel| labels.get(&label).copied().ok_or(Error::UnplacedLabel(label));

    // Exception handler edges, for every node index
    let mut handler_edges: HashMap<usize, Vec<HandlerEdge>> = HashMap::new();
    for try_catch in &code.try_catches {
        let start = label_node(try_catch.start)?;
        let end = label_node(try_catch.end)?;
        let handler = label_node(try_catch.handler)?;
        let caught = match try_catch.catch_type {
            None => VType::object(BinaryName::THROWABLE),
            Some(class) => VType::Object(RefType::Object(constants.class_name(class)?)),
        };
        for node in start..end {
            if nodes[node].is_instruction() {
                handler_edges.entry(node).or_default().push(HandlerEdge {
                    handler,
                    caught: caught.clone(),
                });
            }
        }
    }

    let mut frames: Vec<Option<VerifierFrame>> = vec![None; nodes.len()];
    let entry = VerifierFrame::method_entry(context);
    let mut max_stack = 0;
    let mut max_locals = entry.locals.len();
    if nodes.is_empty() {
        return Err(verifier_error(0, "<end>", VerifierErrorKind::FallsOffEnd));
    }
    frames[0] = Some(entry);

    // Process lowest node indices first, which keeps the iteration close to program order
    let mut worklist: BTreeSet<usize> = BTreeSet::new();
    worklist.insert(0);

    while let Some(node) = worklist.iter().next().copied() {
        worklist.remove(&node);
        let frame_in = match &frames[node] {
            Some(frame) => frame.clone(),
            None => continue,
        };
        let mut frame = frame_in.clone();

        // Successors along with the frame that reaches them
        let mut successors: Vec<(usize, VerifierFrame)> = vec![];
        let mut falls_through = true;

        match &nodes[node] {
            Node::Label(_) | Node::Line(_) => (),
            Node::Insn(insn) => {
                frame
                    .verify_instruction(insn, node, constants, context)
                    .map_err(|kind| verifier_error(node, &format!("{:?}", insn), kind))?;
            }
            Node::Branch(branch) => {
                frame
                    .verify_branch_instruction(branch, context)
                    .map_err(|kind| verifier_error(node, &format!("{:?}", branch), kind))?;
                for target in branch.jump_targets().targets() {
                    successors.push((label_node(*target)?, frame.clone()));
                }
                falls_through = branch.falls_through();
            }
        }

        max_stack = max_stack.max(frame_in.stack_height()).max(frame.stack_height());
        max_locals = max_locals.max(frame.locals.len());

        // Handlers see the locals from both before and after the instruction
        if let Some(edges) = handler_edges.get(&node) {
            for edge in edges {
                for locals in [&frame_in.locals, &frame.locals] {
                    let mut handler_frame = VerifierFrame {
                        locals: locals.clone(),
                        stack: vec![],
                    };
                    handler_frame.push(edge.caught.clone(), edge.handler);
                    successors.push((edge.handler, handler_frame));
                }
            }
        }

        if falls_through {
            if node + 1 >= nodes.len() {
                let kind = VerifierErrorKind::FallsOffEnd;
                return Err(verifier_error(node, &format!("{:?}", nodes[node]), kind));
            }
            successors.push((node + 1, frame));
        }

        for (target, incoming) in successors {
            max_stack = max_stack.max(incoming.stack_height());
            match frames[target].as_mut() {
                None => {
                    frames[target] = Some(incoming);
                    worklist.insert(target);
                }
                Some(existing) => {
                    let changed = existing.merge(&incoming, context).map_err(|kind| {
                        verifier_error(target, &format!("{:?}", nodes[target]), kind)
                    })?;
                    if changed {
                        worklist.insert(target);
                    }
                }
            }
        }
    }

    log::trace!(
        "Analyzed {} nodes (max stack {}, max locals {})",
        nodes.len(),
        max_stack,
        max_locals
    );
    Ok(Analysis {
        frames,
        max_stack,
        max_locals,
    })
}

fn verifier_error(node: usize, instruction: &str, kind: VerifierErrorKind) -> Error {
    Error::VerifierError {
        node,
        instruction: instruction.to_owned(),
        kind,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_file::ConstantsPool;
    use crate::jvm::code::{
        BranchInstruction, Instruction, LabelGenerator, OrdComparison, SynLabelGenerator,
        TryCatch,
    };
    use crate::jvm::hierarchy::KnownClasses;
    use crate::jvm::{FieldType, Name};

    fn code(nodes: Vec<Node>, labels: SynLabelGenerator) -> Code {
        Code {
            max_stack: 0,
            max_locals: 0,
            nodes,
            try_catches: vec![],
            local_variables: vec![],
            local_variable_types: vec![],
            labels,
        }
    }

    fn static_context(hierarchy: &KnownClasses, parameters: Vec<FieldType<BinaryName>>) -> MethodContext<'_> {
        MethodContext {
            this_class: BinaryName::from_string(String::from("app/Main")).unwrap(),
            descriptor: MethodDescriptor {
                parameters,
                return_type: Some(FieldType::int()),
            },
            is_static: true,
            is_constructor: false,
            hierarchy,
        }
    }

    #[test]
    fn branches_merge_and_dead_code_is_unreachable() {
        let hierarchy = KnownClasses::with_java_lang();
        let context = static_context(&hierarchy, vec![FieldType::int()]);
        let constants = ConstantsPool::new();
        let mut labels = SynLabelGenerator::default();
        let else_label = labels.fresh_label();
        let join = labels.fresh_label();

        let code = code(
            vec![
                Node::Insn(Instruction::ILoad(0)),
                Node::Branch(BranchInstruction::If(OrdComparison::EQ, else_label)),
                Node::Insn(Instruction::IConst1),
                Node::Branch(BranchInstruction::Goto(join)),
                Node::Insn(Instruction::Nop),
                Node::Label(else_label),
                Node::Insn(Instruction::IConst2),
                Node::Label(join),
                Node::Branch(BranchInstruction::IReturn),
            ],
            labels,
        );

        let analysis = analyze(&code, &context, &constants).unwrap();
        assert!(!analysis.is_reachable(4));
        assert!(analysis.is_reachable(5));
        let join_frame = analysis.frame(7).unwrap();
        assert_eq!(join_frame.stack.len(), 1);
        assert_eq!(join_frame.stack[0].vtype, VType::Integer);
        assert_eq!(join_frame.stack[0].origin, None);
        assert_eq!(analysis.frame(3).unwrap().stack[0].origin, Some(2));
        assert_eq!(analysis.max_stack, 1);
        assert_eq!(analysis.max_locals, 1);
    }

    #[test]
    fn handlers_start_with_the_exception() {
        let hierarchy = KnownClasses::with_java_lang();
        let context = static_context(&hierarchy, vec![]);
        let constants = ConstantsPool::new();
        let mut labels = SynLabelGenerator::default();
        let start = labels.fresh_label();
        let end = labels.fresh_label();
        let handler = labels.fresh_label();

        let mut code = code(
            vec![
                Node::Label(start),
                Node::Insn(Instruction::IConst0),
                Node::Insn(Instruction::IStore(0)),
                Node::Label(end),
                Node::Insn(Instruction::ILoad(0)),
                Node::Branch(BranchInstruction::IReturn),
                Node::Label(handler),
                Node::Insn(Instruction::AStore(1)),
                Node::Insn(Instruction::IConst1),
                Node::Branch(BranchInstruction::IReturn),
            ],
            labels,
        );
        code.try_catches.push(TryCatch {
            start,
            end,
            handler,
            catch_type: None,
        });

        let analysis = analyze(&code, &context, &constants).unwrap();
        let handler_frame = analysis.frame(6).unwrap();
        assert_eq!(
            handler_frame.stack[0].vtype,
            VType::object(BinaryName::THROWABLE)
        );

        // Local 0 is only sometimes set when the exception is thrown
        assert_eq!(handler_frame.local(0), None);
        assert_eq!(analysis.max_locals, 2);
    }

    #[test]
    fn falling_off_the_end_is_rejected() {
        let hierarchy = KnownClasses::with_java_lang();
        let context = static_context(&hierarchy, vec![]);
        let constants = ConstantsPool::new();
        let code = code(
            vec![Node::Insn(Instruction::IConst0)],
            SynLabelGenerator::default(),
        );

        match analyze(&code, &context, &constants) {
            Err(Error::VerifierError {
                kind: VerifierErrorKind::FallsOffEnd,
                ..
            }) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn stack_height_mismatch_is_rejected() {
        let hierarchy = KnownClasses::with_java_lang();
        let context = static_context(&hierarchy, vec![FieldType::int()]);
        let constants = ConstantsPool::new();
        let mut labels = SynLabelGenerator::default();
        let join = labels.fresh_label();

        let code = code(
            vec![
                Node::Insn(Instruction::IConst0),
                Node::Insn(Instruction::ILoad(0)),
                Node::Branch(BranchInstruction::If(OrdComparison::EQ, join)),
                Node::Insn(Instruction::Pop),
                Node::Label(join),
                Node::Insn(Instruction::IConst0),
                Node::Branch(BranchInstruction::IReturn),
            ],
            labels,
        );

        assert!(matches!(
            analyze(&code, &context, &constants),
            Err(Error::VerifierError {
                kind: VerifierErrorKind::StackHeightMismatch(_, _),
                ..
            })
        ));
    }
}
