//! Injection per location kind
//!
//! Each kind first finds its anchors in the original body (the nodes its sites attach to) and
//! then builds the code for every site. Sites are injected in node order, so that all the sites
//! anchored at one node form a group sharing the lifetime of their captured values.
//!
//! Handlers appended at the end of the method (for `Error` probes and for exits of synchronized
//! code) are built last, once every other site is in place, since their ranges have to cover
//! everything injected into the body.

mod markers;
mod members;
mod method;
mod objects;

use super::args::{SiteValues, Value};
use super::errors::{InjectError, MethodError};
use super::emit::Emitter;
use super::inject::{MethodInjector, Scope};
use super::probe::{Binding, Kind, ProbeDescriptor, Where};
use super::rewrite::HandlerTier;
use super::sync;
use crate::jvm;
use crate::jvm::class_file::{FieldRef, MethodRef};
use crate::jvm::code::{BranchInstruction, Instruction, InvokeType, Node, SynLabel, TryCatch};
use crate::jvm::{BinaryName, FieldType, JavaName, Name, RefType};

/// What a site is attached to
#[derive(Clone, Debug)]
pub enum Anchor {
    /// `xreturn`
    Return,

    /// `xreturn` of a `synchronized` method (which releases the method's monitor)
    MethodExit,

    Throw,

    /// Label starting an exception handler
    Catch,

    /// Line marker, with the line number passed to the handler
    Line(u16),

    Field { field: FieldRef, is_static: bool },

    /// Array element load or store
    Array { store: bool },

    /// `new`
    Allocation(BinaryName),

    /// Constructor call initializing the object allocated by the `new` at `new_node`
    Construction {
        class: BinaryName,
        new_node: usize,
        arguments: usize,
    },

    /// `newarray`, `anewarray`, or `multianewarray`
    NewArray {
        created: RefType<BinaryName>,
        dimensions: u8,
    },

    MonitorEnter,
    MonitorExit,

    Call { method: MethodRef, invoke: InvokeType },

    /// `checkcast` or `instanceof`
    TypeCheck(RefType<BinaryName>),
}

/// Inject every probe matching the method
///
/// Problems confined to one site are recorded and skip that site. Anything else gives up on the
/// whole method.
pub fn inject_method(inj: &mut MethodInjector, probes: &[&ProbeDescriptor]) -> Result<(), MethodError> {
    // Sites at the start of the body go first, ahead of anything anchored at the first node
    for probe in probes {
        let result = match probe.location.kind {
            Kind::Entry => method::entry(inj, probe),
            Kind::SyncEntry if inj.method.is_synchronized() => sync::method_entry(inj, probe),
            _ => continue,
        };
        inj.record(probe, None, result)?;
    }

    let mut sites: Vec<(usize, usize, Anchor)> = vec![];
    for (order, probe) in probes.iter().enumerate() {
        for (node, anchor) in anchors(inj, probe)? {
            sites.push((node, order, anchor));
        }
    }
    sites.sort_by_key(|(node, order, _)| (*node, *order));

    for (node, order, anchor) in sites {
        let probe = probes[order];
        inj.begin_node(node);
        let result = inject_site(inj, probe, node, &anchor);
        inj.record(probe, Some(node), result)?;
    }

    sync::monitor_exit_handlers(inj, probes)?;
    sync::method_exit_handler(inj, probes)?;
    method::error_handler(inj, probes)?;
    Ok(())
}

fn inject_site(
    inj: &mut MethodInjector,
    probe: &ProbeDescriptor,
    node: usize,
    anchor: &Anchor,
) -> Result<(), InjectError> {
    match anchor {
        Anchor::Return => method::exit(inj, probe, node),
        Anchor::MethodExit => sync::method_exit(inj, probe, node),
        Anchor::Throw => markers::throw(inj, probe, node),
        Anchor::Catch => markers::catch(inj, probe, node),
        Anchor::Line(line) => markers::line(inj, probe, node, *line),
        Anchor::TypeCheck(checked) => markers::type_check(inj, probe, node, checked),
        Anchor::Field { field, is_static } => members::field(inj, probe, node, field, *is_static),
        Anchor::Array { store } => members::array(inj, probe, node, *store),
        Anchor::Call { method, invoke } => members::call(inj, probe, node, method, *invoke),
        Anchor::Allocation(class) => objects::allocation(inj, probe, node, class),
        Anchor::Construction {
            class,
            new_node,
            arguments,
        } => objects::construction(inj, probe, node, class, *new_node, *arguments),
        Anchor::NewArray {
            created,
            dimensions,
        } => objects::new_array(inj, probe, node, created, *dimensions),
        Anchor::MonitorEnter | Anchor::MonitorExit => sync::monitor(inj, probe, node),
    }
}

/// Nodes of the original body where a probe has sites
///
/// Dead code never has sites.
pub fn anchors(inj: &MethodInjector, probe: &ProbeDescriptor) -> Result<Vec<(usize, Anchor)>, MethodError> {
    let location = &probe.location;
    let constants = &*inj.constants;
    let hierarchy = inj.ctx.hierarchy;
    let after = location.point == Where::After;
    let mut found = vec![];

    if location.kind == Kind::Catch {
        return markers::catch_anchors(inj, probe);
    }

    let mut seen_line = false;
    for (idx, node) in inj.code.nodes.iter().enumerate() {
        if !inj.analysis.is_reachable(idx) {
            continue;
        }
        let anchor = match (location.kind, node) {
            (Kind::Return, Node::Branch(branch)) if is_return(branch) => Some(Anchor::Return),
            (Kind::SyncExit, Node::Branch(branch))
                if is_return(branch) && inj.method.is_synchronized() =>
            {
                Some(Anchor::MethodExit)
            }
            (Kind::Throw, Node::Branch(BranchInstruction::AThrow)) => Some(Anchor::Throw),

            (Kind::Line, Node::Line(line)) => {
                let first = !seen_line;
                seen_line = true;
                let wanted = |line: u16| location.line == -1 || location.line == i32::from(line);
                match after {
                    false if wanted(*line) => Some(Anchor::Line(*line)),
                    true if !first && *line > 0 && wanted(*line - 1) => Some(Anchor::Line(*line - 1)),
                    _ => None,
                }
            }

            (Kind::FieldGet, Node::Insn(Instruction::GetField(field) | Instruction::GetStatic(field)))
            | (Kind::FieldSet, Node::Insn(Instruction::PutField(field) | Instruction::PutStatic(field))) => {
                let is_static = matches!(
                    node,
                    Node::Insn(Instruction::GetStatic(_) | Instruction::PutStatic(_))
                );
                let field = constants.field_ref(*field)?;
                let owner = RefType::Object(field.owner.clone());
                if location.class.matches_type(&owner, hierarchy)
                    && location.member.matches_member(field.name.as_str(), &[])
                {
                    Some(Anchor::Field { field, is_static })
                } else {
                    None
                }
            }

            (Kind::ArrayGet, Node::Insn(insn)) if is_array_load(insn) => Some(Anchor::Array { store: false }),
            (Kind::ArraySet, Node::Insn(insn)) if is_array_store(insn) => Some(Anchor::Array { store: true }),

            (Kind::New, Node::Insn(Instruction::New(class))) if !after => {
                let class = constants.class_name(*class)?;
                if location.class.matches_type(&RefType::Object(class.clone()), hierarchy) {
                    Some(Anchor::Allocation(class))
                } else {
                    None
                }
            }
            (Kind::New, Node::Insn(Instruction::Invoke(InvokeType::Special, method))) if after => {
                objects::construction_anchor(inj, probe, idx, constants.method_ref(*method)?)
            }

            (Kind::NewArray, Node::Insn(insn)) => match objects::created_array(insn, constants)? {
                Some((created, dimensions)) => {
                    let matches = match array_element(&created, dimensions) {
                        FieldType::Ref(element) => location.class.matches_type(&element, hierarchy),
                        FieldType::Base(element) => location.class.matches_name(&element.java_name()),
                    };
                    matches.then(|| Anchor::NewArray { created, dimensions })
                }
                None => None,
            },

            (Kind::SyncEntry, Node::Insn(Instruction::MonitorEnter)) => Some(Anchor::MonitorEnter),
            (Kind::SyncExit, Node::Insn(Instruction::MonitorExit)) => Some(Anchor::MonitorExit),

            (Kind::Call, Node::Insn(Instruction::Invoke(invoke, method))) => {
                let method = constants.method_ref(*method)?;
                if members::call_matches(inj, probe, &method) {
                    Some(Anchor::Call {
                        method,
                        invoke: *invoke,
                    })
                } else {
                    None
                }
            }

            (Kind::CheckCast, Node::Insn(Instruction::CheckCast(class)))
            | (Kind::InstanceOf, Node::Insn(Instruction::InstanceOf(class))) => {
                let checked = constants.class(*class)?;
                if location.class.matches_type(&checked, hierarchy) {
                    Some(Anchor::TypeCheck(checked))
                } else {
                    None
                }
            }

            _ => None,
        };
        if let Some(anchor) = anchor {
            found.push((idx, anchor));
        }
    }
    Ok(found)
}

pub fn is_return(branch: &BranchInstruction<SynLabel, SynLabel>) -> bool {
    matches!(
        branch,
        BranchInstruction::IReturn
            | BranchInstruction::LReturn
            | BranchInstruction::FReturn
            | BranchInstruction::DReturn
            | BranchInstruction::AReturn
            | BranchInstruction::Return
    )
}

fn is_array_load(insn: &Instruction) -> bool {
    matches!(
        insn,
        Instruction::IALoad
            | Instruction::LALoad
            | Instruction::FALoad
            | Instruction::DALoad
            | Instruction::AALoad
            | Instruction::BALoad
            | Instruction::CALoad
            | Instruction::SALoad
    )
}

fn is_array_store(insn: &Instruction) -> bool {
    matches!(
        insn,
        Instruction::IAStore
            | Instruction::LAStore
            | Instruction::FAStore
            | Instruction::DAStore
            | Instruction::AAStore
            | Instruction::BAStore
            | Instruction::CAStore
            | Instruction::SAStore
    )
}

/// Element type of an array created with `dimensions` dimensions given
pub fn array_element(created: &RefType<BinaryName>, dimensions: u8) -> FieldType<BinaryName> {
    let mut element = FieldType::Ref(created.clone());
    for _ in 0..dimensions {
        element = match &element {
            FieldType::Ref(ref_type) => match ref_type.element_type() {
                Some(inner) => inner,
                None => break,
            },
            FieldType::Base(_) => break,
        };
    }
    element
}

/// Insert the two halves of a site's code around its anchor
pub fn insert_around(inj: &mut MethodInjector, node: usize, before: Vec<Node>, after: Vec<Node>) {
    if !before.is_empty() {
        inj.rewrite.insert_before(node, before);
    }
    if !after.is_empty() {
        inj.rewrite.insert_after(node, after);
    }
}

/// Build the code in front of and behind an instruction
///
/// `before` captures values and returns what the handler gets. When the handler is called in
/// front of the instruction, those captures sit past the gates. Behind it, they carry values the
/// instruction consumes, so they run whether the handler is called or not. Only the value the
/// instruction produced (of type `produced`) is then captured past the gates, if the handler
/// wants it.
pub fn around(
    inj: &mut MethodInjector,
    probe: &ProbeDescriptor,
    node: usize,
    before: impl FnOnce(&mut Emitter, &mut Scope) -> Result<SiteValues, InjectError>,
    produced: Option<FieldType<BinaryName>>,
) -> Result<(), InjectError> {
    let (front, carried) = match probe.location.point {
        Where::Before => {
            let (front, ()) = inj.build(|emitter, scope| {
                scope.call_capturing(emitter, probe, SiteValues::default(), |emitter, scope, values| {
                    *values = before(emitter, scope)?;
                    Ok(())
                })
            })?;
            (front, None)
        }
        Where::After => {
            let (front, values) = inj.build(before)?;
            (front, Some(values))
        }
    };
    let back = match carried {
        None => vec![],
        Some(values) => {
            let produced = produced.filter(|_| probe.wants(Binding::Return));
            let (back, ()) = inj.build(|emitter, scope| {
                scope.call_capturing(emitter, probe, values, |emitter, scope, values| {
                    if let Some(produced) = produced {
                        values.return_value = scope.capture(emitter, "ret", &[produced])?.pop();
                    }
                    Ok(())
                })
            })?;
            back
        }
    };
    insert_around(inj, node, front, back);
    Ok(())
}

/// Append a handler for `Throwable` over `[start, end)` which calls probes then rethrows
///
/// The handler is `astore exc; <probe regions>; aload exc; athrow`. Each probe gets the values
/// given alongside it. Probes which can't be bound are skipped, and no handler is added if none
/// is left (which is what the returned flag tells). Without an explicit `end`, the range ends
/// where the handlers of `tier` start.
pub fn rethrowing_handler(
    inj: &mut MethodInjector,
    tier: HandlerTier,
    start: SynLabel,
    end: Option<SynLabel>,
    node: Option<usize>,
    probes: Vec<(&ProbeDescriptor, SiteValues)>,
) -> Result<bool, MethodError> {
    let exception_slot = inj.exception_slot()?;
    let mut body = vec![];
    for (probe, values) in probes {
        let result = inj
            .build(|emitter, scope| scope.call(emitter, probe, &values))
            .map(|(nodes, ())| body.extend(nodes));
        inj.record(probe, node, result)?;
    }
    if body.is_empty() {
        return Ok(false);
    }

    let handler = inj.fresh_label();
    let end = match end {
        Some(end) => end,
        None => inj.rewrite.tier_start(tier, &mut inj.labels),
    };
    let throwable = RefType::Object(BinaryName::THROWABLE);
    let catch_type = inj
        .constants
        .get_class(&throwable)
        .map_err(jvm::Error::from)?;

    let mut nodes = Vec::with_capacity(body.len() + 4);
    nodes.push(Node::Label(handler));
    nodes.push(Node::Insn(Instruction::AStore(exception_slot)));
    nodes.extend(body);
    nodes.push(Node::Insn(Instruction::ALoad(exception_slot)));
    nodes.push(Node::Branch(BranchInstruction::AThrow));
    inj.rewrite.add_handler(
        tier,
        TryCatch {
            start,
            end,
            handler,
            catch_type: Some(catch_type),
        },
        nodes,
    );
    Ok(true)
}

/// The exception held by appended handlers
pub fn caught_exception(slot: u16) -> Value {
    Value::local(slot, FieldType::object(BinaryName::THROWABLE))
}
