//! Accesses to other members: field reads and writes, array elements, and method calls
//!
//! These sites capture values from the stack ahead of the instruction (the receiver, the
//! arguments, the value stored) and, when they fire after it, the value it produced. Both halves
//! are built before anything is inserted, so a site which can't be bound leaves no trace.

use super::around;
use crate::instrument::args::{SiteValues, Value};
use crate::instrument::errors::InjectError;
use crate::instrument::inject::MethodInjector;
use crate::instrument::probe::{Binding, Kind, ProbeDescriptor, Where};
use crate::instrument::stack;
use crate::jvm::class_file::{FieldRef, MethodRef};
use crate::jvm::code::{Instruction, InvokeType, Node};
use crate::jvm::{BinaryName, FieldType, JavaName, Name, RenderDescriptor};

/// Does a call instruction target a method the probe is after?
pub fn call_matches(inj: &MethodInjector, probe: &ProbeDescriptor, method: &MethodRef) -> bool {
    let location = &probe.location;
    let hierarchy = inj.ctx.hierarchy;
    !method
        .name
        .as_str()
        .starts_with(&inj.ctx.settings.injected_prefix)
        && location.class.matches_type(&method.owner, hierarchy)
        && location.member.matches_member(method.name.as_str(), &[])
        && location
            .descriptor
            .as_ref()
            .map_or(true, |pattern| pattern.matches(&method.descriptor, hierarchy))
}

/// Types to capture values as: primitives keep their declared type, references the type the
/// stack says they have
fn capture_types(
    on_stack: Vec<FieldType<BinaryName>>,
    declared: &[FieldType<BinaryName>],
) -> Vec<FieldType<BinaryName>> {
    on_stack
        .into_iter()
        .zip(declared)
        .map(|(current, declared)| match declared {
            FieldType::Base(_) => declared.clone(),
            FieldType::Ref(_) => current,
        })
        .collect()
}

/// `FieldGet` and `FieldSet`
///
/// The receiver is the target instance. Writes pass the value written as their only argument,
/// reads after the access pass the value read as the return value.
pub fn field(
    inj: &mut MethodInjector,
    probe: &ProbeDescriptor,
    node: usize,
    field: &FieldRef,
    is_static: bool,
) -> Result<(), InjectError> {
    let kind = probe.location.kind;
    let site = inj.site(node)?;
    let frame = inj.frame(node)?;
    let this = inj.this_value(frame);
    let is_get = kind == Kind::FieldGet;

    // Receiver below the value written (if any)
    let value_count = if is_get { 0 } else { 1 };
    let receiver = if !is_static && probe.wants(Binding::TargetInstance) {
        site.top(value_count + 1)?
            .first()
            .and_then(|value| stack::field_type(&value.vtype).ok())
    } else {
        None
    };
    let value = if !is_get && (probe.wants_args() || receiver.is_some()) {
        Some(field.descriptor.clone())
    } else {
        None
    };
    let captured_types: Vec<FieldType<BinaryName>> =
        receiver.iter().cloned().chain(value.iter().cloned()).collect();

    let name = String::from(field.name.as_str());
    let target_member = (
        name.clone(),
        format!("{}.{}", field.owner.java_name(), name),
    );
    let produced = if is_get {
        Some(field.descriptor.clone())
    } else {
        None
    };
    around(
        inj,
        probe,
        node,
        |emitter, scope| {
            let mut captured = if captured_types.is_empty() {
                vec![]
            } else {
                scope.capture(emitter, "fld", &captured_types)?
            };
            let written = if value.is_some() { captured.pop() } else { None };
            Ok(SiteValues {
                this,
                args: written.into_iter().collect(),
                target_member: Some(target_member),
                target_instance: captured.pop(),
                ..SiteValues::default()
            })
        },
        produced,
    )
}

/// `ArrayGet` and `ArraySet`, passing the array, the index, and the value stored
pub fn array(inj: &mut MethodInjector, probe: &ProbeDescriptor, node: usize, store: bool) -> Result<(), InjectError> {
    let site = inj.site(node)?;
    let frame = inj.frame(node)?;
    let this = inj.this_value(frame);
    let operands = if store { 3 } else { 2 };
    let captured_types = if probe.wants_args() {
        site.top_types(operands)?
    } else {
        vec![]
    };

    let produced = if store {
        None
    } else {
        let array_type = site.top(2)?.first().and_then(|value| stack::ref_type(&value.vtype));
        let from_array = array_type.and_then(|array_type| array_type.element_type());
        match (&inj.code.nodes[node], from_array) {
            (_, Some(element)) => Some(element),
            (Node::Insn(insn), None) => loaded_type(insn),
            _ => None,
        }
    };
    around(
        inj,
        probe,
        node,
        |emitter, scope| {
            let args = if captured_types.is_empty() {
                vec![]
            } else {
                scope.capture(emitter, "arr", &captured_types)?
            };
            Ok(SiteValues {
                this,
                args,
                ..SiteValues::default()
            })
        },
        produced,
    )
}

/// Type of the element an array load produces, when the array's own type says nothing
fn loaded_type(insn: &Instruction) -> Option<FieldType<BinaryName>> {
    match insn {
        Instruction::IALoad => Some(FieldType::int()),
        Instruction::LALoad => Some(FieldType::long()),
        Instruction::FALoad => Some(FieldType::float()),
        Instruction::DALoad => Some(FieldType::double()),
        Instruction::AALoad => Some(FieldType::object(BinaryName::OBJECT)),
        Instruction::BALoad => Some(FieldType::byte()),
        Instruction::CALoad => Some(FieldType::char()),
        Instruction::SALoad => Some(FieldType::short()),
        _ => None,
    }
}

/// `Call`: around a method call, passing its arguments
///
/// The receiver is only available once initialized (never for constructor calls). After the
/// call, the handler also gets the value returned and the time spent in the call.
pub fn call(
    inj: &mut MethodInjector,
    probe: &ProbeDescriptor,
    node: usize,
    method: &MethodRef,
    invoke: InvokeType,
) -> Result<(), InjectError> {
    let site = inj.site(node)?;
    let frame = inj.frame(node)?;
    let this = inj.this_value(frame);
    let parameters = &method.descriptor.parameters;
    let count = parameters.len();

    let receiver = if invoke != InvokeType::Static && probe.wants(Binding::TargetInstance) {
        site.top(count + 1)?
            .first()
            .and_then(|value| stack::field_type(&value.vtype).ok())
    } else {
        None
    };
    let arguments = if probe.wants_args() || receiver.is_some() {
        capture_types(site.top_types(count)?, parameters)
    } else {
        vec![]
    };
    let captured_types: Vec<FieldType<BinaryName>> =
        receiver.iter().cloned().chain(arguments).collect();
    let has_receiver = receiver.is_some();

    let name = String::from(method.name.as_str());
    let target_member = (
        name.clone(),
        format!(
            "{}.{}{}",
            method.owner.java_name(),
            name,
            method.descriptor.render()
        ),
    );
    let timed = probe.location.point == Where::After && probe.wants_duration();
    around(
        inj,
        probe,
        node,
        |emitter, scope| {
            let mut args = if captured_types.is_empty() {
                vec![]
            } else {
                scope.capture(emitter, "arg", &captured_types)?
            };
            let target_instance: Option<Value> = if has_receiver {
                Some(args.remove(0))
            } else {
                None
            };
            let timer = if timed {
                Some(scope.site_timer(emitter, probe)?)
            } else {
                None
            };
            Ok(SiteValues {
                this,
                args,
                target_member: Some(target_member),
                target_instance,
                timer,
                ..SiteValues::default()
            })
        },
        method.descriptor.return_type.clone(),
    )
}
