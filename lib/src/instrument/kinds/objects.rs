//! Allocations of objects and arrays
//!
//! An object only exists as a value once its constructor has run, so `New` sites firing after
//! the allocation are anchored at the constructor call rather than at the `new` instruction.

use super::{array_element, insert_around, Anchor};
use crate::instrument::args::{SiteValues, Value};
use crate::instrument::errors::InjectError;
use crate::instrument::inject::MethodInjector;
use crate::instrument::probe::{Binding, ProbeDescriptor, Where};
use crate::instrument::stack;
use crate::jvm::class_file::{ConstantsPool, MethodRef};
use crate::jvm::code::{Instruction, Node};
use crate::jvm::verifier::VType;
use crate::jvm::{BinaryName, Error, FieldType, JavaName, RefType, UnqualifiedName};

/// Constructor call initializing an object allocated with `new` in this method
pub fn construction_anchor(
    inj: &MethodInjector,
    probe: &ProbeDescriptor,
    node: usize,
    method: MethodRef,
) -> Option<Anchor> {
    if method.name != UnqualifiedName::INIT {
        return None;
    }
    let frame = inj.analysis.frame(node)?;
    let arguments = method.descriptor.parameters.len();
    let depth = frame.stack.len().checked_sub(arguments + 1)?;
    let new_node = match frame.stack[depth].vtype {
        VType::Uninitialized(new_node) => new_node,
        _ => return None,
    };
    let class = match inj.code.nodes.get(new_node) {
        Some(Node::Insn(Instruction::New(class))) => inj.constants.class_name(*class).ok()?,
        _ => return None,
    };
    if probe
        .location
        .class
        .matches_type(&RefType::Object(class.clone()), inj.ctx.hierarchy)
    {
        Some(Anchor::Construction {
            class,
            new_node,
            arguments,
        })
    } else {
        None
    }
}

/// Array type created by an instruction, along with the number of dimensions it allocates
pub fn created_array(
    insn: &Instruction,
    constants: &ConstantsPool,
) -> Result<Option<(RefType<BinaryName>, u8)>, Error> {
    let created = match insn {
        Instruction::NewArray(base_type) => (RefType::array(FieldType::Base(*base_type)), 1),
        Instruction::ANewArray(class) => (RefType::array(FieldType::Ref(constants.class(*class)?)), 1),
        Instruction::MultiANewArray(class, dimensions) => (constants.class(*class)?, *dimensions),
        _ => return Ok(None),
    };
    Ok(Some(created))
}

/// `New` before the allocation, with the name of the class allocated
pub fn allocation(
    inj: &mut MethodInjector,
    probe: &ProbeDescriptor,
    node: usize,
    class: &BinaryName,
) -> Result<(), InjectError> {
    let frame = inj.frame(node)?;
    let values = SiteValues {
        this: inj.this_value(frame),
        args: vec![Value::Str(class.java_name())],
        ..SiteValues::default()
    };
    let (nodes, ()) = inj.build(|emitter, scope| scope.call(emitter, probe, &values))?;
    inj.rewrite.insert_before(node, nodes);
    Ok(())
}

/// `New` after the constructor call, also passing the new object when it is left on the stack
///
/// That is the usual `new; dup; <arguments>; invokespecial <init>` shape. Objects allocated
/// some other way have no usable return value.
pub fn construction(
    inj: &mut MethodInjector,
    probe: &ProbeDescriptor,
    node: usize,
    class: &BinaryName,
    new_node: usize,
    arguments: usize,
) -> Result<(), InjectError> {
    let site = inj.site(node)?;
    let frame = inj.frame(node)?;
    let this = inj.this_value(frame);
    let left_on_stack = site
        .stack
        .len()
        .checked_sub(arguments + 2)
        .map_or(false, |below| stack::is_allocated_by(&site.stack[below], new_node));
    let capture = left_on_stack && probe.wants(Binding::Return);

    let values = SiteValues {
        this,
        args: vec![Value::Str(class.java_name())],
        ..SiteValues::default()
    };
    let (nodes, ()) = inj.build(|emitter, scope| {
        scope.call_capturing(emitter, probe, values, |emitter, scope, values| {
            if capture {
                let created = FieldType::object(class.clone());
                values.return_value = scope.capture(emitter, "new", &[created])?.pop();
            }
            Ok(())
        })
    })?;
    inj.rewrite.insert_after(node, nodes);
    Ok(())
}

/// `NewArray`, passing the element type name and the number of dimensions allocated
pub fn new_array(
    inj: &mut MethodInjector,
    probe: &ProbeDescriptor,
    node: usize,
    created: &RefType<BinaryName>,
    dimensions: u8,
) -> Result<(), InjectError> {
    let frame = inj.frame(node)?;
    let this = inj.this_value(frame);
    let args = vec![
        Value::Str(array_element(created, dimensions).java_name()),
        Value::Int(i32::from(dimensions)),
    ];
    let point = probe.location.point;
    let capture = point == Where::After && probe.wants(Binding::Return);

    let values = SiteValues {
        this,
        args,
        ..SiteValues::default()
    };
    let (nodes, ()) = inj.build(|emitter, scope| {
        scope.call_capturing(emitter, probe, values, |emitter, scope, values| {
            if capture {
                let array = FieldType::Ref(created.clone());
                values.return_value = scope.capture(emitter, "arr", &[array])?.pop();
            }
            Ok(())
        })
    })?;
    match point {
        Where::Before => insert_around(inj, node, nodes, vec![]),
        Where::After => insert_around(inj, node, vec![], nodes),
    }
    Ok(())
}
