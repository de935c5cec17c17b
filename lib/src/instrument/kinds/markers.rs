//! Sites marking a point in the body without touching any value there but the exception:
//! throws, exception handlers, source lines, and type checks

use super::{insert_around, Anchor};
use crate::instrument::args::{SiteValues, Value};
use crate::instrument::errors::{InjectError, MethodError};
use crate::instrument::inject::MethodInjector;
use crate::instrument::probe::{ProbeDescriptor, Where};
use crate::jvm::code::Node;
use crate::jvm::{BinaryName, JavaName, RefType};
use std::collections::HashSet;

/// Handlers of the original exception table catching a type the probe is after
///
/// Catch-all entries (`finally` blocks and the like) are not sites.
pub fn catch_anchors(inj: &MethodInjector, probe: &ProbeDescriptor) -> Result<Vec<(usize, Anchor)>, MethodError> {
    let positions = inj.code.label_positions();
    let mut seen = HashSet::new();
    let mut found = vec![];
    for try_catch in &inj.code.try_catches {
        let catch_type = match try_catch.catch_type {
            Some(catch_type) => catch_type,
            None => continue,
        };
        let caught = inj.constants.class(catch_type)?;
        if !probe.location.class.matches_type(&caught, inj.ctx.hierarchy) {
            continue;
        }
        if let Some(node) = positions.get(&try_catch.handler).copied() {
            if inj.analysis.is_reachable(node) && seen.insert(node) {
                found.push((node, Anchor::Catch));
            }
        }
    }
    found.sort_by_key(|(node, _)| *node);
    Ok(found)
}

/// Call a probe taking the exception on top of the stack
fn with_exception(
    inj: &mut MethodInjector,
    probe: &ProbeDescriptor,
    node: usize,
) -> Result<Vec<Node>, InjectError> {
    let frame = inj.frame(node)?;
    let this = inj.this_value(frame);
    let exception_type = if probe.wants_args() {
        Some(inj.site(node)?.top_types(1)?)
    } else {
        None
    };
    let values = SiteValues {
        this,
        ..SiteValues::default()
    };
    let (nodes, ()) = inj.build(|emitter, scope| {
        scope.call_capturing(emitter, probe, values, |emitter, scope, values| {
            if let Some(exception_type) = exception_type {
                values.args = scope.capture(emitter, "exc", &exception_type)?;
            }
            Ok(())
        })
    })?;
    Ok(nodes)
}

/// `Throw`: before `athrow`, with the exception about to be thrown
pub fn throw(inj: &mut MethodInjector, probe: &ProbeDescriptor, node: usize) -> Result<(), InjectError> {
    let nodes = with_exception(inj, probe, node)?;
    inj.rewrite.insert_before(node, nodes);
    Ok(())
}

/// `Catch`: at the start of the handler, with the exception caught
pub fn catch(inj: &mut MethodInjector, probe: &ProbeDescriptor, node: usize) -> Result<(), InjectError> {
    let nodes = with_exception(inj, probe, node)?;
    inj.rewrite.insert_after(node, nodes);
    Ok(())
}

/// `Line`: at a line marker, with the line number
///
/// Sites for the end of a line sit in front of the marker starting the next line, so they run
/// before any site for the start of that next line.
pub fn line(inj: &mut MethodInjector, probe: &ProbeDescriptor, node: usize, line: u16) -> Result<(), InjectError> {
    let frame = inj.frame(node)?;
    let values = SiteValues {
        this: inj.this_value(frame),
        args: vec![Value::Int(i32::from(line))],
        ..SiteValues::default()
    };
    let (nodes, ()) = inj.build(|emitter, scope| scope.call(emitter, probe, &values))?;
    match probe.location.point {
        Where::Before => inj.rewrite.insert_after(node, nodes),
        Where::After => inj.rewrite.insert_before(node, nodes),
    }
    Ok(())
}

/// `CheckCast` and `InstanceOf`: around the check, with the name of the type checked against
pub fn type_check(
    inj: &mut MethodInjector,
    probe: &ProbeDescriptor,
    node: usize,
    checked: &RefType<BinaryName>,
) -> Result<(), InjectError> {
    let frame = inj.frame(node)?;
    let values = SiteValues {
        this: inj.this_value(frame),
        args: vec![Value::Str(checked.java_name())],
        ..SiteValues::default()
    };
    let (nodes, ()) = inj.build(|emitter, scope| scope.call(emitter, probe, &values))?;
    match probe.location.point {
        Where::Before => insert_around(inj, node, nodes, vec![]),
        Where::After => insert_around(inj, node, vec![], nodes),
    }
    Ok(())
}
