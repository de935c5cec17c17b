//! Method boundaries: entry, normal returns, and exceptions propagating out

use super::{caught_exception, rethrowing_handler};
use crate::instrument::args::SiteValues;
use crate::instrument::errors::{InjectError, MethodError};
use crate::instrument::inject::{BodyStart, MethodInjector};
use crate::instrument::probe::{Binding, Kind, ProbeDescriptor};
use crate::instrument::rewrite::HandlerTier;

/// `Entry`: call the handler at the start of the body with the method's parameters
pub fn entry(inj: &mut MethodInjector, probe: &ProbeDescriptor) -> Result<(), InjectError> {
    // In constructors, `this` is only usable once the other constructor has returned
    let frame = match inj.body_start()? {
        BodyStart::MethodStart => inj.frame(0)?,
        BodyStart::AfterConstructorCall(node) => inj.frame(node + 1)?,
    };
    let values = SiteValues {
        this: inj.this_value(frame),
        args: if probe.wants_args() {
            inj.parameter_values(frame)?
        } else {
            vec![]
        },
        ..SiteValues::default()
    };
    let (nodes, ()) = inj.build(|emitter, scope| scope.call(emitter, probe, &values))?;
    inj.insert_at_body_start(nodes)?;
    Ok(())
}

/// `Return`: call the handler right before a return instruction
pub fn exit(inj: &mut MethodInjector, probe: &ProbeDescriptor, node: usize) -> Result<(), InjectError> {
    let frame = inj.frame(node)?;
    let this = inj.this_value(frame);
    let args = if probe.wants_args() {
        inj.parameter_values(frame)?
    } else {
        vec![]
    };
    let timer = if probe.wants_duration() {
        Some(inj.method_timer(probe)?)
    } else {
        None
    };
    let return_type = inj
        .method
        .descriptor
        .return_type
        .clone()
        .filter(|_| probe.wants(Binding::Return));

    let values = SiteValues {
        this,
        args,
        timer,
        ..SiteValues::default()
    };
    let (nodes, ()) = inj.build(|emitter, scope| {
        scope.call_capturing(emitter, probe, values, |emitter, scope, values| {
            if let Some(return_type) = return_type {
                values.return_value = scope.capture(emitter, "ret", &[return_type])?.pop();
            }
            Ok(())
        })
    })?;
    inj.rewrite.insert_before(node, nodes);
    Ok(())
}

/// `Error`: one handler over the whole body, shared by every `Error` probe
///
/// The exception is the only positional argument.
pub fn error_handler(inj: &mut MethodInjector, probes: &[&ProbeDescriptor]) -> Result<(), MethodError> {
    let error_probes: Vec<&ProbeDescriptor> = probes
        .iter()
        .copied()
        .filter(|probe| probe.location.kind == Kind::Error)
        .collect();
    if error_probes.is_empty() {
        return Ok(());
    }

    let start = match inj.body_start_label() {
        Ok(start) => start,
        Err(err) => {
            for probe in error_probes {
                inj.record(probe, None, Err(InjectError::Site(err.clone())))?;
            }
            return Ok(());
        }
    };
    let exception = caught_exception(inj.exception_slot()?);
    let this = inj.handler_this_value();

    let mut with_values = Vec::with_capacity(error_probes.len());
    for probe in error_probes {
        let timer = if probe.wants_duration() {
            Some(inj.method_timer(probe)?)
        } else {
            None
        };
        let values = SiteValues {
            this: this.clone(),
            args: vec![exception.clone()],
            timer,
            ..SiteValues::default()
        };
        with_values.push((probe, values));
    }
    rethrowing_handler(inj, HandlerTier::Error, start, None, None, with_values)?;
    Ok(())
}
