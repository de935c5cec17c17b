//! Synchronized code
//!
//! `SyncEntry` and `SyncExit` fire around `monitorenter`/`monitorexit`, and at the start and the
//! returns of `synchronized` methods. A monitor can also be released by an exception unwinding
//! through the synchronized region, which the probes must see too:
//!
//!   - javac routes every exceptional exit of a `synchronized` block through a catch-all handler
//!     doing its own `monitorexit`. That one is instrumented like any other exit, so nothing is
//!     added for regions which are protected by a catch-all.
//!
//!   - other exits get an extra `Throwable` handler over `[after monitorenter, before
//!     monitorexit)` calling the exit probes and rethrowing. The lock is kept in a local from
//!     just before the `monitorenter`, since the handler can't get it from the stack.
//!
//!   - `synchronized` methods get one `Throwable` handler over the whole body.

use super::args::{SiteValues, Value};
use super::errors::{InjectError, MethodError, SiteError};
use super::inject::MethodInjector;
use super::kinds::{around, rethrowing_handler};
use super::probe::{Kind, ProbeDescriptor};
use super::rewrite::HandlerTier;
use super::stack;
use crate::jvm::code::{Code, Instruction, Node, SynLabel};
use crate::jvm::{FieldType, RefType};
use std::collections::HashMap;

/// Lock of a `synchronized` method: `this`, or the class for static methods
fn method_lock(inj: &MethodInjector) -> Value {
    if inj.method.is_static() {
        Value::Class(RefType::Object(inj.this_class().clone()))
    } else {
        Value::local(0, FieldType::object(inj.this_class().clone()))
    }
}

/// `SyncEntry` at the start of a `synchronized` method
pub fn method_entry(inj: &mut MethodInjector, probe: &ProbeDescriptor) -> Result<(), InjectError> {
    let frame = inj.frame(0)?;
    let values = SiteValues {
        this: inj.this_value(frame),
        args: vec![method_lock(inj)],
        ..SiteValues::default()
    };
    let (nodes, ()) = inj.build(|emitter, scope| scope.call(emitter, probe, &values))?;
    inj.insert_at_body_start(nodes)?;
    Ok(())
}

/// `SyncExit` before a return from a `synchronized` method
pub fn method_exit(inj: &mut MethodInjector, probe: &ProbeDescriptor, node: usize) -> Result<(), InjectError> {
    let frame = inj.frame(node)?;
    let values = SiteValues {
        this: inj.this_value(frame),
        args: vec![method_lock(inj)],
        ..SiteValues::default()
    };
    let (nodes, ()) = inj.build(|emitter, scope| scope.call(emitter, probe, &values))?;
    inj.rewrite.insert_before(node, nodes);
    Ok(())
}

/// `SyncEntry` or `SyncExit` at `monitorenter`/`monitorexit`, with the lock
pub fn monitor(inj: &mut MethodInjector, probe: &ProbeDescriptor, node: usize) -> Result<(), InjectError> {
    let site = inj.site(node)?;
    let frame = inj.frame(node)?;
    let this = inj.this_value(frame);
    let lock_type = if probe.wants_args() {
        site.top_types(1)?
    } else {
        vec![]
    };
    around(
        inj,
        probe,
        node,
        |emitter, scope| {
            let args = if lock_type.is_empty() {
                vec![]
            } else {
                scope.capture(emitter, "lock", &lock_type)?
            };
            Ok(SiteValues {
                this,
                args,
                ..SiteValues::default()
            })
        },
        None,
    )
}

/// One handler covering the whole body of a `synchronized` method, for its `SyncExit` probes
pub fn method_exit_handler(inj: &mut MethodInjector, probes: &[&ProbeDescriptor]) -> Result<(), MethodError> {
    if !inj.method.is_synchronized() {
        return Ok(());
    }
    let exit_probes = exit_probes(probes);
    if exit_probes.is_empty() {
        return Ok(());
    }
    let start = match inj.body_start_label() {
        Ok(start) => start,
        Err(err) => return skip_all(inj, &exit_probes, None, err),
    };
    let this = inj.handler_this_value();
    let lock = method_lock(inj);
    let with_values = exit_probes
        .into_iter()
        .map(|probe| {
            let values = SiteValues {
                this: this.clone(),
                args: vec![lock.clone()],
                ..SiteValues::default()
            };
            (probe, values)
        })
        .collect();
    rethrowing_handler(inj, HandlerTier::SynchronizedMethod, start, None, None, with_values)?;
    Ok(())
}

/// Handlers for `monitorexit`s which an exception could bypass
pub fn monitor_exit_handlers(inj: &mut MethodInjector, probes: &[&ProbeDescriptor]) -> Result<(), MethodError> {
    let exit_probes = exit_probes(probes);
    if exit_probes.is_empty() {
        return Ok(());
    }

    let unprotected: Vec<usize> = inj
        .code
        .nodes
        .iter()
        .enumerate()
        .filter(|(idx, node)| {
            **node == Node::Insn(Instruction::MonitorExit)
                && inj.analysis.is_reachable(*idx)
                && !protected_by_catch_all(inj.code, *idx)
        })
        .map(|(idx, _)| idx)
        .collect();

    // Lock holders, per `monitorenter`
    let mut holders: HashMap<usize, Value> = HashMap::new();
    for exit in unprotected {
        let enter = match matching_enter(inj, exit) {
            Some(enter) => enter,
            None => {
                let err = SiteError::Unsupported(String::from("no matching monitorenter"));
                skip_all(inj, &exit_probes, Some(exit), err)?;
                continue;
            }
        };

        let lock = match holders.get(&enter) {
            Some(lock) => lock.clone(),
            None => {
                let lock_type = inj
                    .frame(enter)
                    .and_then(|frame| match frame.stack.last() {
                        Some(value) => stack::field_type(&value.vtype),
                        None => Err(SiteError::StackShape(String::from("no lock on the stack"))),
                    });
                let lock_type = match lock_type {
                    Ok(lock_type) => lock_type,
                    Err(err) => {
                        skip_all(inj, &exit_probes, Some(exit), err)?;
                        continue;
                    }
                };
                let slot = inj.slots.method_slot("lock", &lock_type)?;
                Value::local(slot, lock_type)
            }
        };

        let this = inj.frame(exit).ok().and_then(|frame| inj.this_value(frame));
        let with_values = exit_probes
            .iter()
            .map(|probe| {
                let values = SiteValues {
                    this: this.clone(),
                    args: vec![lock.clone()],
                    ..SiteValues::default()
                };
                (*probe, values)
            })
            .collect();

        let start = inj.fresh_label();
        let end = inj.fresh_label();
        let added = rethrowing_handler(inj, HandlerTier::Monitor, start, Some(end), Some(exit), with_values)?;
        if added {
            if !holders.contains_key(&enter) {
                hold_lock(inj, enter, &lock);
                holders.insert(enter, lock);
            }
            inj.rewrite.label_after(enter, start);
            inj.rewrite.label_before(exit, end);
        }
    }
    Ok(())
}

fn exit_probes<'p>(probes: &[&'p ProbeDescriptor]) -> Vec<&'p ProbeDescriptor> {
    probes
        .iter()
        .copied()
        .filter(|probe| probe.location.kind == Kind::SyncExit)
        .collect()
}

fn skip_all(
    inj: &mut MethodInjector,
    probes: &[&ProbeDescriptor],
    node: Option<usize>,
    err: SiteError,
) -> Result<(), MethodError> {
    for probe in probes {
        inj.record(probe, node, Err(InjectError::Site(err.clone())))?;
    }
    Ok(())
}

/// Copy the lock into its holder right before the `monitorenter` consumes it
fn hold_lock(inj: &mut MethodInjector, enter: usize, lock: &Value) {
    if let Value::Local { slot, field_type } = lock {
        let store = match field_type {
            FieldType::Ref(_) => Instruction::AStore(*slot),
            FieldType::Base(_) => return,
        };
        inj.rewrite
            .insert_before(enter, vec![Node::Insn(Instruction::Dup), Node::Insn(store)]);
    }
}

/// Is the node inside the range of an exception handler catching everything?
fn protected_by_catch_all(code: &Code, node: usize) -> bool {
    let positions: HashMap<SynLabel, usize> = code.label_positions();
    code.try_catches
        .iter()
        .filter(|try_catch| try_catch.catch_type.is_none())
        .any(|try_catch| {
            match (positions.get(&try_catch.start), positions.get(&try_catch.end)) {
                (Some(start), Some(end)) => *start <= node && node < *end,
                _ => false,
            }
        })
}

/// `monitorenter` paired with a `monitorexit`, walking back over nested pairs
fn matching_enter(inj: &MethodInjector, exit: usize) -> Option<usize> {
    let mut depth = 0usize;
    for idx in (0..exit).rev() {
        if !inj.analysis.is_reachable(idx) {
            continue;
        }
        match inj.code.nodes[idx] {
            Node::Insn(Instruction::MonitorExit) => depth += 1,
            Node::Insn(Instruction::MonitorEnter) if depth == 0 => return Some(idx),
            Node::Insn(Instruction::MonitorEnter) => depth -= 1,
            _ => (),
        }
    }
    None
}
