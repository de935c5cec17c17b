use super::args::{self, is_int_like, MethodNames, SiteValues, Value};
use super::emit::Emitter;
use super::errors::{InjectError, MethodError, SiteError};
use super::gates::{Timer, TimerKey};
use super::model::MethodModel;
use super::probe::{Kind, ProbeDescriptor, Where};
use super::rewrite::MethodRewrite;
use super::slots::SlotAllocator;
use super::stack::{self, InjectionSite};
use super::InjectionContext;
use crate::jvm::class_file::ConstantsPool;
use crate::jvm::code::{
    Code, Instruction, InvokeType, LabelGenerator, LocalVariable, Node, SynLabel, SynLabelGenerator,
};
use crate::jvm::verifier::{Analysis, VType, VerifierFrame};
use crate::jvm::{BaseType, BinaryName, FieldType, Name, RenderDescriptor, UnqualifiedName};
use crate::util::Width;
use std::collections::HashMap;

/// Outcome of one site, for diagnostics
#[derive(Debug)]
pub struct SiteReport {
    pub kind: Kind,
    pub point: Where,

    /// Node of the original body the site is anchored at (`None` for whole-method handlers)
    pub node: Option<usize>,

    pub handler: String,

    /// Why the site was skipped, if it was
    pub skipped: Option<SiteError>,
}

/// Where code running "at the start of the method" goes
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BodyStart {
    /// Before the first node
    MethodStart,

    /// After the node calling the superclass (or another) constructor on `this`
    AfterConstructorCall(usize),
}

/// State for rewriting one method
///
/// Sites get injected one at a time. Sites anchored at the same node must be injected one after
/// the other (see [`MethodInjector::begin_node`]) since they share the lifetime of their
/// captured values.
pub struct MethodInjector<'a> {
    pub ctx: &'a InjectionContext<'a>,
    pub method: &'a MethodModel,
    pub code: &'a Code,
    pub analysis: &'a Analysis,
    pub constants: &'a mut ConstantsPool,
    pub labels: SynLabelGenerator,
    pub slots: SlotAllocator,
    pub rewrite: MethodRewrite,
    pub names: MethodNames,
    pub reports: Vec<SiteReport>,
    timers: HashMap<TimerKey, Timer>,
    body_start: Result<BodyStart, SiteError>,
    body_start_label: Option<SynLabel>,
    exception_slot: Option<u16>,
    group: Option<usize>,
}

impl<'a> MethodInjector<'a> {
    pub fn new(
        ctx: &'a InjectionContext<'a>,
        method: &'a MethodModel,
        code: &'a Code,
        analysis: &'a Analysis,
        constants: &'a mut ConstantsPool,
    ) -> MethodInjector<'a> {
        let first_free = analysis.max_locals.max(code.max_locals as usize);
        let class = ctx.class_name.to_java_name();
        let names = MethodNames {
            qualified_method: format!("{}.{}", class, method.signature()),
            method: String::from(method.name.as_str()),
            class,
        };
        let body_start = find_body_start(ctx, method, code, analysis, constants);
        MethodInjector {
            ctx,
            method,
            code,
            analysis,
            constants,
            labels: code.labels.clone(),
            slots: SlotAllocator::new(first_free),
            rewrite: MethodRewrite::default(),
            names,
            reports: vec![],
            timers: HashMap::new(),
            body_start,
            body_start_label: None,
            exception_slot: None,
            group: None,
        }
    }

    pub fn this_class(&self) -> &BinaryName {
        &self.ctx.class_name
    }

    /// Stack and locals on entry to an original node
    pub fn frame(&self, node: usize) -> Result<&'a VerifierFrame, SiteError> {
        self.analysis
            .frame(node)
            .ok_or_else(|| SiteError::StackShape(format!("node {} is unreachable", node)))
    }

    /// Snapshot of the stack at an original node
    pub fn site(&self, node: usize) -> Result<InjectionSite, SiteError> {
        InjectionSite::at(self.analysis, node)
    }

    pub fn body_start(&self) -> Result<BodyStart, SiteError> {
        self.body_start.clone()
    }

    /// Record code to run at the start of the method body
    pub fn insert_at_body_start(&mut self, nodes: Vec<Node>) -> Result<(), SiteError> {
        match self.body_start()? {
            BodyStart::MethodStart => self.rewrite.insert_before(0, nodes),
            BodyStart::AfterConstructorCall(node) => self.rewrite.insert_after(node, nodes),
        }
        Ok(())
    }

    /// Label at the start of the method body, which whole-body handler ranges start from
    pub fn body_start_label(&mut self) -> Result<SynLabel, SiteError> {
        if let Some(label) = self.body_start_label {
            return Ok(label);
        }
        let label = self.fresh_label();
        match self.body_start()? {
            BodyStart::MethodStart => self.rewrite.label_before(0, label),
            BodyStart::AfterConstructorCall(node) => self.rewrite.label_after(node, label),
        }
        self.body_start_label = Some(label);
        Ok(label)
    }

    pub fn fresh_label(&mut self) -> SynLabel {
        self.labels.fresh_label()
    }

    /// `this`, if it is an initialized object in the frame
    pub fn this_value(&self, frame: &VerifierFrame) -> Option<Value> {
        if self.method.is_static() {
            return None;
        }
        match frame.local(0) {
            Some(VType::Object(_)) => Some(Value::local(0, FieldType::object(self.this_class().clone()))),
            _ => None,
        }
    }

    /// `this` inside a whole-body handler (where the constructor call has always happened)
    pub fn handler_this_value(&self) -> Option<Value> {
        if self.method.is_static() {
            None
        } else {
            Some(Value::local(0, FieldType::object(self.this_class().clone())))
        }
    }

    /// Method parameters as they are in the locals of a frame
    pub fn parameter_values(&self, frame: &VerifierFrame) -> Result<Vec<Value>, SiteError> {
        let mut slot: usize = if self.method.is_static() { 0 } else { 1 };
        let mut values = vec![];
        for parameter in &self.method.descriptor.parameters {
            let current = match frame.local(slot as u16) {
                Some(vtype) => Some(stack::field_type(vtype)?),
                None => None,
            };
            // Primitives keep their declared type (the frame only knows `int`)
            let field_type = match (current, parameter) {
                (Some(FieldType::Base(BaseType::Int)), FieldType::Base(declared)) if is_int_like(*declared) => {
                    parameter.clone()
                }
                (Some(FieldType::Base(current)), FieldType::Base(declared)) if current == *declared => {
                    parameter.clone()
                }
                (Some(current @ FieldType::Ref(_)), FieldType::Ref(_)) => current,
                _ => {
                    return Err(SiteError::StackShape(format!(
                        "parameter in slot {} has been overwritten",
                        slot
                    )))
                }
            };
            values.push(Value::local(slot as u16, field_type));
            slot += parameter.width();
        }
        Ok(values)
    }

    /// Timer for a duration probe, started at the beginning of the method
    pub fn method_timer(&mut self, probe: &ProbeDescriptor) -> Result<Timer, MethodError> {
        let key = TimerKey::of(probe);
        if let Some(timer) = self.timers.get(&key) {
            return Ok(timer.clone());
        }
        let timer = Timer {
            key: key.clone(),
            slot: self.slots.method_slot("ts", &FieldType::long())?,
        };
        let mut emitter = Emitter::new(&mut *self.constants, &mut self.labels, self.ctx.version);
        timer.emit_start(&mut emitter, &self.ctx.level, &self.ctx.sampling)?;
        let nodes = emitter.into_nodes();
        self.rewrite.prepend(nodes);
        self.timers.insert(key, timer.clone());
        Ok(timer)
    }

    /// Slot the appended handlers keep the caught exception in while calling their probes
    pub fn exception_slot(&mut self) -> Result<u16, MethodError> {
        if let Some(slot) = self.exception_slot {
            return Ok(slot);
        }
        let slot = self
            .slots
            .method_slot("exc", &FieldType::object(BinaryName::THROWABLE))?;
        self.exception_slot = Some(slot);
        Ok(slot)
    }

    /// Build a chunk of code
    ///
    /// The closure gets the emitter along with what it needs to capture values and call
    /// handlers. Whatever it returns is handed back with the finished nodes.
    pub fn build<T>(
        &mut self,
        build: impl FnOnce(&mut Emitter, &mut Scope) -> Result<T, InjectError>,
    ) -> Result<(Vec<Node>, T), InjectError> {
        let mut emitter = Emitter::new(&mut *self.constants, &mut self.labels, self.ctx.version);
        let mut scope = Scope {
            ctx: self.ctx,
            slots: &mut self.slots,
            names: &self.names,
        };
        let result = build(&mut emitter, &mut scope)?;
        Ok((emitter.into_nodes(), result))
    }

    /// Start a group of sites anchored at a node
    ///
    /// Site slots of the previous group are released, so later groups can reuse them.
    pub fn begin_node(&mut self, node: usize) {
        if self.group != Some(node) {
            self.close_group();
            self.group = Some(node);
        }
    }

    fn close_group(&mut self) {
        if let Some(node) = self.group.take() {
            if self.slots.has_site_slots() {
                let start = self.fresh_label();
                let end = self.fresh_label();
                self.rewrite.label_before(node, start);
                self.rewrite.label_after(node, end);
                self.slots.release_site_slots(start, end);
            }
        }
    }

    /// Record the outcome of a site
    ///
    /// Site errors only skip the site. Anything else gives up on the whole method.
    pub fn record(
        &mut self,
        probe: &ProbeDescriptor,
        node: Option<usize>,
        result: Result<(), InjectError>,
    ) -> Result<(), MethodError> {
        let skipped = match result {
            Ok(()) => None,
            Err(InjectError::Site(err)) => {
                log::debug!(
                    "Skipping {:?} site of {} in {}: {:?}",
                    probe.location.kind,
                    probe.handler_name(),
                    self.names.qualified_method,
                    err
                );
                Some(err)
            }
            Err(InjectError::Method(err)) => return Err(err),
        };
        self.reports.push(SiteReport {
            kind: probe.location.kind,
            point: probe.location.point,
            node,
            handler: probe.handler_name(),
            skipped,
        });
        Ok(())
    }

    /// Has any site been injected?
    pub fn has_changes(&self) -> bool {
        !self.rewrite.is_empty()
    }

    /// Build the rewritten body
    pub fn finish(mut self) -> Result<(Code, Vec<SiteReport>), MethodError> {
        self.close_group();

        let start = self.fresh_label();
        let end = self.fresh_label();
        self.rewrite.label_method(start, end);

        let with_debug_info =
            self.ctx.settings.emit_local_variable_entries && !self.code.local_variables.is_empty();
        let (max_locals, locals) = self.slots.finish(start, end);
        if with_debug_info {
            for local in locals {
                let name = self.constants.get_utf8(local.name.as_str()).map_err(crate::jvm::Error::from)?;
                let descriptor = self
                    .constants
                    .get_utf8(local.field_type.render())
                    .map_err(crate::jvm::Error::from)?;
                self.rewrite.add_local_variable(LocalVariable {
                    start: local.start,
                    end: local.end,
                    name,
                    descriptor,
                    index: local.slot,
                });
            }
        }

        let mut code = self.code.clone();
        code.labels = self.labels;
        code.max_locals = u16::try_from(max_locals).map_err(|_| MethodError::SlotOverflow)?;
        self.rewrite.apply(&mut code);
        Ok((code, self.reports))
    }
}

/// What chunk builders get to use besides the emitter
pub struct Scope<'s> {
    pub ctx: &'s InjectionContext<'s>,
    pub slots: &'s mut SlotAllocator,
    names: &'s MethodNames,
}

impl<'s> Scope<'s> {
    /// Emit the gated call to a probe's handler
    pub fn call(&mut self, emitter: &mut Emitter, probe: &ProbeDescriptor, values: &SiteValues) -> Result<(), InjectError> {
        self.call_capturing(emitter, probe, values.clone(), |_, _, _| Ok(()))
    }

    /// Emit a probe's region, `[level gate] [sampling gate] <captures> <call> join:`
    ///
    /// `capture` runs past the gates: values it copies off the stack are only copied when the
    /// handler gets called, and the stack is back as it was at the join.
    pub fn call_capturing(
        &mut self,
        emitter: &mut Emitter,
        probe: &ProbeDescriptor,
        mut values: SiteValues,
        capture: impl FnOnce(&mut Emitter, &mut Scope, &mut SiteValues) -> Result<(), InjectError>,
    ) -> Result<(), InjectError> {
        let ctx = self.ctx;
        let join = args::emit_gates(ctx, emitter, probe, &values)?;
        capture(emitter, self, &mut values)?;
        args::emit_handler_call(ctx, emitter, probe, &values, self.names)?;
        emitter.place_label(join);
        Ok(())
    }

    /// Copy the top of the stack into site slots
    pub fn capture(
        &mut self,
        emitter: &mut Emitter,
        purpose: &str,
        types: &[FieldType<BinaryName>],
    ) -> Result<Vec<Value>, InjectError> {
        Ok(args::capture_top(emitter, self.slots, purpose, types)?)
    }

    /// Timer local to one site, started here
    pub fn site_timer(&mut self, emitter: &mut Emitter, probe: &ProbeDescriptor) -> Result<Timer, InjectError> {
        let timer = Timer {
            key: TimerKey::of(probe),
            slot: self.slots.site_slot("callts", &FieldType::long())?,
        };
        timer.emit_start(emitter, &self.ctx.level, &self.ctx.sampling)?;
        Ok(timer)
    }
}

/// Find where the method body proper starts
///
/// In constructors this is right after `this` gets initialized by a call to another
/// constructor. Constructors where that call can't be pinned down to one node have no usable
/// body start.
fn find_body_start(
    ctx: &InjectionContext,
    method: &MethodModel,
    code: &Code,
    analysis: &Analysis,
    constants: &ConstantsPool,
) -> Result<BodyStart, SiteError> {
    if !method.is_constructor() || ctx.class_name == BinaryName::OBJECT {
        return Ok(BodyStart::MethodStart);
    }

    let mut calls = vec![];
    for (idx, node) in code.nodes.iter().enumerate() {
        let method_ref = match node {
            Node::Insn(Instruction::Invoke(InvokeType::Special, method_ref)) => method_ref,
            _ => continue,
        };
        let method_ref = match constants.method_ref(*method_ref) {
            Ok(method_ref) if method_ref.name == UnqualifiedName::INIT => method_ref,
            _ => continue,
        };
        let frame = match analysis.frame(idx) {
            Some(frame) => frame,
            None => continue,
        };
        let depth = method_ref.descriptor.parameters.len() + 1;
        if frame.stack.len() >= depth
            && frame.stack[frame.stack.len() - depth].vtype == VType::UninitializedThis
        {
            calls.push(idx);
        }
    }

    match calls.as_slice() {
        [node] => Ok(BodyStart::AfterConstructorCall(*node)),
        [] => Err(SiteError::Unsupported(String::from(
            "constructor never initializes 'this'",
        ))),
        _ => Err(SiteError::Unsupported(String::from(
            "constructor initializes 'this' in more than one place",
        ))),
    }
}
