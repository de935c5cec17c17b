use super::emit::Emitter;
use super::errors::{Error, MethodError};
use super::inject::{MethodInjector, SiteReport};
use super::kinds;
use super::matcher::{self, NamePattern};
use super::model::{ClassModel, MethodModel};
use super::probe::{ProbeDescriptor, Sampling};
use super::settings::Settings;
use super::InjectionContext;
use crate::jvm;
use crate::jvm::class_file::{self, ConstantsPool};
use crate::jvm::code::encode::encode;
use crate::jvm::code::{BranchInstruction, Code, Node, SynLabelGenerator};
use crate::jvm::hierarchy::ClassHierarchy;
use crate::jvm::verifier::{analyze, MethodContext};
use crate::jvm::{
    BinaryName, FieldType, JavaName, MethodAccessFlags, MethodDescriptor, RefType, UnqualifiedName,
};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Rewrites classes according to probe descriptors
///
/// The instrumentor holds no state besides its settings, so one instance can be shared by
/// every thread transforming classes.
pub struct Instrumentor {
    settings: Settings,
}

/// Result of transforming one class
#[derive(Debug)]
pub struct TransformOutcome {
    /// Rewritten class, or exactly the input bytes if nothing was (or could be) injected
    pub bytes: Vec<u8>,

    pub diagnostics: Diagnostics,
}

/// What happened while transforming a class
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub class_name: Option<BinaryName>,

    /// Why the class wasn't looked at, if it wasn't
    pub skipped: Option<ClassSkip>,

    /// Methods selected by at least one probe
    pub methods: Vec<MethodDiagnostics>,

    /// Sampling counters the injected code uses, which the tracker should know about
    pub samplers: Vec<SamplerRegistration>,

    /// Trace classes whose `retransform` registration was added to `<clinit>`
    pub registrations: Vec<BinaryName>,

    pub verification: Verification,
}

impl Diagnostics {
    /// Sites where a handler call was injected
    pub fn injected_sites(&self) -> impl Iterator<Item = &SiteReport> {
        self.methods
            .iter()
            .flat_map(|method| method.sites.iter())
            .filter(|site| site.skipped.is_none())
    }

    /// Sites which were matched but left alone
    pub fn skipped_sites(&self) -> impl Iterator<Item = &SiteReport> {
        self.methods
            .iter()
            .flat_map(|method| method.sites.iter())
            .filter(|site| site.skipped.is_some())
    }

    pub fn is_reverted(&self) -> bool {
        matches!(self.verification, Verification::Reverted(_))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClassSkip {
    Interface,

    /// Class the tracing machinery itself depends on
    Sensitive,

    NoMatchingProbe,

    /// Every matching probe comes from a trace already applied to the class
    AlreadyApplied,
}

#[derive(Debug)]
pub struct MethodDiagnostics {
    /// Method name and descriptor, as in `name(I)V`
    pub method: String,
    pub sites: Vec<SiteReport>,
    pub outcome: MethodOutcome,
}

#[derive(Debug)]
pub enum MethodOutcome {
    Instrumented,

    /// Every site was skipped (or there were none)
    Unchanged,

    /// The method couldn't be rewritten and was kept as it was
    KeptOriginal(MethodError),
}

/// Sampling counter to register with the tracker before the class runs
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SamplerRegistration {
    pub id: i32,

    /// Mean number of hits per sample (starting rate, for adaptive counters)
    pub mean: u32,
    pub adaptive: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verification {
    /// Nothing was changed
    NotNeeded,

    /// The rewritten class was parsed and analyzed again, and type-checks
    Passed,

    /// Only the per-method checks done while encoding were run
    Unchecked,

    /// The rewritten class was thrown away, and the original returned
    Reverted(String),
}

impl Default for Verification {
    fn default() -> Verification {
        Verification::NotNeeded
    }
}

impl Default for Instrumentor {
    fn default() -> Instrumentor {
        Instrumentor {
            settings: Settings::default(),
        }
    }
}

impl Instrumentor {
    pub fn new(settings: Settings) -> Result<Instrumentor, Error> {
        settings.validate()?;
        Ok(Instrumentor { settings })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Transform one class
    ///
    /// Only bytes that aren't a class file at all (or probes which are inconsistent) are an
    /// error. Anything going wrong past that point leaves the class as it was and is reported
    /// in the diagnostics.
    pub fn transform(
        &self,
        bytes: &[u8],
        hierarchy: &dyn ClassHierarchy,
        probes: &[ProbeDescriptor],
    ) -> Result<TransformOutcome, Error> {
        for probe in probes {
            probe.validate()?;
        }
        let class = ClassModel::from_bytes(bytes)?;
        let class_name = class.name.clone();
        let mut diagnostics = Diagnostics {
            class_name: Some(class_name.clone()),
            ..Diagnostics::default()
        };

        let skip = if class.is_interface() {
            Some(ClassSkip::Interface)
        } else if matcher::is_sensitive_class(&class.name, &self.settings) {
            Some(ClassSkip::Sensitive)
        } else {
            None
        };
        if let Some(skip) = skip {
            log::debug!("Not instrumenting {}: {:?}", class_name.to_java_name(), skip);
            diagnostics.skipped = Some(skip);
            return Ok(unchanged(bytes, diagnostics));
        }

        let matching: Vec<&ProbeDescriptor> = probes
            .iter()
            .filter(|probe| matcher::class_matches(probe, &class, hierarchy))
            .collect();
        if matching.is_empty() {
            diagnostics.skipped = Some(ClassSkip::NoMatchingProbe);
            return Ok(unchanged(bytes, diagnostics));
        }
        let applied = class.applied_traces(&self.settings.applied_attribute_name)?;
        let active: Vec<&ProbeDescriptor> = matching
            .into_iter()
            .filter(|probe| !applied.contains(&probe.trace_class))
            .collect();
        if active.is_empty() {
            log::debug!(
                "Traces matching {} are already applied",
                class_name.to_java_name()
            );
            diagnostics.skipped = Some(ClassSkip::AlreadyApplied);
            return Ok(unchanged(bytes, diagnostics));
        }

        let rewritten = panic::catch_unwind(AssertUnwindSafe(|| {
            self.rewrite_class(class, hierarchy, &active, &applied, &mut diagnostics)
        }));
        let reason = match rewritten {
            Ok(Ok(Some(bytes))) => return Ok(TransformOutcome { bytes, diagnostics }),
            Ok(Ok(None)) => return Ok(unchanged(bytes, diagnostics)),
            Ok(Err(reason)) => reason,
            Err(payload) => format!("panic: {}", panic_message(payload)),
        };

        log::warn!("Reverting {}: {}", class_name.to_java_name(), reason);
        diagnostics.samplers.clear();
        diagnostics.registrations.clear();
        diagnostics.verification = Verification::Reverted(reason);
        Ok(unchanged(bytes, diagnostics))
    }

    /// Rewrite every selected method, returning `None` if nothing changed
    ///
    /// An error here is the reason to revert the whole class.
    fn rewrite_class(
        &self,
        mut class: ClassModel,
        hierarchy: &dyn ClassHierarchy,
        active: &[&ProbeDescriptor],
        applied: &[BinaryName],
        diagnostics: &mut Diagnostics,
    ) -> Result<Option<Vec<u8>>, String> {
        let ctx = InjectionContext {
            settings: &self.settings,
            level: self.settings.level_source(),
            sampling: self.settings.sampling_service(),
            hierarchy,
            version: class.class_file.version,
            class_name: class.name.clone(),
        };
        let java_name = class.name.to_java_name();

        let mut modified = vec![];
        for method_index in 0..class.methods.len() {
            let method = &class.methods[method_index];
            if let Err(ineligible) = matcher::check_eligible(method, &self.settings) {
                log::trace!("Skipping {}: {:?}", method.signature(), ineligible);
                continue;
            }
            let probes: Vec<&ProbeDescriptor> = active
                .iter()
                .copied()
                .filter(|probe| matcher::method_matches(probe, method, hierarchy))
                .collect();
            if probes.is_empty() {
                continue;
            }

            let signature = method.signature();
            let constants = &mut class.class_file.constants;
            match rewrite_method(&ctx, method, constants, &probes) {
                Ok((Some(code), sites)) => {
                    class.methods[method_index]
                        .set_code(code, &mut class.class_file.constants)
                        .map_err(|err| format!("cannot store {}: {:?}", signature, err))?;
                    log::info!(
                        "Instrumented {}.{} at {} sites",
                        java_name,
                        signature,
                        sites.iter().filter(|site| site.skipped.is_none()).count()
                    );
                    note_samplers(&mut diagnostics.samplers, &probes, &sites);
                    modified.push(method_index);
                    diagnostics.methods.push(MethodDiagnostics {
                        method: signature,
                        sites,
                        outcome: MethodOutcome::Instrumented,
                    });
                }
                Ok((None, sites)) => diagnostics.methods.push(MethodDiagnostics {
                    method: signature,
                    sites,
                    outcome: MethodOutcome::Unchanged,
                }),
                Err(MethodError::Verification(err)) => {
                    return Err(format!("{} does not verify: {:?}", signature, err));
                }
                Err(err) => {
                    log::debug!("Keeping {}.{} as it was: {:?}", java_name, signature, err);
                    diagnostics.methods.push(MethodDiagnostics {
                        method: signature,
                        sites: vec![],
                        outcome: MethodOutcome::KeptOriginal(err),
                    });
                }
            }
        }

        let traces = retransform_traces(active);
        if !traces.is_empty() {
            match register_for_retransform(&ctx, &mut class, &traces) {
                Ok(method_index) => {
                    modified.push(method_index);
                    diagnostics.registrations = traces;
                }
                Err(MethodError::Verification(err)) => {
                    return Err(format!("<clinit> does not verify: {:?}", err));
                }
                Err(err) => log::debug!("Not registering {} for retransform: {:?}", java_name, err),
            }
        }

        if modified.is_empty() {
            return Ok(None);
        }

        let mut all_traces = applied.to_vec();
        for probe in active {
            if !all_traces.contains(&probe.trace_class) {
                all_traces.push(probe.trace_class.clone());
            }
        }
        class
            .set_applied_traces(&self.settings.applied_attribute_name, &all_traces)
            .map_err(|err| format!("cannot record applied traces: {:?}", err))?;

        let bytes = class
            .into_bytes()
            .map_err(|err| format!("cannot serialize: {:?}", err))?;
        if self.settings.verify {
            verify_class(&bytes, &modified, hierarchy)?;
            diagnostics.verification = Verification::Passed;
        } else {
            diagnostics.verification = Verification::Unchecked;
        }
        Ok(Some(bytes))
    }
}

fn unchanged(bytes: &[u8], diagnostics: Diagnostics) -> TransformOutcome {
    TransformOutcome {
        bytes: bytes.to_vec(),
        diagnostics,
    }
}

/// Inject every site of a method, and encode the result if anything was injected
fn rewrite_method(
    ctx: &InjectionContext,
    method: &MethodModel,
    constants: &mut ConstantsPool,
    probes: &[&ProbeDescriptor],
) -> Result<(Option<class_file::Code>, Vec<SiteReport>), MethodError> {
    let code = match method.code(constants) {
        Ok(Some(code)) => code,
        Ok(None) => return Ok((None, vec![])),
        Err(err) => return Err(MethodError::Undecodable(err)),
    };
    let context = method.context(&ctx.class_name, ctx.hierarchy);
    let analysis = analyze(&code, &context, constants).map_err(MethodError::Undecodable)?;

    let mut inj = MethodInjector::new(ctx, method, &code, &analysis, constants);
    kinds::inject_method(&mut inj, probes)?;
    if !inj.has_changes() {
        return Ok((None, inj.reports));
    }
    let (rewritten, sites) = inj.finish()?;
    let encoded = encode(rewritten, &context, constants, ctx.version)?;
    Ok((Some(encoded), sites))
}

/// Record the sampling counters of probes which made it into the code
fn note_samplers(samplers: &mut Vec<SamplerRegistration>, probes: &[&ProbeDescriptor], sites: &[SiteReport]) {
    for probe in probes {
        let registration = match probe.sampling {
            Sampling::None => continue,
            Sampling::Fixed { id, mean } => SamplerRegistration {
                id,
                mean,
                adaptive: false,
            },
            Sampling::Adaptive { id } => SamplerRegistration {
                id,
                mean: 1,
                adaptive: true,
            },
        };
        let handler = probe.handler_name();
        let injected = sites
            .iter()
            .any(|site| site.skipped.is_none() && site.handler == handler);
        if injected && !samplers.iter().any(|known| known.id == registration.id) {
            samplers.push(registration);
        }
    }
}

/// Traces which select classes through a supertype
///
/// Subclasses loaded later aren't known to the host yet, so the class asks the runtime to
/// retransform them when it gets initialized.
fn retransform_traces(active: &[&ProbeDescriptor]) -> Vec<BinaryName> {
    let mut traces: Vec<BinaryName> = vec![];
    for probe in active {
        if matches!(probe.class, NamePattern::Subtype(_)) && !traces.contains(&probe.trace_class) {
            traces.push(probe.trace_class.clone());
        }
    }
    traces
}

/// Call `retransform(traceName, thisClass)` at the start of `<clinit>`, adding one if needed
///
/// Returns the index of the `<clinit>` method.
fn register_for_retransform(
    ctx: &InjectionContext,
    class: &mut ClassModel,
    traces: &[BinaryName],
) -> Result<usize, MethodError> {
    let no_args = MethodDescriptor {
        parameters: vec![],
        return_type: None,
    };
    let existing = class.method_index(&UnqualifiedName::CLINIT, &no_args);
    let constants = &mut class.class_file.constants;

    let mut code = match existing {
        Some(method_index) => class.methods[method_index]
            .code(constants)
            .map_err(MethodError::Undecodable)?
            .ok_or_else(|| {
                MethodError::Jvm(jvm::Error::MalformedClassFile(String::from(
                    "<clinit> has no code",
                )))
            })?,
        None => Code {
            max_stack: 0,
            max_locals: 0,
            nodes: vec![Node::Branch(BranchInstruction::Return)],
            try_catches: vec![],
            local_variables: vec![],
            local_variable_types: vec![],
            labels: SynLabelGenerator::default(),
        },
    };

    let retransform = MethodDescriptor {
        parameters: vec![
            FieldType::object(BinaryName::STRING),
            FieldType::object(BinaryName::CLASS),
        ],
        return_type: None,
    };
    let mut emitter = Emitter::new(constants, &mut code.labels, ctx.version);
    for trace in traces {
        emitter.const_string(trace.java_name())?;
        emitter.const_class(&RefType::Object(ctx.class_name.clone()))?;
        emitter.invoke_static(
            &ctx.settings.runtime_class,
            &UnqualifiedName::RETRANSFORM,
            &retransform,
        )?;
    }
    let registration = emitter.into_nodes();
    code.nodes.splice(0..0, registration);

    let context = MethodContext {
        this_class: ctx.class_name.clone(),
        descriptor: no_args.clone(),
        is_static: true,
        is_constructor: false,
        hierarchy: ctx.hierarchy,
    };
    let encoded = encode(code, &context, constants, ctx.version)?;

    let method_index = match existing {
        Some(method_index) => method_index,
        None => class.add_method(MethodAccessFlags::STATIC, UnqualifiedName::CLINIT, no_args)?,
    };
    class.methods[method_index].set_code(encoded, &mut class.class_file.constants)?;
    Ok(method_index)
}

/// Parse the serialized class again and type-check every rewritten method
fn verify_class(bytes: &[u8], modified: &[usize], hierarchy: &dyn ClassHierarchy) -> Result<(), String> {
    let class = ClassModel::from_bytes(bytes).map_err(|err| format!("does not parse: {:?}", err))?;
    let constants = &class.class_file.constants;
    for method_index in modified {
        let method = class
            .methods
            .get(*method_index)
            .ok_or_else(|| format!("method {} is missing", method_index))?;
        let code = match method.code(constants) {
            Ok(Some(code)) => code,
            Ok(None) => return Err(format!("{} lost its code", method.signature())),
            Err(err) => return Err(format!("{} does not decode: {:?}", method.signature(), err)),
        };
        analyze(&code, &method.context(&class.name, hierarchy), constants)
            .map_err(|err| format!("{} does not verify: {:?}", method.signature(), err))?;
    }
    Ok(())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => String::from(*message),
            Err(_) => String::from("unknown panic"),
        },
    }
}
