//! Probe descriptors
//!
//! A probe descriptor says where to inject a call (which classes, which methods, which point in
//! those methods), what to call (a static handler method on the trace class), and what to pass
//! to it. Descriptors come out of the trace compiler already validated; [`ProbeDescriptor::validate`]
//! only re-checks the things the injector relies on to generate well-typed code.

use super::level::Level;
use super::matcher::{DescriptorPattern, MethodPattern, NamePattern};
use super::Error;
use crate::jvm::{BinaryName, MethodDescriptor, Name, RenderDescriptor, UnqualifiedName};

/// Where in a method a probe fires
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Method entry (after the superclass constructor call in constructors)
    Entry,

    /// Every normal return
    Return,

    /// Exception propagating out of the method
    Error,

    /// Start of an existing exception handler
    Catch,

    /// `athrow`
    Throw,

    /// Start of a source line
    Line,

    /// `getfield` and `getstatic`
    FieldGet,

    /// `putfield` and `putstatic`
    FieldSet,

    /// Array element loads
    ArrayGet,

    /// Array element stores
    ArraySet,

    /// Object allocation
    New,

    /// Array allocation (`newarray`, `anewarray`, `multianewarray`)
    NewArray,

    /// `monitorenter` (and entry into `synchronized` methods)
    SyncEntry,

    /// `monitorexit` (and exit from `synchronized` methods)
    SyncExit,

    /// Method call
    Call,

    CheckCast,
    InstanceOf,
}

impl Kind {
    /// Does firing after the anchor differ from firing before it?
    pub fn has_after(self) -> bool {
        matches!(
            self,
            Kind::Line
                | Kind::FieldGet
                | Kind::FieldSet
                | Kind::ArrayGet
                | Kind::ArraySet
                | Kind::New
                | Kind::NewArray
                | Kind::SyncEntry
                | Kind::SyncExit
                | Kind::Call
                | Kind::CheckCast
                | Kind::InstanceOf
        )
    }

    /// Is a `Return` binding meaningful for this kind (at this point)?
    pub fn has_return_value(self, point: Where) -> bool {
        match self {
            Kind::Return => true,
            Kind::Call | Kind::FieldGet | Kind::ArrayGet | Kind::New | Kind::NewArray => {
                point == Where::After
            }
            _ => false,
        }
    }

    /// Is a `Duration` binding meaningful for this kind (at this point)?
    pub fn has_duration(self, point: Where) -> bool {
        match self {
            Kind::Return | Kind::Error => true,
            Kind::Call => point == Where::After,
            _ => false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Where {
    Before,
    After,
}

/// Point inside matched methods where the probe fires
#[derive(Clone, Debug)]
pub struct Location {
    pub kind: Kind,
    pub point: Where,

    /// Owner of the called method or accessed field, or the type allocated, cast, checked, or
    /// caught
    pub class: NamePattern,

    /// Name of the called method or accessed field
    pub member: NamePattern,

    /// Descriptor of the called method
    pub descriptor: Option<DescriptorPattern>,

    /// Source line for [`Kind::Line`] (`-1` for every line)
    pub line: i32,
}

impl Location {
    pub fn new(kind: Kind) -> Location {
        Location {
            kind,
            point: Where::Before,
            class: NamePattern::Any,
            member: NamePattern::Any,
            descriptor: None,
            line: -1,
        }
    }

    pub fn after(mut self) -> Location {
        self.point = Where::After;
        self
    }
}

/// Value passed to one parameter of the handler
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Binding {
    /// Instance the instrumented method runs on
    This,

    /// Positional argument of the probe point (method parameters for `Entry`/`Return`, call
    /// arguments for `Call`, the exception for `Error`/`Catch`/`Throw`, ...)
    Arg(usize),

    /// Every positional argument, boxed into an `Object[]`
    AnyTypeArgs,

    /// Value returned, loaded, or allocated
    Return,

    /// Nanoseconds spent in the method (or the call)
    Duration,

    /// Name of the instrumented method (`class.name+descriptor` when qualified)
    ProbeMethodName { qualified: bool },

    /// Dotted name of the instrumented class
    ProbeClassName,

    /// Name of the called method or accessed field (`owner.name+descriptor` when qualified)
    TargetMember { qualified: bool },

    /// Receiver of the call or owner of the accessed field
    TargetInstance,
}

/// Throttling of a probe
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Sampling {
    None,

    /// Fire on average once every `mean` hits
    Fixed { id: i32, mean: u32 },

    /// Let the tracker pick the rate
    Adaptive { id: i32 },
}

impl Sampling {
    pub fn id(&self) -> Option<i32> {
        match self {
            Sampling::None => None,
            Sampling::Fixed { id, .. } | Sampling::Adaptive { id } => Some(*id),
        }
    }
}

/// Static method on the trace class to call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handler {
    pub name: UnqualifiedName,
    pub descriptor: MethodDescriptor<BinaryName>,
}

/// Full description of one probe
#[derive(Clone, Debug)]
pub struct ProbeDescriptor {
    /// Class holding the handler and the level field
    pub trace_class: BinaryName,
    pub handler: Handler,

    /// Classes to instrument
    pub class: NamePattern,

    /// Methods to instrument in those classes
    pub method: MethodPattern,

    pub location: Location,

    /// One binding per handler parameter, in order
    pub bindings: Vec<Binding>,

    pub level: Option<Level>,
    pub sampling: Sampling,
}

impl ProbeDescriptor {
    /// Check that the descriptor is internally consistent
    pub fn validate(&self) -> Result<(), Error> {
        let kind = self.location.kind;
        let point = self.location.point;
        let bad = |msg: String| Err(Error::BadProbe(format!("{}: {}", self.handler_name(), msg)));

        if self.handler.descriptor.return_type.is_some() {
            return bad(String::from("handler must return void"));
        }
        if self.bindings.len() != self.handler.descriptor.parameters.len() {
            return bad(format!(
                "{} bindings for {} handler parameters",
                self.bindings.len(),
                self.handler.descriptor.parameters.len()
            ));
        }
        for binding in &self.bindings {
            match binding {
                Binding::Return if !kind.has_return_value(point) => {
                    return bad(format!("{:?} has no return value", kind));
                }
                Binding::Duration if !kind.has_duration(point) => {
                    return bad(format!("{:?} has no duration", kind));
                }
                Binding::TargetMember { .. } | Binding::TargetInstance
                    if !matches!(kind, Kind::Call | Kind::FieldGet | Kind::FieldSet) =>
                {
                    return bad(format!("{:?} has no target member", kind));
                }
                _ => (),
            }
        }
        if let Sampling::Fixed { mean: 0, .. } = self.sampling {
            return bad(String::from("sampling mean must be positive"));
        }
        Ok(())
    }

    /// Does the handler need the elapsed time?
    pub fn wants_duration(&self) -> bool {
        self.bindings.contains(&Binding::Duration)
    }

    /// Does the handler take any positional argument (alone or boxed)?
    pub fn wants_args(&self) -> bool {
        self.bindings
            .iter()
            .any(|binding| matches!(binding, Binding::Arg(_) | Binding::AnyTypeArgs))
    }

    pub fn wants(&self, binding: Binding) -> bool {
        self.bindings.contains(&binding)
    }

    /// Handler as `Trace.name(desc)`, for messages
    pub fn handler_name(&self) -> String {
        format!(
            "{}.{}{}",
            self.trace_class.to_java_name(),
            self.handler.name.as_str(),
            self.handler.descriptor.render()
        )
    }
}


#[cfg(test)]
mod test {
    use super::test_probes::probe;
    use super::*;
    use crate::jvm::FieldType;

    #[test]
    fn bindings_must_fit_the_kind() {
        let entry = probe(Kind::Entry, "app.Main", "run", vec![(Binding::Arg(0), FieldType::int())]);
        assert!(entry.validate().is_ok());

        let entry_return = probe(Kind::Entry, "app.Main", "run", vec![(Binding::Return, FieldType::int())]);
        assert!(matches!(entry_return.validate(), Err(Error::BadProbe(_))));

        let mut call = probe(Kind::Call, "app.Main", "run", vec![(Binding::Return, FieldType::int())]);
        assert!(call.validate().is_err());
        call.location = Location::new(Kind::Call).after();
        assert!(call.validate().is_ok());

        let duration = probe(Kind::Return, "", "", vec![(Binding::Duration, FieldType::long())]);
        assert!(duration.validate().is_ok());
        assert!(duration.wants_duration());

        let mut mismatched = probe(Kind::Entry, "", "", vec![]);
        mismatched.bindings.push(Binding::This);
        assert!(mismatched.validate().is_err());

        let mut sampled = probe(Kind::Entry, "", "", vec![]);
        sampled.sampling = Sampling::Fixed { id: 1, mean: 0 };
        assert!(sampled.validate().is_err());
    }
}
