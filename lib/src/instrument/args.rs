//! Handler arguments
//!
//! Every site collects the values its probe kind offers (the receiver, positional arguments, the
//! value produced, ...) into [`SiteValues`]. The handler call then picks values out of that
//! according to the probe's bindings, converting them to the handler's parameter types.
//!
//! Conversions are deliberately narrow: identical types, `int`-like values passed as other
//! `int`-like types, references passed as supertypes, and primitives boxed when the handler
//! takes a plain `java.lang.Object`. Anything else makes the site unusable.

use super::emit::Emitter;
use super::errors::{InjectError, MethodError, SiteError};
use super::gates::Timer;
use super::probe::{Binding, ProbeDescriptor};
use super::slots::SlotAllocator;
use super::InjectionContext;
use crate::jvm::code::{Instruction, SynLabel};
use crate::jvm::hierarchy::ClassHierarchy;
use crate::jvm::{BaseType, BinaryName, Error, FieldType, RefType, RenderDescriptor};
use crate::util::Width;

/// Where a value handed to a handler comes from
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Local variable (of the original method, or a slot a stack value was captured into)
    Local {
        slot: u16,
        field_type: FieldType<BinaryName>,
    },

    Int(i32),
    Str(String),

    /// Class literal
    Class(RefType<BinaryName>),
}

impl Value {
    pub fn local(slot: u16, field_type: FieldType<BinaryName>) -> Value {
        Value::Local { slot, field_type }
    }

    pub fn field_type(&self) -> FieldType<BinaryName> {
        match self {
            Value::Local { field_type, .. } => field_type.clone(),
            Value::Int(_) => FieldType::int(),
            Value::Str(_) => FieldType::object(BinaryName::STRING),
            Value::Class(_) => FieldType::object(BinaryName::CLASS),
        }
    }

    pub fn load(&self, emitter: &mut Emitter) -> Result<(), Error> {
        match self {
            Value::Local { slot, field_type } => emitter.get_local(*slot, field_type),
            Value::Int(integer) => emitter.const_int(*integer)?,
            Value::Str(string) => emitter.const_string(string.as_str())?,
            Value::Class(ref_type) => emitter.const_class(ref_type)?,
        }
        Ok(())
    }
}

/// Values available at one site
#[derive(Clone, Debug, Default)]
pub struct SiteValues {
    /// Instance the instrumented method runs on (if initialized)
    pub this: Option<Value>,

    /// Positional arguments
    pub args: Vec<Value>,

    pub return_value: Option<Value>,

    /// Called method or accessed field, as `(name, qualified name)`
    pub target_member: Option<(String, String)>,

    pub target_instance: Option<Value>,

    /// Start timestamp for durations
    pub timer: Option<Timer>,
}

/// Names describing the instrumented method
#[derive(Clone, Debug)]
pub struct MethodNames {
    /// Dotted class name
    pub class: String,
    pub method: String,

    /// `class.name(descriptor)`
    pub qualified_method: String,
}

/// How a value gets passed as a given parameter type
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Conversion {
    Identity,
    Box(BaseType),
}

/// Types the JVM keeps as `int` on the stack and in locals
pub fn is_int_like(base_type: BaseType) -> bool {
    matches!(
        base_type,
        BaseType::Int | BaseType::Char | BaseType::Short | BaseType::Byte | BaseType::Boolean
    )
}

/// Check that a value of one type can be passed as a parameter of another
pub fn conversion(
    from: &FieldType<BinaryName>,
    to: &FieldType<BinaryName>,
    hierarchy: &dyn ClassHierarchy,
) -> Result<Conversion, SiteError> {
    match (from, to) {
        (FieldType::Base(from), FieldType::Base(to))
            if from == to || (is_int_like(*from) && is_int_like(*to)) =>
        {
            Ok(Conversion::Identity)
        }
        (FieldType::Base(from), FieldType::Ref(RefType::Object(to))) if to == &BinaryName::OBJECT => {
            Ok(Conversion::Box(*from))
        }
        (FieldType::Ref(from), FieldType::Ref(to)) if hierarchy.is_assignable(from, to) => {
            Ok(Conversion::Identity)
        }
        _ => Err(SiteError::Binding(format!(
            "{} can't be passed as {}",
            from.render(),
            to.render()
        ))),
    }
}

/// Binding resolved against the values at a site
enum Operand<'v> {
    Value(Value, Conversion),
    Boxed(&'v [Value]),
    Elapsed(&'v Timer),
}

fn resolve<'v>(
    binding: Binding,
    parameter: &FieldType<BinaryName>,
    values: &'v SiteValues,
    names: &MethodNames,
    hierarchy: &dyn ClassHierarchy,
) -> Result<Operand<'v>, SiteError> {
    let missing = |what: &str| SiteError::Binding(format!("no {} at this site", what));
    let value = match binding {
        Binding::This => values.this.clone().ok_or_else(|| missing("initialized 'this'"))?,
        Binding::Arg(idx) => values
            .args
            .get(idx)
            .cloned()
            .ok_or_else(|| missing(&format!("argument {}", idx)))?,
        Binding::Return => values
            .return_value
            .clone()
            .ok_or_else(|| missing("return value"))?,
        Binding::TargetInstance => values
            .target_instance
            .clone()
            .ok_or_else(|| missing("target instance"))?,
        Binding::ProbeClassName => Value::Str(names.class.clone()),
        Binding::ProbeMethodName { qualified } => Value::Str(if qualified {
            names.qualified_method.clone()
        } else {
            names.method.clone()
        }),
        Binding::TargetMember { qualified } => {
            let (name, qualified_name) = values
                .target_member
                .as_ref()
                .ok_or_else(|| missing("target member"))?;
            Value::Str(if qualified {
                qualified_name.clone()
            } else {
                name.clone()
            })
        }
        Binding::AnyTypeArgs => {
            let array = FieldType::array(FieldType::object(BinaryName::OBJECT));
            conversion(&array, parameter, hierarchy)?;
            return Ok(Operand::Boxed(&values.args));
        }
        Binding::Duration => {
            let timer = values.timer.as_ref().ok_or_else(|| missing("duration"))?;
            conversion(&FieldType::long(), parameter, hierarchy)?;
            return Ok(Operand::Elapsed(timer));
        }
    };
    let conversion = conversion(&value.field_type(), parameter, hierarchy)?;
    Ok(Operand::Value(value, conversion))
}

/// Push every value into a fresh `Object[]`, boxing primitives
pub fn emit_object_array(emitter: &mut Emitter, values: &[Value]) -> Result<(), Error> {
    let length = i32::try_from(values.len()).unwrap_or(i32::MAX);
    emitter.const_int(length)?;
    emitter.new_ref_array(&RefType::Object(BinaryName::OBJECT))?;
    for (idx, value) in values.iter().enumerate() {
        emitter.push_instruction(Instruction::Dup);
        emitter.const_int(idx as i32)?;
        value.load(emitter)?;
        if let FieldType::Base(base_type) = value.field_type() {
            emitter.box_value(base_type)?;
        }
        emitter.push_instruction(Instruction::AAStore);
    }
    Ok(())
}

/// Emit the gates opening a probe's region, returning the label the region ends at
///
/// The level gate comes first, then the sampling gate. A probe with a duration swaps the
/// sampling gate for a check that its timer was started.
pub fn emit_gates(
    ctx: &InjectionContext,
    emitter: &mut Emitter,
    probe: &ProbeDescriptor,
    values: &SiteValues,
) -> Result<SynLabel, Error> {
    let join = emitter.fresh_label();
    ctx.level
        .emit_gate(emitter, &probe.trace_class, probe.level.as_ref(), join)?;
    match &values.timer {
        Some(timer) if probe.wants_duration() => timer.emit_started_gate(emitter, join),
        _ => ctx.sampling.emit_gate(emitter, probe.sampling, join)?,
    }
    Ok(join)
}

/// Load the handler's arguments and call it
///
/// Bindings are all resolved before anything is emitted, so an unusable site leaves the emitter
/// untouched.
pub fn emit_handler_call(
    ctx: &InjectionContext,
    emitter: &mut Emitter,
    probe: &ProbeDescriptor,
    values: &SiteValues,
    names: &MethodNames,
) -> Result<(), InjectError> {
    let operands = probe
        .bindings
        .iter()
        .zip(probe.handler.descriptor.parameters.iter())
        .map(|(binding, parameter)| resolve(*binding, parameter, values, names, ctx.hierarchy))
        .collect::<Result<Vec<Operand>, SiteError>>()?;

    for operand in operands {
        match operand {
            Operand::Value(value, conversion) => {
                value.load(emitter)?;
                if let Conversion::Box(base_type) = conversion {
                    emitter.box_value(base_type)?;
                }
            }
            Operand::Boxed(args) => emit_object_array(emitter, args)?,
            Operand::Elapsed(timer) => timer.emit_elapsed(emitter, &ctx.sampling)?,
        }
    }
    emitter.invoke_static(&probe.trace_class, &probe.handler.name, &probe.handler.descriptor)?;
    Ok(())
}

/// Copy the top of the stack into site slots, leaving the stack as it was
///
/// `types` lists the values deepest first. A single value is duplicated and stored. Several
/// values are stored (popping them) then loaded back.
pub fn capture_top(
    emitter: &mut Emitter,
    slots: &mut SlotAllocator,
    purpose: &str,
    types: &[FieldType<BinaryName>],
) -> Result<Vec<Value>, MethodError> {
    let mut captured = Vec::with_capacity(types.len());
    for (idx, field_type) in types.iter().enumerate() {
        let slot = slots.site_slot(&format!("{}{}", purpose, idx), field_type)?;
        captured.push(Value::local(slot, field_type.clone()));
    }

    if let [Value::Local { slot, field_type }] = captured.as_slice() {
        emitter.dup(field_type.width());
        emitter.set_local(*slot, field_type);
    } else {
        for value in captured.iter().rev() {
            if let Value::Local { slot, field_type } = value {
                emitter.set_local(*slot, field_type);
            }
        }
        for value in &captured {
            if let Value::Local { slot, field_type } = value {
                emitter.get_local(*slot, field_type);
            }
        }
    }
    Ok(captured)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_file::{ConstantsPool, Version};
    use crate::jvm::code::{Node, SynLabelGenerator};
    use crate::jvm::hierarchy::KnownClasses;

    #[test]
    fn conversions() {
        let hierarchy = KnownClasses::with_java_lang();
        let object = FieldType::object(BinaryName::OBJECT);
        let string = FieldType::object(BinaryName::STRING);

        assert_eq!(conversion(&FieldType::int(), &FieldType::int(), &hierarchy), Ok(Conversion::Identity));
        assert_eq!(
            conversion(&FieldType::char(), &FieldType::int(), &hierarchy),
            Ok(Conversion::Identity)
        );
        assert_eq!(
            conversion(&FieldType::long(), &object, &hierarchy),
            Ok(Conversion::Box(BaseType::Long))
        );
        assert_eq!(conversion(&string, &object, &hierarchy), Ok(Conversion::Identity));

        // No widening, no boxing into anything but Object, no downcasts
        assert!(conversion(&FieldType::int(), &FieldType::long(), &hierarchy).is_err());
        assert!(conversion(&FieldType::int(), &FieldType::object(BinaryName::INTEGER), &hierarchy).is_err());
        assert!(conversion(&object, &string, &hierarchy).is_err());
        assert!(conversion(&string, &FieldType::int(), &hierarchy).is_err());
    }

    #[test]
    fn capturing_the_top_of_the_stack() {
        let mut constants = ConstantsPool::new();
        let mut labels = SynLabelGenerator::default();
        let mut slots = SlotAllocator::new(2);

        let mut emitter = Emitter::new(&mut constants, &mut labels, Version::JAVA8);
        let single = capture_top(&mut emitter, &mut slots, "ret", &[FieldType::long()]).unwrap();
        assert_eq!(single, vec![Value::local(2, FieldType::long())]);
        assert_eq!(
            emitter.into_nodes(),
            vec![Node::Insn(Instruction::Dup2), Node::Insn(Instruction::LStore(2))]
        );

        let mut emitter = Emitter::new(&mut constants, &mut labels, Version::JAVA8);
        let object = FieldType::object(BinaryName::OBJECT);
        let pair = capture_top(&mut emitter, &mut slots, "arg", &[object.clone(), FieldType::int()]).unwrap();
        assert_eq!(pair, vec![Value::local(4, object), Value::local(5, FieldType::int())]);
        assert_eq!(
            emitter.into_nodes(),
            vec![
                Node::Insn(Instruction::IStore(5)),
                Node::Insn(Instruction::AStore(4)),
                Node::Insn(Instruction::ALoad(4)),
                Node::Insn(Instruction::ILoad(5)),
            ]
        );
    }

    #[test]
    fn boxed_argument_arrays() {
        let mut constants = ConstantsPool::new();
        let mut labels = SynLabelGenerator::default();
        let mut emitter = Emitter::new(&mut constants, &mut labels, Version::JAVA8);
        let values = vec![Value::local(0, FieldType::int()), Value::Str(String::from("x"))];
        emit_object_array(&mut emitter, &values).unwrap();
        let nodes = emitter.into_nodes();

        assert_eq!(nodes[0], Node::Insn(Instruction::IConst2));
        assert!(matches!(nodes[1], Node::Insn(Instruction::ANewArray(_))));
        // dup, index, load, box, store for the int; dup, index, ldc, store for the string
        assert_eq!(nodes.len(), 2 + 5 + 4);
        assert_eq!(
            nodes.iter().filter(|node| **node == Node::Insn(Instruction::AAStore)).count(),
            2
        );
    }
}
