//! Line-based probe lists
//!
//! One probe per line, with blank lines and `#` comments skipped:
//!
//! ```text
//! traces/Trace onEntry(Ljava/lang/String;)V entry app.Main /run.*/ bind=method level=>=2
//! traces/Trace onCall(J)V call@after +app.Base main member=println bind=duration sample=1/20
//! ```
//!
//! The fields are the trace class, the handler name with its descriptor, the kind (with
//! `@after` to fire after the anchor), the class pattern and the method pattern. Options
//! follow as `key=value`:
//!
//!   - `bind`: comma separated bindings, one per handler parameter
//!   - `level`: level condition, as in `>=2`
//!   - `sample`: `ID/MEAN` for fixed sampling, `ID/adaptive` for adaptive
//!   - `on`, `member`: owner and name of what the probe targets (called method, field, type)
//!   - `signature`: descriptor pattern for the probed method
//!   - `line`: source line, for line probes

use bytetrace::instrument::{
    Binding, DescriptorPattern, Handler, Kind, Location, MethodPattern, NamePattern,
    ProbeDescriptor, Sampling,
};
use bytetrace::jvm::{BinaryName, MethodDescriptor, Name, ParseDescriptor, UnqualifiedName};
use std::fmt;

#[derive(Debug)]
pub struct ProbeFileError {
    /// Line number, starting at 1
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ProbeFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

pub fn parse_probes(source: &str) -> Result<Vec<ProbeDescriptor>, ProbeFileError> {
    let mut probes = vec![];
    for (idx, line) in source.lines().enumerate() {
        let line = match line.find('#') {
            Some(comment) => &line[..comment],
            None => line,
        };
        if line.trim().is_empty() {
            continue;
        }
        let probe = parse_probe(line).map_err(|message| ProbeFileError {
            line: idx + 1,
            message,
        })?;
        probes.push(probe);
    }
    Ok(probes)
}

fn parse_probe(line: &str) -> Result<ProbeDescriptor, String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return Err(format!("expected at least 5 fields, found {}", fields.len()));
    }

    let trace_class = BinaryName::from_string(String::from(fields[0]))?;
    let handler = parse_handler(fields[1])?;
    let (kind, after) = match fields[2].split_once('@') {
        Some((kind, "after")) => (parse_kind(kind)?, true),
        Some((_, point)) => return Err(format!("unknown point '{}'", point)),
        None => (parse_kind(fields[2])?, false),
    };
    let mut location = Location::new(kind);
    if after {
        location = location.after();
    }
    let class = NamePattern::parse(fields[3]).map_err(|err| err.to_string())?;
    let mut method = MethodPattern {
        name: NamePattern::parse(fields[4]).map_err(|err| err.to_string())?,
        descriptor: None,
    };

    let mut bindings = vec![];
    let mut level = None;
    let mut sampling = Sampling::None;
    for option in &fields[5..] {
        let (key, value) = option
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, found '{}'", option))?;
        match key {
            "bind" => {
                bindings = value
                    .split(',')
                    .map(parse_binding)
                    .collect::<Result<Vec<_>, _>>()?;
            }
            "level" => level = Some(value.parse().map_err(|_| format!("bad level '{}'", value))?),
            "sample" => sampling = parse_sampling(value)?,
            "on" => location.class = NamePattern::parse(value).map_err(|err| err.to_string())?,
            "member" => location.member = NamePattern::parse(value).map_err(|err| err.to_string())?,
            "signature" => {
                method.descriptor = Some(DescriptorPattern::parse(value).map_err(|err| err.to_string())?)
            }
            "line" => location.line = value.parse().map_err(|_| format!("bad line '{}'", value))?,
            _ => return Err(format!("unknown option '{}'", key)),
        }
    }

    Ok(ProbeDescriptor {
        trace_class,
        handler,
        class,
        method,
        location,
        bindings,
        level,
        sampling,
    })
}

/// `onEntry(Ljava/lang/String;)V`
fn parse_handler(handler: &str) -> Result<Handler, String> {
    let paren = handler
        .find('(')
        .ok_or_else(|| format!("handler '{}' has no descriptor", handler))?;
    let name = UnqualifiedName::from_string(String::from(&handler[..paren]))?;
    let descriptor = MethodDescriptor::parse(&handler[paren..])
        .map_err(|err| format!("bad handler descriptor '{}': {:?}", &handler[paren..], err))?;
    Ok(Handler { name, descriptor })
}

fn parse_kind(kind: &str) -> Result<Kind, String> {
    let kind = match kind {
        "entry" => Kind::Entry,
        "return" => Kind::Return,
        "error" => Kind::Error,
        "catch" => Kind::Catch,
        "throw" => Kind::Throw,
        "line" => Kind::Line,
        "field-get" => Kind::FieldGet,
        "field-set" => Kind::FieldSet,
        "array-get" => Kind::ArrayGet,
        "array-set" => Kind::ArraySet,
        "new" => Kind::New,
        "new-array" => Kind::NewArray,
        "sync-entry" => Kind::SyncEntry,
        "sync-exit" => Kind::SyncExit,
        "call" => Kind::Call,
        "checkcast" => Kind::CheckCast,
        "instanceof" => Kind::InstanceOf,
        _ => return Err(format!("unknown kind '{}'", kind)),
    };
    Ok(kind)
}

fn parse_binding(binding: &str) -> Result<Binding, String> {
    let binding = match binding {
        "this" => Binding::This,
        "args" => Binding::AnyTypeArgs,
        "return" => Binding::Return,
        "duration" => Binding::Duration,
        "method" => Binding::ProbeMethodName { qualified: false },
        "qmethod" => Binding::ProbeMethodName { qualified: true },
        "class" => Binding::ProbeClassName,
        "member" => Binding::TargetMember { qualified: false },
        "qmember" => Binding::TargetMember { qualified: true },
        "target" => Binding::TargetInstance,
        other => match other.strip_prefix("arg").map(str::parse::<usize>) {
            Some(Ok(idx)) => Binding::Arg(idx),
            _ => return Err(format!("unknown binding '{}'", other)),
        },
    };
    Ok(binding)
}

fn parse_sampling(sampling: &str) -> Result<Sampling, String> {
    let bad = || format!("bad sampling '{}'", sampling);
    let (id, rate) = sampling.split_once('/').ok_or_else(bad)?;
    let id = id.parse::<i32>().map_err(|_| bad())?;
    if rate == "adaptive" {
        Ok(Sampling::Adaptive { id })
    } else {
        let mean = rate.parse::<u32>().map_err(|_| bad())?;
        Ok(Sampling::Fixed { id, mean })
    }
}
