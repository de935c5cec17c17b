//! Deciding which classes and methods a probe applies to
//!
//! Class and member names are matched in the dotted form Java source uses (`java.lang.String`),
//! with the following pattern syntax:
//!
//! | Pattern      | Matches                                                     |
//! |--------------|-------------------------------------------------------------|
//! | (empty)      | anything                                                    |
//! | `name`       | exactly `name`                                              |
//! | `/regex/`    | names the regular expression matches in full                |
//! | `+name`      | the class `name` and every class extending or implementing it |
//! | `@name`      | classes or methods annotated with `name` (or `@/regex/`)    |
//!
//! Descriptor patterns are either a raw JVM method descriptor (`(ILjava/lang/String;)V`) or
//! a Java-like signature where any position can be a wildcard:
//!
//! ```text
//! void (java.lang.String, int[], *, +java.util.Map)
//! * (...)
//! ```

use super::model::{ClassModel, MethodModel};
use super::probe::ProbeDescriptor;
use super::settings::Settings;
use crate::jvm::hierarchy::ClassHierarchy;
use crate::jvm::{
    BaseType, BinaryName, FieldType, JavaName, MethodDescriptor, Name, ParseDescriptor, RefType,
};
use regex::Regex;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadPattern(pub String);

impl fmt::Display for BadPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pattern: {}", self.0)
    }
}

/// Pattern over class, method, or field names
#[derive(Clone, Debug)]
pub enum NamePattern {
    Any,
    Exact(String),

    /// Anchored regular expression
    Regex(Regex),

    /// Class or any of its subtypes
    Subtype(String),

    /// Annotation type, itself matched by an `Exact` or `Regex` pattern
    Annotated(Box<NamePattern>),
}

impl NamePattern {
    pub fn parse(pattern: &str) -> Result<NamePattern, BadPattern> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            Ok(NamePattern::Any)
        } else if let Some(annotation) = pattern.strip_prefix('@') {
            match NamePattern::parse(annotation)? {
                inner @ (NamePattern::Exact(_) | NamePattern::Regex(_)) => {
                    Ok(NamePattern::Annotated(Box::new(inner)))
                }
                _ => Err(BadPattern(String::from(pattern))),
            }
        } else if let Some(super_type) = pattern.strip_prefix('+') {
            if super_type.is_empty() {
                return Err(BadPattern(String::from(pattern)));
            }
            Ok(NamePattern::Subtype(String::from(super_type)))
        } else if pattern.len() >= 2 && pattern.starts_with('/') && pattern.ends_with('/') {
            let regex = &pattern[1..pattern.len() - 1];
            Regex::new(&format!("^(?:{})$", regex))
                .map(NamePattern::Regex)
                .map_err(|err| BadPattern(format!("{}: {}", pattern, err)))
        } else {
            Ok(NamePattern::Exact(String::from(pattern)))
        }
    }

    pub fn exact(name: impl Into<String>) -> NamePattern {
        NamePattern::Exact(name.into())
    }

    /// Match a plain name (subtype and annotation patterns never match here)
    pub fn matches_name(&self, name: &str) -> bool {
        match self {
            NamePattern::Any => true,
            NamePattern::Exact(exact) => exact == name,
            NamePattern::Regex(regex) => regex.is_match(name),
            NamePattern::Subtype(_) | NamePattern::Annotated(_) => false,
        }
    }

    /// Match a class, given its annotations and the hierarchy it lives in
    ///
    /// Classes the hierarchy does not know about are not considered subtypes of anything.
    pub fn matches_class(
        &self,
        class: &BinaryName,
        annotations: &[BinaryName],
        hierarchy: &dyn ClassHierarchy,
    ) -> bool {
        match self {
            NamePattern::Subtype(super_type) => match BinaryName::from_java_name(super_type) {
                Ok(super_type) => hierarchy.is_subclass(class, &super_type) == Some(true),
                Err(_) => false,
            },
            NamePattern::Annotated(annotation) => annotation.matches_any(annotations),
            _ => self.matches_name(&class.to_java_name()),
        }
    }

    /// Match a method or field, given its name and annotations
    pub fn matches_member(&self, name: &str, annotations: &[BinaryName]) -> bool {
        match self {
            NamePattern::Annotated(annotation) => annotation.matches_any(annotations),
            _ => self.matches_name(name),
        }
    }

    /// Match a type used by an instruction (allocated, cast, caught, or an owner)
    pub fn matches_type(&self, ref_type: &RefType<BinaryName>, hierarchy: &dyn ClassHierarchy) -> bool {
        match (self, ref_type) {
            (NamePattern::Subtype(_), RefType::Object(class)) => {
                self.matches_class(class, &[], hierarchy)
            }
            (NamePattern::Subtype(_) | NamePattern::Annotated(_), _) => false,
            _ => self.matches_name(&ref_type.java_name()),
        }
    }

    fn matches_any(&self, annotations: &[BinaryName]) -> bool {
        annotations
            .iter()
            .any(|annotation| self.matches_name(&annotation.to_java_name()))
    }
}

impl fmt::Display for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamePattern::Any => Ok(()),
            NamePattern::Exact(name) => f.write_str(name),
            NamePattern::Regex(regex) => {
                let anchored = regex.as_str();
                let inner = anchored
                    .strip_prefix("^(?:")
                    .and_then(|rest| rest.strip_suffix(")$"))
                    .unwrap_or(anchored);
                write!(f, "/{}/", inner)
            }
            NamePattern::Subtype(name) => write!(f, "+{}", name),
            NamePattern::Annotated(inner) => write!(f, "@{}", inner),
        }
    }
}

/// Pattern over one position of a method descriptor
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypePattern {
    /// Any type (including `void`, for return types)
    Any,
    Void,
    Exact(FieldType<BinaryName>),

    /// Any reference type assignable to the class
    Subtype(BinaryName),
}

impl TypePattern {
    /// Parse a Java-like type (`int`, `java.lang.String[][]`, `*`, `+java.util.Map`, `void`)
    pub fn parse(pattern: &str) -> Result<TypePattern, BadPattern> {
        let pattern = pattern.trim();
        let bad = || BadPattern(String::from(pattern));
        match pattern {
            "*" => Ok(TypePattern::Any),
            "void" => Ok(TypePattern::Void),
            _ => {
                if let Some(class) = pattern.strip_prefix('+') {
                    BinaryName::from_java_name(class)
                        .map(TypePattern::Subtype)
                        .map_err(|_| bad())
                } else {
                    parse_java_type(pattern).map(TypePattern::Exact).ok_or_else(bad)
                }
            }
        }
    }

    /// Match a parameter or return type (`None` is `void`)
    ///
    /// An exact `java.lang.Object` matches every reference type. Subtype checks are lenient:
    /// a class the hierarchy doesn't know about is assumed to match.
    pub fn matches(&self, field_type: Option<&FieldType<BinaryName>>, hierarchy: &dyn ClassHierarchy) -> bool {
        match (self, field_type) {
            (TypePattern::Any, _) => true,
            (TypePattern::Void, None) => true,
            (TypePattern::Exact(FieldType::Ref(RefType::Object(object))), Some(FieldType::Ref(_)))
                if object == &BinaryName::OBJECT =>
            {
                true
            }
            (TypePattern::Exact(expected), Some(actual)) => expected == actual,
            (TypePattern::Subtype(super_type), Some(FieldType::Ref(ref_type))) => {
                hierarchy.is_assignable(ref_type, &RefType::Object(super_type.clone()))
            }
            _ => false,
        }
    }
}

/// Pattern over method descriptors
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorPattern {
    /// Parameter patterns (`None` accepts any parameter list)
    pub parameters: Option<Vec<TypePattern>>,
    pub return_type: TypePattern,
}

impl DescriptorPattern {
    pub fn parse(pattern: &str) -> Result<DescriptorPattern, BadPattern> {
        let pattern = pattern.trim();
        let bad = || BadPattern(String::from(pattern));

        // Raw JVM descriptor
        if pattern.starts_with('(') {
            let descriptor = MethodDescriptor::<BinaryName>::parse(pattern).map_err(|_| bad())?;
            return Ok(DescriptorPattern::exact(&descriptor));
        }

        let open = pattern.find('(').ok_or_else(bad)?;
        let inner = pattern[open + 1..].strip_suffix(')').ok_or_else(bad)?.trim();
        let return_type = TypePattern::parse(&pattern[..open])?;
        let parameters = if inner == "..." {
            None
        } else if inner.is_empty() {
            Some(vec![])
        } else {
            Some(
                inner
                    .split(',')
                    .map(TypePattern::parse)
                    .collect::<Result<Vec<_>, _>>()?,
            )
        };
        Ok(DescriptorPattern {
            parameters,
            return_type,
        })
    }

    /// Pattern matching exactly one descriptor
    pub fn exact(descriptor: &MethodDescriptor<BinaryName>) -> DescriptorPattern {
        DescriptorPattern {
            parameters: Some(
                descriptor
                    .parameters
                    .iter()
                    .cloned()
                    .map(TypePattern::Exact)
                    .collect(),
            ),
            return_type: match &descriptor.return_type {
                None => TypePattern::Void,
                Some(return_type) => TypePattern::Exact(return_type.clone()),
            },
        }
    }

    pub fn matches(&self, descriptor: &MethodDescriptor<BinaryName>, hierarchy: &dyn ClassHierarchy) -> bool {
        if !self
            .return_type
            .matches(descriptor.return_type.as_ref(), hierarchy)
        {
            return false;
        }
        match &self.parameters {
            None => true,
            Some(parameters) => {
                parameters.len() == descriptor.parameters.len()
                    && parameters
                        .iter()
                        .zip(&descriptor.parameters)
                        .all(|(pattern, parameter)| pattern.matches(Some(parameter), hierarchy))
            }
        }
    }
}

/// Pattern over methods of a class
#[derive(Clone, Debug)]
pub struct MethodPattern {
    /// Method name (an exact `#` stands for the name of the probe handler)
    pub name: NamePattern,
    pub descriptor: Option<DescriptorPattern>,
}

impl MethodPattern {
    pub fn any() -> MethodPattern {
        MethodPattern {
            name: NamePattern::Any,
            descriptor: None,
        }
    }
}

/// Why a method was not considered for instrumentation at all
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Ineligible {
    /// Abstract or native
    NoCode,

    /// Generated by the tracing machinery itself
    Injected,
}

/// Parse a Java-like type name (`int`, `java.lang.String`, `long[][]`)
pub fn parse_java_type(name: &str) -> Option<FieldType<BinaryName>> {
    let mut element = name.trim();
    let mut dimensions = 0;
    while let Some(rest) = element.strip_suffix("[]") {
        element = rest.trim_end();
        dimensions += 1;
    }
    let mut field_type = match element {
        "boolean" => FieldType::Base(BaseType::Boolean),
        "byte" => FieldType::Base(BaseType::Byte),
        "char" => FieldType::Base(BaseType::Char),
        "short" => FieldType::Base(BaseType::Short),
        "int" => FieldType::Base(BaseType::Int),
        "long" => FieldType::Base(BaseType::Long),
        "float" => FieldType::Base(BaseType::Float),
        "double" => FieldType::Base(BaseType::Double),
        class => FieldType::object(BinaryName::from_java_name(class).ok()?),
    };
    for _ in 0..dimensions {
        field_type = FieldType::array(field_type);
    }
    Some(field_type)
}

/// Classes which are never instrumented, whatever the probes say
pub fn is_sensitive_class(class: &BinaryName, settings: &Settings) -> bool {
    let name = class.as_str();
    name == BinaryName::OBJECT.as_str()
        || name.starts_with("java/lang/ThreadLocal")
        || name.starts_with("sun/reflect")
        || name == "sun/misc/Unsafe"
        || name.starts_with("sun/security/")
        || name == "java/lang/VerifyError"
        || name.starts_with("sun/instrument/")
        || name.starts_with("java/lang/instrument/")
        || class == &settings.runtime_class
        || class == &settings.tracker_class
}

/// Does the probe's class pattern select this class?
pub fn class_matches(probe: &ProbeDescriptor, class: &ClassModel, hierarchy: &dyn ClassHierarchy) -> bool {
    probe
        .class
        .matches_class(&class.name, &class.annotations, hierarchy)
}

/// Can this method be instrumented at all?
pub fn check_eligible(method: &MethodModel, settings: &Settings) -> Result<(), Ineligible> {
    if !method.has_code() {
        Err(Ineligible::NoCode)
    } else if method.name.as_str().starts_with(&settings.injected_prefix) {
        Err(Ineligible::Injected)
    } else {
        Ok(())
    }
}

/// Does the probe's method pattern select this method?
pub fn method_matches(probe: &ProbeDescriptor, method: &MethodModel, hierarchy: &dyn ClassHierarchy) -> bool {
    let name_matches = match &probe.method.name {
        NamePattern::Exact(name) if name == "#" => method.name == probe.handler.name,
        pattern => pattern.matches_member(method.name.as_str(), &method.annotations),
    };
    name_matches
        && probe
            .method
            .descriptor
            .as_ref()
            .map_or(true, |pattern| pattern.matches(&method.descriptor, hierarchy))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::hierarchy::{ClassInfo, KnownClasses};

    fn name(name: &str) -> BinaryName {
        BinaryName::from_string(String::from(name)).unwrap()
    }

    fn hierarchy() -> KnownClasses {
        let mut known = KnownClasses::with_java_lang();
        known.insert(name("java/util/Map"), ClassInfo::interface());
        known.insert(
            name("java/util/HashMap"),
            ClassInfo {
                super_class: Some(BinaryName::OBJECT),
                interfaces: vec![name("java/util/Map")],
                is_interface: false,
            },
        );
        known.insert(name("app/Base"), ClassInfo::class(BinaryName::OBJECT));
        known.insert(name("app/Derived"), ClassInfo::class(name("app/Base")));
        known
    }

    #[test]
    fn name_patterns() {
        let hierarchy = hierarchy();
        let derived = name("app/Derived");

        assert!(NamePattern::parse("").unwrap().matches_class(&derived, &[], &hierarchy));
        assert!(NamePattern::parse("app.Derived")
            .unwrap()
            .matches_class(&derived, &[], &hierarchy));
        assert!(!NamePattern::parse("app/Derived")
            .unwrap()
            .matches_class(&derived, &[], &hierarchy));
        assert!(NamePattern::parse("/app\\..*/")
            .unwrap()
            .matches_class(&derived, &[], &hierarchy));

        // Regexes match the whole name
        assert!(!NamePattern::parse("/app/")
            .unwrap()
            .matches_class(&derived, &[], &hierarchy));

        let base = NamePattern::parse("+app.Base").unwrap();
        assert!(base.matches_class(&derived, &[], &hierarchy));
        assert!(base.matches_class(&name("app/Base"), &[], &hierarchy));
        assert!(!base.matches_class(&name("app/Unknown"), &[], &hierarchy));

        let annotated = NamePattern::parse("@app.Traced").unwrap();
        assert!(annotated.matches_class(&derived, &[name("app/Traced")], &hierarchy));
        assert!(!annotated.matches_class(&derived, &[], &hierarchy));
        assert!(NamePattern::parse("@/app\\..*/")
            .unwrap()
            .matches_member("run", &[name("app/Traced")]));

        assert!(NamePattern::parse("/[unclosed/").is_err());
        assert!(NamePattern::parse("@+app.Base").is_err());
        assert_eq!(NamePattern::parse("/a.*/").unwrap().to_string(), "/a.*/");
    }

    #[test]
    fn descriptor_patterns() {
        let hierarchy = hierarchy();
        let descriptor = |desc: &str| MethodDescriptor::<BinaryName>::parse(desc).unwrap();
        let pattern = |pat: &str| DescriptorPattern::parse(pat).unwrap();

        let put = descriptor("(Ljava/util/HashMap;I[J)V");
        assert!(pattern("void (java.util.HashMap, int, long[])").matches(&put, &hierarchy));
        assert!(pattern("void (+java.util.Map, *, long[])").matches(&put, &hierarchy));
        assert!(pattern("* (...)").matches(&put, &hierarchy));
        assert!(pattern("(Ljava/util/HashMap;I[J)V").matches(&put, &hierarchy));
        assert!(pattern("void (java.lang.Object, int, java.lang.Object)").matches(&put, &hierarchy));
        assert!(!pattern("void (java.util.HashMap, int)").matches(&put, &hierarchy));
        assert!(!pattern("int (...)").matches(&put, &hierarchy));
        assert!(!pattern("void (java.lang.String, int, long[])").matches(&put, &hierarchy));

        let get = descriptor("()Lapp/Derived;");
        assert!(pattern("+app.Base ()").matches(&get, &hierarchy));
        assert!(!pattern("void ()").matches(&get, &hierarchy));

        assert!(DescriptorPattern::parse("void").is_err());
        assert!(DescriptorPattern::parse("void (a;b)").is_err());
    }

    #[test]
    fn java_types() {
        assert_eq!(parse_java_type("int"), Some(FieldType::int()));
        assert_eq!(
            parse_java_type("java.lang.String[][]"),
            Some(FieldType::array(FieldType::array(FieldType::object(
                BinaryName::STRING
            ))))
        );
        assert_eq!(parse_java_type("java/lang/String"), None);
    }

    #[test]
    fn sensitive_classes() {
        let settings = Settings::default();
        assert!(is_sensitive_class(&BinaryName::OBJECT, &settings));
        assert!(is_sensitive_class(&name("java/lang/ThreadLocal$Map"), &settings));
        assert!(is_sensitive_class(&settings.tracker_class, &settings));
        assert!(!is_sensitive_class(&BinaryName::STRING, &settings));
    }
}
