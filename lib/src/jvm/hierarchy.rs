//! What is known about classes other than the one being rewritten
//!
//! Both matching probes against subtypes and merging reference types in the verifier need to
//! know superclasses and interfaces. The class being rewritten only knows its direct
//! supertypes, so the rest comes from the loader context through [`ClassHierarchy`].
//!
//! Missing information is never an error: unknown classes are treated as direct subclasses of
//! `java.lang.Object`, and assignability to an unknown type is assumed.

use crate::jvm::class_file::ClassFile;
use crate::jvm::{BinaryName, ClassAccessFlags, Error, RefType};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Direct supertypes of a class
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassInfo {
    /// `None` only for `java.lang.Object`
    pub super_class: Option<BinaryName>,
    pub interfaces: Vec<BinaryName>,
    pub is_interface: bool,
}

impl ClassInfo {
    /// Regular class extending the given superclass
    pub fn class(super_class: BinaryName) -> ClassInfo {
        ClassInfo {
            super_class: Some(super_class),
            interfaces: vec![],
            is_interface: false,
        }
    }

    /// Interface (whose superclass is always `java.lang.Object`)
    pub fn interface() -> ClassInfo {
        ClassInfo {
            super_class: Some(BinaryName::OBJECT),
            interfaces: vec![],
            is_interface: true,
        }
    }

    /// Read the direct supertypes from a parsed class file
    pub fn from_class_file(class: &ClassFile) -> Result<(BinaryName, ClassInfo), Error> {
        let name = class.constants.class_name(class.this_class)?;
        let super_class = if class.super_class.0 .0 == 0 {
            None
        } else {
            Some(class.constants.class_name(class.super_class)?)
        };
        let interfaces = class
            .interfaces
            .iter()
            .map(|interface| class.constants.class_name(*interface))
            .collect::<Result<_, _>>()?;
        let info = ClassInfo {
            super_class,
            interfaces,
            is_interface: class.access_flags.contains(ClassAccessFlags::INTERFACE),
        };
        Ok((name, info))
    }
}

/// Source of class hierarchy information
pub trait ClassHierarchy {
    /// Look up the direct supertypes of a class (`None` if the class is unknown)
    fn lookup(&self, class: &BinaryName) -> Option<ClassInfo>;

    /// Chain of superclasses, starting with the class itself
    ///
    /// The chain stops early at the first unknown class.
    fn superclass_chain(&self, class: &BinaryName) -> Vec<BinaryName> {
        let mut chain = vec![class.clone()];
        let mut current = class.clone();
        while let Some(super_class) = self.lookup(&current).and_then(|info| info.super_class) {
            if chain.contains(&super_class) {
                break;
            }
            chain.push(super_class.clone());
            current = super_class;
        }
        chain
    }

    /// All strict supertypes (superclasses and interfaces) reachable through known classes
    fn supertypes(&self, class: &BinaryName) -> Vec<BinaryName> {
        let mut to_visit = vec![class.clone()];
        let mut seen: HashSet<BinaryName> = HashSet::new();
        seen.insert(class.clone());
        let mut found = vec![];

        while let Some(current) = to_visit.pop() {
            if let Some(info) = self.lookup(&current) {
                for super_type in info.super_class.into_iter().chain(info.interfaces) {
                    if seen.insert(super_type.clone()) {
                        found.push(super_type.clone());
                        to_visit.push(super_type);
                    }
                }
            }
        }

        found
    }

    /// Is `sub_class` a subtype of `super_class`?
    ///
    /// Gives `None` when the answer depends on classes that are not known.
    fn is_subclass(&self, sub_class: &BinaryName, super_class: &BinaryName) -> Option<bool> {
        if sub_class == super_class || super_class == &BinaryName::OBJECT {
            return Some(true);
        }
        let mut to_visit = vec![sub_class.clone()];
        let mut seen: HashSet<BinaryName> = HashSet::new();
        let mut complete = true;
        while let Some(current) = to_visit.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            match self.lookup(&current) {
                None => complete = false,
                Some(info) => {
                    for super_type in info.super_class.into_iter().chain(info.interfaces) {
                        if &super_type == super_class {
                            return Some(true);
                        }
                        to_visit.push(super_type);
                    }
                }
            }
        }
        if complete {
            Some(false)
        } else {
            None
        }
    }

    /// Closest common superclass of two classes
    ///
    /// Interfaces and anything involving unknown classes end up at `java.lang.Object`, which is
    /// what the verifier does with them too.
    fn common_super_class(&self, class1: &BinaryName, class2: &BinaryName) -> BinaryName {
        if class1 == class2 {
            return class1.clone();
        }
        let is_interface = |class: &BinaryName| {
            self.lookup(class)
                .map(|info| info.is_interface)
                .unwrap_or(false)
        };
        if is_interface(class1) || is_interface(class2) {
            return BinaryName::OBJECT;
        }
        let chain1 = self.superclass_chain(class1);
        for class in self.superclass_chain(class2) {
            if chain1.contains(&class) {
                return class;
            }
        }
        BinaryName::OBJECT
    }

    /// Is a value of type `sub_type` assignable to a location of type `super_type`?
    ///
    /// Follows `isJavaAssignable` from the verifier specification, except that unknown classes
    /// are assumed to be assignable.
    fn is_assignable(&self, sub_type: &RefType<BinaryName>, super_type: &RefType<BinaryName>) -> bool {
        match (sub_type, super_type) {
            (_, RefType::Object(class)) if class == &BinaryName::OBJECT => true,

            // Interfaces are treated like `java.lang.Object`
            (_, RefType::Object(class))
                if self.lookup(class).map(|info| info.is_interface).unwrap_or(false) =>
            {
                true
            }

            (RefType::PrimitiveArray(_) | RefType::ObjectArray(_), RefType::Object(class)) => {
                is_array_super_type(class)
            }

            (RefType::PrimitiveArray(arr1), RefType::PrimitiveArray(arr2)) => arr1 == arr2,

            (RefType::PrimitiveArray(arr1), RefType::ObjectArray(arr2)) => {
                match arr1.additional_dimensions.cmp(&arr2.additional_dimensions) {
                    Ordering::Less | Ordering::Equal => false,
                    Ordering::Greater => is_array_super_type(&arr2.element_type),
                }
            }

            (RefType::ObjectArray(arr1), RefType::ObjectArray(arr2)) => {
                match arr1.additional_dimensions.cmp(&arr2.additional_dimensions) {
                    Ordering::Less => false,
                    Ordering::Equal => self.is_assignable(
                        &RefType::Object(arr1.element_type.clone()),
                        &RefType::Object(arr2.element_type.clone()),
                    ),
                    Ordering::Greater => is_array_super_type(&arr2.element_type),
                }
            }

            (RefType::Object(class1), RefType::Object(class2)) => {
                self.is_subclass(class1, class2).unwrap_or(true)
            }

            _ => false,
        }
    }
}

/// Arrays have a small, finite set of super types
fn is_array_super_type(super_type: &BinaryName) -> bool {
    super_type == &BinaryName::OBJECT
        || super_type == &BinaryName::CLONEABLE
        || super_type == &BinaryName::SERIALIZABLE
}

/// Hierarchy backed by an explicit table of classes
#[derive(Clone, Debug, Default)]
pub struct KnownClasses {
    classes: HashMap<BinaryName, ClassInfo>,
}

impl KnownClasses {
    /// Empty table (every class is unknown)
    pub fn new() -> KnownClasses {
        KnownClasses::default()
    }

    /// Table pre-populated with the `java.lang` types the instrumentor itself refers to
    pub fn with_java_lang() -> KnownClasses {
        let mut known = KnownClasses::new();
        known.insert(
            BinaryName::OBJECT,
            ClassInfo {
                super_class: None,
                interfaces: vec![],
                is_interface: false,
            },
        );
        known.insert(BinaryName::CLONEABLE, ClassInfo::interface());
        known.insert(BinaryName::SERIALIZABLE, ClassInfo::interface());
        known.insert(BinaryName::THROWABLE, ClassInfo {
            super_class: Some(BinaryName::OBJECT),
            interfaces: vec![BinaryName::SERIALIZABLE],
            is_interface: false,
        });
        known.insert(BinaryName::EXCEPTION, ClassInfo::class(BinaryName::THROWABLE));
        known.insert(BinaryName::ERROR, ClassInfo::class(BinaryName::THROWABLE));
        known.insert(
            BinaryName::RUNTIMEEXCEPTION,
            ClassInfo::class(BinaryName::EXCEPTION),
        );
        known.insert(BinaryName::STRING, ClassInfo {
            super_class: Some(BinaryName::OBJECT),
            interfaces: vec![BinaryName::SERIALIZABLE],
            is_interface: false,
        });
        known.insert(BinaryName::CLASS, ClassInfo::class(BinaryName::OBJECT));
        known.insert(BinaryName::SYSTEM, ClassInfo::class(BinaryName::OBJECT));
        known.insert(BinaryName::NUMBER, ClassInfo {
            super_class: Some(BinaryName::OBJECT),
            interfaces: vec![BinaryName::SERIALIZABLE],
            is_interface: false,
        });
        for boxed in [
            BinaryName::BYTE,
            BinaryName::SHORT,
            BinaryName::INTEGER,
            BinaryName::LONG,
            BinaryName::FLOAT,
            BinaryName::DOUBLE,
        ] {
            known.insert(boxed, ClassInfo::class(BinaryName::NUMBER));
        }
        known.insert(BinaryName::BOOLEAN, ClassInfo::class(BinaryName::OBJECT));
        known.insert(BinaryName::CHARACTER, ClassInfo::class(BinaryName::OBJECT));
        known
    }

    /// Add or replace a class
    pub fn insert(&mut self, class: BinaryName, info: ClassInfo) {
        self.classes.insert(class, info);
    }

    /// Add the class described by a parsed class file
    pub fn insert_class_file(&mut self, class: &ClassFile) -> Result<BinaryName, Error> {
        let (name, info) = ClassInfo::from_class_file(class)?;
        self.insert(name.clone(), info);
        Ok(name)
    }
}

impl ClassHierarchy for KnownClasses {
    fn lookup(&self, class: &BinaryName) -> Option<ClassInfo> {
        self.classes.get(class).cloned()
    }
}

/// Hierarchy where one extra class shadows an underlying hierarchy
///
/// Used to make the class being rewritten visible to everything that consults the loader
/// context.
pub struct WithClass<'a> {
    pub name: BinaryName,
    pub info: ClassInfo,
    pub rest: &'a dyn ClassHierarchy,
}

impl<'a> ClassHierarchy for WithClass<'a> {
    fn lookup(&self, class: &BinaryName) -> Option<ClassInfo> {
        if class == &self.name {
            Some(self.info.clone())
        } else {
            self.rest.lookup(class)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::{ArrayType, BaseType, Name};

    fn name(name: &str) -> BinaryName {
        BinaryName::from_string(String::from(name)).unwrap()
    }

    fn hierarchy() -> KnownClasses {
        let mut known = KnownClasses::with_java_lang();
        known.insert(name("app/Shape"), ClassInfo::class(BinaryName::OBJECT));
        known.insert(name("app/Circle"), ClassInfo::class(name("app/Shape")));
        known.insert(name("app/Square"), ClassInfo::class(name("app/Shape")));
        known.insert(name("app/Drawable"), ClassInfo::interface());
        known.insert(
            name("app/Sprite"),
            ClassInfo {
                super_class: Some(name("app/Square")),
                interfaces: vec![name("app/Drawable")],
                is_interface: false,
            },
        );
        known
    }

    #[test]
    fn subclasses() {
        let known = hierarchy();
        assert_eq!(known.is_subclass(&name("app/Circle"), &name("app/Shape")), Some(true));
        assert_eq!(known.is_subclass(&name("app/Sprite"), &name("app/Drawable")), Some(true));
        assert_eq!(known.is_subclass(&name("app/Circle"), &name("app/Square")), Some(false));
        assert_eq!(known.is_subclass(&name("app/Unknown"), &name("app/Shape")), None);
        assert_eq!(
            known.is_subclass(&BinaryName::RUNTIMEEXCEPTION, &BinaryName::THROWABLE),
            Some(true)
        );
    }

    #[test]
    fn supertypes_include_interfaces() {
        let known = hierarchy();
        let supertypes = known.supertypes(&name("app/Sprite"));
        assert!(supertypes.contains(&name("app/Square")));
        assert!(supertypes.contains(&name("app/Shape")));
        assert!(supertypes.contains(&name("app/Drawable")));
        assert!(supertypes.contains(&BinaryName::OBJECT));
        assert!(!supertypes.contains(&name("app/Sprite")));
    }

    #[test]
    fn common_super_classes() {
        let known = hierarchy();
        assert_eq!(
            known.common_super_class(&name("app/Circle"), &name("app/Sprite")),
            name("app/Shape")
        );
        assert_eq!(
            known.common_super_class(&name("app/Circle"), &name("app/Drawable")),
            BinaryName::OBJECT
        );
        assert_eq!(
            known.common_super_class(&name("app/Circle"), &name("app/Unknown")),
            BinaryName::OBJECT
        );
        assert_eq!(
            known.common_super_class(&BinaryName::EXCEPTION, &BinaryName::ERROR),
            BinaryName::THROWABLE
        );
    }

    #[test]
    fn assignability() {
        let known = hierarchy();
        let object = |n: &str| RefType::Object(name(n));
        let ints = RefType::PrimitiveArray(ArrayType {
            additional_dimensions: 0,
            element_type: BaseType::Int,
        });
        let circles = RefType::ObjectArray(ArrayType {
            additional_dimensions: 0,
            element_type: name("app/Circle"),
        });
        let shapes = RefType::ObjectArray(ArrayType {
            additional_dimensions: 0,
            element_type: name("app/Shape"),
        });

        assert!(known.is_assignable(&object("app/Circle"), &object("app/Shape")));
        assert!(!known.is_assignable(&object("app/Shape"), &object("app/Circle")));
        assert!(known.is_assignable(&object("app/Shape"), &object("app/Drawable")));
        assert!(known.is_assignable(&object("app/Unknown"), &object("app/Shape")));
        assert!(known.is_assignable(&ints, &RefType::Object(BinaryName::CLONEABLE)));
        assert!(known.is_assignable(&circles, &shapes));
        assert!(!known.is_assignable(&shapes, &circles));
        assert!(!known.is_assignable(&ints, &shapes));
    }
}
