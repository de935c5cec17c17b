use crate::jvm::class_file::{ClassConstantIndex, Serialize};
use crate::jvm::hierarchy::ClassHierarchy;
use crate::jvm::{ArrayType, BaseType, BinaryName, FieldType, RefType};
use crate::util::Width;
use byteorder::WriteBytesExt;

/// These types are from [this hierarchy][0]
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se7/html/jvms-4.html#jvms-4.10.1.2
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub enum VerificationType<Cls, U> {
    /// Unusable slot (never written, or the result of merging incompatible types)
    Top,

    Integer,
    Float,
    Double,
    Long,
    Null,

    /// In the constructor, the `this` parameter starts with this type then turns into an object
    /// type after `<init>` is called
    UninitializedThis,

    /// Object type
    Object(Cls),

    /// State of an object after `new` has been called but `<init>` has not been called
    ///
    ///   - during analysis, `U` is the index of the node holding the `new` instruction
    ///   - when serializing into a classfile, we use `u16` for `U`, corresponding to the offset of
    ///     the `new` instruction from the start of the method body
    Uninitialized(U),
}

/// Verification type used while analyzing a method body
pub type VType = VerificationType<RefType<BinaryName>, usize>;

impl<Cls, U> VerificationType<Cls, U> {
    /// Is this type is a reference type?
    pub fn is_reference(&self) -> bool {
        match self {
            VerificationType::Top
            | VerificationType::Integer
            | VerificationType::Float
            | VerificationType::Double
            | VerificationType::Long => false,

            VerificationType::Null
            | VerificationType::UninitializedThis
            | VerificationType::Object(_)
            | VerificationType::Uninitialized(_) => true,
        }
    }

    pub fn map<C2, U2>(
        &self,
        map_class: impl Fn(&Cls) -> C2,
        map_uninitialized: impl Fn(&U) -> U2,
    ) -> VerificationType<C2, U2> {
        self.try_map::<C2, U2, std::convert::Infallible>(
            |cls| Ok(map_class(cls)),
            |uninit| Ok(map_uninitialized(uninit)),
        )
        .unwrap_or_else(|never| match never {})
    }

    pub fn try_map<C2, U2, E>(
        &self,
        map_class: impl Fn(&Cls) -> Result<C2, E>,
        map_uninitialized: impl Fn(&U) -> Result<U2, E>,
    ) -> Result<VerificationType<C2, U2>, E> {
        Ok(match self {
            VerificationType::Top => VerificationType::Top,
            VerificationType::Integer => VerificationType::Integer,
            VerificationType::Float => VerificationType::Float,
            VerificationType::Long => VerificationType::Long,
            VerificationType::Double => VerificationType::Double,
            VerificationType::Null => VerificationType::Null,
            VerificationType::UninitializedThis => VerificationType::UninitializedThis,
            VerificationType::Object(cls) => VerificationType::Object(map_class(cls)?),
            VerificationType::Uninitialized(uninit) => {
                VerificationType::Uninitialized(map_uninitialized(uninit)?)
            }
        })
    }
}

impl<C, U> From<FieldType<C>> for VerificationType<RefType<C>, U> {
    fn from(field_type: FieldType<C>) -> Self {
        match field_type {
            FieldType::Base(BaseType::Int)
            | FieldType::Base(BaseType::Char)
            | FieldType::Base(BaseType::Short)
            | FieldType::Base(BaseType::Byte)
            | FieldType::Base(BaseType::Boolean) => VerificationType::Integer,
            FieldType::Base(BaseType::Float) => VerificationType::Float,
            FieldType::Base(BaseType::Long) => VerificationType::Long,
            FieldType::Base(BaseType::Double) => VerificationType::Double,
            FieldType::Ref(ref_type) => VerificationType::Object(ref_type),
        }
    }
}

impl Serialize for VerificationType<ClassConstantIndex, u16> {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            VerificationType::Top => 0u8.serialize(writer)?,
            VerificationType::Integer => 1u8.serialize(writer)?,
            VerificationType::Float => 2u8.serialize(writer)?,
            VerificationType::Double => 3u8.serialize(writer)?,
            VerificationType::Long => 4u8.serialize(writer)?,
            VerificationType::Null => 5u8.serialize(writer)?,
            VerificationType::UninitializedThis => 6u8.serialize(writer)?,
            VerificationType::Object(cls) => {
                7u8.serialize(writer)?;
                cls.serialize(writer)?;
            }
            VerificationType::Uninitialized(off) => {
                8u8.serialize(writer)?;
                off.serialize(writer)?;
            }
        };
        Ok(())
    }
}

impl<Cls, A> Width for VerificationType<Cls, A> {
    fn width(&self) -> usize {
        match self {
            VerificationType::Double | VerificationType::Long => 2,
            _ => 1,
        }
    }
}

impl VType {
    /// Object type for a class
    pub fn object(class: BinaryName) -> VType {
        VerificationType::Object(RefType::Object(class))
    }

    /// Check if one verification type is assignable to another
    ///
    /// Class assignability goes through the hierarchy, and anything the hierarchy can't answer is
    /// assumed to be fine.
    pub fn is_assignable(sub_type: &VType, super_type: &VType, hierarchy: &dyn ClassHierarchy) -> bool {
        match (sub_type, super_type) {
            (_, VerificationType::Top) => true,
            (VerificationType::Integer, VerificationType::Integer) => true,
            (VerificationType::Float, VerificationType::Float) => true,
            (VerificationType::Long, VerificationType::Long) => true,
            (VerificationType::Double, VerificationType::Double) => true,
            (VerificationType::Null, VerificationType::Null) => true,
            (VerificationType::Null, VerificationType::Object(_)) => true,
            (VerificationType::UninitializedThis, VerificationType::UninitializedThis) => true,
            (VerificationType::Uninitialized(n1), VerificationType::Uninitialized(n2)) => n1 == n2,
            (VerificationType::Object(t1), VerificationType::Object(t2)) => {
                hierarchy.is_assignable(t1, t2)
            }
            _ => false,
        }
    }

    /// Least upper bound of two types, as used when control flow joins
    ///
    /// Incompatible types merge to `Top`.
    pub fn merge(first: &VType, second: &VType, hierarchy: &dyn ClassHierarchy) -> VType {
        match (first, second) {
            _ if first == second => first.clone(),
            (VerificationType::Null, VerificationType::Object(_)) => second.clone(),
            (VerificationType::Object(_), VerificationType::Null) => first.clone(),
            (VerificationType::Object(t1), VerificationType::Object(t2)) => {
                VerificationType::Object(merge_ref_types(t1, t2, hierarchy))
            }
            _ => VerificationType::Top,
        }
    }
}

/// Closest common supertype of two reference types
fn merge_ref_types(
    first: &RefType<BinaryName>,
    second: &RefType<BinaryName>,
    hierarchy: &dyn ClassHierarchy,
) -> RefType<BinaryName> {
    match (first, second) {
        (RefType::Object(c1), RefType::Object(c2)) => {
            RefType::Object(hierarchy.common_super_class(c1, c2))
        }
        (RefType::ObjectArray(a1), RefType::ObjectArray(a2))
            if a1.additional_dimensions == a2.additional_dimensions =>
        {
            RefType::ObjectArray(ArrayType {
                additional_dimensions: a1.additional_dimensions,
                element_type: hierarchy.common_super_class(&a1.element_type, &a2.element_type),
            })
        }
        _ if first == second => first.clone(),
        _ => RefType::Object(BinaryName::OBJECT),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::hierarchy::{ClassInfo, KnownClasses};
    use crate::jvm::Name;

    fn class(name: &str) -> BinaryName {
        BinaryName::from_string(String::from(name)).unwrap()
    }

    #[test]
    fn field_types_become_verification_types() {
        assert_eq!(VType::from(FieldType::boolean()), VerificationType::Integer);
        assert_eq!(VType::from(FieldType::long()), VerificationType::Long);
        assert_eq!(
            VType::from(FieldType::object(BinaryName::STRING)),
            VType::object(BinaryName::STRING)
        );
        assert_eq!(VType::from(FieldType::double()).width(), 2);
        assert!(!VType::Top.is_reference());
        assert!(VType::Null.is_reference());
    }

    #[test]
    fn merging() {
        let mut known = KnownClasses::with_java_lang();
        known.insert(class("app/A"), ClassInfo::class(BinaryName::OBJECT));
        known.insert(class("app/B"), ClassInfo::class(class("app/A")));
        known.insert(class("app/C"), ClassInfo::class(class("app/A")));

        let b = VType::object(class("app/B"));
        let c = VType::object(class("app/C"));
        assert_eq!(VType::merge(&b, &c, &known), VType::object(class("app/A")));
        assert_eq!(VType::merge(&VType::Null, &b, &known), b);
        assert_eq!(VType::merge(&VType::Integer, &b, &known), VType::Top);
        assert_eq!(VType::merge(&VType::Long, &VType::Long, &known), VType::Long);

        let arrays = |name: &str| {
            VType::Object(RefType::ObjectArray(ArrayType {
                additional_dimensions: 0,
                element_type: class(name),
            }))
        };
        assert_eq!(VType::merge(&arrays("app/B"), &arrays("app/C"), &known), arrays("app/A"));
    }

    #[test]
    fn assignability() {
        let known = KnownClasses::with_java_lang();
        let exception = VType::object(BinaryName::RUNTIMEEXCEPTION);
        let throwable = VType::object(BinaryName::THROWABLE);
        assert!(VType::is_assignable(&exception, &throwable, &known));
        assert!(!VType::is_assignable(&throwable, &exception, &known));
        assert!(VType::is_assignable(&VType::Null, &throwable, &known));
        assert!(!VType::is_assignable(&VType::Integer, &VType::Float, &known));
        assert!(!VType::is_assignable(&VType::Uninitialized(3), &throwable, &known));
        assert!(VType::is_assignable(&VType::Integer, &VType::Top, &known));
    }
}
