//! Operand stack at injection sites
//!
//! The verifier's analysis already computes, for every reachable node, the types on the operand
//! stack and which node pushed each of them. This module turns that into what the injector
//! needs: the values live at a site, as field types it can store into locals and pass to
//! handlers.

use super::errors::SiteError;
use crate::jvm::verifier::{Analysis, StackValue, VType, VerificationType};
use crate::jvm::{BinaryName, FieldType, RefType};

/// Operand stack at the node a probe fires at
#[derive(Clone, Debug)]
pub struct InjectionSite {
    /// Operand stack on entry to the anchor node (top of the stack last)
    pub stack: Vec<StackValue>,
}

impl InjectionSite {
    /// Snapshot the stack at a node, failing if the node is dead code
    pub fn at(analysis: &Analysis, node: usize) -> Result<InjectionSite, SiteError> {
        let frame = analysis
            .frame(node)
            .ok_or_else(|| SiteError::StackShape(format!("node {} is unreachable", node)))?;
        Ok(InjectionSite {
            stack: frame.stack.clone(),
        })
    }

    /// Top `count` values of the stack, deepest first
    pub fn top(&self, count: usize) -> Result<&[StackValue], SiteError> {
        if count > self.stack.len() {
            return Err(SiteError::StackShape(format!(
                "expected {} values on the stack, found {}",
                count,
                self.stack.len()
            )));
        }
        Ok(&self.stack[self.stack.len() - count..])
    }

    /// Types of the top `count` values, deepest first
    pub fn top_types(&self, count: usize) -> Result<Vec<FieldType<BinaryName>>, SiteError> {
        self.top(count)?
            .iter()
            .map(|value| field_type(&value.vtype))
            .collect()
    }
}

/// Type to use when storing or passing a stack value
///
/// `null` is treated as a `java.lang.Object`. Values which are not fully initialized objects (or
/// are the unusable halves of merged types) cannot be captured.
pub fn field_type(vtype: &VType) -> Result<FieldType<BinaryName>, SiteError> {
    match vtype {
        VerificationType::Integer => Ok(FieldType::int()),
        VerificationType::Float => Ok(FieldType::float()),
        VerificationType::Long => Ok(FieldType::long()),
        VerificationType::Double => Ok(FieldType::double()),
        VerificationType::Null => Ok(FieldType::object(BinaryName::OBJECT)),
        VerificationType::Object(ref_type) => Ok(FieldType::Ref(ref_type.clone())),
        VerificationType::Top => Err(SiteError::StackShape(String::from(
            "value of unknown type",
        ))),
        VerificationType::UninitializedThis | VerificationType::Uninitialized(_) => Err(
            SiteError::StackShape(String::from("object is not initialized yet")),
        ),
    }
}

/// Is this stack value the object allocated by the given `new` node, still uninitialized?
pub fn is_allocated_by(value: &StackValue, new_node: usize) -> bool {
    matches!(value.vtype, VerificationType::Uninitialized(node) if node == new_node)
}

/// Reference type of a value known to be a reference
pub fn ref_type(vtype: &VType) -> Option<RefType<BinaryName>> {
    match vtype {
        VerificationType::Object(ref_type) => Some(ref_type.clone()),
        VerificationType::Null => Some(RefType::Object(BinaryName::OBJECT)),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::verifier::VerifierFrame;
    use crate::util::Width;

    fn analysis(stack: Vec<StackValue>) -> Analysis {
        Analysis {
            frames: vec![
                Some(VerifierFrame {
                    locals: vec![],
                    stack,
                }),
                None,
            ],
            max_stack: 4,
            max_locals: 0,
        }
    }

    #[test]
    fn snapshots_and_types() {
        let stack = vec![
            StackValue {
                vtype: VType::object(BinaryName::STRING),
                origin: Some(0),
            },
            StackValue {
                vtype: VType::Long,
                origin: None,
            },
            StackValue {
                vtype: VType::Null,
                origin: Some(3),
            },
        ];
        let analysis = analysis(stack);

        let site = InjectionSite::at(&analysis, 0).unwrap();
        assert_eq!(
            site.top_types(2).unwrap(),
            vec![FieldType::long(), FieldType::object(BinaryName::OBJECT)]
        );
        assert_eq!(site.top(3).unwrap()[0].width(), 1);
        assert!(site.top(4).is_err());

        assert!(matches!(
            InjectionSite::at(&analysis, 1),
            Err(SiteError::StackShape(_))
        ));
    }

    #[test]
    fn uninitialized_values_cannot_be_captured() {
        assert!(field_type(&VType::Uninitialized(2)).is_err());
        assert!(field_type(&VType::UninitializedThis).is_err());
        assert!(field_type(&VType::Top).is_err());
        let fresh = StackValue {
            vtype: VType::Uninitialized(2),
            origin: Some(2),
        };
        assert!(is_allocated_by(&fresh, 2));
        assert!(!is_allocated_by(&fresh, 3));
    }
}
