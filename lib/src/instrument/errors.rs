use crate::jvm;
use crate::jvm::class_file::ConstantPoolOverflow;

/// Failure of a whole transformation
///
/// Only input which can't be a class at all ends up here. Everything else is recovered from by
/// leaving the class (or method, or site) alone.
#[derive(Debug)]
pub enum Error {
    /// The input bytes don't parse as a class file
    MalformedClass(jvm::Error),

    /// Settings name something that isn't a valid JVM name
    Settings(String),

    /// Probe descriptor that can't possibly be applied (eg. bindings not matching the handler)
    BadProbe(String),
}

impl From<jvm::Error> for Error {
    fn from(err: jvm::Error) -> Error {
        Error::MalformedClass(err)
    }
}

/// Reason a single injection site was skipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteError {
    /// The values the probe needs can't be found on the stack (or in locals)
    StackShape(String),

    /// A handler parameter can't be bound at this site
    Binding(String),

    /// The site is matched, but this combination of location and bindings isn't supported
    Unsupported(String),
}

/// Reason a method was left as it was
#[derive(Debug)]
pub enum MethodError {
    /// More than 65535 local variable slots would be needed
    SlotOverflow,

    /// The rewritten method body is too large
    CodeTooLarge,

    /// The original method body can't be decoded or analyzed (eg. it uses `jsr`)
    Undecodable(jvm::Error),

    /// The rewritten method body doesn't type-check
    ///
    /// This is never confined to the method: the whole class is reverted.
    Verification(jvm::Error),

    Jvm(jvm::Error),
}

impl From<jvm::Error> for MethodError {
    fn from(err: jvm::Error) -> MethodError {
        match err {
            jvm::Error::MethodCodeOverflow(_) | jvm::Error::MethodCodeMaxStackOverflow(_) => {
                MethodError::CodeTooLarge
            }
            jvm::Error::MethodCodeMaxLocalsOverflow(_) => MethodError::SlotOverflow,
            err @ jvm::Error::VerifierError { .. } => MethodError::Verification(err),
            other => MethodError::Jvm(other),
        }
    }
}

/// Failure while injecting one site, which may be confined to the site or affect the method
#[derive(Debug)]
pub enum InjectError {
    Site(SiteError),
    Method(MethodError),
}

impl From<SiteError> for InjectError {
    fn from(err: SiteError) -> InjectError {
        InjectError::Site(err)
    }
}

impl From<MethodError> for InjectError {
    fn from(err: MethodError) -> InjectError {
        InjectError::Method(err)
    }
}

impl From<jvm::Error> for InjectError {
    fn from(err: jvm::Error) -> InjectError {
        InjectError::Method(MethodError::from(err))
    }
}

impl From<ConstantPoolOverflow> for InjectError {
    fn from(err: ConstantPoolOverflow) -> InjectError {
        InjectError::from(jvm::Error::from(err))
    }
}
