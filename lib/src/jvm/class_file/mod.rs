//! Binary layout of class files
//!
//! Everything here maps one-to-one onto the structures of the class file format. Parsing keeps
//! the constant pool indices of the input intact, so that anything not being rewritten can be
//! written back untouched.

mod attribute;
mod binary_format;
mod class;
mod constants;
mod field;
mod method;
mod version;

pub use attribute::*;
pub use binary_format::*;
pub use class::*;
pub use constants::*;
pub use field::*;
pub use method::*;
pub use version::*;
