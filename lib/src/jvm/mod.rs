//! Read, rewrite, and write JVM classes
//!
//! ### Layers
//!
//! The [`class_file`] module is a faithful model of the binary class file format. Parsing a class
//! and serializing it again (without touching anything) produces the same bytes. Anything the
//! instrumentor does not need to understand (fields, most attributes) stays in raw form.
//!
//! Method bodies get decoded further by [`code`] into a flat list of nodes, where jump targets
//! and exception ranges are labels instead of byte offsets. This is what makes inserting code
//! anywhere in a method cheap. Encoding a body goes through the [`verifier`] analysis, which
//! both type-checks the result and produces the `StackMapTable` frames.
//!
//! Reasoning about types needs some knowledge of classes outside the one being rewritten. That
//! is abstracted behind [`hierarchy::ClassHierarchy`], since only the host knows which classes
//! are loadable.
//!
//! ### Simple example
//!
//! Decoding then re-encoding a method body:
//!
//! ```
//! use bytetrace::jvm::class_file::{Code as CodeAttribute, ConstantsPool, Version};
//! use bytetrace::jvm::code::{decode, encode::encode};
//! use bytetrace::jvm::hierarchy::KnownClasses;
//! use bytetrace::jvm::verifier::MethodContext;
//! use bytetrace::jvm::*;
//!
//! # fn round_trip(attribute: &CodeAttribute, constants: &mut ConstantsPool) -> Result<(), Error> {
//! let hierarchy = KnownClasses::with_java_lang();
//! let context = MethodContext {
//!     this_class: BinaryName::from_string(String::from("app/Point")).unwrap(),
//!     descriptor: MethodDescriptor {
//!         parameters: vec![FieldType::int(), FieldType::int()],
//!         return_type: None,
//!     },
//!     is_static: true,
//!     is_constructor: false,
//!     hierarchy: &hierarchy,
//! };
//!
//! let code = decode(attribute, constants)?;
//! let encoded: CodeAttribute = encode(code, &context, constants, Version::JAVA8)?;
//! # Ok(())
//! # }
//! ```

mod access_flags;
pub mod class_file;
pub mod code;
mod descriptors;
mod errors;
pub mod hierarchy;
mod names;
pub mod verifier;

pub use access_flags::*;
pub use descriptors::*;
pub use errors::*;
pub use names::*;
