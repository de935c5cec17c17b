//! Weave tracing probes into compiled JVM classes
//!
//! The [`instrument`] module is the entry point: it matches probe descriptors against a class,
//! rewrites the matching methods, and verifies the result (returning the original class when
//! anything goes wrong). The [`jvm`] module underneath reads, rewrites, and writes class files.

pub mod instrument;
pub mod jvm;
pub mod util;
