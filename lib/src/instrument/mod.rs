//! Weave probe calls into classes
//!
//! [`Instrumentor::transform`] takes the bytes of one class and the probe descriptors that could
//! apply to it, and returns either the rewritten class or the original bytes untouched. The
//! pipeline for every method a probe selects:
//!
//!   1. decode the body into nodes and analyze it, which gives the stack and locals everywhere
//!   2. find the sites each probe anchors at, and inject a gated handler call at every site
//!      whose values can be bound ([`kinds`], [`sync`])
//!   3. re-encode, which re-analyzes (verifying the injected code) and rebuilds stack map frames
//!
//! Problems are contained at the smallest level they affect: a site whose values can't be found
//! is skipped, a method that would overflow is kept as it was, and a rewritten method that
//! doesn't type-check reverts the whole class.

mod args;
mod emit;
mod errors;
mod gates;
mod inject;
mod instrumentor;
mod kinds;
mod level;
mod matcher;
mod model;
mod probe;
mod rewrite;
mod settings;
mod slots;
mod stack;
mod store;
mod sync;
pub mod tracker;

pub use errors::*;
pub use gates::{LevelSource, SamplingService};
pub use inject::SiteReport;
pub use instrumentor::*;
pub use level::{BadLevel, Level, LevelOp};
pub use matcher::{BadPattern, DescriptorPattern, MethodPattern, NamePattern, TypePattern};
pub use model::{ClassModel, MethodModel};
pub use probe::{Binding, Handler, Kind, Location, ProbeDescriptor, Sampling, Where};
pub use settings::Settings;
pub use store::{ProbeStore, TraceIdentity};

use crate::jvm::class_file::Version;
use crate::jvm::hierarchy::ClassHierarchy;
use crate::jvm::BinaryName;

/// Everything about the class being rewritten that site injection needs
pub struct InjectionContext<'a> {
    pub settings: &'a Settings,

    /// How handler calls read the trace level
    pub level: LevelSource,

    /// How handler calls consult the sampling counters
    pub sampling: SamplingService,

    pub hierarchy: &'a dyn ClassHierarchy,

    /// Version of the class, which decides what the injected code may use
    pub version: Version,

    pub class_name: BinaryName,
}
