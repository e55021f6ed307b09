//! Build Feedback Module
//!
//! Turns a build attempt into comparable structured diagnostics:
//! - Run the build command and capture stdout/stderr/exit code
//! - Extract observations with a tool-specific parser (Maven, Cargo)
//! - Decide whether a new diagnostic set is an improvement over the last one
//!
//! # Architecture
//!
//! ```text
//! BuildRunner → ProcessOutput → BuildTool::extract → [BuildObservation]
//!                                                          │
//!                     previous [BuildObservation] ──► ChangeComparator ──► ChangeVerdict
//! ```

pub mod cargo;
pub mod extractor;
pub mod maven;
pub mod observation;
pub mod policy;
pub mod runner;

pub use extractor::{BuildTool, BuildToolRegistry, DeprecationProbe, ExtractError};
pub use observation::{canonical_order, group_by_file, BuildObservation};
pub use policy::{ChangeComparator, ChangePolicy, ChangeVerdict, RejectReason};
pub use runner::{BuildError, BuildRunner, CommandRunner, ProcessOutput, RunnerConfig};
