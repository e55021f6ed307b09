//! Building blocks for automated build repair.
//!
//! This library provides:
//! - Build feedback: running the build, extracting diagnostics, comparing attempts
//! - Model response parsing into per-file find/replace edits
//! - Patch application against a working copy
//! - Version control primitives (git) for committing and reverting attempts
//! - The session trajectory and the store of accepted examples
//!
//! # Usage
//!
//! ```no_run
//! use coordination::feedback::{BuildToolRegistry, ProcessOutput};
//! use std::path::Path;
//!
//! let tool = BuildToolRegistry::new().create("maven", Path::new("/work/project")).unwrap();
//! let output = ProcessOutput::new("[INFO] BUILD SUCCESS", "", Some(0));
//! assert!(tool.extract(&output).unwrap().is_empty());
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod example_store;
pub mod feedback;
pub mod parser;
pub mod patch;
pub mod trajectory;
pub mod vcs;

// Re-export key feedback types
pub use feedback::{
    BuildError, BuildObservation, BuildRunner, BuildTool, BuildToolRegistry, ChangeComparator,
    ChangePolicy, ChangeVerdict, CommandRunner, ExtractError, ProcessOutput, RejectReason,
    RunnerConfig,
};

// Re-export parser types
pub use parser::{
    ContextRequestParser, EditMap, FindReplacePair, GroupedParser, ParseOutcome, ParserConfig,
    ResponseFormat, StripMode,
};

pub use example_store::ExampleStore;
pub use patch::{normalize_line_endings, ApplyOutcome, EditApplier, PatchApplier, PatchConfig, PatchError};
pub use trajectory::{Message, ModelCallKind, Role, Trajectory, TrajectoryError};
pub use vcs::{CommitInfo, GitManager, VcsError, VcsResult, VersionControl};
