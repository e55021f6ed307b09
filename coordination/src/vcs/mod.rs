//! Version control capability used by the repair loop.
//!
//! Accepted iterations are committed, rejected ones restored. The loop only
//! sees [`VersionControl`]; [`GitManager`] is the git implementation.

pub mod error;
pub mod git;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use error::{VcsError, VcsResult};
pub use git::GitManager;

/// One entry of the commit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Short hash
    pub hash: String,
    /// First line of the message
    pub message: String,
    pub timestamp: Option<DateTime<Utc>>,
}

pub trait VersionControl: Send + Sync {
    /// Porcelain status; empty when clean.
    fn status(&self) -> VcsResult<String>;

    /// Working-copy diff, limited to `paths` unless empty.
    fn diff(&self, paths: &[&Path]) -> VcsResult<String>;

    /// `git diff --name-status <base>` style listing against a revision.
    fn diff_name_status(&self, base: &str) -> VcsResult<String>;

    /// Stage everything and commit. `Ok(false)` when there was nothing to commit.
    fn commit_all(&self, message: &str) -> VcsResult<bool>;

    /// Discard staged, unstaged and untracked changes. `Ok(false)` when the
    /// working copy was already clean.
    fn restore(&self) -> VcsResult<bool>;

    /// Create (or reset) `branch` at `source` (HEAD when `None`) and check it out.
    fn new_branch(&self, branch: &str, source: Option<&str>) -> VcsResult<()>;

    /// Move the tip of `source` to a new name, deleting `source`.
    fn rename_branch(&self, branch: &str, source: &str) -> VcsResult<()>;

    fn checkout(&self, branch: &str) -> VcsResult<()>;

    fn log(&self, count: usize) -> VcsResult<Vec<CommitInfo>>;

    /// Full hash of HEAD.
    fn head(&self) -> VcsResult<String>;

    fn add_all(&self) -> VcsResult<()>;

    fn untracked_files(&self) -> VcsResult<Vec<PathBuf>>;

    fn current_branch(&self) -> VcsResult<String>;
}
