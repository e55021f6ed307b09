//! Git-backed [`VersionControl`].

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

use super::error::{VcsError, VcsResult};
use super::{CommitInfo, VersionControl};

/// Default number of retry attempts for transient failures
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay between retries in milliseconds
const RETRY_BASE_DELAY_MS: u64 = 100;

pub struct GitManager {
    working_dir: PathBuf,
    max_retries: u32,
}

impl GitManager {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Run git command and return trimmed stdout
    fn run_git(&self, args: &[&str]) -> VcsResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .map_err(|e| VcsError::git("execute", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VcsError::git(args.join(" "), stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    /// Run git command with retry for transient failures
    ///
    /// Uses exponential backoff: 100ms, 200ms, 400ms, etc.
    fn run_git_with_retry(&self, args: &[&str]) -> VcsResult<String> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            match self.run_git(args) {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = RETRY_BASE_DELAY_MS * (1 << attempt);
                    warn!(attempt, delay_ms = delay, error = %e, "Retrying git command");
                    std::thread::sleep(std::time::Duration::from_millis(delay));
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| VcsError::git("retry", "Max retries exceeded")))
    }

    fn has_changes(&self) -> VcsResult<bool> {
        Ok(!self.status()?.is_empty())
    }
}

impl VersionControl for GitManager {
    fn status(&self) -> VcsResult<String> {
        self.run_git(&["status", "--porcelain"])
    }

    fn diff(&self, paths: &[&Path]) -> VcsResult<String> {
        let paths: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
        let mut args = vec!["diff", "HEAD", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_git(&args)
    }

    fn diff_name_status(&self, base: &str) -> VcsResult<String> {
        self.run_git(&["diff", "--name-status", base])
    }

    fn commit_all(&self, message: &str) -> VcsResult<bool> {
        self.add_all()?;
        if !self.has_changes()? {
            debug!("Nothing to commit");
            return Ok(false);
        }
        self.run_git_with_retry(&["commit", "-m", message])?;
        info!(message = message.lines().next().unwrap_or_default(), "Committed");
        Ok(true)
    }

    fn restore(&self) -> VcsResult<bool> {
        if !self.has_changes()? {
            return Ok(false);
        }
        self.run_git_with_retry(&["restore", "--staged", "."])?;
        self.run_git_with_retry(&["restore", "."])?;
        self.run_git_with_retry(&["clean", "-fd"])?;
        info!("Restored working copy");
        Ok(true)
    }

    fn new_branch(&self, branch: &str, source: Option<&str>) -> VcsResult<()> {
        if source == Some(branch) {
            return Err(VcsError::git("branch", format!("Cannot branch `{branch}` from itself")));
        }
        let mut args = vec!["branch", "-f", branch];
        if let Some(source) = source {
            args.push(source);
        }
        self.run_git_with_retry(&args)?;
        self.checkout(branch)
    }

    fn rename_branch(&self, branch: &str, source: &str) -> VcsResult<()> {
        self.new_branch(branch, Some(source))?;
        self.run_git_with_retry(&["branch", "-D", source])?;
        Ok(())
    }

    fn checkout(&self, branch: &str) -> VcsResult<()> {
        self.run_git_with_retry(&["checkout", "-f", branch])?;
        Ok(())
    }

    fn log(&self, count: usize) -> VcsResult<Vec<CommitInfo>> {
        let format = "--format=%h|%s|%aI";
        let output = self.run_git(&["log", format, &format!("-{count}")])?;

        let commits = output
            .lines()
            .filter_map(|line| {
                let parts: Vec<&str> = line.splitn(3, '|').collect();
                if parts.len() < 2 {
                    return None;
                }
                let timestamp = parts
                    .get(2)
                    .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                    .map(|dt| dt.with_timezone(&Utc));
                Some(CommitInfo {
                    hash: parts[0].to_string(),
                    message: parts[1].to_string(),
                    timestamp,
                })
            })
            .collect();

        Ok(commits)
    }

    fn head(&self) -> VcsResult<String> {
        self.run_git(&["rev-parse", "HEAD"])
    }

    fn add_all(&self) -> VcsResult<()> {
        self.run_git_with_retry(&["add", "--all", "."])?;
        Ok(())
    }

    fn untracked_files(&self) -> VcsResult<Vec<PathBuf>> {
        let status = self.status()?;
        Ok(status
            .lines()
            .filter_map(|line| line.strip_prefix("?? "))
            .map(PathBuf::from)
            .collect())
    }

    fn current_branch(&self) -> VcsResult<String> {
        self.run_git(&["rev-parse", "--abbrev-ref", "HEAD"])
    }
}
