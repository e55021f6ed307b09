//! Post-session checks.
//!
//! Validation flow:
//! 1. Run the configured validation script in the working copy
//! 2. Evaluate the diff against the base revision with the build tool's
//!    final-evaluation rule (test sources must survive untouched)
//! 3. Count deprecated-API warnings with the tool's probe command
//!
//! Each check is optional; an unconfigured check is reported as `None` and
//! never fails the session.

use std::path::{Path, PathBuf};
use std::time::Duration;

use coordination::{BuildTool, ProcessOutput, VersionControl};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ValidationConfig;

/// Reported when the deprecation probe could not produce a count.
pub const DEPRECATION_COUNT_UNAVAILABLE: i64 = -1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub script_passed: Option<bool>,
    pub final_eval_passed: Option<bool>,
    pub deprecated_api_count: Option<i64>,
}

impl ValidationReport {
    /// Every configured check passed.
    pub fn passed(&self) -> bool {
        self.script_passed != Some(false) && self.final_eval_passed != Some(false)
    }
}

pub struct Validator {
    config: ValidationConfig,
    root: PathBuf,
}

impl Validator {
    pub fn new(config: ValidationConfig, root: impl AsRef<Path>) -> Self {
        Self {
            config,
            root: root.as_ref().to_path_buf(),
        }
    }

    pub async fn validate(&self, tool: &BuildTool, vcs: &dyn VersionControl) -> ValidationReport {
        let report = ValidationReport {
            script_passed: self.run_script().await,
            final_eval_passed: self.final_eval(tool, vcs),
            deprecated_api_count: match self.config.count_deprecations {
                true => Some(self.count_deprecations(tool).await),
                false => None,
            },
        };
        info!(
            script = ?report.script_passed,
            final_eval = ?report.final_eval_passed,
            deprecated = ?report.deprecated_api_count,
            "Validation complete"
        );
        report
    }

    /// `None` when no script is configured. Spawn failures and timeouts fail.
    pub async fn run_script(&self) -> Option<bool> {
        let script = self.config.script.as_deref()?;
        match self.shell(script).await {
            Some(output) => {
                if !output.success() {
                    warn!(exit_code = ?output.exit_code, "Validation script failed");
                }
                Some(output.success())
            }
            None => Some(false),
        }
    }

    /// `None` without a base revision. A diff that cannot be computed fails.
    pub fn final_eval(&self, tool: &BuildTool, vcs: &dyn VersionControl) -> Option<bool> {
        let base = self.config.base_revision.as_deref()?;
        match vcs.diff_name_status(base) {
            Ok(diff) => Some(tool.run_final_eval(&diff)),
            Err(e) => {
                warn!(base, error = %e, "Failed to diff against base revision");
                Some(false)
            }
        }
    }

    /// Matching warning lines, or [`DEPRECATION_COUNT_UNAVAILABLE`] when the
    /// probe failed without matching anything.
    pub async fn count_deprecations(&self, tool: &BuildTool) -> i64 {
        let probe = tool.deprecation_probe();
        let Some(output) = self.shell(probe.command).await else {
            return DEPRECATION_COUNT_UNAVAILABLE;
        };
        let count = output
            .stdout
            .lines()
            .chain(output.stderr.lines())
            .filter(|line| probe.pattern.is_match(line))
            .count() as i64;
        if count == 0 && !output.success() {
            return DEPRECATION_COUNT_UNAVAILABLE;
        }
        count
    }

    async fn shell(&self, command: &str) -> Option<ProcessOutput> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .kill_on_drop(true);

        let timeout = Duration::from_secs(self.config.timeout_secs);
        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => Some(output.into()),
            Ok(Err(e)) => {
                warn!(command, error = %e, "Failed to spawn command");
                None
            }
            Err(_) => {
                warn!(command, secs = self.config.timeout_secs, "Command timed out");
                None
            }
        }
    }
}
