//! Build command runner: spawns the build tool and captures its output.
//!
//! Runs async with `tokio::process::Command` and an enforced timeout. A
//! non-zero exit code is a normal result; only spawn failures and timeouts
//! are errors, and those are retried here with exponential backoff so the
//! loop controller never has to retry a build itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Base delay between retries in milliseconds
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Raw result of one build invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

impl From<std::process::Output> for ProcessOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        }
    }
}

/// Errors from invoking the build tool (not from the code being built).
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Failed to execute build command `{command}`: {message}")]
    Spawn { command: String, message: String },

    #[error("Build command `{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },
}

/// Anything that can produce a build result for the working copy.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn run(&self) -> Result<ProcessOutput, BuildError>;
}

/// Options for [`CommandRunner`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Per-invocation timeout.
    pub timeout_secs: u64,
    /// Attempts for spawn failures and timeouts.
    pub max_attempts: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 1800,
            max_attempts: 2,
        }
    }
}

/// Runs a shell command line (e.g. `mvn clean compile`) in the working copy.
///
/// `{root_dir}` in the command is replaced with the working directory.
pub struct CommandRunner {
    command: String,
    working_dir: PathBuf,
    config: RunnerConfig,
}

impl CommandRunner {
    pub fn new(command: impl Into<String>, working_dir: impl AsRef<Path>, config: RunnerConfig) -> Self {
        let working_dir = working_dir.as_ref().to_path_buf();
        let command = command
            .into()
            .replace("{root_dir}", &working_dir.display().to_string());
        Self {
            command,
            working_dir,
            config,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    async fn run_once(&self) -> Result<ProcessOutput, BuildError> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let timeout = Duration::from_secs(self.config.timeout_secs);
        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output.into()),
            Ok(Err(e)) => Err(BuildError::Spawn {
                command: self.command.clone(),
                message: e.to_string(),
            }),
            Err(_) => Err(BuildError::Timeout {
                command: self.command.clone(),
                secs: self.config.timeout_secs,
            }),
        }
    }
}

#[async_trait]
impl BuildRunner for CommandRunner {
    async fn run(&self) -> Result<ProcessOutput, BuildError> {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            debug!(command = %self.command, attempt, "Running build");
            match self.run_once().await {
                Ok(output) => return Ok(output),
                Err(e) if attempt + 1 < attempts => {
                    let delay = RETRY_BASE_DELAY_MS * (1 << attempt);
                    warn!(error = %e, delay_ms = delay, "Build invocation failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let dir = tempdir().unwrap();
        let runner = CommandRunner::new(
            "echo out; echo err 1>&2; exit 3",
            dir.path(),
            RunnerConfig::default(),
        );
        let output = runner.run().await.unwrap();
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_root_dir_placeholder() {
        let dir = tempdir().unwrap();
        let runner = CommandRunner::new("echo {root_dir}", dir.path(), RunnerConfig::default());
        assert!(runner.command().contains(&dir.path().display().to_string()));
    }

    #[tokio::test]
    async fn test_timeout_is_an_error() {
        let dir = tempdir().unwrap();
        let runner = CommandRunner::new(
            "sleep 5",
            dir.path(),
            RunnerConfig {
                timeout_secs: 1,
                max_attempts: 1,
            },
        );
        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, BuildError::Timeout { secs: 1, .. }));
    }
}
