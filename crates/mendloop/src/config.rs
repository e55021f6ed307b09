//! Session configuration.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. CLI flags (applied by `main`)
//! 2. Environment variable overrides (`MENDLOOP_*`)
//! 3. Values from the TOML file passed with `--config`
//! 4. Built-in defaults
//!
//! ```toml
//! [build]
//! tool = "maven"
//! policy = "decreasing"
//!
//! [session]
//! max_iterations = 20
//!
//! [model]
//! base_url = "http://localhost:8000/v1"
//! model = "qwen2.5-coder-32b"
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use coordination::{ChangePolicy, ParserConfig, PatchConfig, RunnerConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_BASE_URL: &str = "http://localhost:8000/v1";
const DEFAULT_MODEL: &str = "gpt-4o";

const ENV_BUILD_TOOL: &str = "MENDLOOP_BUILD_TOOL";
const ENV_BUILD_COMMAND: &str = "MENDLOOP_BUILD_COMMAND";
const ENV_POLICY: &str = "MENDLOOP_POLICY";
const ENV_MAX_ITERATIONS: &str = "MENDLOOP_MAX_ITERATIONS";
const ENV_BASE_URL: &str = "MENDLOOP_BASE_URL";
const ENV_MODEL: &str = "MENDLOOP_MODEL";
const ENV_API_KEY: &str = "MENDLOOP_API_KEY";
const ENV_VALIDATION_SCRIPT: &str = "MENDLOOP_VALIDATION_SCRIPT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {message}")]
    InvalidEnv { key: &'static str, message: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level configuration, one section per component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MendConfig {
    pub build: BuildConfig,
    pub parser: ParserConfig,
    pub session: SessionBudget,
    pub model: ModelConfig,
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Registered build tool name (`maven`, `cargo`).
    pub tool: String,
    /// Overrides the tool's default build command. `{root_dir}` is substituted.
    pub command: Option<String>,
    pub policy: ChangePolicy,
    /// Compare successive builds; when off every applied change is kept.
    pub compare_builds: bool,
    pub runner: RunnerConfig,
    pub patch: PatchConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            tool: "maven".into(),
            command: None,
            policy: ChangePolicy::default(),
            compare_builds: true,
            runner: RunnerConfig::default(),
            patch: PatchConfig::default(),
        }
    }
}

/// Iteration, time and negotiation budgets for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionBudget {
    pub max_iterations: u32,
    /// Floor for the scaled budget when `errors_factor` is set.
    pub min_iterations: u32,
    /// Scale the budget with the baseline diagnostic count.
    pub errors_factor: Option<f64>,
    pub max_wall_clock_secs: u64,
    /// Rounds of zero-cost rules before the first model call.
    pub max_rule_rounds: u32,
    /// Rounds of context-file requests per iteration.
    pub max_context_rounds: u32,
    /// Files attached across all rounds of one iteration.
    pub max_context_files: usize,
    /// Few-shot examples per prompt.
    pub max_examples: usize,
    /// Past this history length a rejected response restarts the conversation.
    pub restart_history_len: usize,
    pub reflection: bool,
    pub normalize_line_endings: bool,
    /// Commit the trajectory file at the end of the session.
    pub commit_trajectory: bool,
}

impl Default for SessionBudget {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            min_iterations: 10,
            errors_factor: None,
            max_wall_clock_secs: 5400,
            max_rule_rounds: 5,
            max_context_rounds: 2,
            max_context_files: 5,
            max_examples: 3,
            restart_history_len: 6,
            reflection: true,
            normalize_line_endings: true,
            commit_trajectory: true,
        }
    }
}

impl SessionBudget {
    /// Small budget for tests and dry runs.
    pub fn quick() -> Self {
        Self {
            max_iterations: 3,
            min_iterations: 1,
            max_wall_clock_secs: 60,
            max_rule_rounds: 2,
            max_context_rounds: 1,
            max_context_files: 2,
            ..Self::default()
        }
    }

    /// Iteration budget for a session starting with `baseline` diagnostics.
    pub fn effective_iterations(&self, baseline: usize) -> u32 {
        match self.errors_factor {
            Some(factor) => {
                let scaled = (baseline as f64 * factor).floor() as u32;
                self.max_iterations.min(self.min_iterations.max(scaled))
            }
            None => self.max_iterations,
        }
    }

    pub fn wall_clock(&self) -> Duration {
        Duration::from_secs(self.max_wall_clock_secs)
    }
}

/// Backoff for model calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    /// 1.0 keeps the delay fixed, 2.0 doubles it every attempt.
    pub multiplier: f64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 2_000,
            multiplier: 2.0,
            min_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), clamped to the bounds.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let clamped = raw.clamp(self.min_delay_ms as f64, self.max_delay_ms as f64);
        Duration::from_millis(clamped as u64)
    }
}

/// OpenAI-compatible chat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    /// Read from `MENDLOOP_API_KEY` when unset.
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            model: DEFAULT_MODEL.into(),
            api_key: None,
            temperature: 0.2,
            max_tokens: 4096,
            request_timeout_secs: 300,
            retry: RetryPolicy::default(),
        }
    }
}

/// Post-session checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Shell script run in the working copy; success is exit code 0.
    pub script: Option<String>,
    /// Revision the final diff is evaluated against.
    pub base_revision: Option<String>,
    pub count_deprecations: bool,
    pub timeout_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            script: None,
            base_revision: None,
            count_deprecations: false,
            timeout_secs: 1800,
        }
    }
}

impl MendConfig {
    /// Defaults, then the optional TOML file, then `MENDLOOP_*` variables.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        if let Some(tool) = lookup(ENV_BUILD_TOOL) {
            self.build.tool = tool;
        }
        if let Some(command) = lookup(ENV_BUILD_COMMAND) {
            self.build.command = Some(command);
        }
        if let Some(policy) = lookup(ENV_POLICY) {
            self.build.policy = policy.parse().map_err(|message| ConfigError::InvalidEnv {
                key: ENV_POLICY,
                message,
            })?;
        }
        if let Some(value) = lookup(ENV_MAX_ITERATIONS) {
            self.session.max_iterations = value.trim().parse().map_err(|e| ConfigError::InvalidEnv {
                key: ENV_MAX_ITERATIONS,
                message: format!("{value}: {e}"),
            })?;
        }
        if let Some(url) = lookup(ENV_BASE_URL) {
            self.model.base_url = url;
        }
        if let Some(model) = lookup(ENV_MODEL) {
            self.model.model = model;
        }
        if let Some(key) = lookup(ENV_API_KEY) {
            self.model.api_key = Some(key);
        }
        if let Some(script) = lookup(ENV_VALIDATION_SCRIPT) {
            self.validation.script = Some(script);
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.model.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("model.retry.max_attempts must be at least 1".into()));
        }
        if self.model.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("model.retry.multiplier must be >= 1".into()));
        }
        if self.model.retry.min_delay_ms > self.model.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "model.retry.min_delay_ms exceeds max_delay_ms".into(),
            ));
        }
        if self.session.errors_factor.is_some_and(|f| f <= 0.0) {
            return Err(ConfigError::Invalid("session.errors_factor must be positive".into()));
        }
        Ok(())
    }
}
