//! Session trajectory
//!
//! Append-only log of everything a repair session did: build snapshots,
//! commits, reverts and model exchanges. Written once, as pretty JSON, when
//! the session ends.
//!
//! ```text
//! iteration 0: Build(3, first) ─► Commit("Iteration 0 (rules) ...")
//! iteration 1: Model(prompt, response) ─► Build(3, first) ─► Revert(feedback)
//! iteration 2: Model(prompt, response) ─► Build(2, first) ─► Commit("Iteration 2 ...")
//! ```
//!
//! A build snapshot recorded at iteration `i` holds the diagnostics that
//! iteration `i + 1` targets.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::feedback::BuildObservation;

pub const SCHEMA_VERSION: u32 = 1;

/// Directory (under the working copy) holding trajectory files.
pub const TRAJECTORY_DIR: &str = ".mendloop";

/// Minimum similarity (0-100) for two diagnostics to count as the same one.
const SAME_DIAGNOSTIC_SIMILARITY: u32 = 98;

static POSITION_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@\(\d+(?:, \d+)?\)").expect("valid regex"));
static LINE_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r", line \d+,").expect("valid regex"));
static BRACKET_POSITION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\[\d+,\d+\]").expect("valid regex"));
static COLON_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":\d+:").expect("valid regex"));

#[derive(Debug, Error)]
pub enum TrajectoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid trajectory JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported trajectory schema version {found} (expected {SCHEMA_VERSION})")]
    UnsupportedVersion { found: u32 },
}

pub type TrajectoryResult<T> = Result<T, TrajectoryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCallKind {
    Repair,
    Reflection,
    ContextRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    Build {
        num_errors: usize,
        first: Option<BuildObservation>,
    },
    Commit {
        message: String,
    },
    Revert {
        feedback: Vec<String>,
    },
    Model {
        kind: ModelCallKind,
        prompt: String,
        history: Vec<Message>,
        response: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub iteration: u32,
    pub action: StepAction,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    schema_version: u32,
    session_id: String,
    root: PathBuf,
    started_at: DateTime<Utc>,
    steps: Vec<TrajectoryStep>,
}

impl Trajectory {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            session_id: Uuid::new_v4().to_string(),
            root: root.as_ref().to_path_buf(),
            started_at: Utc::now(),
            steps: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn steps(&self) -> &[TrajectoryStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn push(&mut self, iteration: u32, action: StepAction) {
        self.steps.push(TrajectoryStep {
            iteration,
            action,
            timestamp: Utc::now(),
        });
    }

    pub fn record_build(&mut self, iteration: u32, observations: &[BuildObservation]) {
        self.push(
            iteration,
            StepAction::Build {
                num_errors: observations.len(),
                first: observations.first().cloned(),
            },
        );
    }

    pub fn record_commit(&mut self, iteration: u32, message: impl Into<String>) {
        self.push(
            iteration,
            StepAction::Commit {
                message: message.into(),
            },
        );
    }

    pub fn record_revert(&mut self, iteration: u32, feedback: Vec<String>) {
        self.push(iteration, StepAction::Revert { feedback });
    }

    pub fn record_model(
        &mut self,
        iteration: u32,
        kind: ModelCallKind,
        prompt: impl Into<String>,
        history: Vec<Message>,
        response: impl Into<String>,
    ) {
        self.push(
            iteration,
            StepAction::Model {
                kind,
                prompt: prompt.into(),
                history,
                response: response.into(),
            },
        );
    }

    pub fn commit_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.action, StepAction::Commit { .. }))
            .count()
    }

    pub fn revert_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.action, StepAction::Revert { .. }))
            .count()
    }

    /// Most recent repair response given for a diagnostic resembling `target`.
    pub fn prior_response_for(&self, target: &BuildObservation) -> Option<&str> {
        let mut targets: BTreeMap<u32, &BuildObservation> = BTreeMap::new();
        let mut responses: BTreeMap<u32, &str> = BTreeMap::new();

        for step in &self.steps {
            match &step.action {
                StepAction::Build {
                    num_errors,
                    first: Some(first),
                } if *num_errors > 0 => {
                    targets.insert(step.iteration + 1, first);
                }
                StepAction::Model {
                    kind: ModelCallKind::Repair,
                    response,
                    ..
                } if !response.is_empty() => {
                    responses.insert(step.iteration, response.as_str());
                }
                _ => {}
            }
        }

        let wanted = strip_line_numbers(&target.to_string());
        targets.iter().rev().find_map(|(iteration, seen)| {
            let response = responses.get(iteration)?;
            let score = similarity(&wanted, &strip_line_numbers(&seen.to_string()));
            debug!(iteration, score, "Compared with earlier diagnostic");
            (score > SAME_DIAGNOSTIC_SIMILARITY).then_some(*response)
        })
    }

    /// `.mendloop/trajectory-<session>.json`, relative to the working copy.
    pub fn relative_path(&self) -> PathBuf {
        Path::new(TRAJECTORY_DIR).join(format!("trajectory-{}.json", self.session_id))
    }

    /// Write under the working copy root; returns the absolute path.
    pub fn save(&self) -> TrajectoryResult<PathBuf> {
        let path = self.root.join(self.relative_path());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), steps = self.steps.len(), "Saved trajectory");
        Ok(path)
    }

    pub fn load(path: &Path) -> TrajectoryResult<Self> {
        let trajectory: Self = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        if trajectory.schema_version != SCHEMA_VERSION {
            return Err(TrajectoryError::UnsupportedVersion {
                found: trajectory.schema_version,
            });
        }
        Ok(trajectory)
    }
}

fn strip_line_numbers(text: &str) -> String {
    let text = POSITION_SUFFIX.replace_all(text, "");
    let text = LINE_CLAUSE.replace_all(&text, ", line ,");
    let text = BRACKET_POSITION.replace_all(&text, ":[,]");
    COLON_LINE.replace_all(&text, "::").into_owned()
}

/// Character-level similarity on a 0-100 scale.
fn similarity(a: &str, b: &str) -> u32 {
    (TextDiff::from_chars(a, b).ratio() * 100.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(line: u32, message: &str) -> BuildObservation {
        BuildObservation::new(message)
            .with_file("/r/src/Foo.java")
            .at(line, Some(5))
    }

    #[test]
    fn test_strip_line_numbers() {
        assert_eq!(
            strip_line_numbers("/r/Foo.java@(10, 5): [-] cannot find symbol."),
            "/r/Foo.java: [-] cannot find symbol."
        );
        assert_eq!(strip_line_numbers("File \"a.py\", line 12, in f"), "File \"a.py\", line , in f");
        assert_eq!(strip_line_numbers("Foo.java:[3,4] x"), "Foo.java:[,] x");
        assert_eq!(strip_line_numbers("Foo.java:7: error"), "Foo.java:: error");
    }

    #[test]
    fn test_similarity_scale() {
        assert_eq!(similarity("abc", "abc"), 100);
        assert_eq!(similarity("abcd", "wxyz"), 0);
    }

    #[test]
    fn test_prior_response_matches_moved_diagnostic() {
        let mut trajectory = Trajectory::new("/r");
        trajectory.record_build(0, &[obs(10, "cannot find symbol: class Widget")]);
        trajectory.record_model(1, ModelCallKind::Repair, "p", vec![], "first answer");
        trajectory.record_build(1, &[obs(12, "cannot find symbol: class Widget")]);
        trajectory.record_model(2, ModelCallKind::Repair, "p", vec![], "second answer");

        let target = obs(40, "cannot find symbol: class Widget");
        assert_eq!(trajectory.prior_response_for(&target), Some("second answer"));

        let other = obs(40, "incompatible types: String cannot be converted to int");
        assert_eq!(trajectory.prior_response_for(&other), None);
    }

    #[test]
    fn test_prior_response_ignores_reflection_and_empty() {
        let mut trajectory = Trajectory::new("/r");
        trajectory.record_build(0, &[obs(10, "x")]);
        trajectory.record_model(1, ModelCallKind::Reflection, "p", vec![], "analysis");
        trajectory.record_model(1, ModelCallKind::Repair, "p", vec![], "");
        assert_eq!(trajectory.prior_response_for(&obs(10, "x")), None);
    }

    #[test]
    fn test_counts() {
        let mut trajectory = Trajectory::new("/r");
        trajectory.record_commit(0, "Iteration 0 (one-off): Apply rules before measuring the build.");
        trajectory.record_revert(1, vec!["fb".into()]);
        trajectory.record_commit(2, "Iteration 2: Build errors # = 0 <== 1.");
        assert_eq!(trajectory.commit_count(), 2);
        assert_eq!(trajectory.revert_count(), 1);
        assert_eq!(trajectory.len(), 3);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut trajectory = Trajectory::new(dir.path());
        trajectory.record_build(0, &[obs(1, "x")]);
        trajectory.record_model(
            1,
            ModelCallKind::Repair,
            "prompt",
            vec![Message::user("u"), Message::assistant("a")],
            "response",
        );

        let path = trajectory.save().unwrap();
        assert!(path.starts_with(dir.path().join(TRAJECTORY_DIR)));
        assert!(path.to_string_lossy().ends_with(&format!("trajectory-{}.json", trajectory.session_id())));

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"schema_version\": 1"));
        assert!(raw.contains("\"type\": \"model\""));

        let loaded = Trajectory::load(&path).unwrap();
        assert_eq!(loaded.steps(), trajectory.steps());
    }

    #[test]
    fn test_load_rejects_other_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        std::fs::write(
            &path,
            r#"{"schema_version":2,"session_id":"s","root":"/r","started_at":"2024-01-01T00:00:00Z","steps":[]}"#,
        )
        .unwrap();
        assert!(matches!(
            Trajectory::load(&path),
            Err(TrajectoryError::UnsupportedVersion { found: 2 })
        ));
    }
}
