//! Cargo JSON output parsing
//!
//! Reads `cargo build --message-format=json` output and turns error-level
//! compiler messages into observations. When cargo fails before rustc runs
//! (bad manifest, unresolvable dependency) there are no JSON errors, and the
//! `error:` lines of stderr become one observation on `Cargo.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::observation::{code_snippet, BuildObservation};
use super::runner::ProcessOutput;

/// Cargo JSON message format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reason")]
#[allow(clippy::large_enum_variant)]
pub enum CargoMessage {
    /// Compiler diagnostic message
    #[serde(rename = "compiler-message")]
    CompilerMessage {
        message: DiagnosticMessage,
        target: Option<Target>,
    },

    /// Build finished
    #[serde(rename = "build-finished")]
    BuildFinished { success: bool },

    /// Artifacts, build scripts and anything else
    #[serde(other)]
    Other,
}

impl CargoMessage {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CargoMessage::CompilerMessage { message, .. } if message.level == "error"
        )
    }

    pub fn as_diagnostic(&self) -> Option<&DiagnosticMessage> {
        match self {
            CargoMessage::CompilerMessage { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Compiler diagnostic message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticMessage {
    pub message: String,
    /// Error code (e.g., "E0308")
    pub code: Option<ErrorCode>,
    /// Severity level ("error", "warning", "note")
    pub level: String,
    #[serde(default)]
    pub spans: Vec<Span>,
    /// Child diagnostics (notes, helps, suggestions)
    #[serde(default)]
    pub children: Vec<DiagnosticMessage>,
}

impl DiagnosticMessage {
    pub fn error_code(&self) -> Option<&str> {
        self.code.as_ref().map(|c| c.code.as_str())
    }

    pub fn primary_span(&self) -> Option<&Span> {
        self.spans.iter().find(|s| s.is_primary)
    }

    /// Message plus span label and help/note children, one per line.
    fn full_message(&self) -> String {
        let mut text = self.message.clone();
        if let Some(label) = self.primary_span().and_then(|s| s.label.as_deref()) {
            text.push_str(&format!("\n  label: {label}"));
        }
        for child in &self.children {
            if matches!(child.level.as_str(), "help" | "note") {
                text.push_str(&format!("\n  = {}: {}", child.level, child.message));
            }
        }
        text
    }
}

/// Error code with explanation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCode {
    pub code: String,
    pub explanation: Option<String>,
}

/// Source span indicating where in the code the error occurred
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub file_name: String,
    /// Starting line number (1-indexed)
    pub line_start: usize,
    /// Starting column (1-indexed)
    pub column_start: usize,
    #[serde(default)]
    pub is_primary: bool,
    pub label: Option<String>,
}

/// Cargo target (crate/binary/test)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub src_path: Option<String>,
}

/// Extracts observations from cargo JSON output.
#[derive(Debug, Clone)]
pub struct CargoExtractor {
    root: PathBuf,
}

impl CargoExtractor {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// `<root>/Cargo.toml`
    pub fn project_descriptor(&self) -> PathBuf {
        self.root.join("Cargo.toml")
    }

    pub fn extract(&self, output: &ProcessOutput) -> Vec<BuildObservation> {
        let errors: Vec<BuildObservation> = parse_json_messages(&output.stdout)
            .iter()
            .filter(|m| m.is_error())
            .filter_map(CargoMessage::as_diagnostic)
            .map(|diag| self.to_observation(diag))
            .collect();
        if !errors.is_empty() {
            return errors;
        }

        self.extract_tool_failure(&output.stderr).into_iter().collect()
    }

    fn to_observation(&self, diag: &DiagnosticMessage) -> BuildObservation {
        let mut obs = BuildObservation::new(diag.full_message());
        if let Some(code) = diag.error_code() {
            obs = obs.with_code(code);
        }

        match diag.primary_span() {
            Some(span) => {
                let file = self.root.join(&span.file_name);
                let line = span.line_start as u32;
                obs = obs
                    .with_file(file.clone())
                    .at(line, Some(span.column_start as u32));
                if let Some(snippet) = std::fs::read_to_string(&file)
                    .ok()
                    .and_then(|contents| code_snippet(&contents, line))
                {
                    obs = obs.with_snippet(snippet);
                }
                obs
            }
            None => obs.with_file(self.project_descriptor()),
        }
    }

    /// `error:` lines of stderr (with their indented follow-ups) as one
    /// observation against the manifest.
    fn extract_tool_failure(&self, stderr: &str) -> Option<BuildObservation> {
        let lines: Vec<&str> = stderr.lines().map(str::trim_end).collect();
        let start = lines
            .iter()
            .position(|l| l.starts_with("error:") || l.starts_with("error["))?;
        let message = lines[start..]
            .iter()
            .filter(|l| !l.trim().is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n");
        Some(BuildObservation::new(message).with_file(self.project_descriptor()))
    }
}

/// Parse JSON lines from cargo output
fn parse_json_messages(output: &str) -> Vec<CargoMessage> {
    output
        .lines()
        .filter_map(|line| serde_json::from_str::<CargoMessage>(line).ok())
        .collect()
}
