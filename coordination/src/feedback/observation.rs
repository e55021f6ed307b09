//! Build observations: one structured record per compiler/build-tool error.
//!
//! Observations are created fresh on every build and never mutated after
//! extraction. Two notions of identity are used when comparing builds:
//!
//! ```text
//! PartialEq              file, line, column, code, message, project, related, requirement
//! same_modulo_position   same as above minus line/column
//! identity_key           file + code + message (membership checks)
//! ```
//!
//! The code snippet never takes part in identity; it only feeds prompts.

use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Marker appended to the offending line inside a code snippet.
pub const SNIPPET_MARKER: &str = "  //  Compilation error is at this line.";

/// Lines shown before and after the offending line in a snippet.
pub const SNIPPET_RADIUS: usize = 5;

/// One diagnostic from a build attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildObservation {
    /// Source file; `None` attributes the diagnostic to the build descriptor.
    pub file: Option<PathBuf>,
    /// 1-based line number.
    pub line: Option<u32>,
    /// 1-based column number.
    pub column: Option<u32>,
    /// Tool-specific error code (e.g. `E0308`).
    pub code: Option<String>,
    /// Full error message, possibly multi-line.
    pub message: String,
    /// Source lines around `line`, for prompt display only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_files: Vec<PathBuf>,
    /// Extra requirement text attached by the extractor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirement: Option<String>,
    /// Originating sub-project/module in multi-module builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<PathBuf>,
}

impl BuildObservation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Attach a position; `column` may be absent for column-less formats.
    pub fn at(mut self, line: u32, column: Option<u32>) -> Self {
        self.line = Some(line);
        self.column = column;
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<PathBuf>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Equality that ignores line and column, so a fix that shifts the
    /// surrounding lines still matches the same logical error.
    pub fn same_modulo_position(&self, other: &Self) -> bool {
        self.file == other.file
            && self.code == other.code
            && self.message == other.message
            && self.project == other.project
            && self.related_files == other.related_files
            && self.requirement == other.requirement
    }

    /// Key used for "did this diagnostic exist before" checks.
    pub fn identity_key(&self) -> (Option<&Path>, Option<&str>, &str) {
        (self.file.as_deref(), self.code.as_deref(), self.message.as_str())
    }

    /// Whether this diagnostic belongs to the build descriptor (e.g. `pom.xml`)
    /// rather than to a source file.
    pub fn is_project_level(&self, project_suffix: &str) -> bool {
        match &self.file {
            None => true,
            Some(file) => !project_suffix.is_empty() && file.ends_with(project_suffix),
        }
    }

    /// Deterministic order: file, then descending line, descending column,
    /// then code and message.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.file
            .cmp(&other.file)
            .then_with(|| Reverse(self.line).cmp(&Reverse(other.line)))
            .then_with(|| Reverse(self.column).cmp(&Reverse(other.column)))
            .then_with(|| self.code.cmp(&other.code))
            .then_with(|| self.message.cmp(&other.message))
            .then_with(|| self.project.cmp(&other.project))
    }

    /// One-line description without position, used in feedback text.
    pub fn describe_without_position(&self) -> String {
        format!(
            "{}: [{}] {}.",
            display_file(self.file.as_deref()),
            self.code.as_deref().unwrap_or("-"),
            self.message
        )
    }
}

impl PartialEq for BuildObservation {
    fn eq(&self, other: &Self) -> bool {
        self.line == other.line && self.column == other.column && self.same_modulo_position(other)
    }
}

impl Eq for BuildObservation {}

impl fmt::Display for BuildObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", display_file(self.file.as_deref()))?;
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, "@({line}, {column})")?,
            (Some(line), None) => write!(f, "@({line})")?,
            _ => {}
        }
        write!(
            f,
            ": [{}] {}.",
            self.code.as_deref().unwrap_or("-"),
            self.message
        )
    }
}

fn display_file(file: Option<&Path>) -> String {
    file.map(|p| p.display().to_string())
        .unwrap_or_else(|| "<project>".to_string())
}

/// Group observations by file, each group in canonical order.
pub fn group_by_file(observations: &[BuildObservation]) -> BTreeMap<Option<PathBuf>, Vec<BuildObservation>> {
    let mut groups: BTreeMap<Option<PathBuf>, Vec<BuildObservation>> = BTreeMap::new();
    for obs in observations {
        groups.entry(obs.file.clone()).or_default().push(obs.clone());
    }
    for group in groups.values_mut() {
        group.sort_by(BuildObservation::canonical_cmp);
    }
    groups
}

/// Flatten [`group_by_file`]; the result is the order the controller works in.
pub fn canonical_order(observations: &[BuildObservation]) -> Vec<BuildObservation> {
    group_by_file(observations).into_values().flatten().collect()
}

/// Render up to [`SNIPPET_RADIUS`] lines either side of `line` (1-based),
/// tagging the offending line with [`SNIPPET_MARKER`].
pub fn code_snippet(contents: &str, line: u32) -> Option<String> {
    let lines: Vec<&str> = contents.lines().collect();
    let index = (line as usize).checked_sub(1)?;
    if index >= lines.len() {
        return None;
    }

    let start = index.saturating_sub(SNIPPET_RADIUS);
    let end = (index + SNIPPET_RADIUS + 1).min(lines.len());
    let rendered: Vec<String> = (start..end)
        .map(|i| {
            if i == index {
                format!("{}{}", lines[i], SNIPPET_MARKER)
            } else {
                lines[i].to_string()
            }
        })
        .collect();
    Some(rendered.join("\n"))
}
