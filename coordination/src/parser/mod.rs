//! Model Response Parsing
//!
//! Recovers find/replace edits, grouped per target file, from free-form
//! model text. Parsing never fails: problems come back as feedback strings
//! next to whatever was recovered, and callers treat any feedback as
//! "no usable edits".
//!
//! ```text
//! [Change Start src/Foo.java]
//! [Find Start]
//! old text
//! [Find End]
//! [Replace Start]
//! new text
//! [Replace End]
//! [Change End src/Foo.java]
//! ```

pub mod blocks;
pub mod context;
pub mod grouped;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub use blocks::{BlockMatch, MarkerPair, PairedBlockParser};
pub use context::ContextRequestParser;
pub use grouped::GroupedParser;

/// One atomic textual edit scoped to a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindReplacePair {
    pub find: String,
    pub replace: String,
}

impl FindReplacePair {
    pub fn new(find: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            find: find.into(),
            replace: replace.into(),
        }
    }
}

impl fmt::Display for FindReplacePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Find Start]\n{}\n[Find End]\n\n[Replace Start]\n{}\n[Replace End]",
            self.find, self.replace
        )
    }
}

/// Edits keyed by target file, in response order per file.
pub type EditMap = BTreeMap<PathBuf, Vec<FindReplacePair>>;

/// Result of parsing one model response.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub edits: EditMap,
    /// Only the successfully parsed sections, markers included.
    pub transcript: String,
    pub feedback: Vec<String>,
}

impl ParseOutcome {
    /// Edits are usable only when parsing produced some and raised nothing.
    pub fn is_usable(&self) -> bool {
        self.feedback.is_empty() && !self.edits.is_empty()
    }

    pub fn edit_count(&self) -> usize {
        self.edits.values().map(Vec::len).sum()
    }
}

/// Whitespace handling for block contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StripMode {
    /// Trim both ends.
    Both,
    /// Drop one leading newline, then trim the end.
    #[default]
    Trailing,
    /// Drop one leading newline only.
    Keep,
}

impl StripMode {
    pub fn apply(self, value: &str) -> String {
        if self == Self::Both {
            return value.trim().to_string();
        }
        let value = value.strip_prefix('\n').unwrap_or(value);
        match self {
            Self::Trailing => value.trim_end().to_string(),
            _ => value.to_string(),
        }
    }
}

/// Marker family used in model responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// `[Find Start] … [Find End]`
    #[default]
    Bracket,
    /// `<find> … </find>`
    XmlTag,
}

impl ResponseFormat {
    /// Start/end templates for a block; `{name}` is the block name.
    pub fn templates(self) -> (&'static str, &'static str) {
        match self {
            Self::Bracket => ("[{name} Start]", "[{name} End]"),
            Self::XmlTag => ("<{name}>", "</{name}>"),
        }
    }
}

impl FromStr for ResponseFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bracket" | "regex" => Ok(Self::Bracket),
            "xml" | "xml_tag" => Ok(Self::XmlTag),
            other => Err(format!("unknown response format: {other}")),
        }
    }
}

/// Markers and pairing rules for the response parsers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    pub format: ResponseFormat,
    pub find: String,
    pub replace: String,
    /// Super-block name; its markers embed the target file.
    pub group: String,
    /// Group templates; `{file}` stands for the target file token.
    pub group_start: String,
    pub group_end: String,
    pub context_file: String,
    pub strip: StripMode,
    /// Reject a response whose find/replace counts differ instead of padding.
    pub require_same_num_blocks: bool,
    /// Rewrite `a.b.c/File.java` as `a/b/c/File.java` when only the latter exists.
    pub rewrite_dotted_paths: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            format: ResponseFormat::Bracket,
            find: "Find".into(),
            replace: "Replace".into(),
            group: "Change".into(),
            group_start: "[{name} Start {file}]".into(),
            group_end: "[{name} End {file}]".into(),
            context_file: "ContextFile".into(),
            strip: StripMode::Trailing,
            require_same_num_blocks: true,
            rewrite_dotted_paths: true,
        }
    }
}

impl ParserConfig {
    /// XML-tag variant: `<find>`/`<replace>` inside bracket change groups.
    pub fn xml() -> Self {
        Self {
            format: ResponseFormat::XmlTag,
            find: "find".into(),
            replace: "replace".into(),
            ..Self::default()
        }
    }
}

/// Wrap feedback messages for inclusion in the next prompt.
pub fn render_feedback(messages: &[String]) -> Option<String> {
    let rendered: Vec<String> = messages
        .iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .map(|m| format!("[Feedback Start]{m}[Feedback End]"))
        .collect();
    (!rendered.is_empty()).then(|| rendered.join("\n"))
}
