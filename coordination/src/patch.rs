//! Patch application: find/replace edits written back to the working copy.
//!
//! Each find block is matched exactly first. When that fails, the block is
//! matched up to whitespace: its trimmed non-empty lines, joined by `\s*`.
//! Every occurrence is replaced. A file is written only when at least one of
//! its pairs applied.

use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::parser::{EditMap, FindReplacePair};

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type PatchResult<T> = Result<T, PatchError>;

/// Configuration for patch matching behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Fall back to whitespace-tolerant matching when the exact text is absent.
    pub normalize_whitespace: bool,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            normalize_whitespace: true,
        }
    }
}

/// How a find block was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchKind {
    /// Exact byte-for-byte match.
    Exact,
    /// Matched with arbitrary whitespace between the block's lines.
    WhitespaceNormalized,
    NoMatch,
}

impl std::fmt::Display for MatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::WhitespaceNormalized => write!(f, "whitespace_normalized"),
            Self::NoMatch => write!(f, "no_match"),
        }
    }
}

/// Per-file results plus feedback for the next prompt.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    /// `Some(true)` patched, `Some(false)` nothing matched, `None` file missing.
    pub results: BTreeMap<PathBuf, Option<bool>>,
    pub feedback: Vec<String>,
}

impl ApplyOutcome {
    pub fn any_applied(&self) -> bool {
        self.results.values().any(|r| *r == Some(true))
    }

    pub fn modified_files(&self) -> Vec<&Path> {
        self.results
            .iter()
            .filter(|(_, r)| **r == Some(true))
            .map(|(p, _)| p.as_path())
            .collect()
    }
}

/// Applies an edit map to files.
pub trait EditApplier: Send + Sync {
    fn apply(&self, edits: &EditMap) -> PatchResult<ApplyOutcome>;
}

/// Applies edits to files under a working-copy root.
pub struct PatchApplier {
    root: PathBuf,
    config: PatchConfig,
}

impl PatchApplier {
    pub fn new(root: impl AsRef<Path>, config: PatchConfig) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            config,
        }
    }

    fn resolve(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.root.join(file)
        }
    }

    /// Apply one pair to `content`, returning the match kind.
    pub fn apply_pair(&self, content: &mut String, pair: &FindReplacePair) -> Result<MatchKind, String> {
        if pair.find.trim().is_empty() {
            return Err(format!(
                "Find block is empty, unable to locate where to apply\n[Replace Start]\n{}\n[Replace End]\n",
                pair.replace
            ));
        }

        if content.contains(&pair.find) {
            *content = content.replace(&pair.find, &pair.replace);
            return Ok(MatchKind::Exact);
        }
        if !self.config.normalize_whitespace {
            return Ok(MatchKind::NoMatch);
        }

        let pattern = whitespace_tolerant_pattern(&pair.find);
        let regex = Regex::new(&pattern).map_err(|e| {
            format!(
                "Replacing block raises an error\n[Error Start]\n{e}\n[Error End]\n\
                 when trying to replace block\n[Find Start]\n{}\n[Find End]\n",
                pair.find
            )
        })?;
        if !regex.is_match(content) {
            return Ok(MatchKind::NoMatch);
        }
        *content = regex.replace_all(content, NoExpand(&pair.replace)).into_owned();
        Ok(MatchKind::WhitespaceNormalized)
    }

    fn apply_file(
        &self,
        file: &Path,
        pairs: &[FindReplacePair],
        feedback: &mut Vec<String>,
    ) -> PatchResult<Option<bool>> {
        let path = self.resolve(file);
        let Ok(mut content) = std::fs::read_to_string(&path) else {
            let message = format!("File to patch doesn't exist: `{}`.", file.display());
            warn!("{message}");
            feedback.push(message);
            return Ok(None);
        };

        let mut seen: HashMap<&str, &str> = HashMap::new();
        let mut applied = 0usize;
        for pair in pairs {
            if let Some(previous) = seen.get(pair.find.as_str()) {
                if *previous != pair.replace {
                    let message = format!(
                        "Same find block with different replace block!\n\
                         [Find Start]\n{}\n[Find End]\n==>\n\
                         [Replace Start]\n{}\n[Replace End]\nvs\n[Replace Start]\n{}\n[Replace End]",
                        pair.find, previous, pair.replace
                    );
                    warn!("{message}");
                    feedback.push(message);
                } else {
                    debug!(file = %file.display(), "Skipping duplicate find/replace pair");
                }
                continue;
            }
            seen.insert(&pair.find, &pair.replace);

            match self.apply_pair(&mut content, pair) {
                Ok(MatchKind::NoMatch) => {
                    debug!(file = %file.display(), "Find block not found");
                }
                Ok(kind) => {
                    debug!(file = %file.display(), match_kind = %kind, "Applied find/replace pair");
                    applied += 1;
                }
                Err(message) => {
                    warn!("{message}");
                    feedback.push(message);
                }
            }
        }

        if applied == 0 {
            let message = format!(
                "Find blocks are not found at all for `{}`: For all find blocks count = {}.",
                file.display(),
                pairs.len()
            );
            warn!("{message}");
            feedback.push(message);
            return Ok(Some(false));
        }

        std::fs::write(&path, content).map_err(|source| PatchError::Write {
            path: path.clone(),
            source,
        })?;
        info!(file = %file.display(), applied, total = pairs.len(), "Patched file");
        Ok(Some(true))
    }
}

impl EditApplier for PatchApplier {
    fn apply(&self, edits: &EditMap) -> PatchResult<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();
        for (file, pairs) in edits {
            let result = self.apply_file(file, pairs, &mut outcome.feedback)?;
            outcome.results.insert(file.clone(), result);
        }
        Ok(outcome)
    }
}

/// Trimmed non-empty lines of `find`, escaped and joined by `\s*`.
fn whitespace_tolerant_pattern(find: &str) -> String {
    find.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s*")
}

/// Rewrite CRLF line endings as LF. Returns whether the file changed.
pub fn normalize_line_endings(path: &Path) -> io::Result<bool> {
    let content = std::fs::read_to_string(path)?;
    if !content.contains("\r\n") {
        return Ok(false);
    }
    std::fs::write(path, content.replace("\r\n", "\n"))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(files: &[(&str, &str)]) -> (TempDir, PatchApplier) {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        let applier = PatchApplier::new(dir.path(), PatchConfig::default());
        (dir, applier)
    }

    fn edits(file: &str, pairs: &[(&str, &str)]) -> EditMap {
        let mut map = EditMap::new();
        map.insert(
            PathBuf::from(file),
            pairs.iter().map(|(f, r)| FindReplacePair::new(*f, *r)).collect(),
        );
        map
    }

    #[test]
    fn test_exact_match() {
        let (dir, applier) = setup(&[("A.java", "int a = 1;\nint b = 2;\n")]);
        let outcome = applier.apply(&edits("A.java", &[("int a = 1;", "long a = 1;")])).unwrap();

        assert!(outcome.feedback.is_empty());
        assert_eq!(outcome.results[Path::new("A.java")], Some(true));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("A.java")).unwrap(),
            "long a = 1;\nint b = 2;\n"
        );
    }

    #[test]
    fn test_whitespace_tolerant_match() {
        let (dir, applier) = setup(&[("A.java", "class A {\n    void f() {\n        g();\n    }\n}\n")]);
        let find = "void f() {\n  g();\n}";
        let replace = "void f() {\n        h();\n    }";
        let mut content = std::fs::read_to_string(dir.path().join("A.java")).unwrap();
        let kind = applier
            .apply_pair(&mut content, &FindReplacePair::new(find, replace))
            .unwrap();

        assert_eq!(kind, MatchKind::WhitespaceNormalized);
        assert_eq!(content, "class A {\n    void f() {\n        h();\n    }\n}\n");
    }

    #[test]
    fn test_replacement_is_literal() {
        let (_dir, applier) = setup(&[]);
        let mut content = "a  =  1".to_string();
        applier
            .apply_pair(&mut content, &FindReplacePair::new("a  =\n1", "s = \"$1\\n\""))
            .unwrap();
        assert_eq!(content, "s = \"$1\\n\"");
    }

    #[test]
    fn test_no_match_leaves_file_untouched() {
        let (dir, applier) = setup(&[("A.java", "x\n")]);
        let outcome = applier.apply(&edits("A.java", &[("y", "z")])).unwrap();

        assert_eq!(outcome.results[Path::new("A.java")], Some(false));
        assert!(!outcome.any_applied());
        assert_eq!(outcome.feedback.len(), 1);
        assert!(outcome.feedback[0].contains("count = 1"));
        assert_eq!(std::fs::read_to_string(dir.path().join("A.java")).unwrap(), "x\n");
    }

    #[test]
    fn test_missing_file() {
        let (_dir, applier) = setup(&[]);
        let outcome = applier.apply(&edits("Nope.java", &[("a", "b")])).unwrap();
        assert_eq!(outcome.results[Path::new("Nope.java")], None);
        assert!(outcome.feedback[0].contains("doesn't exist"));
    }

    #[test]
    fn test_duplicate_and_conflicting_pairs() {
        let (dir, applier) = setup(&[("A.java", "a\nb\n")]);
        let outcome = applier
            .apply(&edits("A.java", &[("a", "x"), ("a", "x"), ("b", "y"), ("b", "z")]))
            .unwrap();

        assert_eq!(outcome.results[Path::new("A.java")], Some(true));
        assert_eq!(outcome.feedback.len(), 1);
        assert!(outcome.feedback[0].starts_with("Same find block with different replace block!"));
        assert_eq!(std::fs::read_to_string(dir.path().join("A.java")).unwrap(), "x\ny\n");
        assert_eq!(outcome.modified_files(), vec![Path::new("A.java")]);
    }

    #[test]
    fn test_empty_find_is_reported() {
        let (_dir, applier) = setup(&[("A.java", "a\n")]);
        let outcome = applier.apply(&edits("A.java", &[("  \n", "b")])).unwrap();
        assert_eq!(outcome.results[Path::new("A.java")], Some(false));
        assert!(outcome.feedback[0].starts_with("Find block is empty"));
    }

    #[test]
    fn test_normalize_line_endings() {
        let (dir, _) = setup(&[("crlf.txt", "a\r\nb\r\n"), ("lf.txt", "a\nb\n")]);
        assert!(normalize_line_endings(&dir.path().join("crlf.txt")).unwrap());
        assert!(!normalize_line_endings(&dir.path().join("lf.txt")).unwrap());
        assert_eq!(std::fs::read_to_string(dir.path().join("crlf.txt")).unwrap(), "a\nb\n");
    }

    #[test]
    fn test_match_kind_display() {
        assert_eq!(MatchKind::Exact.to_string(), "exact");
        assert_eq!(MatchKind::WhitespaceNormalized.to_string(), "whitespace_normalized");
    }
}
