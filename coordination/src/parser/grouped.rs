//! Grouped-by-file parser.
//!
//! Splits a response into `[Change Start <file>] … [Change End <file>]`
//! super-blocks and runs the paired-block parser inside each one.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use super::blocks::{BlockMatch, MarkerPair, PairedBlockParser};
use super::{ParseOutcome, ParserConfig};

static LEADING_WRAPPERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[`\[<|(]+").expect("valid regex"));
static TRAILING_WRAPPERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[`\]>|)]+$").expect("valid regex"));

/// Super-blocks shorter than this are assumed to be format examples quoted
/// back by the model and are skipped without feedback.
const MIN_REPORTED_CONTENT: usize = 10;

pub const NO_FILE_FEEDBACK: &str =
    "Unable to get any file to change, please double check the formats for filenames.";

#[derive(Debug, Clone)]
pub struct GroupedParser {
    groups: MarkerPair,
    blocks: PairedBlockParser,
    rewrite_dotted_paths: bool,
    root: Option<PathBuf>,
}

impl GroupedParser {
    pub fn new(config: &ParserConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            groups: MarkerPair::new(&config.group_start, &config.group_end, &config.group)?,
            blocks: PairedBlockParser::new(config)?,
            rewrite_dotted_paths: config.rewrite_dotted_paths,
            root: None,
        })
    }

    /// Resolve relative file names against `root` when checking existence.
    pub fn with_root(mut self, root: Option<PathBuf>) -> Self {
        self.root = root;
        self
    }

    pub fn parse(&self, text: &str) -> ParseOutcome {
        let mut outcome = ParseOutcome::default();

        let groups = self.groups.find_all(text);
        if groups.is_empty() {
            warn!("{NO_FILE_FEEDBACK}");
            outcome.feedback.push(NO_FILE_FEEDBACK.to_string());
        }

        for group in &groups {
            let Some(name) = group_name(&group.start, &group.end) else {
                if group.content.len() > MIN_REPORTED_CONTENT {
                    let message = format!(
                        "Unable to get same filename from\n[Start]\n{}\n[End]\nand\n[Start]\n{}\n[End]\n\
                         with the content\n[Start]\n{}\n[End]\n",
                        group.start, group.end, group.content
                    );
                    warn!("{message}");
                    outcome.feedback.push(message);
                } else {
                    debug!(block = %group.start, "Skipping short unnamed change block");
                }
                continue;
            };

            let file = self.resolve_file(&name);
            let (pairs, feedback) = self.blocks.parse(&group.content);
            outcome.feedback.extend(feedback);

            if pairs.is_empty() {
                let message = format!(
                    "Unable to parse correctly for file `{}`: Skip parsing\n[Start]\n{}\n[End]\n",
                    file.display(),
                    group.content
                );
                warn!("{message}");
                outcome.feedback.push(message);
                continue;
            }

            append_transcript(&mut outcome.transcript, group);
            outcome.edits.entry(file).or_default().extend(pairs);
        }

        debug!(
            files = outcome.edits.len(),
            edits = outcome.edit_count(),
            feedback = outcome.feedback.len(),
            "Parsed response"
        );
        outcome
    }

    /// Rewrite `a.b.c/File.java` as `a/b/c/File.java` when neither the name
    /// nor its parent exists but the rewrite does.
    fn resolve_file(&self, name: &str) -> PathBuf {
        let literal = PathBuf::from(name);
        if !self.rewrite_dotted_paths || self.exists(&literal) {
            return literal;
        }

        let Some(parent) = literal.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return literal;
        };
        if self.exists(parent) {
            return literal;
        }

        let Some(file_name) = literal.file_name() else {
            return literal;
        };
        let rewritten = PathBuf::from(parent.to_string_lossy().replace('.', "/")).join(file_name);
        if self.exists(&rewritten) {
            info!(from = name, to = %rewritten.display(), "Rewrote dotted path to existing file");
            return rewritten;
        }

        debug!(file = name, "Change target does not exist");
        literal
    }

    fn exists(&self, path: &Path) -> bool {
        match &self.root {
            Some(root) if path.is_relative() => root.join(path).exists(),
            _ => path.exists(),
        }
    }
}

/// File token shared by both markers, or `None` when they disagree or the
/// token does not look like a file name.
fn group_name(start: &str, end: &str) -> Option<String> {
    let start = marker_token(start)?;
    let end = marker_token(end)?;
    if start != end {
        debug!(start = %start, end = %end, "Mismatching file names in change markers");
        return None;
    }
    Some(start)
}

fn marker_token(marker: &str) -> Option<String> {
    let token = marker.trim_end().rsplit(' ').next().unwrap_or_default();
    let token = LEADING_WRAPPERS.replace(token, "");
    let token = TRAILING_WRAPPERS.replace(&token, "");
    token.contains('.').then(|| token.into_owned())
}

fn append_transcript(transcript: &mut String, group: &BlockMatch) {
    for part in [group.start.as_str(), group.content.as_str(), group.end.as_str()] {
        transcript.push('\n');
        transcript.push_str(part);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::FindReplacePair;

    fn parser() -> GroupedParser {
        GroupedParser::new(&ParserConfig::default()).unwrap()
    }

    #[test]
    fn test_single_file_change() {
        let text = "[Change Start a.py] [Find Start]x[Find End][Replace Start]y[Replace End] [Change End a.py]";
        let outcome = parser().parse(text);

        assert!(outcome.feedback.is_empty(), "{:?}", outcome.feedback);
        assert!(outcome.is_usable());
        assert_eq!(
            outcome.edits.get(Path::new("a.py")),
            Some(&vec![FindReplacePair::new("x", "y")])
        );
        assert!(outcome.transcript.contains("[Change Start a.py]"));
        assert!(outcome.transcript.contains("[Change End a.py]"));
    }

    #[test]
    fn test_mismatched_file_names() {
        let text = "[Change Start a.py]\n[Find Start]\nold line\n[Find End]\n[Replace Start]\nnew line\n[Replace End]\n[Change End b.py]";
        let outcome = parser().parse(text);

        assert!(outcome.edits.is_empty());
        assert_eq!(outcome.feedback.len(), 1);
        assert!(outcome.feedback[0].starts_with("Unable to get same filename from"));
        assert!(!outcome.is_usable());
    }

    #[test]
    fn test_short_mismatched_block_skipped_silently() {
        let text = "Use [Change Start file]..[Change End file] then\n\
                    [Change Start a.py][Find Start]x[Find End][Replace Start]y[Replace End][Change End a.py]";
        let outcome = parser().parse(text);
        assert!(outcome.feedback.is_empty(), "{:?}", outcome.feedback);
        assert_eq!(outcome.edit_count(), 1);
    }

    #[test]
    fn test_no_groups() {
        let outcome = parser().parse("[Find Start]x[Find End][Replace Start]y[Replace End]");
        assert!(outcome.edits.is_empty());
        assert_eq!(outcome.feedback, vec![NO_FILE_FEEDBACK.to_string()]);
    }

    #[test]
    fn test_group_without_pairs() {
        let outcome = parser().parse("[Change Start a.py]\nI would change x to y.\n[Change End a.py]");
        assert!(outcome.edits.is_empty());
        assert_eq!(outcome.feedback.len(), 1);
        assert!(outcome.feedback[0].starts_with("Unable to parse correctly for file `a.py`"));
    }

    #[test]
    fn test_wrapped_file_tokens_and_multiple_files() {
        let text = "\
[Change Start <src/A.java>]
[Find Start]
a
[Find End]
[Replace Start]
b
[Replace End]
[Change End <src/A.java>]
[Change Start `src/B.java`]
[Find Start]
c
[Find End]
[Replace Start]
d
[Replace End]
[Change End `src/B.java`]
[Change Start <src/A.java>]
[Find Start]
e
[Find End]
[Replace Start]
f
[Replace End]
[Change End <src/A.java>]
";
        let outcome = parser().parse(text);
        assert!(outcome.feedback.is_empty(), "{:?}", outcome.feedback);
        assert_eq!(outcome.edits.len(), 2);
        assert_eq!(
            outcome.edits[Path::new("src/A.java")],
            vec![FindReplacePair::new("a", "b"), FindReplacePair::new("e", "f")]
        );
        assert_eq!(outcome.edit_count(), 3);
    }

    #[test]
    fn test_block_feedback_propagates() {
        let text = "[Change Start a.py][Find Start]x[Find End][Change End a.py]";
        let outcome = parser().parse(text);
        assert!(outcome.edits.is_empty());
        assert_eq!(outcome.feedback.len(), 2);
        assert!(outcome.feedback[0].starts_with("Number of find vs replace blocks"));
    }

    #[test]
    fn test_marker_token() {
        assert_eq!(marker_token("[Change Start <a/b.java>]").as_deref(), Some("a/b.java"));
        assert_eq!(marker_token("[Change Start (x.py)]  ").as_deref(), Some("x.py"));
        assert_eq!(marker_token("[Change Start $FILEPATH]"), None);
    }

    #[test]
    fn test_dotted_path_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("com/acme")).unwrap();
        std::fs::write(dir.path().join("com/acme/Foo.java"), "class Foo {}").unwrap();

        let parser = parser().with_root(Some(dir.path().to_path_buf()));
        assert_eq!(
            parser.resolve_file("com.acme/Foo.java"),
            PathBuf::from("com/acme/Foo.java")
        );
        assert_eq!(parser.resolve_file("com/acme/Foo.java"), PathBuf::from("com/acme/Foo.java"));
        // Parent exists: a new file in a known directory stays literal.
        assert_eq!(parser.resolve_file("com/acme/New.java"), PathBuf::from("com/acme/New.java"));
        assert_eq!(parser.resolve_file("org.x/Bar.java"), PathBuf::from("org.x/Bar.java"));
    }
}
