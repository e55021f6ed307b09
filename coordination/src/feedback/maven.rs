//! Maven log extraction.
//!
//! Compiler diagnostics live between two fixed markers in the Maven log:
//!
//! ```text
//! [ERROR] COMPILATION ERROR :
//! [ERROR] /repo/src/main/java/Foo.java:[10,5] cannot find symbol
//!   symbol:   class Bar                      <- continuation, appended
//! [INFO] BUILD FAILURE
//! ```
//!
//! Without that region the tool itself failed (bad POM, missing plugin,
//! network), and a single synthetic observation targeting `pom.xml` carries
//! the relevant tail of the log.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, warn};

use super::observation::{code_snippet, BuildObservation};
use super::runner::ProcessOutput;

pub const BUILD_FAILURE: &str = "[INFO] BUILD FAILURE";
pub const COMPILATION_ERROR_START: &str = "[ERROR] COMPILATION ERROR :";

/// Lines longer than this are dropped when normalizing a log.
pub const LONG_LINE_MAX_CHARS: usize = 1250;

const ERROR_PREFIX: &str = "[ERROR]";

const EXCLUDED_PREFIXES: &[&str] = &[
    "NOTE:",
    "WARNING:",
    "Progress",
    "Downloaded",
    "Downloading",
    "[ERROR] WARNING: Unknown module:",
];

static COLUMN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[ERROR\]\s*(.+\.java):\[(\d+),(\d+)\]\s*(.*)$").expect("valid regex")
});

static NO_COLUMN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+\.java):(\d+):\s+error:(.*)$").expect("valid regex"));

/// Extracts observations from `mvn` output.
#[derive(Debug, Clone)]
pub struct MavenExtractor {
    root: PathBuf,
}

impl MavenExtractor {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// `<root>/pom.xml`
    pub fn project_descriptor(&self) -> PathBuf {
        self.root.join("pom.xml")
    }

    /// Parse a failed build's output. May return an empty list, which the
    /// caller treats as a format mismatch.
    pub fn extract(&self, output: &ProcessOutput) -> Vec<BuildObservation> {
        let lines: Vec<&str> = output.stdout.lines().map(str::trim_end).collect();

        if let Some(region) = compilation_region(&lines) {
            let errors = self.extract_compilation_errors(region);
            if !errors.is_empty() {
                return errors;
            }

            debug!("Compilation region without recognizable diagnostics");
            return region
                .iter()
                .skip(1)
                .map(|line| line.trim())
                .filter_map(|line| line.strip_prefix("[ERROR] "))
                .map(|message| BuildObservation::new(message).with_file(self.project_descriptor()))
                .collect();
        }

        self.extract_tool_failure(&lines).into_iter().collect()
    }

    fn extract_compilation_errors(&self, lines: &[&str]) -> Vec<BuildObservation> {
        let mut errors: Vec<BuildObservation> = Vec::new();
        let mut appending = false;

        for line in lines {
            match self.parse_diagnostic_line(line) {
                Some(obs) => {
                    errors.push(obs);
                    appending = true;
                }
                None if appending && line.starts_with(' ') => {
                    if let Some(last) = errors.last_mut() {
                        last.message.push('\n');
                        last.message.push_str(line);
                    }
                }
                None => appending = false,
            }
        }

        errors
    }

    fn parse_diagnostic_line(&self, line: &str) -> Option<BuildObservation> {
        let (file, line_number, column, message) = if let Some(caps) = COLUMN_PATTERN.captures(line) {
            (
                caps[1].to_string(),
                caps[2].parse::<u32>().ok()?,
                caps[3].parse::<u32>().ok(),
                caps[4].trim_end().to_string(),
            )
        } else if let Some(caps) = NO_COLUMN_PATTERN.captures(line) {
            (
                caps[1].to_string(),
                caps[2].parse::<u32>().ok()?,
                None,
                caps[3].trim().to_string(),
            )
        } else {
            return None;
        };

        let path = PathBuf::from(&file);
        if path.is_absolute() && !path.starts_with(&self.root) {
            warn!(file = %file, root = %self.root.display(), "Diagnostic outside of root dir");
        }

        let mut obs = BuildObservation::new(message)
            .with_file(path.clone())
            .at(line_number, column);
        if let Some(snippet) = self.snippet_for(&path, line_number) {
            obs = obs.with_snippet(snippet);
        }
        Some(obs)
    }

    fn snippet_for(&self, file: &Path, line: u32) -> Option<String> {
        let resolved = if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.root.join(file)
        };
        let contents = std::fs::read_to_string(&resolved).ok()?;
        code_snippet(&contents, line)
    }

    /// One observation summarizing a tool-level failure, or none when the log
    /// carries no recognizable failure block.
    fn extract_tool_failure(&self, lines: &[&str]) -> Option<BuildObservation> {
        let start = lines
            .iter()
            .position(|l| *l == BUILD_FAILURE)
            .or_else(|| {
                lines
                    .iter()
                    .position(|l| l.starts_with("[ERROR] [ERROR] ") || l.starts_with("[FATAL] "))
            })
            .or_else(|| {
                let trailing = lines
                    .iter()
                    .rev()
                    .take_while(|l| l.starts_with(ERROR_PREFIX))
                    .count();
                (trailing > 0).then(|| lines.len() - trailing)
            })?;

        let first = lines[start];
        let message = if first.starts_with("[ERROR] [ERROR] ") || first.starts_with("[FATAL] ") {
            let start = if first.starts_with("[FATAL] ") && start > 0 {
                start - 1
            } else {
                start
            };
            lines[start..].join("\n")
        } else {
            normalize_output(&lines[start..], Some(0))
        };

        Some(BuildObservation::new(message).with_file(self.project_descriptor()))
    }
}

/// Lines from the compilation-error marker up to (not including) the next
/// build-failure marker.
fn compilation_region<'a>(lines: &'a [&'a str]) -> Option<&'a [&'a str]> {
    let start = lines.iter().position(|l| *l == COMPILATION_ERROR_START)?;
    let end = start + lines[start..].iter().position(|l| *l == BUILD_FAILURE)?;
    let region = &lines[start..end];
    (!region.is_empty()).then_some(region)
}

/// Condense a Maven log: drop noise, show `[ERROR]` lines first, cap the
/// remaining lines, drop empty and overly long lines.
pub fn normalize_output(lines: &[&str], max_non_error_lines: Option<usize>) -> String {
    let kept = lines
        .iter()
        .copied()
        .filter(|l| !EXCLUDED_PREFIXES.iter().any(|p| l.starts_with(p)));

    let (errors, others): (Vec<&str>, Vec<&str>) = kept.partition(|l| l.starts_with(ERROR_PREFIX));
    let others = match max_non_error_lines {
        Some(max) => &others[..others.len().min(max)],
        None => &others[..],
    };

    errors
        .iter()
        .chain(others.iter())
        .filter(|l| !l.trim().is_empty())
        .filter(|l| l.len() <= LONG_LINE_MAX_CHARS)
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn failed(stdout: &str) -> ProcessOutput {
        ProcessOutput::new(stdout, "", Some(1))
    }

    #[test]
    fn test_column_qualified_errors_with_continuation() {
        let log = "\
[INFO] Compiling 3 source files
[ERROR] COMPILATION ERROR :
[INFO] -------------------------------------------------------------
[ERROR] /repo/src/main/java/Foo.java:[10,5] cannot find symbol
  symbol:   class Bar
  location: class Foo
[ERROR] /repo/src/main/java/Baz.java:[3,1] ';' expected
[INFO] 2 errors
[INFO] BUILD FAILURE
";
        let errors = MavenExtractor::new("/repo").extract(&failed(log));
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].file.as_deref(), Some(Path::new("/repo/src/main/java/Foo.java")));
        assert_eq!(errors[0].line, Some(10));
        assert_eq!(errors[0].column, Some(5));
        assert_eq!(
            errors[0].message,
            "cannot find symbol\n  symbol:   class Bar\n  location: class Foo"
        );
        assert_eq!(errors[1].message, "';' expected");
    }

    #[test]
    fn test_column_less_pattern() {
        let log = "\
[ERROR] COMPILATION ERROR :
/repo/src/Foo.java:7: error: incompatible types
[INFO] BUILD FAILURE
";
        let errors = MavenExtractor::new("/repo").extract(&failed(log));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, Some(7));
        assert_eq!(errors[0].column, None);
        assert_eq!(errors[0].message, "incompatible types");
    }

    #[test]
    fn test_region_without_diagnostics_falls_back_to_error_lines() {
        let log = "\
[ERROR] COMPILATION ERROR :
[ERROR] Source option 5 is no longer supported. Use 7 or later.
[ERROR] Target option 5 is no longer supported. Use 7 or later.
[INFO] BUILD FAILURE
";
        let errors = MavenExtractor::new("/repo").extract(&failed(log));
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.file.as_deref() == Some(Path::new("/repo/pom.xml"))));
        assert!(errors[0].message.starts_with("Source option 5"));
    }

    #[test]
    fn test_tool_failure_from_build_failure_marker() {
        let log = "\
[INFO] Scanning for projects...
Downloading from central: https://repo/x.pom
[INFO] BUILD FAILURE
[INFO] Total time: 1.2 s

[ERROR] Failed to execute goal on project demo: Could not resolve dependencies
";
        let errors = MavenExtractor::new("/repo").extract(&failed(log));
        assert_eq!(errors.len(), 1);
        let error = &errors[0];
        assert_eq!(error.file.as_deref(), Some(Path::new("/repo/pom.xml")));
        assert_eq!(error.line, None);
        // Error lines first, no non-error lines kept.
        assert_eq!(
            error.message,
            "[ERROR] Failed to execute goal on project demo: Could not resolve dependencies"
        );
    }

    #[test]
    fn test_tool_failure_fatal_includes_previous_line() {
        let log = "\
[INFO] Scanning for projects...
[ERROR] Some problems were encountered while processing the POMs:
[FATAL] Non-parseable POM /repo/pom.xml: end tag name </dependency> must match
";
        let errors = MavenExtractor::new("/repo").extract(&failed(log));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.starts_with("[ERROR] Some problems"));
        assert!(errors[0].message.contains("[FATAL] Non-parseable POM"));
    }

    #[test]
    fn test_tool_failure_trailing_error_block() {
        let log = "\
[INFO] Scanning for projects...
[ERROR] The goal you specified requires a project to execute
[ERROR] Re-run Maven using the -X switch
";
        let errors = MavenExtractor::new("/repo").extract(&failed(log));
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].message,
            "[ERROR] The goal you specified requires a project to execute\n[ERROR] Re-run Maven using the -X switch"
        );
    }

    #[test]
    fn test_unrecognized_log_yields_nothing() {
        let errors = MavenExtractor::new("/repo").extract(&failed("something else entirely"));
        assert!(errors.is_empty());
    }

    #[test]
    fn test_snippet_attached_when_file_readable() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("Foo.java");
        std::fs::write(&file, "class Foo {\n  int x = y;\n}\n").unwrap();

        let log = format!(
            "[ERROR] COMPILATION ERROR :\n[ERROR] {}:[2,11] cannot find symbol\n[INFO] BUILD FAILURE\n",
            file.display()
        );
        let errors = MavenExtractor::new(dir.path()).extract(&failed(&log));
        let snippet = errors[0].snippet.as_deref().unwrap();
        assert!(snippet.contains("int x = y;  //  Compilation error is at this line."));
    }

    #[test]
    fn test_normalize_output() {
        let lines = vec![
            "[INFO] noise",
            "Downloading x",
            "",
            "[ERROR] first",
            "WARNING: skip me",
            "[ERROR] second",
        ];
        assert_eq!(normalize_output(&lines, Some(0)), "[ERROR] first\n[ERROR] second");
        assert_eq!(
            normalize_output(&lines, None),
            "[ERROR] first\n[ERROR] second\n[INFO] noise"
        );
    }
}
