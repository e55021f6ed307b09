//! Build tool profiles and the extractor contract.
//!
//! ```text
//! ProcessOutput ──► BuildTool::extract ──► Vec<BuildObservation>
//!                     ├── exit 0            → empty (success)
//!                     ├── killed            → ExtractError::Terminated
//!                     ├── exit 1, no stdout → one observation carrying stderr
//!                     └── otherwise         → tool-specific parse; empty → ExtractError::NoObservations
//! ```
//!
//! Tools are a closed enum. [`BuildToolRegistry`] maps configured names to
//! constructors once at startup.

use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::cargo::CargoExtractor;
use super::maven::MavenExtractor;
use super::observation::{canonical_order, BuildObservation};
use super::runner::ProcessOutput;

/// Errors raised when build output does not fit the extractor contract.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The build failed but nothing was recognized: the pattern set is out of
    /// sync with the tool's output format.
    #[error("{tool} build failed with exit code {exit_code} but no diagnostics were extracted")]
    NoObservations { tool: &'static str, exit_code: i32 },

    #[error("{tool} build terminated without an exit code")]
    Terminated { tool: &'static str },

    #[error("Unknown build tool `{name}` (known: {known})")]
    UnknownTool { name: String, known: String },
}

/// Command and pattern used to count deprecated-API warnings.
#[derive(Debug, Clone)]
pub struct DeprecationProbe {
    pub command: &'static str,
    pub pattern: Regex,
}

/// A supported build tool bound to a working copy.
#[derive(Debug, Clone)]
pub enum BuildTool {
    Maven(MavenExtractor),
    Cargo(CargoExtractor),
}

impl BuildTool {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Maven(_) => "maven",
            Self::Cargo(_) => "cargo",
        }
    }

    /// Turn a build result into observations in canonical order.
    pub fn extract(&self, output: &ProcessOutput) -> Result<Vec<BuildObservation>, ExtractError> {
        let exit_code = match output.exit_code {
            None => return Err(ExtractError::Terminated { tool: self.name() }),
            Some(0) => return Ok(Vec::new()),
            Some(code) => code,
        };

        if exit_code == 1 && output.stdout.trim().is_empty() && !output.stderr.trim().is_empty() {
            return Ok(vec![BuildObservation::new(output.stderr.trim_end())]);
        }

        let observations = match self {
            Self::Maven(maven) => maven.extract(output),
            Self::Cargo(cargo) => cargo.extract(output),
        };
        if observations.is_empty() {
            return Err(ExtractError::NoObservations {
                tool: self.name(),
                exit_code,
            });
        }
        Ok(canonical_order(&observations))
    }

    /// File name of the build descriptor.
    pub fn project_suffix(&self) -> &'static str {
        match self {
            Self::Maven(_) => "pom.xml",
            Self::Cargo(_) => "Cargo.toml",
        }
    }

    pub fn project_descriptor(&self) -> PathBuf {
        match self {
            Self::Maven(maven) => maven.project_descriptor(),
            Self::Cargo(cargo) => cargo.project_descriptor(),
        }
    }

    pub fn default_build_command(&self) -> &'static str {
        match self {
            Self::Maven(_) => "mvn clean compile -B",
            Self::Cargo(_) => "cargo build --message-format=json",
        }
    }

    /// Directories whose files must survive a repair untouched.
    pub fn test_roots(&self) -> &'static [&'static str] {
        match self {
            Self::Maven(_) => &["src/test/"],
            Self::Cargo(_) => &["tests/"],
        }
    }

    /// Final acceptance over `git diff --name-status <base>` output: no test
    /// source may be modified or deleted.
    pub fn run_final_eval(&self, name_status_diff: &str) -> bool {
        let roots = self.test_roots();
        !name_status_diff.lines().any(|line| {
            let mut parts = line.split('\t');
            let status = parts.next().unwrap_or_default();
            let touched_test = parts.any(|path| {
                roots
                    .iter()
                    .any(|root| path.starts_with(root) || path.contains(&format!("/{root}")))
            });
            touched_test && (status.starts_with('M') || status.starts_with('D') || status.starts_with('R'))
        })
    }

    pub fn deprecation_probe(&self) -> DeprecationProbe {
        match self {
            Self::Maven(_) => DeprecationProbe {
                command: "mvn clean compile -B -Dmaven.compiler.showDeprecation=true -Dmaven.compiler.showWarnings=true",
                pattern: Regex::new(r"\[WARNING\].*has been deprecated").expect("valid regex"),
            },
            Self::Cargo(_) => DeprecationProbe {
                command: "cargo build --message-format=short",
                pattern: Regex::new(r"warning: use of deprecated").expect("valid regex"),
            },
        }
    }
}

impl fmt::Display for BuildTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

type Constructor = fn(&Path) -> BuildTool;

fn maven_tool(root: &Path) -> BuildTool {
    BuildTool::Maven(MavenExtractor::new(root))
}

fn cargo_tool(root: &Path) -> BuildTool {
    BuildTool::Cargo(CargoExtractor::new(root))
}

/// Name → constructor table for build tools.
pub struct BuildToolRegistry {
    constructors: BTreeMap<&'static str, Constructor>,
}

impl BuildToolRegistry {
    pub fn new() -> Self {
        let mut constructors: BTreeMap<&'static str, Constructor> = BTreeMap::new();
        constructors.insert("maven", maven_tool);
        constructors.insert("cargo", cargo_tool);
        Self { constructors }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.constructors.keys().copied().collect()
    }

    pub fn create(&self, name: &str, root: &Path) -> Result<BuildTool, ExtractError> {
        let key = name.trim().to_ascii_lowercase();
        let key = if key == "mvn" { "maven".to_string() } else { key };
        self.constructors
            .get(key.as_str())
            .map(|ctor| ctor(root))
            .ok_or_else(|| ExtractError::UnknownTool {
                name: name.to_string(),
                known: self.names().join(", "),
            })
    }
}

impl Default for BuildToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn maven() -> BuildTool {
        BuildToolRegistry::new().create("maven", Path::new("/repo")).unwrap()
    }

    #[test]
    fn test_exit_zero_is_empty() {
        let output = ProcessOutput::new("[ERROR] looks bad but passed", "", Some(0));
        assert!(maven().extract(&output).unwrap().is_empty());
    }

    #[test]
    fn test_unrecognized_failure_is_contract_violation() {
        let output = ProcessOutput::new("gibberish", "", Some(2));
        let err = maven().extract(&output).unwrap_err();
        assert!(matches!(err, ExtractError::NoObservations { exit_code: 2, .. }));
    }

    #[test]
    fn test_killed_build() {
        let output = ProcessOutput::new("", "", None);
        assert!(matches!(
            maven().extract(&output),
            Err(ExtractError::Terminated { tool: "maven" })
        ));
    }

    #[test]
    fn test_exit_one_without_stdout_carries_stderr() {
        let output = ProcessOutput::new("", "sh: mvn: command not found\n", Some(1));
        let errors = maven().extract(&output).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].file, None);
        assert_eq!(errors[0].message, "sh: mvn: command not found");
    }

    #[test]
    fn test_registry() {
        let registry = BuildToolRegistry::default();
        assert_eq!(registry.names(), vec!["cargo", "maven"]);
        assert_eq!(registry.create("MVN", Path::new("/r")).unwrap().name(), "maven");
        let err = registry.create("gradle", Path::new("/r")).unwrap_err();
        assert!(err.to_string().contains("gradle"));
    }

    #[test]
    fn test_final_eval_rejects_touched_tests() {
        let tool = maven();
        assert!(tool.run_final_eval("M\tsrc/main/java/Foo.java\nA\tsrc/test/java/NewTest.java\n"));
        assert!(!tool.run_final_eval("M\tsrc/test/java/FooTest.java\n"));
        assert!(!tool.run_final_eval("D\tmodule/src/test/java/FooTest.java\n"));
        assert!(tool.run_final_eval(""));
    }

    #[test]
    fn test_project_descriptor() {
        assert_eq!(maven().project_descriptor(), PathBuf::from("/repo/pom.xml"));
        assert_eq!(maven().project_suffix(), "pom.xml");
    }
}
