//! Deterministic fixes applied without a model call.
//!
//! One-off rules run once before the baseline build. Zero-cost rules run
//! after it, in rounds, until no rule changes anything or the round budget
//! is spent.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use coordination::{normalize_line_endings, BuildObservation, BuildTool};
use tracing::{debug, info};

pub trait FixRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns whether anything in the working copy changed.
    fn apply(&self, root: &Path, diagnostics: &[BuildObservation]) -> io::Result<bool>;
}

/// Rewrite CRLF as LF in every source file with one of `extensions`.
/// Honors `.gitignore`.
pub struct NormalizeSourceLineEndings {
    extensions: &'static [&'static str],
}

impl NormalizeSourceLineEndings {
    pub fn new(extensions: &'static [&'static str]) -> Self {
        Self { extensions }
    }
}

impl FixRule for NormalizeSourceLineEndings {
    fn name(&self) -> &'static str {
        "normalize_line_endings"
    }

    fn apply(&self, root: &Path, _diagnostics: &[BuildObservation]) -> io::Result<bool> {
        let mut changed = 0usize;
        for entry in ignore::WalkBuilder::new(root).hidden(true).build().flatten() {
            let path = entry.path();
            let wanted = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| self.extensions.contains(&ext));
            if wanted && path.is_file() && normalize_line_endings(path)? {
                changed += 1;
            }
        }
        if changed > 0 {
            info!(files = changed, "Normalized line endings");
        }
        Ok(changed > 0)
    }
}

/// Delete single-line imports the compiler reports as unresolvable.
pub struct DropUnresolvedImports {
    keyword: &'static str,
    markers: &'static [&'static str],
}

impl DropUnresolvedImports {
    pub fn java() -> Self {
        Self {
            keyword: "import ",
            markers: &["does not exist", "cannot find symbol"],
        }
    }

    pub fn rust() -> Self {
        Self {
            keyword: "use ",
            markers: &["unresolved import"],
        }
    }

    fn matches(&self, obs: &BuildObservation) -> bool {
        self.markers.iter().any(|m| obs.message.contains(m))
    }
}

impl FixRule for DropUnresolvedImports {
    fn name(&self) -> &'static str {
        "drop_unresolved_imports"
    }

    fn apply(&self, root: &Path, diagnostics: &[BuildObservation]) -> io::Result<bool> {
        let mut by_file: BTreeMap<PathBuf, Vec<usize>> = BTreeMap::new();
        for obs in diagnostics.iter().filter(|o| self.matches(o)) {
            let (Some(file), Some(line)) = (&obs.file, obs.line) else {
                continue;
            };
            let Some(index) = (line as usize).checked_sub(1) else {
                continue;
            };
            let path = if file.is_relative() { root.join(file) } else { file.clone() };
            by_file.entry(path).or_default().push(index);
        }

        let mut changed = false;
        for (path, mut indices) in by_file {
            let Ok(content) = std::fs::read_to_string(&path) else {
                debug!(file = %path.display(), "Skipping unreadable file");
                continue;
            };
            let mut lines: Vec<&str> = content.split_inclusive('\n').collect();
            indices.sort_unstable_by(|a, b| b.cmp(a));
            indices.dedup();

            let mut removed = 0;
            for index in indices {
                let is_import = lines.get(index).is_some_and(|l| {
                    let l = l.trim();
                    l.starts_with(self.keyword) && l.ends_with(';')
                });
                if is_import {
                    lines.remove(index);
                    removed += 1;
                }
            }
            if removed > 0 {
                std::fs::write(&path, lines.concat())?;
                info!(file = %path.display(), removed, "Dropped unresolved imports");
                changed = true;
            }
        }
        Ok(changed)
    }
}

#[derive(Default)]
pub struct RuleSet {
    pub one_off: Vec<Box<dyn FixRule>>,
    pub zero_cost: Vec<Box<dyn FixRule>>,
}

impl RuleSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn for_tool(tool: &BuildTool) -> Self {
        match tool {
            BuildTool::Maven(_) => Self {
                one_off: vec![Box::new(NormalizeSourceLineEndings::new(&["java", "xml"]))],
                zero_cost: vec![Box::new(DropUnresolvedImports::java())],
            },
            BuildTool::Cargo(_) => Self {
                one_off: vec![Box::new(NormalizeSourceLineEndings::new(&["rs", "toml"]))],
                zero_cost: vec![Box::new(DropUnresolvedImports::rust())],
            },
        }
    }

    pub fn apply_one_off(&self, root: &Path) -> io::Result<bool> {
        apply_all(&self.one_off, root, &[])
    }

    pub fn apply_zero_cost(&self, root: &Path, diagnostics: &[BuildObservation]) -> io::Result<bool> {
        apply_all(&self.zero_cost, root, diagnostics)
    }
}

fn apply_all(rules: &[Box<dyn FixRule>], root: &Path, diagnostics: &[BuildObservation]) -> io::Result<bool> {
    let mut changed = false;
    for rule in rules {
        if rule.apply(root, diagnostics)? {
            debug!(rule = rule.name(), "Rule changed the working copy");
            changed = true;
        }
    }
    Ok(changed)
}
