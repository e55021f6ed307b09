//! Change-comparison policies: decide whether a rebuilt diagnostic set is an
//! acceptable outcome of an edit.
//!
//! The verdict is returned as a value; nothing is buffered on the comparator.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use super::observation::{group_by_file, BuildObservation};

const REVERTED_SUFFIX: &str = "after applying the suggested changes, therefore the changes are reverted.";

/// Rule used to accept or reject a new diagnostic set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangePolicy {
    /// Reject only when the diagnostics are materially the same as before.
    NoMaterialChange,
    /// Reject when the count grew or a new diagnostic appeared.
    NonIncreasing,
    /// Reject unless the count strictly shrank and nothing new appeared.
    #[default]
    Decreasing,
}

impl fmt::Display for ChangePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMaterialChange => write!(f, "no_material_change"),
            Self::NonIncreasing => write!(f, "non_increasing"),
            Self::Decreasing => write!(f, "decreasing"),
        }
    }
}

impl FromStr for ChangePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "no_material_change" | "unchanged" => Ok(Self::NoMaterialChange),
            "non_increasing" => Ok(Self::NonIncreasing),
            "decreasing" => Ok(Self::Decreasing),
            other => Err(format!("unknown change policy: {other}")),
        }
    }
}

/// Why a change was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The build descriptor had no errors before and has some now.
    DescriptorRegression,
    Unchanged,
    MoreErrors,
    NotDecreased,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DescriptorRegression => write!(f, "descriptor_regression"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::MoreErrors => write!(f, "more_errors"),
            Self::NotDecreased => write!(f, "not_decreased"),
        }
    }
}

/// Outcome of comparing two diagnostic sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeVerdict {
    pub rejected: Option<RejectReason>,
    /// Feedback for the next prompt; present whenever the change is rejected.
    pub feedback: Option<String>,
}

impl ChangeVerdict {
    pub fn accept() -> Self {
        Self {
            rejected: None,
            feedback: None,
        }
    }

    pub fn reject(reason: RejectReason, feedback: impl Into<String>) -> Self {
        Self {
            rejected: Some(reason),
            feedback: Some(feedback.into()),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.rejected.is_none()
    }
}

/// Compares a previous diagnostic set with the one measured after an edit.
#[derive(Debug, Clone)]
pub struct ChangeComparator {
    policy: ChangePolicy,
    enabled: bool,
    project_suffix: String,
}

impl ChangeComparator {
    /// `project_suffix` names the build descriptor (e.g. `pom.xml`).
    pub fn new(policy: ChangePolicy, project_suffix: impl Into<String>) -> Self {
        Self {
            policy,
            enabled: true,
            project_suffix: project_suffix.into(),
        }
    }

    /// With comparison disabled every change is accepted.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn policy(&self) -> ChangePolicy {
        self.policy
    }

    pub fn compare(&self, previous: &[BuildObservation], latest: &[BuildObservation]) -> ChangeVerdict {
        if latest.is_empty() || !self.enabled || previous.is_empty() {
            return ChangeVerdict::accept();
        }

        if let Some(verdict) = self.descriptor_regression(previous, latest) {
            return verdict;
        }

        match self.policy {
            ChangePolicy::NoMaterialChange => {
                if materially_unchanged(previous, latest) {
                    ChangeVerdict::reject(
                        RejectReason::Unchanged,
                        format!("The build errors are all the same as before, {REVERTED_SUFFIX}"),
                    )
                } else {
                    ChangeVerdict::accept()
                }
            }
            ChangePolicy::NonIncreasing => {
                if latest.len() <= previous.len() && all_preexisting(previous, latest) {
                    ChangeVerdict::accept()
                } else {
                    ChangeVerdict::reject(
                        RejectReason::MoreErrors,
                        format!("There are more build errors, {REVERTED_SUFFIX}"),
                    )
                }
            }
            ChangePolicy::Decreasing => {
                if latest.len() < previous.len() && all_preexisting(previous, latest) {
                    ChangeVerdict::accept()
                } else {
                    ChangeVerdict::reject(
                        RejectReason::NotDecreased,
                        format!("The build errors don't decrease, {REVERTED_SUFFIX}"),
                    )
                }
            }
        }
    }

    fn descriptor_regression(
        &self,
        previous: &[BuildObservation],
        latest: &[BuildObservation],
    ) -> Option<ChangeVerdict> {
        let suffix = self.project_suffix.as_str();
        if previous.iter().any(|o| o.is_project_level(suffix)) {
            return None;
        }

        let new_errors: Vec<&BuildObservation> =
            latest.iter().filter(|o| o.is_project_level(suffix)).collect();
        if new_errors.is_empty() {
            return None;
        }

        let listing: Vec<String> = new_errors
            .iter()
            .enumerate()
            .map(|(i, o)| format!("{}/{}: {}", i, new_errors.len(), o))
            .collect();
        Some(ChangeVerdict::reject(
            RejectReason::DescriptorRegression,
            format!(
                "There are errors in the project file {REVERTED_SUFFIX}```\n{}\n```",
                listing.join("\n")
            ),
        ))
    }
}

/// Same count, same files, and every pair equal modulo position.
fn materially_unchanged(previous: &[BuildObservation], latest: &[BuildObservation]) -> bool {
    if previous.len() != latest.len() {
        return false;
    }

    let before = group_by_file(previous);
    let after = group_by_file(latest);
    if !before.keys().eq(after.keys()) {
        return false;
    }

    before.iter().all(|(file, prev_group)| {
        after.get(file).is_some_and(|next_group| {
            prev_group.len() == next_group.len()
                && prev_group
                    .iter()
                    .zip(next_group)
                    .all(|(a, b)| a.same_modulo_position(b))
        })
    })
}

/// Every latest diagnostic already existed (file + code + message).
fn all_preexisting(previous: &[BuildObservation], latest: &[BuildObservation]) -> bool {
    let known: HashSet<_> = previous.iter().map(BuildObservation::identity_key).collect();
    latest.iter().all(|o| known.contains(&o.identity_key()))
}
