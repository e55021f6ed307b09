//! Reflection on a failed attempt.
//!
//! When the target diagnostic was already attempted earlier in the session,
//! the model first explains why that attempt failed. The analysis is embedded
//! in the next repair prompt.

use std::sync::LazyLock;

use coordination::BuildObservation;
use regex::Regex;

static EXPLANATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<explanation>(.*?)</explanation>").expect("valid regex"));
static SUGGESTIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<suggestions>(.*?)</suggestions>").expect("valid regex"));

pub const REFLECTION_PROMPT: &str = "\
A developer attempted to fix a build error, but the error is still reported. \
Analyze why the attempt did not work and what else could be done.

<original_code>
{code}
</original_code>

<build_error>
{error}
</build_error>

<failed_attempt>
{attempt}
</failed_attempt>

Explain why the attempt failed and which alternative fixes exist:
<explanation>
[why the attempt did not work]
</explanation>

Then give a short, high-level suggestion:
<suggestions>
[concise suggestions]
</suggestions>";

pub fn reflection_prompt(target: &BuildObservation, attempt: &str) -> String {
    let code = target.snippet.as_deref().unwrap_or("(not available)");
    REFLECTION_PROMPT
        .replace("{code}", code)
        .replace("{error}", &target.to_string())
        .replace("{attempt}", attempt.trim())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reflection {
    pub explanation: String,
    pub suggestions: String,
}

impl Reflection {
    /// Pull the tagged sections out of a model response. A response without
    /// tags is kept whole as the explanation.
    pub fn parse(response: &str) -> Option<Self> {
        let section = |re: &Regex| {
            re.captures(response)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default()
        };
        let mut explanation = section(&EXPLANATION);
        let suggestions = section(&SUGGESTIONS);

        if explanation.is_empty() && suggestions.is_empty() {
            explanation = response.trim().to_string();
        }
        if explanation.is_empty() {
            return None;
        }
        Some(Self {
            explanation,
            suggestions,
        })
    }

    /// Block embedded in the repair prompt.
    pub fn render(&self) -> String {
        let mut block = format!(
            "<reflection>\nAn earlier fix for this error did not work.\nWhy it failed:\n{}",
            self.explanation
        );
        if !self.suggestions.is_empty() {
            block.push_str(&format!("\nSuggestions:\n{}", self.suggestions));
        }
        block.push_str("\n</reflection>");
        block
    }
}
