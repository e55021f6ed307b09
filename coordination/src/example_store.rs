//! Accepted fixes, kept as few-shot examples for later prompts.
//!
//! Keyed by error code, then by error message. Each message keeps at most
//! `cap` distinct transcripts in the order they were accepted.

use std::collections::BTreeMap;
use tracing::debug;

pub const DEFAULT_EXAMPLES_PER_MESSAGE: usize = 3;

#[derive(Debug, Clone)]
pub struct ExampleStore {
    cap: usize,
    by_code: BTreeMap<Option<String>, BTreeMap<String, Vec<String>>>,
}

impl Default for ExampleStore {
    fn default() -> Self {
        Self::new(DEFAULT_EXAMPLES_PER_MESSAGE)
    }
}

impl ExampleStore {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            by_code: BTreeMap::new(),
        }
    }

    /// Remember an accepted transcript. Returns whether it was added.
    pub fn record(&mut self, code: Option<&str>, message: &str, transcript: &str) -> bool {
        let transcript = transcript.trim();
        if transcript.is_empty() {
            return false;
        }
        let examples = self
            .by_code
            .entry(code.map(str::to_string))
            .or_default()
            .entry(message.to_string())
            .or_default();
        if examples.len() >= self.cap || examples.iter().any(|e| e == transcript) {
            return false;
        }
        examples.push(transcript.to_string());
        debug!(code = ?code, total = examples.len(), "Recorded example");
        true
    }

    /// Up to `n` examples for a diagnostic: those for the exact message first,
    /// then the other messages under the same code, taken round-robin.
    pub fn select(&self, code: Option<&str>, message: &str, n: usize) -> Vec<&str> {
        let Some(messages) = self.by_code.get(&code.map(str::to_string)) else {
            return Vec::new();
        };

        let mut selected: Vec<&str> = messages
            .get(message)
            .map(|v| v.iter().map(String::as_str).collect())
            .unwrap_or_default();

        let others: Vec<&Vec<String>> = messages
            .iter()
            .filter(|(m, _)| m.as_str() != message)
            .map(|(_, v)| v)
            .collect();
        let mut round = 0;
        while selected.len() < n {
            let mut exhausted = true;
            for examples in &others {
                if let Some(example) = examples.get(round) {
                    exhausted = false;
                    if !selected.contains(&example.as_str()) {
                        selected.push(example.as_str());
                    }
                }
            }
            if exhausted {
                break;
            }
            round += 1;
        }

        selected.truncate(n);
        selected
    }

    pub fn get(&self, code: Option<&str>, message: &str) -> &[String] {
        self.by_code
            .get(&code.map(str::to_string))
            .and_then(|m| m.get(message))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Total number of stored transcripts.
    pub fn len(&self) -> usize {
        self.by_code.values().flat_map(|m| m.values()).map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
