//! Paired-block parser: positional pairing of Find and Replace blocks.

use regex::Regex;
use tracing::{debug, warn};

use super::{FindReplacePair, ParserConfig, StripMode};

/// Pattern standing in for the `{file}` placeholder in marker templates.
const FILE_TOKEN_PATTERN: &str = r"[^\]\n]+";

/// One delimited block: its start marker, raw content and end marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMatch {
    pub start: String,
    pub content: String,
    pub end: String,
}

/// A compiled start/end marker pair.
///
/// Templates are literal text with `{name}` (the block name) and optionally
/// `{file}` (a file token) placeholders.
#[derive(Debug, Clone)]
pub struct MarkerPair {
    pattern: Regex,
}

impl MarkerPair {
    pub fn new(start_template: &str, end_template: &str, name: &str) -> Result<Self, regex::Error> {
        let start = template_to_regex(start_template, name);
        let end = template_to_regex(end_template, name);
        let pattern = Regex::new(&format!("(?s)({start})(.*?)({end})"))?;
        Ok(Self { pattern })
    }

    /// All non-overlapping blocks, in order of appearance.
    pub fn find_all(&self, text: &str) -> Vec<BlockMatch> {
        self.pattern
            .captures_iter(text)
            .map(|caps| BlockMatch {
                start: caps[1].to_string(),
                content: caps[2].to_string(),
                end: caps[3].to_string(),
            })
            .collect()
    }
}

fn template_to_regex(template: &str, name: &str) -> String {
    let name = regex::escape(name);
    template
        .split("{file}")
        .map(|part| {
            part.split("{name}")
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(&name)
        })
        .collect::<Vec<_>>()
        .join(FILE_TOKEN_PATTERN)
}

/// Finds Find and Replace blocks and pairs them positionally.
#[derive(Debug, Clone)]
pub struct PairedBlockParser {
    find: MarkerPair,
    replace: MarkerPair,
    strip: StripMode,
    require_same_num_blocks: bool,
}

impl PairedBlockParser {
    pub fn new(config: &ParserConfig) -> Result<Self, regex::Error> {
        let (start, end) = config.format.templates();
        Ok(Self {
            find: MarkerPair::new(start, end, &config.find)?,
            replace: MarkerPair::new(start, end, &config.replace)?,
            strip: config.strip,
            require_same_num_blocks: config.require_same_num_blocks,
        })
    }

    /// Parse `text` into pairs plus feedback. Pairs whose find and replace
    /// are identical are dropped with feedback.
    pub fn parse(&self, text: &str) -> (Vec<FindReplacePair>, Vec<String>) {
        let finds = self.find.find_all(text);
        let replaces = self.replace.find_all(text);
        let mut feedback = Vec::new();

        debug!(finds = finds.len(), replaces = replaces.len(), "Paired blocks");

        if finds.len() != replaces.len() && self.require_same_num_blocks {
            let message = format!(
                "Number of find vs replace blocks are not the same {} != {}:\n\
                 [Find Block Start]\n{}\n[Find Block End]\n\
                 [Replace Block Start]\n{}\n[Replace Block End]\n",
                finds.len(),
                replaces.len(),
                list_contents(&finds),
                list_contents(&replaces),
            );
            warn!("{message}");
            feedback.push(message);
            return (Vec::new(), feedback);
        }

        let len = finds.len().max(replaces.len());
        let mut pairs = Vec::with_capacity(len);
        for i in 0..len {
            let find = finds.get(i).map(|b| self.strip.apply(&b.content)).unwrap_or_default();
            let replace = replaces
                .get(i)
                .map(|b| self.strip.apply(&b.content))
                .unwrap_or_default();

            if find == replace {
                let message = format!(
                    "Find and replace blocks are the same:\n\
                     [Find Start]\n{find}\n[Find End]\nvs\n[Replace Start]\n{replace}\n[Replace End]\n"
                );
                warn!("{message}");
                feedback.push(message);
                continue;
            }
            pairs.push(FindReplacePair::new(find, replace));
        }

        (pairs, feedback)
    }
}

fn list_contents(blocks: &[BlockMatch]) -> String {
    let contents: Vec<&str> = blocks.iter().map(|b| b.content.as_str()).collect();
    format!("{contents:?}")
}
