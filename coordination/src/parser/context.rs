//! Context-file requests: `[ContextFile Start] path [ContextFile End]`.

use std::collections::BTreeSet;
use std::path::PathBuf;

use super::blocks::MarkerPair;
use super::ParserConfig;

#[derive(Debug, Clone)]
pub struct ContextRequestParser {
    markers: MarkerPair,
}

impl ContextRequestParser {
    pub fn new(config: &ParserConfig) -> Result<Self, regex::Error> {
        let (start, end) = config.format.templates();
        Ok(Self {
            markers: MarkerPair::new(start, end, &config.context_file)?,
        })
    }

    /// Requested paths, sorted and deduplicated. Every non-empty line of
    /// every block is one path.
    pub fn parse(&self, text: &str) -> Vec<PathBuf> {
        self.markers
            .find_all(text)
            .iter()
            .flat_map(|block| block.content.lines())
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
