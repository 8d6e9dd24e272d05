use crate::error::IngestError;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NormalizerConfig {
    pub page_number_pattern: String,
    pub page_range_pattern: String,
    pub header_footer_pattern: String,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            page_number_pattern: r"\bPage \d+\b".to_string(),
            page_range_pattern: r"\b\d+ of \d+\b".to_string(),
            header_footer_pattern: r"NATIONAL CANCER PLAN \| \d+".to_string(),
        }
    }
}

/// Strips page furniture from extracted PDF text.
#[derive(Debug, Clone)]
pub struct TextNormalizer {
    page_number: Regex,
    page_range: Regex,
    header_footer: Regex,
}

impl TextNormalizer {
    pub fn new(config: &NormalizerConfig) -> Result<Self, IngestError> {
        Ok(Self {
            page_number: Regex::new(&config.page_number_pattern)?,
            page_range: Regex::new(&config.page_range_pattern)?,
            header_footer: Regex::new(&config.header_footer_pattern)?,
        })
    }

    /// Repeats the cleaning pass until nothing changes, so removals that bring
    /// two fragments together cannot leave a fresh match behind.
    pub fn normalize(&self, text: &str) -> String {
        let mut current = self.clean_once(text);
        loop {
            let next = self.clean_once(&current);
            if next == current {
                return current;
            }
            current = next;
        }
    }

    fn clean_once(&self, text: &str) -> String {
        let text = self.page_number.replace_all(text, "");
        let text = self.page_range.replace_all(&text, "");
        let text = self.header_footer.replace_all(&text, "");
        collapse_whitespace(&text)
    }
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
