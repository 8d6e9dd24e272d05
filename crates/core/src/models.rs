use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type Metadata = BTreeMap<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentFingerprint {
    pub source_id: String,
    pub title: String,
    pub source_path: String,
    pub checksum: String,
    pub ingested_at: DateTime<Utc>,
}

/// One page of extracted text together with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    pub metadata: Metadata,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn from_page(fingerprint: &DocumentFingerprint, page: u32, content: String) -> Self {
        Self::new(content)
            .with_metadata("source_id", fingerprint.source_id.clone())
            .with_metadata("source_path", fingerprint.source_path.clone())
            .with_metadata("title", fingerprint.title.clone())
            .with_metadata("checksum", fingerprint.checksum.clone())
            .with_metadata("page", page)
    }

    pub fn source_id(&self) -> &str {
        self.metadata
            .get("source_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn page(&self) -> Option<u32> {
        self.metadata
            .get("page")
            .and_then(Value::as_u64)
            .and_then(|page| u32::try_from(page).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub source_id: String,
    pub page: Option<u32>,
    pub chunk_index: u64,
    pub start_char: usize,
    pub end_char: usize,
    pub text: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk: Chunk,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub question: String,
    pub answer: String,
}

impl Turn {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<SearchHit>,
}
