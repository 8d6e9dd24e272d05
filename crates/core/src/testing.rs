use crate::embeddings::Embedder;
use crate::error::{EmbeddingError, GenerationError, IngestError};
use crate::extractor::{PageText, PdfExtractor};
use crate::llm::ChatModel;
use crate::models::{Chunk, Metadata};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

pub(crate) fn chunk(index: u64, text: &str) -> Chunk {
    Chunk {
        chunk_id: format!("chunk-{index}"),
        source_id: "doc-1".to_string(),
        page: Some(1),
        chunk_index: index,
        start_char: 0,
        end_char: text.chars().count(),
        text: text.to_string(),
        metadata: Metadata::new(),
    }
}

/// Returns hand-picked vectors per text; unknown texts map to the zero vector.
pub(crate) struct FixedEmbedder {
    dimensions: usize,
    model: String,
    vectors: HashMap<String, Vec<f32>>,
}

impl FixedEmbedder {
    pub(crate) fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            model: "fixed".to_string(),
            vectors: HashMap::new(),
        }
    }

    pub(crate) fn named(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub(crate) fn insert(&mut self, text: &str, vector: Vec<f32>) {
        self.vectors.insert(text.to_string(), vector);
    }
}

#[async_trait]
impl Embedder for FixedEmbedder {
    fn model_id(&self) -> String {
        self.model.clone()
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self
            .vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| vec![0.0; self.dimensions]))
    }
}

/// Replays canned replies in order and records every prompt it receives.
#[derive(Default)]
pub(crate) struct ScriptedChatModel {
    replies: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedChatModel {
    pub(crate) fn new(replies: Vec<Result<&str, &str>>) -> Self {
        Self {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|reply| reply.map(String::from).map_err(String::from))
                    .collect(),
            ),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(details)) => Err(GenerationError::BackendResponse {
                backend: "scripted".to_string(),
                details,
            }),
            None => Err(GenerationError::BackendResponse {
                backend: "scripted".to_string(),
                details: "no scripted reply left".to_string(),
            }),
        }
    }
}

/// Returns the same pages, numbered from 1, for any path.
pub(crate) struct StaticExtractor {
    pages: Vec<PageText>,
}

impl StaticExtractor {
    pub(crate) fn new(pages: &[&str]) -> Self {
        Self {
            pages: pages
                .iter()
                .zip(1..)
                .map(|(text, number)| PageText {
                    number,
                    text: text.to_string(),
                })
                .collect(),
        }
    }
}

impl PdfExtractor for StaticExtractor {
    fn extract_pages(&self, _path: &Path) -> Result<Vec<PageText>, IngestError> {
        Ok(self.pages.clone())
    }
}
