use crate::chunking::ChunkingConfig;
use crate::error::ConfigError;
use crate::memory::MemoryKind;
use crate::normalizer::NormalizerConfig;
use crate::retriever::SearchStrategy;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";
pub const DEFAULT_LLM_MODEL: &str = "gpt-3.5-turbo";
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const EMBEDDING_API_KEY_ENV: &str = "EMBEDDING_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RagConfig {
    pub storage_dir: PathBuf,
    pub normalizer: NormalizerConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    pub memory: MemoryConfig,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("data"),
            normalizer: NormalizerConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            retrieval: RetrievalConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl RagConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|error| ConfigError::File {
            path: path.display().to_string(),
            details: error.to_string(),
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|error| ConfigError::File {
            path: path.display().to_string(),
            details: error.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.chunking
            .validate()
            .map_err(|error| ConfigError::InvalidValue {
                field: "chunking",
                details: error.to_string(),
            })?;
        self.embedding.validate()?;
        self.llm.validate()?;
        self.retrieval.validate()?;
        self.memory.validate()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    /// Hashed character trigrams computed in-process.
    Local,
    /// OpenAI-compatible `/embeddings` endpoint.
    Http,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub dimensions: usize,
    pub endpoint: String,
    pub batch_size: usize,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Http,
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimensions: 384,
            endpoint: "http://localhost:8080/v1".to_string(),
            batch_size: 32,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl EmbeddingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dimensions == 0 {
            return Err(ConfigError::InvalidValue {
                field: "embedding.dimensions",
                details: "must be greater than zero".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "embedding.batch_size",
                details: "must be greater than zero".to_string(),
            });
        }
        if self.provider == EmbeddingProvider::Http {
            endpoint_url(&self.endpoint)?;
        }
        Ok(())
    }

    /// Key for the embedding endpoint; local servers usually need none.
    pub fn api_key(&self) -> Option<String> {
        optional_env(EMBEDDING_API_KEY_ENV)
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub temperature: f32,
    pub endpoint: String,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_LLM_MODEL.to_string(),
            temperature: 0.0,
            endpoint: "https://api.openai.com/v1".to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl LlmConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::InvalidValue {
                field: "llm.temperature",
                details: format!("{} is outside 0.0..=2.0", self.temperature),
            });
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "llm.model",
                details: "must not be empty".to_string(),
            });
        }
        endpoint_url(&self.endpoint)?;
        Ok(())
    }

    pub fn api_key(&self) -> Result<String, ConfigError> {
        optional_env(OPENAI_API_KEY_ENV).ok_or(ConfigError::MissingCredential(OPENAI_API_KEY_ENV))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Similarity,
    Diversity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub strategy: StrategyKind,
    /// Relevance weight for diversity search; lower values favor diversity.
    pub lambda: f32,
    pub fetch_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 4,
            strategy: StrategyKind::Similarity,
            lambda: 0.25,
            fetch_k: 20,
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.top_k == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retrieval.top_k",
                details: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.lambda) {
            return Err(ConfigError::InvalidValue {
                field: "retrieval.lambda",
                details: format!("{} is outside 0.0..=1.0", self.lambda),
            });
        }
        Ok(())
    }

    pub fn search_strategy(&self) -> SearchStrategy {
        match self.strategy {
            StrategyKind::Similarity => SearchStrategy::Similarity,
            StrategyKind::Diversity => SearchStrategy::Diversity {
                lambda: self.lambda,
                fetch_k: self.fetch_k.max(self.top_k),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryConfig {
    pub kind: MemoryKind,
    /// Only read by the window variant.
    pub max_turns: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            kind: MemoryKind::Buffer,
            max_turns: 10,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kind == MemoryKind::Window && self.max_turns == 0 {
            return Err(ConfigError::InvalidValue {
                field: "memory.max_turns",
                details: "window memory needs at least one turn".to_string(),
            });
        }
        Ok(())
    }
}

pub(crate) fn endpoint_url(raw: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(raw)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let value = value.trim().to_string();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    })
}
