pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod memory;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod retriever;

#[cfg(test)]
mod testing;

pub use chunking::{chunk_documents, split_text, ChunkingConfig, TextSpan};
pub use config::{
    EmbeddingConfig, EmbeddingProvider, LlmConfig, MemoryConfig, RagConfig, RetrievalConfig,
    StrategyKind,
};
pub use embeddings::{
    embedder_from_config, CharacterNgramEmbedder, Embedder, HttpEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use engine::{ConversationalEngine, EngineOptions, SessionState};
pub use error::{
    ChatError, ConfigError, EmbeddingError, GenerationError, IndexError, IngestError, SearchError,
};
pub use extractor::{extract_page_texts, LopdfExtractor, PageText, PdfExtractor};
pub use index::{EmbeddingIndex, IndexManifest};
pub use ingest::{discover_pdf_files, load_documents, normalize_documents, resolve_pdf_sources};
pub use llm::{ChatModel, OpenAiChatModel};
pub use memory::{memory_from_config, BufferMemory, MemoryKind, MemoryStore, WindowMemory};
pub use models::{Answer, Chunk, Document, DocumentFingerprint, SearchHit, Turn};
pub use normalizer::{NormalizerConfig, TextNormalizer};
pub use pipeline::{ChatSession, IngestionReport, RagPipeline, RetrieverHandle};
pub use retriever::{IndexRetriever, Retriever, SearchStrategy};
