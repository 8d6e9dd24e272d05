use crate::chunking::chunk_documents;
use crate::config::{MemoryConfig, RagConfig};
use crate::embeddings::Embedder;
use crate::engine::{ConversationalEngine, EngineOptions};
use crate::error::{ChatError, IndexError, IngestError};
use crate::extractor::{LopdfExtractor, PdfExtractor};
use crate::index::{EmbeddingIndex, IndexManifest};
use crate::ingest::{load_documents, normalize_documents};
use crate::llm::ChatModel;
use crate::memory::{memory_from_config, MemoryStore};
use crate::models::{Answer, Document};
use crate::normalizer::TextNormalizer;
use crate::retriever::IndexRetriever;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, info_span, Instrument, Span};

pub type ChatSession =
    ConversationalEngine<Arc<IndexRetriever>, Arc<dyn ChatModel>, Box<dyn MemoryStore>>;

#[derive(Debug, Clone)]
pub struct IngestionReport {
    pub sources: usize,
    pub pages: usize,
    /// Pages left after normalization.
    pub documents: usize,
    pub chunks: usize,
    pub storage_dir: PathBuf,
    pub manifest: IndexManifest,
}

/// Offline side of the system: PDF to persisted index, and index back to a
/// queryable [`RetrieverHandle`].
pub struct RagPipeline {
    config: RagConfig,
    embedder: Arc<dyn Embedder>,
    normalizer: TextNormalizer,
    span: Span,
}

impl RagPipeline {
    pub fn new(config: RagConfig, embedder: Arc<dyn Embedder>) -> Result<Self, IngestError> {
        config.validate()?;
        let normalizer = TextNormalizer::new(&config.normalizer)?;
        Ok(Self {
            config,
            embedder,
            normalizer,
            span: Span::current(),
        })
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    /// Builds the index from a PDF file or folder and persists it under the
    /// configured storage directory.
    pub async fn ingest(&self, pdf_path: &Path) -> Result<IngestionReport, IngestError> {
        self.ingest_with(pdf_path, &LopdfExtractor).await
    }

    pub async fn ingest_with<X>(
        &self,
        pdf_path: &Path,
        extractor: &X,
    ) -> Result<IngestionReport, IngestError>
    where
        X: PdfExtractor + ?Sized,
    {
        let span = info_span!(parent: &self.span, "ingest", pdf = %pdf_path.display());
        let documents = span.in_scope(|| load_documents(pdf_path, extractor))?;
        self.ingest_documents(documents).instrument(span).await
    }

    /// Nothing is written unless every step succeeds.
    pub async fn ingest_documents(
        &self,
        documents: Vec<Document>,
    ) -> Result<IngestionReport, IngestError> {
        let pages = documents.len();
        let sources = documents
            .iter()
            .map(|document| document.source_id().to_string())
            .collect::<BTreeSet<_>>()
            .len();

        let documents = normalize_documents(documents, &self.normalizer);
        if documents.is_empty() {
            return Err(IngestError::EmptyCorpus(format!(
                "no text left in {pages} pages after normalization"
            )));
        }

        let chunks = chunk_documents(&documents, &self.config.chunking)?;
        if chunks.is_empty() {
            return Err(IngestError::EmptyCorpus("chunker produced no chunks".to_string()));
        }
        let chunk_count = chunks.len();
        debug!(documents = documents.len(), chunks = chunk_count, "chunked corpus");

        let index =
            EmbeddingIndex::build(chunks, &self.embedder, self.config.embedding.batch_size).await?;
        let storage_dir = self.config.storage_dir.clone();
        let span = Span::current();
        let manifest =
            tokio::task::spawn_blocking(move || span.in_scope(|| index.persist(&storage_dir)))
                .await
                .map_err(IndexError::from)??;

        let report = IngestionReport {
            sources,
            pages,
            documents: documents.len(),
            chunks: chunk_count,
            storage_dir: self.config.storage_dir.clone(),
            manifest,
        };
        info!(
            sources = report.sources,
            pages = report.pages,
            chunks = report.chunks,
            model = %report.manifest.model_id,
            "ingestion complete"
        );
        Ok(report)
    }

    /// Loads a persisted index; sessions opened from the handle share it.
    pub fn load(
        &self,
        storage_path: &Path,
        llm: Arc<dyn ChatModel>,
    ) -> Result<RetrieverHandle, IndexError> {
        let span = info_span!(parent: &self.span, "retriever", storage = %storage_path.display());
        let mut retriever = IndexRetriever::new(self.embedder.clone());
        span.in_scope(|| retriever.load(storage_path))?;

        Ok(RetrieverHandle {
            retriever: Arc::new(retriever),
            llm,
            options: EngineOptions::from(&self.config.retrieval),
            memory: self.config.memory.clone(),
            span,
        })
    }
}

#[derive(Clone)]
pub struct RetrieverHandle {
    retriever: Arc<IndexRetriever>,
    llm: Arc<dyn ChatModel>,
    options: EngineOptions,
    memory: MemoryConfig,
    span: Span,
}

impl RetrieverHandle {
    /// Opens a session with its own empty memory.
    pub fn session(&self) -> ChatSession {
        let session = ConversationalEngine::new(
            self.retriever.clone(),
            self.llm.clone(),
            memory_from_config(&self.memory),
            self.options,
        );
        debug!(parent: &self.span, session = %session.session_id(), "opened chat session");
        session.with_span(self.span.clone())
    }

    pub async fn answer(
        &self,
        question: &str,
        session: &mut ChatSession,
    ) -> Result<Answer, ChatError> {
        session.answer(question).await
    }

    pub fn chunk_count(&self) -> usize {
        self.retriever.index().map_or(0, |index| index.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::index::MANIFEST_FILE;
    use crate::models::DocumentFingerprint;
    use crate::testing::{ScriptedChatModel, StaticExtractor};
    use chrono::Utc;
    use tempfile::tempdir;

    fn fingerprint() -> DocumentFingerprint {
        DocumentFingerprint {
            source_id: "plan".to_string(),
            title: "national-cancer-plan.pdf".to_string(),
            source_path: "/reports/national-cancer-plan.pdf".to_string(),
            checksum: "abc".to_string(),
            ingested_at: Utc::now(),
        }
    }

    fn pages() -> Vec<Document> {
        let fingerprint = fingerprint();
        vec![
            Document::from_page(&fingerprint, 1, "Page 1\nNATIONAL CANCER PLAN | 1".to_string()),
            Document::from_page(
                &fingerprint,
                2,
                "Page 2 NATIONAL CANCER PLAN | 2\nCancer screening improves outcomes.".to_string(),
            ),
            Document::from_page(
                &fingerprint,
                3,
                "Tobacco control reduces lung cancer incidence.".to_string(),
            ),
        ]
    }

    fn pipeline(storage: &Path) -> RagPipeline {
        let mut config = RagConfig::default();
        config.storage_dir = storage.to_path_buf();
        config.retrieval.top_k = 1;
        RagPipeline::new(config, Arc::new(CharacterNgramEmbedder { dimensions: 128 })).unwrap()
    }

    #[tokio::test]
    async fn ingest_then_answer_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let storage = dir.path().join("data");
        let pipeline = pipeline(&storage);

        let report = pipeline.ingest_documents(pages()).await?;
        assert_eq!(report.sources, 1);
        assert_eq!(report.pages, 3);
        assert_eq!(report.documents, 2);
        assert_eq!(report.chunks, 2);
        assert_eq!(report.manifest.model_id, "char-trigram");
        assert!(storage.join(MANIFEST_FILE).exists());

        let llm = Arc::new(ScriptedChatModel::new(vec![Ok("Answer: Screening does.")]));
        let handle = pipeline.load(&storage, llm.clone())?;
        assert_eq!(handle.chunk_count(), 2);

        let mut session = handle.session();
        let answer = handle.answer("What improves outcomes?", &mut session).await?;
        assert_eq!(answer.text, "Screening does.");
        assert_eq!(answer.sources.len(), 1);
        assert_eq!(answer.sources[0].chunk.text, "Cancer screening improves outcomes.");
        assert_eq!(answer.sources[0].chunk.page, Some(2));

        let prompt = &llm.prompts()[0];
        assert!(prompt.contains("Cancer screening improves outcomes."));
        assert!(prompt.contains("What improves outcomes?"));
        assert_eq!(session.history().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn ingest_from_pdf_path_normalizes_chunks_and_persists(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let pdf = dir.path().join("national-cancer-plan.pdf");
        std::fs::write(&pdf, b"%PDF-1.4\n%two pages")?;
        let storage = dir.path().join("data");
        let pipeline = pipeline(&storage);
        let extractor = StaticExtractor::new(&[
            "Page 1 NATIONAL CANCER PLAN | 1\nCancer screening improves outcomes.",
            "2 of 2\nTobacco control reduces lung cancer incidence.",
        ]);

        let report = pipeline.ingest_with(&pdf, &extractor).await?;
        assert_eq!(report.sources, 1);
        assert_eq!(report.pages, 2);
        assert_eq!(report.documents, 2);
        assert_eq!(report.chunks, 2);
        assert!(storage.join(MANIFEST_FILE).exists());

        let llm = Arc::new(ScriptedChatModel::new(vec![Ok("Tobacco control.")]));
        let handle = pipeline.load(&storage, llm)?;
        let mut session = handle.session();
        let answer = handle
            .answer("What reduces lung cancer incidence?", &mut session)
            .await?;

        let top = &answer.sources[0].chunk;
        assert_eq!(top.text, "Tobacco control reduces lung cancer incidence.");
        assert_eq!(top.page, Some(2));
        assert_eq!(
            top.metadata.get("title").and_then(|value| value.as_str()),
            Some("national-cancer-plan.pdf")
        );
        Ok(())
    }

    #[tokio::test]
    async fn sessions_share_index_but_not_memory() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let pipeline = pipeline(dir.path());
        pipeline.ingest_documents(pages()).await?;

        let llm = Arc::new(ScriptedChatModel::new(vec![Ok("one"), Ok("two"), Ok("three")]));
        let handle = pipeline.load(dir.path(), llm)?;
        let mut alice = handle.session();
        let mut bob = handle.session();
        assert_ne!(alice.session_id(), bob.session_id());

        handle.answer("What about tobacco?", &mut alice).await?;
        handle.answer("And screening?", &mut alice).await?;
        handle.answer("What about tobacco?", &mut bob).await?;

        assert_eq!(alice.history().len(), 2);
        assert_eq!(bob.history().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn corpus_empty_after_normalization_persists_nothing() -> Result<(), Box<dyn std::error::Error>>
    {
        let dir = tempdir()?;
        let storage = dir.path().join("data");
        let pipeline = pipeline(&storage);
        let headers_only = vec![Document::from_page(
            &fingerprint(),
            1,
            "Page 1 NATIONAL CANCER PLAN | 1".to_string(),
        )];

        let result = pipeline.ingest_documents(headers_only).await;
        assert!(matches!(result, Err(IngestError::EmptyCorpus(_))));
        assert!(!storage.join(MANIFEST_FILE).exists());

        let loaded = pipeline.load(&storage, Arc::new(ScriptedChatModel::default()));
        assert!(matches!(loaded, Err(IndexError::Missing(_))));
        Ok(())
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut config = RagConfig::default();
        config.chunking.chunk_overlap = config.chunking.chunk_size;
        let result = RagPipeline::new(config, Arc::new(CharacterNgramEmbedder::default()));
        assert!(matches!(result, Err(IngestError::Config(_))));
    }
}
