use crate::embeddings::Embedder;
use crate::error::{IndexError, SearchError};
use crate::index::{cosine_similarity, EmbeddingIndex};
use crate::models::SearchHit;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchStrategy {
    Similarity,
    /// Maximal marginal relevance over the `fetch_k` most similar chunks.
    Diversity { lambda: f32, fetch_k: usize },
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        strategy: SearchStrategy,
    ) -> Result<Vec<SearchHit>, SearchError>;
}

#[async_trait]
impl<T: Retriever + ?Sized> Retriever for Arc<T> {
    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        strategy: SearchStrategy,
    ) -> Result<Vec<SearchHit>, SearchError> {
        (**self).retrieve(query, k, strategy).await
    }
}

/// Retrieves from an [`EmbeddingIndex`] once one has been attached.
pub struct IndexRetriever {
    embedder: Arc<dyn Embedder>,
    index: Option<Arc<EmbeddingIndex>>,
}

impl IndexRetriever {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            index: None,
        }
    }

    pub fn with_index(embedder: Arc<dyn Embedder>, index: EmbeddingIndex) -> Result<Self, IndexError> {
        index.ensure_compatible(&embedder)?;
        Ok(Self {
            embedder,
            index: Some(Arc::new(index)),
        })
    }

    pub fn load(&mut self, dir: &Path) -> Result<(), IndexError> {
        let index = EmbeddingIndex::load(dir, &self.embedder)?;
        self.index = Some(Arc::new(index));
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.index.is_some()
    }

    pub fn index(&self) -> Option<&Arc<EmbeddingIndex>> {
        self.index.as_ref()
    }
}

#[async_trait]
impl Retriever for IndexRetriever {
    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        strategy: SearchStrategy,
    ) -> Result<Vec<SearchHit>, SearchError> {
        if k == 0 {
            return Err(SearchError::InvalidArgument("k must be at least 1".to_string()));
        }
        let index = self.index.as_ref().ok_or(SearchError::NotLoaded)?;
        if index.is_empty() {
            return Ok(Vec::new());
        }

        if let SearchStrategy::Diversity { lambda, .. } = strategy {
            if !(0.0..=1.0).contains(&lambda) {
                return Err(SearchError::InvalidArgument(format!(
                    "lambda {lambda} is outside 0.0..=1.0"
                )));
            }
        }

        let query_vector = self.embedder.embed(query).await?;
        let index = Arc::clone(index);
        // Scoring is CPU-bound and runs on the blocking pool.
        let hits = tokio::task::spawn_blocking(move || match strategy {
            SearchStrategy::Similarity => index.similarity_search(&query_vector, k),
            SearchStrategy::Diversity { lambda, fetch_k } => {
                max_marginal_relevance(&index, &query_vector, k, fetch_k, lambda)
            }
        })
        .await
        .map_err(IndexError::from)??;

        debug!(k, returned = hits.len(), ?strategy, "retrieved chunks");
        Ok(hits)
    }
}

/// Greedy MMR: each pick maximizes
/// `lambda * sim(query, c) - (1 - lambda) * max(sim(c, picked))`.
pub fn max_marginal_relevance(
    index: &EmbeddingIndex,
    query: &[f32],
    k: usize,
    fetch_k: usize,
    lambda: f32,
) -> Result<Vec<SearchHit>, IndexError> {
    let mut remaining = index.rank(query, fetch_k.max(k))?;
    let mut selected: Vec<(usize, f32)> = Vec::with_capacity(k.min(remaining.len()));

    while selected.len() < k && !remaining.is_empty() {
        let mut best_slot = 0;
        let mut best_score = f32::NEG_INFINITY;

        for (slot, &(position, relevance)) in remaining.iter().enumerate() {
            let redundancy = selected
                .iter()
                .map(|&(chosen, _)| cosine_similarity(index.vector(position), index.vector(chosen)))
                .fold(None, |max: Option<f32>, similarity| {
                    Some(max.map_or(similarity, |current| current.max(similarity)))
                })
                .unwrap_or(0.0);
            let score = lambda * relevance - (1.0 - lambda) * redundancy;
            if score > best_score {
                best_slot = slot;
                best_score = score;
            }
        }

        selected.push(remaining.remove(best_slot));
    }

    Ok(selected
        .into_iter()
        .map(|(position, relevance)| index.hit(position, relevance))
        .collect())
}
