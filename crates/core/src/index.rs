//! Exact nearest-neighbour index over chunk embeddings, persisted as a
//! directory holding `index.json` and a checksummed `manifest.json`.

use crate::embeddings::Embedder;
use crate::error::{ConfigError, IndexError};
use crate::models::{Chunk, SearchHit};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tracing::{debug, info};

pub const INDEX_FILE: &str = "index.json";
pub const MANIFEST_FILE: &str = "manifest.json";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub format_version: u32,
    pub model_id: String,
    pub dimensions: usize,
    pub chunk_count: usize,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingIndex {
    model_id: String,
    dimensions: usize,
    entries: Vec<IndexEntry>,
}

impl EmbeddingIndex {
    pub async fn build<E>(
        chunks: Vec<Chunk>,
        embedder: &E,
        batch_size: usize,
    ) -> Result<Self, IndexError>
    where
        E: Embedder + ?Sized,
    {
        let dimensions = embedder.dimensions();
        let mut entries = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(batch_size.max(1)) {
            let texts = batch.iter().map(|chunk| chunk.text.as_str()).collect::<Vec<_>>();
            let vectors = embedder.embed_batch(&texts).await?;

            if vectors.len() != batch.len() {
                return Err(IndexError::Build(format!(
                    "embedding count {} doesn't match chunk count {}",
                    vectors.len(),
                    batch.len()
                )));
            }

            for (chunk, vector) in batch.iter().zip(vectors) {
                if vector.len() != dimensions {
                    return Err(IndexError::DimensionMismatch {
                        expected: dimensions,
                        actual: vector.len(),
                    });
                }
                entries.push(IndexEntry {
                    chunk: chunk.clone(),
                    vector,
                });
            }
            debug!(embedded = entries.len(), total = chunks.len(), "embedded batch");
        }

        Ok(Self {
            model_id: embedder.model_id(),
            dimensions,
            entries,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Fails when the embedder would produce vectors this index cannot compare.
    pub fn ensure_compatible<E>(&self, embedder: &E) -> Result<(), IndexError>
    where
        E: Embedder + ?Sized,
    {
        if embedder.dimensions() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                actual: embedder.dimensions(),
            });
        }
        let model_id = embedder.model_id();
        if model_id != self.model_id {
            return Err(ConfigError::ModelMismatch {
                expected: self.model_id.clone(),
                actual: model_id,
            }
            .into());
        }
        Ok(())
    }

    /// Positions of the `limit` most similar entries, best first. Ties keep
    /// insertion order.
    pub fn rank(&self, query: &[f32], limit: usize) -> Result<Vec<(usize, f32)>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }

        let mut scored = self
            .entries
            .iter()
            .enumerate()
            .map(|(position, entry)| (position, cosine_similarity(query, &entry.vector)))
            .collect::<Vec<_>>();

        scored.sort_by(|left, right| right.1.total_cmp(&left.1));
        scored.truncate(limit);
        Ok(scored)
    }

    pub fn similarity_search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, IndexError> {
        Ok(self
            .rank(query, k)?
            .into_iter()
            .map(|(position, score)| self.hit(position, score))
            .collect())
    }

    pub(crate) fn hit(&self, position: usize, score: f32) -> SearchHit {
        SearchHit {
            chunk: self.entries[position].chunk.clone(),
            score,
        }
    }

    pub(crate) fn vector(&self, position: usize) -> &[f32] {
        &self.entries[position].vector
    }

    pub fn persist(&self, dir: &Path) -> Result<IndexManifest, IndexError> {
        fs::create_dir_all(dir)?;

        // A rebuild interrupted before the new manifest lands reads as missing.
        match fs::remove_file(dir.join(MANIFEST_FILE)) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }

        let payload = serde_json::to_vec(&self.entries)?;
        let manifest = IndexManifest {
            format_version: FORMAT_VERSION,
            model_id: self.model_id.clone(),
            dimensions: self.dimensions,
            chunk_count: self.entries.len(),
            checksum: sha256_hex(&payload),
            created_at: Utc::now(),
        };

        write_atomically(&dir.join(INDEX_FILE), &payload)?;
        write_atomically(&dir.join(MANIFEST_FILE), &serde_json::to_vec_pretty(&manifest)?)?;

        info!(
            dir = %dir.display(),
            chunks = manifest.chunk_count,
            dimensions = manifest.dimensions,
            "persisted embedding index"
        );
        Ok(manifest)
    }

    pub fn load<E>(dir: &Path, embedder: &E) -> Result<Self, IndexError>
    where
        E: Embedder + ?Sized,
    {
        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest_bytes = match fs::read(&manifest_path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(IndexError::Missing(dir.display().to_string()))
            }
            Err(error) => return Err(error.into()),
        };
        let manifest: IndexManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|error| IndexError::Corrupt(format!("unreadable manifest: {error}")))?;

        if manifest.format_version != FORMAT_VERSION {
            return Err(IndexError::Corrupt(format!(
                "unsupported format version {}",
                manifest.format_version
            )));
        }

        let payload = match fs::read(dir.join(INDEX_FILE)) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(IndexError::Corrupt(format!("{INDEX_FILE} is missing")))
            }
            Err(error) => return Err(error.into()),
        };

        if sha256_hex(&payload) != manifest.checksum {
            return Err(IndexError::Corrupt(format!(
                "{INDEX_FILE} does not match the manifest checksum"
            )));
        }

        let entries: Vec<IndexEntry> = serde_json::from_slice(&payload)
            .map_err(|error| IndexError::Corrupt(format!("unreadable entries: {error}")))?;

        if entries.len() != manifest.chunk_count {
            return Err(IndexError::Corrupt(format!(
                "manifest lists {} chunks, found {}",
                manifest.chunk_count,
                entries.len()
            )));
        }
        if let Some(entry) = entries
            .iter()
            .find(|entry| entry.vector.len() != manifest.dimensions)
        {
            return Err(IndexError::Corrupt(format!(
                "chunk {} has dimension {}, manifest says {}",
                entry.chunk.chunk_id,
                entry.vector.len(),
                manifest.dimensions
            )));
        }

        let index = Self {
            model_id: manifest.model_id,
            dimensions: manifest.dimensions,
            entries,
        };
        index.ensure_compatible(embedder)?;

        info!(dir = %dir.display(), chunks = index.len(), "loaded embedding index");
        Ok(index)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), IndexError> {
    let staging = path.with_extension("json.tmp");
    let mut file = fs::File::create(&staging)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&staging, path)?;
    Ok(())
}
