use crate::error::IngestError;
use crate::models::{Chunk, Document};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Tried in order; a separator stays attached to the piece before it.
    pub separators: Vec<String>,
    /// Cut at the character budget once no separator applies. When off, such
    /// a piece becomes one oversized chunk.
    pub hard_split: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 100,
            separators: ["\n\n", "\n", ". ", " "]
                .into_iter()
                .map(String::from)
                .collect(),
            hard_split: true,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk_overlap ({}) must be less than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// A chunk-sized window of a text, in character offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

#[derive(Debug, Clone, Copy)]
struct Piece {
    start: usize,
    end: usize,
    hard: bool,
}

pub fn chunk_documents(
    documents: &[Document],
    config: &ChunkingConfig,
) -> Result<Vec<Chunk>, IngestError> {
    config.validate()?;

    let mut chunks = Vec::new();
    let mut cursor = 0u64;

    for document in documents {
        let source_id = document.source_id().to_string();
        let page = document.page();

        for span in split_text(&document.content, config)? {
            let mut metadata = document.metadata.clone();
            metadata.insert("chunk_index".to_string(), cursor.into());
            metadata.insert("start_index".to_string(), span.start.into());

            chunks.push(Chunk {
                chunk_id: make_chunk_id(&source_id, page.unwrap_or_default(), cursor, &span.text),
                source_id: source_id.clone(),
                page,
                chunk_index: cursor,
                start_char: span.start,
                end_char: span.end,
                text: span.text,
                metadata,
            });

            cursor = cursor.saturating_add(1);
        }
    }

    Ok(chunks)
}

pub fn split_text(text: &str, config: &ChunkingConfig) -> Result<Vec<TextSpan>, IngestError> {
    config.validate()?;

    let chars: Vec<char> = text.chars().collect();
    if chars.iter().all(|ch| ch.is_whitespace()) {
        return Ok(Vec::new());
    }

    let separators = config
        .separators
        .iter()
        .filter(|separator| !separator.is_empty())
        .map(|separator| separator.chars().collect::<Vec<_>>())
        .collect::<Vec<_>>();

    // Pieces must fit in the part of a chunk not taken by the overlap, so
    // every window can end on a piece boundary past the previous one.
    let budget = config.chunk_size - config.chunk_overlap;
    let mut pieces = Vec::new();
    split_recursive(
        &chars,
        0,
        chars.len(),
        &separators,
        budget,
        config.hard_split,
        &mut pieces,
    );

    Ok(
        merge_pieces(&pieces, chars.len(), config.chunk_size, config.chunk_overlap)
            .into_iter()
            .map(|(start, end)| TextSpan {
                start,
                end,
                text: chars[start..end].iter().collect(),
            })
            .collect(),
    )
}

fn split_recursive(
    chars: &[char],
    start: usize,
    end: usize,
    separators: &[Vec<char>],
    budget: usize,
    hard_split: bool,
    pieces: &mut Vec<Piece>,
) {
    if end - start <= budget {
        pieces.push(Piece {
            start,
            end,
            hard: false,
        });
        return;
    }

    let Some((separator, remaining)) = separators.split_first() else {
        pieces.push(Piece {
            start,
            end,
            hard: hard_split,
        });
        return;
    };

    for (segment_start, segment_end) in separator_segments(chars, start, end, separator) {
        if segment_end - segment_start <= budget {
            pieces.push(Piece {
                start: segment_start,
                end: segment_end,
                hard: false,
            });
        } else {
            split_recursive(
                chars,
                segment_start,
                segment_end,
                remaining,
                budget,
                hard_split,
                pieces,
            );
        }
    }
}

fn separator_segments(
    chars: &[char],
    start: usize,
    end: usize,
    separator: &[char],
) -> Vec<(usize, usize)> {
    let mut segments = Vec::new();
    let mut segment_start = start;
    let mut position = start;

    while position + separator.len() <= end {
        if &chars[position..position + separator.len()] == separator {
            position += separator.len();
            segments.push((segment_start, position));
            segment_start = position;
        } else {
            position += 1;
        }
    }

    if segment_start < end {
        segments.push((segment_start, end));
    }

    segments
}

/// Greedily grows each window to the last piece boundary within `chunk_size`,
/// then starts the next window `chunk_overlap` characters before its end.
/// A window always ends past the previous one, so no span nests inside its
/// predecessor.
fn merge_pieces(
    pieces: &[Piece],
    total: usize,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut covered = 0;

    while start < total {
        let limit = start + chunk_size;
        if limit >= total {
            spans.push((start, total));
            break;
        }

        let containing = pieces
            .iter()
            .find(|piece| piece.start < limit && limit < piece.end);
        let fitted = pieces
            .iter()
            .map(|piece| piece.end)
            .filter(|&boundary| boundary > start.max(covered) && boundary <= limit)
            .last();

        let end = match (containing, fitted) {
            (Some(piece), _) if piece.hard => limit,
            (_, Some(boundary)) => boundary,
            (Some(piece), None) => piece.end,
            (None, None) => limit,
        };

        spans.push((start, end));
        if end >= total {
            break;
        }
        covered = end;

        start = if end > start + chunk_overlap {
            end - chunk_overlap
        } else {
            end
        };
    }

    spans
}

fn make_chunk_id(source_id: &str, page: u32, index: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update(page.to_le_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
