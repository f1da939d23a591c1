//! Token-bounded document chunker.
//!
//! Packs a sampled, ordered document list into [`Chunk`]s for the analysis
//! requests. Each chunk stays within a token budget and an item cap, and
//! document order is preserved across chunks.
//!
//! # Algorithm
//!
//! Greedy bin-packing over the documents in order:
//!
//! 1. Estimate each document's cost from its rendered form
//!    (`## title\n\nbody`) with the caller's token counter.
//! 2. If the open chunk is non-empty and adding the document would exceed
//!    `max_tokens`, or the chunk already holds `max_documents`, close it.
//! 3. Append the document to the open chunk. A document larger than the
//!    budget therefore becomes a chunk of its own instead of being dropped.
//! 4. Flush the last open chunk.
//!
//! # Example
//!
//! ```rust
//! use restyle_core::chunk::{chunk_documents, estimate_tokens, ChunkLimits};
//! use restyle_core::models::Document;
//!
//! let docs = vec![
//!     Document::new("a", "First", "Short body.", None, vec![]),
//!     Document::new("b", "Second", "Another short body.", None, vec![]),
//! ];
//! let limits = ChunkLimits { max_tokens: 1_000, max_documents: 12 };
//! let chunks = chunk_documents(&docs, &limits, estimate_tokens).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].documents.len(), 2);
//! ```

use anyhow::Result;

use crate::error::PipelineError;
use crate::models::{Chunk, Document};

/// Approximate characters-per-token ratio used by [`estimate_tokens`].
const CHARS_PER_TOKEN: usize = 4;

/// Budget for a single chunk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkLimits {
    pub max_tokens: usize,
    pub max_documents: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            max_tokens: 90_000,
            max_documents: 12,
        }
    }
}

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Split `documents` into ordered chunks.
///
/// # Guarantees
///
/// - No chunk is empty.
/// - Every chunk fits `max_tokens` or holds exactly one document.
/// - No chunk holds more than `max_documents` documents.
/// - Concatenating the chunks gives back `documents` in order.
///
/// # Errors
///
/// [`PipelineError::EmptyCorpus`] if `documents` is empty.
pub fn chunk_documents<F>(
    documents: &[Document],
    limits: &ChunkLimits,
    count_tokens: F,
) -> Result<Vec<Chunk>>
where
    F: Fn(&str) -> usize,
{
    if documents.is_empty() {
        return Err(PipelineError::EmptyCorpus.into());
    }
    let max_documents = limits.max_documents.max(1);

    let mut chunks = Vec::new();
    let mut current: Vec<Document> = Vec::new();
    let mut current_tokens = 0usize;

    for doc in documents {
        let tokens = count_tokens(&doc.rendered());

        if !current.is_empty()
            && (current_tokens + tokens > limits.max_tokens || current.len() >= max_documents)
        {
            chunks.push(Chunk {
                index: chunks.len(),
                documents: std::mem::take(&mut current),
                token_estimate: current_tokens,
            });
            current_tokens = 0;
        }

        current.push(doc.clone());
        current_tokens += tokens;
    }

    if !current.is_empty() {
        chunks.push(Chunk {
            index: chunks.len(),
            documents: current,
            token_estimate: current_tokens,
        });
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: usize, words: usize) -> Document {
        Document::new(
            format!("d{}", id),
            format!("T{}", id),
            "word ".repeat(words),
            None,
            vec![],
        )
    }

    /// Counts whitespace-separated words; deterministic and easy to reason about.
    fn words(text: &str) -> usize {
        text.split_whitespace().count()
    }

    #[test]
    fn empty_input_is_an_error() {
        let err = chunk_documents(&[], &ChunkLimits::default(), words).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::EmptyCorpus)
        ));
    }

    #[test]
    fn respects_token_budget() {
        // Each rendered doc: "##", "T<n>" and 10 words = 12 tokens.
        let docs: Vec<Document> = (0..10).map(|i| doc(i, 10)).collect();
        let limits = ChunkLimits {
            max_tokens: 40,
            max_documents: 100,
        };
        let chunks = chunk_documents(&docs, &limits, words).unwrap();
        assert_eq!(chunks.len(), 4);
        for c in &chunks {
            assert!(c.token_estimate <= 40);
            assert!(!c.documents.is_empty());
        }
    }

    #[test]
    fn respects_item_cap() {
        let docs: Vec<Document> = (0..25).map(|i| doc(i, 1)).collect();
        let limits = ChunkLimits {
            max_tokens: 1_000_000,
            max_documents: 12,
        };
        let chunks = chunk_documents(&docs, &limits, words).unwrap();
        let sizes: Vec<usize> = chunks.iter().map(|c| c.documents.len()).collect();
        assert_eq!(sizes, vec![12, 12, 1]);
    }

    #[test]
    fn oversized_document_gets_own_chunk() {
        let docs = vec![doc(0, 5), doc(1, 500), doc(2, 5)];
        let limits = ChunkLimits {
            max_tokens: 50,
            max_documents: 12,
        };
        let chunks = chunk_documents(&docs, &limits, words).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].documents.len(), 1);
        assert_eq!(chunks[1].documents[0].id, "d1");
        assert!(chunks[1].token_estimate > 50);
    }

    #[test]
    fn preserves_order_and_indices() {
        let docs: Vec<Document> = (0..30).map(|i| doc(i, i % 7 + 1)).collect();
        let limits = ChunkLimits {
            max_tokens: 25,
            max_documents: 4,
        };
        let chunks = chunk_documents(&docs, &limits, words).unwrap();
        let flattened: Vec<String> = chunks
            .iter()
            .flat_map(|c| c.documents.iter().map(|d| d.id.clone()))
            .collect();
        let expected: Vec<String> = docs.iter().map(|d| d.id.clone()).collect();
        assert_eq!(flattened, expected);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
            assert!(c.documents.len() <= 4);
            assert!(c.token_estimate <= 25 || c.documents.len() == 1);
        }
    }

    #[test]
    fn heuristic_estimate() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens("привет"), 2);
    }
}
