//! Core data models shared by the analysis and retrieval pipelines.
//!
//! Documents are owned by the store and never mutated here. Chunk analyses,
//! style profiles and examples are produced by an analysis run and handed
//! back to the store for persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category assigned to documents that carry no category labels.
pub const UNCATEGORIZED: &str = "_uncategorized";

/// A cleaned corpus document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub body: String,
    pub published_at: Option<DateTime<Utc>>,
    /// Ordered category labels; the first one is the primary category.
    pub categories: Vec<String>,
    pub word_count: usize,
}

impl Document {
    /// Build a document, deriving its word count from the body.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        published_at: Option<DateTime<Utc>>,
        categories: Vec<String>,
    ) -> Self {
        let body = body.into();
        let word_count = count_words(&body);
        Self {
            id: id.into(),
            title: title.into(),
            body,
            published_at,
            categories,
            word_count,
        }
    }

    /// The first category label, or [`UNCATEGORIZED`].
    pub fn primary_category(&self) -> &str {
        self.categories
            .first()
            .map(String::as_str)
            .unwrap_or(UNCATEGORIZED)
    }

    /// Text used for vectorization: title and body joined by a space.
    pub fn vector_text(&self) -> String {
        format!("{} {}", self.title, self.body)
    }

    /// The document rendered as one unit for token estimation and prompts.
    pub fn rendered(&self) -> String {
        format!("## {}\n\n{}", self.title, self.body)
    }
}

/// Whitespace-separated word count.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// A token-bounded group of sampled documents, analyzed by one request.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Zero-based position of the chunk within the run.
    pub index: usize,
    pub documents: Vec<Document>,
    /// Sum of the per-document token estimates.
    pub token_estimate: usize,
}

impl Chunk {
    pub fn document_ids(&self) -> Vec<String> {
        self.documents.iter().map(|d| d.id.clone()).collect()
    }

    /// Request id used when the chunk is submitted for analysis.
    pub fn request_id(&self) -> String {
        chunk_request_id(self.index)
    }
}

/// Request id for the chunk at `index`.
pub fn chunk_request_id(index: usize) -> String {
    format!("chunk_{}", index)
}

/// Stylistic analysis of one chunk, persisted as soon as it is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkAnalysis {
    pub chunk_id: usize,
    pub document_ids: Vec<String>,
    pub analysis_text: String,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
}

/// The synthesized style description of the corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleProfile {
    pub version: i64,
    /// Free-form style description (markdown).
    pub text: String,
    /// Machine-readable form of `text`. Never absent: a parse failure is
    /// stored as `{"raw": ..., "parse_error": true}`.
    pub structured: serde_json::Value,
    pub sample_size: usize,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
}

/// A representative document selected for one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub document_id: String,
    pub cluster_id: usize,
    /// `1 - cosine similarity` between the document and its cluster centroid.
    pub distance_to_centroid: f32,
}
