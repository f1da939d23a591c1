//! Storage abstraction for restyle.
//!
//! The [`Store`] trait defines every storage operation the analysis and
//! retrieval pipelines need, so the same pipeline code runs against SQLite
//! in the binary and against [`memory::InMemoryStore`] in tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ChunkAnalysis, Document, Example, StyleProfile};

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_documents`](Store::insert_documents) | Add documents, skipping known ids |
/// | [`get_all_documents`](Store::get_all_documents) | Whole corpus, in insertion order |
/// | [`get_documents_by_ids`](Store::get_documents_by_ids) | Documents in the order of the ids given |
/// | [`save_chunk_analysis`](Store::save_chunk_analysis) | Persist one analysis, replacing the same chunk id |
/// | [`get_chunk_analyses`](Store::get_chunk_analyses) | Saved analyses by chunk id |
/// | [`save_style_profile`](Store::save_style_profile) | Append a profile version |
/// | [`get_latest_style_profile`](Store::get_latest_style_profile) | The authoritative profile |
/// | [`save_examples`](Store::save_examples) | Replace the example set |
/// | [`get_example_document_ids`](Store::get_example_document_ids) | Example ids in cluster order |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert documents whose id is not stored yet; returns how many were added.
    async fn insert_documents(&self, documents: &[Document]) -> Result<usize>;

    /// Remove every document and the example set that refers to them.
    async fn clear_documents(&self) -> Result<()>;

    async fn get_all_documents(&self) -> Result<Vec<Document>>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// Documents for `ids`, in the same order; unknown ids are skipped.
    async fn get_documents_by_ids(&self, ids: &[String]) -> Result<Vec<Document>>;

    async fn save_chunk_analysis(&self, analysis: &ChunkAnalysis) -> Result<()>;

    /// All saved analyses, ordered by chunk id.
    async fn get_chunk_analyses(&self) -> Result<Vec<ChunkAnalysis>>;

    async fn clear_chunk_analyses(&self) -> Result<()>;

    async fn save_style_profile(&self, profile: &StyleProfile) -> Result<()>;

    /// The profile with the highest version, if any.
    async fn get_latest_style_profile(&self) -> Result<Option<StyleProfile>>;

    /// Replace the whole example set.
    async fn save_examples(&self, examples: &[Example]) -> Result<()>;

    /// Examples ordered by cluster id.
    async fn get_examples(&self) -> Result<Vec<Example>>;

    /// Document ids of the examples, ordered by cluster id.
    async fn get_example_document_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .get_examples()
            .await?
            .into_iter()
            .map(|e| e.document_id)
            .collect())
    }
}
