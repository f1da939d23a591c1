//! In-memory [`Store`] implementation for tests.
//!
//! Uses `Vec` and `BTreeMap` behind `std::sync::RwLock`.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ChunkAnalysis, Document, Example, StyleProfile};

use super::Store;

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    documents: RwLock<Vec<Document>>,
    analyses: RwLock<BTreeMap<usize, ChunkAnalysis>>,
    profiles: RwLock<Vec<StyleProfile>>,
    examples: RwLock<Vec<Example>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-filled with `documents`.
    pub fn with_documents(documents: Vec<Document>) -> Self {
        Self {
            documents: RwLock::new(documents),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_documents(&self, documents: &[Document]) -> Result<usize> {
        let mut stored = self.documents.write().unwrap();
        let mut added = 0;
        for doc in documents {
            if !stored.iter().any(|d| d.id == doc.id) {
                stored.push(doc.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    async fn clear_documents(&self) -> Result<()> {
        self.documents.write().unwrap().clear();
        self.examples.write().unwrap().clear();
        Ok(())
    }

    async fn get_all_documents(&self) -> Result<Vec<Document>> {
        Ok(self.documents.read().unwrap().clone())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let docs = self.documents.read().unwrap();
        Ok(docs.iter().find(|d| d.id == id).cloned())
    }

    async fn get_documents_by_ids(&self, ids: &[String]) -> Result<Vec<Document>> {
        let docs = self.documents.read().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| docs.iter().find(|d| &d.id == id).cloned())
            .collect())
    }

    async fn save_chunk_analysis(&self, analysis: &ChunkAnalysis) -> Result<()> {
        self.analyses
            .write()
            .unwrap()
            .insert(analysis.chunk_id, analysis.clone());
        Ok(())
    }

    async fn get_chunk_analyses(&self) -> Result<Vec<ChunkAnalysis>> {
        Ok(self.analyses.read().unwrap().values().cloned().collect())
    }

    async fn clear_chunk_analyses(&self) -> Result<()> {
        self.analyses.write().unwrap().clear();
        Ok(())
    }

    async fn save_style_profile(&self, profile: &StyleProfile) -> Result<()> {
        self.profiles.write().unwrap().push(profile.clone());
        Ok(())
    }

    async fn get_latest_style_profile(&self) -> Result<Option<StyleProfile>> {
        let profiles = self.profiles.read().unwrap();
        Ok(profiles.iter().max_by_key(|p| p.version).cloned())
    }

    async fn save_examples(&self, examples: &[Example]) -> Result<()> {
        let mut sorted = examples.to_vec();
        sorted.sort_by_key(|e| e.cluster_id);
        *self.examples.write().unwrap() = sorted;
        Ok(())
    }

    async fn get_examples(&self) -> Result<Vec<Example>> {
        Ok(self.examples.read().unwrap().clone())
    }
}
