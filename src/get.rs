//! Corpus inspection: one document, the selected examples, the style guide.
//!
//! Backs `restyle corpus show`, `restyle corpus examples` and
//! `restyle corpus style-guide`. Everything is read-only.

use anyhow::{bail, Result};

use restyle_core::error::PipelineError;
use restyle_core::models::{Document, StyleProfile};
use restyle_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// One selected example joined with its document.
#[derive(Debug, Clone)]
pub struct ExampleRow {
    pub cluster_id: usize,
    pub distance_to_centroid: f32,
    pub document: Document,
}

pub async fn get_document<S: Store + ?Sized>(store: &S, id: &str) -> Result<Document> {
    match store.get_document(id).await? {
        Some(doc) => Ok(doc),
        None => bail!("document not found: {}", id),
    }
}

/// Examples in cluster order. Examples whose document has gone are skipped.
pub async fn list_examples<S: Store + ?Sized>(store: &S) -> Result<Vec<ExampleRow>> {
    let mut rows = Vec::new();
    for example in store.get_examples().await? {
        if let Some(document) = store.get_document(&example.document_id).await? {
            rows.push(ExampleRow {
                cluster_id: example.cluster_id,
                distance_to_centroid: example.distance_to_centroid,
                document,
            });
        }
    }
    rows.sort_by_key(|row| row.cluster_id);
    Ok(rows)
}

pub async fn latest_profile<S: Store + ?Sized>(store: &S) -> Result<StyleProfile> {
    match store.get_latest_style_profile().await? {
        Some(profile) => Ok(profile),
        None => Err(PipelineError::missing("style profile").into()),
    }
}

pub async fn run_show(config: &Config, id: &str) -> Result<()> {
    let store = SqliteStore::new(db::connect(config).await?);
    let doc = get_document(&store, id).await;
    store.pool().close().await;
    let doc = doc?;

    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!("title:        {}", doc.title);
    println!(
        "published_at: {}",
        doc.published_at
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .unwrap_or_else(|| "(unknown)".to_string())
    );
    println!("categories:   {}", doc.categories.join(", "));
    println!("word_count:   {}", doc.word_count);
    println!();

    println!("--- Body ---");
    println!("{}", doc.body);
    Ok(())
}

pub async fn run_examples(config: &Config) -> Result<()> {
    let store = SqliteStore::new(db::connect(config).await?);
    let rows = list_examples(&store).await;
    store.pool().close().await;
    let rows = rows?;

    if rows.is_empty() {
        println!("No examples selected. Run `restyle analyze` first.");
        return Ok(());
    }

    println!("{:>7}  {:>8}  {:<36}  TITLE", "CLUSTER", "DISTANCE", "DOCUMENT");
    for row in &rows {
        println!(
            "{:>7}  {:>8.4}  {:<36}  {}",
            row.cluster_id, row.distance_to_centroid, row.document.id, row.document.title
        );
    }
    println!();
    println!("{} examples", rows.len());
    Ok(())
}

pub async fn run_style_guide(config: &Config) -> Result<()> {
    let store = SqliteStore::new(db::connect(config).await?);
    let profile = latest_profile(&store).await;
    store.pool().close().await;
    let profile = profile?;

    eprintln!(
        "style profile v{} ({} documents, {} chunks, {})",
        profile.version,
        profile.sample_size,
        profile.chunk_count,
        profile.created_at.format("%Y-%m-%d %H:%M")
    );
    println!("{}", profile.text);
    Ok(())
}
