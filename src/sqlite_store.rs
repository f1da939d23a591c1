//! SQLite-backed [`Store`] implementation.
//!
//! Timestamps are stored as Unix seconds, list fields as JSON text.
//! Documents keep their insertion order through the `seq` column, which
//! makes sampling reproducible across runs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use restyle_core::models::{ChunkAnalysis, Document, Example, StyleProfile};
use restyle_core::store::Store;

use crate::import::{content_hash, ImportedDocument};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert imported documents in one transaction.
    ///
    /// A document is skipped when its id or its content hash is already
    /// stored. Returns how many rows were added.
    pub async fn insert_imported(&self, imported: &[ImportedDocument]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut added = 0u64;

        for item in imported {
            let doc = &item.document;
            let categories = serde_json::to_string(&doc.categories)?;
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO documents (id, source_id, title, body, published_at,
                                                 categories_json, word_count, content_hash)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&doc.id)
            .bind(&item.source_id)
            .bind(&doc.title)
            .bind(&doc.body)
            .bind(doc.published_at.map(|d| d.timestamp()))
            .bind(categories)
            .bind(doc.word_count as i64)
            .bind(content_hash(&doc.title, &doc.body))
            .execute(&mut *tx)
            .await?;
            added += result.rows_affected();
        }

        tx.commit().await?;
        Ok(added as usize)
    }

    pub async fn count_documents(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

fn from_timestamp(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0).with_context(|| format!("invalid timestamp: {}", ts))
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let categories: String = row.try_get("categories_json")?;
    let published_at: Option<i64> = row.try_get("published_at")?;
    let word_count: i64 = row.try_get("word_count")?;
    Ok(Document {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        published_at: published_at.map(from_timestamp).transpose()?,
        categories: serde_json::from_str(&categories)
            .with_context(|| "corrupt categories_json")?,
        word_count: word_count as usize,
    })
}

fn analysis_from_row(row: &SqliteRow) -> Result<ChunkAnalysis> {
    let chunk_id: i64 = row.try_get("chunk_id")?;
    let document_ids: String = row.try_get("document_ids_json")?;
    let token_count: i64 = row.try_get("token_count")?;
    Ok(ChunkAnalysis {
        chunk_id: chunk_id as usize,
        document_ids: serde_json::from_str(&document_ids)
            .with_context(|| "corrupt document_ids_json")?,
        analysis_text: row.try_get("analysis_text")?,
        token_count: token_count as usize,
        created_at: from_timestamp(row.try_get("created_at")?)?,
    })
}

const DOCUMENT_COLUMNS: &str = "id, title, body, published_at, categories_json, word_count";

#[async_trait]
impl Store for SqliteStore {
    async fn insert_documents(&self, documents: &[Document]) -> Result<usize> {
        let imported: Vec<ImportedDocument> = documents
            .iter()
            .cloned()
            .map(|document| ImportedDocument {
                document,
                source_id: None,
            })
            .collect();
        self.insert_imported(&imported).await
    }

    async fn clear_documents(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM examples")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_all_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents ORDER BY seq",
            DOCUMENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn get_documents_by_ids(&self, ids: &[String]) -> Result<Vec<Document>> {
        let mut documents = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = self.get_document(id).await? {
                documents.push(doc);
            }
        }
        Ok(documents)
    }

    async fn save_chunk_analysis(&self, analysis: &ChunkAnalysis) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chunk_analyses (chunk_id, document_ids_json, analysis_text,
                                        token_count, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                document_ids_json = excluded.document_ids_json,
                analysis_text = excluded.analysis_text,
                token_count = excluded.token_count,
                created_at = excluded.created_at
            "#,
        )
        .bind(analysis.chunk_id as i64)
        .bind(serde_json::to_string(&analysis.document_ids)?)
        .bind(&analysis.analysis_text)
        .bind(analysis.token_count as i64)
        .bind(analysis.created_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_chunk_analyses(&self) -> Result<Vec<ChunkAnalysis>> {
        let rows = sqlx::query(
            "SELECT chunk_id, document_ids_json, analysis_text, token_count, created_at \
             FROM chunk_analyses ORDER BY chunk_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(analysis_from_row).collect()
    }

    async fn clear_chunk_analyses(&self) -> Result<()> {
        sqlx::query("DELETE FROM chunk_analyses")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_style_profile(&self, profile: &StyleProfile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO style_profiles (version, text, structured_json, sample_size,
                                        chunk_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(profile.version)
        .bind(&profile.text)
        .bind(serde_json::to_string(&profile.structured)?)
        .bind(profile.sample_size as i64)
        .bind(profile.chunk_count as i64)
        .bind(profile.created_at.timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save style profile version {}", profile.version))?;
        Ok(())
    }

    async fn get_latest_style_profile(&self) -> Result<Option<StyleProfile>> {
        let row = sqlx::query(
            "SELECT version, text, structured_json, sample_size, chunk_count, created_at \
             FROM style_profiles ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let structured: String = row.try_get("structured_json")?;
        let sample_size: i64 = row.try_get("sample_size")?;
        let chunk_count: i64 = row.try_get("chunk_count")?;
        Ok(Some(StyleProfile {
            version: row.try_get("version")?,
            text: row.try_get("text")?,
            structured: serde_json::from_str(&structured)
                .with_context(|| "corrupt structured_json")?,
            sample_size: sample_size as usize,
            chunk_count: chunk_count as usize,
            created_at: from_timestamp(row.try_get("created_at")?)?,
        }))
    }

    async fn save_examples(&self, examples: &[Example]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM examples")
            .execute(&mut *tx)
            .await?;
        for example in examples {
            sqlx::query(
                "INSERT INTO examples (cluster_id, document_id, distance_to_centroid) VALUES (?, ?, ?)",
            )
            .bind(example.cluster_id as i64)
            .bind(&example.document_id)
            .bind(example.distance_to_centroid as f64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_examples(&self) -> Result<Vec<Example>> {
        let rows = sqlx::query(
            "SELECT cluster_id, document_id, distance_to_centroid FROM examples ORDER BY cluster_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let cluster_id: i64 = row.try_get("cluster_id")?;
                let distance: f64 = row.try_get("distance_to_centroid")?;
                Ok(Example {
                    document_id: row.try_get("document_id")?,
                    cluster_id: cluster_id as usize,
                    distance_to_centroid: distance as f32,
                })
            })
            .collect()
    }
}
