use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the schema on a fresh connection. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // `seq` keeps insertion order; `content_hash` is the import dedup key.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            source_id TEXT,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            published_at INTEGER,
            categories_json TEXT NOT NULL DEFAULT '[]',
            word_count INTEGER NOT NULL,
            content_hash TEXT UNIQUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_analyses (
            chunk_id INTEGER PRIMARY KEY,
            document_ids_json TEXT NOT NULL,
            analysis_text TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS style_profiles (
            version INTEGER PRIMARY KEY,
            text TEXT NOT NULL,
            structured_json TEXT NOT NULL,
            sample_size INTEGER NOT NULL,
            chunk_count INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS examples (
            cluster_id INTEGER PRIMARY KEY,
            document_id TEXT NOT NULL,
            distance_to_centroid REAL NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_published_at ON documents(published_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
