//! Corpus import from JSON Lines.
//!
//! One JSON object per line:
//!
//! ```json
//! {"title": "...", "body": "...", "published_at": "2023-04-01", "categories": ["news"], "source_id": "wp-42"}
//! ```
//!
//! `published_at` accepts RFC 3339 or `YYYY-MM-DD`. Blank lines are ignored.
//! Documents shorter than `[import].min_words` are skipped, and so are
//! duplicates: two documents with the same title and body share a SHA-256
//! content hash, and only the first one is kept (in the file and across
//! imports). Every stored document gets a fresh UUID v4.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::BufRead;
use std::path::Path;
use uuid::Uuid;

use restyle_core::models::Document;
use restyle_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Deserialize)]
struct ImportRecord {
    title: String,
    body: String,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    source_id: Option<String>,
}

/// A parsed document plus the identifier it had in the source system.
#[derive(Debug, Clone)]
pub struct ImportedDocument {
    pub document: Document,
    pub source_id: Option<String>,
}

/// Result of parsing an import file.
#[derive(Debug, Default)]
pub struct ImportScan {
    pub documents: Vec<ImportedDocument>,
    pub skipped_short: usize,
    pub skipped_duplicate: usize,
}

impl ImportScan {
    pub fn total_words(&self) -> usize {
        self.documents.iter().map(|d| d.document.word_count).sum()
    }

    pub fn category_count(&self) -> usize {
        self.documents
            .iter()
            .flat_map(|d| d.document.categories.iter())
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Dedup key for a document: hex SHA-256 of its title and body.
pub fn content_hash(title: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0u8]);
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn parse_date(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{}': expected RFC 3339 or YYYY-MM-DD", value))?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .with_context(|| format!("invalid date '{}'", value))
}

/// Strip trailing spaces on each line and collapse runs of blank lines.
fn clean_body(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut blank_run = 0;
    for line in body.trim().lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Parse JSONL from `reader`.
///
/// # Errors
///
/// Fails on the first malformed line, naming its line number.
pub fn parse_jsonl<R: BufRead>(reader: R, min_words: usize) -> Result<ImportScan> {
    let mut scan = ImportScan::default();
    let mut seen = HashSet::new();

    for (i, line) in reader.lines().enumerate() {
        let line_no = i + 1;
        let line = line.with_context(|| format!("Failed to read line {}", line_no))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ImportRecord = serde_json::from_str(&line)
            .with_context(|| format!("Invalid JSON on line {}", line_no))?;

        let title = record.title.trim().to_string();
        let body = clean_body(&record.body);
        if title.is_empty() && body.is_empty() {
            bail!("line {}: document has neither title nor body", line_no);
        }
        let published_at = record
            .published_at
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|s| parse_date(s.trim()))
            .transpose()
            .with_context(|| format!("line {}", line_no))?;
        let categories: Vec<String> = record
            .categories
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        let document = Document::new(
            Uuid::new_v4().to_string(),
            title,
            body,
            published_at,
            categories,
        );
        if document.word_count < min_words {
            scan.skipped_short += 1;
            continue;
        }
        if !seen.insert(content_hash(&document.title, &document.body)) {
            scan.skipped_duplicate += 1;
            continue;
        }
        scan.documents.push(ImportedDocument {
            document,
            source_id: record.source_id,
        });
    }

    Ok(scan)
}

/// `restyle import`: parse `path` and store its documents.
pub async fn run_import(config: &Config, path: &Path, force: bool, dry_run: bool) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let scan = parse_jsonl(std::io::BufReader::new(file), config.import.min_words)?;

    println!("import {}", path.display());
    println!("  documents found: {}", scan.documents.len());
    println!("  skipped (< {} words): {}", config.import.min_words, scan.skipped_short);
    println!("  skipped (duplicate in file): {}", scan.skipped_duplicate);
    println!("  total words: {}", scan.total_words());
    println!("  categories: {}", scan.category_count());

    if dry_run {
        println!("dry run: nothing written");
        return Ok(());
    }

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);

    if force {
        store.clear_documents().await?;
        println!("  cleared existing corpus");
    }

    let added = store.insert_imported(&scan.documents).await?;
    tracing::info!(added, found = scan.documents.len(), "import finished");
    println!("  imported: {}", added);
    println!("  skipped (already stored): {}", scan.documents.len() - added);
    println!("ok");

    store.pool().close().await;
    Ok(())
}
