//! Corpus statistics.
//!
//! Summarizes what has been imported and analyzed: document and word
//! counts, the publication date range, the category distribution, and
//! whether examples and a style profile exist. Used by `restyle corpus stats`.

use anyhow::Result;
use std::collections::BTreeMap;

use restyle_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::progress::format_number;
use crate::sqlite_store::SqliteStore;

/// Categories listed by `corpus stats`.
const TOP_CATEGORIES: usize = 20;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorpusStats {
    pub documents: usize,
    pub total_words: usize,
    pub avg_words: f64,
    pub min_words: usize,
    pub max_words: usize,
    /// First and last publication date (`YYYY-MM-DD`).
    pub date_range: Option<(String, String)>,
    /// Label counts, most frequent first.
    pub categories: Vec<(String, usize)>,
    pub examples: usize,
    pub has_profile: bool,
}

pub async fn compute_stats<S: Store + ?Sized>(store: &S) -> Result<CorpusStats> {
    let documents = store.get_all_documents().await?;
    let examples = store.get_examples().await?.len();
    let has_profile = store.get_latest_style_profile().await?.is_some();

    if documents.is_empty() {
        return Ok(CorpusStats {
            examples,
            has_profile,
            ..CorpusStats::default()
        });
    }

    let words: Vec<usize> = documents.iter().map(|d| d.word_count).collect();
    let total_words: usize = words.iter().sum();

    let dates: Vec<_> = documents.iter().filter_map(|d| d.published_at).collect();
    let date_range = match (dates.iter().min(), dates.iter().max()) {
        (Some(first), Some(last)) => Some((
            first.format("%Y-%m-%d").to_string(),
            last.format("%Y-%m-%d").to_string(),
        )),
        _ => None,
    };

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for category in documents.iter().flat_map(|d| d.categories.iter()) {
        *counts.entry(category.as_str()).or_default() += 1;
    }
    let mut categories: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(name, count)| (name.to_string(), count))
        .collect();
    categories.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    Ok(CorpusStats {
        documents: documents.len(),
        total_words,
        avg_words: total_words as f64 / documents.len() as f64,
        min_words: words.iter().copied().min().unwrap_or(0),
        max_words: words.iter().copied().max().unwrap_or(0),
        date_range,
        categories,
        examples,
        has_profile,
    })
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let stats = compute_stats(&store).await?;

    println!("restyle corpus stats");
    println!("====================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Documents:   {}", format_number(stats.documents as u64));
    println!("  Words:       {}", format_number(stats.total_words as u64));
    if stats.documents > 0 {
        println!("  Avg words:   {:.0}", stats.avg_words);
        println!("  Min words:   {}", stats.min_words);
        println!("  Max words:   {}", stats.max_words);
    }
    if let Some((first, last)) = &stats.date_range {
        println!("  Dates:       {} .. {}", first, last);
    }
    println!("  Examples:    {}", stats.examples);
    println!(
        "  Style guide: {}",
        if stats.has_profile { "yes" } else { "no" }
    );

    if !stats.categories.is_empty() {
        println!();
        println!("  Categories (top {}):", TOP_CATEGORIES);
        println!("  {:<40} {:>8}", "CATEGORY", "DOCS");
        println!("  {}", "-".repeat(49));
        for (name, count) in stats.categories.iter().take(TOP_CATEGORIES) {
            println!("  {:<40} {:>8}", name, count);
        }
    }
    println!();

    store.pool().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use restyle_core::models::Document;
    use restyle_core::store::memory::InMemoryStore;

    #[tokio::test]
    async fn empty_corpus_has_zero_stats() {
        let stats = compute_stats(&InMemoryStore::new()).await.unwrap();
        assert_eq!(stats.documents, 0);
        assert_eq!(stats.date_range, None);
        assert!(!stats.has_profile);
    }

    #[tokio::test]
    async fn stats_cover_words_dates_and_categories() {
        let date = |y, m, d| Some(Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap());
        let store = InMemoryStore::with_documents(vec![
            Document::new("a", "A", "one two three", date(2021, 5, 1), vec!["news".into()]),
            Document::new("b", "B", "one", date(2019, 1, 2), vec!["news".into(), "tech".into()]),
            Document::new("c", "C", "one two", None, vec!["art".into()]),
        ]);
        let stats = compute_stats(&store).await.unwrap();
        assert_eq!(stats.documents, 3);
        assert_eq!(stats.total_words, 6);
        assert_eq!(stats.avg_words, 2.0);
        assert_eq!((stats.min_words, stats.max_words), (1, 3));
        assert_eq!(
            stats.date_range,
            Some(("2019-01-02".to_string(), "2021-05-01".to_string()))
        );
        assert_eq!(
            stats.categories,
            vec![
                ("news".to_string(), 2),
                ("art".to_string(), 1),
                ("tech".to_string(), 1)
            ]
        );
    }
}
