//! Term-weighted vector space model over the corpus.
//!
//! # Algorithm
//!
//! 1. Each document is `title + " " + body`, lowercased and split into runs
//!    of alphanumeric characters (and `_`); tokens shorter than two
//!    characters are dropped.
//! 2. Terms are the unigrams plus the bigrams of adjacent tokens.
//! 3. When there are more distinct terms than `max_features`, the most
//!    frequent terms over the whole corpus are kept (ties by term order).
//!    Kept terms get indices in alphabetical order.
//! 4. Weights are `(1 + ln tf) × idf` with the smoothed
//!    `idf = ln((1 + n) / (1 + df)) + 1`, and every vector is L2-normalized.
//!
//! [`VectorSpaceModel::transform`] projects new text into an existing model
//! without refitting: unseen terms are dropped.
//!
//! The model is persisted as CBOR with a format version. f32 weights
//! round-trip exactly, so a reloaded model compares identically.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::models::Document;

/// Version of the persisted model layout.
pub const MODEL_FORMAT_VERSION: u32 = 1;

/// Vectorizer settings.
#[derive(Debug, Clone, Copy)]
pub struct VectorizerConfig {
    pub max_features: usize,
    /// Longest n-gram, in tokens.
    pub ngram_max: usize,
}

impl Default for VectorizerConfig {
    fn default() -> Self {
        Self {
            max_features: 10_000,
            ngram_max: 2,
        }
    }
}

/// Sparse vector with strictly increasing indices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f32)> + '_ {
        self.indices
            .iter()
            .zip(&self.values)
            .map(|(&i, &v)| (i as usize, v))
    }

    pub fn norm(&self) -> f64 {
        self.values
            .iter()
            .map(|&v| (v as f64) * (v as f64))
            .sum::<f64>()
            .sqrt()
    }

    pub fn dot(&self, other: &SparseVector) -> f64 {
        let (mut a, mut b) = (0, 0);
        let mut sum = 0.0;
        while a < self.indices.len() && b < other.indices.len() {
            match self.indices[a].cmp(&other.indices[b]) {
                std::cmp::Ordering::Equal => {
                    sum += self.values[a] as f64 * other.values[b] as f64;
                    a += 1;
                    b += 1;
                }
                std::cmp::Ordering::Less => a += 1,
                std::cmp::Ordering::Greater => b += 1,
            }
        }
        sum
    }

    /// Dot product with a dense vector.
    pub fn dot_dense(&self, dense: &[f64]) -> f64 {
        self.iter()
            .filter_map(|(i, v)| dense.get(i).map(|d| v as f64 * d))
            .sum()
    }

    /// Cosine similarity; 0 when either vector is zero.
    pub fn cosine(&self, other: &SparseVector) -> f64 {
        let denom = self.norm() * other.norm();
        if denom == 0.0 {
            0.0
        } else {
            self.dot(other) / denom
        }
    }
}

/// Lowercase word tokens of at least two characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_string)
        .collect()
}

/// Unigrams through `ngram_max`-grams of `tokens`, joined by a space.
fn ngrams(tokens: &[String], ngram_max: usize) -> Vec<String> {
    let mut terms = tokens.to_vec();
    for n in 2..=ngram_max {
        terms.extend(tokens.windows(n).map(|w| w.join(" ")));
    }
    terms
}

fn term_counts(text: &str, ngram_max: usize) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for term in ngrams(&tokenize(text), ngram_max) {
        *counts.entry(term).or_insert(0) += 1;
    }
    counts
}

/// Vocabulary, IDF weights and one vector per corpus document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorSpaceModel {
    format_version: u32,
    ngram_max: usize,
    vocabulary: BTreeMap<String, u32>,
    idf: Vec<f32>,
    document_ids: Vec<String>,
    vectors: Vec<SparseVector>,
}

impl VectorSpaceModel {
    /// Fit the model on `documents`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::EmptyCorpus`] if `documents` is empty.
    pub fn fit(documents: &[Document], config: &VectorizerConfig) -> Result<Self> {
        if documents.is_empty() {
            return Err(PipelineError::EmptyCorpus.into());
        }
        let ngram_max = config.ngram_max.max(1);

        let counts: Vec<HashMap<String, u32>> = documents
            .iter()
            .map(|d| term_counts(&d.vector_text(), ngram_max))
            .collect();

        let mut df: HashMap<&str, u32> = HashMap::new();
        let mut totals: HashMap<&str, u64> = HashMap::new();
        for doc in &counts {
            for (term, &tf) in doc {
                *df.entry(term.as_str()).or_insert(0) += 1;
                *totals.entry(term.as_str()).or_insert(0) += tf as u64;
            }
        }

        let mut terms: Vec<&str> = totals.keys().copied().collect();
        if terms.len() > config.max_features {
            terms.sort_by(|a, b| totals[b].cmp(&totals[a]).then_with(|| a.cmp(b)));
            terms.truncate(config.max_features);
        }
        terms.sort_unstable();

        let n = documents.len() as f64;
        let mut vocabulary = BTreeMap::new();
        let mut idf = Vec::with_capacity(terms.len());
        for (index, term) in terms.iter().enumerate() {
            vocabulary.insert(term.to_string(), index as u32);
            let doc_freq = df[term] as f64;
            idf.push((((1.0 + n) / (1.0 + doc_freq)).ln() + 1.0) as f32);
        }

        let mut model = Self {
            format_version: MODEL_FORMAT_VERSION,
            ngram_max,
            vocabulary,
            idf,
            document_ids: documents.iter().map(|d| d.id.clone()).collect(),
            vectors: Vec::with_capacity(documents.len()),
        };
        model.vectors = counts.iter().map(|c| model.weigh(c)).collect();

        tracing::debug!(
            documents = model.len(),
            features = model.vocabulary.len(),
            "vector space model fitted"
        );
        Ok(model)
    }

    fn weigh(&self, counts: &HashMap<String, u32>) -> SparseVector {
        let mut weighted: Vec<(u32, f64)> = counts
            .iter()
            .filter_map(|(term, &tf)| {
                let index = *self.vocabulary.get(term)?;
                let weight = (1.0 + (tf as f64).ln()) * self.idf[index as usize] as f64;
                Some((index, weight))
            })
            .collect();
        weighted.sort_unstable_by_key(|(index, _)| *index);

        let norm = weighted.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
        let scale = if norm > 0.0 { 1.0 / norm } else { 0.0 };
        SparseVector {
            indices: weighted.iter().map(|(i, _)| *i).collect(),
            values: weighted.iter().map(|(_, w)| (w * scale) as f32).collect(),
        }
    }

    /// Project `text` into this model's space.
    pub fn transform(&self, text: &str) -> SparseVector {
        self.weigh(&term_counts(text, self.ngram_max))
    }

    pub fn len(&self) -> usize {
        self.document_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.document_ids.is_empty()
    }

    pub fn feature_count(&self) -> usize {
        self.vocabulary.len()
    }

    pub fn document_ids(&self) -> &[String] {
        &self.document_ids
    }

    pub fn vectors(&self) -> &[SparseVector] {
        &self.vectors
    }

    pub fn vector_for(&self, document_id: &str) -> Option<&SparseVector> {
        self.document_ids
            .iter()
            .position(|id| id == document_id)
            .map(|i| &self.vectors[i])
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_cbor::to_vec(self).context("failed to encode vector model")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let model: Self = serde_cbor::from_slice(bytes).context("failed to decode vector model")?;
        if model.format_version != MODEL_FORMAT_VERSION {
            return Err(PipelineError::missing(format!(
                "vector model in format {}",
                MODEL_FORMAT_VERSION
            ))
            .into());
        }
        if model.vectors.len() != model.document_ids.len() || model.idf.len() != model.vocabulary.len() {
            bail!("vector model is inconsistent; rerun `restyle analyze`");
        }
        Ok(model)
    }

    /// Write the model to `path`, replacing any previous artifact.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = path.with_extension("cbor.tmp");
        std::fs::write(&tmp, self.to_bytes()?)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Load a model saved by [`save`](Self::save).
    ///
    /// # Errors
    ///
    /// [`PipelineError::MissingArtifact`] if `path` does not exist or holds
    /// a model in another format version.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::missing("vector model").into());
        }
        let bytes =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, title: &str, body: &str) -> Document {
        Document::new(id, title, body, None, vec![])
    }

    fn corpus() -> Vec<Document> {
        vec![
            doc("a", "Rust tips", "Borrow checker rules keep memory safe."),
            doc("b", "Garden notes", "Tomatoes need sun and water every day."),
            doc("c", "Rust again", "The borrow checker and lifetimes explained."),
        ]
    }

    #[test]
    fn tokenizer_drops_short_tokens() {
        assert_eq!(
            tokenize("A quick-brown fox, I think: snake_case 42!"),
            vec!["quick", "brown", "fox", "think", "snake_case", "42"]
        );
    }

    #[test]
    fn bigrams_are_terms() {
        let model = VectorSpaceModel::fit(&corpus(), &VectorizerConfig::default()).unwrap();
        assert!(model.vocabulary.contains_key("borrow checker"));
        assert!(model.vocabulary.contains_key("rust"));
    }

    #[test]
    fn vectors_are_unit_length() {
        let model = VectorSpaceModel::fit(&corpus(), &VectorizerConfig::default()).unwrap();
        for v in model.vectors() {
            assert!((v.norm() - 1.0).abs() < 1e-5);
            assert!(v.indices.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn feature_cap_keeps_most_frequent_terms() {
        let docs = vec![
            doc("1", "alpha alpha alpha", "beta beta gamma"),
            doc("2", "alpha", "delta"),
        ];
        let config = VectorizerConfig {
            max_features: 2,
            ngram_max: 1,
        };
        let model = VectorSpaceModel::fit(&docs, &config).unwrap();
        let terms: Vec<&str> = model.vocabulary.keys().map(String::as_str).collect();
        assert_eq!(terms, vec!["alpha", "beta"]);
    }

    #[test]
    fn rarer_terms_weigh_more() {
        let model = VectorSpaceModel::fit(&corpus(), &VectorizerConfig::default()).unwrap();
        let common = model.idf[model.vocabulary["borrow"] as usize];
        let rare = model.idf[model.vocabulary["tomatoes"] as usize];
        assert!(rare > common);
    }

    #[test]
    fn transform_matches_fitted_vector_and_ignores_unseen_terms() {
        let docs = corpus();
        let model = VectorSpaceModel::fit(&docs, &VectorizerConfig::default()).unwrap();
        let projected = model.transform(&docs[1].vector_text());
        assert_eq!(&projected, model.vector_for("b").unwrap());

        assert!(model.transform("zebra xylophone").is_empty());
    }

    #[test]
    fn similar_documents_are_closer() {
        let model = VectorSpaceModel::fit(&corpus(), &VectorizerConfig::default()).unwrap();
        let a = model.vector_for("a").unwrap();
        let b = model.vector_for("b").unwrap();
        let c = model.vector_for("c").unwrap();
        assert!(a.cosine(c) > a.cosine(b));
    }

    #[test]
    fn save_and_load_preserve_the_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vector_model.cbor");
        let model = VectorSpaceModel::fit(&corpus(), &VectorizerConfig::default()).unwrap();
        model.save(&path).unwrap();

        let loaded = VectorSpaceModel::load(&path).unwrap();
        assert_eq!(loaded, model);
        assert_eq!(loaded.transform("borrow checker"), model.transform("borrow checker"));
    }

    #[test]
    fn missing_artifact_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = VectorSpaceModel::load(&dir.path().join("absent.cbor")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingArtifact { .. })
        ));
    }

    #[test]
    fn foreign_format_version_is_rejected() {
        let mut model = VectorSpaceModel::fit(&corpus(), &VectorizerConfig::default()).unwrap();
        model.format_version = MODEL_FORMAT_VERSION + 1;
        let bytes = serde_cbor::to_vec(&model).unwrap();
        let err = VectorSpaceModel::from_bytes(&bytes).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingArtifact { .. })
        ));
        assert!(err.to_string().contains("run `restyle analyze` first"));
    }
}
