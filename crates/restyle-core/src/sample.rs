//! Stratified corpus sampling.
//!
//! Selects a representative subset of the corpus for style analysis,
//! balanced first by primary category and then by publication time.
//!
//! # Algorithm
//!
//! 1. Target size is `max(10, floor(corpus × fraction))`.
//! 2. Group documents by primary category (first-seen order) and sort each
//!    group by timestamp; undated documents sort first.
//! 3. Each category gets a quota proportional to its share of the corpus,
//!    rounded, at least 1 and at most the group size.
//! 4. A category whose quota covers the whole group is taken entirely.
//!    Otherwise the group is split into up to 4 equal-width time slices and
//!    `remaining / slices_left` documents are drawn without replacement from
//!    each slice in chronological order.
//! 5. Rounding can leave the aggregate below the target; the shortfall is
//!    drawn uniformly from the unselected documents.
//! 6. An aggregate above the target is down-sampled uniformly to the target.
//! 7. The result is shuffled.
//!
//! Every random step uses one ChaCha RNG seeded from the caller's seed, so
//! the same corpus and seed always give the same sample.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Result;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::PipelineError;
use crate::models::Document;

/// Smallest sample ever targeted, whatever the fraction.
pub const MIN_SAMPLE_SIZE: usize = 10;

/// Maximum number of chronological slices per category.
const MAX_TIME_SLICES: usize = 4;

/// Sampling parameters.
#[derive(Debug, Clone)]
pub struct SampleParams {
    /// Fraction of the corpus to aim for, in `(0, 1]`.
    pub fraction: f64,
    pub seed: u64,
}

impl Default for SampleParams {
    fn default() -> Self {
        Self {
            fraction: 0.18,
            seed: 42,
        }
    }
}

/// Outcome of one sampling pass.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Sampled documents, shuffled.
    pub documents: Vec<Document>,
    /// Requested sample size before capping at the corpus size.
    pub target: usize,
    /// Documents selected per primary category, before down-sampling.
    pub allocation: BTreeMap<String, usize>,
    /// Aggregate size before down-sampling to `target`.
    pub pre_correction: usize,
    /// Documents added to make up a rounding shortfall.
    pub topped_up: usize,
}

impl Sample {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Target sample size for a corpus of `corpus_size` documents.
pub fn target_size(corpus_size: usize, fraction: f64) -> usize {
    let scaled = (corpus_size as f64 * fraction).floor() as usize;
    scaled.max(MIN_SAMPLE_SIZE)
}

/// Draw a stratified sample from `documents`.
///
/// # Errors
///
/// [`PipelineError::EmptyCorpus`] if `documents` is empty.
pub fn stratified_sample(documents: &[Document], params: &SampleParams) -> Result<Sample> {
    if documents.is_empty() {
        return Err(PipelineError::EmptyCorpus.into());
    }

    let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
    let total = documents.len();
    let target = target_size(total, params.fraction);

    let mut groups: Vec<(String, Vec<&Document>)> = Vec::new();
    let mut group_index: HashMap<&str, usize> = HashMap::new();
    for doc in documents {
        let category = doc.primary_category();
        let idx = *group_index.entry(category).or_insert_with(|| {
            groups.push((category.to_string(), Vec::new()));
            groups.len() - 1
        });
        groups[idx].1.push(doc);
    }
    for (_, group) in groups.iter_mut() {
        group.sort_by_key(|d| d.published_at);
    }

    let mut selected: Vec<&Document> = Vec::with_capacity(target);
    let mut allocation: BTreeMap<String, usize> = BTreeMap::new();

    for (category, group) in &groups {
        let share = (target * group.len()) as f64 / total as f64;
        let quota = (share.round() as usize).max(1).min(group.len());

        let before = selected.len();
        if quota >= group.len() {
            selected.extend(group.iter().copied());
        } else {
            sample_time_slices(group, quota, &mut rng, &mut selected);
        }
        *allocation.entry(category.clone()).or_insert(0) += selected.len() - before;
    }

    let reachable = target.min(total);
    let mut topped_up = 0;
    if selected.len() < reachable {
        let chosen: HashSet<&str> = selected.iter().map(|d| d.id.as_str()).collect();
        let leftovers: Vec<&Document> = documents
            .iter()
            .filter(|d| !chosen.contains(d.id.as_str()))
            .collect();
        let need = reachable - selected.len();
        for &doc in leftovers.choose_multiple(&mut rng, need) {
            *allocation
                .entry(doc.primary_category().to_string())
                .or_insert(0) += 1;
            selected.push(doc);
            topped_up += 1;
        }
    }

    let pre_correction = selected.len();
    if selected.len() > target {
        selected = selected
            .choose_multiple(&mut rng, target)
            .copied()
            .collect();
    }

    let mut sampled: Vec<Document> = selected.into_iter().cloned().collect();
    sampled.shuffle(&mut rng);

    tracing::debug!(
        target_size = target,
        pre_correction,
        topped_up,
        sampled = sampled.len(),
        categories = allocation.len(),
        "stratified sample drawn"
    );

    Ok(Sample {
        documents: sampled,
        target,
        allocation,
        pre_correction,
        topped_up,
    })
}

/// Draw `quota` documents from a chronologically sorted group, spread across
/// up to [`MAX_TIME_SLICES`] equal-width slices.
fn sample_time_slices<'a>(
    group: &[&'a Document],
    quota: usize,
    rng: &mut ChaCha8Rng,
    out: &mut Vec<&'a Document>,
) {
    let n_slices = quota.min(MAX_TIME_SLICES);
    let slice_size = group.len() / n_slices;
    let mut remaining = quota;

    for s in 0..n_slices {
        let start = s * slice_size;
        let end = if s < n_slices - 1 {
            start + slice_size
        } else {
            group.len()
        };
        let slice = &group[start..end];

        let take = (remaining / (n_slices - s)).min(slice.len());
        out.extend(slice.choose_multiple(&mut *rng, take).copied());
        remaining -= take;
    }
}
