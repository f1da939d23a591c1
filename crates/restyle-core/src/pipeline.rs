//! End-to-end analysis runs.
//!
//! [`run_style_analysis`] drives the style pipeline:
//!
//! ```text
//! corpus ─► stratified sample ─► chunks ─► per-chunk analyses ─► synthesis ─► profile
//!                                   │              ▲
//!                                   └─ resume ─────┘  (saved analyses reused)
//! ```
//!
//! Each chunk analysis is persisted as soon as it arrives. On resume, a saved
//! analysis is reused only if its chunk id and document ids match the freshly
//! computed chunk; everything else is analyzed again. If any chunk still has
//! no analysis after the map phase, the run stops with
//! [`PipelineError::IncompleteAnalysis`] before synthesis so a later resume
//! can fill the gap.
//!
//! [`build_examples`] drives the independent example pipeline: fit the
//! vector model on the whole corpus, cluster it, write the model artifact
//! and only then replace the example set, so stored examples never point
//! into a model that failed to save.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::chunk::{chunk_documents, ChunkLimits};
use crate::cluster::{select_examples, ClusterConfig};
use crate::completion::{GenerationParams, Usage};
use crate::error::PipelineError;
use crate::events::{EventSink, PipelineEvent};
use crate::models::{Chunk, ChunkAnalysis, Example, StyleProfile};
use crate::orchestrator::{BatchOrchestrator, ExecutionMode, RequestResult, ResultObserver};
use crate::sample::{stratified_sample, SampleParams};
use crate::store::Store;
use crate::synthesize::{build_chunk_requests, SynthesisParams, Synthesizer};
use crate::vector::{VectorSpaceModel, VectorizerConfig};

/// Token counter injected into the chunker.
pub type TokenCounter<'a> = &'a (dyn Fn(&str) -> usize + Send + Sync);

/// Settings for one style analysis run.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    pub sample: SampleParams,
    pub chunking: ChunkLimits,
    pub mode: ExecutionMode,
    pub resume: bool,
    /// Model and limits for the per-chunk calls.
    pub analysis: GenerationParams,
    pub synthesis: SynthesisParams,
}

/// Summary of a completed style analysis.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub profile: StyleProfile,
    pub corpus_size: usize,
    pub sample_size: usize,
    pub chunk_count: usize,
    /// Chunks whose saved analysis was reused.
    pub reused: usize,
    /// Chunks analyzed in this run.
    pub analyzed: usize,
    /// Path that produced this run's analyses; `None` when all were reused.
    pub mode: Option<ExecutionMode>,
    pub usage: Usage,
}

/// Saves each successful chunk analysis as soon as it arrives.
struct PersistAnalyses<'a, S: Store + ?Sized> {
    store: &'a S,
    chunks: HashMap<String, &'a Chunk>,
    count_tokens: TokenCounter<'a>,
    saved: Mutex<Vec<ChunkAnalysis>>,
}

impl<'a, S: Store + ?Sized> PersistAnalyses<'a, S> {
    /// Analyses saved so far, in arrival order.
    fn into_saved(self) -> Vec<ChunkAnalysis> {
        self.saved.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<'a, S: Store + ?Sized> ResultObserver for PersistAnalyses<'a, S> {
    async fn on_result(&self, request_id: &str, result: &RequestResult) -> Result<()> {
        let (RequestResult::Succeeded(text), Some(chunk)) = (result, self.chunks.get(request_id))
        else {
            return Ok(());
        };
        let analysis = ChunkAnalysis {
            chunk_id: chunk.index,
            document_ids: chunk.document_ids(),
            analysis_text: text.clone(),
            token_count: (self.count_tokens)(text),
            created_at: Utc::now(),
        };
        self.store.save_chunk_analysis(&analysis).await?;
        tracing::debug!(chunk_id = chunk.index, "chunk analysis saved");
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(analysis);
        Ok(())
    }
}

/// Split `chunks` into reusable saved analyses and chunks still to analyze.
fn plan_resume<'c>(
    chunks: &'c [Chunk],
    saved: Vec<ChunkAnalysis>,
) -> (Vec<ChunkAnalysis>, Vec<&'c Chunk>, usize) {
    let mut by_chunk: HashMap<usize, ChunkAnalysis> =
        saved.into_iter().map(|a| (a.chunk_id, a)).collect();
    let saved_count = by_chunk.len();

    let mut reused = Vec::new();
    let mut pending = Vec::new();
    for chunk in chunks {
        match by_chunk.remove(&chunk.index) {
            Some(analysis)
                if analysis.document_ids == chunk.document_ids()
                    && !analysis.analysis_text.trim().is_empty() =>
            {
                reused.push(analysis)
            }
            _ => pending.push(chunk),
        }
    }
    let stale = saved_count - reused.len();
    (reused, pending, stale)
}

/// Run the style pipeline and persist the resulting profile.
///
/// # Errors
///
/// - [`PipelineError::EmptyCorpus`] if the store holds no documents.
/// - [`PipelineError::IncompleteAnalysis`] if any chunk analysis failed.
/// - Any fatal generation or store error.
pub async fn run_style_analysis<S: Store + ?Sized>(
    store: &S,
    orchestrator: &BatchOrchestrator<'_>,
    synthesizer: &Synthesizer<'_>,
    options: &AnalysisOptions,
    count_tokens: TokenCounter<'_>,
    events: &dyn EventSink,
) -> Result<AnalysisReport> {
    let documents = store.get_all_documents().await?;
    if documents.is_empty() {
        return Err(PipelineError::EmptyCorpus.into());
    }

    let sample = stratified_sample(&documents, &options.sample)?;
    tracing::info!(sample = sample.len(), corpus = documents.len(), "corpus sampled");
    events.emit(PipelineEvent::Sampled {
        sample_size: sample.len(),
        corpus_size: documents.len(),
    });

    let chunks = chunk_documents(&sample.documents, &options.chunking, count_tokens)?;
    tracing::info!(chunks = chunks.len(), "sample chunked");
    events.emit(PipelineEvent::Chunked {
        chunks: chunks.len(),
    });

    let (mut analyses, pending) = if options.resume {
        let (reused, pending, stale) = plan_resume(&chunks, store.get_chunk_analyses().await?);
        tracing::info!(reused = reused.len(), stale, "resuming analysis");
        events.emit(PipelineEvent::Resumed {
            reused: reused.len(),
            stale,
        });
        (reused, pending)
    } else {
        store.clear_chunk_analyses().await?;
        (Vec::new(), chunks.iter().collect())
    };
    let reused = analyses.len();

    let mut usage = Usage::default();
    let mut mode = None;
    if !pending.is_empty() {
        let observer = PersistAnalyses {
            store,
            chunks: pending.iter().map(|c| (c.request_id(), *c)).collect(),
            count_tokens,
            saved: Mutex::new(Vec::new()),
        };
        let requests = build_chunk_requests(pending.iter().copied());
        let outcome = orchestrator
            .run(&requests, &options.analysis, options.mode, &observer)
            .await?;
        usage += outcome.usage;
        mode = Some(outcome.mode);

        let failed = outcome.failed_count();
        if failed > 0 {
            return Err(PipelineError::IncompleteAnalysis {
                failed,
                total: chunks.len(),
            }
            .into());
        }
        analyses.extend(observer.into_saved());
    }
    analyses.sort_by_key(|a| a.chunk_id);

    let version = store
        .get_latest_style_profile()
        .await?
        .map_or(1, |p| p.version + 1);
    let synthesis = synthesizer
        .synthesize(&analyses, sample.len(), version, &options.synthesis)
        .await?;
    usage += synthesis.usage;
    store.save_style_profile(&synthesis.profile).await?;
    tracing::info!(version, "style profile saved");

    Ok(AnalysisReport {
        profile: synthesis.profile,
        corpus_size: documents.len(),
        sample_size: sample.len(),
        chunk_count: chunks.len(),
        reused,
        analyzed: pending.len(),
        mode,
        usage,
    })
}

/// Settings for the example pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExampleOptions {
    pub vectorizer: VectorizerConfig,
    pub clustering: ClusterConfig,
}

/// Fit the vector model on the whole corpus, select one example per
/// cluster, save the model to `model_path` and replace the stored example
/// set.
pub async fn build_examples<S: Store + ?Sized>(
    store: &S,
    options: &ExampleOptions,
    model_path: &Path,
    events: &dyn EventSink,
) -> Result<(VectorSpaceModel, Vec<Example>)> {
    let documents = store.get_all_documents().await?;
    let model = VectorSpaceModel::fit(&documents, &options.vectorizer)?;
    events.emit(PipelineEvent::ModelBuilt {
        documents: model.len(),
        features: model.feature_count(),
    });

    let examples = select_examples(&model, &options.clustering)?;
    model.save(model_path)?;
    store.save_examples(&examples).await?;
    events.emit(PipelineEvent::Clustered {
        clusters: options.clustering.n_clusters.min(model.len()),
        examples: examples.len(),
    });
    Ok((model, examples))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Document;
    use crate::store::memory::InMemoryStore;

    fn chunk(index: usize, ids: &[&str]) -> Chunk {
        Chunk {
            index,
            documents: ids
                .iter()
                .map(|id| Document::new(*id, "t", "b", None, vec![]))
                .collect(),
            token_estimate: 0,
        }
    }

    fn saved(chunk_id: usize, ids: &[&str], text: &str) -> ChunkAnalysis {
        ChunkAnalysis {
            chunk_id,
            document_ids: ids.iter().map(|s| s.to_string()).collect(),
            analysis_text: text.into(),
            token_count: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn saved_analyses_survive_a_poisoned_lock() {
        let store = InMemoryStore::new();
        let first = chunk(0, &["a"]);
        let second = chunk(1, &["b"]);
        let count = |text: &str| text.len();
        let observer = PersistAnalyses {
            store: &store,
            chunks: [(first.request_id(), &first), (second.request_id(), &second)]
                .into_iter()
                .collect(),
            count_tokens: &count,
            saved: Mutex::new(Vec::new()),
        };

        observer
            .on_result("chunk_0", &RequestResult::Succeeded("zero".into()))
            .await
            .unwrap();
        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = observer.saved.lock().unwrap();
            panic!("poison the lock");
        }));
        assert!(poisoned.is_err());
        assert!(observer.saved.is_poisoned());

        observer
            .on_result("chunk_1", &RequestResult::Succeeded("one".into()))
            .await
            .unwrap();
        let kept: Vec<usize> = observer.into_saved().iter().map(|a| a.chunk_id).collect();
        assert_eq!(kept, vec![0, 1]);
        assert_eq!(store.get_chunk_analyses().await.unwrap().len(), 2);
    }

    #[test]
    fn resume_reuses_only_matching_analyses() {
        let chunks = vec![chunk(0, &["a", "b"]), chunk(1, &["c"]), chunk(2, &["d"])];
        let (reused, pending, stale) = plan_resume(
            &chunks,
            vec![
                saved(0, &["a", "b"], "ok"),
                saved(1, &["x"], "other docs"),
                saved(2, &["d"], ""),
                saved(7, &["z"], "orphan"),
            ],
        );
        assert_eq!(reused.len(), 1);
        assert_eq!(reused[0].chunk_id, 0);
        let pending: Vec<usize> = pending.iter().map(|c| c.index).collect();
        assert_eq!(pending, vec![1, 2]);
        assert_eq!(stale, 3);
    }
}
