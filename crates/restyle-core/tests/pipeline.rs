//! End-to-end tests for the analysis and example pipelines, run against the
//! in-memory store and a scripted generation service.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use restyle_core::chunk::{estimate_tokens, ChunkLimits};
use restyle_core::completion::{
    AnalysisRequest, BatchItemOutcome, BatchItemResult, BatchService, BatchStatus, Completion,
    CompletionRequest, CompletionService, GenerationParams, Usage,
};
use restyle_core::error::{PipelineError, ServiceError};
use restyle_core::events::{MemorySink, PipelineEvent};
use restyle_core::models::{Document, Example};
use restyle_core::orchestrator::{BatchOrchestrator, ExecutionMode, OrchestratorSettings};
use restyle_core::pipeline::{build_examples, run_style_analysis, AnalysisOptions, ExampleOptions};
use restyle_core::retrieve::find_similar_examples;
use restyle_core::retry::RetryPolicy;
use restyle_core::sample::SampleParams;
use restyle_core::store::memory::InMemoryStore;
use restyle_core::store::Store;
use restyle_core::synthesize::{
    SynthesisParams, Synthesizer, CHUNK_ANALYSIS_INSTRUCTIONS, STRUCTURE_INSTRUCTIONS,
    SYNTHESIS_INSTRUCTIONS,
};
use restyle_core::vector::VectorSpaceModel;

// ─── Scripted service ───────────────────────────────────────────────

/// Answers chunk analyses with "analysis #n", the describe call with a
/// markdown guide and the structure call with JSON. Chunk calls fail
/// permanently once `healthy_chunk_calls` have succeeded.
struct ScriptedService {
    healthy_chunk_calls: Option<usize>,
    chunk_calls: AtomicUsize,
    synthesis_calls: AtomicUsize,
}

impl ScriptedService {
    fn healthy() -> Self {
        Self {
            healthy_chunk_calls: None,
            chunk_calls: AtomicUsize::new(0),
            synthesis_calls: AtomicUsize::new(0),
        }
    }

    fn failing_after(calls: usize) -> Self {
        Self {
            healthy_chunk_calls: Some(calls),
            ..Self::healthy()
        }
    }

    fn chunk_calls(&self) -> usize {
        self.chunk_calls.load(Ordering::SeqCst)
    }

    fn synthesis_calls(&self) -> usize {
        self.synthesis_calls.load(Ordering::SeqCst)
    }
}

fn usage() -> Usage {
    Usage {
        input_tokens: 1000,
        output_tokens: 100,
        ..Usage::default()
    }
}

#[async_trait]
impl CompletionService for ScriptedService {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ServiceError> {
        let text = if request.instructions == CHUNK_ANALYSIS_INSTRUCTIONS {
            let n = self.chunk_calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy_chunk_calls.is_some_and(|limit| n >= limit) {
                return Err(ServiceError::Permanent {
                    status: Some(400),
                    message: "simulated outage".into(),
                });
            }
            format!("analysis #{}", n)
        } else if request.instructions == SYNTHESIS_INSTRUCTIONS {
            self.synthesis_calls.fetch_add(1, Ordering::SeqCst);
            "# House style\n\nShort sentences. Dry humor.".to_string()
        } else if request.instructions == STRUCTURE_INSTRUCTIONS {
            self.synthesis_calls.fetch_add(1, Ordering::SeqCst);
            "```json\n{\"tone\": \"dry\", \"sentences\": \"short\"}\n```".to_string()
        } else {
            return Err(ServiceError::Permanent {
                status: Some(400),
                message: "unexpected instructions".into(),
            });
        };
        Ok(Completion {
            text,
            usage: usage(),
        })
    }
}

/// Batch service that ends immediately; the listed request ids fail.
struct FlakyBatch {
    failing: Vec<String>,
    submitted: Mutex<Vec<String>>,
}

#[async_trait]
impl BatchService for FlakyBatch {
    async fn submit_batch(
        &self,
        requests: &[AnalysisRequest],
        _params: &GenerationParams,
    ) -> Result<String, ServiceError> {
        *self.submitted.lock().unwrap() = requests.iter().map(|r| r.id.clone()).collect();
        Ok("msgbatch_test".into())
    }

    async fn poll_batch(&self, _job_id: &str) -> Result<BatchStatus, ServiceError> {
        Ok(BatchStatus::Ended)
    }

    async fn fetch_batch_results(
        &self,
        _job_id: &str,
    ) -> Result<Vec<BatchItemResult>, ServiceError> {
        let submitted = self.submitted.lock().unwrap().clone();
        Ok(submitted
            .into_iter()
            .map(|id| {
                let outcome = if self.failing.contains(&id) {
                    BatchItemOutcome::Failed {
                        reason: "errored".into(),
                    }
                } else {
                    BatchItemOutcome::Succeeded {
                        text: format!("batch analysis of {}", id),
                        usage: usage(),
                    }
                };
                BatchItemResult {
                    request_id: id,
                    outcome,
                }
            })
            .collect())
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

/// 1,000 dated documents over four categories of 250.
fn corpus() -> Vec<Document> {
    let categories = ["reviews", "news", "guides", "opinion"];
    (0..1000)
        .map(|i| {
            let category = categories[i % categories.len()];
            let published = Utc
                .timestamp_opt(1_500_000_000 + i as i64 * 43_200, 0)
                .single();
            Document::new(
                format!("doc-{:04}", i),
                format!("{} piece {}", category, i),
                format!("{} ", category).repeat(60) + &format!("unique{}", i),
                published,
                vec![category.to_string()],
            )
        })
        .collect()
}

fn options(mode: ExecutionMode, resume: bool) -> AnalysisOptions {
    AnalysisOptions {
        sample: SampleParams {
            fraction: 0.18,
            seed: 42,
        },
        chunking: ChunkLimits::default(),
        mode,
        resume,
        analysis: GenerationParams {
            model: "analysis-model".into(),
            max_tokens: 4096,
            temperature: 0.3,
        },
        synthesis: SynthesisParams::for_model("synthesis-model"),
    }
}

fn counter() -> &'static (dyn Fn(&str) -> usize + Send + Sync) {
    &estimate_tokens
}

async fn analyze(
    store: &InMemoryStore,
    service: &ScriptedService,
    batch: Option<&FlakyBatch>,
    opts: &AnalysisOptions,
    sink: &MemorySink,
) -> anyhow::Result<restyle_core::pipeline::AnalysisReport> {
    let mut orchestrator = BatchOrchestrator::new(service, sink, OrchestratorSettings::default());
    if let Some(batch) = batch {
        orchestrator = orchestrator.with_batch_service(batch);
    }
    let synthesizer = Synthesizer::new(service, RetryPolicy::default(), sink);
    run_style_analysis(store, &orchestrator, &synthesizer, opts, counter(), sink).await
}

fn is_incomplete(err: &anyhow::Error) -> Option<(usize, usize)> {
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::IncompleteAnalysis { failed, total }) => Some((*failed, *total)),
        _ => None,
    }
}

// ─── Style pipeline ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn thousand_documents_give_fifteen_chunks_and_a_profile() {
    let store = InMemoryStore::with_documents(corpus());
    let service = ScriptedService::healthy();
    let sink = MemorySink::new();

    let report = analyze(&store, &service, None, &options(ExecutionMode::Sequential, false), &sink)
        .await
        .unwrap();

    assert_eq!(report.corpus_size, 1000);
    assert_eq!(report.sample_size, 180);
    assert_eq!(report.chunk_count, 15);
    assert_eq!(report.analyzed, 15);
    assert_eq!(report.reused, 0);
    assert_eq!(report.mode, Some(ExecutionMode::Sequential));
    assert_eq!(service.chunk_calls(), 15);
    assert_eq!(service.synthesis_calls(), 2);

    assert_eq!(report.profile.version, 1);
    assert_eq!(report.profile.chunk_count, 15);
    assert_eq!(report.profile.structured["tone"], "dry");
    assert_eq!(report.usage.input_tokens, 17 * 1000);

    let saved = store.get_chunk_analyses().await.unwrap();
    assert_eq!(saved.len(), 15);
    let covered: HashSet<String> = saved.iter().flat_map(|a| a.document_ids.clone()).collect();
    assert_eq!(covered.len(), 180);

    let latest = store.get_latest_style_profile().await.unwrap().unwrap();
    assert_eq!(latest, report.profile);
}

#[tokio::test(start_paused = true)]
async fn resume_after_crash_makes_no_redundant_calls() {
    let store = InMemoryStore::with_documents(corpus());
    let sink = MemorySink::new();

    // First run: the service dies after seven chunk analyses.
    let crashing = ScriptedService::failing_after(7);
    let err = analyze(&store, &crashing, None, &options(ExecutionMode::Sequential, false), &sink)
        .await
        .unwrap_err();
    assert_eq!(is_incomplete(&err), Some((8, 15)));
    assert_eq!(crashing.synthesis_calls(), 0);
    assert_eq!(store.get_chunk_analyses().await.unwrap().len(), 7);
    assert!(store.get_latest_style_profile().await.unwrap().is_none());

    // Resume: only the eight missing chunks are analyzed.
    let healthy = ScriptedService::healthy();
    let report = analyze(&store, &healthy, None, &options(ExecutionMode::Sequential, true), &sink)
        .await
        .unwrap();
    assert_eq!(healthy.chunk_calls(), 8);
    assert_eq!(report.reused, 7);
    assert_eq!(report.analyzed, 8);
    assert_eq!(store.get_chunk_analyses().await.unwrap().len(), 15);

    // Resume again: every analysis is reused; only the two reduce calls run.
    let again = ScriptedService::healthy();
    let report = analyze(&store, &again, None, &options(ExecutionMode::Sequential, true), &sink)
        .await
        .unwrap();
    assert_eq!(again.chunk_calls(), 0);
    assert_eq!(again.synthesis_calls(), 2);
    assert_eq!(report.reused, 15);
    assert_eq!(report.mode, None);
    assert_eq!(report.profile.version, 2);

    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, PipelineEvent::Resumed { reused: 15, stale: 0 })));
}

#[tokio::test(start_paused = true)]
async fn fresh_run_discards_saved_analyses() {
    let store = InMemoryStore::with_documents(corpus());
    let sink = MemorySink::new();

    let first = ScriptedService::healthy();
    analyze(&store, &first, None, &options(ExecutionMode::Sequential, false), &sink)
        .await
        .unwrap();

    let second = ScriptedService::healthy();
    analyze(&store, &second, None, &options(ExecutionMode::Sequential, false), &sink)
        .await
        .unwrap();
    assert_eq!(second.chunk_calls(), 15);
}

#[tokio::test(start_paused = true)]
async fn batch_failures_are_isolated_and_resumable() {
    let store = InMemoryStore::with_documents(corpus());
    let sink = MemorySink::new();
    let service = ScriptedService::healthy();
    let batch = FlakyBatch {
        failing: vec!["chunk_3".into(), "chunk_11".into()],
        submitted: Mutex::new(Vec::new()),
    };

    let err = analyze(&store, &service, Some(&batch), &options(ExecutionMode::Batch, false), &sink)
        .await
        .unwrap_err();
    assert_eq!(is_incomplete(&err), Some((2, 15)));
    assert_eq!(service.chunk_calls(), 0);

    let saved: Vec<usize> = store
        .get_chunk_analyses()
        .await
        .unwrap()
        .iter()
        .map(|a| a.chunk_id)
        .collect();
    assert_eq!(saved.len(), 13);
    assert!(!saved.contains(&3) && !saved.contains(&11));

    let report = analyze(&store, &service, None, &options(ExecutionMode::Sequential, true), &sink)
        .await
        .unwrap();
    assert_eq!(service.chunk_calls(), 2);
    assert_eq!(report.reused, 13);
    assert_eq!(report.profile.chunk_count, 15);
}

#[tokio::test]
async fn empty_corpus_is_reported() {
    let store = InMemoryStore::new();
    let service = ScriptedService::healthy();
    let sink = MemorySink::new();
    let err = analyze(&store, &service, None, &options(ExecutionMode::Sequential, false), &sink)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::EmptyCorpus)
    ));
}

// ─── Example pipeline ───────────────────────────────────────────────

#[tokio::test]
async fn examples_are_stored_and_retrievable() {
    let store = InMemoryStore::with_documents(corpus());
    let sink = MemorySink::new();
    let mut opts = ExampleOptions::default();
    opts.clustering.n_clusters = 4;
    let dir = tempfile::tempdir().unwrap();
    let model_path = dir.path().join("vector_model.cbor");

    let (model, examples) = build_examples(&store, &opts, &model_path, &sink)
        .await
        .unwrap();
    assert_eq!(model.len(), 1000);
    assert_eq!(VectorSpaceModel::load(&model_path).unwrap(), model);
    assert!(!examples.is_empty() && examples.len() <= 4);
    assert_eq!(
        store.get_example_document_ids().await.unwrap(),
        examples.iter().map(|e| e.document_id.clone()).collect::<Vec<_>>()
    );

    let top = &examples[0].document_id;
    let text = store.get_document(top).await.unwrap().unwrap().vector_text();
    let found = find_similar_examples(&store, &model, &text, 1).await.unwrap();
    assert_eq!(&found[0].id, top);
}

#[tokio::test]
async fn examples_are_kept_when_the_model_cannot_be_saved() {
    let store = InMemoryStore::with_documents(corpus());
    let previous = vec![Example {
        document_id: store.get_all_documents().await.unwrap()[0].id.clone(),
        cluster_id: 0,
        distance_to_centroid: 0.0,
    }];
    store.save_examples(&previous).await.unwrap();

    // The model path's parent is a regular file, so the save fails.
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, "x").unwrap();
    let mut opts = ExampleOptions::default();
    opts.clustering.n_clusters = 4;

    let model_path = blocker.join("vector_model.cbor");
    let result = build_examples(&store, &opts, &model_path, &MemorySink::new()).await;
    assert!(result.is_err());
    assert_eq!(store.get_examples().await.unwrap(), previous);
}
