//! Batch orchestration of labeled analysis requests.
//!
//! Runs a set of [`AnalysisRequest`]s through the generation service and
//! returns one result per request id.
//!
//! # Execution paths
//!
//! **Batch** (preferred, when a [`BatchService`] is configured):
//!
//! 1. Submit every request as one job.
//! 2. Poll at a fixed interval until the job ends, the optional deadline
//!    passes ([`PipelineError::BatchTimeout`]) or the run is cancelled.
//! 3. Collect per-request outcomes. Failed requests and ids missing from the
//!    result set get an empty entry and a `RequestFailed` event.
//!
//! Any failure while submitting, polling or timing out falls back to the
//! sequential path. Cancellation never falls back.
//!
//! **Sequential**: one retried call per request, in submission order. A
//! request that still fails after retries gets an empty entry; the remaining
//! requests keep running. A short pacing delay follows every successful call
//! except the last.
//!
//! Every result is handed to a [`ResultObserver`] as soon as it is known, so
//! callers can persist progress before the whole run completes.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;

use crate::cancel::CancellationToken;
use crate::completion::{
    AnalysisRequest, BatchItemOutcome, BatchService, CompletionRequest, CompletionService,
    GenerationParams, Usage,
};
use crate::error::PipelineError;
use crate::events::{EventSink, PipelineEvent};
use crate::retry::{complete_with_retry, RetryPolicy};

/// Requested execution path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Batch,
    Sequential,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Batch => "batch",
            ExecutionMode::Sequential => "sequential",
        }
    }
}

/// Polling cadence for batch jobs.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    /// Give up on the job after this long. `None` waits indefinitely.
    pub deadline: Option<Duration>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            deadline: None,
        }
    }
}

/// Orchestrator tuning.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub retry: RetryPolicy,
    pub poll: PollSettings,
    /// Pause after each successful sequential call.
    pub pacing: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll: PollSettings::default(),
            pacing: Duration::from_secs(1),
        }
    }
}

/// Outcome of one request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestResult {
    Succeeded(String),
    Failed(String),
}

impl RequestResult {
    /// Result text; empty for a failed request.
    pub fn text(&self) -> &str {
        match self {
            RequestResult::Succeeded(text) => text,
            RequestResult::Failed(_) => "",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RequestResult::Succeeded(_))
    }
}

/// Results of a full orchestration run.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// One entry per submitted request id.
    pub results: BTreeMap<String, RequestResult>,
    pub usage: Usage,
    /// The path that actually produced the results.
    pub mode: ExecutionMode,
}

impl BatchOutcome {
    fn empty(mode: ExecutionMode) -> Self {
        Self {
            results: BTreeMap::new(),
            usage: Usage::default(),
            mode,
        }
    }

    /// Result text for `id`; empty if the request failed or is unknown.
    pub fn text(&self, id: &str) -> &str {
        self.results.get(id).map(RequestResult::text).unwrap_or("")
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| !r.is_success())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn failed_count(&self) -> usize {
        self.results.values().filter(|r| !r.is_success()).count()
    }
}

/// Notified once per request as soon as its result is known.
#[async_trait]
pub trait ResultObserver: Send + Sync {
    async fn on_result(&self, request_id: &str, result: &RequestResult) -> Result<()>;
}

/// Observer that ignores every result.
pub struct NoObserver;

#[async_trait]
impl ResultObserver for NoObserver {
    async fn on_result(&self, _request_id: &str, _result: &RequestResult) -> Result<()> {
        Ok(())
    }
}

/// Runs request sets through the batch or sequential path.
pub struct BatchOrchestrator<'a> {
    completer: &'a dyn CompletionService,
    batcher: Option<&'a dyn BatchService>,
    settings: OrchestratorSettings,
    events: &'a dyn EventSink,
    cancel: CancellationToken,
}

impl<'a> BatchOrchestrator<'a> {
    pub fn new(
        completer: &'a dyn CompletionService,
        events: &'a dyn EventSink,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            completer,
            batcher: None,
            settings,
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_batch_service(mut self, batcher: &'a dyn BatchService) -> Self {
        self.batcher = Some(batcher);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `requests` and return one result per id.
    ///
    /// `mode` is a preference: [`ExecutionMode::Batch`] without a batch
    /// service, or after a batch-path failure, runs sequentially.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::InvalidRequest`] for empty or duplicate ids.
    /// - [`PipelineError::Cancelled`] if the run is cancelled.
    /// - Any error returned by `observer`.
    pub async fn run(
        &self,
        requests: &[AnalysisRequest],
        params: &GenerationParams,
        mode: ExecutionMode,
        observer: &dyn ResultObserver,
    ) -> Result<BatchOutcome> {
        validate_ids(requests)?;
        if requests.is_empty() {
            return Ok(BatchOutcome::empty(mode));
        }

        if let (ExecutionMode::Batch, Some(batcher)) = (mode, self.batcher) {
            match self.run_batch(batcher, requests, params, observer).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if !is_fallback_eligible(&err) => return Err(err),
                Err(err) => {
                    tracing::warn!(error = %err, "batch path failed, falling back to sequential calls");
                    self.events.emit(PipelineEvent::BatchFallback {
                        reason: err.to_string(),
                    });
                }
            }
        }

        self.run_sequential(requests, params, observer).await
    }

    async fn run_batch(
        &self,
        batcher: &dyn BatchService,
        requests: &[AnalysisRequest],
        params: &GenerationParams,
        observer: &dyn ResultObserver,
    ) -> Result<BatchOutcome> {
        let job_id = batcher
            .submit_batch(requests, params)
            .await
            .map_err(PipelineError::Service)?;
        tracing::info!(job_id = %job_id, requests = requests.len(), "batch submitted");
        self.events.emit(PipelineEvent::BatchSubmitted {
            job_id: job_id.clone(),
            requests: requests.len(),
        });

        let poll = self.settings.poll;
        let started = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled.into());
            }

            let status = batcher
                .poll_batch(&job_id)
                .await
                .map_err(PipelineError::Service)?;
            let elapsed = started.elapsed();
            tracing::debug!(job_id = %job_id, status = status.as_str(), ?elapsed, "batch polled");
            self.events.emit(PipelineEvent::BatchPolled {
                job_id: job_id.clone(),
                status: status.as_str().to_string(),
                elapsed,
            });

            if status.is_terminal() {
                break;
            }
            if let Some(deadline) = poll.deadline {
                if elapsed >= deadline {
                    return Err(PipelineError::BatchTimeout {
                        job_id,
                        waited: elapsed,
                    }
                    .into());
                }
            }
            self.cancel.sleep(poll.interval).await?;
        }

        let items = batcher
            .fetch_batch_results(&job_id)
            .await
            .map_err(PipelineError::Service)?;

        let known: HashSet<&str> = requests.iter().map(|r| r.id.as_str()).collect();
        let mut outcome = BatchOutcome::empty(ExecutionMode::Batch);

        for item in items {
            if !known.contains(item.request_id.as_str()) {
                tracing::warn!(request_id = %item.request_id, "ignoring unknown id in batch results");
                continue;
            }
            let result = match item.outcome {
                BatchItemOutcome::Succeeded { text, usage } => {
                    outcome.usage += usage;
                    RequestResult::Succeeded(text)
                }
                BatchItemOutcome::Failed { reason } => {
                    self.report_failure(&item.request_id, &reason);
                    RequestResult::Failed(reason)
                }
            };
            observer.on_result(&item.request_id, &result).await?;
            outcome.results.insert(item.request_id, result);
        }

        for request in requests {
            if !outcome.results.contains_key(&request.id) {
                let reason = "missing from batch results".to_string();
                self.report_failure(&request.id, &reason);
                let result = RequestResult::Failed(reason);
                observer.on_result(&request.id, &result).await?;
                outcome.results.insert(request.id.clone(), result);
            }
        }

        tracing::info!(
            job_id = %job_id,
            succeeded = outcome.results.len() - outcome.failed_count(),
            failed = outcome.failed_count(),
            "batch complete"
        );
        Ok(outcome)
    }

    async fn run_sequential(
        &self,
        requests: &[AnalysisRequest],
        params: &GenerationParams,
        observer: &dyn ResultObserver,
    ) -> Result<BatchOutcome> {
        let total = requests.len();
        let mut outcome = BatchOutcome::empty(ExecutionMode::Sequential);

        for (i, request) in requests.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled.into());
            }

            let call = CompletionRequest {
                instructions: request.instructions.clone(),
                conversation: request.conversation.clone(),
                params: params.clone(),
                cache_instructions: false,
            };
            let result = match complete_with_retry(
                self.completer,
                &call,
                &self.settings.retry,
                self.events,
                &self.cancel,
            )
            .await
            {
                Ok(completion) => {
                    outcome.usage += completion.usage;
                    RequestResult::Succeeded(completion.text)
                }
                Err(err) if is_cancellation(&err) => return Err(err),
                Err(err) => {
                    let reason = err.to_string();
                    self.report_failure(&request.id, &reason);
                    RequestResult::Failed(reason)
                }
            };

            observer.on_result(&request.id, &result).await?;
            self.events.emit(PipelineEvent::RequestCompleted {
                request_id: request.id.clone(),
                n: i + 1,
                total,
            });

            let succeeded = result.is_success();
            outcome.results.insert(request.id.clone(), result);
            if succeeded && i + 1 < total {
                self.cancel.sleep(self.settings.pacing).await?;
            }
        }

        Ok(outcome)
    }

    fn report_failure(&self, request_id: &str, reason: &str) {
        tracing::warn!(request_id, reason, "request failed");
        self.events.emit(PipelineEvent::RequestFailed {
            request_id: request_id.to_string(),
            reason: reason.to_string(),
        });
    }
}

fn validate_ids(requests: &[AnalysisRequest]) -> Result<()> {
    let mut seen = HashSet::new();
    for request in requests {
        if request.id.is_empty() {
            return Err(PipelineError::InvalidRequest("request id must not be empty".into()).into());
        }
        if !seen.insert(request.id.as_str()) {
            return Err(
                PipelineError::InvalidRequest(format!("duplicate request id {}", request.id)).into(),
            );
        }
    }
    Ok(())
}

fn is_cancellation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::Cancelled)
    )
}

/// Batch-path errors that allow a sequential retry of the whole set.
fn is_fallback_eligible(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::Service(_)) | Some(PipelineError::BatchTimeout { .. })
    )
}
