//! Per-call retry policy for the generation service.
//!
//! Every direct call goes through [`retry_call`]:
//! - rate limits, 5xx/overloaded responses and transport errors are retried
//!   with exponential backoff `min(base × 2^attempt, max)`;
//! - a rate-limit `retry-after` hint longer than the computed delay wins;
//! - any other error propagates immediately;
//! - running out of attempts is [`PipelineError::RetriesExhausted`].

use std::future::Future;
use std::time::Duration;

use anyhow::Result;

use crate::cancel::CancellationToken;
use crate::completion::{Completion, CompletionRequest, CompletionService};
use crate::error::{PipelineError, ServiceError};
use crate::events::{EventSink, PipelineEvent};

/// Backoff settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total number of calls, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay after the zero-based `attempt` failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before retrying after `err`, honoring a longer retry-after hint.
    pub fn delay_for(&self, attempt: u32, err: &ServiceError) -> Duration {
        let computed = self.backoff(attempt);
        match err.retry_after() {
            Some(hint) if hint > computed => hint,
            _ => computed,
        }
    }
}

/// Run `op` under `policy`.
///
/// # Errors
///
/// - [`PipelineError::Service`] for a non-retryable error.
/// - [`PipelineError::RetriesExhausted`] after `max_attempts` transient failures.
/// - [`PipelineError::Cancelled`] if `cancel` fires, including during a backoff wait.
pub async fn retry_call<T, F, Fut>(
    policy: &RetryPolicy,
    events: &dyn EventSink,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_err = None;

    for attempt in 0..max_attempts {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled.into());
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                if attempt + 1 < max_attempts {
                    let delay = policy.delay_for(attempt, &err);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        delay_secs = delay.as_secs_f64(),
                        error = %err,
                        "transient generation error, backing off"
                    );
                    events.emit(PipelineEvent::Retrying {
                        attempt: attempt + 1,
                        max_attempts,
                        delay,
                        reason: err.to_string(),
                    });
                    cancel.sleep(delay).await?;
                }
                last_err = Some(err);
            }
            Err(err) => return Err(PipelineError::Service(err).into()),
        }
    }

    let last = last_err.unwrap_or_else(|| ServiceError::Transport("no attempt was made".into()));
    Err(PipelineError::RetriesExhausted {
        attempts: max_attempts,
        last,
    }
    .into())
}

/// One completion call under the retry policy.
pub async fn complete_with_retry(
    service: &dyn CompletionService,
    request: &CompletionRequest,
    policy: &RetryPolicy,
    events: &dyn EventSink,
    cancel: &CancellationToken,
) -> Result<Completion> {
    retry_call(policy, events, cancel, || service.complete(request)).await
}
