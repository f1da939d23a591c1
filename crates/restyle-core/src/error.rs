//! Error taxonomy for the analysis and retrieval pipelines.
//!
//! Functions in this crate return `anyhow::Result`; the typed errors below
//! travel inside it so callers can tell the cases apart with
//! `err.downcast_ref::<PipelineError>()`.

use std::time::Duration;
use thiserror::Error;

/// An error reported by the generation service.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    /// HTTP 429. `retry_after` carries the provider's hint, if any.
    #[error("rate limited by generation service")]
    RateLimited { retry_after: Option<Duration> },

    /// 5xx-class response, including 529 "overloaded".
    #[error("generation service error {status}: {message}")]
    Server { status: u16, message: String },

    /// Connection failure or timeout before a response arrived.
    #[error("transport error: {0}")]
    Transport(String),

    /// Any other failure. Never retried.
    #[error("generation service rejected request ({status:?}): {message}")]
    Permanent {
        status: Option<u16>,
        message: String,
    },
}

impl ServiceError {
    /// Whether the retry policy may try again after this error.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ServiceError::Permanent { .. })
    }

    /// The provider's retry-after hint, for rate-limit responses.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ServiceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Pipeline-level failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("corpus is empty: import documents first")]
    EmptyCorpus,

    #[error("{what} not found: run `restyle analyze` first")]
    MissingArtifact { what: String },

    #[error("generation call failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ServiceError },

    #[error(transparent)]
    Service(ServiceError),

    #[error("batch {job_id} did not finish within {waited:?}")]
    BatchTimeout { job_id: String, waited: Duration },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{failed} of {total} chunk analyses failed; rerun with --resume to complete them")]
    IncompleteAnalysis { failed: usize, total: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl PipelineError {
    pub fn missing(what: impl Into<String>) -> Self {
        PipelineError::MissingArtifact { what: what.into() }
    }
}

/// Structured-record extraction failed. Recovered by the synthesizer into a
/// raw record flagged with `parse_error`.
#[derive(Debug, Error)]
#[error("could not extract a JSON object from synthesis output: {reason}")]
pub struct SynthesisParseError {
    pub reason: String,
}
