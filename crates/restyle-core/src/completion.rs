//! Generation-service abstraction.
//!
//! The pipeline talks to the text-generation service through two narrow
//! traits: [`CompletionService`] for single calls and [`BatchService`] for
//! provider-managed batch jobs. One concrete adapter usually implements
//! both and is injected wherever calls are made.
//!
//! Every call returns its own [`Usage`]; callers add usage up themselves
//! instead of sharing a mutable counter.

use std::ops::AddAssign;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Model selection and sampling settings for a call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// A single completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System instructions.
    pub instructions: String,
    pub conversation: Vec<Message>,
    pub params: GenerationParams,
    /// Ask the provider to cache the instructions between calls.
    pub cache_instructions: bool,
}

/// Token usage reported for one or more calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl Usage {
    pub fn is_empty(&self) -> bool {
        *self == Usage::default()
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.cache_read_tokens += rhs.cache_read_tokens;
        self.cache_creation_tokens += rhs.cache_creation_tokens;
    }
}

/// Text returned by a successful call.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

/// A labeled analysis request, as submitted to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub id: String,
    pub instructions: String,
    pub conversation: Vec<Message>,
}

/// Processing state of a batch job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStatus {
    InProgress,
    Canceling,
    Ended,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Ended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Canceling => "canceling",
            BatchStatus::Ended => "ended",
        }
    }
}

/// Outcome of one request inside a finished batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchItemOutcome {
    Succeeded { text: String, usage: Usage },
    Failed { reason: String },
}

/// One line of a batch result set.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItemResult {
    pub request_id: String,
    pub outcome: BatchItemOutcome,
}

/// Single-call access to the generation service.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ServiceError>;
}

/// Asynchronous batch access to the generation service.
#[async_trait]
pub trait BatchService: Send + Sync {
    /// Submit all requests as one job and return its id.
    async fn submit_batch(
        &self,
        requests: &[AnalysisRequest],
        params: &GenerationParams,
    ) -> Result<String, ServiceError>;

    async fn poll_batch(&self, job_id: &str) -> Result<BatchStatus, ServiceError>;

    /// Per-request outcomes of an ended job.
    async fn fetch_batch_results(&self, job_id: &str) -> Result<Vec<BatchItemResult>, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        assert!(total.is_empty());
        total += Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_tokens: 1,
            cache_creation_tokens: 0,
        };
        total += Usage {
            input_tokens: 3,
            output_tokens: 2,
            cache_read_tokens: 0,
            cache_creation_tokens: 7,
        };
        assert_eq!(total.input_tokens, 13);
        assert_eq!(total.output_tokens, 7);
        assert_eq!(total.cache_read_tokens, 1);
        assert_eq!(total.cache_creation_tokens, 7);
    }

    #[test]
    fn only_ended_is_terminal() {
        assert!(BatchStatus::Ended.is_terminal());
        assert!(!BatchStatus::InProgress.is_terminal());
        assert!(!BatchStatus::Canceling.is_terminal());
    }
}
