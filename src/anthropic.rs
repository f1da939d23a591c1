//! HTTP adapter for the Anthropic Messages and Message Batches APIs.
//!
//! [`AnthropicClient`] implements both [`CompletionService`] and
//! [`BatchService`]. It makes exactly one HTTP request per call; retries
//! belong to the caller's retry policy, so this module only classifies
//! failures:
//!
//! | Response | Error |
//! |----------|-------|
//! | HTTP 429 | [`ServiceError::RateLimited`] with the `retry-after` seconds |
//! | HTTP 5xx, 529 | [`ServiceError::Server`] |
//! | connect error, timeout | [`ServiceError::Transport`] |
//! | anything else | [`ServiceError::Permanent`] |

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use restyle_core::completion::{
    AnalysisRequest, BatchItemOutcome, BatchItemResult, BatchService, BatchStatus, Completion,
    CompletionRequest, CompletionService, GenerationParams, Message, Usage,
};
use restyle_core::error::ServiceError;

use crate::config::GenerationConfig;

const API_VERSION: &str = "2023-06-01";

/// Client for the Anthropic HTTP API.
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AnthropicClient {
    pub fn new(base_url: &str, api_key: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Build a client from config, reading the key from `api_key_env`.
    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .with_context(|| format!("{} not set", config.api_key_env))?;
        Self::new(
            &config.base_url,
            api_key,
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
    }

    /// Send a request and return the body of a successful response.
    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<String, ServiceError> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.map_err(transport_error)?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_status(status.as_u16(), retry_after, &body))
        }
    }
}

fn transport_error(err: reqwest::Error) -> ServiceError {
    ServiceError::Transport(err.to_string())
}

/// Seconds from a `retry-after` header, if present and numeric.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

/// Map a non-success HTTP status to a [`ServiceError`].
pub fn classify_status(status: u16, retry_after: Option<Duration>, body: &str) -> ServiceError {
    let message = error_message(body);
    match status {
        429 => ServiceError::RateLimited { retry_after },
        500..=599 => ServiceError::Server { status, message },
        _ => ServiceError::Permanent {
            status: Some(status),
            message,
        },
    }
}

/// The `error.message` of an API error body, or the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

fn decode<T: for<'de> Deserialize<'de>>(body: &str, what: &str) -> Result<T, ServiceError> {
    serde_json::from_str(body).map_err(|err| ServiceError::Permanent {
        status: None,
        message: format!("invalid {} response: {}", what, err),
    })
}

fn message_params(
    instructions: &str,
    conversation: &[Message],
    params: &GenerationParams,
    cache_instructions: bool,
) -> Value {
    let mut body = json!({
        "model": params.model,
        "max_tokens": params.max_tokens,
        "temperature": params.temperature,
        "messages": conversation,
    });
    if !instructions.is_empty() {
        body["system"] = if cache_instructions {
            json!([{
                "type": "text",
                "text": instructions,
                "cache_control": { "type": "ephemeral" },
            }])
        } else {
            json!(instructions)
        };
    }
    body
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
            cache_read_tokens: u.cache_read_input_tokens.unwrap_or(0),
            cache_creation_tokens: u.cache_creation_input_tokens.unwrap_or(0),
        }
    }
}

impl From<MessageResponse> for Completion {
    fn from(response: MessageResponse) -> Self {
        let text = response
            .content
            .into_iter()
            .find(|block| block.kind == "text")
            .map(|block| block.text)
            .unwrap_or_default();
        Completion {
            text,
            usage: response.usage.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    id: String,
    processing_status: String,
}

#[derive(Debug, Deserialize)]
struct BatchResultLine {
    custom_id: String,
    result: BatchResultBody,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum BatchResultBody {
    Succeeded { message: MessageResponse },
    Errored { error: Value },
    Canceled,
    Expired,
}

fn parse_batch_status(status: &str) -> Result<BatchStatus, ServiceError> {
    match status {
        "in_progress" => Ok(BatchStatus::InProgress),
        "canceling" => Ok(BatchStatus::Canceling),
        "ended" => Ok(BatchStatus::Ended),
        other => Err(ServiceError::Permanent {
            status: None,
            message: format!("unknown batch status '{}'", other),
        }),
    }
}

/// Parse a JSONL batch result set. Malformed lines are skipped; the
/// orchestrator reports their ids as missing.
fn parse_batch_results(body: &str) -> Vec<BatchItemResult> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<BatchResultLine>(line) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed batch result line");
                None
            }
        })
        .map(|line| {
            let outcome = match line.result {
                BatchResultBody::Succeeded { message } => {
                    let completion = Completion::from(message);
                    BatchItemOutcome::Succeeded {
                        text: completion.text,
                        usage: completion.usage,
                    }
                }
                BatchResultBody::Errored { error } => BatchItemOutcome::Failed {
                    reason: error_message(&error.to_string()),
                },
                BatchResultBody::Canceled => BatchItemOutcome::Failed {
                    reason: "canceled".into(),
                },
                BatchResultBody::Expired => BatchItemOutcome::Failed {
                    reason: "expired".into(),
                },
            };
            BatchItemResult {
                request_id: line.custom_id,
                outcome,
            }
        })
        .collect()
}

#[async_trait]
impl CompletionService for AnthropicClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ServiceError> {
        let body = message_params(
            &request.instructions,
            &request.conversation,
            &request.params,
            request.cache_instructions,
        );
        let text = self
            .send(self.request(reqwest::Method::POST, "/v1/messages").json(&body))
            .await?;
        let response: MessageResponse = decode(&text, "message")?;
        Ok(response.into())
    }
}

#[async_trait]
impl BatchService for AnthropicClient {
    async fn submit_batch(
        &self,
        requests: &[AnalysisRequest],
        params: &GenerationParams,
    ) -> Result<String, ServiceError> {
        let items: Vec<Value> = requests
            .iter()
            .map(|r| {
                json!({
                    "custom_id": r.id,
                    "params": message_params(&r.instructions, &r.conversation, params, false),
                })
            })
            .collect();
        let text = self
            .send(
                self.request(reqwest::Method::POST, "/v1/messages/batches")
                    .json(&json!({ "requests": items })),
            )
            .await?;
        let batch: BatchResponse = decode(&text, "batch")?;
        Ok(batch.id)
    }

    async fn poll_batch(&self, job_id: &str) -> Result<BatchStatus, ServiceError> {
        let path = format!("/v1/messages/batches/{}", job_id);
        let text = self.send(self.request(reqwest::Method::GET, &path)).await?;
        let batch: BatchResponse = decode(&text, "batch")?;
        parse_batch_status(&batch.processing_status)
    }

    async fn fetch_batch_results(&self, job_id: &str) -> Result<Vec<BatchItemResult>, ServiceError> {
        let path = format!("/v1/messages/batches/{}/results", job_id);
        let text = self.send(self.request(reqwest::Method::GET, &path)).await?;
        Ok(parse_batch_results(&text))
    }
}
