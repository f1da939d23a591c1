//! Hierarchical style synthesis.
//!
//! The map phase asks for one stylistic analysis per chunk (see
//! [`build_chunk_requests`]; execution belongs to the orchestrator). The
//! reduce phase makes two calls:
//!
//! 1. **Describe**: all non-empty chunk analyses, labeled by chunk number,
//!    are merged into one free-form markdown style description.
//! 2. **Structure**: the description is converted into a JSON object.
//!
//! The structured record is never absent. Output that cannot be parsed is
//! kept as `{"raw": <text>, "parse_error": true}`; see [`extract_structured`].

use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::cancel::CancellationToken;
use crate::completion::{
    AnalysisRequest, Completion, CompletionRequest, CompletionService, GenerationParams, Message,
    Usage,
};
use crate::error::{PipelineError, SynthesisParseError};
use crate::events::{EventSink, PipelineEvent, SynthesisStage};
use crate::models::{Chunk, ChunkAnalysis, Document, StyleProfile};
use crate::retry::{complete_with_retry, RetryPolicy};

/// Instructions for the per-chunk analysis calls.
pub const CHUNK_ANALYSIS_INSTRUCTIONS: &str = "\
You are a literary editor studying the house style of a publication. \
You will receive a set of its articles. Describe the writing style they share, \
not their subject matter.

Cover, with short quotations as evidence:
- tone and narrative voice (person, formality, humor, attitude to the reader)
- vocabulary: characteristic words, slang, jargon, recurring phrases
- sentence length and rhythm, paragraph length
- structure: how articles open, transition between parts and close
- formatting habits: headings, lists, emphasis, quotes
- anything distinctive that a skilled imitator would need to reproduce.";

/// Instructions for the describe call.
pub const SYNTHESIS_INSTRUCTIONS: &str = "\
You are a senior editor writing the definitive style guide of a publication. \
You will receive several independent analyses of samples of its articles. \
Merge them into one coherent guide: keep traits confirmed across samples, \
resolve contradictions, drop observations about topics rather than style, \
and keep the best example quotations.";

/// Instructions for the structure call.
pub const STRUCTURE_INSTRUCTIONS: &str =
    "You convert documents into structured data. Reply with valid JSON only.";

/// Generation settings for the two reduce calls.
#[derive(Debug, Clone)]
pub struct SynthesisParams {
    pub describe: GenerationParams,
    pub structure: GenerationParams,
}

impl SynthesisParams {
    /// Default token and temperature settings for `model`.
    pub fn for_model(model: &str) -> Self {
        Self {
            describe: GenerationParams {
                model: model.to_string(),
                max_tokens: 8192,
                temperature: 0.3,
            },
            structure: GenerationParams {
                model: model.to_string(),
                max_tokens: 4096,
                temperature: 0.1,
            },
        }
    }
}

/// Render the documents of one chunk for the analysis prompt.
pub fn format_chunk(documents: &[Document]) -> String {
    documents
        .iter()
        .map(|doc| {
            let mut header = format!("### \"{}\"", doc.title);
            if !doc.categories.is_empty() {
                header.push_str(&format!(" [{}]", doc.categories.join(", ")));
            }
            if let Some(published) = doc.published_at {
                header.push_str(&format!(" ({})", published.format("%Y-%m-%d")));
            }
            format!("{}\n\n{}", header, doc.body)
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

/// User prompt for one chunk analysis.
pub fn chunk_prompt(documents: &[Document]) -> String {
    format!(
        "Here are articles from the publication:\n\n{}\n\n---\n\n\
         Analyze the writing style of these articles.",
        format_chunk(documents)
    )
}

/// One analysis request per chunk, labeled with the chunk's request id.
pub fn build_chunk_requests<'c>(chunks: impl IntoIterator<Item = &'c Chunk>) -> Vec<AnalysisRequest> {
    chunks
        .into_iter()
        .map(|chunk| AnalysisRequest {
            id: chunk.request_id(),
            instructions: CHUNK_ANALYSIS_INSTRUCTIONS.to_string(),
            conversation: vec![Message::user(chunk_prompt(&chunk.documents))],
        })
        .collect()
}

/// Concatenate non-empty analyses, labeled by one-based chunk number.
pub fn merge_analyses(analyses: &[ChunkAnalysis]) -> String {
    analyses
        .iter()
        .filter(|a| !a.analysis_text.trim().is_empty())
        .map(|a| format!("### Chunk analysis {}\n\n{}", a.chunk_id + 1, a.analysis_text))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

fn describe_prompt(chunk_count: usize, merged: &str) -> String {
    format!(
        "Below are {} analyses of article samples from the same publication.\n\n{}\n\n---\n\n\
         Write the unified style guide in markdown. Use sections for tone and voice, \
         vocabulary, sentence structure, article structure, formatting, and \
         characteristic devices, each with example quotations.",
        chunk_count, merged
    )
}

fn structure_prompt(description: &str) -> String {
    format!(
        "Convert this style guide into a JSON object with the keys \
         \"tone\", \"voice\", \"vocabulary\", \"sentence_structure\", \
         \"article_structure\", \"formatting\", \"devices\" and \"examples\". \
         Values may be strings, lists of strings or nested objects.\n\n{}",
        description
    )
}

/// Strip a leading and a trailing markdown code fence.
fn strip_code_fence(text: &str) -> &str {
    let mut text = text.trim();
    if text.starts_with("```") {
        text = match text.find('\n') {
            Some(newline) => &text[newline + 1..],
            None => "",
        };
    }
    let trimmed = text.trim_end();
    if let Some(body) = trimmed.strip_suffix("```") {
        text = body;
    }
    text.trim()
}

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Parse the structure call's output as a JSON object.
///
/// Tries the fence-stripped text directly, then the substring between the
/// first `{` and the last `}`.
pub fn parse_structured(text: &str) -> Result<Value, SynthesisParseError> {
    let text = strip_code_fence(text);
    if let Some(map) = parse_object(text) {
        return Ok(Value::Object(map));
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => parse_object(&text[start..=end])
            .map(Value::Object)
            .ok_or_else(|| SynthesisParseError {
                reason: "embedded braces do not enclose a valid JSON object".into(),
            }),
        _ => Err(SynthesisParseError {
            reason: "no JSON object found".into(),
        }),
    }
}

/// Like [`parse_structured`], but degrades to a raw record instead of failing.
pub fn extract_structured(text: &str) -> Value {
    parse_structured(text).unwrap_or_else(|_| {
        json!({
            "raw": strip_code_fence(text),
            "parse_error": true,
        })
    })
}

/// A synthesized profile and the usage of the two reduce calls.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub profile: StyleProfile,
    pub usage: Usage,
}

/// Runs the reduce phase.
pub struct Synthesizer<'a> {
    completer: &'a dyn CompletionService,
    retry: RetryPolicy,
    events: &'a dyn EventSink,
    cancel: CancellationToken,
}

impl<'a> Synthesizer<'a> {
    pub fn new(
        completer: &'a dyn CompletionService,
        retry: RetryPolicy,
        events: &'a dyn EventSink,
    ) -> Self {
        Self {
            completer,
            retry,
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Reduce `analyses` into a profile with the given `version`.
    ///
    /// Both calls run under the retry policy.
    ///
    /// # Errors
    ///
    /// [`PipelineError::InvalidRequest`] if every analysis is empty, or any
    /// error from the generation calls.
    pub async fn synthesize(
        &self,
        analyses: &[ChunkAnalysis],
        sample_size: usize,
        version: i64,
        params: &SynthesisParams,
    ) -> Result<Synthesis> {
        let merged = merge_analyses(analyses);
        if merged.is_empty() {
            return Err(
                PipelineError::InvalidRequest("no chunk analyses to synthesize".into()).into(),
            );
        }
        let mut usage = Usage::default();

        self.events.emit(PipelineEvent::Synthesizing {
            stage: SynthesisStage::Describe,
        });
        let description = self
            .call(
                SYNTHESIS_INSTRUCTIONS,
                describe_prompt(analyses.len(), &merged),
                &params.describe,
            )
            .await?;
        usage += description.usage;

        self.events.emit(PipelineEvent::Synthesizing {
            stage: SynthesisStage::Structure,
        });
        let structured = self
            .call(
                STRUCTURE_INSTRUCTIONS,
                structure_prompt(&description.text),
                &params.structure,
            )
            .await?;
        usage += structured.usage;

        let record = match parse_structured(&structured.text) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "keeping raw structured output");
                self.events.emit(PipelineEvent::StructuredParseFailed {
                    reason: err.reason.clone(),
                });
                extract_structured(&structured.text)
            }
        };

        Ok(Synthesis {
            profile: StyleProfile {
                version,
                text: description.text,
                structured: record,
                sample_size,
                chunk_count: analyses.len(),
                created_at: Utc::now(),
            },
            usage,
        })
    }

    async fn call(
        &self,
        instructions: &str,
        prompt: String,
        params: &GenerationParams,
    ) -> Result<Completion> {
        let request = CompletionRequest {
            instructions: instructions.to_string(),
            conversation: vec![Message::user(prompt)],
            params: params.clone(),
            cache_instructions: false,
        };
        complete_with_retry(self.completer, &request, &self.retry, self.events, &self.cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::events::MemorySink;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[test]
    fn fenced_json_parses() {
        assert_eq!(extract_structured("```json\n{\"a\":1}\n```"), json!({"a": 1}));
    }

    #[test]
    fn embedded_json_parses() {
        assert_eq!(extract_structured("blah {\"a\":1} blah"), json!({"a": 1}));
    }

    #[test]
    fn unparseable_output_is_flagged() {
        assert_eq!(
            extract_structured("no json here"),
            json!({"raw": "no json here", "parse_error": true})
        );
    }

    #[test]
    fn non_object_json_is_not_a_record() {
        assert!(parse_structured("[1, 2, 3]").is_err());
        assert_eq!(extract_structured("[1, 2, 3]")["parse_error"], json!(true));
    }

    #[test]
    fn broken_braces_are_flagged() {
        let value = extract_structured("prefix { not: json } suffix");
        assert_eq!(value["parse_error"], json!(true));
        assert_eq!(value["raw"], json!("prefix { not: json } suffix"));
    }

    fn analysis(chunk_id: usize, text: &str) -> ChunkAnalysis {
        ChunkAnalysis {
            chunk_id,
            document_ids: vec![format!("d{}", chunk_id)],
            analysis_text: text.into(),
            token_count: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn merge_labels_and_skips_empty() {
        let merged = merge_analyses(&[
            analysis(0, "short sentences"),
            analysis(1, ""),
            analysis(2, "ironic tone"),
        ]);
        assert!(merged.contains("### Chunk analysis 1\n\nshort sentences"));
        assert!(merged.contains("### Chunk analysis 3\n\nironic tone"));
        assert!(!merged.contains("Chunk analysis 2"));
    }

    #[test]
    fn chunk_format_includes_metadata() {
        let published = Utc.with_ymd_and_hms(2023, 5, 17, 12, 0, 0).single();
        let docs = vec![
            Document::new("1", "First", "Body one", published, vec!["news".into(), "games".into()]),
            Document::new("2", "Second", "Body two", None, vec![]),
        ];
        let text = format_chunk(&docs);
        assert!(text.starts_with("### \"First\" [news, games] (2023-05-17)\n\nBody one"));
        assert!(text.contains("\n\n---\n\n### \"Second\"\n\nBody two"));
    }

    /// Replies from a script, recording the instructions of every call.
    struct Scripted {
        replies: Mutex<Vec<Result<String, ServiceError>>>,
        seen: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, ServiceError>>) -> Self {
            let mut replies = replies;
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionService for Scripted {
        async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ServiceError> {
            self.seen.lock().unwrap().push(request.instructions.clone());
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(ServiceError::Transport("script exhausted".into())));
            reply.map(|text| Completion {
                text,
                usage: Usage {
                    input_tokens: 100,
                    output_tokens: 10,
                    ..Usage::default()
                },
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn two_reduce_calls_produce_profile() {
        let service = Scripted::new(vec![
            Ok("# Style guide\n\nShort, punchy sentences.".into()),
            Ok("```json\n{\"tone\": \"punchy\"}\n```".into()),
        ]);
        let sink = MemorySink::new();
        let synth = Synthesizer::new(&service, RetryPolicy::default(), &sink);

        let out = synth
            .synthesize(
                &[analysis(0, "a"), analysis(1, "b")],
                24,
                3,
                &SynthesisParams::for_model("m"),
            )
            .await
            .unwrap();

        assert_eq!(out.profile.version, 3);
        assert_eq!(out.profile.chunk_count, 2);
        assert_eq!(out.profile.sample_size, 24);
        assert!(out.profile.text.contains("punchy sentences"));
        assert_eq!(out.profile.structured, json!({"tone": "punchy"}));
        assert_eq!(out.usage.input_tokens, 200);

        let seen = service.seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                SYNTHESIS_INSTRUCTIONS.to_string(),
                STRUCTURE_INSTRUCTIONS.to_string()
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn structure_call_is_retried_and_parse_failure_recovered() {
        let service = Scripted::new(vec![
            Ok("description".into()),
            Err(ServiceError::Server {
                status: 529,
                message: "overloaded".into(),
            }),
            Ok("I could not produce JSON".into()),
        ]);
        let sink = MemorySink::new();
        let synth = Synthesizer::new(&service, RetryPolicy::default(), &sink);

        let out = synth
            .synthesize(&[analysis(0, "a")], 10, 1, &SynthesisParams::for_model("m"))
            .await
            .unwrap();

        assert_eq!(out.profile.structured["parse_error"], json!(true));
        assert_eq!(out.profile.structured["raw"], json!("I could not produce JSON"));
        assert_eq!(sink.retry_delays().len(), 1);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, PipelineEvent::StructuredParseFailed { .. })));
    }

    #[tokio::test]
    async fn all_empty_analyses_are_rejected() {
        let service = Scripted::new(vec![]);
        let synth = Synthesizer::new(&service, RetryPolicy::default(), &crate::events::NoEvents);
        let err = synth
            .synthesize(&[analysis(0, "  ")], 10, 1, &SynthesisParams::for_model("m"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidRequest(_))
        ));
        assert!(service.seen.lock().unwrap().is_empty());
    }
}
