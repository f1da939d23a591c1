//! Pipeline progress reporting.
//!
//! Renders [`PipelineEvent`]s during `restyle analyze` and `restyle rewrite`
//! so users see what is being sampled, submitted, retried and synthesized.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use serde_json::{json, Value};

use restyle_core::events::{EventSink, PipelineEvent, SynthesisStage};

/// Human-friendly progress on stderr: "analyze  12 / 15 requests".
pub struct StderrProgress;

impl EventSink for StderrProgress {
    fn emit(&self, event: PipelineEvent) {
        let line = format!("{}\n", human_line(&event));
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl EventSink for JsonProgress {
    fn emit(&self, event: PipelineEvent) {
        if let Ok(line) = serde_json::to_string(&json_event(&event)) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl EventSink for NoProgress {
    fn emit(&self, _event: PipelineEvent) {}
}

fn stage_name(stage: SynthesisStage) -> &'static str {
    match stage {
        SynthesisStage::Describe => "describe",
        SynthesisStage::Structure => "structure",
    }
}

fn human_line(event: &PipelineEvent) -> String {
    match event {
        PipelineEvent::Sampled {
            sample_size,
            corpus_size,
        } => format!(
            "analyze  sampled {} of {} documents",
            format_number(*sample_size as u64),
            format_number(*corpus_size as u64)
        ),
        PipelineEvent::Chunked { chunks } => format!("analyze  {} chunks", chunks),
        PipelineEvent::Resumed { reused, stale } => format!(
            "analyze  resuming: {} saved analyses reused, {} stale",
            reused, stale
        ),
        PipelineEvent::BatchSubmitted { job_id, requests } => {
            format!("analyze  batch {} submitted ({} requests)", job_id, requests)
        }
        PipelineEvent::BatchPolled {
            job_id,
            status,
            elapsed,
        } => format!(
            "analyze  batch {}  {}  {}s elapsed",
            job_id,
            status,
            elapsed.as_secs()
        ),
        PipelineEvent::BatchFallback { reason } => {
            format!("analyze  batch failed ({}), falling back to direct calls", reason)
        }
        PipelineEvent::RequestCompleted { n, total, .. } => format!(
            "analyze  {} / {} requests",
            format_number(*n as u64),
            format_number(*total as u64)
        ),
        PipelineEvent::RequestFailed { request_id, reason } => {
            format!("analyze  {} failed: {}", request_id, reason)
        }
        PipelineEvent::Retrying {
            attempt,
            max_attempts,
            delay,
            reason,
        } => format!(
            "retry {}/{} in {}s: {}",
            attempt,
            max_attempts,
            delay.as_secs(),
            reason
        ),
        PipelineEvent::Synthesizing { stage } => match stage {
            SynthesisStage::Describe => "analyze  synthesizing style guide".to_string(),
            SynthesisStage::Structure => "analyze  extracting structured profile".to_string(),
        },
        PipelineEvent::StructuredParseFailed { reason } => {
            format!("analyze  structured profile kept raw: {}", reason)
        }
        PipelineEvent::ModelBuilt {
            documents,
            features,
        } => format!(
            "analyze  vector model: {} documents, {} features",
            format_number(*documents as u64),
            format_number(*features as u64)
        ),
        PipelineEvent::Clustered { clusters, examples } => {
            format!("analyze  {} clusters, {} examples", clusters, examples)
        }
    }
}

fn json_event(event: &PipelineEvent) -> Value {
    match event {
        PipelineEvent::Sampled {
            sample_size,
            corpus_size,
        } => json!({ "event": "sampled", "sample_size": sample_size, "corpus_size": corpus_size }),
        PipelineEvent::Chunked { chunks } => json!({ "event": "chunked", "chunks": chunks }),
        PipelineEvent::Resumed { reused, stale } => {
            json!({ "event": "resumed", "reused": reused, "stale": stale })
        }
        PipelineEvent::BatchSubmitted { job_id, requests } => {
            json!({ "event": "batch_submitted", "job_id": job_id, "requests": requests })
        }
        PipelineEvent::BatchPolled {
            job_id,
            status,
            elapsed,
        } => json!({
            "event": "batch_polled",
            "job_id": job_id,
            "status": status,
            "elapsed_secs": elapsed.as_secs()
        }),
        PipelineEvent::BatchFallback { reason } => {
            json!({ "event": "batch_fallback", "reason": reason })
        }
        PipelineEvent::RequestCompleted {
            request_id,
            n,
            total,
        } => json!({ "event": "request_completed", "request_id": request_id, "n": n, "total": total }),
        PipelineEvent::RequestFailed { request_id, reason } => {
            json!({ "event": "request_failed", "request_id": request_id, "reason": reason })
        }
        PipelineEvent::Retrying {
            attempt,
            max_attempts,
            delay,
            reason,
        } => json!({
            "event": "retrying",
            "attempt": attempt,
            "max_attempts": max_attempts,
            "delay_ms": delay.as_millis() as u64,
            "reason": reason
        }),
        PipelineEvent::Synthesizing { stage } => {
            json!({ "event": "synthesizing", "stage": stage_name(*stage) })
        }
        PipelineEvent::StructuredParseFailed { reason } => {
            json!({ "event": "structured_parse_failed", "reason": reason })
        }
        PipelineEvent::ModelBuilt {
            documents,
            features,
        } => json!({ "event": "model_built", "documents": documents, "features": features }),
        PipelineEvent::Clustered { clusters, examples } => {
            json!({ "event": "clustered", "clusters": clusters, "examples": examples })
        }
    }
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a sink for this mode.
    pub fn sink(&self) -> Box<dyn EventSink> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
