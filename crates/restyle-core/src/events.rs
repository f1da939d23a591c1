//! Pipeline event sink.
//!
//! Components never print. They report what they are doing through an
//! [`EventSink`] passed in by the caller; the binary renders events on
//! stderr (human or JSON lines) and tests record them.

use std::sync::Mutex;
use std::time::Duration;

/// Which reduce call of the synthesis phase is running.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SynthesisStage {
    /// Merging chunk analyses into one free-form description.
    Describe,
    /// Converting the description into a structured record.
    Structure,
}

/// A single observable step of an analysis or retrieval run.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    Sampled {
        sample_size: usize,
        corpus_size: usize,
    },
    Chunked {
        chunks: usize,
    },
    /// Previously saved chunk analyses were reused on resume.
    Resumed {
        reused: usize,
        stale: usize,
    },
    BatchSubmitted {
        job_id: String,
        requests: usize,
    },
    BatchPolled {
        job_id: String,
        status: String,
        elapsed: Duration,
    },
    /// The batch path failed; requests run sequentially instead.
    BatchFallback {
        reason: String,
    },
    RequestCompleted {
        request_id: String,
        n: usize,
        total: usize,
    },
    /// A request produced no result; its entry is an empty string.
    RequestFailed {
        request_id: String,
        reason: String,
    },
    Retrying {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        reason: String,
    },
    Synthesizing {
        stage: SynthesisStage,
    },
    StructuredParseFailed {
        reason: String,
    },
    ModelBuilt {
        documents: usize,
        features: usize,
    },
    Clustered {
        clusters: usize,
        examples: usize,
    },
}

/// Receives pipeline events. Implementations must not block for long.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Discards every event.
pub struct NoEvents;

impl EventSink for NoEvents {
    fn emit(&self, _event: PipelineEvent) {}
}

/// Keeps every event in memory, in emission order.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events recorded so far.
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Delays reported by `Retrying` events, in order.
    pub fn retry_delays(&self) -> Vec<Duration> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                PipelineEvent::Retrying { delay, .. } => Some(delay),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
