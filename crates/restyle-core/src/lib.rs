//! # restyle core
//!
//! Corpus sampling, hierarchical style analysis and vector-space example
//! retrieval for restyle.
//!
//! This crate holds no SQLite, HTTP or CLI code. Storage comes in through
//! the [`store::Store`] trait, the generation service through
//! [`completion::CompletionService`] and [`completion::BatchService`], and
//! progress goes out through an [`events::EventSink`].

pub mod cancel;
pub mod chunk;
pub mod cluster;
pub mod completion;
pub mod error;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod retrieve;
pub mod retry;
pub mod sample;
pub mod store;
pub mod synthesize;
pub mod vector;
