//! # restyle
//!
//! Learn the house style of a document corpus and rewrite new text in it.
//!
//! `restyle` imports a corpus of published articles into SQLite, analyzes a
//! stratified sample with a generation service to produce a style guide,
//! selects one representative example per topic cluster, and rewrites
//! input text using the guide plus the most similar examples.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────────┐
//! │  import  │──▶│    SQLite    │──▶│   analyze    │
//! │  (JSONL) │   │  documents   │   │ sample+chunk │
//! └──────────┘   └──────┬───────┘   │ batch+synth  │
//!                       │           └──────┬───────┘
//!                       │                  ▼
//!                       │       style guide + examples
//!                       ▼                  │
//!                 ┌──────────┐             │
//!                 │ rewrite  │◀────────────┘
//!                 └──────────┘
//! ```
//!
//! The pipeline itself (sampling, chunking, orchestration, synthesis,
//! vectorizing, clustering, retrieval) lives in `restyle-core`. This crate
//! supplies the SQLite store, the Anthropic client, configuration and the CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the core `Store` |
//! | [`import`] | JSONL corpus import |
//! | [`anthropic`] | Messages and Message Batches client |
//! | [`tokens`] | Token counting |
//! | [`progress`] | Progress reporting on stderr |
//! | [`analyze`] | Style analysis and example selection |
//! | [`rewrite`] | Style transfer |
//! | [`stats`] | Corpus statistics |
//! | [`get`] | Corpus inspection |

pub mod analyze;
pub mod anthropic;
pub mod config;
pub mod db;
pub mod get;
pub mod import;
pub mod migrate;
pub mod progress;
pub mod rewrite;
pub mod sqlite_store;
pub mod stats;
pub mod tokens;
