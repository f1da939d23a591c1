//! `restyle analyze`: style analysis followed by example selection.
//!
//! Step 1 runs the hierarchical style pipeline and saves a new profile
//! version, plus `style_guide.md` / `style_guide.json` in the data dir.
//! Step 2 fits the vector model over the whole corpus, picks one example
//! per cluster and writes the model artifact.
//!
//! `--cost-estimate` samples and chunks exactly as a real run would but
//! makes no service calls.

use anyhow::{Context, Result};
use std::path::Path;

use restyle_core::cancel::CancellationToken;
use restyle_core::chunk::chunk_documents;
use restyle_core::completion::GenerationParams;
use restyle_core::error::PipelineError;
use restyle_core::events::EventSink;
use restyle_core::models::StyleProfile;
use restyle_core::orchestrator::{BatchOrchestrator, ExecutionMode};
use restyle_core::pipeline::{build_examples, run_style_analysis, AnalysisOptions, ExampleOptions};
use restyle_core::sample::stratified_sample;
use restyle_core::store::Store;
use restyle_core::synthesize::{chunk_prompt, SynthesisParams, Synthesizer, CHUNK_ANALYSIS_INSTRUCTIONS};

use crate::anthropic::AnthropicClient;
use crate::config::Config;
use crate::db;
use crate::progress::format_number;
use crate::sqlite_store::SqliteStore;
use crate::tokens::TokenCounter;

/// USD per million input tokens.
const INPUT_PRICE_PER_MTOK: f64 = 3.0;
/// USD per million output tokens.
const OUTPUT_PRICE_PER_MTOK: f64 = 15.0;
const BATCH_DISCOUNT: f64 = 0.5;
/// Expected length of one chunk analysis.
const OUTPUT_TOKENS_PER_CHUNK: u64 = 2_000;
/// Expected length of the synthesized guide.
const SYNTHESIS_OUTPUT_TOKENS: u64 = 4_000;

/// Flags of one `restyle analyze` invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzeFlags {
    pub resume: bool,
    pub no_batch: bool,
    pub cost_estimate: bool,
}

/// Predicted size and price of an analysis run.
#[derive(Debug, Clone, PartialEq)]
pub struct CostEstimate {
    pub sample_size: usize,
    pub chunk_count: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_batch: f64,
    pub cost_direct: f64,
}

impl CostEstimate {
    /// Price `chunk_input_tokens` of chunk prompts spread over `chunk_count` chunks.
    pub fn from_chunk_tokens(sample_size: usize, chunk_count: usize, chunk_input_tokens: u64) -> Self {
        // The synthesis prompt holds every analysis; roughly a quarter of the input.
        let input_tokens = chunk_input_tokens + chunk_input_tokens / 4;
        let output_tokens = chunk_count as u64 * OUTPUT_TOKENS_PER_CHUNK + SYNTHESIS_OUTPUT_TOKENS;
        let cost_direct = (input_tokens as f64 * INPUT_PRICE_PER_MTOK
            + output_tokens as f64 * OUTPUT_PRICE_PER_MTOK)
            / 1_000_000.0;
        Self {
            sample_size,
            chunk_count,
            input_tokens,
            output_tokens,
            cost_batch: cost_direct * BATCH_DISCOUNT,
            cost_direct,
        }
    }
}

/// Sample and chunk the corpus, then price the prompts without calling the service.
pub async fn estimate_cost<S: Store + ?Sized>(
    store: &S,
    config: &Config,
    counter: &TokenCounter,
) -> Result<CostEstimate> {
    let documents = store.get_all_documents().await?;
    if documents.is_empty() {
        return Err(PipelineError::EmptyCorpus.into());
    }
    let sample = stratified_sample(&documents, &config.sample_params())?;
    let chunks = chunk_documents(&sample.documents, &config.chunk_limits(), |t| counter.count(t))?;

    let chunk_input_tokens: u64 = chunks
        .iter()
        .map(|chunk| {
            let prompt = chunk_prompt(&chunk.documents);
            (counter.count(CHUNK_ANALYSIS_INSTRUCTIONS) + counter.count(&prompt)) as u64
        })
        .sum();

    Ok(CostEstimate::from_chunk_tokens(
        sample.len(),
        chunks.len(),
        chunk_input_tokens,
    ))
}

/// Options for the style pipeline derived from config and flags.
pub fn analysis_options(config: &Config, flags: &AnalyzeFlags) -> AnalysisOptions {
    let mode = if config.analysis.use_batch && !flags.no_batch {
        ExecutionMode::Batch
    } else {
        ExecutionMode::Sequential
    };
    AnalysisOptions {
        sample: config.sample_params(),
        chunking: config.chunk_limits(),
        mode,
        resume: flags.resume,
        analysis: GenerationParams {
            model: config.generation.analysis_model.clone(),
            max_tokens: config.generation.max_tokens,
            temperature: 0.5,
        },
        synthesis: SynthesisParams::for_model(&config.generation.analysis_model),
    }
}

/// Write the profile as `style_guide.md` and `style_guide.json`.
pub fn write_style_guide(profile: &StyleProfile, md_path: &Path, json_path: &Path) -> Result<()> {
    for path in [md_path, json_path] {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    std::fs::write(md_path, &profile.text)
        .with_context(|| format!("Failed to write {}", md_path.display()))?;
    let json = serde_json::to_string_pretty(&profile.structured)?;
    std::fs::write(json_path, json)
        .with_context(|| format!("Failed to write {}", json_path.display()))?;
    Ok(())
}

fn print_estimate(estimate: &CostEstimate) {
    println!("analyze --cost-estimate");
    println!("  sample size:          {}", format_number(estimate.sample_size as u64));
    println!("  chunks:               {}", estimate.chunk_count);
    println!("  input tokens (est.):  {}", format_number(estimate.input_tokens));
    println!("  output tokens (est.): {}", format_number(estimate.output_tokens));
    println!("  cost (batch):         ${:.2}", estimate.cost_batch);
    println!("  cost (direct):        ${:.2}", estimate.cost_direct);
}

pub async fn run_analyze(
    config: &Config,
    flags: AnalyzeFlags,
    events: &dyn EventSink,
    cancel: CancellationToken,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let counter = TokenCounter::new();

    if flags.cost_estimate {
        let estimate = estimate_cost(&store, config, &counter).await?;
        print_estimate(&estimate);
        store.pool().close().await;
        return Ok(());
    }

    let client = AnthropicClient::from_config(&config.generation)?;
    let mut orchestrator = BatchOrchestrator::new(&client, events, config.orchestrator_settings())
        .with_cancellation(cancel.clone());
    let options = analysis_options(config, &flags);
    if options.mode == ExecutionMode::Batch {
        orchestrator = orchestrator.with_batch_service(&client);
    }
    let synthesizer =
        Synthesizer::new(&client, config.retry_policy(), events).with_cancellation(cancel);
    let count_tokens = |text: &str| counter.count(text);

    println!("analyze  step 1/2: style analysis");
    let report = run_style_analysis(
        &store,
        &orchestrator,
        &synthesizer,
        &options,
        &count_tokens,
        events,
    )
    .await?;
    write_style_guide(
        &report.profile,
        &config.style_guide_md_path(),
        &config.style_guide_json_path(),
    )?;

    println!("  corpus:    {} documents", format_number(report.corpus_size as u64));
    println!("  sample:    {} documents", format_number(report.sample_size as u64));
    println!(
        "  chunks:    {} ({} reused, {} analyzed{})",
        report.chunk_count,
        report.reused,
        report.analyzed,
        report
            .mode
            .map(|m| format!(", {}", m.as_str()))
            .unwrap_or_default()
    );
    println!("  profile:   version {}", report.profile.version);
    println!(
        "  usage:     {} input, {} output tokens",
        format_number(report.usage.input_tokens),
        format_number(report.usage.output_tokens)
    );
    println!("  style guide: {}", config.style_guide_md_path().display());

    println!("analyze  step 2/2: example selection");
    let example_options = ExampleOptions {
        vectorizer: config.vectorizer_config(),
        clustering: config.cluster_config(),
    };
    let (_model, examples) =
        build_examples(&store, &example_options, &config.model_path(), events).await?;
    println!("  examples:  {}", examples.len());
    println!("  model:     {}", config.model_path().display());
    println!("ok");

    store.pool().close().await;
    Ok(())
}
