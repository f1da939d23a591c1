//! TOML configuration.
//!
//! Only `[db]` is required; every other section falls back to defaults.
//! The API key is never read from the file: `[generation].api_key_env`
//! names the environment variable that holds it.
//!
//! ```toml
//! [db]
//! path = "./data/restyle.sqlite"
//!
//! [data]
//! dir = "./data"
//!
//! [analysis]
//! sample_fraction = 0.18
//! use_batch = true
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use restyle_core::chunk::ChunkLimits;
use restyle_core::cluster::ClusterConfig;
use restyle_core::orchestrator::{OrchestratorSettings, PollSettings};
use restyle_core::retry::RetryPolicy;
use restyle_core::sample::SampleParams;
use restyle_core::vector::VectorizerConfig;

use crate::rewrite::Intensity;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rewrite: RewriteConfig,
    #[serde(default)]
    pub import: ImportConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Directory holding the vector model and the exported style guide.
#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Model used for rewriting.
    #[serde(default = "default_model")]
    pub model: String,
    /// Model used for chunk analysis and synthesis.
    #[serde(default = "default_model")]
    pub analysis_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            analysis_model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}
fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_temperature() -> f32 {
    0.7
}
fn default_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_sample_fraction")]
    pub sample_fraction: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_chunk_max_tokens")]
    pub chunk_max_tokens: usize,
    #[serde(default = "default_chunk_max_documents")]
    pub chunk_max_documents: usize,
    #[serde(default = "default_n_clusters")]
    pub n_clusters: usize,
    #[serde(default = "default_max_features")]
    pub max_features: usize,
    #[serde(default = "default_true")]
    pub use_batch: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Give up on a batch job after this long and fall back to direct calls.
    #[serde(default)]
    pub poll_timeout_secs: Option<u64>,
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sample_fraction: default_sample_fraction(),
            seed: default_seed(),
            chunk_max_tokens: default_chunk_max_tokens(),
            chunk_max_documents: default_chunk_max_documents(),
            n_clusters: default_n_clusters(),
            max_features: default_max_features(),
            use_batch: true,
            poll_interval_secs: default_poll_interval_secs(),
            poll_timeout_secs: None,
            pacing_ms: default_pacing_ms(),
        }
    }
}

fn default_sample_fraction() -> f64 {
    0.18
}
fn default_seed() -> u64 {
    42
}
fn default_chunk_max_tokens() -> usize {
    90_000
}
fn default_chunk_max_documents() -> usize {
    12
}
fn default_n_clusters() -> usize {
    25
}
fn default_max_features() -> usize {
    10_000
}
fn default_true() -> bool {
    true
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_pacing_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    10
}
fn default_base_delay_secs() -> u64 {
    2
}
fn default_max_delay_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RewriteConfig {
    #[serde(default)]
    pub intensity: Intensity,
    #[serde(default = "default_n_examples")]
    pub n_examples: usize,
    #[serde(default)]
    pub preserve_structure: bool,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            intensity: Intensity::default(),
            n_examples: default_n_examples(),
            preserve_structure: false,
        }
    }
}

fn default_n_examples() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImportConfig {
    #[serde(default = "default_min_words")]
    pub min_words: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            min_words: default_min_words(),
        }
    }
}

fn default_min_words() -> usize {
    50
}

impl Config {
    /// Persisted vector model.
    pub fn model_path(&self) -> PathBuf {
        self.data.dir.join("vector_model.cbor")
    }

    pub fn style_guide_md_path(&self) -> PathBuf {
        self.data.dir.join("style_guide.md")
    }

    pub fn style_guide_json_path(&self) -> PathBuf {
        self.data.dir.join("style_guide.json")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_secs(self.retry.base_delay_secs),
            max_delay: Duration::from_secs(self.retry.max_delay_secs),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            retry: self.retry_policy(),
            poll: PollSettings {
                interval: Duration::from_secs(self.analysis.poll_interval_secs),
                deadline: self.analysis.poll_timeout_secs.map(Duration::from_secs),
            },
            pacing: Duration::from_millis(self.analysis.pacing_ms),
        }
    }

    pub fn sample_params(&self) -> SampleParams {
        SampleParams {
            fraction: self.analysis.sample_fraction,
            seed: self.analysis.seed,
        }
    }

    pub fn chunk_limits(&self) -> ChunkLimits {
        ChunkLimits {
            max_tokens: self.analysis.chunk_max_tokens,
            max_documents: self.analysis.chunk_max_documents,
        }
    }

    pub fn vectorizer_config(&self) -> VectorizerConfig {
        VectorizerConfig {
            max_features: self.analysis.max_features,
            ..VectorizerConfig::default()
        }
    }

    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            n_clusters: self.analysis.n_clusters,
            seed: self.analysis.seed,
            ..ClusterConfig::default()
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let analysis = &config.analysis;
    if !(analysis.sample_fraction > 0.0 && analysis.sample_fraction <= 1.0) {
        anyhow::bail!("analysis.sample_fraction must be in (0.0, 1.0]");
    }
    if analysis.chunk_max_tokens == 0 {
        anyhow::bail!("analysis.chunk_max_tokens must be > 0");
    }
    if analysis.chunk_max_documents == 0 {
        anyhow::bail!("analysis.chunk_max_documents must be > 0");
    }
    if analysis.n_clusters < 1 {
        anyhow::bail!("analysis.n_clusters must be >= 1");
    }
    if analysis.max_features == 0 {
        anyhow::bail!("analysis.max_features must be > 0");
    }
    if analysis.poll_interval_secs == 0 {
        anyhow::bail!("analysis.poll_interval_secs must be > 0");
    }
    if analysis.poll_timeout_secs == Some(0) {
        anyhow::bail!("analysis.poll_timeout_secs must be > 0 when set");
    }

    if config.retry.max_attempts < 1 {
        anyhow::bail!("retry.max_attempts must be >= 1");
    }
    if config.retry.base_delay_secs > config.retry.max_delay_secs {
        anyhow::bail!(
            "retry.base_delay_secs ({}) must not exceed retry.max_delay_secs ({})",
            config.retry.base_delay_secs,
            config.retry.max_delay_secs
        );
    }

    let generation = &config.generation;
    if !(0.0..=1.0).contains(&generation.temperature) {
        anyhow::bail!("generation.temperature must be in [0.0, 1.0]");
    }
    if generation.max_tokens == 0 {
        anyhow::bail!("generation.max_tokens must be > 0");
    }
    if generation.api_key_env.trim().is_empty() {
        anyhow::bail!("generation.api_key_env must name an environment variable");
    }

    if config.rewrite.n_examples == 0 {
        anyhow::bail!("rewrite.n_examples must be >= 1");
    }
    Ok(())
}
