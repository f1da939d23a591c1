//! `restyle rewrite`: style transfer for new text.
//!
//! The system prompt carries the style guide and the intensity rules and is
//! marked cacheable, so repeated rewrites against the same guide reuse it.
//! The user prompt carries the few-shot examples (user-provided ones first,
//! then the most similar stored examples) and the input text.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};

use restyle_core::cancel::CancellationToken;
use restyle_core::completion::{CompletionRequest, CompletionService, GenerationParams, Message, Usage};
use restyle_core::error::PipelineError;
use restyle_core::events::EventSink;
use restyle_core::models::Document;
use restyle_core::retrieve::find_similar_examples;
use restyle_core::retry::{complete_with_retry, RetryPolicy};
use restyle_core::store::Store;
use restyle_core::vector::VectorSpaceModel;

use crate::anthropic::AnthropicClient;
use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;
use crate::tokens::TokenCounter;

/// How far the rewrite may move away from the input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Intensity {
    Light,
    #[default]
    Medium,
    Full,
}

impl Intensity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intensity::Light => "light",
            Intensity::Medium => "medium",
            Intensity::Full => "full",
        }
    }

    fn instructions(&self) -> &'static str {
        match self {
            Intensity::Light => {
                "**Light adaptation**: minimal changes.\n\
                 - Adjust only the tone and individual phrasings\n\
                 - Keep the structure and paragraph order of the original\n\
                 - Replace phrases that are clearly foreign to the publication\n\
                 - Do NOT restructure sentences radically"
            }
            Intensity::Medium => {
                "**Medium adaptation**: noticeable styling.\n\
                 - Rewrite sentences in the publication's characteristic style\n\
                 - Adapt vocabulary, tone and rhythm\n\
                 - Information may move within a paragraph\n\
                 - Keep the overall structure (paragraphs, sections)"
            }
            Intensity::Full => {
                "**Full rewrite**: deep styling.\n\
                 - Rework the text completely in the publication's style\n\
                 - Restructure freely where it improves the text\n\
                 - Add the publication's typical elements (intro, transitions, conclusion)\n\
                 - Use the publication's typical formatting devices"
            }
        }
    }
}

pub fn build_system_prompt(style_guide: &str, intensity: Intensity) -> String {
    format!(
        "You are an experienced editor of the publication described below. Rewrite the text \
         you are given so that it reads as if the publication's own author wrote it, following \
         this style guide.\n\n\
         {}\n\n---\n\n\
         ## Rewriting rules\n\n\
         ### Intensity: {}\n{}\n\n\
         ### General rules\n\
         - Keep the facts of the source text accurate\n\
         - Do not add information that is not in the original\n\
         - Do not drop important facts from the original\n\
         - The result must sound natural, as if the publication's author wrote it\n\
         - Write in the language of the publication\n",
        style_guide,
        intensity.as_str(),
        intensity.instructions()
    )
}

pub fn build_user_prompt(input: &str, examples: &[String], preserve_structure: bool) -> String {
    let examples_text = examples
        .iter()
        .enumerate()
        .map(|(i, example)| format!("### Example {}\n\n{}", i + 1, example))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");
    let closing = if preserve_structure {
        "Rewrite the text above in the publication's style. \
         **Keep the original structure**: headings, lists, section breaks. \
         Return ONLY the rewritten text, without commentary."
    } else {
        "Rewrite the text above in the publication's style. \
         Return ONLY the rewritten text, without commentary."
    };
    format!(
        "## Style examples\n\n\
         Here are some real articles from the publication for reference:\n\n\
         {}\n\n---\n\n\
         ## Text to rewrite\n\n\
         {}\n\n---\n\n\
         {}",
        examples_text, input, closing
    )
}

/// Render a stored example for the user prompt.
pub fn format_example(doc: &Document) -> String {
    format!("**{}**\n\n{}", doc.title, doc.body)
}

const PREAMBLE_PREFIXES: [&str; 5] = ["here", "sure", "rewritten", "result", "done"];
const TRAILING_MARKERS: [&str; 2] = ["\n---\n", "\n***\n"];
/// Text after a final separator shorter than this is treated as commentary.
const MAX_TRAILING_COMMENTARY: usize = 200;

/// Clean up model output.
///
/// Drops a "Here is the rewritten text:" style first line, drops short
/// commentary after a final `---` or `***` separator, and collapses runs of
/// blank lines.
pub fn postprocess(text: &str) -> String {
    let mut text = text.trim().to_string();

    let is_preamble = text.lines().next().is_some_and(|first| {
        let lower = first.trim_start().to_lowercase();
        PREAMBLE_PREFIXES.iter().any(|p| {
            lower
                .strip_prefix(p)
                .is_some_and(|rest| !rest.starts_with(char::is_alphanumeric))
        })
    });
    if is_preamble {
        text = text
            .split_once('\n')
            .map(|(_, rest)| rest.trim().to_string())
            .unwrap_or_default();
    }

    for marker in TRAILING_MARKERS {
        if let Some(idx) = text.rfind(marker) {
            let after = text[idx + marker.len()..].trim();
            if after.chars().count() < MAX_TRAILING_COMMENTARY {
                text = text[..idx].trim().to_string();
            }
        }
    }

    collapse_blank_lines(&text)
}

/// Replace every run of three or more newlines with two.
fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0;
    for c in text.chars() {
        if c == '\n' {
            newlines += 1;
            if newlines > 2 {
                continue;
            }
        } else {
            newlines = 0;
        }
        out.push(c);
    }
    out
}

/// Settings for one rewrite.
#[derive(Debug, Clone)]
pub struct RewriteOptions {
    pub intensity: Intensity,
    pub n_examples: usize,
    /// User-provided example texts, placed before retrieved ones.
    pub extra_examples: Vec<String>,
    pub preserve_structure: bool,
    pub params: GenerationParams,
}

/// A rewritten text and what went into it.
#[derive(Debug, Clone)]
pub struct Rewrite {
    pub text: String,
    pub usage: Usage,
    /// Titles of the retrieved examples, best first.
    pub example_titles: Vec<String>,
    pub system_prompt: String,
    pub user_prompt: String,
}

/// Builds prompts and runs the rewrite call.
pub struct RewriteEngine<'a> {
    store: &'a dyn Store,
    model: Option<&'a VectorSpaceModel>,
    service: &'a dyn CompletionService,
    retry: RetryPolicy,
    events: &'a dyn EventSink,
    cancel: CancellationToken,
}

impl<'a> RewriteEngine<'a> {
    /// `model` may be `None` only when no examples are requested.
    pub fn new(
        store: &'a dyn Store,
        model: Option<&'a VectorSpaceModel>,
        service: &'a dyn CompletionService,
        retry: RetryPolicy,
        events: &'a dyn EventSink,
    ) -> Self {
        Self {
            store,
            model,
            service,
            retry,
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn rewrite(
        &self,
        style_guide: &str,
        input: &str,
        options: &RewriteOptions,
    ) -> Result<Rewrite> {
        if input.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("input text is empty".into()).into());
        }

        let retrieved = if options.n_examples == 0 {
            Vec::new()
        } else {
            let model = self
                .model
                .ok_or_else(|| PipelineError::missing("vector model"))?;
            find_similar_examples(self.store, model, input, options.n_examples).await?
        };
        tracing::debug!(retrieved = retrieved.len(), "examples selected");

        let mut examples = options.extra_examples.clone();
        examples.extend(retrieved.iter().map(format_example));

        let system_prompt = build_system_prompt(style_guide, options.intensity);
        let user_prompt = build_user_prompt(input, &examples, options.preserve_structure);
        let request = CompletionRequest {
            instructions: system_prompt.clone(),
            conversation: vec![Message::user(user_prompt.clone())],
            params: options.params.clone(),
            cache_instructions: true,
        };
        let completion =
            complete_with_retry(self.service, &request, &self.retry, self.events, &self.cancel)
                .await?;

        Ok(Rewrite {
            text: postprocess(&completion.text),
            usage: completion.usage,
            example_titles: retrieved.into_iter().map(|d| d.title).collect(),
            system_prompt,
            user_prompt,
        })
    }
}

/// Flags of one `restyle rewrite` invocation.
#[derive(Debug, Clone, Default)]
pub struct RewriteArgs {
    pub file: Option<PathBuf>,
    pub text: Option<String>,
    pub intensity: Option<Intensity>,
    pub n_examples: Option<usize>,
    pub example_files: Vec<PathBuf>,
    pub preserve_structure: bool,
    pub temperature: Option<f32>,
    pub output: Option<PathBuf>,
    pub verbose: bool,
}

fn read_input(args: &RewriteArgs) -> Result<String> {
    match (&args.text, &args.file) {
        (Some(_), Some(_)) => bail!("pass either FILE or --text, not both"),
        (Some(text), None) => Ok(text.clone()),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        (None, None) => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            Ok(buf)
        }
    }
}

/// The style guide text: the exported markdown if present, else the latest
/// stored profile.
async fn load_style_guide<S: Store + ?Sized>(store: &S, md_path: &Path) -> Result<String> {
    if md_path.exists() {
        return std::fs::read_to_string(md_path)
            .with_context(|| format!("Failed to read {}", md_path.display()));
    }
    match store.get_latest_style_profile().await? {
        Some(profile) => Ok(profile.text),
        None => Err(PipelineError::missing("style profile").into()),
    }
}

pub async fn run_rewrite(
    config: &Config,
    args: RewriteArgs,
    events: &dyn EventSink,
    cancel: CancellationToken,
) -> Result<()> {
    let input = read_input(&args)?;
    let extra_examples = args
        .example_files
        .iter()
        .map(|path| {
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read example {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let options = RewriteOptions {
        intensity: args.intensity.unwrap_or(config.rewrite.intensity),
        n_examples: args.n_examples.unwrap_or(config.rewrite.n_examples),
        extra_examples,
        preserve_structure: args.preserve_structure || config.rewrite.preserve_structure,
        params: GenerationParams {
            model: config.generation.model.clone(),
            max_tokens: config.generation.max_tokens,
            temperature: args.temperature.unwrap_or(config.generation.temperature),
        },
    };
    if !(0.0..=1.0).contains(&options.params.temperature) {
        bail!("--temperature must be in [0.0, 1.0]");
    }

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);

    let style_guide = load_style_guide(&store, &config.style_guide_md_path()).await?;
    let model = if options.n_examples > 0 {
        Some(VectorSpaceModel::load(&config.model_path())?)
    } else {
        None
    };
    let client = AnthropicClient::from_config(&config.generation)?;

    let engine = RewriteEngine::new(&store, model.as_ref(), &client, config.retry_policy(), events)
        .with_cancellation(cancel);
    let rewrite = engine.rewrite(&style_guide, &input, &options).await?;

    if args.verbose {
        let counter = TokenCounter::new();
        eprintln!("style guide: {} chars", style_guide.len());
        eprintln!(
            "examples: {} user-provided, {} retrieved",
            options.extra_examples.len(),
            rewrite.example_titles.len()
        );
        for title in &rewrite.example_titles {
            eprintln!("  - {}", title);
        }
        eprintln!(
            "prompt: system={} tokens, user={} tokens",
            counter.count(&rewrite.system_prompt),
            counter.count(&rewrite.user_prompt)
        );
        eprintln!(
            "usage: input={}, output={}, cache_read={}, cache_creation={}",
            rewrite.usage.input_tokens,
            rewrite.usage.output_tokens,
            rewrite.usage.cache_read_tokens,
            rewrite.usage.cache_creation_tokens
        );
    }

    match &args.output {
        Some(path) => {
            std::fs::write(path, &rewrite.text)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("wrote {}", path.display());
        }
        None => println!("{}", rewrite.text),
    }

    store.pool().close().await;
    Ok(())
}
