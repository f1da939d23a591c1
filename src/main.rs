//! # restyle CLI
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `restyle init` | Create the SQLite database and run schema migrations |
//! | `restyle import <file>` | Import a JSONL corpus |
//! | `restyle analyze` | Build the style guide and select examples |
//! | `restyle rewrite [file]` | Rewrite text in the corpus style |
//! | `restyle corpus stats` | Corpus statistics |
//! | `restyle corpus show <id>` | Print one document |
//! | `restyle corpus examples` | List the selected examples |
//! | `restyle corpus style-guide` | Print the latest style guide |
//!
//! ## Examples
//!
//! ```bash
//! restyle init
//! restyle import ./articles.jsonl
//! restyle analyze --cost-estimate
//! restyle analyze
//! restyle rewrite draft.md --intensity full -o draft.restyled.md
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use restyle::analyze::{self, AnalyzeFlags};
use restyle::config;
use restyle::get;
use restyle::import;
use restyle::migrate;
use restyle::progress::ProgressMode;
use restyle::rewrite::{self, Intensity, RewriteArgs};
use restyle::stats;
use restyle_core::cancel::CancellationToken;

/// Learn the house style of a corpus and rewrite text in it.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/restyle.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "restyle", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/restyle.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a terminal, else `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Import documents from a JSONL file.
    ///
    /// Each line is an object with `title` and `body`, plus optional
    /// `published_at`, `categories` and `source_id`. Short and duplicate
    /// documents are skipped.
    Import {
        file: PathBuf,

        /// Delete the existing corpus (and its examples) first.
        #[arg(long)]
        force: bool,

        /// Parse and report without writing to the database.
        #[arg(long)]
        dry_run: bool,
    },

    /// Analyze the corpus: style guide, then example selection.
    Analyze {
        /// Reuse chunk analyses saved by an interrupted run.
        #[arg(long)]
        resume: bool,

        /// Send requests one by one instead of as a batch job.
        #[arg(long)]
        no_batch: bool,

        /// Print predicted tokens and cost, then exit without calling the service.
        #[arg(long)]
        cost_estimate: bool,
    },

    /// Rewrite text in the corpus style. Reads stdin without FILE or --text.
    Rewrite {
        file: Option<PathBuf>,

        #[arg(short, long)]
        text: Option<String>,

        #[arg(short, long, value_enum)]
        intensity: Option<Intensity>,

        /// Number of corpus examples to retrieve.
        #[arg(short, long)]
        n_examples: Option<usize>,

        /// Extra example file; shown before retrieved examples. Repeatable.
        #[arg(short, long = "example")]
        examples: Vec<PathBuf>,

        #[arg(short, long)]
        preserve_structure: bool,

        #[arg(long)]
        temperature: Option<f32>,

        /// Write the result here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the chosen examples and prompt sizes on stderr.
        #[arg(short, long)]
        verbose: bool,
    },

    /// Inspect the imported corpus and analysis results.
    Corpus {
        #[command(subcommand)]
        action: CorpusAction,
    },
}

#[derive(Subcommand)]
enum CorpusAction {
    Stats,
    Show { id: String },
    Examples,
    StyleGuide,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("restyle=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);
    let events = progress.sink();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::warn!("interrupted; stopping (press Ctrl-C again to exit now)");
            cancel.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        });
    }

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Import {
            file,
            force,
            dry_run,
        } => {
            import::run_import(&cfg, &file, force, dry_run).await?;
        }
        Commands::Analyze {
            resume,
            no_batch,
            cost_estimate,
        } => {
            let flags = AnalyzeFlags {
                resume,
                no_batch,
                cost_estimate,
            };
            analyze::run_analyze(&cfg, flags, events.as_ref(), cancel).await?;
        }
        Commands::Rewrite {
            file,
            text,
            intensity,
            n_examples,
            examples,
            preserve_structure,
            temperature,
            output,
            verbose,
        } => {
            let args = RewriteArgs {
                file,
                text,
                intensity,
                n_examples,
                example_files: examples,
                preserve_structure,
                temperature,
                output,
                verbose,
            };
            rewrite::run_rewrite(&cfg, args, events.as_ref(), cancel).await?;
        }
        Commands::Corpus { action } => match action {
            CorpusAction::Stats => stats::run_stats(&cfg).await?,
            CorpusAction::Show { id } => get::run_show(&cfg, &id).await?,
            CorpusAction::Examples => get::run_examples(&cfg).await?,
            CorpusAction::StyleGuide => get::run_style_guide(&cfg).await?,
        },
    }

    Ok(())
}
