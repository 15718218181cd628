//! # Ordinance RAG CLI (`ordrag`)
//!
//! ## Usage
//!
//! ```bash
//! ordrag --config ./config/ordrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ordrag init` | Create the SQLite database and run schema migrations |
//! | `ordrag ingest <path>` | Chunk, classify and store a file or directory |
//! | `ordrag ask "<question>"` | Answer a question with verified citations (`--stream` prints tokens as they arrive) |
//! | `ordrag search "<query>"` | Show retrieved chunks and their confidence |
//! | `ordrag collections list` | List collections in the store |
//! | `ordrag collections delete <name>` | Drop a collection |
//! | `ordrag classify <resource_type>` | Show the level a resource type receives |
//!
//! Set `RUST_LOG` (e.g. `RUST_LOG=ordinance_rag=debug`) to change log
//! verbosity; logs go to stderr.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ordinance_rag::commands;
use ordinance_rag::config::{self, Config};
use ordinance_rag::ingest::IngestOptions;
use ordinance_rag_core::models::{Classification, ClassifyContext};

const DEFAULT_CONFIG_PATH: &str = "./config/ordrag.toml";

/// Ordinance RAG: cited answers to questions about municipal rules.
#[derive(Parser)]
#[command(name = "ordrag", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/ordrag.toml` when that file exists, otherwise
    /// built-in defaults are used. See `config/ordrag.example.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest a file or a directory of `.md`/`.txt` files.
    Ingest {
        path: PathBuf,

        /// Target collection (default from `[ingest]`).
        #[arg(long)]
        collection: Option<String>,

        /// Resource type looked up in the classification rules.
        #[arg(long)]
        resource_type: Option<String>,

        /// The content came from outside the municipality.
        #[arg(long)]
        external: bool,

        /// The content of the files is not known for certain.
        #[arg(long)]
        uncertain: bool,

        /// Descend into subdirectories.
        #[arg(long)]
        recursive: bool,
    },

    /// Ask a question and get a cited answer.
    Ask {
        question: String,

        #[arg(long)]
        collection: Option<String>,

        /// Highest classification the asker may see (default from `[retrieval]`).
        #[arg(long)]
        max_classification: Option<Classification>,

        /// JSON file with prior `{ "role", "content" }` turns.
        #[arg(long)]
        history: Option<PathBuf>,

        /// Print the answer while the model writes it.
        #[arg(long)]
        stream: bool,
    },

    /// Retrieve chunks without calling the model.
    Search {
        query: String,

        #[arg(long)]
        collection: Option<String>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        max_classification: Option<Classification>,

        /// Pull in neighbouring chunks from the same source.
        #[arg(long)]
        neighbors: bool,

        /// Re-rank with keyword overlap and content quality.
        #[arg(long)]
        rerank: bool,
    },

    /// Manage collections.
    Collections {
        #[command(subcommand)]
        action: CollectionsAction,
    },

    /// Show the classification a resource type receives.
    Classify {
        resource_type: String,

        #[arg(long)]
        external: bool,

        #[arg(long)]
        uncertain: bool,
    },
}

#[derive(Subcommand)]
enum CollectionsAction {
    /// List collections owned by the configured prefix.
    List,
    /// Delete a collection and all of its records.
    Delete { name: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => config::load_config(path),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default.exists() {
                config::load_config(&default)
            } else {
                info!("no config file found, using defaults");
                Ok(Config::default())
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = resolve_config(cli.config.as_ref())?;
    let json = cli.json;

    match cli.command {
        Commands::Init => {
            commands::run_init(&cfg).await?;
        }
        Commands::Ingest {
            path,
            collection,
            resource_type,
            external,
            uncertain,
            recursive,
        } => {
            let mut cfg = cfg;
            cfg.ingest.recursive |= recursive;
            let options = IngestOptions {
                collection: collection.unwrap_or_else(|| cfg.ingest.collection.clone()),
                resource_type: resource_type.unwrap_or_else(|| cfg.ingest.resource_type.clone()),
                context: ClassifyContext {
                    uncertain,
                    external_source: external,
                },
                ..IngestOptions::default()
            };
            commands::run_ingest(&cfg, &path, options, json).await?;
        }
        Commands::Ask {
            question,
            collection,
            max_classification,
            history,
            stream,
        } => {
            let history = match history {
                Some(path) => commands::load_history(&path)?,
                None => Vec::new(),
            };
            let collection = collection.unwrap_or_else(|| cfg.ingest.collection.clone());
            if stream {
                commands::run_ask_stream(&cfg, &question, &collection, max_classification, &history, json)
                    .await?;
            } else {
                commands::run_ask(&cfg, &question, &collection, max_classification, &history, json)
                    .await?;
            }
        }
        Commands::Search {
            query,
            collection,
            limit,
            max_classification,
            neighbors,
            rerank,
        } => {
            let collection = collection.unwrap_or_else(|| cfg.ingest.collection.clone());
            commands::run_search(
                &cfg,
                &query,
                &collection,
                limit,
                max_classification,
                neighbors,
                rerank,
                json,
            )
            .await?;
        }
        Commands::Collections { action } => match action {
            CollectionsAction::List => commands::run_collections_list(&cfg, json).await?,
            CollectionsAction::Delete { name } => {
                commands::run_collections_delete(&cfg, &name).await?
            }
        },
        Commands::Classify {
            resource_type,
            external,
            uncertain,
        } => {
            let context = ClassifyContext {
                uncertain,
                external_source: external,
            };
            commands::run_classify(&cfg, &resource_type, context, json)?;
        }
    }

    Ok(())
}
