//! # Healthcare Assistant CLI (`hca`)
//!
//! Administers the database and exercises the ingestion, retrieval and
//! answering pipeline without going through HTTP.
//!
//! ## Usage
//!
//! ```bash
//! hca --config ./config/hca.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `hca init` | Create the SQLite database and schema |
//! | `hca serve` | Start the HTTP API |
//! | `hca ingest <pdf> --user <name>` | Ingest a PDF for a user |
//! | `hca search "<query>" --user <name>` | Print the top matching chunks |
//! | `hca ask "<question>" --user <name>` | Answer a question and record it |
//! | `hca history show --user <name>` | Print recent exchanges |
//! | `hca history clear --user <name>` | Delete a user's history |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use healthcare_assistant::history::DEFAULT_HISTORY_LIMIT;
use healthcare_assistant::{config, generate, history, ingest, migrate, retrieve, server};

/// Healthcare Assistant: answers questions from your own medical documents.
#[derive(Parser)]
#[command(
    name = "hca",
    about = "Healthcare Assistant: PDF ingestion, semantic retrieval and grounded answers",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/hca.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Ingest a PDF for a user.
    Ingest {
        /// Path to the PDF file.
        path: PathBuf,

        /// Owning username.
        #[arg(long)]
        user: String,
    },

    /// Semantic search over a user's documents.
    Search {
        query: String,

        #[arg(long)]
        user: String,

        /// Number of results (defaults to `retrieval.top_k`).
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Answer a question from a user's documents and record it in history.
    Ask {
        question: String,

        #[arg(long)]
        user: String,

        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Inspect or clear chat history.
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// Print recent exchanges, oldest first.
    Show {
        #[arg(long)]
        user: String,

        #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: i64,
    },
    /// Delete every exchange for a user.
    Clear {
        #[arg(long)]
        user: String,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ingest { path, user } => {
            ingest::run_ingest(&cfg, &path, &user).await?;
        }
        Commands::Search { query, user, top_k } => {
            retrieve::run_search(&cfg, &query, &user, top_k).await?;
        }
        Commands::Ask {
            question,
            user,
            top_k,
        } => {
            generate::run_ask(&cfg, &question, &user, top_k).await?;
        }
        Commands::History { action } => match action {
            HistoryAction::Show { user, limit } => {
                history::run_history_show(&cfg, &user, limit).await?;
            }
            HistoryAction::Clear { user } => {
                history::run_history_clear(&cfg, &user).await?;
            }
        },
    }

    Ok(())
}
