//! # PropertyRAG CLI (`prag`)
//!
//! Ingests real-estate PDFs, shows their pipeline state and extracted
//! fields, and answers questions over the corpus with cited sources.
//!
//! ## Usage
//!
//! ```bash
//! prag --config ./config/prag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `prag init` | Create the SQLite database and run schema migrations |
//! | `prag ingest <files…>` | Ingest PDFs through every pipeline stage |
//! | `prag list` | List documents with lifecycle and type |
//! | `prag status <id>` | Show stage states and the transition log |
//! | `prag record <id>` | Show the extracted structured record |
//! | `prag query "<q>"` | Answer a question with citations |
//! | `prag retry <id> --stage <s>` | Re-run a failed or cancelled stage |
//! | `prag reingest <id> <file>` | Replace a document's PDF and start over |
//!
//! ## Examples
//!
//! ```bash
//! prag init
//! prag ingest mietvertrag.pdf gutachten.pdf --project musterstrasse-1
//! prag query "Wie hoch ist die Kaltmiete?" --project musterstrasse-1
//! prag record 6f1c… --json
//! ```
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default `info`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use property_rag::commands;
use property_rag::config;
use property_rag::migrate;
use property_rag::progress::ProgressMode;
use property_rag_core::models::{DocumentType, Stage};

/// PropertyRAG: document intelligence for real-estate PDFs.
#[derive(Parser)]
#[command(
    name = "prag",
    about = "PropertyRAG: ingest real-estate PDFs and answer questions about them with citations",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/prag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest one or more PDF files.
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Declared document type, used as a classification hint.
        #[arg(long = "type")]
        declared_type: Option<DocumentType>,

        #[arg(long)]
        project: Option<String>,

        /// Stage progress on stderr. Defaults to human output on a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// List documents.
    List {
        #[arg(long)]
        project: Option<String>,
    },

    /// Show a document's stage states and transition log.
    Status { id: String },

    /// Show the structured record extracted from a document.
    Record {
        id: String,

        /// Print the record as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Ask a question over the ingested documents.
    Query {
        question: String,

        #[arg(long)]
        project: Option<String>,

        /// Restrict to these document ids (repeatable).
        #[arg(long = "document")]
        documents: Vec<String>,

        /// Restrict to these document types (repeatable).
        #[arg(long = "type")]
        types: Vec<DocumentType>,

        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Re-run a failed or cancelled stage and its dependents.
    Retry {
        id: String,

        #[arg(long)]
        stage: Stage,

        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Replace a document's PDF and run every stage again.
    Reingest {
        id: String,
        file: PathBuf,

        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let progress = |mode: Option<ProgressMode>| mode.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            files,
            declared_type,
            project,
            progress: mode,
        } => {
            commands::run_ingest(&cfg, &files, declared_type, project, progress(mode)).await?;
        }
        Commands::List { project } => {
            commands::run_list(&cfg, project.as_deref()).await?;
        }
        Commands::Status { id } => {
            commands::run_status(&cfg, &id).await?;
        }
        Commands::Record { id, json } => {
            commands::run_record(&cfg, &id, json).await?;
        }
        Commands::Query {
            question,
            project,
            documents,
            types,
            top_k,
        } => {
            commands::run_query(&cfg, &question, project, documents, types, top_k).await?;
        }
        Commands::Retry {
            id,
            stage,
            progress: mode,
        } => {
            commands::run_retry(&cfg, &id, stage, progress(mode)).await?;
        }
        Commands::Reingest {
            id,
            file,
            progress: mode,
        } => {
            commands::run_reingest(&cfg, &id, &file, progress(mode)).await?;
        }
    }

    Ok(())
}
