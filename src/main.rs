//! # docmesh CLI
//!
//! ```bash
//! docmesh --config ./config/docmesh.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docmesh init` | Create the SQLite database and run schema migrations |
//! | `docmesh check` | Validate the configuration and show provider resolution |
//! | `docmesh id <text>` | Parse a document identifier in any accepted form |
//! | `docmesh conflicts` | List open conflicts |
//! | `docmesh resolve <id>` | Resolve a conflict |
//! | `docmesh history <id>` | Show a document's revisions |
//! | `docmesh alias <legacy> <uuid>` | Map a legacy identifier to a UUID |
//! | `docmesh search "<query>"` | Search the replica |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docmesh::{commands, config, migrate};

/// docmesh: stable document identity across storage providers.
#[derive(Parser)]
#[command(name = "docmesh", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docmesh.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Validate the configuration and print each project's mode, providers,
    /// read/write resolution, and watched folders.
    Check,

    /// Parse a document identifier (bare UUID, short, full, or URI form).
    Id {
        text: String,
    },

    /// List conflicts.
    Conflicts {
        /// Include resolved conflicts.
        #[arg(long)]
        all: bool,
    },

    /// Resolve an open conflict.
    Resolve {
        /// Conflict ID.
        id: i64,

        /// `source-wins`, `target-wins`, `manual`, or `merged`.
        #[arg(long)]
        strategy: String,

        /// Revision to keep (`manual` only).
        #[arg(long)]
        keep: Option<i64>,

        /// Later revision that becomes canonical (`merged` only).
        #[arg(long)]
        superseding: Option<i64>,
    },

    /// Show the revision history of a document.
    History {
        /// Document identifier in any accepted form.
        id: String,

        /// Project name, when the identifier does not carry one.
        #[arg(long)]
        project: Option<String>,
    },

    /// Map a legacy identifier to a document UUID.
    Alias {
        legacy_id: String,
        uuid: String,
    },

    /// Search replica documents (FTS5 query syntax).
    Search {
        query: String,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Commands that don't require config
    if let Commands::Id { text } = &cli.command {
        return commands::run_id(text);
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Check => commands::run_check(&cfg)?,
        Commands::Id { .. } => unreachable!(),
        Commands::Conflicts { all } => commands::run_conflicts(&cfg, all).await?,
        Commands::Resolve {
            id,
            strategy,
            keep,
            superseding,
        } => {
            let resolution = commands::resolution_from_args(&strategy, keep, superseding)?;
            commands::run_resolve(&cfg, id, resolution).await?;
        }
        Commands::History { id, project } => {
            commands::run_history(&cfg, &id, project.as_deref()).await?;
        }
        Commands::Alias { legacy_id, uuid } => {
            commands::run_alias(&cfg, &legacy_id, &uuid).await?;
        }
        Commands::Search { query, limit } => {
            commands::run_search(&cfg, &query, limit).await?;
        }
    }

    Ok(())
}
