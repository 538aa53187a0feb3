use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod display;

use commands::{commit, diff, head, history, init, log, query, show, Store};

#[derive(Parser)]
#[command(name = "edb")]
#[command(version, about = "Versioned object store for engineering data", long_about = None)]
struct Cli {
    /// Database path
    #[arg(short, long, global = true)]
    db: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Stage to work in (defaults to the unstaged partition)
    #[arg(short, long, global = true)]
    stage: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty store
    Init,

    /// Apply a JSON batch of inserts, updates and deletions
    Commit {
        /// Batch file
        batch: PathBuf,

        /// Committer recorded on the commit
        #[arg(short, long, default_value = "cli-user")]
        agent: String,
    },

    /// Show the current version of an object
    Show {
        oid: String,

        /// Show the version as of this timestamp (ms)
        #[arg(long)]
        at: Option<i64>,
    },

    /// Show every version of an object with the commit that wrote it
    History { oid: String },

    /// List the live objects of the store
    Head {
        /// Reconstruct the head as of this timestamp (ms)
        #[arg(long)]
        at: Option<i64>,
    },

    /// Show commit history
    Log {
        /// Number of commits to show
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show what changed between two points in time
    Diff { first: i64, second: i64 },

    /// Find live objects by entry values
    Query {
        /// Predicates of the form key=value
        #[arg(required = true)]
        predicates: Vec<String>,

        /// Query the head as of this timestamp (ms)
        #[arg(long)]
        at: Option<i64>,

        /// Compare values ignoring case
        #[arg(short, long)]
        ignore_case: bool,

        /// Treat % and _ as wildcards
        #[arg(long)]
        like: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let store = Store {
        db: cli.db,
        config: cli.config,
        stage: cli.stage,
    };

    match cli.command {
        Commands::Init => {
            init::run(&store)?;
        }
        Commands::Commit { batch, agent } => {
            commit::run(&store, batch, agent)?;
        }
        Commands::Show { oid, at } => {
            show::run(&store, &oid, at)?;
        }
        Commands::History { oid } => {
            history::run(&store, &oid)?;
        }
        Commands::Head { at } => {
            head::run(&store, at)?;
        }
        Commands::Log { limit } => {
            log::run(&store, limit)?;
        }
        Commands::Diff { first, second } => {
            diff::run(&store, first, second)?;
        }
        Commands::Query {
            predicates,
            at,
            ignore_case,
            like,
        } => {
            query::run(&store, &predicates, at, ignore_case, like)?;
        }
    }

    Ok(())
}
