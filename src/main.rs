use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use mnemo::{cli, config, server};

#[derive(Parser)]
#[command(
    name = "mnemo",
    version,
    about = "Persistent searchable memory engine for coding assistants"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the memory server on the loopback port
    Serve,
    /// Search stored memories
    Search {
        query: String,
        /// Maximum results to return
        #[arg(short, long)]
        limit: Option<usize>,
        /// Lexical-only search (no embedder round-trip)
        #[arg(short, long)]
        quick: bool,
        /// Restrict to one domain
        #[arg(short, long)]
        domain: Option<String>,
    },
    /// Print store statistics
    Stats,
    /// Batch-cluster the unclustered backlog
    Cluster {
        /// Restrict to one domain
        #[arg(short, long)]
        domain: Option<String>,
        #[arg(long, default_value_t = 0.5)]
        min_confidence: f64,
        #[arg(long, default_value_t = 2)]
        min_size: usize,
        /// Only consider records created within the last N hours
        #[arg(long)]
        hours_back: Option<f64>,
    },
    /// Merge a mature cluster into one aggregate memory
    Merge { cluster_id: i64 },
    /// Check database health
    Doctor,
}

/// Open the append-mode log file under the configured log directory.
fn open_log_file(config: &config::MnemoConfig) -> Option<std::fs::File> {
    let dir = config::expand_tilde(&config.storage.log_dir);
    std::fs::create_dir_all(&dir).ok()?;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("mnemo.log"))
        .ok()
}

fn env_filter(config: &config::MnemoConfig) -> EnvFilter {
    EnvFilter::try_new(&config.server.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config (for log level)
    let config = config::MnemoConfig::load()?;

    // Initialize tracing with the configured log level. Log to stderr so
    // stdout stays clean for CLI output; the long-running server also
    // appends to a file in the log directory.
    let log_file = matches!(cli.command, Command::Serve)
        .then(|| open_log_file(&config))
        .flatten();
    match log_file {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(env_filter(&config))
            .with_writer(std::io::stderr.and(std::sync::Arc::new(file)))
            .init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(env_filter(&config))
            .with_writer(std::io::stderr)
            .init(),
    }

    match cli.command {
        Command::Serve => {
            server::serve(config).await?;
        }
        Command::Search {
            query,
            limit,
            quick,
            domain,
        } => {
            cli::search::search(config, &query, limit, quick, domain).await?;
        }
        Command::Stats => {
            cli::stats::stats(config).await?;
        }
        Command::Cluster {
            domain,
            min_confidence,
            min_size,
            hours_back,
        } => {
            cli::cluster::auto(config, domain, min_confidence, min_size, hours_back).await?;
        }
        Command::Merge { cluster_id } => {
            cli::cluster::merge(config, cluster_id).await?;
        }
        Command::Doctor => {
            cli::doctor::doctor(config)?;
        }
    }

    Ok(())
}
