//! CLI commands and argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Solidafy incremental replication CLI
#[derive(Parser, Debug)]
#[command(name = "solidafy-cdc")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Source configuration file (YAML or JSON)
    #[arg(short = 'C', long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "json")]
    pub format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Test connection to the source database
    Check,

    /// Read changed rows of the configured catalog
    Read {
        /// Configured catalog (JSON)
        #[arg(long)]
        catalog: PathBuf,

        /// Checkpoints of the previous run (JSON)
        #[arg(short, long)]
        state: Option<PathBuf>,

        /// Where to write the merged checkpoints (defaults to --state)
        #[arg(long)]
        state_out: Option<PathBuf>,
    },
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// JSON output (one message per line)
    Json,
    /// Human-readable output
    Pretty,
}
