//! CLI module
//!
//! Command-line interface for running incremental syncs.
//!
//! # Commands
//!
//! - `check` - Test connection to the source database
//! - `read` - Run a MagicSync or Xmin sync and persist its checkpoints

mod commands;
mod runner;

pub use commands::{Cli, Commands, OutputFormat};
pub use runner::Runner;
