// Allow common clippy pedantic lints that aren't critical for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::ref_option)]
#![allow(clippy::unused_self)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::match_wildcard_for_single_variants)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::unused_async)]

//! # Solidafy CDC
//!
//! Incremental and change-capture replication core for database sources.
//!
//! ## Features
//!
//! - **CDC**: Change events from an embedded log engine, read up to a target
//!   position and checkpointed as one GLOBAL offset
//! - **MagicSync**: Row fingerprints compared against the previous run, only
//!   new or changed rows are emitted
//! - **Xmin**: PostgreSQL transaction-id cursor with wraparound handling
//! - **State**: Typed per-stream and global checkpoints with atomic persistence
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use futures::StreamExt;
//! use solidafy_cdc::{database::DatabaseEngine, engine, SourceConfig};
//! use std::sync::Arc;
//!
//! let config = SourceConfig::from_file("source.yaml")?;
//! let database = Arc::new(DatabaseEngine::new(&config.database)?);
//! let driver = engine::IncrementalDriver::from_config(&config, database, None)?;
//!
//! let mut messages = engine::read_incremental(driver, catalog, prior_state);
//! while let Some(message) = messages.next().await {
//!     // Records, checkpoints, logs and stream status
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       read_incremental                          │
//! │  compute_baseline → stream_records → records → emit_checkpoint  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!         ┌──────────────────────┼──────────────────────┐
//!         ▼                      ▼                      ▼
//! ┌───────────────┐     ┌────────────────┐     ┌────────────────┐
//! │      CDC      │     │   MagicSync    │     │      Xmin      │
//! ├───────────────┤     ├────────────────┤     ├────────────────┤
//! │ Log engine    │     │ Fingerprint    │     │ Snapshot xmin  │
//! │ Event queue   │     │ filter         │     │ Wraparound     │
//! │ Offset store  │     │ Key/value hash │     │ planning       │
//! └───────┬───────┘     └───────┬────────┘     └───────┬────────┘
//!         └─────────────────────┼──────────────────────┘
//!                               ▼
//!                   ┌───────────────────────┐
//!                   │ State manager / store │
//!                   └───────────────────────┘
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

// ============================================================================
// Module declarations
// ============================================================================

/// Error types
pub mod error;

/// Common types and type aliases
pub mod types;

/// Source configuration and configured catalog
pub mod config;

/// Change data capture over an embedded log engine
pub mod cdc;

/// Fingerprint-based incremental strategy
pub mod magic_sync;

/// Transaction-id incremental strategy
pub mod xmin;

/// Checkpoint state and persistence
pub mod state;

/// Shared read loop and messages
pub mod engine;

/// Database connectivity via DuckDB
pub mod database;

/// Command-line interface
pub mod cli;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConfiguredCatalog, ReplicationMethod, SourceConfig};
pub use engine::{read_incremental, IncrementalDriver, IncrementalStrategy, Message};
pub use error::{Error, Result};
pub use state::{CheckpointMessage, StateManager, StreamIncrementalState};
pub use types::*;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
