//! State management module
//!
//! Handles checkpoint messages, previous-run state, and resumability.
//! State is persisted between sync runs to enable incremental syncs.
//!
//! # Overview
//!
//! The state module provides:
//! - `CheckpointMessage` - GLOBAL (CDC offset) and STREAM (per-table) checkpoints
//! - `StateManager` - Previous-run state keyed by stream
//! - `StateStore` - File-based checkpoint persistence

mod manager;
mod store;
mod types;

pub use manager::StateManager;
pub use store::{merge_checkpoints, StateStore};
pub use types::{
    CheckpointMessage, GlobalState, StreamIncrementalState, StreamStateBlob,
    MAGIC_SYNC_STATE_TYPE, XMIN_STATE_TYPE, XMIN_STATE_VERSION,
};
