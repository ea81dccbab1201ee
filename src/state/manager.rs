//! Per-sync state manager
//!
//! Owns the previous-run state for every stream plus the shared CDC offset,
//! and turns current state into checkpoint messages.

use super::types::{CheckpointMessage, StreamIncrementalState};
use crate::cdc::OffsetSnapshot;
use crate::error::{Error, Result};
use crate::types::StreamKey;
use std::collections::BTreeMap;

/// In-memory state for one sync, keyed by stream
#[derive(Debug, Clone, Default)]
pub struct StateManager {
    /// Shared CDC offset (GLOBAL scope)
    global_offset: Option<OffsetSnapshot>,
    /// Per-stream incremental state (STREAM scope)
    streams: BTreeMap<StreamKey, StreamIncrementalState>,
}

impl StateManager {
    /// Create an empty state manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild state from the checkpoints of the previous run
    ///
    /// Later messages for the same scope win. Blobs without a stream name or
    /// without a state are skipped.
    pub fn from_prior(messages: &[CheckpointMessage]) -> Result<Self> {
        let mut manager = Self::new();
        for message in messages {
            match message {
                CheckpointMessage::Global { .. } => {
                    if let Some(offset) = message.offset()? {
                        manager.global_offset = Some(offset);
                    }
                }
                CheckpointMessage::Stream { stream } => {
                    if let Some((key, state)) = stream.typed_state()? {
                        manager.streams.insert(key, state);
                    }
                }
            }
        }

        tracing::debug!(
            "Loaded prior state: global offset {}, {} stream state(s)",
            if manager.global_offset.is_some() {
                "present"
            } else {
                "absent"
            },
            manager.streams.len()
        );
        Ok(manager)
    }

    // ========================================================================
    // Global scope
    // ========================================================================

    /// Previous CDC offset, if any
    pub fn cdc_offset(&self) -> Option<&OffsetSnapshot> {
        self.global_offset.as_ref()
    }

    /// Replace the CDC offset
    pub fn set_cdc_offset(&mut self, offset: OffsetSnapshot) {
        self.global_offset = Some(offset);
    }

    /// Build a GLOBAL checkpoint from the current offset
    pub fn emit_global_checkpoint(&self, streams: &[StreamKey]) -> Result<CheckpointMessage> {
        let offset = self
            .global_offset
            .as_ref()
            .ok_or_else(|| Error::checkpoint("No CDC offset to checkpoint"))?;
        CheckpointMessage::global(offset, streams)
    }

    // ========================================================================
    // Stream scope
    // ========================================================================

    /// State of a stream from the previous run
    pub fn stream_state(&self, key: &StreamKey) -> Option<&StreamIncrementalState> {
        self.streams.get(key)
    }

    /// Remove and return a stream's state
    pub fn take_stream_state(&mut self, key: &StreamKey) -> Option<StreamIncrementalState> {
        self.streams.remove(key)
    }

    /// Replace a stream's state
    pub fn update_stream_state(&mut self, key: StreamKey, state: StreamIncrementalState) {
        self.streams.insert(key, state);
    }

    /// Build a STREAM checkpoint from the stream's current state
    pub fn emit_stream_checkpoint(&self, key: &StreamKey) -> Result<CheckpointMessage> {
        let state = self
            .streams
            .get(key)
            .ok_or_else(|| Error::checkpoint(format!("No state recorded for stream '{key}'")))?;
        CheckpointMessage::stream(key, state)
    }

    /// Streams with recorded state
    pub fn stream_keys(&self) -> impl Iterator<Item = &StreamKey> {
        self.streams.keys()
    }

    /// Check if nothing was carried over from a previous run
    pub fn is_empty(&self) -> bool {
        self.global_offset.is_none() && self.streams.is_empty()
    }
}
