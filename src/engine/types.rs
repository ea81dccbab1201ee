//! Engine types
//!
//! Message types emitted by an incremental read.

use crate::error::Result;
use crate::state::CheckpointMessage;
use crate::types::{JsonObject, LogLevel, StreamKey};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Stream of messages produced by a read
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message>> + Send>>;

/// A message emitted during sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// A changed row
    Record {
        /// The record
        record: RecordMessage,
    },
    /// Checkpoint for durable persistence
    State {
        /// The checkpoint
        state: CheckpointMessage,
    },
    /// Log message
    Log {
        /// Log level
        level: LogLevel,
        /// Log message
        message: String,
    },
    /// Stream lifecycle update
    Trace {
        /// Stream the status refers to
        stream: StreamKey,
        /// New status
        status: StreamStatus,
    },
}

/// One row emitted downstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMessage {
    /// Stream the row belongs to
    pub stream: StreamKey,
    /// Row data
    pub data: JsonObject,
    /// When the row was read
    pub emitted_at: DateTime<Utc>,
}

impl RecordMessage {
    /// Create a record stamped with the current time
    pub fn new(stream: StreamKey, data: JsonObject) -> Self {
        Self {
            stream,
            data,
            emitted_at: Utc::now(),
        }
    }
}

/// Lifecycle status of a stream within a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamStatus {
    /// Reading has begun
    Started,
    /// All rows and the checkpoint were emitted
    Complete,
    /// The stream ended early without a checkpoint
    Incomplete,
}

impl Message {
    /// Create a record message
    pub fn record(stream: StreamKey, data: JsonObject) -> Self {
        Self::Record {
            record: RecordMessage::new(stream, data),
        }
    }

    /// Create a state message
    pub fn state(state: CheckpointMessage) -> Self {
        Self::State { state }
    }

    /// Create a log message
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::Log {
            level,
            message: message.into(),
        }
    }

    /// Create an info log
    pub fn info(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Info, message)
    }

    /// Create a warning log
    pub fn warn(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Warn, message)
    }

    /// Create a stream status message
    pub fn trace(stream: StreamKey, status: StreamStatus) -> Self {
        Self::Trace { stream, status }
    }

    /// Check if this is a record message
    pub fn is_record(&self) -> bool {
        matches!(self, Self::Record { .. })
    }

    /// Check if this is a state message
    pub fn is_state(&self) -> bool {
        matches!(self, Self::State { .. })
    }

    /// Check if this is a log message
    pub fn is_log(&self) -> bool {
        matches!(self, Self::Log { .. })
    }

    /// Check if this is a stream status message
    pub fn is_trace(&self) -> bool {
        matches!(self, Self::Trace { .. })
    }

    /// Record payload, if this is a record message
    pub fn as_record(&self) -> Option<&RecordMessage> {
        match self {
            Self::Record { record } => Some(record),
            _ => None,
        }
    }

    /// Checkpoint payload, if this is a state message
    pub fn as_state(&self) -> Option<&CheckpointMessage> {
        match self {
            Self::State { state } => Some(state),
            _ => None,
        }
    }
}

/// Statistics from a sync operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Total records emitted
    pub records_synced: usize,
    /// Checkpoints emitted
    pub checkpoints: usize,
    /// Streams that completed
    pub streams_completed: usize,
    /// Streams that ended early
    pub streams_incomplete: usize,
}

impl SyncStats {
    /// Create new stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one emitted message
    pub fn observe(&mut self, message: &Message) {
        match message {
            Message::Record { .. } => self.records_synced += 1,
            Message::State { .. } => self.checkpoints += 1,
            Message::Trace {
                status: StreamStatus::Complete,
                ..
            } => self.streams_completed += 1,
            Message::Trace {
                status: StreamStatus::Incomplete,
                ..
            } => self.streams_incomplete += 1,
            _ => {}
        }
    }
}
