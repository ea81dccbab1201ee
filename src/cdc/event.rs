//! Change events emitted by a log engine

use crate::types::{JsonObject, StreamKey};
use serde::{Deserialize, Serialize};

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    /// Row read during the initial snapshot
    #[serde(rename = "r")]
    Read,
    /// Row inserted
    #[serde(rename = "c")]
    Create,
    /// Row updated
    #[serde(rename = "u")]
    Update,
    /// Row deleted
    #[serde(rename = "d")]
    Delete,
}

/// Where an event sits relative to the engine's initial snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SnapshotPhase {
    /// Not produced by a snapshot (no snapshot marker at all)
    #[default]
    #[serde(rename = "none")]
    NotSnapshot,
    /// In-progress snapshot record; more snapshot rows follow
    #[serde(rename = "true")]
    Snapshot,
    /// Final record of the snapshot
    #[serde(rename = "last")]
    LastSnapshot,
    /// Streamed from the log after the snapshot
    #[serde(rename = "false")]
    Streaming,
}

impl SnapshotPhase {
    /// Parse the engine's `snapshot` marker
    ///
    /// Markers for the first or last row of a single table still belong to an
    /// in-progress snapshot.
    pub fn from_marker(marker: Option<&str>) -> Self {
        match marker {
            None => Self::NotSnapshot,
            Some("last") => Self::LastSnapshot,
            Some("false") => Self::Streaming,
            Some("true" | "first" | "first_in_data_collection" | "last_in_data_collection") => {
                Self::Snapshot
            }
            Some("incremental") => Self::Snapshot,
            Some(_) => Self::NotSnapshot,
        }
    }

    /// Check if more snapshot rows are expected after this one
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::Snapshot)
    }
}

/// One row-change event as produced by the log engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Table the change belongs to
    pub stream: StreamKey,
    /// Change kind
    pub op: ChangeOp,
    /// Row image before the change (updates, deletes)
    #[serde(default)]
    pub before: Option<JsonObject>,
    /// Row image after the change (reads, inserts, updates)
    #[serde(default)]
    pub after: Option<JsonObject>,
    /// Engine source block (position, snapshot marker, timestamps)
    #[serde(default)]
    pub source: JsonObject,
}

impl ChangeEvent {
    /// Create an event with an empty source block
    pub fn new(stream: StreamKey, op: ChangeOp) -> Self {
        Self {
            stream,
            op,
            before: None,
            after: None,
            source: JsonObject::new(),
        }
    }

    /// Set the after-image
    #[must_use]
    pub fn with_after(mut self, after: JsonObject) -> Self {
        self.after = Some(after);
        self
    }

    /// Set the before-image
    #[must_use]
    pub fn with_before(mut self, before: JsonObject) -> Self {
        self.before = Some(before);
        self
    }

    /// Set a source block field
    #[must_use]
    pub fn with_source(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.source.insert(key.to_string(), value.into());
        self
    }

    /// Check if this event is a delete
    pub fn is_delete(&self) -> bool {
        self.op == ChangeOp::Delete
    }
}
