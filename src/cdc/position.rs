//! Log positions, target positions and event metadata
//!
//! The consumer never looks inside a change event itself. Everything it
//! needs (position, snapshot phase, record metadata) goes through the
//! [`CdcMetadata`] capability the engine integration provides.

use super::event::{ChangeEvent, SnapshotPhase};
use crate::error::{Error, Result};
use crate::types::{JsonObject, JsonValue};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// LSN
// ============================================================================

/// PostgreSQL log sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Raw 64-bit value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl FromStr for Lsn {
    type Err = Error;

    /// Parse the `X/Y` hex form, or a plain decimal number
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((hi, lo)) = s.split_once('/') {
            let hi = u32::from_str_radix(hi, 16)
                .map_err(|e| Error::position(format!("Invalid LSN '{s}': {e}")))?;
            let lo = u32::from_str_radix(lo, 16)
                .map_err(|e| Error::position(format!("Invalid LSN '{s}': {e}")))?;
            return Ok(Self((u64::from(hi) << 32) | u64::from(lo)));
        }
        s.parse::<u64>()
            .map(Self)
            .map_err(|e| Error::position(format!("Invalid LSN '{s}': {e}")))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl TryFrom<&JsonValue> for Lsn {
    type Error = Error;

    fn try_from(value: &JsonValue) -> Result<Self> {
        match value {
            JsonValue::Number(n) => n
                .as_u64()
                .map(Self)
                .ok_or_else(|| Error::position(format!("Invalid LSN number: {n}"))),
            JsonValue::String(s) => s.parse(),
            other => Err(Error::position(format!("Unexpected LSN value: {other}"))),
        }
    }
}

// ============================================================================
// Target Position
// ============================================================================

/// How far a sync has to read to be considered caught up
///
/// Computed once before the producer starts. It is a lower bound: reading a
/// little past it is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetPosition<P> {
    /// Position to reach
    pub value: P,
}

impl<P: Ord> TargetPosition<P> {
    /// Create a target position
    pub fn new(value: P) -> Self {
        Self { value }
    }

    /// Check if an event at `position` has reached the target
    pub fn reached_by(&self, position: &P) -> bool {
        position >= &self.value
    }
}

/// Source of the log's current flush position
#[async_trait]
pub trait TargetPositionSource<P>: Send + Sync
where
    P: Ord + fmt::Debug + Send + 'static,
{
    /// Query the current position of the log
    async fn current_position(&self) -> Result<P>;

    /// Compute the target position of a sync
    async fn target_position(&self) -> Result<TargetPosition<P>> {
        let value = self.current_position().await?;
        tracing::info!("Target position for this sync: {value:?}");
        Ok(TargetPosition::new(value))
    }
}

// ============================================================================
// Event Metadata
// ============================================================================

/// Capability interface over the engine's event shape
pub trait CdcMetadata: Send + Sync + 'static {
    /// Totally ordered position token
    type Position: Ord + Clone + fmt::Debug + Send + Sync + 'static;

    /// Position of an event; failure means the event stream is corrupt
    fn position(&self, event: &ChangeEvent) -> Result<Self::Position>;

    /// Snapshot phase of an event
    fn snapshot_phase(&self, event: &ChangeEvent) -> SnapshotPhase;

    /// Add CDC metadata columns to a record built from `event`
    fn add_metadata(&self, record: &mut JsonObject, event: &ChangeEvent);

    /// Build the downstream record for an event
    ///
    /// Deletes emit the before-image. Events without a row image yield None.
    fn to_record(&self, event: &ChangeEvent) -> Option<JsonObject> {
        let image = if event.is_delete() {
            event.before.as_ref().or(event.after.as_ref())
        } else {
            event.after.as_ref()
        }?;
        let mut record = image.clone();
        self.add_metadata(&mut record, event);
        Some(record)
    }
}

/// Metadata column holding the event's LSN
pub const CDC_LSN_COLUMN: &str = "_ab_cdc_lsn";
/// Metadata column holding the commit time
pub const CDC_UPDATED_AT_COLUMN: &str = "_ab_cdc_updated_at";
/// Metadata column holding the delete time (null unless deleted)
pub const CDC_DELETED_AT_COLUMN: &str = "_ab_cdc_deleted_at";

/// Metadata for PostgreSQL logical decoding events
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresCdcMetadata;

impl PostgresCdcMetadata {
    fn commit_time(event: &ChangeEvent) -> JsonValue {
        event
            .source
            .get("ts_ms")
            .and_then(JsonValue::as_i64)
            .and_then(chrono::DateTime::from_timestamp_millis)
            .map_or(JsonValue::Null, |ts| JsonValue::String(ts.to_rfc3339()))
    }
}

impl CdcMetadata for PostgresCdcMetadata {
    type Position = Lsn;

    fn position(&self, event: &ChangeEvent) -> Result<Lsn> {
        let value = event.source.get("lsn").ok_or_else(|| {
            Error::position(format!("Event for '{}' has no lsn", event.stream))
        })?;
        Lsn::try_from(value)
    }

    fn snapshot_phase(&self, event: &ChangeEvent) -> SnapshotPhase {
        match event.source.get("snapshot") {
            Some(JsonValue::String(marker)) => SnapshotPhase::from_marker(Some(marker)),
            Some(JsonValue::Bool(true)) => SnapshotPhase::Snapshot,
            Some(JsonValue::Bool(false)) => SnapshotPhase::Streaming,
            _ => SnapshotPhase::NotSnapshot,
        }
    }

    fn add_metadata(&self, record: &mut JsonObject, event: &ChangeEvent) {
        let lsn = self
            .position(event)
            .map_or(JsonValue::Null, |lsn| JsonValue::from(lsn.as_u64()));
        let commit_time = Self::commit_time(event);

        record.insert(CDC_LSN_COLUMN.to_string(), lsn);
        record.insert(CDC_UPDATED_AT_COLUMN.to_string(), commit_time.clone());
        record.insert(
            CDC_DELETED_AT_COLUMN.to_string(),
            if event.is_delete() {
                commit_time
            } else {
                JsonValue::Null
            },
        );
    }
}
