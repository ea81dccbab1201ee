//! MagicSync state iterator

use super::filter::{FingerprintFilter, MembershipFilter};
use crate::engine::{ReadOutcome, RecordIterator, RecordMessage, RowStream};
use crate::error::{Error, Result};
use crate::state::StreamIncrementalState;
use crate::types::{JsonObject, JsonValue, StreamKey};
use async_trait::async_trait;
use futures::StreamExt;

/// Column holding the primary key fingerprint
pub const KEY_HASH_COLUMN: &str = "_ab_key_hash";
/// Column holding the whole-row fingerprint
pub const VALUE_HASH_COLUMN: &str = "_ab_value_hash";

/// Emits new or changed rows and rebuilds the fingerprint filter
pub struct MagicSyncIterator {
    stream: StreamKey,
    rows: RowStream,
    previous: FingerprintFilter,
    next_filter: FingerprintFilter,
    exhausted: bool,
    ended_early: Option<String>,
    emitted: u64,
    unchanged: u64,
}

impl MagicSyncIterator {
    /// Create an iterator over fingerprinted rows
    pub fn new(stream: StreamKey, rows: RowStream, previous: FingerprintFilter) -> Self {
        Self {
            stream,
            rows,
            previous,
            next_filter: FingerprintFilter::new(),
            exhausted: false,
            ended_early: None,
            emitted: 0,
            unchanged: 0,
        }
    }

    /// Fold a row into the new filter; returns it if it must be emitted
    fn fold(&mut self, mut row: JsonObject) -> Result<Option<JsonObject>> {
        let key_hash = take_hash(&self.stream, &mut row, KEY_HASH_COLUMN)?;
        let value_hash = take_hash(&self.stream, &mut row, VALUE_HASH_COLUMN)?;

        self.next_filter.insert(&key_hash, &value_hash);
        if self.previous.is_unchanged(&key_hash, &value_hash) {
            self.unchanged += 1;
            return Ok(None);
        }
        self.emitted += 1;
        Ok(Some(row))
    }
}

fn take_hash(stream: &StreamKey, row: &mut JsonObject, column: &str) -> Result<String> {
    match row.remove(column) {
        Some(JsonValue::String(hash)) => Ok(hash),
        Some(JsonValue::Null) | None => Err(Error::query(
            stream.to_string(),
            format!("row has no {column} fingerprint"),
        )),
        Some(other) => Ok(other.to_string()),
    }
}

#[async_trait]
impl RecordIterator for MagicSyncIterator {
    async fn next_record(&mut self) -> Result<Option<RecordMessage>> {
        if self.exhausted || self.ended_early.is_some() {
            return Ok(None);
        }

        while let Some(row) = self.rows.next().await {
            match row.and_then(|row| self.fold(row)) {
                Ok(Some(data)) => return Ok(Some(RecordMessage::new(self.stream.clone(), data))),
                Ok(None) => {}
                Err(e) if !e.is_fatal() => {
                    tracing::warn!("Stream '{}' ended early: {e}", self.stream);
                    self.ended_early = Some(e.to_string());
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }

        self.exhausted = true;
        Ok(None)
    }

    async fn close(&mut self) -> Result<ReadOutcome> {
        tracing::info!(
            "MagicSync stream '{}': {} changed, {} unchanged",
            self.stream,
            self.emitted,
            self.unchanged
        );

        if let Some(reason) = self.ended_early.take() {
            return Ok(ReadOutcome::EndedEarly { reason });
        }
        if !self.exhausted {
            return Ok(ReadOutcome::EndedEarly {
                reason: "closed before all rows were read".to_string(),
            });
        }
        Ok(ReadOutcome::Exhausted(Some(StreamIncrementalState::MagicSync(
            std::mem::take(&mut self.next_filter),
        ))))
    }
}
