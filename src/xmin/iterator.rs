//! Xmin state iterator

use super::status::XminStatus;
use crate::engine::{ReadOutcome, RecordIterator, RecordMessage, RowStream};
use crate::error::Result;
use crate::state::StreamIncrementalState;
use crate::types::StreamKey;
use async_trait::async_trait;
use futures::StreamExt;

/// Emits every qualifying row; checkpoints the sync's current status
pub struct XminIterator {
    stream: StreamKey,
    rows: RowStream,
    current: XminStatus,
    exhausted: bool,
    ended_early: Option<String>,
    emitted: u64,
}

impl XminIterator {
    /// Create an iterator over rows filtered by xmin
    pub fn new(stream: StreamKey, rows: RowStream, current: XminStatus) -> Self {
        Self {
            stream,
            rows,
            current,
            exhausted: false,
            ended_early: None,
            emitted: 0,
        }
    }
}

#[async_trait]
impl RecordIterator for XminIterator {
    async fn next_record(&mut self) -> Result<Option<RecordMessage>> {
        if self.exhausted || self.ended_early.is_some() {
            return Ok(None);
        }

        match self.rows.next().await {
            Some(Ok(data)) => {
                self.emitted += 1;
                Ok(Some(RecordMessage::new(self.stream.clone(), data)))
            }
            Some(Err(e)) if !e.is_fatal() => {
                tracing::warn!("Stream '{}' ended early: {e}", self.stream);
                self.ended_early = Some(e.to_string());
                Ok(None)
            }
            Some(Err(e)) => Err(e),
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> Result<ReadOutcome> {
        tracing::info!("Xmin stream '{}': {} rows", self.stream, self.emitted);

        if let Some(reason) = self.ended_early.take() {
            return Ok(ReadOutcome::EndedEarly { reason });
        }
        if !self.exhausted {
            return Ok(ReadOutcome::EndedEarly {
                reason: "closed before all rows were read".to_string(),
            });
        }
        Ok(ReadOutcome::Exhausted(Some(StreamIncrementalState::Xmin(
            self.current,
        ))))
    }
}
