//! Log event consumer
//!
//! Drains the event queue until the producer has stopped and the queue is
//! empty. Stopping is decided by comparing each event's position against the
//! target position; poll timeouts only request a close so a stalled engine
//! cannot hang the sync.

use super::event::ChangeEvent;
use super::position::{CdcMetadata, TargetPosition};
use super::producer::{LogEventProducer, ProducerStatus};
use super::queue::{EventQueue, Poll};
use crate::config::CdcReadOptions;
use crate::error::Result;
use std::fmt;
use std::sync::Arc;

/// Why the consumer asked the producer to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// No event arrived within the poll timeout
    TimeoutWaitingForData,
    /// An event reached the target position
    RecordReachedTargetPosition,
    /// The engine stopped on its own
    EngineStopped,
    /// The consumer was closed before reaching the target
    ConsumerClosed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::TimeoutWaitingForData => "timed out waiting for data",
            Self::RecordReachedTargetPosition => "record reached target position",
            Self::EngineStopped => "log engine stopped",
            Self::ConsumerClosed => "consumer closed",
        };
        f.write_str(reason)
    }
}

/// Counters of one CDC read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CdcStats {
    /// Events taken off the queue
    pub events_received: u64,
    /// Events produced by the engine's snapshot
    pub snapshot_events: u64,
    /// Events that reached the target position
    pub events_at_target: u64,
}

/// Pull-based iterator over change events
pub struct ChangeEventIterator<M: CdcMetadata> {
    producer: Arc<LogEventProducer>,
    queue: EventQueue,
    metadata: Arc<M>,
    target: TargetPosition<M::Position>,
    options: CdcReadOptions,
    close_reason: Option<CloseReason>,
    stats: CdcStats,
    finished: bool,
    closed: bool,
}

impl<M: CdcMetadata> ChangeEventIterator<M> {
    /// Create a consumer over a started producer
    pub fn new(
        producer: Arc<LogEventProducer>,
        queue: EventQueue,
        metadata: Arc<M>,
        target: TargetPosition<M::Position>,
        options: CdcReadOptions,
    ) -> Self {
        Self {
            producer,
            queue,
            metadata,
            target,
            options,
            close_reason: None,
            stats: CdcStats::default(),
            finished: false,
            closed: false,
        }
    }

    /// Next event, or None once the producer has stopped and the queue is drained
    ///
    /// A fatal engine error is returned here when the sequence ends.
    pub async fn next(&mut self) -> Result<Option<ChangeEvent>> {
        if self.finished {
            return Ok(None);
        }

        while !self.producer.has_closed() || !self.queue.is_empty() {
            let wait = if self.stats.events_received == 0 {
                self.options.first_record_wait
            } else {
                self.options.poll_timeout
            };

            match self.queue.poll(wait).await {
                Poll::TimedOut => {
                    tracing::info!(
                        "No change event within {wait:?}, requesting log engine shutdown"
                    );
                    self.request_close(CloseReason::TimeoutWaitingForData);
                }
                Poll::Closed => break,
                Poll::Event(event) => {
                    self.stats.events_received += 1;
                    if self.metadata.snapshot_phase(&event).is_in_progress() {
                        self.stats.snapshot_events += 1;
                    }
                    if self.should_signal_close(&event)? {
                        self.request_close(CloseReason::RecordReachedTargetPosition);
                    }
                    return Ok(Some(event));
                }
            }
        }

        self.finished = true;
        self.close().await?;
        Ok(None)
    }

    /// Whether this event means the sync has caught up
    ///
    /// Snapshot rows carry the position of the snapshot start, so an
    /// in-progress snapshot row never stops the read even at the target.
    pub fn should_signal_close(&mut self, event: &ChangeEvent) -> Result<bool> {
        let position = self.metadata.position(event)?;
        if !self.target.reached_by(&position) {
            return Ok(false);
        }

        self.stats.events_at_target += 1;
        Ok(!self.metadata.snapshot_phase(event).is_in_progress())
    }

    fn request_close(&mut self, reason: CloseReason) {
        if self.close_reason.is_none() {
            tracing::info!("Requesting log engine shutdown: {reason}");
            self.close_reason = Some(reason);
        }
        self.producer.request_close();
    }

    /// Close the queue and wait for the producer to stop
    ///
    /// Safe to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.queue.close();
        if self.close_reason.is_none() {
            let reason = if self.producer.has_closed() {
                CloseReason::EngineStopped
            } else {
                CloseReason::ConsumerClosed
            };
            self.request_close(reason);
        }
        self.finished = true;

        let result = self.producer.close().await;
        tracing::info!(
            "CDC read finished ({}): {} events, {} from snapshot",
            self.close_reason.unwrap_or(CloseReason::ConsumerClosed),
            self.stats.events_received,
            self.stats.snapshot_events
        );
        result
    }

    /// Why the producer was asked to stop, if it was
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// Counters so far
    pub fn stats(&self) -> CdcStats {
        self.stats
    }

    /// Metadata capability in use
    pub fn metadata(&self) -> &M {
        &self.metadata
    }

    /// The producer this consumer drives
    pub fn producer(&self) -> &Arc<LogEventProducer> {
        &self.producer
    }
}

impl<M: CdcMetadata> Drop for ChangeEventIterator<M> {
    fn drop(&mut self) {
        self.queue.close();
        self.producer.request_close();
    }
}
