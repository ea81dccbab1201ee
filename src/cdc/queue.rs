//! Bounded event queue between the log engine and the consumer

use super::event::ChangeEvent;
use crate::error::{Error, Result};
use std::time::Duration;
use tokio::sync::mpsc;

/// Default queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Create a bounded queue, returning the producer and consumer halves
pub fn event_queue(capacity: usize) -> (EventSink, EventQueue) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (EventSink { sender }, EventQueue { receiver })
}

/// Producer half, handed to the log engine
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::Sender<ChangeEvent>,
}

impl EventSink {
    /// Push an event, waiting while the queue is full
    ///
    /// Fails with [`Error::ConsumerClosed`] once the consumer has gone away;
    /// the engine should stop when it sees that.
    pub async fn publish(&self, event: ChangeEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| Error::ConsumerClosed)
    }

    /// Check if the consumer has closed the queue
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Result of one poll
#[derive(Debug)]
pub enum Poll {
    /// An event arrived
    Event(ChangeEvent),
    /// Nothing arrived within the timeout
    TimedOut,
    /// Every producer handle is gone and the queue is drained
    Closed,
}

/// Consumer half
#[derive(Debug)]
pub struct EventQueue {
    receiver: mpsc::Receiver<ChangeEvent>,
}

impl EventQueue {
    /// Wait up to `timeout` for the next event
    pub async fn poll(&mut self, timeout: Duration) -> Poll {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(event)) => Poll::Event(event),
            Ok(None) => Poll::Closed,
            Err(_) => Poll::TimedOut,
        }
    }

    /// Check if no event is buffered
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Number of buffered events
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Stop accepting events; a producer blocked on a full queue is released
    pub fn close(&mut self) {
        self.receiver.close();
    }
}
