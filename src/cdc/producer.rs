//! Log event producer
//!
//! Runs the external log engine on its own tokio task and tracks whether it
//! has stopped. The engine keeps committing offsets until it returns.

use super::offset::{OffsetSnapshot, OffsetWriter};
use super::properties::EngineProperties;
use super::queue::EventSink;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

// ============================================================================
// Engine Seam
// ============================================================================

/// Everything a log engine needs for one sync
#[derive(Debug)]
pub struct EngineContext {
    /// Engine configuration
    pub properties: EngineProperties,
    /// Offsets of the previous run, if any
    pub offset_seed: Option<OffsetSnapshot>,
    /// Where to commit offsets
    pub offsets: OffsetWriter,
    /// Where to push change events
    pub sink: EventSink,
    /// Fires when the connector asks the engine to stop
    pub shutdown: ShutdownSignal,
}

/// An external change-log reading engine
///
/// `run` returns once the engine has stopped. Returning an error is the
/// engine's terminal failure callback; it is re-raised by
/// [`LogEventProducer::close`].
#[async_trait]
pub trait LogEngine: Send + 'static {
    /// Read the log until shutdown is requested or a fatal error occurs
    async fn run(self: Box<Self>, ctx: EngineContext) -> Result<()>;
}

/// Receiving side of a shutdown request
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Check if shutdown has been requested
    pub fn is_requested(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait until shutdown is requested
    pub async fn requested(&mut self) {
        // A dropped sender also means stop
        let _ = self.receiver.wait_for(|requested| *requested).await;
    }
}

/// Whether a producer has fully stopped
pub trait ProducerStatus {
    /// True only after the engine has returned
    fn has_closed(&self) -> bool;
}

// ============================================================================
// Producer
// ============================================================================

/// Handle to a running log engine
#[derive(Debug)]
pub struct LogEventProducer {
    shutdown: watch::Sender<bool>,
    closed: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl LogEventProducer {
    /// Start the engine on a new task; returns immediately
    pub fn start(
        engine: Box<dyn LogEngine>,
        properties: EngineProperties,
        offset_seed: Option<OffsetSnapshot>,
        offsets: OffsetWriter,
        sink: EventSink,
    ) -> Self {
        let (shutdown, receiver) = watch::channel(false);
        let closed = Arc::new(AtomicBool::new(false));
        let ctx = EngineContext {
            properties,
            offset_seed,
            offsets,
            sink,
            shutdown: ShutdownSignal { receiver },
        };

        let task_closed = Arc::clone(&closed);
        let task = tokio::spawn(async move {
            tracing::info!("Starting log engine");
            let result = engine.run(ctx).await;
            task_closed.store(true, Ordering::SeqCst);
            match result {
                Ok(()) => {
                    tracing::info!("Log engine stopped");
                    Ok(())
                }
                Err(Error::ConsumerClosed) => {
                    tracing::debug!("Log engine stopped after the consumer closed");
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("Log engine terminated with error: {e}");
                    Err(e)
                }
            }
        });

        Self {
            shutdown,
            closed,
            task: Mutex::new(Some(task)),
        }
    }

    /// Ask the engine to stop without waiting
    pub fn request_close(&self) {
        self.shutdown.send_replace(true);
    }

    /// Stop the engine and wait until it has returned
    ///
    /// The first caller joins the engine task and gets its terminal error, if
    /// any. Concurrent callers wait for that join; later callers return Ok.
    pub async fn close(&self) -> Result<()> {
        self.request_close();

        let mut task = self.task.lock().await;
        let Some(handle) = task.take() else {
            return Ok(());
        };

        let joined = handle.await;
        self.closed.store(true, Ordering::SeqCst);

        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e @ Error::Engine { .. })) => Err(e),
            Ok(Err(e)) => Err(Error::engine(e.to_string())),
            Err(e) if e.is_panic() => Err(Error::engine("log engine panicked")),
            Err(e) => Err(Error::engine(format!("log engine task failed: {e}"))),
        }
    }
}

impl ProducerStatus for LogEventProducer {
    fn has_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for LogEventProducer {
    fn drop(&mut self) {
        self.request_close();
    }
}
