//! Change data capture
//!
//! Reads row changes from the database's transaction log through an external
//! log engine.
//!
//! # Overview
//!
//! ```text
//! ┌────────────┐  EventSink   ┌────────────┐  next()   ┌────────────────────┐
//! │ LogEngine  │ ───────────▶ │ EventQueue │ ────────▶ │ ChangeEventIterator│
//! │ (own task) │              │ (bounded)  │           │ (target position)  │
//! └─────┬──────┘              └────────────┘           └─────────┬──────────┘
//!       │ commit                                                 │ close()
//!       ▼                                                        ▼
//! ┌────────────┐        read_after_close          ┌──────────────────────┐
//! │OffsetStore │ ───────────────────────────────▶ │ GLOBAL checkpoint    │
//! └────────────┘                                   └──────────────────────┘
//! ```
//!
//! The offset store is only read after the producer has confirmed it
//! stopped, so the checkpoint never reflects a half-written commit.

mod consumer;
mod event;
mod offset;
mod position;
mod producer;
mod properties;
mod queue;

pub use consumer::{CdcStats, ChangeEventIterator, CloseReason};
pub use event::{ChangeEvent, ChangeOp, SnapshotPhase};
pub use offset::{OffsetSnapshot, OffsetStore, OffsetWriter};
pub use position::{
    CdcMetadata, Lsn, PostgresCdcMetadata, TargetPosition, TargetPositionSource,
    CDC_DELETED_AT_COLUMN, CDC_LSN_COLUMN, CDC_UPDATED_AT_COLUMN,
};
pub use producer::{EngineContext, LogEngine, LogEventProducer, ProducerStatus, ShutdownSignal};
pub use properties::EngineProperties;
pub use queue::{event_queue, EventQueue, EventSink, Poll, DEFAULT_QUEUE_CAPACITY};

use crate::config::{CdcConfig, CdcReadOptions, ConfiguredCatalog};
use crate::engine::{
    CheckpointScope, IncrementalStrategy, ReadOutcome, RecordIterator, RecordMessage,
};
use crate::error::{Error, Result};
use crate::state::{CheckpointMessage, StateManager, StreamIncrementalState};
use crate::types::StreamKey;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

// ============================================================================
// CDC Driver
// ============================================================================

/// Incremental strategy backed by a log engine
///
/// One sync covers every incremental stream at once and ends with a single
/// GLOBAL checkpoint.
pub struct CdcDriver<M: CdcMetadata = PostgresCdcMetadata> {
    config: CdcConfig,
    options: CdcReadOptions,
    metadata: Arc<M>,
    engine: Option<Box<dyn LogEngine>>,
    position_source: Arc<dyn TargetPositionSource<M::Position>>,
    offsets: OffsetStore,
    state: StateManager,
    streams: Vec<StreamKey>,
    producer: Option<Arc<LogEventProducer>>,
}

impl CdcDriver<PostgresCdcMetadata> {
    /// Create a driver for PostgreSQL logical decoding
    pub fn new(
        config: CdcConfig,
        engine: Box<dyn LogEngine>,
        position_source: Arc<dyn TargetPositionSource<Lsn>>,
    ) -> Self {
        Self::with_metadata(config, PostgresCdcMetadata, engine, position_source)
    }
}

impl<M: CdcMetadata> CdcDriver<M> {
    /// Create a driver for any engine integration
    pub fn with_metadata(
        config: CdcConfig,
        metadata: M,
        engine: Box<dyn LogEngine>,
        position_source: Arc<dyn TargetPositionSource<M::Position>>,
    ) -> Self {
        let options = config.read_options();
        let offsets = OffsetStore::for_slot(config.offset_dir(), &config.replication_slot);
        Self {
            config,
            options,
            metadata: Arc::new(metadata),
            engine: Some(engine),
            position_source,
            offsets,
            state: StateManager::new(),
            streams: Vec::new(),
            producer: None,
        }
    }

    /// Override the consumer timings
    #[must_use]
    pub fn with_read_options(mut self, options: CdcReadOptions) -> Self {
        self.options = options;
        self
    }

    /// Use a specific offset store
    #[must_use]
    pub fn with_offset_store(mut self, offsets: OffsetStore) -> Self {
        self.offsets = offsets;
        self
    }

    /// Offset store in use
    pub fn offset_store(&self) -> &OffsetStore {
        &self.offsets
    }
}

#[async_trait]
impl<M: CdcMetadata> IncrementalStrategy for CdcDriver<M> {
    async fn compute_baseline(
        &mut self,
        catalog: &ConfiguredCatalog,
        prior: &[CheckpointMessage],
    ) -> Result<Vec<CheckpointScope>> {
        self.state = StateManager::from_prior(prior)?;
        self.streams = catalog
            .incremental_streams()
            .map(crate::config::ConfiguredStream::key)
            .collect();

        if self.streams.is_empty() {
            tracing::info!("No incremental streams selected, skipping CDC read");
            return Ok(Vec::new());
        }

        tracing::info!(
            "CDC sync over {} stream(s), {}",
            self.streams.len(),
            if self.state.cdc_offset().is_some() {
                "resuming from saved offset"
            } else {
                "starting with initial snapshot"
            }
        );
        Ok(vec![CheckpointScope::Global(self.streams.clone())])
    }

    async fn stream_records(&mut self, scope: &CheckpointScope) -> Result<Box<dyn RecordIterator>> {
        if !matches!(scope, CheckpointScope::Global(_)) {
            return Err(Error::config("CDC reads only support the global scope"));
        }
        let engine = self
            .engine
            .take()
            .ok_or_else(|| Error::engine("Log engine was already started for this sync"))?;

        let target = self.position_source.target_position().await?;

        let seed = self.state.cdc_offset().cloned();
        self.offsets.seed(seed.as_ref()).await?;
        let properties =
            EngineProperties::build(&self.config, &self.streams, &self.offsets, seed.is_some());

        let (sink, queue) = event_queue(self.options.queue_capacity);
        let producer = Arc::new(LogEventProducer::start(
            engine,
            properties,
            seed,
            self.offsets.writer(),
            sink,
        ));
        self.producer = Some(Arc::clone(&producer));

        let consumer = ChangeEventIterator::new(
            producer,
            queue,
            Arc::clone(&self.metadata),
            target,
            self.options,
        );
        Ok(Box::new(CdcRecordIterator {
            consumer,
            streams: self.streams.iter().cloned().collect(),
        }))
    }

    async fn emit_checkpoint(
        &mut self,
        scope: &CheckpointScope,
        _folded: Option<StreamIncrementalState>,
    ) -> Result<CheckpointMessage> {
        let CheckpointScope::Global(streams) = scope else {
            return Err(Error::checkpoint("CDC checkpoints are global"));
        };
        let producer = self
            .producer
            .as_ref()
            .ok_or_else(|| Error::checkpoint("Log engine was never started"))?;

        let offset = self.offsets.read_after_close(producer.as_ref()).await?;
        if offset.is_empty() {
            return Err(Error::checkpoint("Log engine committed no offset"));
        }
        self.state.set_cdc_offset(offset);
        self.state.emit_global_checkpoint(streams)
    }
}

/// Turns change events of selected streams into records
struct CdcRecordIterator<M: CdcMetadata> {
    consumer: ChangeEventIterator<M>,
    streams: BTreeSet<StreamKey>,
}

#[async_trait]
impl<M: CdcMetadata> RecordIterator for CdcRecordIterator<M> {
    async fn next_record(&mut self) -> Result<Option<RecordMessage>> {
        while let Some(event) = self.consumer.next().await? {
            if !self.streams.contains(&event.stream) {
                tracing::debug!("Skipping change event for unselected stream '{}'", event.stream);
                continue;
            }
            if let Some(data) = self.consumer.metadata().to_record(&event) {
                return Ok(Some(RecordMessage::new(event.stream, data)));
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<ReadOutcome> {
        self.consumer.close().await?;
        Ok(ReadOutcome::Exhausted(None))
    }
}
