//! Execution engine module
//!
//! The read loop shared by every incremental strategy.
//!
//! # Overview
//!
//! The engine module provides:
//! - `IncrementalStrategy` - Baseline, record stream and checkpoint of one strategy
//! - `IncrementalDriver` - The strategy selected for a sync
//! - `read_incremental` - Drives a strategy and yields messages in order
//! - Message types for output (Record, State, Log, Trace)
//!
//! For every scope the loop emits `Started`, the scope's records, then its
//! checkpoint and `Complete`. A scope that ended early gets a warning and
//! `Incomplete` instead, without a checkpoint.

mod types;

pub use types::{Message, MessageStream, RecordMessage, StreamStatus, SyncStats};

use crate::cdc::{CdcDriver, CdcMetadata, LogEngine, PostgresCdcMetadata};
use crate::config::{ConfiguredCatalog, ReplicationMethod, SourceConfig};
use crate::database::DatabaseEngine;
use crate::error::{Error, Result};
use crate::magic_sync::MagicSyncDriver;
use crate::state::{CheckpointMessage, StreamIncrementalState};
use crate::types::{JsonObject, StreamKey};
use crate::xmin::XminDriver;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::VecDeque;
use std::sync::Arc;

/// Lazy row sequence returned by query collaborators
pub type RowStream = BoxStream<'static, Result<JsonObject>>;

// ============================================================================
// Strategy Contract
// ============================================================================

/// What a checkpoint covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointScope {
    /// All listed streams share one checkpoint
    Global(Vec<StreamKey>),
    /// One stream, one checkpoint
    Stream(StreamKey),
}

impl CheckpointScope {
    /// Streams covered by this scope
    pub fn streams(&self) -> &[StreamKey] {
        match self {
            Self::Global(streams) => streams,
            Self::Stream(key) => std::slice::from_ref(key),
        }
    }
}

/// How a record iterator finished
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// Every row was read; carries the state to checkpoint, if the strategy
    /// keeps per-stream state
    Exhausted(Option<StreamIncrementalState>),
    /// Reading stopped before the end; no checkpoint may be emitted
    EndedEarly {
        /// Why reading stopped
        reason: String,
    },
}

/// Records of one scope
#[async_trait]
pub trait RecordIterator: Send {
    /// Next record, or None at the end
    async fn next_record(&mut self) -> Result<Option<RecordMessage>>;

    /// Release the source and report how reading ended
    async fn close(&mut self) -> Result<ReadOutcome>;
}

/// One incremental strategy
#[async_trait]
pub trait IncrementalStrategy: Send {
    /// Load the previous run's state and decide which scopes to read
    async fn compute_baseline(
        &mut self,
        catalog: &ConfiguredCatalog,
        prior: &[CheckpointMessage],
    ) -> Result<Vec<CheckpointScope>>;

    /// Start reading a scope
    async fn stream_records(&mut self, scope: &CheckpointScope) -> Result<Box<dyn RecordIterator>>;

    /// Build the terminal checkpoint of a fully read scope
    async fn emit_checkpoint(
        &mut self,
        scope: &CheckpointScope,
        folded: Option<StreamIncrementalState>,
    ) -> Result<CheckpointMessage>;
}

// ============================================================================
// Strategy Selection
// ============================================================================

/// The strategy chosen for a sync
pub enum IncrementalDriver<M: CdcMetadata = PostgresCdcMetadata> {
    /// Transaction log via a log engine
    Cdc(CdcDriver<M>),
    /// Row fingerprints
    MagicSync(MagicSyncDriver),
    /// Transaction ids
    Xmin(XminDriver),
}

impl IncrementalDriver<PostgresCdcMetadata> {
    /// Select the strategy configured for a source
    ///
    /// CDC additionally needs the log engine to run.
    pub fn from_config(
        config: &SourceConfig,
        database: Arc<DatabaseEngine>,
        log_engine: Option<Box<dyn LogEngine>>,
    ) -> Result<Self> {
        let driver = match &config.replication_method {
            ReplicationMethod::Cdc(cdc) => {
                let engine = log_engine.ok_or_else(|| {
                    Error::config("CDC replication needs an embedded log engine")
                })?;
                Self::Cdc(CdcDriver::new(cdc.clone(), engine, database))
            }
            ReplicationMethod::MagicSync => Self::MagicSync(MagicSyncDriver::new(database)),
            ReplicationMethod::Xmin => Self::Xmin(XminDriver::new(database)),
        };
        tracing::info!("Using {} replication", driver.name());
        Ok(driver)
    }
}

impl<M: CdcMetadata> IncrementalDriver<M> {
    /// Strategy name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cdc(_) => "CDC",
            Self::MagicSync(_) => "MagicSync",
            Self::Xmin(_) => "Xmin",
        }
    }
}

#[async_trait]
impl<M: CdcMetadata> IncrementalStrategy for IncrementalDriver<M> {
    async fn compute_baseline(
        &mut self,
        catalog: &ConfiguredCatalog,
        prior: &[CheckpointMessage],
    ) -> Result<Vec<CheckpointScope>> {
        match self {
            Self::Cdc(driver) => driver.compute_baseline(catalog, prior).await,
            Self::MagicSync(driver) => driver.compute_baseline(catalog, prior).await,
            Self::Xmin(driver) => driver.compute_baseline(catalog, prior).await,
        }
    }

    async fn stream_records(&mut self, scope: &CheckpointScope) -> Result<Box<dyn RecordIterator>> {
        match self {
            Self::Cdc(driver) => driver.stream_records(scope).await,
            Self::MagicSync(driver) => driver.stream_records(scope).await,
            Self::Xmin(driver) => driver.stream_records(scope).await,
        }
    }

    async fn emit_checkpoint(
        &mut self,
        scope: &CheckpointScope,
        folded: Option<StreamIncrementalState>,
    ) -> Result<CheckpointMessage> {
        match self {
            Self::Cdc(driver) => driver.emit_checkpoint(scope, folded).await,
            Self::MagicSync(driver) => driver.emit_checkpoint(scope, folded).await,
            Self::Xmin(driver) => driver.emit_checkpoint(scope, folded).await,
        }
    }
}

// ============================================================================
// Read Loop
// ============================================================================

/// Drive a strategy over a catalog and stream the resulting messages
///
/// The stream ends after the first error. Dropping it closes whatever source
/// is still open.
pub fn read_incremental<S>(
    strategy: S,
    catalog: ConfiguredCatalog,
    prior: Vec<CheckpointMessage>,
) -> MessageStream
where
    S: IncrementalStrategy + 'static,
{
    let state = ReadLoop {
        strategy,
        catalog,
        prior,
        baseline_done: false,
        done: false,
        scopes: VecDeque::new(),
        current: None,
        pending: VecDeque::new(),
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        state.step().await.map(|item| (item, state))
    }))
}

struct ReadLoop<S> {
    strategy: S,
    catalog: ConfiguredCatalog,
    prior: Vec<CheckpointMessage>,
    baseline_done: bool,
    done: bool,
    scopes: VecDeque<CheckpointScope>,
    current: Option<(CheckpointScope, Box<dyn RecordIterator>)>,
    pending: VecDeque<Message>,
}

impl<S: IncrementalStrategy> ReadLoop<S> {
    async fn step(&mut self) -> Option<Result<Message>> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Some(Ok(message));
            }
            match self.advance().await {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => {
                    tracing::error!("Incremental read failed: {e}");
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }

    /// Make progress; false once everything has been read
    async fn advance(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }

        if !self.baseline_done {
            let scopes = self
                .strategy
                .compute_baseline(&self.catalog, &self.prior)
                .await?;
            self.scopes = scopes.into();
            self.baseline_done = true;
            return Ok(true);
        }

        if let Some((scope, mut records)) = self.current.take() {
            match records.next_record().await {
                Ok(Some(record)) => {
                    self.pending.push_back(Message::Record { record });
                    self.current = Some((scope, records));
                }
                Ok(None) => self.finish_scope(&scope, records.as_mut()).await?,
                Err(e) => {
                    if let Err(close_err) = records.close().await {
                        tracing::debug!("Ignoring close error after failure: {close_err}");
                    }
                    return Err(e);
                }
            }
            return Ok(true);
        }

        if let Some(scope) = self.scopes.pop_front() {
            let records = self.strategy.stream_records(&scope).await?;
            for key in scope.streams() {
                tracing::info!("Reading stream '{key}'");
                self.pending
                    .push_back(Message::trace(key.clone(), StreamStatus::Started));
            }
            self.current = Some((scope, records));
            return Ok(true);
        }

        self.done = true;
        Ok(false)
    }

    async fn finish_scope(
        &mut self,
        scope: &CheckpointScope,
        records: &mut dyn RecordIterator,
    ) -> Result<()> {
        match records.close().await? {
            ReadOutcome::Exhausted(folded) => {
                let checkpoint = self.strategy.emit_checkpoint(scope, folded).await?;
                self.pending.push_back(Message::state(checkpoint));
                for key in scope.streams() {
                    self.pending
                        .push_back(Message::trace(key.clone(), StreamStatus::Complete));
                }
            }
            ReadOutcome::EndedEarly { reason } => {
                for key in scope.streams() {
                    tracing::warn!("Stream '{key}' ended early, no checkpoint emitted: {reason}");
                    self.pending.push_back(Message::warn(format!(
                        "Stream '{key}' ended early: {reason}"
                    )));
                    self.pending
                        .push_back(Message::trace(key.clone(), StreamStatus::Incomplete));
                }
            }
        }
        Ok(())
    }
}
