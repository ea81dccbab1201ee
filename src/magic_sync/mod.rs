//! MagicSync incremental strategy
//!
//! Detects new and changed rows without a transaction log: every row carries
//! a key fingerprint and a value fingerprint, and rows whose pair matches the
//! previous run's filter are skipped.

mod filter;
mod iterator;

pub use filter::{FingerprintFilter, MembershipFilter};
pub use iterator::{MagicSyncIterator, KEY_HASH_COLUMN, VALUE_HASH_COLUMN};

use crate::config::{ConfiguredCatalog, ConfiguredStream};
use crate::engine::{CheckpointScope, IncrementalStrategy, RecordIterator, RowStream};
use crate::error::{Error, Result};
use crate::state::{CheckpointMessage, StateManager, StreamIncrementalState};
use async_trait::async_trait;
use std::sync::Arc;

/// Query collaborator for MagicSync
#[async_trait]
pub trait MagicSyncQueries: Send + Sync {
    /// Scan every selected column plus the two fingerprint columns
    async fn query_with_fingerprints(&self, stream: &ConfiguredStream) -> Result<RowStream>;
}

/// Incremental strategy comparing row fingerprints against the last run
pub struct MagicSyncDriver {
    queries: Arc<dyn MagicSyncQueries>,
    catalog: ConfiguredCatalog,
    state: StateManager,
}

impl MagicSyncDriver {
    /// Create a driver over a query collaborator
    pub fn new(queries: Arc<dyn MagicSyncQueries>) -> Self {
        Self {
            queries,
            catalog: ConfiguredCatalog::default(),
            state: StateManager::new(),
        }
    }
}

#[async_trait]
impl IncrementalStrategy for MagicSyncDriver {
    async fn compute_baseline(
        &mut self,
        catalog: &ConfiguredCatalog,
        prior: &[CheckpointMessage],
    ) -> Result<Vec<CheckpointScope>> {
        self.state = StateManager::from_prior(prior)?;
        self.catalog = catalog.clone();

        let scopes: Vec<CheckpointScope> = catalog
            .incremental_streams()
            .map(|stream| {
                let key = stream.key();
                match self.state.stream_state(&key) {
                    Some(StreamIncrementalState::MagicSync(filter)) => {
                        tracing::debug!("Stream '{key}' has {} prior fingerprints", filter.len());
                    }
                    Some(StreamIncrementalState::Xmin(_)) => {
                        tracing::warn!(
                            "Stream '{key}' has xmin state from a previous run, resyncing all rows"
                        );
                    }
                    None => tracing::debug!("Stream '{key}' has no prior state"),
                }
                CheckpointScope::Stream(key)
            })
            .collect();

        tracing::info!("MagicSync sync over {} stream(s)", scopes.len());
        Ok(scopes)
    }

    async fn stream_records(&mut self, scope: &CheckpointScope) -> Result<Box<dyn RecordIterator>> {
        let CheckpointScope::Stream(key) = scope else {
            return Err(Error::config("MagicSync reads are per stream"));
        };
        let stream = self
            .catalog
            .find(key)
            .ok_or_else(|| Error::StreamNotFound {
                stream: key.to_string(),
            })?;

        let previous = match self.state.take_stream_state(key) {
            Some(StreamIncrementalState::MagicSync(filter)) => filter,
            _ => FingerprintFilter::new(),
        };
        let rows = self.queries.query_with_fingerprints(stream).await?;
        Ok(Box::new(MagicSyncIterator::new(key.clone(), rows, previous)))
    }

    async fn emit_checkpoint(
        &mut self,
        scope: &CheckpointScope,
        folded: Option<StreamIncrementalState>,
    ) -> Result<CheckpointMessage> {
        let CheckpointScope::Stream(key) = scope else {
            return Err(Error::checkpoint("MagicSync checkpoints are per stream"));
        };
        let Some(state @ StreamIncrementalState::MagicSync(_)) = folded else {
            return Err(Error::checkpoint(format!(
                "No fingerprint filter was built for stream '{key}'"
            )));
        };

        self.state.update_stream_state(key.clone(), state);
        self.state.emit_stream_checkpoint(key)
    }
}
