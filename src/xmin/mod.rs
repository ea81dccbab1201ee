//! Xmin incremental strategy
//!
//! Uses PostgreSQL's per-row `xmin` transaction id as a cursor. The current
//! snapshot is taken once at sync start and becomes every stream's
//! checkpoint, since rows committed later may or may not have been read.

mod iterator;
mod status;

pub use iterator::XminIterator;
pub use status::{XminQueryPlan, XminStatus};

use crate::config::{ConfiguredCatalog, ConfiguredStream};
use crate::engine::{CheckpointScope, IncrementalStrategy, RecordIterator, RowStream};
use crate::error::{Error, Result};
use crate::state::{CheckpointMessage, StateManager, StreamIncrementalState};
use async_trait::async_trait;
use std::sync::Arc;

/// Query collaborator for xmin syncs
#[async_trait]
pub trait XminQueries: Send + Sync {
    /// Current snapshot xmin of the database
    async fn current_xmin(&self) -> Result<XminStatus>;

    /// Scan a stream's rows matching the plan
    async fn query_xmin(&self, stream: &ConfiguredStream, plan: &XminQueryPlan)
        -> Result<RowStream>;
}

/// Incremental strategy over transaction ids
pub struct XminDriver {
    queries: Arc<dyn XminQueries>,
    catalog: ConfiguredCatalog,
    state: StateManager,
    current: Option<XminStatus>,
}

impl XminDriver {
    /// Create a driver over a query collaborator
    pub fn new(queries: Arc<dyn XminQueries>) -> Self {
        Self {
            queries,
            catalog: ConfiguredCatalog::default(),
            state: StateManager::new(),
            current: None,
        }
    }

    /// Status captured at sync start
    pub fn current_status(&self) -> Option<XminStatus> {
        self.current
    }
}

#[async_trait]
impl IncrementalStrategy for XminDriver {
    async fn compute_baseline(
        &mut self,
        catalog: &ConfiguredCatalog,
        prior: &[CheckpointMessage],
    ) -> Result<Vec<CheckpointScope>> {
        self.state = StateManager::from_prior(prior)?;
        self.catalog = catalog.clone();

        let current = self.queries.current_xmin().await?;
        tracing::info!(
            "Current xmin: xid {} after {} wraparound(s)",
            current.xmin_xid_value,
            current.num_wraparound
        );
        self.current = Some(current);

        Ok(catalog
            .incremental_streams()
            .map(|stream| CheckpointScope::Stream(stream.key()))
            .collect())
    }

    async fn stream_records(&mut self, scope: &CheckpointScope) -> Result<Box<dyn RecordIterator>> {
        let CheckpointScope::Stream(key) = scope else {
            return Err(Error::config("Xmin reads are per stream"));
        };
        let current = self
            .current
            .ok_or_else(|| Error::state("Xmin baseline was not computed"))?;
        let stream = self
            .catalog
            .find(key)
            .ok_or_else(|| Error::StreamNotFound {
                stream: key.to_string(),
            })?;

        let previous = match self.state.stream_state(key) {
            Some(StreamIncrementalState::Xmin(status)) => Some(*status),
            Some(StreamIncrementalState::MagicSync(_)) => {
                tracing::warn!(
                    "Stream '{key}' has MagicSync state from a previous run, reading all rows"
                );
                None
            }
            None => None,
        };
        let plan = XminQueryPlan::plan(previous.as_ref(), &current);
        tracing::debug!("Xmin plan for '{key}': {plan:?}");

        let rows = self.queries.query_xmin(stream, &plan).await?;
        Ok(Box::new(XminIterator::new(key.clone(), rows, current)))
    }

    async fn emit_checkpoint(
        &mut self,
        scope: &CheckpointScope,
        folded: Option<StreamIncrementalState>,
    ) -> Result<CheckpointMessage> {
        let CheckpointScope::Stream(key) = scope else {
            return Err(Error::checkpoint("Xmin checkpoints are per stream"));
        };
        let Some(state @ StreamIncrementalState::Xmin(_)) = folded else {
            return Err(Error::checkpoint(format!(
                "No xmin status was recorded for stream '{key}'"
            )));
        };

        self.state.update_stream_state(key.clone(), state);
        self.state.emit_stream_checkpoint(key)
    }
}

#[cfg(test)]
mod tests;
