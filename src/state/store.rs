//! File-backed checkpoint store
//!
//! Stands in for the orchestrator when the connector runs standalone: keeps
//! the latest checkpoint per scope in a JSON file with atomic writes.

use super::types::CheckpointMessage;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Persists the latest checkpoint of every scope between runs
#[derive(Debug, Clone)]
pub struct StateStore {
    /// Path to the state file
    path: PathBuf,
}

impl StateStore {
    /// Create a store at the given path
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Get the state file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load checkpoints; a missing file means no prior state
    pub fn load(&self) -> Result<Vec<CheckpointMessage>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let contents = std::fs::read_to_string(&self.path).map_err(|e| Error::State {
            message: format!("Failed to read state file: {e}"),
        })?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&contents).map_err(|e| Error::State {
            message: format!("Failed to parse state file: {e}"),
        })
    }

    /// Save checkpoints, replacing the file contents
    pub async fn save(&self, messages: &[CheckpointMessage]) -> Result<()> {
        let contents = serde_json::to_string_pretty(messages).map_err(|e| Error::State {
            message: format!("Failed to serialize state: {e}"),
        })?;

        // Write to temp file first, then rename for atomicity
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &contents)
            .await
            .map_err(|e| Error::State {
                message: format!("Failed to write state file: {e}"),
            })?;

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| Error::State {
                message: format!("Failed to rename state file: {e}"),
            })?;

        Ok(())
    }

    /// Merge new checkpoints into the stored ones and save
    pub async fn merge(&self, updates: Vec<CheckpointMessage>) -> Result<Vec<CheckpointMessage>> {
        let merged = merge_checkpoints(self.load()?, updates);
        self.save(&merged).await?;
        Ok(merged)
    }
}

/// Replace checkpoints of the same scope, keeping the rest
pub fn merge_checkpoints(
    existing: Vec<CheckpointMessage>,
    updates: Vec<CheckpointMessage>,
) -> Vec<CheckpointMessage> {
    let mut merged = existing;
    for update in updates {
        let same_scope = |m: &CheckpointMessage| {
            if update.is_global() {
                m.is_global()
            } else {
                !m.is_global() && m.stream_key() == update.stream_key()
            }
        };
        merged.retain(|m| !same_scope(m));
        merged.push(update);
    }
    merged
}
