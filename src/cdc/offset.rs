//! Offset store shared between the log engine and the CDC driver
//!
//! The engine commits its read position continuously through an
//! [`OffsetWriter`]. The driver reads the store exactly once, after the
//! producer has confirmed it stopped.

use super::producer::ProducerStatus;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Opaque engine offsets, string keys to string values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OffsetSnapshot(BTreeMap<String, String>);

impl OffsetSnapshot {
    /// Create an empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an offset entry
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Get an offset entry
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if no offset was recorded
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over entries
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl FromIterator<(String, String)> for OffsetSnapshot {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// File-backed offset store for one sync
#[derive(Debug, Clone)]
pub struct OffsetStore {
    path: PathBuf,
}

impl OffsetStore {
    /// Create a store at the given file path
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Store for a replication slot inside `dir`
    pub fn for_slot(dir: impl AsRef<Path>, slot: &str) -> Self {
        Self::new(dir.as_ref().join(format!("offset-{slot}.json")))
    }

    /// Get the offset file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Prepare the store before the engine starts
    ///
    /// Writes the previous run's offsets, or removes any stale file when
    /// there are none.
    pub async fn seed(&self, offset: Option<&OffsetSnapshot>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::offset_store(format!("Failed to create offset directory: {e}"))
            })?;
        }

        match offset {
            Some(offset) => self.writer().commit(offset).await,
            None => match tokio::fs::remove_file(&self.path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::offset_store(format!(
                    "Failed to clear offset file: {e}"
                ))),
            },
        }
    }

    /// Writer handed to the log engine
    pub fn writer(&self) -> OffsetWriter {
        OffsetWriter {
            path: self.path.clone(),
        }
    }

    /// Read every offset once the producer has stopped
    ///
    /// Reading while the producer still runs could observe an in-flight
    /// commit, so that is refused.
    pub async fn read_after_close(
        &self,
        producer: &impl ProducerStatus,
    ) -> Result<OffsetSnapshot> {
        if !producer.has_closed() {
            return Err(Error::offset_store(
                "Refusing to read offsets while the log engine is still running",
            ));
        }

        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(OffsetSnapshot::new())
            }
            Err(e) => {
                return Err(Error::offset_store(format!(
                    "Failed to read offset file: {e}"
                )))
            }
        };
        let offset: OffsetSnapshot = serde_json::from_str(&contents)
            .map_err(|e| Error::offset_store(format!("Failed to parse offset file: {e}")))?;

        tracing::info!(
            "Read {} offset entr{} from {}",
            offset.len(),
            if offset.len() == 1 { "y" } else { "ies" },
            self.path.display()
        );
        Ok(offset)
    }
}

/// Handle the log engine commits offsets through
#[derive(Debug, Clone)]
pub struct OffsetWriter {
    path: PathBuf,
}

impl OffsetWriter {
    /// Replace the stored offsets
    pub async fn commit(&self, offset: &OffsetSnapshot) -> Result<()> {
        let contents = serde_json::to_string(offset)?;

        // Write to temp file first, then rename for atomicity
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &contents)
            .await
            .map_err(|e| Error::offset_store(format!("Failed to write offset file: {e}")))?;

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| Error::offset_store(format!("Failed to rename offset file: {e}")))?;

        tracing::trace!("Committed {} offset entries", offset.len());
        Ok(())
    }
}
