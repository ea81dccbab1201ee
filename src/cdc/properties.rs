//! Log engine configuration
//!
//! Only the keys that affect correctness are owned here. Everything else the
//! user configures is passed through untouched.

use super::offset::OffsetStore;
use crate::config::CdcConfig;
use crate::types::StreamKey;
use std::collections::BTreeMap;

/// Engine name property
pub const NAME: &str = "name";
/// Replication slot property
pub const SLOT_NAME: &str = "slot.name";
/// Publication property
pub const PUBLICATION_NAME: &str = "publication.name";
/// Table allow-list property
pub const TABLE_INCLUDE_LIST: &str = "table.include.list";
/// Snapshot mode property
pub const SNAPSHOT_MODE: &str = "snapshot.mode";
/// Offset file property
pub const OFFSET_FILE: &str = "offset.storage.file.filename";
/// Offset flush interval property
pub const OFFSET_FLUSH_INTERVAL_MS: &str = "offset.flush.interval.ms";

const OWNED_KEYS: [&str; 7] = [
    NAME,
    SLOT_NAME,
    PUBLICATION_NAME,
    TABLE_INCLUDE_LIST,
    SNAPSHOT_MODE,
    OFFSET_FILE,
    OFFSET_FLUSH_INTERVAL_MS,
];

/// Key-value configuration handed to the log engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineProperties(BTreeMap<String, String>);

impl EngineProperties {
    /// Build engine properties for a sync
    ///
    /// `seeded` tells whether a previous offset is handed to the engine; the
    /// initial snapshot only runs when it is not.
    pub fn build(
        config: &CdcConfig,
        streams: &[StreamKey],
        offsets: &OffsetStore,
        seeded: bool,
    ) -> Self {
        let mut properties = BTreeMap::new();
        for (key, value) in &config.engine_properties {
            if OWNED_KEYS.contains(&key.as_str()) {
                tracing::warn!("Ignoring engine property '{key}', it is managed by the connector");
                continue;
            }
            properties.insert(key.clone(), value.clone());
        }

        properties.insert(NAME.to_string(), config.replication_slot.clone());
        properties.insert(SLOT_NAME.to_string(), config.replication_slot.clone());
        properties.insert(PUBLICATION_NAME.to_string(), config.publication.clone());
        properties.insert(TABLE_INCLUDE_LIST.to_string(), table_include_list(streams));
        properties.insert(
            SNAPSHOT_MODE.to_string(),
            if seeded { "never" } else { "initial" }.to_string(),
        );
        properties.insert(
            OFFSET_FILE.to_string(),
            offsets.path().display().to_string(),
        );
        properties.insert(OFFSET_FLUSH_INTERVAL_MS.to_string(), "1000".to_string());

        Self(properties)
    }

    /// Get a property
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Iterate over all properties
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

/// Escaped `namespace\.name` entries, comma separated
fn table_include_list(streams: &[StreamKey]) -> String {
    streams
        .iter()
        .map(|key| {
            let name = escape_dots(&key.name);
            match &key.namespace {
                Some(ns) => format!("{}\\.{name}", escape_dots(ns)),
                None => name,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn escape_dots(part: &str) -> String {
    part.replace('.', "\\.")
}
