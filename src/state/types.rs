//! Checkpoint types exchanged with the orchestrator
//!
//! These types are serialized to JSON, persisted by the orchestrator between
//! runs, and handed back as the previous state on the next sync.

use crate::cdc::OffsetSnapshot;
use crate::error::{Error, Result};
use crate::magic_sync::FingerprintFilter;
use crate::types::{JsonObject, JsonValue, StreamKey};
use crate::xmin::XminStatus;
use serde::{Deserialize, Serialize};

/// Version written into xmin stream states
pub const XMIN_STATE_VERSION: u32 = 2;

/// `state_type` tag of MagicSync stream states
pub const MAGIC_SYNC_STATE_TYPE: &str = "magic_sync";

/// `state_type` tag of xmin stream states
pub const XMIN_STATE_TYPE: &str = "xmin";

// ============================================================================
// Checkpoint Message
// ============================================================================

/// A checkpoint handed to the orchestrator for durable persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum CheckpointMessage {
    /// One shared log offset for the whole sync (CDC)
    Global {
        /// Shared state and the streams it covers
        global: GlobalState,
    },
    /// Terminal state of a single stream (MagicSync, Xmin)
    Stream {
        /// Stream descriptor and its state
        stream: StreamStateBlob,
    },
}

impl CheckpointMessage {
    /// Create a global checkpoint wrapping a log offset
    pub fn global(offset: &OffsetSnapshot, streams: &[StreamKey]) -> Result<Self> {
        let shared_state = serde_json::json!({ "state": offset });
        Ok(Self::Global {
            global: GlobalState {
                shared_state: Some(shared_state),
                stream_states: streams
                    .iter()
                    .map(|key| StreamStateBlob {
                        stream_descriptor: Some(key.clone()),
                        stream_state: None,
                    })
                    .collect(),
            },
        })
    }

    /// Create a stream checkpoint
    pub fn stream(key: &StreamKey, state: &StreamIncrementalState) -> Result<Self> {
        Ok(Self::Stream {
            stream: StreamStateBlob {
                stream_descriptor: Some(key.clone()),
                stream_state: Some(state.to_json()?),
            },
        })
    }

    /// Check if this is a global checkpoint
    pub fn is_global(&self) -> bool {
        matches!(self, Self::Global { .. })
    }

    /// Stream this checkpoint belongs to (None for global checkpoints)
    pub fn stream_key(&self) -> Option<StreamKey> {
        match self {
            Self::Global { .. } => None,
            Self::Stream { stream } => stream.key(),
        }
    }

    /// Offset carried by a global checkpoint
    pub fn offset(&self) -> Result<Option<OffsetSnapshot>> {
        let Self::Global { global } = self else {
            return Ok(None);
        };
        let Some(state) = global
            .shared_state
            .as_ref()
            .and_then(|shared| shared.get("state"))
            .filter(|state| !is_empty_state(state))
        else {
            return Ok(None);
        };
        let offset = serde_json::from_value(state.clone())
            .map_err(|e| Error::state(format!("Invalid CDC offset in global state: {e}")))?;
        Ok(Some(offset))
    }
}

/// Global (sync-wide) state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    /// Shared state, `{"state": {..offsets..}}` for CDC
    #[serde(default)]
    pub shared_state: Option<JsonValue>,

    /// Streams covered by the shared state
    #[serde(default)]
    pub stream_states: Vec<StreamStateBlob>,
}

/// Stream-scoped state blob
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamStateBlob {
    /// Which stream this state belongs to
    #[serde(default)]
    pub stream_descriptor: Option<StreamKey>,

    /// Opaque stream state, tagged with `state_type`
    #[serde(default)]
    pub stream_state: Option<JsonValue>,
}

impl StreamStateBlob {
    /// Stream key, or None when the descriptor is missing or default-shaped
    pub fn key(&self) -> Option<StreamKey> {
        self.stream_descriptor
            .as_ref()
            .filter(|d| !d.name.is_empty())
            .cloned()
    }

    /// Parse the typed state, or None when this blob carries no prior state
    pub fn typed_state(&self) -> Result<Option<(StreamKey, StreamIncrementalState)>> {
        let Some(key) = self.key() else {
            return Ok(None);
        };
        let Some(value) = self.stream_state.as_ref().filter(|v| !is_empty_state(v)) else {
            return Ok(None);
        };
        Ok(StreamIncrementalState::from_json(value)?.map(|state| (key, state)))
    }
}

fn is_empty_state(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Object(map) => map.is_empty(),
        _ => false,
    }
}

// ============================================================================
// Stream Incremental State
// ============================================================================

/// Per-stream incremental bookkeeping, one variant per strategy
///
/// CDC keeps no per-stream state; its offset lives in the global checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamIncrementalState {
    /// Row fingerprints seen by the last MagicSync run
    MagicSync(FingerprintFilter),
    /// Transaction-id snapshot of the last Xmin run
    Xmin(XminStatus),
}

impl StreamIncrementalState {
    /// Serialize to the tagged wire shape
    pub fn to_json(&self) -> Result<JsonValue> {
        let mut object = JsonObject::new();
        match self {
            Self::MagicSync(filter) => {
                object.insert("state_type".into(), MAGIC_SYNC_STATE_TYPE.into());
                object.insert("bloom_filter".into(), serde_json::to_value(filter)?);
            }
            Self::Xmin(status) => {
                object.insert("state_type".into(), XMIN_STATE_TYPE.into());
                object.insert("version".into(), XMIN_STATE_VERSION.into());
                if let JsonValue::Object(fields) = serde_json::to_value(status)? {
                    object.extend(fields);
                }
            }
        }
        Ok(JsonValue::Object(object))
    }

    /// Parse from the tagged wire shape
    ///
    /// States without a `state_type` are recognised by their fields. Anything
    /// unrecognised is treated as no prior state.
    pub fn from_json(value: &JsonValue) -> Result<Option<Self>> {
        let state_type = value.get("state_type").and_then(JsonValue::as_str);
        let looks_like_xmin = value.get("xmin_xid_value").is_some();
        let looks_like_magic = value.get("bloom_filter").is_some();

        match state_type {
            Some(MAGIC_SYNC_STATE_TYPE) => Self::parse_magic_sync(value).map(Some),
            Some(XMIN_STATE_TYPE) => Self::parse_xmin(value).map(Some),
            Some(other) => {
                tracing::warn!("Ignoring stream state with unknown state_type '{other}'");
                Ok(None)
            }
            None if looks_like_xmin => Self::parse_xmin(value).map(Some),
            None if looks_like_magic => Self::parse_magic_sync(value).map(Some),
            None => Ok(None),
        }
    }

    fn parse_magic_sync(value: &JsonValue) -> Result<Self> {
        let filter = value
            .get("bloom_filter")
            .cloned()
            .map(serde_json::from_value::<FingerprintFilter>)
            .transpose()
            .map_err(|e| Error::state(format!("Invalid MagicSync state: {e}")))?
            .unwrap_or_default();
        Ok(Self::MagicSync(filter))
    }

    fn parse_xmin(value: &JsonValue) -> Result<Self> {
        let status = serde_json::from_value::<XminStatus>(value.clone())
            .map_err(|e| Error::state(format!("Invalid xmin state: {e}")))?;
        Ok(Self::Xmin(status))
    }

    /// MagicSync filter, if this is a MagicSync state
    pub fn as_magic_sync(&self) -> Option<&FingerprintFilter> {
        match self {
            Self::MagicSync(filter) => Some(filter),
            Self::Xmin(_) => None,
        }
    }

    /// Xmin status, if this is an Xmin state
    pub fn as_xmin(&self) -> Option<&XminStatus> {
        match self {
            Self::Xmin(status) => Some(status),
            Self::MagicSync(_) => None,
        }
    }
}
