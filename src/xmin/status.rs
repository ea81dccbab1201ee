//! Wraparound-aware transaction id snapshot

use crate::types::quote_ident;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Current transaction-id snapshot, split into epoch and 32-bit xid
///
/// Ordered by wraparound count first, then by xid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct XminStatus {
    /// How often the 32-bit counter has wrapped
    pub num_wraparound: i64,
    /// 32-bit transaction id
    pub xmin_xid_value: i64,
    /// Raw 64-bit snapshot xmin
    pub xmin_raw_value: i64,
}

impl XminStatus {
    /// Decompose a raw 64-bit snapshot xmin
    pub fn from_raw(raw: i64) -> Self {
        Self {
            num_wraparound: raw >> 32,
            xmin_xid_value: raw & 0xFFFF_FFFF,
            xmin_raw_value: raw,
        }
    }
}

impl Ord for XminStatus {
    fn cmp(&self, other: &Self) -> Ordering {
        self.num_wraparound
            .cmp(&other.num_wraparound)
            .then(self.xmin_xid_value.cmp(&other.xmin_xid_value))
    }
}

impl PartialOrd for XminStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Row filter for one stream of an xmin sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XminQueryPlan {
    /// Read every row
    Full,
    /// Rows written after `xid` within the same epoch
    After {
        /// Previous run's xid
        xid: i64,
    },
    /// Rows written after `previous_xid` in the old epoch, or up to
    /// `current_xid` in the new one
    AfterWrapped {
        /// Previous run's xid
        previous_xid: i64,
        /// Current xid, past the wraparound
        current_xid: i64,
    },
}

impl XminQueryPlan {
    /// Plan a stream's query from its previous status and the sync's current one
    ///
    /// A single wraparound is only safe while the counter has not caught up
    /// with the previous xid; otherwise old row versions are ambiguous and
    /// the stream is read in full.
    pub fn plan(previous: Option<&XminStatus>, current: &XminStatus) -> Self {
        let Some(previous) = previous else {
            return Self::Full;
        };

        match current.num_wraparound - previous.num_wraparound {
            0 => Self::After {
                xid: previous.xmin_xid_value,
            },
            1 if current.xmin_xid_value < previous.xmin_xid_value => Self::AfterWrapped {
                previous_xid: previous.xmin_xid_value,
                current_xid: current.xmin_xid_value,
            },
            _ => {
                tracing::warn!(
                    "Transaction ids wrapped around since the last sync ({} -> {}), reading all rows",
                    previous.num_wraparound,
                    current.num_wraparound
                );
                Self::Full
            }
        }
    }

    /// SQL predicate over the `xmin` system column, None for a full scan
    pub fn predicate(&self) -> Option<String> {
        let column = format!("{}::text::bigint", quote_ident("xmin"));
        match self {
            Self::Full => None,
            Self::After { xid } => Some(format!("{column} > {xid}")),
            Self::AfterWrapped {
                previous_xid,
                current_xid,
            } => Some(format!(
                "({column} > {previous_xid} OR {column} <= {current_xid})"
            )),
        }
    }
}
