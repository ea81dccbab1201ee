//! Row fingerprint membership summary

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key-to-value fingerprint summary of a previous run
///
/// Implementations may be probabilistic: a false positive makes a changed
/// row look unchanged.
pub trait MembershipFilter: Send + Sync {
    /// Record the value fingerprint of a key
    fn insert(&mut self, key_hash: &str, value_hash: &str);

    /// Check if a key was recorded
    fn contains(&self, key_hash: &str) -> bool;

    /// Value fingerprint recorded for a key
    fn get_value(&self, key_hash: &str) -> Option<&str>;

    /// Number of recorded keys
    fn len(&self) -> usize;

    /// Check if nothing was recorded
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True iff the key was recorded with exactly this value fingerprint
    fn is_unchanged(&self, key_hash: &str, value_hash: &str) -> bool {
        self.contains(key_hash) && self.get_value(key_hash) == Some(value_hash)
    }
}

/// Exact fingerprint map
///
/// Serializes as a list of `[key_hash, value_hash]` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintFilter {
    entries: BTreeMap<String, String>,
}

impl FingerprintFilter {
    /// Create an empty filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Iterate over `(key_hash, value_hash)` pairs
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl MembershipFilter for FingerprintFilter {
    fn insert(&mut self, key_hash: &str, value_hash: &str) {
        self.entries
            .insert(key_hash.to_string(), value_hash.to_string());
    }

    fn contains(&self, key_hash: &str) -> bool {
        self.entries.contains_key(key_hash)
    }

    fn get_value(&self, key_hash: &str) -> Option<&str> {
        self.entries.get(key_hash).map(String::as_str)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FingerprintFilter {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl Serialize for FingerprintFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.entries.iter())
    }
}

impl<'de> Deserialize<'de> for FingerprintFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs = Vec::<(String, String)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}
