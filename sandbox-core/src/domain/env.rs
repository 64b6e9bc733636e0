//! Environment snapshot
//!
//! The set of environment variables a worker is allowed to see. It is
//! captured once on the host side and never changes afterwards: the type
//! has no mutating methods, only consuming builders.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Immutable key/value view of permitted environment variables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvSnapshot(BTreeMap<String, String>);

impl EnvSnapshot {
    pub fn new(vars: BTreeMap<String, String>) -> Self {
        Self(vars)
    }

    /// Captures the named variables from the current process
    ///
    /// Names that are not set are skipped.
    pub fn capture<I, S>(allow_list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let vars = allow_list
            .into_iter()
            .filter_map(|name| {
                let name = name.as_ref();
                std::env::var(name).ok().map(|value| (name.to_string(), value))
            })
            .collect();
        Self(vars)
    }

    /// Returns a snapshot with one more variable set
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvSnapshot {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
