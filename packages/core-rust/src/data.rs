//! Per-request shared key/value scope threaded through every step.

use std::collections::hash_map::{Iter, IntoIter};
use std::collections::{BTreeMap, HashMap};

use crate::types::Value;

/// Well-known keys written by the engine and the executor.
pub mod keys {
    /// The decoded request input.
    pub const INPUT: &str = "input";
    /// The most recent step output.
    pub const DOLLAR: &str = "$";
    /// Alias of [`DOLLAR`] kept for expressions that cannot use `$`.
    pub const PIPE: &str = "pipe";
    /// Identity claims of the caller.
    pub const CLAIMS: &str = "claims";
    /// Process environment snapshot.
    pub const ENV: &str = "env";
    /// Error details visible to recovery pipelines.
    pub const ERROR: &str = "$error";
}

/// Mutable mapping from string key to [`Value`], one instance per request.
///
/// Never shared across requests. Steps receive it by `&mut`, so writes from
/// one step are visible to every later step of the same invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Data {
    entries: HashMap<String, Value>,
}

impl Data {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// Builds the initial request scope: `input`, `$`, `pipe`, `claims`, `env`.
    #[must_use]
    pub fn for_request(input: Value, claims: Value, env: Value) -> Self {
        let mut data = Self::with_capacity(8);
        data.insert(keys::CLAIMS, claims);
        data.insert(keys::INPUT, input.clone());
        data.insert(keys::DOLLAR, input.clone());
        data.insert(keys::PIPE, input);
        data.insert(keys::ENV, env);
        data
    }

    /// Shallow copy with room for `extra` additional keys, for call sites
    /// that must branch the scope without affecting the caller's copy.
    #[must_use]
    pub fn clone_with_capacity(&self, extra: usize) -> Self {
        let mut entries = HashMap::with_capacity(self.entries.len() + extra);
        entries.extend(self.entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { entries }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries.get_mut(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, String, Value> {
        self.entries.iter()
    }

    /// Snapshot of the whole scope as a map value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Map(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    /// The `input` entry, or `Null` when absent.
    #[must_use]
    pub fn input(&self) -> Value {
        self.get(keys::INPUT).cloned().unwrap_or_default()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Data {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl IntoIterator for Data {
    type Item = (String, Value);
    type IntoIter = IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
