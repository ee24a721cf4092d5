//! Request-scoped execution context.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Values visible to every resolver of one operation.
///
/// Cloning is cheap; the map is shared until a clone is mutated.
#[derive(Debug, Clone, Default)]
pub struct Context {
    data: Arc<Map<String, Value>>,
}

impl Context {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context from a JSON object.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self { data: Arc::new(map) }
    }

    /// Gets a value deserialized into `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Gets the raw JSON value for a key.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Sets a value. Values that fail to serialize are ignored.
    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: T) {
        if let Ok(v) = serde_json::to_value(value) {
            self.insert(key, v);
        }
    }

    /// Inserts a raw JSON value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        Arc::make_mut(&mut self.data).insert(key.into(), value);
    }

    /// Merges every entry of `fields`, overwriting existing keys.
    pub fn extend(&mut self, fields: Map<String, Value>) {
        if fields.is_empty() {
            return;
        }
        Arc::make_mut(&mut self.data).extend(fields);
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.data
    }
}
