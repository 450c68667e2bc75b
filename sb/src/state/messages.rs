//! State manager types
//!
//! Errors, change notifications and the typed key wrapper.

use std::fmt;
use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// The state map: string key to JSON value
pub type StateMap = Map<String, Value>;

/// Source tag used when a caller does not name one
pub const UNKNOWN_SOURCE: &str = "unknown";

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Invalid state update: expected a JSON object, got {found}")]
    InvalidStateUpdate { found: &'static str },

    #[error("Failed to serialize value for state key '{key}': {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Name of a JSON value's kind, for error messages
pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Options for a `set_state` call
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Who made the change, recorded in history
    pub source: Option<String>,
}

impl SetOptions {
    pub fn source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
        }
    }

    pub(crate) fn source_or_default(&self) -> &str {
        self.source.as_deref().unwrap_or(UNKNOWN_SOURCE)
    }
}

impl From<&str> for SetOptions {
    fn from(source: &str) -> Self {
        Self::source(source)
    }
}

impl From<String> for SetOptions {
    fn from(source: String) -> Self {
        Self::source(source)
    }
}

/// What a subscriber receives when one of its keys changes
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    /// The full update passed to `set_state`, including unchanged keys
    pub changes: StateMap,
    /// Keys whose value actually changed, in key order
    pub changed_keys: Vec<String>,
    /// Values of the changed keys before the update (null when absent)
    pub previous: StateMap,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl StateChange {
    pub fn changed(&self, key: &str) -> bool {
        self.changed_keys.iter().any(|k| k == key)
    }

    /// New value of `key` in this update
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.changes.get(key)
    }
}

/// One entry in the change history
#[derive(Debug, Clone, Serialize)]
pub struct StateHistoryEntry {
    /// The changed keys with their new values
    pub changes: StateMap,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

/// Typed accessor for one state key
///
/// ```rust,ignore
/// const MAP_OPACITY: StateKey<f64> = StateKey::new("mapOpacity");
/// state.set_typed(&MAP_OPACITY, &0.8, "legend")?;
/// let opacity = state.get_typed(&MAP_OPACITY);
/// ```
pub struct StateKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StateKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for StateKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateKey<T> {}

impl<T> fmt::Debug for StateKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateKey").field(&self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invalid_update_message() {
        let err = StateError::InvalidStateUpdate {
            found: value_kind(&json!([1, 2])),
        };
        let msg = err.to_string();
        assert!(msg.contains("JSON object"));
        assert!(msg.contains("an array"));
    }

    #[test]
    fn test_set_options_source() {
        assert_eq!(SetOptions::default().source_or_default(), "unknown");
        assert_eq!(SetOptions::from("legend").source_or_default(), "legend");
    }

    #[test]
    fn test_state_change_helpers() {
        let mut changes = StateMap::new();
        changes.insert("a".into(), json!(1));
        changes.insert("b".into(), json!(2));
        let change = StateChange {
            changes,
            changed_keys: vec!["a".into()],
            previous: StateMap::new(),
            source: "test".into(),
            timestamp: Utc::now(),
        };
        assert!(change.changed("a"));
        assert!(!change.changed("b"));
        assert_eq!(change.value("b"), Some(&json!(2)));
    }

    #[test]
    fn test_state_key_name() {
        const ZOOM: StateKey<u32> = StateKey::new("zoom");
        let copy = ZOOM;
        assert_eq!(copy.name(), "zoom");
        assert_eq!(format!("{:?}", ZOOM), "StateKey(\"zoom\")");
    }
}
