//! Event types for substrate pub/sub
//!
//! Event names form a closed vocabulary of the dashboard's well-known events
//! with a `Custom` escape hatch for consumer-defined names. The string form
//! ("data:ready", "ui:layerSelected", ...) is what listeners match against.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Pattern matching every event
pub const WILDCARD: &str = "*";

/// Well-known event names
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventName {
    // === Data loading ===
    /// A dataset started loading
    DataLoading,
    /// A dataset finished loading and is ready for consumers
    DataReady,
    /// A dataset failed to load
    DataError,

    // === State ===
    /// The state store applied a change
    StateChanged,

    // === Map ===
    /// The map view finished its first render
    MapReady,
    /// The visible viewport moved or zoomed
    ViewChanged,

    // === UI ===
    /// A layer was picked in the UI
    LayerSelected,
    /// The active data field changed
    FieldChanged,
    /// The active dataset changed
    DatasetChanged,

    /// Any consumer-defined name, including patterns like "*" or "export:*"
    Custom(String),
}

impl EventName {
    /// Wire form of the name
    pub fn as_str(&self) -> &str {
        match self {
            EventName::DataLoading => "data:loading",
            EventName::DataReady => "data:ready",
            EventName::DataError => "data:error",
            EventName::StateChanged => "state:changed",
            EventName::MapReady => "map:ready",
            EventName::ViewChanged => "map:viewChanged",
            EventName::LayerSelected => "ui:layerSelected",
            EventName::FieldChanged => "ui:fieldChanged",
            EventName::DatasetChanged => "ui:datasetChanged",
            EventName::Custom(name) => name,
        }
    }

    /// Build a name from any string, mapping well-known names to their variant
    pub fn custom(name: impl Into<String>) -> Self {
        Self::from(name.into())
    }

    /// Namespace prefix before the first ':' (if any)
    pub fn namespace(&self) -> Option<&str> {
        self.as_str().split_once(':').map(|(ns, _)| ns)
    }

    /// Whether this name is a listener pattern rather than a concrete event
    pub fn is_pattern(&self) -> bool {
        let s = self.as_str();
        s == WILDCARD || s.ends_with(":*")
    }
}

impl From<&str> for EventName {
    fn from(name: &str) -> Self {
        match name {
            "data:loading" => EventName::DataLoading,
            "data:ready" => EventName::DataReady,
            "data:error" => EventName::DataError,
            "state:changed" => EventName::StateChanged,
            "map:ready" => EventName::MapReady,
            "map:viewChanged" => EventName::ViewChanged,
            "ui:layerSelected" => EventName::LayerSelected,
            "ui:fieldChanged" => EventName::FieldChanged,
            "ui:datasetChanged" => EventName::DatasetChanged,
            other => EventName::Custom(other.to_string()),
        }
    }
}

impl From<String> for EventName {
    fn from(name: String) -> Self {
        match EventName::from(name.as_str()) {
            EventName::Custom(_) => EventName::Custom(name),
            known => known,
        }
    }
}

impl From<&String> for EventName {
    fn from(name: &String) -> Self {
        EventName::from(name.as_str())
    }
}

impl From<EventName> for String {
    fn from(name: EventName) -> Self {
        match name {
            EventName::Custom(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a listener pattern receives events with the given name
///
/// Patterns are an exact name, "*" for everything, or "ns:*" for every
/// event in the `ns` namespace.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == WILDCARD || pattern == name {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) if prefix.ends_with(':') => name.starts_with(prefix),
        _ => false,
    }
}

/// One emitted event, as seen by middleware, listeners and history
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    /// Time-ordered unique id
    pub id: Uuid,
    pub name: EventName,
    pub payload: Value,
    /// Emitting component, when sent through an `EventEmitter`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Set when the event is re-dispatched from history
    #[serde(default)]
    pub replayed: bool,
}

impl Event {
    /// Create a new event stamped with the current time
    pub fn new(name: impl Into<EventName>, payload: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            payload,
            source: None,
            timestamp: Utc::now(),
            replayed: false,
        }
    }

    /// Attach the emitting component's name
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Identifier handed out for each registered listener
///
/// Ids are monotonically increasing, so ordering by id is registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Diagnostic view of a registered listener
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ListenerInfo {
    pub id: ListenerId,
    /// Pattern the listener was registered under
    pub pattern: String,
    pub once: bool,
    pub is_async: bool,
}

/// Outcome of one dispatch pass
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub event: String,
    /// Listeners in the snapshot
    pub matched: usize,
    /// Handlers that ran to successful completion
    pub delivered: usize,
    /// Handlers that returned an error or panicked
    pub failed: usize,
    /// Async handlers started in the background and not awaited
    pub spawned: usize,
    /// Handlers skipped (consumed `once` listener, no runtime for async)
    pub skipped: usize,
    /// Middleware that vetoed the dispatch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vetoed_by: Option<String>,
}

impl DispatchReport {
    pub fn is_vetoed(&self) -> bool {
        self.vetoed_by.is_some()
    }

    /// Nobody received the event
    pub fn is_unheard(&self) -> bool {
        self.matched == 0
    }
}
