//! Persisted state document
//!
//! Persisted keys live in one JSON document under the configured storage key:
//!
//! ```json
//! { "version": 1, "saved-at": "2026-01-01T00:00:00Z", "values": { "mapView": { "zoom": 11 } } }
//! ```
//!
//! Reading never fails the caller: missing, unreadable or corrupt documents
//! all come back as "nothing stored" with a warning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::messages::StateMap;
use super::storage::{StateStorage, StorageError};

/// Current document format version
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    #[serde(rename = "saved-at")]
    pub saved_at: DateTime<Utc>,
    pub values: StateMap,
}

impl PersistedState {
    pub fn new(values: StateMap) -> Self {
        Self {
            version: FORMAT_VERSION,
            saved_at: Utc::now(),
            values,
        }
    }
}

/// Load the stored document, or None if absent or unusable
pub fn load(storage: &dyn StateStorage, key: &str) -> Option<PersistedState> {
    debug!(%key, "persistence::load: called");
    match try_load(storage, key) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(%key, error = %e, "Failed to read persisted state, using defaults");
            None
        }
    }
}

fn try_load(storage: &dyn StateStorage, key: &str) -> Result<Option<PersistedState>, StorageError> {
    let Some(raw) = storage.read(key)? else {
        debug!(%key, "try_load: nothing stored");
        return Ok(None);
    };
    let doc: PersistedState = serde_json::from_str(&raw).map_err(|e| StorageError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    if doc.version > FORMAT_VERSION {
        return Err(StorageError::Corrupt {
            key: key.to_string(),
            message: format!("unsupported format version {}", doc.version),
        });
    }
    Ok(Some(doc))
}

/// Write the document, replacing what was stored
pub fn save(storage: &dyn StateStorage, key: &str, values: StateMap) -> Result<(), StorageError> {
    debug!(%key, value_count = values.len(), "persistence::save: called");
    let json = serde_json::to_string(&PersistedState::new(values))?;
    storage.write(key, &json)
}
