//! Reactive state store
//!
//! StateManager owns one key/value map of JSON values. Consumers read copies,
//! write through `set_state` and subscribe to the keys they render. Selected
//! keys can be persisted to durable storage and restored on the next start.

mod manager;
mod messages;
mod persistence;
mod storage;

pub use manager::{
    ALL_KEYS, DEFAULT_HISTORY_CAPACITY, DEFAULT_STORAGE_KEY, RESTORE_SOURCE, StateKeys, StateManager,
    StateManagerBuilder, StateSubscription, SubscriberId,
};
pub use messages::{
    SetOptions, StateChange, StateError, StateHistoryEntry, StateKey, StateMap, StateResponse, UNKNOWN_SOURCE,
};
pub use persistence::{FORMAT_VERSION, PersistedState};
pub use storage::{FileStorage, MemoryStorage, StateStorage, StorageError};
