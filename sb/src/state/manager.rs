//! StateManager - reactive key/value store shared by consumers
//!
//! One mutable JSON map with key-indexed subscribers, a bounded change history
//! and optional persistence of selected keys to durable storage.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use super::messages::{
    SetOptions, StateChange, StateError, StateHistoryEntry, StateKey, StateMap, StateResponse, value_kind,
};
use super::persistence;
use super::storage::StateStorage;
use crate::config::StateConfig;
use crate::events::{Event, EventBus, EventName};
use crate::sync::{lock, panic_message, read, write};

/// Default number of change entries kept in history
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Default storage key of the persisted document
pub const DEFAULT_STORAGE_KEY: &str = "dashboard-state";

/// Subscribing to this key receives every change
pub const ALL_KEYS: &str = "*";

/// Source tag of history entries created by restore
pub const RESTORE_SOURCE: &str = "restore";

type SubscriberFn = dyn Fn(&StateChange) -> eyre::Result<()> + Send + Sync;

/// Identifier of a registered subscriber, increasing in subscription order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

struct Subscriber {
    id: SubscriberId,
    keys: Vec<String>,
    callback: Box<SubscriberFn>,
}

#[derive(Default)]
struct Subscribers {
    by_id: BTreeMap<SubscriberId, Arc<Subscriber>>,
    by_key: BTreeMap<String, Vec<SubscriberId>>,
}

impl Subscribers {
    fn insert(&mut self, subscriber: Arc<Subscriber>) {
        for key in &subscriber.keys {
            self.by_key.entry(key.clone()).or_default().push(subscriber.id);
        }
        self.by_id.insert(subscriber.id, subscriber);
    }

    fn remove(&mut self, id: SubscriberId) -> bool {
        let Some(subscriber) = self.by_id.remove(&id) else {
            return false;
        };
        for key in &subscriber.keys {
            if let Some(ids) = self.by_key.get_mut(key) {
                ids.retain(|i| *i != id);
                if ids.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        true
    }

    /// Subscribers of any changed key, each once, in subscription order
    fn affected(&self, changed_keys: &[String]) -> Vec<Arc<Subscriber>> {
        let ids: BTreeSet<SubscriberId> = changed_keys
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(ALL_KEYS))
            .filter_map(|key| self.by_key.get(key))
            .flatten()
            .copied()
            .collect();
        ids.iter().filter_map(|id| self.by_id.get(id).cloned()).collect()
    }

    fn count_for(&self, key: &str) -> usize {
        self.affected(&[key.to_string()]).len()
    }
}

struct StateInner {
    state: RwLock<StateMap>,
    defaults: StateMap,
    subscribers: RwLock<Subscribers>,
    history: Mutex<VecDeque<StateHistoryEntry>>,
    config: StateConfig,
    storage: Option<Arc<dyn StateStorage>>,
    event_bus: Option<EventBus>,
    next_id: AtomicU64,
}

/// Keys accepted by `subscribe`
pub trait StateKeys {
    fn into_keys(self) -> Vec<String>;
}

impl StateKeys for &str {
    fn into_keys(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl StateKeys for String {
    fn into_keys(self) -> Vec<String> {
        vec![self]
    }
}

impl StateKeys for &[&str] {
    fn into_keys(self) -> Vec<String> {
        self.iter().map(|k| k.to_string()).collect()
    }
}

impl<const N: usize> StateKeys for [&str; N] {
    fn into_keys(self) -> Vec<String> {
        self.iter().map(|k| k.to_string()).collect()
    }
}

impl StateKeys for Vec<String> {
    fn into_keys(self) -> Vec<String> {
        self
    }
}

impl StateKeys for Vec<&str> {
    fn into_keys(self) -> Vec<String> {
        self.into_iter().map(str::to_string).collect()
    }
}

/// Builder for a `StateManager`
#[derive(Default)]
pub struct StateManagerBuilder {
    config: StateConfig,
    defaults: StateMap,
    storage: Option<Arc<dyn StateStorage>>,
    event_bus: Option<EventBus>,
}

impl StateManagerBuilder {
    pub fn config(mut self, config: StateConfig) -> Self {
        self.config = config;
        self
    }

    /// Initial values, also used by `reset`
    pub fn defaults(mut self, defaults: StateMap) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn default_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(key.into(), value);
        self
    }

    pub fn storage(self, storage: impl StateStorage + 'static) -> Self {
        self.shared_storage(Arc::new(storage))
    }

    pub fn shared_storage(mut self, storage: Arc<dyn StateStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Emit `state:changed` on this bus after every effective change
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Build the manager, restoring persisted values over the defaults
    pub fn build(self) -> StateManager {
        debug!(
            defaults = self.defaults.len(),
            has_storage = self.storage.is_some(),
            "StateManagerBuilder::build: called"
        );
        let manager = StateManager {
            inner: Arc::new(StateInner {
                state: RwLock::new(self.defaults.clone()),
                defaults: self.defaults,
                subscribers: RwLock::new(Subscribers::default()),
                history: Mutex::new(VecDeque::new()),
                config: self.config,
                storage: self.storage,
                event_bus: self.event_bus,
                next_id: AtomicU64::new(1),
            }),
        };
        manager.restore();
        manager
    }
}

/// Handle to the shared state store
///
/// Cheap to clone; all clones share one store.
#[derive(Clone)]
pub struct StateManager {
    inner: Arc<StateInner>,
}

impl StateManager {
    /// In-memory manager with default configuration and no persistence
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> StateManagerBuilder {
        StateManagerBuilder::default()
    }

    pub fn config(&self) -> &StateConfig {
        &self.inner.config
    }

    // === Reads ===

    /// Copy of the value at `key`
    pub fn get(&self, key: &str) -> Option<Value> {
        read(&self.inner.state).get(key).cloned()
    }

    /// Copy of the whole state map
    pub fn get_state(&self) -> StateMap {
        read(&self.inner.state).clone()
    }

    pub fn contains(&self, key: &str) -> bool {
        read(&self.inner.state).contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        read(&self.inner.state).keys().cloned().collect()
    }

    /// Decode the value at a typed key; a value of the wrong shape reads as None
    pub fn get_typed<T: DeserializeOwned>(&self, key: &StateKey<T>) -> Option<T> {
        let value = self.get(key.name())?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!(key = key.name(), error = %e, "State value does not match its typed key");
                None
            }
        }
    }

    // === Writes ===

    /// Shallow-merge `update` into the store and notify affected subscribers
    ///
    /// Returns the keys whose value changed. Keys set to the value they already
    /// hold are not changes; if nothing changed the call records nothing and
    /// notifies nobody.
    pub fn set_state(&self, update: Value, options: impl Into<SetOptions>) -> StateResponse<Vec<String>> {
        let options = options.into();
        let Value::Object(update) = update else {
            return Err(StateError::InvalidStateUpdate {
                found: value_kind(&update),
            });
        };
        let source = options.source_or_default().to_string();
        debug!(%source, keys = update.len(), "set_state: called");

        let (changed_keys, previous) = {
            let mut state = write(&self.inner.state);
            let mut changed_keys = Vec::new();
            let mut previous = StateMap::new();
            for (key, value) in &update {
                if state.get(key) == Some(value) {
                    continue;
                }
                let old = state.insert(key.clone(), value.clone()).unwrap_or(Value::Null);
                previous.insert(key.clone(), old);
                changed_keys.push(key.clone());
            }
            (changed_keys, previous)
        };

        if changed_keys.is_empty() {
            debug!(%source, "set_state: no value changed, skipping notification");
            return Ok(changed_keys);
        }

        let change = StateChange {
            changes: update,
            changed_keys,
            previous,
            source,
            timestamp: Utc::now(),
        };

        self.record(&change);
        self.notify(&change);
        self.auto_persist(&change);
        self.emit_change(&change);

        Ok(change.changed_keys)
    }

    /// Set a single key
    pub fn set(&self, key: &str, value: Value, options: impl Into<SetOptions>) -> StateResponse<Vec<String>> {
        let mut update = StateMap::new();
        update.insert(key.to_string(), value);
        self.set_state(Value::Object(update), options)
    }

    /// Encode and set a typed key
    pub fn set_typed<T: Serialize>(
        &self,
        key: &StateKey<T>,
        value: &T,
        options: impl Into<SetOptions>,
    ) -> StateResponse<Vec<String>> {
        let value = serde_json::to_value(value).map_err(|source| StateError::Serialization {
            key: key.name().to_string(),
            source,
        })?;
        self.set(key.name(), value, options)
    }

    /// Write the construction-time defaults back through `set_state`
    ///
    /// Keys without a default keep their current value.
    pub fn reset(&self, options: impl Into<SetOptions>) -> StateResponse<Vec<String>> {
        debug!(defaults = self.inner.defaults.len(), "reset: called");
        self.set_state(Value::Object(self.inner.defaults.clone()), options)
    }

    fn record(&self, change: &StateChange) {
        let capacity = self.inner.config.max_history;
        if capacity == 0 {
            return;
        }
        let changes: StateMap = change
            .changed_keys
            .iter()
            .filter_map(|k| change.changes.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        self.push_history(StateHistoryEntry {
            changes,
            source: change.source.clone(),
            timestamp: change.timestamp,
        });
    }

    fn push_history(&self, entry: StateHistoryEntry) {
        let capacity = self.inner.config.max_history;
        if capacity == 0 {
            return;
        }
        let mut history = lock(&self.inner.history);
        while history.len() >= capacity {
            history.pop_front();
        }
        history.push_back(entry);
    }

    fn notify(&self, change: &StateChange) {
        let subscribers = read(&self.inner.subscribers).affected(&change.changed_keys);
        debug!(
            changed = ?change.changed_keys,
            subscribers = subscribers.len(),
            "notify: dispatching"
        );
        for subscriber in subscribers {
            match panic::catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(change))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        subscriber = subscriber.id.0,
                        keys = ?subscriber.keys,
                        error = %e,
                        "State subscriber failed"
                    );
                }
                Err(payload) => {
                    error!(
                        subscriber = subscriber.id.0,
                        keys = ?subscriber.keys,
                        panic = %panic_message(payload.as_ref()),
                        "State subscriber panicked"
                    );
                }
            }
        }
    }

    fn auto_persist(&self, change: &StateChange) {
        let config = &self.inner.config;
        if !config.auto_persist || self.inner.storage.is_none() {
            return;
        }
        if change.changed_keys.iter().any(|k| config.persisted_keys.contains(k)) {
            debug!("auto_persist: persisted key changed");
            self.persist(&config.persisted_keys);
        }
    }

    fn emit_change(&self, change: &StateChange) {
        let Some(bus) = &self.inner.event_bus else {
            return;
        };
        let payload = json!({
            "changes": change.changes,
            "changedKeys": change.changed_keys,
            "source": change.source,
        });
        bus.publish(Event::new(EventName::StateChanged, payload).with_source("stateManager"));
    }

    // === Subscriptions ===

    /// Call `callback` once per `set_state` that changes any of `keys`
    ///
    /// Subscribe to `"*"` to receive every change.
    pub fn subscribe<K, F>(&self, keys: K, callback: F) -> StateSubscription
    where
        K: StateKeys,
        F: Fn(&StateChange) -> eyre::Result<()> + Send + Sync + 'static,
    {
        let mut keys = keys.into_keys();
        let mut seen = BTreeSet::new();
        keys.retain(|key| seen.insert(key.clone()));
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(id = id.0, ?keys, "subscribe: called");
        write(&self.inner.subscribers).insert(Arc::new(Subscriber {
            id,
            keys: keys.clone(),
            callback: Box::new(callback),
        }));
        StateSubscription {
            id,
            keys,
            manager: Arc::downgrade(&self.inner),
        }
    }

    /// Call `callback` on every change
    pub fn subscribe_all<F>(&self, callback: F) -> StateSubscription
    where
        F: Fn(&StateChange) -> eyre::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(ALL_KEYS, callback)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = write(&self.inner.subscribers).remove(id);
        debug!(id = id.0, removed, "unsubscribe: called");
        removed
    }

    /// Subscribers that a change of `key` would notify
    pub fn subscriber_count(&self, key: &str) -> usize {
        read(&self.inner.subscribers).count_for(key)
    }

    pub fn total_subscribers(&self) -> usize {
        read(&self.inner.subscribers).by_id.len()
    }

    // === History ===

    /// Change history, oldest first
    pub fn history(&self) -> Vec<StateHistoryEntry> {
        lock(&self.inner.history).iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        debug!("clear_history: called");
        lock(&self.inner.history).clear();
    }

    // === Persistence ===

    pub fn has_storage(&self) -> bool {
        self.inner.storage.is_some()
    }

    /// Write the current values of `keys` to durable storage
    ///
    /// Merges into the stored document, so other persisted keys survive. A key
    /// missing from state is dropped from the document. Returns false (and
    /// logs) if there is no storage or the write failed.
    pub fn persist<S: AsRef<str>>(&self, keys: &[S]) -> bool {
        let Some(storage) = &self.inner.storage else {
            warn!("persist: no storage configured");
            return false;
        };
        let storage_key = &self.inner.config.storage_key;
        let mut values = persistence::load(storage.as_ref(), storage_key)
            .map(|doc| doc.values)
            .unwrap_or_default();
        {
            let state = read(&self.inner.state);
            for key in keys {
                let key = key.as_ref();
                match state.get(key) {
                    Some(value) => {
                        values.insert(key.to_string(), value.clone());
                    }
                    None => {
                        values.remove(key);
                    }
                }
            }
        }
        match persistence::save(storage.as_ref(), storage_key, values) {
            Ok(()) => {
                debug!(%storage_key, keys = keys.len(), "persist: saved");
                true
            }
            Err(e) => {
                warn!(%storage_key, error = %e, "Failed to persist state");
                false
            }
        }
    }

    /// Persist the configured `persisted-keys`
    pub fn persist_configured(&self) -> bool {
        self.persist(&self.inner.config.persisted_keys)
    }

    /// Remove the persisted document
    pub fn clear_persisted(&self) -> bool {
        let Some(storage) = &self.inner.storage else {
            return false;
        };
        match storage.remove(&self.inner.config.storage_key) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to clear persisted state");
                false
            }
        }
    }

    /// Values currently in durable storage (empty if none or unreadable)
    pub fn persisted_values(&self) -> StateMap {
        self.inner
            .storage
            .as_ref()
            .and_then(|storage| persistence::load(storage.as_ref(), &self.inner.config.storage_key))
            .map(|doc| doc.values)
            .unwrap_or_default()
    }

    fn restore(&self) {
        let values = self.persisted_values();
        if values.is_empty() {
            debug!("restore: nothing to restore");
            return;
        }
        {
            let mut state = write(&self.inner.state);
            for (key, value) in &values {
                state.insert(key.clone(), value.clone());
            }
        }
        info!(keys = values.len(), "Restored persisted state");
        self.push_history(StateHistoryEntry {
            changes: values,
            source: RESTORE_SOURCE.to_string(),
            timestamp: Utc::now(),
        });
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("keys", &read(&self.inner.state).len())
            .field("subscribers", &self.total_subscribers())
            .field("has_storage", &self.has_storage())
            .finish()
    }
}

/// Handle returned by `subscribe`
///
/// Dropping it leaves the subscriber registered.
#[derive(Debug)]
#[must_use = "keep the subscription so the subscriber can be removed at teardown"]
pub struct StateSubscription {
    id: SubscriberId,
    keys: Vec<String>,
    manager: Weak<StateInner>,
}

impl StateSubscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn is_active(&self) -> bool {
        self.manager
            .upgrade()
            .is_some_and(|inner| read(&inner.subscribers).by_id.contains_key(&self.id))
    }

    /// Remove the subscriber; false if it was already gone
    pub fn unsubscribe(self) -> bool {
        self.manager
            .upgrade()
            .is_some_and(|inner| write(&inner.subscribers).remove(self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStorage;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&StateChange) -> eyre::Result<()> + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        (count, move |_change: &StateChange| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_get_returns_copies() {
        let state = StateManager::builder().default_value("mapView", json!({"zoom": 4})).build();

        let mut snapshot = state.get_state();
        snapshot.insert("mapView".into(), json!("mutated"));
        let mut value = state.get("mapView").unwrap();
        value["zoom"] = json!(99);

        assert_eq!(state.get("mapView"), Some(json!({"zoom": 4})));
    }

    #[test]
    fn test_set_state_merges_shallowly() {
        let state = StateManager::new();
        state.set_state(json!({"a": 1, "b": {"x": 1}}), "test").unwrap();
        state.set_state(json!({"b": {"y": 2}}), "test").unwrap();

        assert_eq!(state.get("a"), Some(json!(1)));
        assert_eq!(state.get("b"), Some(json!({"y": 2})));
        assert_eq!(state.keys(), vec!["a", "b"]);
    }

    #[test]
    fn test_set_state_rejects_non_object() {
        let state = StateManager::new();
        for bad in [json!(1), json!("x"), json!([1]), json!(null), json!(true)] {
            let err = state.set_state(bad, SetOptions::default()).unwrap_err();
            assert!(matches!(err, StateError::InvalidStateUpdate { .. }));
        }
        assert!(state.history().is_empty());
    }

    #[test]
    fn test_identical_update_notifies_once() {
        let state = StateManager::new();
        let (count, callback) = counter();
        let _sub = state.subscribe("a", callback);

        assert_eq!(state.set_state(json!({"a": 1}), "test").unwrap(), vec!["a"]);
        assert!(state.set_state(json!({"a": 1}), "test").unwrap().is_empty());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(state.history().len(), 1);
    }

    #[test]
    fn test_multi_key_update_notifies_each_subscriber_once() {
        let state = StateManager::new();
        let (a_count, a_cb) = counter();
        let (b_count, b_cb) = counter();
        let _a = state.subscribe("a", a_cb);
        let _b = state.subscribe("b", b_cb);

        let both_seen = Arc::new(Mutex::new(Vec::new()));
        let both_clone = both_seen.clone();
        let _both = state.subscribe(["a", "b"], move |change: &StateChange| {
            both_clone.lock().unwrap().push(change.changes.clone());
            Ok(())
        });

        state.set_state(json!({"a": 1, "b": 2}), "test").unwrap();

        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);
        let seen = both_seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["a"], json!(1));
        assert_eq!(seen[0]["b"], json!(2));
    }

    #[test]
    fn test_subscriber_sees_full_update_and_previous() {
        let state = StateManager::builder().default_value("a", json!(0)).build();
        let seen = Arc::new(Mutex::new(None::<StateChange>));
        let seen_clone = seen.clone();
        let _sub = state.subscribe("a", move |change: &StateChange| {
            *seen_clone.lock().unwrap() = Some(change.clone());
            Ok(())
        });

        state.set_state(json!({"a": 1, "unrelated": true}), "legend").unwrap();

        let change = seen.lock().unwrap().clone().unwrap();
        assert_eq!(change.changes["unrelated"], json!(true));
        assert_eq!(change.previous["a"], json!(0));
        assert_eq!(change.previous["unrelated"], Value::Null);
        assert_eq!(change.source, "legend");
    }

    #[test]
    fn test_all_observers_see_merged_state() {
        let state = StateManager::new();
        let observed = Arc::new(Mutex::new(None::<StateMap>));
        let observed_clone = observed.clone();
        let state_clone = state.clone();
        let _sub = state.subscribe("a", move |_change: &StateChange| {
            *observed_clone.lock().unwrap() = Some(state_clone.get_state());
            Ok(())
        });

        state.set_state(json!({"a": 1, "z": 26}), "test").unwrap();
        let observed = observed.lock().unwrap().clone().unwrap();
        assert_eq!(observed["a"], json!(1));
        assert_eq!(observed["z"], json!(26));
    }

    #[test]
    fn test_subscribers_run_in_subscription_order() {
        let state = StateManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut subs = Vec::new();
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            subs.push(state.subscribe("k", move |_change: &StateChange| {
                order.lock().unwrap().push(tag);
                Ok(())
            }));
        }

        state.set("k", json!(1), "test").unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_subscribe_drops_repeated_keys() {
        let state = StateManager::new();
        let (count, callback) = counter();
        let sub = state.subscribe(["a", "b", "a"], callback);
        assert_eq!(sub.keys(), ["a", "b"]);

        state.set_state(json!({"a": 1, "b": 2}), "test").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_subscriber_is_isolated() {
        let state = StateManager::new();
        let (count, callback) = counter();
        let _bad = state.subscribe("a", |_change: &StateChange| Err(eyre::eyre!("bad subscriber")));
        let _panics = state.subscribe("a", |_change: &StateChange| -> eyre::Result<()> { panic!("subscriber exploded") });
        let _good = state.subscribe(["a", "b"], callback);

        state.set_state(json!({"a": 1}), "test").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(state.get("a"), Some(json!(1)));
    }

    #[test]
    fn test_reentrant_set_state_from_subscriber() {
        let state = StateManager::new();
        let state_clone = state.clone();
        let (count, callback) = counter();
        let _echo = state.subscribe("field", move |change: &StateChange| {
            // Derived key, then a write-back of the same value (a no-op)
            let field = change.value("field").cloned().unwrap_or(Value::Null);
            state_clone.set_state(json!({"label": format!("Field: {}", field)}), "echo")?;
            state_clone.set_state(json!({"field": field}), "echo")?;
            Ok(())
        });
        let _field_counter = state.subscribe("field", callback);

        state.set("field", json!("turnout"), "ui").unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(state.get("label"), Some(json!("Field: \"turnout\"")));
    }

    #[test]
    fn test_wildcard_subscriber() {
        let state = StateManager::new();
        let (count, callback) = counter();
        let _all = state.subscribe_all(callback);
        state.set("x", json!(1), "test").unwrap();
        state.set_state(json!({"y": 1, "z": 2}), "test").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(state.subscriber_count("anything"), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let state = StateManager::new();
        let (count, callback) = counter();
        let sub = state.subscribe(vec!["a".to_string(), "b".to_string()], callback);
        assert!(sub.is_active());
        assert_eq!(state.subscriber_count("a"), 1);

        assert!(sub.unsubscribe());
        state.set("a", json!(1), "test").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(state.total_subscribers(), 0);
        assert!(!state.unsubscribe(SubscriberId(999)));
    }

    #[test]
    fn test_history_is_bounded_and_tagged() {
        let config = StateConfig {
            max_history: 2,
            ..Default::default()
        };
        let state = StateManager::builder().config(config).build();
        state.set("a", json!(1), SetOptions::default()).unwrap();
        state.set("a", json!(2), "map").unwrap();
        state.set("a", json!(3), "legend").unwrap();

        let history = state.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].changes["a"], json!(2));
        assert_eq!(history[0].source, "map");
        assert_eq!(history[1].source, "legend");

        state.clear_history();
        assert!(state.history().is_empty());
    }

    #[test]
    fn test_default_source_is_unknown() {
        let state = StateManager::new();
        state.set("a", json!(1), SetOptions::default()).unwrap();
        assert_eq!(state.history()[0].source, "unknown");
    }

    #[test]
    fn test_history_records_only_changed_keys() {
        let state = StateManager::builder().default_value("same", json!(1)).build();
        state.set_state(json!({"same": 1, "new": 2}), "test").unwrap();
        let entry = &state.history()[0];
        assert!(entry.changes.get("same").is_none());
        assert_eq!(entry.changes["new"], json!(2));
    }

    #[test]
    fn test_typed_keys() {
        const OPACITY: StateKey<f64> = StateKey::new("mapOpacity");
        const DATASET: StateKey<String> = StateKey::new("currentDataset");
        let state = StateManager::new();

        assert_eq!(state.get_typed(&OPACITY), None);
        state.set_typed(&OPACITY, &0.75, "legend").unwrap();
        assert_eq!(state.get_typed(&OPACITY), Some(0.75));

        state.set("currentDataset", json!(42), "test").unwrap();
        assert_eq!(state.get_typed(&DATASET), None);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let state = StateManager::builder().default_value("mapOpacity", json!(1.0)).build();
        state.set_state(json!({"mapOpacity": 0.4, "extra": 1}), "legend").unwrap();
        assert_eq!(state.reset("reset").unwrap(), vec!["mapOpacity"]);
        assert_eq!(state.get("mapOpacity"), Some(json!(1.0)));
        assert_eq!(state.get("extra"), Some(json!(1)));
    }

    #[test]
    fn test_persist_and_restore() {
        let storage = MemoryStorage::new();
        let state = StateManager::builder().storage(storage.clone()).build();
        state.set("mapView", json!({"zoom": 11}), "map").unwrap();
        state.set("transient", json!(true), "map").unwrap();
        assert!(state.persist(&["mapView"]));

        let reloaded = StateManager::builder().storage(storage).build();
        assert_eq!(reloaded.get("mapView"), Some(json!({"zoom": 11})));
        assert_eq!(reloaded.get("transient"), None);
        assert_eq!(reloaded.history()[0].source, RESTORE_SOURCE);
    }

    #[test]
    fn test_persist_merges_with_stored_document() {
        let storage = MemoryStorage::new();
        let state = StateManager::builder().storage(storage.clone()).build();
        state.set_state(json!({"a": 1, "b": 2}), "test").unwrap();
        assert!(state.persist(&["a"]));
        assert!(state.persist(&["b"]));

        let values = state.persisted_values();
        assert_eq!(values["a"], json!(1));
        assert_eq!(values["b"], json!(2));

        // A key absent from state is dropped from the document
        assert!(state.persist(&["missing", "a"]));
        assert!(state.persisted_values().get("missing").is_none());
    }

    #[test]
    fn test_restored_values_override_defaults() {
        let storage = MemoryStorage::new();
        let first = StateManager::builder()
            .storage(storage.clone())
            .default_value("mapOpacity", json!(1.0))
            .build();
        first.set("mapOpacity", json!(0.5), "legend").unwrap();
        first.persist(&["mapOpacity"]);

        let second = StateManager::builder()
            .storage(storage)
            .default_value("mapOpacity", json!(1.0))
            .default_value("currentField", json!("turnout"))
            .build();
        assert_eq!(second.get("mapOpacity"), Some(json!(0.5)));
        assert_eq!(second.get("currentField"), Some(json!("turnout")));
    }

    #[test]
    fn test_corrupt_storage_degrades_to_defaults() {
        let storage = MemoryStorage::new();
        storage.write(DEFAULT_STORAGE_KEY, "definitely not json").unwrap();

        let state = StateManager::builder()
            .storage(storage.clone())
            .default_value("mapOpacity", json!(1.0))
            .build();
        assert_eq!(state.get("mapOpacity"), Some(json!(1.0)));
        assert!(state.history().is_empty());

        // Persisting over a corrupt document replaces it
        assert!(state.persist(&["mapOpacity"]));
        assert_eq!(state.persisted_values()["mapOpacity"], json!(1.0));
    }

    #[test]
    fn test_quota_failure_does_not_throw() {
        let state = StateManager::builder().storage(MemoryStorage::with_quota(16)).build();
        state.set("big", json!("x".repeat(100)), "test").unwrap();
        assert!(!state.persist(&["big"]));
        assert_eq!(state.get("big"), Some(json!("x".repeat(100))));
    }

    #[test]
    fn test_persist_without_storage() {
        let state = StateManager::new();
        assert!(!state.has_storage());
        assert!(!state.persist(&["a"]));
        assert!(!state.clear_persisted());
        assert!(state.persisted_values().is_empty());
    }

    #[test]
    fn test_auto_persist_configured_keys() {
        let storage = MemoryStorage::new();
        let config = StateConfig {
            persisted_keys: vec!["currentDataset".to_string()],
            auto_persist: true,
            ..Default::default()
        };
        let state = StateManager::builder().config(config).storage(storage.clone()).build();

        state.set("hover", json!(3), "map").unwrap();
        assert!(storage.is_empty());

        state.set("currentDataset", json!("2024-general"), "picker").unwrap();
        assert_eq!(state.persisted_values()["currentDataset"], json!("2024-general"));
        assert!(state.persisted_values().get("hover").is_none());

        assert!(state.clear_persisted());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_emits_state_changed_on_bus() {
        let bus = EventBus::default();
        let state = StateManager::builder().event_bus(bus.clone()).build();

        state.set("a", json!(1), "test").unwrap();
        state.set("a", json!(1), "test").unwrap();

        let events = bus.history_for(EventName::StateChanged);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["changedKeys"], json!(["a"]));
        assert_eq!(events[0].source.as_deref(), Some("stateManager"));
    }
}
