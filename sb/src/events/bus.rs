//! Event Bus - ordered in-process pub/sub for substrate consumers
//!
//! Listeners are callbacks registered under an event pattern. Every emit takes
//! its own snapshot of the matching listeners, runs the middleware chain,
//! dispatches in registration order, then appends the event to a bounded
//! history. No lock is held while a listener runs, so listeners may emit,
//! subscribe or unsubscribe freely.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tracing::{debug, error, warn};

use super::middleware::{Middleware, MiddlewareAction};
use super::types::{DispatchReport, Event, EventName, ListenerId, ListenerInfo, WILDCARD, pattern_matches};
use crate::config::EventsConfig;
use crate::sync::{lock, panic_message, read, write};

/// Default number of events kept in history
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

type SyncHandler = dyn Fn(&Event) -> eyre::Result<()> + Send + Sync;
type AsyncHandler = dyn Fn(Event) -> BoxFuture<'static, eyre::Result<()>> + Send + Sync;

enum Handler {
    Sync(Box<SyncHandler>),
    Async(Box<AsyncHandler>),
}

struct Listener {
    id: ListenerId,
    pattern: String,
    once: bool,
    /// Set by the first dispatch that claims a `once` listener
    fired: AtomicBool,
    handler: Handler,
}

impl Listener {
    fn info(&self) -> ListenerInfo {
        ListenerInfo {
            id: self.id,
            pattern: self.pattern.clone(),
            once: self.once,
            is_async: matches!(self.handler, Handler::Async(_)),
        }
    }
}

/// Identifier of a registered middleware
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MiddlewareId(u64);

struct MiddlewareEntry {
    id: MiddlewareId,
    middleware: Box<dyn Middleware>,
}

struct BusInner {
    listeners: RwLock<BTreeMap<String, Vec<Arc<Listener>>>>,
    middleware: RwLock<Vec<Arc<MiddlewareEntry>>>,
    history: Mutex<VecDeque<Event>>,
    history_capacity: usize,
    next_id: AtomicU64,
    emitted: AtomicU64,
}

impl BusInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn remove(&self, pattern: &str, id: ListenerId) -> bool {
        let mut listeners = write(&self.listeners);
        let Some(list) = listeners.get_mut(pattern) else {
            return false;
        };
        let before = list.len();
        list.retain(|l| l.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(pattern);
        }
        removed
    }
}

/// Central event bus
///
/// Cheap to clone; all clones share the same listeners, middleware and history.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a new event bus keeping at most `history_capacity` events
    pub fn new(history_capacity: usize) -> Self {
        debug!(history_capacity, "EventBus::new: creating event bus");
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(BTreeMap::new()),
                middleware: RwLock::new(Vec::new()),
                history: Mutex::new(VecDeque::with_capacity(history_capacity.min(1024))),
                history_capacity,
                next_id: AtomicU64::new(1),
                emitted: AtomicU64::new(0),
            }),
        }
    }

    /// Create a new event bus with default history capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn from_config(config: &EventsConfig) -> Self {
        Self::new(config.max_history)
    }

    // === Registration ===

    /// Register a handler for an event name or pattern
    pub fn on<F>(&self, name: impl Into<EventName>, handler: F) -> Subscription
    where
        F: Fn(&Event) -> eyre::Result<()> + Send + Sync + 'static,
    {
        self.add_listener(name.into(), false, Handler::Sync(Box::new(handler)))
    }

    /// Register a handler for every event
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) -> eyre::Result<()> + Send + Sync + 'static,
    {
        self.on(WILDCARD, handler)
    }

    /// Register a handler that removes itself after its first run
    pub fn once<F>(&self, name: impl Into<EventName>, handler: F) -> Subscription
    where
        F: Fn(&Event) -> eyre::Result<()> + Send + Sync + 'static,
    {
        self.add_listener(name.into(), true, Handler::Sync(Box::new(handler)))
    }

    /// Register an async handler
    ///
    /// `emit` spawns it on the current tokio runtime without waiting;
    /// `emit_async` awaits it in order.
    pub fn on_async<F, Fut>(&self, name: impl Into<EventName>, handler: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        let handler = move |event: Event| -> BoxFuture<'static, eyre::Result<()>> { handler(event).boxed() };
        self.add_listener(name.into(), false, Handler::Async(Box::new(handler)))
    }

    fn add_listener(&self, name: EventName, once: bool, handler: Handler) -> Subscription {
        let id = ListenerId(self.inner.next_id());
        let pattern = String::from(name);
        debug!(%id, %pattern, once, "EventBus::add_listener: registering");
        let listener = Arc::new(Listener {
            id,
            pattern: pattern.clone(),
            once,
            fired: AtomicBool::new(false),
            handler,
        });
        write(&self.inner.listeners)
            .entry(pattern.clone())
            .or_default()
            .push(listener);
        Subscription {
            id,
            pattern,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a specific listener; no-op if it is not registered
    pub fn off(&self, name: impl Into<EventName>, id: ListenerId) -> bool {
        let name = name.into();
        let removed = self.inner.remove(name.as_str(), id);
        debug!(%id, event = %name, removed, "EventBus::off");
        removed
    }

    /// Remove every listener registered under exactly this name or pattern
    pub fn remove_all(&self, name: impl Into<EventName>) -> usize {
        let name = name.into();
        let removed = write(&self.inner.listeners)
            .remove(name.as_str())
            .map(|list| list.len())
            .unwrap_or(0);
        debug!(event = %name, removed, "EventBus::remove_all");
        removed
    }

    /// Remove all listeners, returning how many were registered
    pub fn clear_listeners(&self) -> usize {
        let mut listeners = write(&self.inner.listeners);
        let count = listeners.values().map(Vec::len).sum();
        listeners.clear();
        debug!(count, "EventBus::clear_listeners");
        count
    }

    // === Diagnostics ===

    /// Listeners that would receive `name` if it were emitted now, in dispatch order
    pub fn get_listeners(&self, name: impl Into<EventName>) -> Vec<ListenerInfo> {
        let name = name.into();
        self.snapshot(name.as_str()).iter().map(|l| l.info()).collect()
    }

    pub fn listener_count(&self, name: impl Into<EventName>) -> usize {
        let name = name.into();
        self.snapshot(name.as_str()).len()
    }

    pub fn has_listeners(&self, name: impl Into<EventName>) -> bool {
        self.listener_count(name) > 0
    }

    /// Total registered listeners across all patterns
    pub fn total_listeners(&self) -> usize {
        read(&self.inner.listeners).values().map(Vec::len).sum()
    }

    /// Registered names and patterns
    pub fn patterns(&self) -> Vec<String> {
        read(&self.inner.listeners).keys().cloned().collect()
    }

    /// Number of events dispatched since creation (vetoed ones excluded)
    pub fn emitted_count(&self) -> u64 {
        self.inner.emitted.load(Ordering::Relaxed)
    }

    // === Middleware ===

    /// Append a middleware to the chain
    pub fn use_middleware(&self, middleware: impl Middleware + 'static) -> MiddlewareId {
        let id = MiddlewareId(self.inner.next_id());
        debug!(?id, name = middleware.name(), "EventBus::use_middleware");
        write(&self.inner.middleware).push(Arc::new(MiddlewareEntry {
            id,
            middleware: Box::new(middleware),
        }));
        id
    }

    pub fn remove_middleware(&self, id: MiddlewareId) -> bool {
        let mut chain = write(&self.inner.middleware);
        let before = chain.len();
        chain.retain(|m| m.id != id);
        chain.len() != before
    }

    // === Emission ===

    /// Emit an event, spawning async handlers in the background
    pub fn emit(&self, name: impl Into<EventName>, payload: Value) -> DispatchReport {
        self.publish(Event::new(name, payload))
    }

    /// Emit an event and await every async handler in registration order
    pub async fn emit_async(&self, name: impl Into<EventName>, payload: Value) -> DispatchReport {
        self.publish_async(Event::new(name, payload)).await
    }

    /// Dispatch a fully built event
    pub fn publish(&self, event: Event) -> DispatchReport {
        let (event, listeners, mut report) = match self.prepare(event) {
            Ok(prepared) => prepared,
            Err(report) => return report,
        };

        for listener in &listeners {
            if !self.claim(listener) {
                report.skipped += 1;
                continue;
            }
            match &listener.handler {
                Handler::Sync(handler) => record(&mut report, invoke_sync(listener, handler, &event)),
                Handler::Async(handler) => {
                    if spawn_async(listener, handler, &event) {
                        report.spawned += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
            }
        }

        self.finish(event, report)
    }

    /// Dispatch a fully built event, awaiting async handlers
    pub async fn publish_async(&self, event: Event) -> DispatchReport {
        let (event, listeners, mut report) = match self.prepare(event) {
            Ok(prepared) => prepared,
            Err(report) => return report,
        };

        for listener in &listeners {
            if !self.claim(listener) {
                report.skipped += 1;
                continue;
            }
            let delivered = match &listener.handler {
                Handler::Sync(handler) => invoke_sync(listener, handler, &event),
                Handler::Async(handler) => match start_async(listener, handler, &event) {
                    Some(fut) => run_guarded(listener.id, event.name.clone(), fut).await,
                    None => false,
                },
            };
            record(&mut report, delivered);
        }

        self.finish(event, report)
    }

    /// Collect listeners, then run the middleware chain
    fn prepare(&self, mut event: Event) -> Result<(Event, Vec<Arc<Listener>>, DispatchReport), DispatchReport> {
        let listeners = self.snapshot(event.name.as_str());
        debug!(event = %event.name, matched = listeners.len(), replayed = event.replayed, "EventBus::prepare");

        let mut report = DispatchReport {
            event: event.name.to_string(),
            matched: listeners.len(),
            ..Default::default()
        };

        let chain: Vec<Arc<MiddlewareEntry>> = read(&self.inner.middleware).clone();
        for entry in chain {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry.middleware.process(&mut event)));
            match outcome {
                Ok(MiddlewareAction::Continue) => {}
                Ok(MiddlewareAction::Veto) => {
                    debug!(event = %event.name, middleware = entry.middleware.name(), "EventBus::prepare: vetoed");
                    report.vetoed_by = Some(entry.middleware.name().to_string());
                    return Err(report);
                }
                Err(payload) => {
                    error!(
                        event = %event.name,
                        middleware = entry.middleware.name(),
                        panic = %panic_message(payload.as_ref()),
                        "Middleware panicked, continuing dispatch"
                    );
                }
            }
        }

        Ok((event, listeners, report))
    }

    /// `once` listeners run for the first pass that claims them, even if unsubscribed since the snapshot
    fn claim(&self, listener: &Listener) -> bool {
        if !listener.once {
            return true;
        }
        if listener.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.remove(&listener.pattern, listener.id);
        true
    }

    fn finish(&self, event: Event, report: DispatchReport) -> DispatchReport {
        self.inner.emitted.fetch_add(1, Ordering::Relaxed);
        debug!(
            event = %event.name,
            delivered = report.delivered,
            failed = report.failed,
            spawned = report.spawned,
            "EventBus::finish"
        );
        if !event.replayed && self.inner.history_capacity > 0 {
            let mut history = lock(&self.inner.history);
            while history.len() >= self.inner.history_capacity {
                history.pop_front();
            }
            history.push_back(event);
        }
        report
    }

    /// Matching listeners ordered by registration
    fn snapshot(&self, name: &str) -> Vec<Arc<Listener>> {
        let listeners = read(&self.inner.listeners);
        let mut matched: Vec<Arc<Listener>> = listeners
            .iter()
            .filter(|(pattern, _)| pattern_matches(pattern, name))
            .flat_map(|(_, list)| list.iter().cloned())
            .collect();
        matched.sort_by_key(|l| l.id);
        matched
    }

    // === History ===

    /// Recorded events, oldest first
    pub fn history(&self) -> Vec<Event> {
        lock(&self.inner.history).iter().cloned().collect()
    }

    /// Recorded events whose name matches `pattern`
    pub fn history_for(&self, pattern: impl Into<EventName>) -> Vec<Event> {
        let pattern = pattern.into();
        lock(&self.inner.history)
            .iter()
            .filter(|e| pattern_matches(pattern.as_str(), e.name.as_str()))
            .cloned()
            .collect()
    }

    pub fn clear_history(&self) {
        debug!("EventBus::clear_history");
        lock(&self.inner.history).clear();
    }

    pub fn history_capacity(&self) -> usize {
        self.inner.history_capacity
    }

    /// Re-dispatch recorded events selected by `filter`, oldest first
    ///
    /// Replayed events carry `replayed = true` so middleware can filter them,
    /// and are not appended to history again.
    pub fn replay<F>(&self, filter: F) -> Vec<DispatchReport>
    where
        F: Fn(&Event) -> bool,
    {
        let selected: Vec<Event> = self.history().into_iter().filter(|e| filter(e)).collect();
        debug!(count = selected.len(), "EventBus::replay: called");
        selected
            .into_iter()
            .map(|mut event| {
                event.replayed = true;
                self.publish(event)
            })
            .collect()
    }

    /// Create an emitter handle that tags events with `source`
    pub fn emitter_for(&self, source: impl Into<String>) -> EventEmitter {
        let source = source.into();
        debug!(%source, "EventBus::emitter_for: creating emitter");
        EventEmitter {
            bus: self.clone(),
            source,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.total_listeners())
            .field("history_capacity", &self.inner.history_capacity)
            .field("emitted", &self.emitted_count())
            .finish()
    }
}

fn record(report: &mut DispatchReport, delivered: bool) {
    if delivered {
        report.delivered += 1;
    } else {
        report.failed += 1;
    }
}

fn invoke_sync(listener: &Listener, handler: &SyncHandler, event: &Event) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(event = %event.name, listener = %listener.id, error = %e, "Event listener failed");
            false
        }
        Err(payload) => {
            error!(
                event = %event.name,
                listener = %listener.id,
                panic = %panic_message(payload.as_ref()),
                "Event listener panicked"
            );
            false
        }
    }
}

/// Build the handler's future, catching a panic in the synchronous part
fn start_async(
    listener: &Listener,
    handler: &AsyncHandler,
    event: &Event,
) -> Option<BoxFuture<'static, eyre::Result<()>>> {
    match panic::catch_unwind(AssertUnwindSafe(|| handler(event.clone()))) {
        Ok(fut) => Some(fut),
        Err(payload) => {
            error!(
                event = %event.name,
                listener = %listener.id,
                panic = %panic_message(payload.as_ref()),
                "Async event listener panicked before its first await"
            );
            None
        }
    }
}

fn spawn_async(listener: &Listener, handler: &AsyncHandler, event: &Event) -> bool {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!(event = %event.name, listener = %listener.id, "No tokio runtime, async listener skipped");
        return false;
    };
    let Some(fut) = start_async(listener, handler, event) else {
        return false;
    };
    runtime.spawn(run_guarded(listener.id, event.name.clone(), fut));
    true
}

/// Await an async handler, logging its error or panic instead of losing it
async fn run_guarded(id: ListenerId, name: EventName, fut: BoxFuture<'static, eyre::Result<()>>) -> bool {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(event = %name, listener = %id, error = %e, "Async event listener failed");
            false
        }
        Err(payload) => {
            error!(
                event = %name,
                listener = %id,
                panic = %panic_message(payload.as_ref()),
                "Async event listener panicked"
            );
            false
        }
    }
}

/// Handle returned by every registration
///
/// Dropping it leaves the listener registered; call `unsubscribe` during
/// consumer teardown.
#[derive(Debug)]
#[must_use = "keep the subscription so the listener can be removed at teardown"]
pub struct Subscription {
    id: ListenerId,
    pattern: String,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Name or pattern the listener was registered under
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether the listener is still registered
    pub fn is_active(&self) -> bool {
        self.bus.upgrade().is_some_and(|bus| {
            read(&bus.listeners)
                .get(&self.pattern)
                .is_some_and(|list| list.iter().any(|l| l.id == self.id))
        })
    }

    /// Remove the listener; false if it was already gone
    pub fn unsubscribe(self) -> bool {
        debug!(id = %self.id, pattern = %self.pattern, "Subscription::unsubscribe");
        self.bus
            .upgrade()
            .is_some_and(|bus| bus.remove(&self.pattern, self.id))
    }
}

/// Handle for components to emit events without owning the bus
///
/// Cheap to clone; every event it emits carries the bound source name.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    bus: EventBus,
    source: String,
}

impl EventEmitter {
    /// Get the source name this emitter is bound to
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Emit a raw event
    pub fn emit(&self, name: impl Into<EventName>, payload: Value) -> DispatchReport {
        self.bus.publish(Event::new(name, payload).with_source(self.source.clone()))
    }

    pub async fn emit_async(&self, name: impl Into<EventName>, payload: Value) -> DispatchReport {
        self.bus
            .publish_async(Event::new(name, payload).with_source(self.source.clone()))
            .await
    }

    // === Convenience methods ===

    /// Emit a data loading event
    pub fn data_loading(&self, dataset: &str) -> DispatchReport {
        self.emit(EventName::DataLoading, json!({ "dataset": dataset }))
    }

    /// Emit a data ready event
    pub fn data_ready(&self, dataset: &str, records: usize) -> DispatchReport {
        self.emit(EventName::DataReady, json!({ "dataset": dataset, "records": records }))
    }

    /// Emit a data error event
    pub fn data_error(&self, dataset: &str, message: &str) -> DispatchReport {
        self.emit(EventName::DataError, json!({ "dataset": dataset, "message": message }))
    }

    /// Emit a layer selected event
    pub fn layer_selected(&self, layer: &str) -> DispatchReport {
        self.emit(EventName::LayerSelected, json!({ "layer": layer }))
    }
}
