//! Event Bus for consumer-to-consumer notifications
//!
//! Consumers never call each other directly: they emit named events and listen
//! for the ones they care about. The bus keeps a bounded history for debugging
//! and replay, and runs a middleware chain on every emit.
//!
//! # Dispatch pass
//!
//! ```text
//!   emit("data:ready", payload)
//!        │
//!        ▼
//!   collect listeners ──► middleware chain ──► sequential dispatch ──► history
//!   (snapshot, by          (transform or        (errors and panics
//!    registration order)    veto)                logged, never raised)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use substrate::events::{EventBus, EventName};
//! use serde_json::json;
//!
//! let bus = EventBus::with_default_capacity();
//!
//! let sub = bus.on(EventName::DataReady, |event| {
//!     println!("ready: {}", event.payload);
//!     Ok(())
//! });
//!
//! bus.emit(EventName::DataReady, json!({ "dataset": "precincts" }));
//! sub.unsubscribe();
//! ```

mod bus;
mod middleware;
mod types;

pub use bus::{DEFAULT_HISTORY_CAPACITY, EventBus, EventEmitter, MiddlewareId, Subscription};
pub use middleware::{LoggingMiddleware, Middleware, MiddlewareAction, ReplayFilter};
pub use types::{DispatchReport, Event, EventName, ListenerId, ListenerInfo, WILDCARD, pattern_matches};
