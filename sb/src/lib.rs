//! Substrate - component runtime for an interactive dashboard
//!
//! Three independent building blocks that consumers (map wrappers, widgets,
//! feature modules) use to find and talk to each other without direct calls.
//!
//! # Core Concepts
//!
//! - **Named singletons**: every consumer is a service in one explicit
//!   [`ServiceContainer`], built and initialized in dependency order
//! - **Shared state**: one reactive key/value store with key-indexed
//!   subscribers, change history and optional persistence
//! - **Named events**: ordered pub/sub with wildcard patterns, middleware and
//!   a bounded history
//!
//! # Modules
//!
//! - [`container`] - Service container and lifecycle
//! - [`state`] - Reactive state store and persistence
//! - [`events`] - Event bus, middleware and emitters
//! - [`config`] - Configuration types and loading
//! - [`manifest`] - Code-free service manifests for graph diagnostics
//! - [`demo`] - Sample consumer and scenario
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod container;
pub mod demo;
pub mod events;
pub mod manifest;
pub mod state;

mod sync;

pub use config::Config;
pub use container::{ContainerError, Service, ServiceContainer};
pub use events::{Event, EventBus, EventName};
pub use state::{StateManager, StateStorage};
