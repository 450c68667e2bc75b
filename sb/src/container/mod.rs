//! Service Container - named singletons resolved in dependency order
//!
//! Every consumer registers a factory under a unique name together with the
//! names it depends on. Nothing is built at registration; `resolve` builds a
//! service and its dependencies on first access, and `initialize_all` builds
//! the whole graph in topological order before awaiting each service's
//! `initialize` hook in that same order.
//!
//! ```rust,ignore
//! use substrate::container::{ServiceContainer, EVENT_BUS, STATE_MANAGER, register_core_services};
//!
//! let container = ServiceContainer::new();
//! register_core_services(&container, &config, None)?;
//! container.register_singleton("mapManager", &[EVENT_BUS, STATE_MANAGER], |deps| {
//!     MapManager::new(deps.at(0)?, deps.at(1)?)
//! })?;
//!
//! container.initialize_all().await?;
//! // ...
//! container.cleanup().await;
//! ```

mod core_services;
mod error;
mod graph;
mod registry;
mod service;

pub use core_services::{EVENT_BUS, STATE_MANAGER, register_core_services};
pub use error::{BoxError, ContainerError};
pub use graph::{DependencyGraph, ServiceNode};
pub use registry::{CleanupReport, ServiceContainer};
pub use service::{ResolvedDeps, Service};
