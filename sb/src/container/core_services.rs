//! Core services: the event bus and the state manager as container services

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::error::ContainerError;
use super::registry::ServiceContainer;
use super::service::Service;
use crate::config::Config;
use crate::events::EventBus;
use crate::state::{StateManager, StateStorage};

/// Registered name of the event bus
pub const EVENT_BUS: &str = "eventBus";

/// Registered name of the state manager
pub const STATE_MANAGER: &str = "stateManager";

#[async_trait]
impl Service for EventBus {
    async fn initialize(&self) -> eyre::Result<()> {
        debug!(history_capacity = self.history_capacity(), "EventBus::initialize: called");
        Ok(())
    }

    /// Listeners still registered at teardown were never unsubscribed by their owner
    async fn cleanup(&self) -> eyre::Result<()> {
        let leaked = self.total_listeners();
        if leaked > 0 {
            warn!(leaked, patterns = ?self.patterns(), "Event listeners still registered at cleanup");
        }
        self.clear_listeners();
        self.clear_history();
        Ok(())
    }
}

#[async_trait]
impl Service for StateManager {
    async fn initialize(&self) -> eyre::Result<()> {
        info!(keys = self.keys().len(), "State manager ready");
        Ok(())
    }

    async fn cleanup(&self) -> eyre::Result<()> {
        if self.has_storage() && !self.config().persisted_keys.is_empty() && !self.persist_configured() {
            eyre::bail!("failed to persist state at cleanup");
        }
        Ok(())
    }
}

/// Register `eventBus` and `stateManager` (which depends on it)
///
/// The state manager emits `state:changed` on the bus unless
/// `state.emit-events` is off, and persists through `storage` when given.
pub fn register_core_services(
    container: &ServiceContainer,
    config: &Config,
    storage: Option<Arc<dyn StateStorage>>,
) -> Result<(), ContainerError> {
    debug!(has_storage = storage.is_some(), "register_core_services: called");

    let events = config.events.clone();
    container.register_singleton(EVENT_BUS, &[], move |_| Ok(EventBus::from_config(&events)))?;

    let state = config.state.clone();
    container.register_singleton(STATE_MANAGER, &[EVENT_BUS], move |deps| {
        let mut builder = StateManager::builder().config(state.clone());
        if state.emit_events {
            let bus = deps.get::<EventBus>(EVENT_BUS)?;
            builder = builder.event_bus(EventBus::clone(&bus));
        }
        if let Some(storage) = &storage {
            builder = builder.shared_storage(storage.clone());
        }
        Ok(builder.build())
    })
}
