//! Demo scenario: core services plus one sample consumer
//!
//! `mapManager` depends on both core services. It listens for dataset
//! selections on the bus, records the choice in state, announces loading and
//! readiness, and derives a layer style whenever the map opacity changes.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use eyre::Result;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::Config;
use crate::container::{
    CleanupReport, EVENT_BUS, STATE_MANAGER, Service, ServiceContainer, register_core_services,
};
use crate::events::{EventBus, EventEmitter, EventName, Subscription};
use crate::state::{MemoryStorage, StateManager, StateMap, StateSubscription};
use crate::sync::lock;

/// Registered name of the sample consumer
pub const MAP_MANAGER: &str = "mapManager";

/// Sample consumer wired only through the bus and the state store
pub struct MapManager {
    bus: EventBus,
    state: StateManager,
    emitter: EventEmitter,
    listeners: Mutex<Vec<Subscription>>,
    watchers: Mutex<Vec<StateSubscription>>,
}

impl MapManager {
    pub fn new(bus: EventBus, state: StateManager) -> Self {
        let emitter = bus.emitter_for(MAP_MANAGER);
        Self {
            bus,
            state,
            emitter,
            listeners: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Service for MapManager {
    async fn initialize(&self) -> eyre::Result<()> {
        debug!("MapManager::initialize: called");
        let state = self.state.clone();
        let emitter = self.emitter.clone();
        let on_dataset = self.bus.on(EventName::DatasetChanged, move |event| {
            let dataset = event.payload["dataset"].as_str().unwrap_or("unknown").to_string();
            emitter.data_loading(&dataset);
            state.set("currentDataset", json!(dataset), MAP_MANAGER)?;
            emitter.data_ready(&dataset, 3);
            Ok(())
        });
        lock(&self.listeners).push(on_dataset);

        let state = self.state.clone();
        let on_opacity = self.state.subscribe("mapOpacity", move |change| {
            let opacity = change.value("mapOpacity").cloned().unwrap_or(json!(1.0));
            state.set("layerStyle", json!({ "fillOpacity": opacity }), MAP_MANAGER)?;
            Ok(())
        });
        lock(&self.watchers).push(on_opacity);
        Ok(())
    }

    async fn cleanup(&self) -> eyre::Result<()> {
        debug!("MapManager::cleanup: called");
        for subscription in lock(&self.listeners).drain(..) {
            subscription.unsubscribe();
        }
        for subscription in lock(&self.watchers).drain(..) {
            subscription.unsubscribe();
        }
        Ok(())
    }
}

/// What the demo scenario observed
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub init_order: Vec<String>,
    /// Services constructed during the run, in construction order
    pub instantiated: Vec<String>,
    /// Events the picker emitted that no listener received
    pub unheard: Vec<String>,
    /// Event names in emission order, with their source
    pub events: Vec<(String, Option<String>)>,
    /// State history as (source, changed keys)
    pub state_history: Vec<(String, Vec<String>)>,
    pub final_state: StateMap,
    pub cleanup: CleanupReport,
}

/// Build the demo container over in-memory storage
pub fn demo_container(config: &Config) -> Result<ServiceContainer> {
    let container = ServiceContainer::new();
    register_core_services(&container, config, Some(Arc::new(MemoryStorage::new())))?;
    container.register_singleton(MAP_MANAGER, &[EVENT_BUS, STATE_MANAGER], |deps| {
        let bus = deps.get::<EventBus>(EVENT_BUS)?;
        let state = deps.get::<StateManager>(STATE_MANAGER)?;
        Ok(MapManager::new(EventBus::clone(&bus), StateManager::clone(&state)))
    })?;
    Ok(container)
}

/// Boot, select a dataset, change the opacity, tear down
pub async fn run_demo(config: &Config) -> Result<DemoReport> {
    let container = demo_container(config)?;
    let init_order = container.initialize_all().await?;
    info!(?init_order, "Demo container initialized");

    let bus = container.resolve::<EventBus>(EVENT_BUS)?;
    let state = container.resolve::<StateManager>(STATE_MANAGER)?;

    let picker = bus.emitter_for("datasetPicker");
    let unheard = [
        picker.emit(EventName::DatasetChanged, json!({ "dataset": "precincts-2024" })),
        picker.layer_selected("precincts"),
    ]
    .into_iter()
    .filter(|report| report.is_unheard())
    .map(|report| report.event)
    .collect();
    state.set("mapOpacity", json!(0.6), "legend")?;

    let events = bus
        .history()
        .into_iter()
        .map(|event| (event.name.to_string(), event.source))
        .collect();
    let state_history = state
        .history()
        .into_iter()
        .map(|entry| (entry.source, entry.changes.keys().cloned().collect()))
        .collect();
    let final_state = state.get_state();
    let instantiated = container.instantiated_names();

    let cleanup = container.cleanup().await;
    Ok(DemoReport {
        init_order,
        instantiated,
        unheard,
        events,
        state_history,
        final_state,
        cleanup,
    })
}
