//! ServiceContainer - named singletons with declared dependencies

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info};

use super::error::{BoxError, ContainerError};
use super::graph::DependencyGraph;
use super::service::{Instance, ResolvedDeps, Service};
use crate::sync::{lock, panic_message};

type Factory = dyn Fn(&ResolvedDeps) -> eyre::Result<Instance> + Send + Sync;

struct Entry {
    name: String,
    deps: Vec<String>,
    factory: Arc<Factory>,
    /// Held while the factory runs so concurrent resolves build once
    building: Arc<Mutex<()>>,
    instance: Option<Instance>,
    /// Its `initialize` hook succeeded since the last cleanup
    initialized: bool,
}

#[derive(Default)]
struct Registry {
    entries: Vec<Entry>,
    /// Names in the order their instances were created
    instantiated: Vec<String>,
    initialized: bool,
}

impl Registry {
    fn find(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.name == name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.name == name)
    }
}

/// Outcome of `ServiceContainer::cleanup`
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    /// Services whose cleanup hook succeeded, in the order it ran
    pub cleaned: Vec<String>,
    /// Services whose cleanup hook failed, with the failure message
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.cleaned.len() + self.failed.len()
    }
}

/// Registry of named singletons
///
/// Cheap to clone; clones share one registry. Factories run lazily on first
/// resolution, dependencies first. No registry lock is held while a factory
/// or hook runs.
#[derive(Clone, Default)]
pub struct ServiceContainer {
    registry: Arc<Mutex<Registry>>,
    /// Serializes `initialize_all` and `cleanup`
    lifecycle: Arc<tokio::sync::Mutex<()>>,
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    // === Registration ===

    /// Register a lazily-constructed singleton
    ///
    /// The factory receives the resolved `deps` in declared order.
    pub fn register_singleton<T, F>(&self, name: impl Into<String>, deps: &[&str], factory: F) -> Result<(), ContainerError>
    where
        T: Service,
        F: Fn(&ResolvedDeps) -> eyre::Result<T> + Send + Sync + 'static,
    {
        let factory: Arc<Factory> = Arc::new(move |resolved: &ResolvedDeps| factory(resolved).map(Instance::new));
        self.register(name.into(), deps.iter().map(|d| d.to_string()).collect(), factory)
    }

    /// Register an already-built value as a dependency-free singleton
    pub fn register_instance<T: Service>(&self, name: impl Into<String>, value: T) -> Result<(), ContainerError> {
        let instance = Instance::new(value);
        let factory: Arc<Factory> = Arc::new(move |_: &ResolvedDeps| Ok(instance.clone()));
        self.register(name.into(), Vec::new(), factory)
    }

    fn register(&self, name: String, deps: Vec<String>, factory: Arc<Factory>) -> Result<(), ContainerError> {
        debug!(%name, ?deps, "register: called");
        let mut registry = lock(&self.registry);
        if registry.find(&name).is_some() {
            debug!(%name, "register: duplicate name");
            return Err(ContainerError::DuplicateService { name });
        }
        registry.entries.push(Entry {
            name,
            deps,
            factory,
            building: Arc::new(Mutex::new(())),
            instance: None,
            initialized: false,
        });
        Ok(())
    }

    // === Resolution ===

    /// Resolve `name` as a concrete service type, constructing it on first access
    pub fn resolve<T: Service>(&self, name: &str) -> Result<Arc<T>, ContainerError> {
        self.resolve_root(name)?.downcast(name)
    }

    /// Resolve `name` without naming its type
    pub fn resolve_service(&self, name: &str) -> Result<Arc<dyn Service>, ContainerError> {
        Ok(self.resolve_root(name)?.service)
    }

    /// Check everything `name` reaches before taking any build lock
    ///
    /// An acyclic sub-graph means two resolving threads can never wait on
    /// each other's build locks.
    fn resolve_root(&self, name: &str) -> Result<Instance, ContainerError> {
        if let Some(instance) = lock(&self.registry).find(name).and_then(|e| e.instance.clone()) {
            return Ok(instance);
        }
        self.dependency_graph().validate_from(name)?;
        self.resolve_instance(name, &mut Vec::new())
    }

    fn resolve_instance(&self, name: &str, stack: &mut Vec<String>) -> Result<Instance, ContainerError> {
        debug!(%name, depth = stack.len(), "resolve_instance: called");
        if let Some(pos) = stack.iter().position(|n| n == name) {
            let mut path = stack[pos..].to_vec();
            path.push(name.to_string());
            debug!(?path, "resolve_instance: cycle detected");
            return Err(ContainerError::CircularDependency { path });
        }

        let (deps, factory, building) = {
            let registry = lock(&self.registry);
            let entry = registry
                .find(name)
                .ok_or_else(|| ContainerError::unknown(name, stack.last().map(String::as_str)))?;
            if let Some(instance) = &entry.instance {
                return Ok(instance.clone());
            }
            (entry.deps.clone(), entry.factory.clone(), entry.building.clone())
        };

        let _building = lock(&building);
        if let Some(instance) = lock(&self.registry).find(name).and_then(|e| e.instance.clone()) {
            debug!(%name, "resolve_instance: built while waiting");
            return Ok(instance);
        }

        stack.push(name.to_string());
        let mut resolved = Vec::with_capacity(deps.len());
        for dep in deps {
            let instance = self.resolve_instance(&dep, stack)?;
            resolved.push((dep, instance));
        }
        stack.pop();

        debug!(%name, "resolve_instance: running factory");
        let resolved = ResolvedDeps::new(resolved);
        let instance = match panic::catch_unwind(AssertUnwindSafe(|| factory(&resolved))) {
            Ok(Ok(instance)) => instance,
            Ok(Err(e)) => {
                return Err(ContainerError::Construction {
                    service: name.to_string(),
                    source: e.into(),
                });
            }
            Err(payload) => {
                return Err(ContainerError::Construction {
                    service: name.to_string(),
                    source: format!("factory panicked: {}", panic_message(payload.as_ref())).into(),
                });
            }
        };

        let mut registry = lock(&self.registry);
        if let Some(entry) = registry.find_mut(name) {
            entry.instance = Some(instance.clone());
        }
        registry.instantiated.push(name.to_string());
        Ok(instance)
    }

    // === Lifecycle ===

    /// Order in which `initialize_all` builds and initializes services
    ///
    /// Never instantiates anything.
    pub fn topological_order(&self) -> Result<Vec<String>, ContainerError> {
        self.dependency_graph().topological_order()
    }

    /// Build every service in dependency order, then await each `initialize` hook in that order
    ///
    /// The whole graph is validated before any factory runs. A second call on
    /// an initialized container does nothing. After a failed call, retrying
    /// skips services whose `initialize` already succeeded.
    pub async fn initialize_all(&self) -> Result<Vec<String>, ContainerError> {
        let _guard = self.lifecycle.lock().await;
        if lock(&self.registry).initialized {
            debug!("initialize_all: already initialized");
            return Ok(Vec::new());
        }

        let order = self.topological_order()?;
        debug!(?order, "initialize_all: called");

        let mut instances = Vec::with_capacity(order.len());
        for name in &order {
            instances.push((name.clone(), self.resolve_instance(name, &mut Vec::new())?.service));
        }

        for (name, service) in &instances {
            if lock(&self.registry).find(name).is_some_and(|e| e.initialized) {
                debug!(%name, "initialize_all: already initialized");
                continue;
            }
            debug!(%name, "initialize_all: initializing");
            let result = AssertUnwindSafe(service.initialize()).catch_unwind().await;
            let failure: Option<BoxError> = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.into()),
                Err(payload) => Some(format!("initialize panicked: {}", panic_message(payload.as_ref())).into()),
            };
            if let Some(source) = failure {
                error!(service = %name, error = %source, "Service initialization failed");
                return Err(ContainerError::Initialization {
                    service: name.clone(),
                    source,
                });
            }
            if let Some(entry) = lock(&self.registry).find_mut(name) {
                entry.initialized = true;
            }
        }

        lock(&self.registry).initialized = true;
        info!(services = order.len(), "All services initialized");
        Ok(order)
    }

    /// Run every instantiated service's `cleanup` hook, newest first, then drop all instances
    ///
    /// Failures are logged and reported, never returned. Calling it again, or
    /// on a container that never initialized, does nothing.
    pub async fn cleanup(&self) -> CleanupReport {
        let _guard = self.lifecycle.lock().await;
        let services: Vec<(String, Arc<dyn Service>)> = {
            let mut registry = lock(&self.registry);
            let order = std::mem::take(&mut registry.instantiated);
            registry.initialized = false;
            order
                .into_iter()
                .rev()
                .filter_map(|name| {
                    let entry = registry.find_mut(&name)?;
                    entry.initialized = false;
                    let instance = entry.instance.take()?;
                    Some((name, instance.service))
                })
                .collect()
        };

        let mut report = CleanupReport::default();
        if services.is_empty() {
            debug!("cleanup: nothing to clean up");
            return report;
        }

        debug!(count = services.len(), "cleanup: called");
        for (name, service) in services {
            match AssertUnwindSafe(service.cleanup()).catch_unwind().await {
                Ok(Ok(())) => report.cleaned.push(name),
                Ok(Err(e)) => {
                    error!(service = %name, error = %e, "Service cleanup failed");
                    report.failed.push((name, e.to_string()));
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(service = %name, panic = %message, "Service cleanup panicked");
                    report.failed.push((name, message));
                }
            }
        }

        info!(cleaned = report.cleaned.len(), failed = report.failed.len(), "Services cleaned up");
        report
    }

    // === Introspection ===

    /// Adjacency list of every registration, in registration order
    pub fn dependency_graph(&self) -> DependencyGraph {
        lock(&self.registry)
            .entries
            .iter()
            .map(|e| (e.name.clone(), e.deps.clone()))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.registry).find(name).is_some()
    }

    pub fn is_instantiated(&self, name: &str) -> bool {
        lock(&self.registry).find(name).is_some_and(|e| e.instance.is_some())
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.registry).initialized
    }

    /// Registered names, in registration order
    pub fn service_names(&self) -> Vec<String> {
        lock(&self.registry).entries.iter().map(|e| e.name.clone()).collect()
    }

    /// Instantiated names, in instantiation order
    pub fn instantiated_names(&self) -> Vec<String> {
        lock(&self.registry).instantiated.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = lock(&self.registry);
        f.debug_struct("ServiceContainer")
            .field("services", &registry.entries.len())
            .field("instantiated", &registry.instantiated.len())
            .field("initialized", &registry.initialized)
            .finish()
    }
}
