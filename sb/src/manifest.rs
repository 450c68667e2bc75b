//! Service manifests for graph diagnostics
//!
//! A manifest lists service names and their dependencies without any code:
//!
//! ```yaml
//! services:
//!   - name: eventBus
//!   - name: stateManager
//!     deps: [eventBus]
//!   - name: mapManager
//!     deps: [eventBus, stateManager]
//! ```

use async_trait::async_trait;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::container::{ContainerError, DependencyGraph, Service, ServiceContainer};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    #[serde(default)]
    pub deps: Vec<String>,
}

impl Manifest {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).context(format!("Failed to read manifest {}", path.display()))?;
        Self::from_yaml(&content).context(format!("Failed to parse manifest {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let manifest: Self = serde_yaml::from_str(content)?;
        debug!(services = manifest.services.len(), "Manifest::from_yaml: parsed");
        Ok(manifest)
    }

    pub fn graph(&self) -> DependencyGraph {
        self.services.iter().map(|s| (s.name.clone(), s.deps.clone())).collect()
    }

    /// Container with one placeholder service per entry
    pub fn container(&self) -> Result<ServiceContainer, ContainerError> {
        let container = ServiceContainer::new();
        for entry in &self.services {
            let deps: Vec<&str> = entry.deps.iter().map(String::as_str).collect();
            let name = entry.name.clone();
            container.register_singleton(entry.name.clone(), &deps, move |_| Ok(Placeholder { name: name.clone() }))?;
        }
        Ok(container)
    }
}

/// Stand-in for a manifest service; its hooks only log
struct Placeholder {
    name: String,
}

#[async_trait]
impl Service for Placeholder {
    async fn initialize(&self) -> eyre::Result<()> {
        debug!(name = %self.name, "Placeholder::initialize: called");
        Ok(())
    }

    async fn cleanup(&self) -> eyre::Result<()> {
        debug!(name = %self.name, "Placeholder::cleanup: called");
        Ok(())
    }
}
