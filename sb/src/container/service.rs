//! Service trait and resolved-dependency handles

use std::any::{Any, type_name};
use std::sync::Arc;

use async_trait::async_trait;

use super::error::ContainerError;

/// A value managed by the container
///
/// Both hooks default to doing nothing. `initialize` runs once, after every
/// dependency has been initialized; `cleanup` runs at teardown in reverse
/// order. Hooks take `&self`, so services that change on initialization keep
/// that state behind their own interior mutability.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn initialize(&self) -> eyre::Result<()> {
        Ok(())
    }

    async fn cleanup(&self) -> eyre::Result<()> {
        Ok(())
    }
}

/// A constructed singleton, held both as a service and as a downcastable value
#[derive(Clone)]
pub(crate) struct Instance {
    pub(crate) service: Arc<dyn Service>,
    any: Arc<dyn Any + Send + Sync>,
}

impl Instance {
    pub(crate) fn new<T: Service>(value: T) -> Self {
        let value = Arc::new(value);
        Self {
            any: value.clone(),
            service: value,
        }
    }

    pub(crate) fn downcast<T: Service>(&self, name: &str) -> Result<Arc<T>, ContainerError> {
        self.any.clone().downcast::<T>().map_err(|_| ContainerError::TypeMismatch {
            service: name.to_string(),
            expected: type_name::<T>(),
        })
    }
}

/// Dependencies handed to a factory, in the order they were declared
pub struct ResolvedDeps {
    entries: Vec<(String, Instance)>,
}

impl ResolvedDeps {
    pub(crate) fn new(entries: Vec<(String, Instance)>) -> Self {
        Self { entries }
    }

    /// Dependency by name
    pub fn get<T: Service>(&self, name: &str) -> Result<Arc<T>, ContainerError> {
        let (name, instance) = self
            .entries
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| ContainerError::unknown(name, None))?;
        instance.downcast(name)
    }

    /// Dependency by declared position
    pub fn at<T: Service>(&self, index: usize) -> Result<Arc<T>, ContainerError> {
        let (name, instance) = self
            .entries
            .get(index)
            .ok_or_else(|| ContainerError::unknown(format!("#{}", index), None))?;
        instance.downcast(name)
    }

    /// Dependency as a bare service
    pub fn service(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, instance)| instance.service.clone())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ResolvedDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
