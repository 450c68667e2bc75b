//! Container error types

use thiserror::Error;

/// Boxed error from a user factory or lifecycle hook
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors from registering, resolving or initializing services
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Service '{name}' is already registered")]
    DuplicateService { name: String },

    #[error("Unknown service '{name}'{}", required_by_suffix(.required_by))]
    UnknownService { name: String, required_by: Option<String> },

    #[error("Circular dependency detected: {}", .path.join(" → "))]
    CircularDependency { path: Vec<String> },

    #[error("Failed to construct service '{service}': {source}")]
    Construction {
        service: String,
        #[source]
        source: BoxError,
    },

    #[error("Failed to initialize service '{service}': {source}")]
    Initialization {
        service: String,
        #[source]
        source: BoxError,
    },

    #[error("Service '{service}' is not a {expected}")]
    TypeMismatch { service: String, expected: &'static str },
}

fn required_by_suffix(required_by: &Option<String>) -> String {
    match required_by {
        Some(parent) => format!(" (required by '{}')", parent),
        None => String::new(),
    }
}

impl ContainerError {
    pub(crate) fn unknown(name: impl Into<String>, required_by: Option<&str>) -> Self {
        Self::UnknownService {
            name: name.into(),
            required_by: required_by.map(str::to_string),
        }
    }

    /// Name of the service the error is about
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::DuplicateService { name } | Self::UnknownService { name, .. } => Some(name.as_str()),
            Self::Construction { service, .. }
            | Self::Initialization { service, .. }
            | Self::TypeMismatch { service, .. } => Some(service.as_str()),
            Self::CircularDependency { path } => path.first().map(String::as_str),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_service_message() {
        let err = ContainerError::unknown("missing", None);
        assert_eq!(err.to_string(), "Unknown service 'missing'");

        let err = ContainerError::unknown("missing", Some("mapManager"));
        let msg = err.to_string();
        assert!(msg.contains("missing"));
        assert!(msg.contains("mapManager"));
    }

    #[test]
    fn test_circular_dependency_message() {
        let err = ContainerError::CircularDependency {
            path: vec!["A".into(), "B".into(), "A".into()],
        };
        assert_eq!(err.to_string(), "Circular dependency detected: A → B → A");
        assert_eq!(err.service(), Some("A"));
    }

    #[test]
    fn test_construction_keeps_source() {
        let report = eyre::eyre!("tile server unreachable");
        let err = ContainerError::Construction {
            service: "mapManager".into(),
            source: report.into(),
        };
        assert!(err.to_string().contains("tile server unreachable"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
