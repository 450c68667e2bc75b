//! Substrate configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main substrate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event bus settings
    pub events: EventsConfig,

    /// State store settings
    pub state: StateConfig,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .substrate.yml
        let local_config = PathBuf::from(".substrate.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/substrate/substrate.yml
        if let Some(user_config) = user_config_path() {
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    ///
    /// Any failure yields None; the full load reports it later.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates = match config_path {
            Some(path) => vec![path.clone()],
            None => [Some(PathBuf::from(".substrate.yml")), user_config_path()]
                .into_iter()
                .flatten()
                .collect(),
        };
        candidates
            .iter()
            .find(|p| p.exists())
            .and_then(|p| fs::read_to_string(p).ok())
            .and_then(|content| serde_yaml::from_str::<Config>(&content).ok())
            .and_then(|config| config.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("substrate").join("substrate.yml"))
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events kept in the history ring buffer (0 disables history)
    #[serde(rename = "max-history")]
    pub max_history: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            max_history: crate::events::DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// State store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Change entries kept in the history ring buffer (0 disables history)
    #[serde(rename = "max-history")]
    pub max_history: usize,

    /// Key of the persisted document in durable storage
    #[serde(rename = "storage-key")]
    pub storage_key: String,

    /// Directory used by file-backed storage
    #[serde(rename = "storage-dir")]
    pub storage_dir: PathBuf,

    /// State keys written to storage
    #[serde(rename = "persisted-keys")]
    pub persisted_keys: Vec<String>,

    /// Persist `persisted-keys` after every change touching them
    #[serde(rename = "auto-persist")]
    pub auto_persist: bool,

    /// Emit `state:changed` through the event bus when wired into a container
    #[serde(rename = "emit-events")]
    pub emit_events: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            max_history: crate::state::DEFAULT_HISTORY_CAPACITY,
            storage_key: crate::state::DEFAULT_STORAGE_KEY.to_string(),
            storage_dir: default_storage_dir(),
            persisted_keys: Vec::new(),
            auto_persist: false,
            emit_events: true,
        }
    }
}

fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("substrate")
        .join("state")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.events.max_history, 100);
        assert_eq!(config.state.max_history, 50);
        assert_eq!(config.state.storage_key, "dashboard-state");
        assert!(config.state.persisted_keys.is_empty());
        assert!(!config.state.auto_persist);
        assert!(config.state.emit_events);
        assert!(config.log_level.is_none());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
events:
  max-history: 10
state:
  persisted-keys: [currentDataset, mapOpacity]
  auto-persist: true
log-level: debug
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.events.max_history, 10);
        assert_eq!(config.state.persisted_keys, vec!["currentDataset", "mapOpacity"]);
        assert!(config.state.auto_persist);
        assert_eq!(config.state.max_history, 50);
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_load_explicit_path() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "state:\n  storage-key: custom-key").unwrap();
        let path = file.path().to_path_buf();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.state.storage_key, "custom-key");
        assert_eq!(Config::load_log_level(Some(&path)), None);
    }

    #[test]
    fn test_load_explicit_path_missing_fails() {
        let path = PathBuf::from("/nonexistent/substrate.yml");
        assert!(Config::load(Some(&path)).is_err());
        assert_eq!(Config::load_log_level(Some(&path)), None);
    }

    #[test]
    fn test_load_log_level() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "log-level: WARN").unwrap();
        let path = file.path().to_path_buf();
        assert_eq!(Config::load_log_level(Some(&path)).as_deref(), Some("WARN"));
    }
}
