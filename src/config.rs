//! Widget agent configuration

use crate::command::CommandConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::time::Duration;
use unustasis_shared::timing;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Shared widget state file; defaults to the per-user data directory
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            connection_timeout_ms: default_connection_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            log_level: default_log_level(),
        }
    }
}

fn default_connection_timeout_ms() -> u64 {
    timing::CONNECTION_TIMEOUT_MS
}
fn default_write_timeout_ms() -> u64 {
    timing::WRITE_TIMEOUT_MS
}
fn default_log_level() -> String {
    "info".to_string()
}

impl AgentConfig {
    /// Load from a JSON file, missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn command_config(&self) -> CommandConfig {
        CommandConfig {
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }

    pub fn resolve_store_path(&self) -> Result<PathBuf> {
        match &self.store_path {
            Some(path) => Ok(path.clone()),
            None => default_store_path(),
        }
    }
}

/// `<data dir>/unustasis/widget_state.json`
pub fn default_store_path() -> Result<PathBuf> {
    let mut path =
        dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
    path.push("unustasis");
    path.push("widget_state.json");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        let command = config.command_config();
        assert_eq!(command.connection_timeout, Duration::from_secs(15));
        assert_eq!(command.write_timeout, Duration::from_secs(5));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"write_timeout_ms": 2000, "store_path": "/tmp/w.json"}"#)
                .unwrap();
        assert_eq!(config.write_timeout_ms, 2000);
        assert_eq!(config.connection_timeout_ms, 15_000);
        assert_eq!(config.resolve_store_path().unwrap(), PathBuf::from("/tmp/w.json"));
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let err = AgentConfig::load(Path::new("/nonexistent/agent.json")).unwrap_err();
        assert!(err.to_string().contains("reading config"));
    }
}
