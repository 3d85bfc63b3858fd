//! Relay node configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::time::Duration;
use unustasis_shared::timing;

/// Default RFCOMM channel the wear link listens on
pub const DEFAULT_RFCOMM_CHANNEL: u8 = 7;

/// Placeholder replaced by the command URI in program templates
pub const URI_PLACEHOLDER: &str = "{uri}";

/// Where command frames from the wearable arrive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WearLinkConfig {
    /// Bluetooth RFCOMM listener
    Rfcomm { channel: u8 },
    /// Plain TCP listener for simulation without a wearable
    Tcp { address: String },
}

impl Default for WearLinkConfig {
    fn default() -> Self {
        WearLinkConfig::Rfcomm {
            channel: DEFAULT_RFCOMM_CHANNEL,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub wear_link: WearLinkConfig,
    /// Unix socket the in-process command listener accepts messages on
    #[serde(default = "default_pipe_socket")]
    pub pipe_socket: PathBuf,
    /// Starts the background host
    #[serde(default = "default_host_start")]
    pub host_start: Vec<String>,
    /// Hands `{uri}` to the background widget callback
    #[serde(default = "default_broadcast")]
    pub broadcast: Vec<String>,
    /// Opens `{uri}` in the foreground application
    #[serde(default = "default_deep_link")]
    pub deep_link: Vec<String>,
    /// Wait before re-checking for the in-process listener
    #[serde(default = "default_readiness_delay_ms")]
    pub readiness_delay_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            wear_link: WearLinkConfig::default(),
            pipe_socket: default_pipe_socket(),
            host_start: default_host_start(),
            broadcast: default_broadcast(),
            deep_link: default_deep_link(),
            readiness_delay_ms: default_readiness_delay_ms(),
            log_level: default_log_level(),
        }
    }
}

fn default_pipe_socket() -> PathBuf {
    std::env::temp_dir().join("unustasis-service.sock")
}
fn default_host_start() -> Vec<String> {
    args(&[
        "am",
        "start-foreground-service",
        "-n",
        "de.freal.unustasis/id.flutter.flutter_background_service.BackgroundService",
    ])
}
fn default_broadcast() -> Vec<String> {
    args(&[
        "am",
        "broadcast",
        "-a",
        "es.antonborri.home_widget.action.BACKGROUND",
        "-d",
        URI_PLACEHOLDER,
        "-n",
        "de.freal.unustasis/es.antonborri.home_widget.HomeWidgetBackgroundReceiver",
    ])
}
fn default_deep_link() -> Vec<String> {
    args(&[
        "am",
        "start",
        "-a",
        "android.intent.action.VIEW",
        "-c",
        "android.intent.category.BROWSABLE",
        "-d",
        URI_PLACEHOLDER,
    ])
}
fn default_readiness_delay_ms() -> u64 {
    timing::SERVICE_START_DELAY_MS
}
fn default_log_level() -> String {
    "info".to_string()
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

impl RelayConfig {
    /// Load from a JSON file, missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn readiness_delay(&self) -> Duration {
        Duration::from_millis(self.readiness_delay_ms)
    }
}
