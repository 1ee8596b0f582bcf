use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::adapters::BeaconConfig;
use crate::core::orchestrator::TransferConfig;
use crate::core::registry::DEFAULT_EVENT_CAPACITY;

const DEFAULT_CONFIG_FILE: &str = "nxlink.toml";
const ENV_PREFIX: &str = "NXLINK_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub discovery: DiscoveryConfig,
    pub client: ClientConfig,
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub bind: SocketAddr,
    pub broadcast: SocketAddr,
    pub probe_interval_secs: u64,
    pub stale_after_secs: u64,
    /// How far a registry observer may fall behind before it misses events
    pub event_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub poll_interval_ms: u64,
    pub temp_dir: PathBuf,
    pub format: String,
    pub include_updates: bool,
    pub include_dlc: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            simulation: false,
            verbose: false,
            json_logs: false,
            discovery: DiscoveryConfig::default(),
            client: ClientConfig::default(),
            transfer: TransferSettings::default(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let beacon = BeaconConfig::default();
        Self {
            bind: beacon.bind,
            broadcast: beacon.broadcast,
            probe_interval_secs: beacon.probe_interval.as_secs(),
            stale_after_secs: beacon.stale_after.as_secs(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: crate::adapters::DEFAULT_REQUEST_TIMEOUT.as_secs(),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        let transfer = TransferConfig::default();
        Self {
            poll_interval_ms: transfer.poll_interval.as_millis() as u64,
            temp_dir: transfer.temp_dir,
            format: transfer.format,
            include_updates: transfer.include_updates,
            include_dlc: transfer.include_dlc,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the config file, `NXLINK_*` env vars and CLI overrides,
    /// in that order.
    ///
    /// `overrides` is any serializable set of CLI args; fields skipped during
    /// serialization leave lower layers untouched.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let file = config_file.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        if config_file.is_some() && !file.exists() {
            anyhow::bail!("Config file not found: {}", file.display());
        }

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract().context("Failed to load configuration")
    }
}

impl DiscoveryConfig {
    pub fn beacon_config(&self) -> BeaconConfig {
        BeaconConfig {
            bind: self.bind,
            broadcast: self.broadcast,
            probe_interval: Duration::from_secs(self.probe_interval_secs.max(1)),
            stale_after: Duration::from_secs(self.stale_after_secs.max(1)),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl TransferSettings {
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            temp_dir: self.temp_dir.clone(),
            format: self.format.clone(),
            include_updates: self.include_updates,
            include_dlc: self.include_dlc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        simulation: Option<bool>,
    }

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = AppConfig::default();
        assert_eq!(config.discovery.bind.port(), 8765);
        assert_eq!(config.discovery.probe_interval_secs, 5);
        assert_eq!(config.discovery.stale_after_secs, 30);
        assert_eq!(config.discovery.event_capacity, 64);
        assert_eq!(config.client.request_timeout_secs, 30);
        assert_eq!(config.transfer.poll_interval_ms, 2000);
        assert_eq!(config.transfer.format, "nsp");
    }

    #[test]
    fn test_file_then_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "simulation = false\n[transfer]\nformat = \"xci\"\npoll_interval_ms = 250"
        )
        .unwrap();

        let overrides = Overrides {
            simulation: Some(true),
        };
        let config = AppConfig::new(Some(file.path()), Some(&overrides)).unwrap();

        assert!(config.simulation);
        assert_eq!(config.transfer.format, "xci");
        assert_eq!(
            config.transfer.transfer_config().poll_interval,
            Duration::from_millis(250)
        );
        // Untouched sections keep their defaults
        assert_eq!(config.discovery, DiscoveryConfig::default());
    }

    #[test]
    fn test_unset_override_keeps_lower_layer() {
        let overrides = Overrides { simulation: None };
        let config = AppConfig::new(None, Some(&overrides)).unwrap();
        assert!(!config.simulation);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = AppConfig::new::<Overrides>(Some(Path::new("/nonexistent/nxlink.toml")), None);
        assert!(result.is_err());
    }
}
