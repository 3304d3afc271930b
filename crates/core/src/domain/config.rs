//! Configuration management for a house audio node
//!
//! This module provides:
//! - Configuration structs for the clock, routing, Bluetooth and monitor subsystems
//! - TOML (de)serialization with per-field defaults
//! - `ConfigManager` for the main config file with corrupt-file recovery

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument};

use crate::domain::audio::{DeviceId, Volume};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Deployment mode of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Single node, no clock sync, poor signal is only logged
    #[default]
    Standalone,
    /// Several nodes sharing a master clock
    Distributed,
}

/// Bounded retry with a fixed backoff between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 1000,
        }
    }
}

/// Node identity and connect defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Overrides the id derived from the hardware address
    pub id: Option<u64>,

    /// Output every newly connected source is routed to
    pub default_output: String,

    /// Volume applied to the default output after a connect
    pub default_volume: f32,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: None,
            default_output: "default".to_string(),
            default_volume: 0.7,
        }
    }
}

/// Clock synchronization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// `None` follows the mode (on for distributed, off for standalone)
    pub enabled: Option<bool>,

    /// Well-known datagram port shared by every node
    pub port: u16,

    pub election_window_ms: u64,

    /// Round trips per sampling round
    pub samples: usize,

    pub sample_timeout_ms: u64,

    /// Pause between two round trips of one round
    pub sample_spacing_ms: u64,

    /// Drift beyond this triggers a realign
    pub drift_threshold_us: u64,

    /// How long the master responder waits for a request per poll
    pub responder_poll_ms: u64,
}

impl ClockConfig {
    pub fn election_window(&self) -> Duration {
        Duration::from_millis(self.election_window_ms)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    pub fn sample_spacing(&self) -> Duration {
        Duration::from_millis(self.sample_spacing_ms)
    }

    pub fn drift_threshold(&self) -> Duration {
        Duration::from_micros(self.drift_threshold_us)
    }

    pub fn responder_poll(&self) -> Duration {
        Duration::from_millis(self.responder_poll_ms)
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            port: 319,
            election_window_ms: 1000,
            samples: 8,
            sample_timeout_ms: 500,
            sample_spacing_ms: 100,
            drift_threshold_us: 100,
            responder_poll_ms: 250,
        }
    }
}

/// Output discovery settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Retries while the graph reports zero outputs
    pub discovery: RetryPolicy,
}

/// Bluetooth settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub scan: RetryPolicy,

    /// Upper bound for pairing plus connecting
    pub connect_timeout_secs: u64,

    /// Settle time between connect and route creation
    pub stabilization_ms: u64,
}

impl BluetoothConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stabilization(&self) -> Duration {
        Duration::from_millis(self.stabilization_ms)
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            scan: RetryPolicy::default(),
            connect_timeout_secs: 30,
            stabilization_ms: 2000,
        }
    }
}

/// Polling intervals of the node monitors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sync_interval_ms: u64,
    pub signal_interval_standalone_ms: u64,
    pub signal_interval_distributed_ms: u64,
    pub network_interval_ms: u64,
    pub route_health_interval_ms: u64,
    pub state_refresh_interval_ms: u64,
}

impl MonitorConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn signal_interval(&self, mode: Mode) -> Duration {
        match mode {
            Mode::Standalone => Duration::from_millis(self.signal_interval_standalone_ms),
            Mode::Distributed => Duration::from_millis(self.signal_interval_distributed_ms),
        }
    }

    pub fn network_interval(&self) -> Duration {
        Duration::from_millis(self.network_interval_ms)
    }

    pub fn route_health_interval(&self) -> Duration {
        Duration::from_millis(self.route_health_interval_ms)
    }

    pub fn state_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.state_refresh_interval_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 1000,
            signal_interval_standalone_ms: 5000,
            signal_interval_distributed_ms: 1000,
            network_interval_ms: 5000,
            route_health_interval_ms: 5000,
            state_refresh_interval_ms: 5000,
        }
    }
}

/// Network condition thresholds (distributed mode)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub jitter_threshold_ms: u64,
}

impl NetworkConfig {
    pub fn jitter_threshold(&self) -> Duration {
        Duration::from_millis(self.jitter_threshold_ms)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            jitter_threshold_ms: 5,
        }
    }
}

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub mode: Mode,
    pub node: NodeSection,
    pub clock: ClockConfig,
    pub routing: RoutingConfig,
    pub bluetooth: BluetoothConfig,
    pub monitors: MonitorConfig,
    pub network: NetworkConfig,
}

impl NodeConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    /// Reject values the subsystems cannot work with
    pub fn validate(&self) -> Result<()> {
        if Volume::new(self.node.default_volume).is_none() {
            return Err(ConfigError::Invalid(format!(
                "node.default_volume must be within 0.0..=1.0, got {}",
                self.node.default_volume
            )));
        }
        if self.node.default_output.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "node.default_output must not be empty".to_string(),
            ));
        }
        if self.clock.samples == 0 {
            return Err(ConfigError::Invalid("clock.samples must be at least 1".to_string()));
        }
        if self.routing.discovery.attempts == 0 || self.bluetooth.scan.attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether this node runs the clock engine
    pub fn clock_enabled(&self) -> bool {
        self.clock
            .enabled
            .unwrap_or(self.mode == Mode::Distributed)
    }

    pub fn default_output(&self) -> DeviceId {
        DeviceId::new(self.node.default_output.clone())
    }
}

/// Configuration manager for the main node config
///
/// Manages the configuration file at `~/.config/house-audio/config.toml`.
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("config.toml");
        Self {
            config_dir,
            config_path,
        }
    }

    /// Manage an explicit file instead of the default location
    pub fn with_path(config_path: PathBuf) -> Self {
        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            config_dir,
            config_path,
        }
    }

    /// Returns `~/.config/house-audio` on Linux
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("house-audio"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file
    ///
    /// A missing file is replaced by the factory default, which is written
    /// back. A corrupt file is copied to `config.toml.corrupt` and the factory
    /// default is returned.
    #[instrument(skip(self))]
    pub async fn load(&self) -> NodeConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, creating factory default"
            );

            let config = NodeConfig::default();
            if let Err(e) = self.save(&config).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save factory default config"
                );
            }
            return config;
        }

        match NodeConfig::load_from_file(&self.config_path).await {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using factory default"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt config"
                    );
                }

                NodeConfig::default()
            }
        }
    }

    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &NodeConfig) -> Result<()> {
        fs::create_dir_all(&self.config_dir).await?;
        config.save_to_file(&self.config_path).await
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}
