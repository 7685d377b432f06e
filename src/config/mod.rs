//! # Configuration Management Module
//!
//! This module handles all configuration aspects of the Meshwatch system,
//! providing a centralized configuration layer with validation and defaults.
//!
//! ## Features
//!
//! - **Structured Configuration**: Type-safe configuration with serde serialization
//! - **Validation**: Range checks applied on load (save window, thresholds)
//! - **Defaults**: Sensible default values for every option
//! - **Hot Reloading**: The special-node table can be re-applied to a running
//!   tracker without discarding accumulated history
//!
//! ## Configuration Structure
//!
//! - [`MqttConfig`] - Broker connection settings for the transport feeder
//! - [`StorageConfig`] - Data directory and save throttle settings
//! - [`TrackerConfig`] - History capacity bounds and retention window
//! - [`GatewayConfig`] - Reliability scoring policy constants
//! - [`MovementConfig`] - Geofence threshold and alert cooldown
//! - [`SpecialNodeConfig`] - Per-node home origin table
//! - [`LoggingConfig`] - Logging and debugging settings
//!
//! ## Configuration File Format
//!
//! Meshwatch uses TOML for human-readable configuration:
//!
//! ```toml
//! [mqtt]
//! broker = "mqtt.meshtastic.org"
//! port = 1883
//! topic = "msh/US/2/json/#"
//!
//! [storage]
//! data_dir = "./data"
//! save_interval_secs = 30
//!
//! [special_nodes."!a1b2c3d4"]
//! name = "Trailer beacon"
//! origin_lat = 45.5231
//! origin_lon = -122.6765
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub movement: MovementConfig,
    pub logging: LoggingConfig,
    /// Nodes with a configured home origin, keyed by canonical node id.
    #[serde(default)]
    pub special_nodes: HashMap<String, SpecialNodeConfig>,
}

/// Broker connection settings for the bundled MQTT feeder.
///
/// The tracker core never touches the connection itself; these values are
/// consumed only by the transport task spawned from the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    /// Topic filter to subscribe, e.g. `msh/US/2/json/#`.
    pub topic: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// MQTT keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_client_id() -> String {
    "meshwatch".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            topic: "msh/US/2/json/#".to_string(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
    /// Snapshot file name inside `data_dir`.
    #[serde(default = "default_state_file")]
    pub state_file: String,
    /// Minimum seconds between two durable saves. Clamped to 5-60 on load.
    #[serde(default = "default_save_interval")]
    pub save_interval_secs: u64,
}

fn default_state_file() -> String {
    "nodes.json".to_string()
}

fn default_save_interval() -> u64 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            state_file: default_state_file(),
            save_interval_secs: default_save_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Upper bound on per-node position history entries.
    #[serde(default = "default_max_position_history")]
    pub max_position_history: usize,
    /// FIFO cap on packet history for special nodes.
    #[serde(default = "default_special_packet_history")]
    pub special_packet_history: usize,
    /// Retention window for ordinary packet/position history, in days.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

fn default_max_position_history() -> usize {
    10_000
}

fn default_special_packet_history() -> usize {
    50
}

fn default_retention_days() -> i64 {
    7
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_position_history: default_max_position_history(),
            special_packet_history: default_special_packet_history(),
            retention_days: default_retention_days(),
        }
    }
}

/// Gateway reliability scoring policy.
///
/// The weights and the signal floor were tuned empirically; they are
/// configuration, not invariants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// RSSI at or above this value corroborates proximity despite consumed hops.
    /// Readings below it are treated as noise floor and rejected outright.
    #[serde(default = "default_signal_floor")]
    pub strong_signal_floor_dbm: f32,
    /// Score contribution of one zero-hop reception.
    #[serde(default = "default_direct_weight")]
    pub direct_hit_weight: u32,
    /// Score contribution of one RSSI-corroborated relayed reception.
    #[serde(default = "default_partial_weight")]
    pub partial_hit_weight: u32,
}

fn default_signal_floor() -> f32 {
    -110.0
}

fn default_direct_weight() -> u32 {
    15
}

fn default_partial_weight() -> u32 {
    5
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            strong_signal_floor_dbm: default_signal_floor(),
            direct_hit_weight: default_direct_weight(),
            partial_hit_weight: default_partial_weight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovementConfig {
    /// Distance from origin (meters) beyond which a node counts as moved.
    #[serde(default = "default_threshold_meters")]
    pub threshold_meters: f64,
    /// Minimum minutes between repeat alerts for a continuing excursion.
    #[serde(default = "default_cooldown_minutes")]
    pub alert_cooldown_minutes: i64,
}

fn default_threshold_meters() -> f64 {
    50.0
}

fn default_cooldown_minutes() -> i64 {
    60
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            threshold_meters: default_threshold_meters(),
            alert_cooldown_minutes: default_cooldown_minutes(),
        }
    }
}

/// Per-node configuration for geofenced assets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialNodeConfig {
    /// Optional friendly name; display names from NodeInfo win once seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub origin_lat: f64,
    pub origin_lon: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Config {
    /// Load configuration from a file and validate it.
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file.
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Clamp and sanity-check values that have hard operational bounds.
    pub fn validate(&mut self) -> Result<()> {
        // The save throttle supports deployment profiles between 5 and 60 seconds.
        self.storage.save_interval_secs = self.storage.save_interval_secs.clamp(5, 60);

        if self.tracker.max_position_history == 0 {
            return Err(anyhow!("tracker.max_position_history must be at least 1"));
        }
        if self.tracker.special_packet_history == 0 {
            return Err(anyhow!("tracker.special_packet_history must be at least 1"));
        }
        if self.tracker.retention_days <= 0 {
            return Err(anyhow!("tracker.retention_days must be positive"));
        }
        if self.movement.threshold_meters <= 0.0 {
            return Err(anyhow!("movement.threshold_meters must be positive"));
        }
        for (id, node) in &self.special_nodes {
            if !(-90.0..=90.0).contains(&node.origin_lat)
                || !(-180.0..=180.0).contains(&node.origin_lon)
            {
                return Err(anyhow!("special_nodes.{}: origin out of range", id));
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mqtt: MqttConfig::default(),
            storage: StorageConfig::default(),
            tracker: TrackerConfig::default(),
            gateway: GatewayConfig::default(),
            movement: MovementConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("meshwatch.log".to_string()),
            },
            special_nodes: HashMap::new(),
        }
    }
}
