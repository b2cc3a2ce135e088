//! # Configuration Management Module
//!
//! This module handles all configuration aspects of the gateway: identity, traffic policy,
//! timing, broker routing, credential storage and logging.
//!
//! ## Features
//!
//! - **Structured Configuration**: Type-safe configuration with serde serialization
//! - **Validation**: Startup validation of the fields the gateway cannot run without
//! - **Defaults**: Every tunable has a documented default; omitted sections fall back to them
//!
//! ## Configuration Structure
//!
//! The configuration is organized into logical sections:
//!
//! - [`GatewayConfig`] - Owner, gateway identity, environment and management mode
//! - [`TrafficConfig`] - Which traffic is uploaded and how direct packets are filtered
//! - [`TimingConfig`] - Windows, ticks and retry delays of every actor
//! - [`BrokerConfig`] - Optional custom broker replacing the cloud broker
//! - [`StorageConfig`] - Credential store location
//! - [`LoggingConfig`] - Logging and debugging settings
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pixelgw::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     config.validate()?;
//!
//!     println!("Owner: {}", config.gateway.owner_id);
//!     println!("Pacing: {} ms", config.timing.vbridge_pacing_ms());
//!
//!     Config::create_default("config.toml").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [gateway]
//! owner_id = "my-owner"
//! gateway_id = "A0A0B0C0C0D0D0"
//! environment = "prod"
//! flow_version = "v2"
//!
//! [traffic]
//! data_output_filter = "bridges_and_pixels"
//!
//! [timing]
//! resolve_retry_ms = 30000
//! ```
//!
//! Cloud-managed gateways also receive configuration over the downlink; those updates are
//! applied on top of the file values at runtime and are not written back.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub traffic: TrafficConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Account the gateway uploads for. Required.
    #[serde(default)]
    pub owner_id: String,
    /// Stable gateway identity; the virtual bridge MAC is derived from it.
    pub gateway_id: String,
    #[serde(default = "default_gateway_name")]
    pub gateway_name: String,
    #[serde(default = "default_gateway_type")]
    pub gateway_type: String,
    /// Credential store key and broker routing namespace.
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Asset flow version, `v1` or `v2`.
    #[serde(default = "default_flow_version")]
    pub flow_version: String,
    /// When true the cloud drives configuration and OTA; the idle watchdog is off.
    #[serde(default = "default_true")]
    pub cloud_managed: bool,
    #[serde(default = "default_app_version")]
    pub app_version: String,
}

fn default_gateway_name() -> String {
    "pixelgw".to_string()
}

fn default_gateway_type() -> String {
    "mobile".to_string()
}

fn default_environment() -> String {
    "prod".to_string()
}

fn default_flow_version() -> String {
    "v2".to_string()
}

fn default_true() -> bool {
    true
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Which pixel traffic is forwarded to the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataOutputFilter {
    /// Only directly heard pixel packets (relayed through the virtual bridge).
    #[serde(alias = "PIXELS_ONLY")]
    PixelsOnly,
    /// Only packets retransmitted by physical bridges.
    #[serde(alias = "BRIDGES_ONLY")]
    BridgesOnly,
    #[default]
    #[serde(alias = "BRIDGES_AND_PIXELS")]
    BridgesAndPixels,
}

impl DataOutputFilter {
    /// Parse the downlink serial form (`PIXELS_ONLY`, ...). Unknown values yield `None`.
    pub fn from_serial(serial: &str) -> Option<Self> {
        match serial {
            "PIXELS_ONLY" => Some(Self::PixelsOnly),
            "BRIDGES_ONLY" => Some(Self::BridgesOnly),
            "BRIDGES_AND_PIXELS" => Some(Self::BridgesAndPixels),
            _ => None,
        }
    }

    pub fn serial(&self) -> &'static str {
        match self {
            Self::PixelsOnly => "PIXELS_ONLY",
            Self::BridgesOnly => "BRIDGES_ONLY",
            Self::BridgesAndPixels => "BRIDGES_AND_PIXELS",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficConfig {
    /// Upload pixel data, side info and sensor packets.
    #[serde(default = "default_true")]
    pub enable_data_traffic: bool,
    /// Upload bridge configuration, heartbeat and module packets.
    #[serde(default = "default_true")]
    pub enable_edge_traffic: bool,
    #[serde(default)]
    pub data_output_filter: DataOutputFilter,
    /// Call the resolution backend for beacons and bridges.
    #[serde(default = "default_true")]
    pub resolve_enabled: bool,
    /// Publish per-packet gateway logs on the status topic.
    #[serde(default)]
    pub ble_logs_enabled: bool,
    /// Publish at all. When false batches are built and dropped.
    #[serde(default = "default_true")]
    pub upstream_enabled: bool,
    /// Initial virtual bridge pacing; overrides `timing.vbridge_pacing_ms` when set.
    #[serde(default)]
    pub pacer_interval_seconds: Option<u64>,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            enable_data_traffic: true,
            enable_edge_traffic: true,
            data_output_filter: DataOutputFilter::default(),
            resolve_enabled: true,
            ble_logs_enabled: false,
            upstream_enabled: true,
            pacer_interval_seconds: None,
        }
    }
}

/// Every window, tick and delay used by the actors. Unset values use the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Minimum age of data/meta items before the pipeline forwards them (ms). Default 200.
    #[serde(default)]
    pub filter_window_ms: Option<u64>,
    /// Minimum age of bridge management items before they are forwarded (ms). Default 1000.
    #[serde(default)]
    pub management_window_ms: Option<u64>,
    /// Pipeline map tick and eager-map threshold (ms). Default 1000.
    #[serde(default)]
    pub pipeline_tick_ms: Option<u64>,
    /// Bridge registry resolve-retry tick (ms). Default 2000.
    #[serde(default)]
    pub bridge_sync_ms: Option<u64>,
    /// Cool-down before an unresolved entity is resolved again (ms). Default 30000.
    #[serde(default)]
    pub resolve_retry_ms: Option<u64>,
    /// Bridges untouched for this long are pruned (seconds). Default 600.
    #[serde(default)]
    pub bridge_prune_secs: Option<u64>,
    /// Window during which a postponed asset is shielded from resolver results (ms). Default 5000.
    #[serde(default)]
    pub asset_postpone_ms: Option<u64>,
    /// Seen beacons with no reception for this long are forgotten (seconds). Default 3630.
    #[serde(default)]
    pub beacon_expiry_secs: Option<u64>,
    /// Delivery queue flush tick (ms). Default 1000.
    #[serde(default)]
    pub queue_tick_ms: Option<u64>,
    /// Gateway heartbeat period on cloud-managed gateways (seconds). Default 60.
    #[serde(default)]
    pub gateway_heartbeat_secs: Option<u64>,
    /// How often the idle watchdog runs (seconds). Default 60.
    #[serde(default)]
    pub watchdog_period_secs: Option<u64>,
    /// Flush silence after which the watchdog disconnects (seconds). Default 59.
    #[serde(default)]
    pub watchdog_idle_secs: Option<u64>,
    /// Virtual bridge pacing tick (ms). Default 1000.
    #[serde(default)]
    pub vbridge_tick_ms: Option<u64>,
    /// Virtual bridge echo pacing (ms). Default 15000.
    #[serde(default)]
    pub vbridge_pacing_ms: Option<u64>,
    /// Lower bound of the virtual bridge eviction age (ms). Default 30000.
    #[serde(default)]
    pub vbridge_eviction_floor_ms: Option<u64>,
    /// Virtual bridge heartbeat period (seconds). Default 30.
    #[serde(default)]
    pub vbridge_heartbeat_secs: Option<u64>,
    /// Virtual bridge interface announcement period (seconds). Default 60.
    #[serde(default)]
    pub vbridge_interface_secs: Option<u64>,
    /// Delay before re-announcing configuration after a downlink change (ms). Default 500.
    #[serde(default)]
    pub vbridge_config_reply_ms: Option<u64>,
}

impl TimingConfig {
    pub fn filter_window_ms(&self) -> u64 {
        self.filter_window_ms.unwrap_or(200)
    }
    pub fn management_window_ms(&self) -> u64 {
        self.management_window_ms.unwrap_or(1000)
    }
    pub fn pipeline_tick_ms(&self) -> u64 {
        self.pipeline_tick_ms.unwrap_or(1000)
    }
    pub fn bridge_sync_ms(&self) -> u64 {
        self.bridge_sync_ms.unwrap_or(2000)
    }
    pub fn resolve_retry_ms(&self) -> u64 {
        self.resolve_retry_ms.unwrap_or(30_000)
    }
    pub fn bridge_prune_ms(&self) -> u64 {
        self.bridge_prune_secs.unwrap_or(600).saturating_mul(1000)
    }
    pub fn asset_postpone_ms(&self) -> u64 {
        self.asset_postpone_ms.unwrap_or(5000)
    }
    pub fn beacon_expiry_ms(&self) -> u64 {
        self.beacon_expiry_secs.unwrap_or(3630).saturating_mul(1000)
    }
    pub fn queue_tick_ms(&self) -> u64 {
        self.queue_tick_ms.unwrap_or(1000)
    }
    pub fn gateway_heartbeat(&self) -> Duration {
        Duration::from_secs(self.gateway_heartbeat_secs.unwrap_or(60))
    }
    pub fn watchdog_period(&self) -> Duration {
        Duration::from_secs(self.watchdog_period_secs.unwrap_or(60))
    }
    pub fn watchdog_idle(&self) -> Duration {
        Duration::from_secs(self.watchdog_idle_secs.unwrap_or(59))
    }
    pub fn vbridge_tick_ms(&self) -> u64 {
        self.vbridge_tick_ms.unwrap_or(1000)
    }
    pub fn vbridge_pacing_ms(&self) -> u64 {
        self.vbridge_pacing_ms.unwrap_or(15_000)
    }
    pub fn vbridge_eviction_floor_ms(&self) -> u64 {
        self.vbridge_eviction_floor_ms.unwrap_or(30_000)
    }
    pub fn vbridge_heartbeat(&self) -> Duration {
        Duration::from_secs(self.vbridge_heartbeat_secs.unwrap_or(30))
    }
    pub fn vbridge_interface(&self) -> Duration {
        Duration::from_secs(self.vbridge_interface_secs.unwrap_or(60))
    }
    pub fn vbridge_config_reply(&self) -> Duration {
        Duration::from_millis(self.vbridge_config_reply_ms.unwrap_or(500))
    }
}

const BROKER_SCHEMES: [&str; 6] = ["mqtts", "mqtt", "tcp", "ssl", "ws", "wss"];

/// Static custom broker. Also installable at runtime through a downlink message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomBrokerConfig {
    pub custom_broker: bool,
    pub port: u16,
    pub broker_url: String,
    pub username: String,
    pub password: String,
    pub update_topic: String,
    pub status_topic: String,
    pub data_topic: String,
}

impl CustomBrokerConfig {
    /// Broker URL with the scheme forced to `ssl://` and the port appended.
    pub fn broker(&self) -> String {
        let url = self.broker_url.trim();
        let host = match url.split_once("://") {
            Some((scheme, rest)) if BROKER_SCHEMES.iter().any(|s| scheme.eq_ignore_ascii_case(s)) => {
                format!("ssl://{}", rest)
            }
            Some(_) => url.to_string(),
            None => format!("ssl://{}", url),
        };
        format!("{}:{}", host, self.port)
    }

    /// Owner id, taken from the second segment of the data topic.
    pub fn owner_id(&self) -> Option<&str> {
        self.data_topic.split('/').nth(1).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Cloud broker URL, `ssl://host:port`. Used unless a custom broker is active.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub custom: Option<CustomBrokerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON file holding gateway credentials, keyed by environment and owner.
    #[serde(default = "default_credentials_file")]
    pub credentials_file: String,
}

fn default_credentials_file() -> String {
    "./data/credentials.json".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            credentials_file: default_credentials_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    #[serde(default)]
    pub security_file: Option<String>,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject configurations the gateway cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.owner_id.trim().is_empty() {
            return Err(anyhow!("gateway.owner_id is required"));
        }
        if !matches!(self.gateway.flow_version.as_str(), "v1" | "v2") {
            return Err(anyhow!(
                "gateway.flow_version must be v1 or v2, got '{}'",
                self.gateway.flow_version
            ));
        }
        if self.gateway.gateway_id.trim().is_empty() {
            return Err(anyhow!("gateway.gateway_id is required"));
        }
        if let Some(custom) = &self.broker.custom {
            if custom.custom_broker && custom.owner_id().is_none() {
                return Err(anyhow!(
                    "broker.custom.data_topic must look like <prefix>/<owner>/..."
                ));
            }
        }
        Ok(())
    }

    /// Initial virtual bridge pacing in milliseconds.
    pub fn initial_pacing_ms(&self) -> u64 {
        self.traffic
            .pacer_interval_seconds
            .map(|s| s.saturating_mul(1000))
            .unwrap_or_else(|| self.timing.vbridge_pacing_ms())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gateway: GatewayConfig {
                owner_id: String::new(),
                gateway_id: "pixelgw-0001".to_string(),
                gateway_name: default_gateway_name(),
                gateway_type: default_gateway_type(),
                environment: default_environment(),
                flow_version: default_flow_version(),
                cloud_managed: true,
                app_version: default_app_version(),
            },
            traffic: TrafficConfig::default(),
            timing: TimingConfig::default(),
            broker: BrokerConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("pixelgw.log".to_string()),
                security_file: Some("pixelgw-security.log".to_string()),
            },
        }
    }
}
