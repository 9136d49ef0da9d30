//! # Configuration Management Module
//!
//! TOML configuration for the bridge, with defaults for every value and a
//! `validate()` pass run on load.
//!
//! ## Configuration Structure
//!
//! - [`DeviceConfig`] - device link (TCP or serial), reconnect backoff, heartbeat
//! - [`RequestConfig`] - admin round-trip timeout and session passkey lifetime
//! - [`DeliveryConfig`] - ack timeout and retention for outbound messages
//! - [`VirtualNodeConfig`] - the TCP server that third-party clients attach to
//! - [`TracerouteConfig`] - automatic traceroute interval
//! - [`StorageConfig`] - data directory for persisted nodes and messages
//! - [`LoggingConfig`] - log level and optional log files
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshbridge::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("Device: {}", config.device.describe());
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [device]
//! transport = "tcp"
//! host = "192.168.1.50"
//! tcp_port = 4403
//!
//! [virtual_node]
//! enabled = true
//! port = 4404
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Serial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub transport: TransportKind,
    /// Hostname or IP of a network-attached node (TCP transport)
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// Serial device path (serial transport)
    #[serde(default)]
    pub serial_port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// First reconnect delay; doubles per consecutive failure up to `reconnect_max_ms`
    #[serde(default = "default_reconnect_min_ms")]
    pub reconnect_min_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Seconds between heartbeats on an open link (0 disables)
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Connect on startup instead of waiting for an explicit connect call
    #[serde(default = "default_true")]
    pub auto_connect: bool,
}

fn default_tcp_port() -> u16 {
    4403
}
fn default_baud_rate() -> u32 {
    115200
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_reconnect_min_ms() -> u64 {
    1_000
}
fn default_reconnect_max_ms() -> u64 {
    60_000
}
fn default_heartbeat_secs() -> u64 {
    300
}
fn default_true() -> bool {
    true
}

impl DeviceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn describe(&self) -> String {
        match self.transport {
            TransportKind::Tcp => format!("tcp://{}:{}", self.host, self.tcp_port),
            TransportKind::Serial => format!("serial://{}@{}", self.serial_port, self.baud_rate),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Deadline for an admin request/response exchange with a node
    pub admin_timeout_secs: u64,
    /// Lifetime of a cached session passkey
    pub passkey_ttl_secs: u64,
    /// Channel index used for admin packets to remote nodes
    #[serde(default)]
    pub admin_channel: u32,
}

impl RequestConfig {
    pub fn admin_timeout(&self) -> Duration {
        Duration::from_secs(self.admin_timeout_secs)
    }
    pub fn passkey_ttl(&self) -> Duration {
        Duration::from_secs(self.passkey_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Seconds a tracked message may stay unresolved before it is failed
    pub ack_timeout_secs: u64,
    /// Seconds a resolved entry is retained before eviction
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualNodeConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    /// Forward admin packets from virtual clients to the device
    #[serde(default)]
    pub allow_admin_commands: bool,
    /// Frames buffered per client before it is treated as stalled and dropped
    #[serde(default = "default_client_queue_len")]
    pub client_queue_len: usize,
}

fn default_client_queue_len() -> usize {
    256
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracerouteConfig {
    /// Minutes between automatic traceroutes (0 disables)
    #[serde(default)]
    pub interval_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    #[serde(default)]
    pub security_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub requests: RequestConfig,
    pub delivery: DeliveryConfig,
    pub virtual_node: VirtualNodeConfig,
    #[serde(default)]
    pub traceroute: TracerouteConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;
        config.validate()?;
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

    pub fn validate(&self) -> Result<()> {
        match self.device.transport {
            TransportKind::Tcp if self.device.host.trim().is_empty() => {
                return Err(anyhow!("device.host is required for the tcp transport"));
            }
            TransportKind::Serial if self.device.serial_port.trim().is_empty() => {
                return Err(anyhow!(
                    "device.serial_port is required for the serial transport"
                ));
            }
            _ => {}
        }
        if self.device.reconnect_min_ms == 0 {
            return Err(anyhow!("device.reconnect_min_ms must be greater than 0"));
        }
        if self.device.reconnect_max_ms < self.device.reconnect_min_ms {
            return Err(anyhow!(
                "device.reconnect_max_ms ({}) must be >= reconnect_min_ms ({})",
                self.device.reconnect_max_ms,
                self.device.reconnect_min_ms
            ));
        }
        if self.requests.admin_timeout_secs == 0 {
            return Err(anyhow!("requests.admin_timeout_secs must be greater than 0"));
        }
        if self.requests.passkey_ttl_secs == 0 {
            return Err(anyhow!("requests.passkey_ttl_secs must be greater than 0"));
        }
        if self.delivery.ack_timeout_secs == 0 || self.delivery.sweep_interval_secs == 0 {
            return Err(anyhow!(
                "delivery.ack_timeout_secs and delivery.sweep_interval_secs must be greater than 0"
            ));
        }
        if self.virtual_node.client_queue_len == 0 {
            return Err(anyhow!("virtual_node.client_queue_len must be greater than 0"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device: DeviceConfig {
                transport: TransportKind::Tcp,
                host: "meshtastic.local".to_string(),
                tcp_port: default_tcp_port(),
                serial_port: "/dev/ttyUSB0".to_string(),
                baud_rate: default_baud_rate(),
                connect_timeout_ms: default_connect_timeout_ms(),
                reconnect_min_ms: default_reconnect_min_ms(),
                reconnect_max_ms: default_reconnect_max_ms(),
                heartbeat_secs: default_heartbeat_secs(),
                auto_connect: true,
            },
            requests: RequestConfig {
                admin_timeout_secs: 30,
                passkey_ttl_secs: 300,
                admin_channel: 0,
            },
            delivery: DeliveryConfig {
                ack_timeout_secs: 120,
                retention_secs: 600,
                sweep_interval_secs: 15,
            },
            virtual_node: VirtualNodeConfig {
                enabled: true,
                bind: "0.0.0.0".to_string(),
                port: 4404,
                allow_admin_commands: false,
                client_queue_len: default_client_queue_len(),
            },
            traceroute: TracerouteConfig::default(),
            storage: StorageConfig {
                data_dir: "./data".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("meshbridge.log".to_string()),
                security_file: Some("meshbridge-security.log".to_string()),
            },
        }
    }
}
