//! Configuration for the SunSpec bridge.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use solarsight_bridge_framework::{
    BridgeConfig, BridgeError, LoggingConfig, QueueConfig, Result, ZenohConfig,
};
use solarsight_common::keyexpr::validate_device_name;

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SunspecBridgeConfig {
    /// Zenoh connection settings
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// SunSpec-specific settings
    pub sunspec: SunspecConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SunSpec bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SunspecConfig {
    /// Key expression prefix (default: "solarsight/sunspec")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// The polled device
    pub device: DeviceConfig,

    /// Poll interval in seconds
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,

    /// Outbound queue settings
    #[serde(default)]
    pub queue: QueueConfig,
}

fn default_key_prefix() -> String {
    solarsight_common::KEY_PREFIX.to_string()
}

fn default_update_interval() -> u64 {
    5
}

impl SunspecConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }
}

/// Configuration for the SunSpec device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name (used in key expressions)
    pub name: String,

    /// Connection type and address
    pub connection: ConnectionConfig,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Address of the SunSpec marker register
    #[serde(default = "default_base_address")]
    pub base_address: u16,

    /// Connect and response timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Delay between connection attempts
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_unit_id() -> u8 {
    1
}

fn default_base_address() -> u16 {
    40000
}

fn default_timeout_ms() -> u64 {
    1000
}

impl DeviceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Connection configuration (TCP or RTU).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// Modbus TCP connection
    Tcp {
        /// Host address (IP or hostname)
        host: String,
        /// TCP port (default: 502)
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    /// Modbus RTU (serial) connection
    Rtu {
        /// Serial port path (e.g., "/dev/ttyUSB0" or "COM1")
        port: String,
        /// Baud rate (default: 9600)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Data bits (default: 8)
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        /// Parity: "none", "even", or "odd" (default: "none")
        #[serde(default = "default_parity")]
        parity: String,
        /// Stop bits: 1 or 2 (default: 1)
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

impl std::fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionConfig::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            ConnectionConfig::Rtu {
                port, baud_rate, ..
            } => write!(f, "rtu://{}@{}", port, baud_rate),
        }
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// First delay after a lost or failed connection
    #[serde(default = "default_reconnect_min")]
    pub min_secs: u64,

    /// Upper bound for the delay
    #[serde(default = "default_reconnect_max")]
    pub max_secs: u64,

    /// Double the delay after each failed attempt
    #[serde(default = "default_exponential")]
    pub exponential: bool,
}

fn default_reconnect_min() -> u64 {
    1
}

fn default_reconnect_max() -> u64 {
    60
}

fn default_exponential() -> bool {
    true
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_secs: default_reconnect_min(),
            max_secs: default_reconnect_max(),
            exponential: default_exponential(),
        }
    }
}

impl BridgeConfig for SunspecBridgeConfig {
    fn zenoh(&self) -> &ZenohConfig {
        &self.zenoh
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn key_prefix(&self) -> &str {
        &self.sunspec.key_prefix
    }

    fn queue(&self) -> QueueConfig {
        self.sunspec.queue.clone()
    }

    fn validate(&self) -> Result<()> {
        let device = &self.sunspec.device;

        validate_device_name(&device.name)
            .map_err(|e| BridgeError::validation(format!("Device name: {}", e)))?;

        if device.unit_id == 0 || device.unit_id > 247 {
            return Err(BridgeError::validation(format!(
                "Device '{}': unit_id must be 1-247",
                device.name
            )));
        }

        if device.timeout_ms == 0 {
            return Err(BridgeError::validation(format!(
                "Device '{}': timeout_ms must be greater than 0",
                device.name
            )));
        }

        if self.sunspec.update_interval_secs == 0 {
            return Err(BridgeError::validation(
                "update_interval_secs must be at least 1",
            ));
        }

        let reconnect = &device.reconnect;
        if reconnect.min_secs == 0 || reconnect.min_secs > reconnect.max_secs {
            return Err(BridgeError::validation(format!(
                "Device '{}': reconnect delay must satisfy 1 <= min_secs <= max_secs",
                device.name
            )));
        }

        match &device.connection {
            ConnectionConfig::Tcp { host, .. } if host.is_empty() => {
                return Err(BridgeError::validation(format!(
                    "Device '{}': TCP host cannot be empty",
                    device.name
                )));
            }
            ConnectionConfig::Rtu {
                parity,
                data_bits,
                stop_bits,
                ..
            } => {
                match parity.to_lowercase().as_str() {
                    "none" | "even" | "odd" => {}
                    _ => {
                        return Err(BridgeError::validation(format!(
                            "Device '{}': invalid parity '{}' (use none, even, or odd)",
                            device.name, parity
                        )));
                    }
                }
                if !(5..=8).contains(data_bits) {
                    return Err(BridgeError::validation(format!(
                        "Device '{}': data_bits must be 5-8",
                        device.name
                    )));
                }
                if !matches!(stop_bits, 1 | 2) {
                    return Err(BridgeError::validation(format!(
                        "Device '{}': stop_bits must be 1 or 2",
                        device.name
                    )));
                }
            }
            _ => {}
        }

        Ok(())
    }
}
