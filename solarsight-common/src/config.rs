use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Zenoh session mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZenohMode {
    /// Peer-to-peer mode (default).
    #[default]
    Peer,
    /// Client mode, attaches to one or more routers.
    Client,
    /// Router mode.
    Router,
}

impl ZenohMode {
    /// Get the string used in the Zenoh configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            ZenohMode::Peer => "peer",
            ZenohMode::Client => "client",
            ZenohMode::Router => "router",
        }
    }
}

impl std::fmt::Display for ZenohMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common Zenoh connection configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZenohConfig {
    /// Zenoh mode: "client", "peer", or "router".
    #[serde(default)]
    pub mode: ZenohMode,

    /// Endpoints to connect to (for client mode).
    #[serde(default)]
    pub connect: Vec<String>,

    /// Endpoints to listen on (for peer/router mode).
    #[serde(default)]
    pub listen: Vec<String>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive: "trace", "debug", "info", "warn", "error",
    /// or e.g. "info,zenoh=warn".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Load a configuration file in JSON5 format.
pub fn load_config<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    json5::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Load a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(default)]
        zenoh: ZenohConfig,
        #[serde(default)]
        logging: LoggingConfig,
    }

    #[test]
    fn test_parse_zenoh_client() {
        let json5 = r#"
        {
            zenoh: {
                mode: "client",
                connect: ["tcp/localhost:7447"],
            },
            logging: {
                level: "debug",
            },
        }
        "#;

        let config: Sample = parse_config(json5).unwrap();

        assert_eq!(config.zenoh.mode, ZenohMode::Client);
        assert_eq!(config.zenoh.connect, vec!["tcp/localhost:7447"]);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_defaults() {
        let config: Sample = parse_config("{}").unwrap();

        assert_eq!(config.zenoh.mode, ZenohMode::Peer);
        assert!(config.zenoh.connect.is_empty());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let result: Result<Sample> = parse_config(r#"{ zenoh: { mode: "broker" } }"#);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_json_logging_format() {
        let config: Sample =
            parse_config(r#"{ logging: { level: "warn", format: "json" } }"#).unwrap();

        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_load_missing_file() {
        let result: Result<Sample> = load_config("/nonexistent/solarsight.json5");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
