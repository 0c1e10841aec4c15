//! Configuration traits and utilities.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::{LoggingConfig, ZenohConfig};

/// Outbound queue settings, shared by every destination of a bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of messages held per destination.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Delay before retrying a failed delivery while the sink still reports
    /// itself connected.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_capacity() -> usize {
    100
}

fn default_retry_interval_ms() -> u64 {
    1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl QueueConfig {
    /// Retry interval as a [`Duration`].
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Validate the queue settings.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(BridgeError::validation("queue capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Trait for bridge configuration types.
///
/// Implement this trait for your bridge's configuration struct to get
/// automatic loading, validation, and access to common config fields.
///
/// # Example
///
/// ```ignore
/// use serde::Deserialize;
/// use solarsight_bridge_framework::{BridgeConfig, LoggingConfig, ZenohConfig};
///
/// #[derive(Debug, Deserialize)]
/// pub struct MyBridgeConfig {
///     pub zenoh: ZenohConfig,
///     pub logging: LoggingConfig,
///     pub key_prefix: String,
/// }
///
/// impl BridgeConfig for MyBridgeConfig {
///     fn zenoh(&self) -> &ZenohConfig {
///         &self.zenoh
///     }
///
///     fn logging(&self) -> &LoggingConfig {
///         &self.logging
///     }
///
///     fn key_prefix(&self) -> &str {
///         &self.key_prefix
///     }
/// }
/// ```
pub trait BridgeConfig: Sized + DeserializeOwned {
    /// Get the Zenoh configuration.
    fn zenoh(&self) -> &ZenohConfig;

    /// Get the logging configuration.
    fn logging(&self) -> &LoggingConfig;

    /// Get the key expression prefix for this bridge.
    fn key_prefix(&self) -> &str;

    /// Get the outbound queue settings.
    fn queue(&self) -> QueueConfig {
        QueueConfig::default()
    }

    /// Validate the configuration.
    ///
    /// Called automatically after loading. Override to add custom validation.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Parse configuration from a JSON5 string and validate it.
    fn parse(content: &str) -> Result<Self> {
        let config: Self = json5::from_str(content)?;
        config.queue().validate()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    ///
    /// Supports JSON5 format. Calls [`validate`](Self::validate) after loading.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(BridgeError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        #[serde(default)]
        zenoh: ZenohConfig,
        #[serde(default)]
        logging: LoggingConfig,
        key_prefix: String,
        #[serde(default)]
        queue: QueueConfig,
    }

    impl BridgeConfig for TestConfig {
        fn zenoh(&self) -> &ZenohConfig {
            &self.zenoh
        }

        fn logging(&self) -> &LoggingConfig {
            &self.logging
        }

        fn key_prefix(&self) -> &str {
            &self.key_prefix
        }

        fn queue(&self) -> QueueConfig {
            self.queue.clone()
        }
    }

    #[test]
    fn test_config_not_found() {
        let result = TestConfig::load("/nonexistent/path.json5");
        assert!(matches!(result, Err(BridgeError::ConfigNotFound { .. })));
    }

    #[test]
    fn test_parse_with_queue_defaults() {
        let config = TestConfig::parse(r#"{ key_prefix: "solar" }"#).unwrap();
        assert_eq!(config.queue().capacity, 100);
        assert_eq!(config.queue().retry_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = TestConfig::parse(r#"{ key_prefix: "solar", queue: { capacity: 0 } }"#);
        assert!(matches!(result, Err(BridgeError::ConfigValidation(_))));
    }

    #[test]
    fn test_parse_error() {
        let result = TestConfig::parse("{ key_prefix: ");
        assert!(matches!(result, Err(BridgeError::ConfigParse(_))));
    }
}
