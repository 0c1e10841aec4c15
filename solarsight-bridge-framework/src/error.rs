//! Bridge framework errors.

use thiserror::Error;

/// Result type alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failures surfaced by the framework: startup, configuration and delivery.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Startup failed: {0}")]
    Startup(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// The file is not valid JSON5 for the bridge's config type.
    #[error("Cannot parse configuration: {0}")]
    ConfigParse(String),

    /// The file parsed but a value is out of range.
    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("Cannot open Zenoh session: {0}")]
    ZenohConnection(String),

    #[error("Zenoh session error: {0}")]
    ZenohSession(String),

    #[error("Cannot encode document: {0}")]
    Serialization(String),

    /// A message could not be delivered to its topic.
    #[error("Delivery to {topic} failed: {message}")]
    Publish { topic: String, message: String },

    /// The sink has no route to the bus right now.
    #[error("Sink '{0}' is not connected")]
    NotConnected(String),

    /// A background task could not be started or failed.
    #[error("Worker error: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }

    pub fn publish(topic: impl Into<String>, message: impl ToString) -> Self {
        Self::Publish {
            topic: topic.into(),
            message: message.to_string(),
        }
    }

    /// Whether the error comes from the config file rather than the runtime.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound { .. } | Self::ConfigParse(_) | Self::ConfigValidation(_)
        )
    }
}

impl From<zenoh::Error> for BridgeError {
    fn from(err: zenoh::Error) -> Self {
        Self::ZenohSession(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<json5::Error> for BridgeError {
    fn from(err: json5::Error) -> Self {
        Self::ConfigParse(err.to_string())
    }
}

impl From<solarsight_common::Error> for BridgeError {
    fn from(err: solarsight_common::Error) -> Self {
        use solarsight_common::Error;

        match err {
            Error::Config(msg) => Self::Startup(msg),
            Error::Zenoh(e) => Self::ZenohSession(e.to_string()),
            Error::Json(e) => Self::Serialization(e.to_string()),
            Error::Io(e) => Self::Io(e),
            Error::KeyExpr(msg) => Self::ConfigValidation(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_classified() {
        assert!(BridgeError::validation("capacity").is_config());
        assert!(!BridgeError::publish("a/b", "timeout").is_config());
    }

    #[test]
    fn test_common_key_error_is_validation() {
        let err: BridgeError = solarsight_common::Error::KeyExpr("bad name".into()).into();
        assert!(matches!(err, BridgeError::ConfigValidation(_)));
    }

    #[test]
    fn test_publish_display() {
        let err = BridgeError::publish("solarsight/sunspec/inv/values", "no route");
        assert_eq!(
            err.to_string(),
            "Delivery to solarsight/sunspec/inv/values failed: no route"
        );
    }
}
