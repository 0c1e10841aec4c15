//! Bridge status reporting.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::sink::MessageSink;

/// Lifecycle state of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    Running,
    Offline,
    Error,
}

/// Bridge status information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatus {
    /// Bridge name (e.g., "sunspec").
    pub bridge: String,
    /// Bridge version.
    pub version: String,
    /// Current status.
    pub status: BridgeState,
    /// Additional metadata (bridge-specific).
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl BridgeStatus {
    fn with_state(bridge: impl Into<String>, version: impl Into<String>, status: BridgeState) -> Self {
        Self {
            bridge: bridge.into(),
            version: version.into(),
            status,
            metadata: serde_json::Map::new(),
        }
    }

    /// Create a new status with "running" state.
    pub fn running(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_state(bridge, version, BridgeState::Running)
    }

    /// Create a status with "offline" state.
    pub fn offline(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_state(bridge, version, BridgeState::Offline)
    }

    /// Create a status with "error" state.
    pub fn error(
        bridge: impl Into<String>,
        version: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::with_state(bridge, version, BridgeState::Error)
            .with_field("error", serde_json::Value::String(error.into()))
    }

    /// Merge object metadata into the status. Non-object values are ignored.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = metadata {
            self.metadata.extend(map);
        }
        self
    }

    /// Add a single metadata field.
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Publishes bridge status on startup and shutdown.
///
/// Status goes straight to the sink rather than through the outbound queue,
/// so the final "offline" document is attempted even after drain tasks stop.
pub struct StatusPublisher {
    sink: Arc<dyn MessageSink>,
    key: String,
    bridge_name: String,
    version: String,
}

impl StatusPublisher {
    /// Create a new status publisher writing to `key`.
    pub fn new(
        sink: Arc<dyn MessageSink>,
        key: impl Into<String>,
        bridge_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            key: key.into(),
            bridge_name: bridge_name.into(),
            version: version.into(),
        }
    }

    /// Key expression the status is published to.
    pub fn key(&self) -> &str {
        &self.key
    }

    async fn publish(&self, status: &BridgeStatus) -> Result<()> {
        let payload = serde_json::to_string(status)?;
        self.sink.publish(&self.key, &payload).await
    }

    /// Publish "running" status with optional metadata.
    pub async fn publish_running(&self, metadata: Option<serde_json::Value>) -> Result<()> {
        let mut status = BridgeStatus::running(&self.bridge_name, &self.version);
        if let Some(meta) = metadata {
            status = status.with_metadata(meta);
        }
        self.publish(&status).await
    }

    /// Publish "offline" status.
    pub async fn publish_offline(&self) -> Result<()> {
        self.publish(&BridgeStatus::offline(&self.bridge_name, &self.version))
            .await
    }

    /// Publish "error" status.
    pub async fn publish_error(&self, error: impl Into<String>) -> Result<()> {
        self.publish(&BridgeStatus::error(&self.bridge_name, &self.version, error))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_running() {
        let status = BridgeStatus::running("sunspec", "0.1.0");
        assert_eq!(status.bridge, "sunspec");
        assert_eq!(status.status, BridgeState::Running);
    }

    #[test]
    fn test_status_with_metadata() {
        let status = BridgeStatus::running("sunspec", "0.1.0").with_metadata(serde_json::json!({
            "devices": ["inverter01"],
            "update_interval_secs": 5
        }));

        assert_eq!(status.metadata["devices"][0], "inverter01");
        assert_eq!(status.metadata["update_interval_secs"], 5);
    }

    #[test]
    fn test_status_serialization() {
        let status = BridgeStatus::error("test", "1.0.0", "fatal modbus error");

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"bridge\":\"test\""));
        assert!(json.contains("\"status\":\"error\""));
        assert!(json.contains("\"error\":\"fatal modbus error\""));
    }
}
