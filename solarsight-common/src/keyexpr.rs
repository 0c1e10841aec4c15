//! Key expressions for SolarSight documents.
//!
//! Documents are published under:
//!
//! ```text
//! <prefix>/<device>/<channel>
//! ```
//!
//! where `<channel>` is one of `values`, `events`, `device` or `availability`.
//! Bridge status lives at `<prefix>/@/status`.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default key expression prefix for all SolarSight documents.
pub const KEY_PREFIX: &str = "solarsight/sunspec";

/// Characters that carry meaning in Zenoh key expressions.
const RESERVED_CHARS: &[char] = &['/', '*', '$', '#', '?', '@'];

/// Document channel produced by a device poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Numeric measurements, one document per tick.
    Values,
    /// Operating state and active events.
    Events,
    /// Static identity, once per connection.
    Device,
    /// Online/offline transitions.
    Availability,
}

impl Channel {
    /// All channels, in dispatch order.
    pub const ALL: [Channel; 4] = [
        Channel::Device,
        Channel::Values,
        Channel::Events,
        Channel::Availability,
    ];

    /// Get the string representation used in key expressions.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Values => "values",
            Channel::Events => "events",
            Channel::Device => "device",
            Channel::Availability => "availability",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builder for constructing SolarSight key expressions.
#[derive(Debug, Clone)]
pub struct KeyExprBuilder {
    prefix: String,
}

impl Default for KeyExprBuilder {
    fn default() -> Self {
        Self::new(KEY_PREFIX)
    }
}

impl KeyExprBuilder {
    /// Create a builder with the given prefix (trailing slashes are trimmed).
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Build the key expression for a device channel.
    ///
    /// # Example
    /// ```
    /// use solarsight_common::keyexpr::{Channel, KeyExprBuilder};
    ///
    /// let builder = KeyExprBuilder::new("solarsight/sunspec");
    /// let key = builder.build("inverter01", Channel::Values);
    /// assert_eq!(key, "solarsight/sunspec/inverter01/values");
    /// ```
    pub fn build(&self, device: &str, channel: Channel) -> String {
        format!("{}/{}/{}", self.prefix, device, channel.as_str())
    }

    /// Build a key expression for bridge status.
    ///
    /// # Example
    /// ```
    /// use solarsight_common::keyexpr::KeyExprBuilder;
    ///
    /// let builder = KeyExprBuilder::default();
    /// assert_eq!(builder.status_key(), "solarsight/sunspec/@/status");
    /// ```
    pub fn status_key(&self) -> String {
        format!("{}/@/status", self.prefix)
    }
}

/// Check that a device name can be used as a single key expression chunk.
pub fn validate_device_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::KeyExpr("device name cannot be empty".to_string()));
    }
    if let Some(c) = name.chars().find(|c| RESERVED_CHARS.contains(c)) {
        return Err(Error::KeyExpr(format!(
            "device name '{}' contains reserved character '{}'",
            name, c
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_builder() {
        let builder = KeyExprBuilder::new("solar/site1/");

        assert_eq!(
            builder.build("inverter01", Channel::Events),
            "solar/site1/inverter01/events"
        );
        assert_eq!(builder.status_key(), "solar/site1/@/status");
    }

    #[test]
    fn test_validate_device_name() {
        assert!(validate_device_name("inverter-01").is_ok());
        assert!(validate_device_name("").is_err());
        assert!(validate_device_name("site/inverter").is_err());
        assert!(validate_device_name("inv*").is_err());
    }

    #[test]
    fn test_channel_display() {
        assert_eq!(Channel::Values.to_string(), "values");
        assert_eq!(Channel::Availability.as_str(), "availability");
    }
}
