//! SolarSight Common Library
//!
//! This crate provides shared types and utilities for SolarSight bridges:
//!
//! - [`snapshot`] - Typed device snapshots (`ValueSnapshot`, `EventSnapshot`, `DeviceSnapshot`)
//! - [`document`] - JSON documents published for each snapshot channel
//! - [`config`] - Configuration loading (JSON5 format)
//! - [`session`] - Zenoh session management
//! - [`keyexpr`] - Key expression builders and parsers
//! - [`error`] - Error types

pub mod config;
pub mod document;
pub mod error;
pub mod keyexpr;
pub mod session;
pub mod snapshot;

// Re-export commonly used types at the crate root
pub use config::{LogFormat, LoggingConfig, ZenohConfig, ZenohMode, load_config, parse_config};
pub use document::{
    AvailabilityDocument, DeviceDocument, EventsDocument, ValuesDocument, round_to, to_document,
};
pub use error::{Error, Result};
pub use keyexpr::{Channel, KEY_PREFIX, KeyExprBuilder};
pub use session::connect;
pub use snapshot::{
    DeviceSnapshot, EventSnapshot, InputValues, PhaseValues, RegisterModel, ValueSnapshot,
    efficiency,
};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };

    result.map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))
}
