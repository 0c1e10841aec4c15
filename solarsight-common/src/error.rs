//! Errors shared by SolarSight crates.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad configuration value or file, including tracing setup.
    #[error("Config: {0}")]
    Config(String),

    #[error("Zenoh: {0}")]
    Zenoh(#[from] zenoh::Error),

    /// A document could not be encoded or decoded.
    #[error("Document encoding: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    /// A device name or key expression that Zenoh would reject.
    #[error("Invalid key expression: {0}")]
    KeyExpr(String),
}

pub type Result<T> = std::result::Result<T, Error>;
