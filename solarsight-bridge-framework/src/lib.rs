//! SolarSight Bridge Framework
//!
//! Common plumbing for bridges that poll field devices and publish their
//! documents to Zenoh.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`BridgeRunner`] for managing bridge lifecycle (startup, shutdown, signal handling)
//! - [`Outbox`] and [`DestinationQueue`], the bounded drop-oldest outbound queues
//! - [`MessageSink`] and [`ZenohSink`] for delivery and connectivity tracking
//! - [`BridgeArgs`] for common CLI argument parsing
//! - [`BridgeStatus`] for standardized status reporting
//!
//! # Example
//!
//! ```ignore
//! use solarsight_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = BridgeArgs::parse_with_default("mybridge.json5");
//!     let config = MyBridgeConfig::load(&args.config)?;
//!
//!     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args)).await?;
//!
//!     // Spawn protocol-specific workers
//!     let values = runner.outbox().producer("solarsight/sunspec/inv/values");
//!     runner.spawn("worker", my_worker(values, runner.shutdown_handle()));
//!
//!     // Run until Ctrl+C
//!     runner.run().await?;
//!     Ok(())
//! }
//! ```

mod args;
mod config;
mod error;
mod queue;
mod runner;
mod shutdown;
mod sink;
mod status;

pub use args::BridgeArgs;
pub use config::{BridgeConfig, QueueConfig};
pub use error::{BridgeError, Result};
pub use queue::{DestinationQueue, OutboundMessage, Outbox, QueueStats};
pub use runner::{BridgeRunner, JOIN_TIMEOUT};
pub use shutdown::{ShutdownHandle, is_shutdown, wait_for_shutdown};
pub use sink::{CONNECTIVITY_POLL_INTERVAL, MessageSink, ZenohSink};
pub use status::{BridgeState, BridgeStatus, StatusPublisher};

// Re-export commonly used types from solarsight-common
pub use solarsight_common::{LogFormat, LoggingConfig, ZenohConfig, ZenohMode};
