//! Zenoh bridge for SunSpec inverters.
//!
//! This bridge polls one SunSpec device over Modbus (TCP or RTU/serial) and
//! publishes its state to Zenoh as JSON documents.
//!
//! # Key Expressions
//!
//! ```text
//! solarsight/sunspec/<device>/<channel>
//! ```
//!
//! Where:
//! - `<device>` - Device name from configuration
//! - `<channel>` - `values`, `events`, `device`, or `availability`

pub mod config;
pub mod gateway;
pub mod poller;

pub use config::SunspecBridgeConfig;
pub use gateway::{DeviceGateway, ModbusGateway};
pub use poller::{ConnectionState, DevicePoller, PollerConfig, PollerHandle};
