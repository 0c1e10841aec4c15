//! Device gateway: the register-level client the poller reads through.
//!
//! A gateway owns the link to one device. It reports link lifecycle through
//! [`GatewayEvent`]s sent into the poller's inbox and exposes fallible,
//! cache-backed getters that are valid after a successful fetch.

pub mod modbus;
pub mod sunspec;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use modbus::ModbusGateway;

/// Result type alias using [`GatewayError`].
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Recovery class of a gateway error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// The link may recover; reconnect and keep polling.
    Transient,
    /// Unrecoverable; the poller stops and the bridge shuts down.
    Fatal,
    /// The operation was invoked after shutdown began.
    Shutdown,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Transient => "transient",
            Severity::Fatal => "fatal",
            Severity::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("invalid device address: {0}")]
    InvalidAddress(String),

    #[error("read of {count} registers at {address} failed: {message}")]
    Read {
        address: u16,
        count: u16,
        message: String,
    },

    #[error("Modbus exception at {address}: {code}")]
    Exception { address: u16, code: String },

    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error("device is not SunSpec compatible: {0}")]
    InvalidDevice(String),

    #[error("{0} is not implemented by the device")]
    NotImplemented(&'static str),

    #[error("{0} has not been fetched from the device")]
    NotFetched(&'static str),

    #[error("{0} is out of range for this device")]
    OutOfRange(String),

    #[error("gateway is shutting down")]
    ShuttingDown,
}

/// Severity-tagged gateway error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}")]
pub struct GatewayError {
    pub severity: Severity,
    pub kind: ErrorKind,
}

impl GatewayError {
    pub fn new(severity: Severity, kind: ErrorKind) -> Self {
        Self { severity, kind }
    }

    pub fn transient(kind: ErrorKind) -> Self {
        Self::new(Severity::Transient, kind)
    }

    pub fn fatal(kind: ErrorKind) -> Self {
        Self::new(Severity::Fatal, kind)
    }

    pub fn shutdown() -> Self {
        Self::new(Severity::Shutdown, ErrorKind::ShuttingDown)
    }

    /// A point the device reports as not implemented.
    pub fn not_implemented(point: &'static str) -> Self {
        Self::transient(ErrorKind::NotImplemented(point))
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }

    pub fn is_shutdown(&self) -> bool {
        self.severity == Severity::Shutdown
    }
}

/// Link lifecycle notification sent by a gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// The link is up; the device has not been validated yet.
    Connected,
    /// The link went down; the gateway retries after `delay`.
    Disconnected { delay: Duration },
    /// An error outside of any request.
    Error(GatewayError),
}

/// Sender half of a poller inbox.
pub type EventSender = mpsc::UnboundedSender<GatewayEvent>;

/// AC phase selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    A,
    B,
    C,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::A, Phase::B, Phase::C];

    /// Zero-based phase index.
    pub fn index(&self) -> usize {
        match self {
            Phase::A => 0,
            Phase::B => 1,
            Phase::C => 2,
        }
    }
}

/// DC input selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Input {
    /// Sum over all inputs.
    Total,
    /// One MPPT input, zero-based.
    Module(u8),
}

/// Register-level client for a single device.
///
/// `connect` starts the gateway's own connection supervisor; link changes are
/// reported through the given inbox. Getters read the register cache filled by
/// the last fetch and never perform I/O.
#[async_trait]
pub trait DeviceGateway: Send + Sync {
    /// Start connecting. Lifecycle events go to `events`.
    fn connect(&self, events: EventSender);

    /// Drop the current link and reconnect with backoff.
    fn trigger_reconnect(&self);

    /// Stop the connection supervisor. Later calls fail with [`Severity::Shutdown`].
    async fn shutdown(&self);

    /// Check the SunSpec marker and model chain of the connected device.
    async fn validate_device(&self) -> GatewayResult<()>;

    /// Read the identity registers (common model).
    async fn fetch_device_info(&self) -> GatewayResult<()>;

    /// Read the measurement registers (inverter and MPPT models).
    async fn fetch_registers(&self) -> GatewayResult<()>;

    /// Read the operating state and event registers.
    async fn fetch_event_registers(&self) -> GatewayResult<()>;

    // Values (SI units; energies in Wh)
    fn ac_energy(&self) -> GatewayResult<f64>;
    fn ac_power_active(&self) -> GatewayResult<f64>;
    fn ac_power_apparent(&self) -> GatewayResult<f64>;
    fn ac_power_reactive(&self) -> GatewayResult<f64>;
    fn ac_power_factor(&self) -> GatewayResult<f64>;
    fn ac_voltage(&self, phase: Phase) -> GatewayResult<f64>;
    fn ac_current(&self, phase: Phase) -> GatewayResult<f64>;
    fn ac_frequency(&self) -> GatewayResult<f64>;
    fn dc_power(&self, input: Input) -> GatewayResult<f64>;
    fn dc_voltage(&self, input: Input) -> GatewayResult<f64>;
    fn dc_current(&self, input: Input) -> GatewayResult<f64>;
    fn dc_energy(&self, input: Input) -> GatewayResult<f64>;

    // Events
    fn active_state_code(&self) -> GatewayResult<u16>;
    fn state(&self) -> GatewayResult<String>;
    fn events(&self) -> GatewayResult<Vec<String>>;

    // Identity and capabilities
    fn manufacturer(&self) -> GatewayResult<String>;
    fn model(&self) -> GatewayResult<String>;
    fn serial_number(&self) -> GatewayResult<String>;
    fn firmware_version(&self) -> GatewayResult<String>;
    fn device_address(&self) -> GatewayResult<u16>;
    fn inverter_id(&self) -> GatewayResult<u16>;
    fn phases(&self) -> GatewayResult<u8>;
    fn inputs(&self) -> GatewayResult<u8>;
    fn is_hybrid(&self) -> GatewayResult<bool>;
    fn uses_float_registers(&self) -> GatewayResult<bool>;
}
