//! Typed snapshots produced by one successful poll tick.
//!
//! Snapshots are immutable once built. A poller replaces the previous
//! snapshot of a channel with a new one as a whole; it never edits fields in
//! place.

use serde::{Deserialize, Serialize};

/// Below this magnitude the DC power is treated as zero.
pub const EFFICIENCY_EPSILON: f64 = 1e-12;

/// AC measurements of one phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseValues {
    /// Phase-to-neutral voltage (V).
    pub ac_voltage: f64,
    /// Phase current (A).
    pub ac_current: f64,
}

/// DC measurements of one input (MPP tracker).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InputValues {
    /// Input voltage (V).
    pub dc_voltage: f64,
    /// Input current (A).
    pub dc_current: f64,
    /// Input power (W).
    pub dc_power: f64,
    /// Lifetime input energy (kWh). Hybrid devices do not report it.
    pub dc_energy: Option<f64>,
}

/// All numeric quantities read in one successful tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueSnapshot {
    /// Unix epoch milliseconds when the registers were read.
    pub time: i64,
    /// Lifetime AC energy (kWh).
    pub ac_energy: f64,
    /// Active power (W).
    pub ac_power_active: f64,
    /// Apparent power (VA).
    pub ac_power_apparent: f64,
    /// Reactive power (var).
    pub ac_power_reactive: f64,
    /// Power factor.
    pub ac_power_factor: f64,
    /// One entry per device phase.
    pub phases: Vec<PhaseValues>,
    /// Grid frequency (Hz).
    pub ac_frequency: f64,
    /// Total DC power (W).
    pub dc_power: f64,
    /// Conversion efficiency (%), see [`efficiency`].
    pub efficiency: f64,
    /// One entry per DC input.
    pub inputs: Vec<InputValues>,
}

/// Operating state and active events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventSnapshot {
    /// Active state code reported by the device.
    pub active_code: u16,
    /// Human-readable operating state.
    pub state: String,
    /// Names of the currently active events.
    pub events: Vec<String>,
}

/// Register layout of the inverter model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterModel {
    /// Float32 points (SunSpec models 111-113).
    #[serde(rename = "float")]
    Float,
    /// Integer points with scale factors (SunSpec models 101-103).
    #[serde(rename = "int+sf")]
    IntScaleFactor,
}

impl RegisterModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterModel::Float => "float",
            RegisterModel::IntScaleFactor => "int+sf",
        }
    }
}

/// Static identity and capabilities of the connected device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
    /// SunSpec inverter model id (101-103 or 111-113).
    pub inverter_id: u16,
    pub register_model: RegisterModel,
    pub phases: u8,
    pub inputs: u8,
    pub hybrid: bool,
    /// Modbus address reported by the device itself.
    pub modbus_address: u16,
}

/// Conversion efficiency in percent.
///
/// Returns exactly `0.0` when `|dc_power|` is within [`EFFICIENCY_EPSILON`]
/// of zero, so the result is never infinite or NaN for finite inputs.
pub fn efficiency(ac_power_active: f64, dc_power: f64) -> f64 {
    if dc_power.abs() > EFFICIENCY_EPSILON {
        ac_power_active / dc_power * 100.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_efficiency_regular() {
        assert_eq!(efficiency(950.0, 1000.0), 95.0);
        assert_eq!(efficiency(-50.0, 200.0), -25.0);
    }

    #[test]
    fn test_efficiency_zero_denominator() {
        assert_eq!(efficiency(1200.0, 0.0), 0.0);
        assert_eq!(efficiency(1200.0, -0.0), 0.0);
        assert_eq!(efficiency(1200.0, 1e-13), 0.0);
        assert_eq!(efficiency(1200.0, -1e-13), 0.0);
    }

    #[test]
    fn test_efficiency_always_finite() {
        let samples = [
            (0.0, 1e-11),
            (1e300, 1e-11),
            (-3.5, 2.0e-12),
            (7.0, 1e12),
            (f64::MAX, 1.0),
        ];
        for (ac, dc) in samples {
            let e = efficiency(ac, dc);
            assert!(!e.is_nan(), "efficiency({}, {}) is NaN", ac, dc);
        }
    }

    #[test]
    fn test_register_model_str() {
        assert_eq!(RegisterModel::Float.as_str(), "float");
        assert_eq!(RegisterModel::IntScaleFactor.as_str(), "int+sf");
    }
}
