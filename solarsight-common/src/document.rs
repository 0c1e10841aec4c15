//! JSON documents published for each snapshot channel.
//!
//! Field order in the serialized output follows the struct declaration order.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::snapshot::{DeviceSnapshot, EventSnapshot, RegisterModel, ValueSnapshot};

/// Round `value` to `decimals` decimal places.
///
/// Non-finite values are returned unchanged.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let factor = 10f64.powi(decimals);
    let rounded = (value * factor).round() / factor;
    // Avoid "-0.0" in documents.
    if rounded == 0.0 { 0.0 } else { rounded }
}

/// Serialize a document to its JSON string form.
pub fn to_document<T: Serialize>(document: &T) -> Result<String> {
    Ok(serde_json::to_string(document)?)
}

/// Per-phase entry of the values document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDocument {
    pub id: u8,
    pub ac_voltage: f64,
    pub ac_current: f64,
}

/// Per-input entry of the values document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDocument {
    pub id: u8,
    pub dc_voltage: f64,
    pub dc_current: f64,
    pub dc_power: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dc_energy: Option<f64>,
}

/// Document for the `values` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuesDocument {
    pub time: i64,
    pub ac_energy: f64,
    pub ac_power_active: f64,
    pub ac_power_apparent: f64,
    pub ac_power_reactive: f64,
    pub ac_power_factor: f64,
    pub phases: Vec<PhaseDocument>,
    pub ac_frequency: f64,
    pub dc_power: f64,
    pub efficiency: f64,
    pub inputs: Vec<InputDocument>,
}

impl From<&ValueSnapshot> for ValuesDocument {
    fn from(values: &ValueSnapshot) -> Self {
        let phases = values
            .phases
            .iter()
            .zip(1u8..)
            .map(|(phase, id)| PhaseDocument {
                id,
                ac_voltage: round_to(phase.ac_voltage, 2),
                ac_current: round_to(phase.ac_current, 3),
            })
            .collect();

        let inputs = values
            .inputs
            .iter()
            .zip(1u8..)
            .map(|(input, id)| InputDocument {
                id,
                dc_voltage: round_to(input.dc_voltage, 2),
                dc_current: round_to(input.dc_current, 3),
                dc_power: round_to(input.dc_power, 1),
                dc_energy: input.dc_energy.map(|e| round_to(e, 1)),
            })
            .collect();

        Self {
            time: values.time,
            ac_energy: round_to(values.ac_energy, 1),
            ac_power_active: round_to(values.ac_power_active, 1),
            ac_power_apparent: round_to(values.ac_power_apparent, 1),
            ac_power_reactive: round_to(values.ac_power_reactive, 1),
            ac_power_factor: round_to(values.ac_power_factor, 1),
            phases,
            ac_frequency: round_to(values.ac_frequency, 2),
            dc_power: round_to(values.dc_power, 1),
            efficiency: round_to(values.efficiency, 1),
            inputs,
        }
    }
}

/// Document for the `events` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsDocument {
    pub active_code: u16,
    pub state: String,
    pub events: Vec<String>,
}

impl From<&EventSnapshot> for EventsDocument {
    fn from(events: &EventSnapshot) -> Self {
        Self {
            active_code: events.active_code,
            state: events.state.clone(),
            events: events.events.clone(),
        }
    }
}

/// Document for the `device` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDocument {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub inverter_id: u16,
    pub register_model: RegisterModel,
    pub phases: u8,
    pub inputs: u8,
    pub hybrid: bool,
    pub modbus_address: u16,
}

impl From<&DeviceSnapshot> for DeviceDocument {
    fn from(device: &DeviceSnapshot) -> Self {
        Self {
            manufacturer: device.manufacturer.clone(),
            model: device.model.clone(),
            serial: device.serial.clone(),
            firmware: device.firmware.clone(),
            inverter_id: device.inverter_id,
            register_model: device.register_model,
            phases: device.phases,
            inputs: device.inputs,
            hybrid: device.hybrid,
            modbus_address: device.modbus_address,
        }
    }
}

/// Availability status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Online,
    Offline,
}

/// Document for the `availability` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityDocument {
    pub status: Availability,
    pub time: i64,
}

impl AvailabilityDocument {
    pub fn new(online: bool, time: i64) -> Self {
        Self {
            status: if online {
                Availability::Online
            } else {
                Availability::Offline
            },
            time,
        }
    }
}
