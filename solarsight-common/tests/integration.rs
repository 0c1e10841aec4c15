//! Integration tests for solarsight-common library.

use solarsight_common::{
    Channel, DeviceDocument, DeviceSnapshot, EventSnapshot, EventsDocument, InputValues,
    KeyExprBuilder, PhaseValues, RegisterModel, ValueSnapshot, ValuesDocument, efficiency,
    to_document,
};

#[test]
fn test_values_snapshot_to_document_workflow() {
    let ac = 5400.0;
    let dc = 5600.0;
    let snapshot = ValueSnapshot {
        time: 1_700_000_000_123,
        ac_energy: 27_810.5,
        ac_power_active: ac,
        ac_power_apparent: 5450.0,
        ac_power_reactive: 30.0,
        ac_power_factor: 0.99,
        phases: vec![
            PhaseValues {
                ac_voltage: 231.1,
                ac_current: 7.8,
            },
            PhaseValues {
                ac_voltage: 229.9,
                ac_current: 7.7,
            },
            PhaseValues {
                ac_voltage: 230.4,
                ac_current: 7.9,
            },
        ],
        ac_frequency: 49.98,
        dc_power: dc,
        efficiency: efficiency(ac, dc),
        inputs: vec![InputValues {
            dc_voltage: 600.0,
            dc_current: 9.33,
            dc_power: dc,
            dc_energy: Some(30_100.0),
        }],
    };

    let json = to_document(&ValuesDocument::from(&snapshot)).expect("values document");
    let decoded: ValuesDocument = serde_json::from_str(&json).expect("decode values");

    assert_eq!(decoded.time, 1_700_000_000_123);
    assert_eq!(decoded.phases.len(), 3);
    assert_eq!(decoded.phases[2].id, 3);
    assert_eq!(decoded.efficiency, 96.4);
    assert_eq!(decoded.inputs[0].dc_energy, Some(30_100.0));
}

#[test]
fn test_events_and_device_documents() {
    let events = EventSnapshot {
        active_code: 7,
        state: "FAULT".to_string(),
        events: vec!["OVER_TEMP".to_string(), "AC_OVER_VOLT".to_string()],
    };
    let json = to_document(&EventsDocument::from(&events)).expect("events document");
    let decoded: EventsDocument = serde_json::from_str(&json).expect("decode events");
    assert_eq!(decoded.events, events.events);

    let device = DeviceSnapshot {
        manufacturer: "SunSpec".to_string(),
        model: "Test".to_string(),
        serial: "SN1".to_string(),
        firmware: "1.0".to_string(),
        inverter_id: 103,
        register_model: RegisterModel::IntScaleFactor,
        phases: 3,
        inputs: 1,
        hybrid: true,
        modbus_address: 3,
    };
    let json = to_document(&DeviceDocument::from(&device)).expect("device document");
    assert!(json.contains("\"register_model\":\"int+sf\""));
}

#[test]
fn test_key_expressions_per_channel() {
    let builder = KeyExprBuilder::new("site/solar/");

    let keys: Vec<String> = Channel::ALL
        .iter()
        .map(|&channel| builder.build("inverter01", channel))
        .collect();
    assert_eq!(
        keys,
        vec![
            "site/solar/inverter01/device",
            "site/solar/inverter01/values",
            "site/solar/inverter01/events",
            "site/solar/inverter01/availability",
        ]
    );
    assert_eq!(builder.status_key(), "site/solar/@/status");
}
