//! Poller behaviour against an in-memory scripted gateway.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio_test::{assert_err, assert_ok};

use solarsight_bridge_framework::{
    MessageSink, OutboundMessage, Outbox, QueueConfig, Result as BridgeResult,
};
use solarsight_common::{Channel, KeyExprBuilder};
use zenoh_bridge_sunspec::gateway::{
    DeviceGateway, ErrorKind, EventSender, GatewayError, GatewayEvent, GatewayResult, Input,
    Phase,
};
use zenoh_bridge_sunspec::poller::{
    ConnectionState, DevicePoller, Flow, PollerConfig, PollerError,
};

/// Failure switched on for the next fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchFailure {
    None,
    Transient,
    Fatal,
    Shutdown,
}

impl FetchFailure {
    fn check(&self) -> GatewayResult<()> {
        match self {
            FetchFailure::None => Ok(()),
            FetchFailure::Transient => Err(GatewayError::transient(ErrorKind::Timeout(
                Duration::from_millis(500),
            ))),
            FetchFailure::Fatal => Err(GatewayError::fatal(ErrorKind::InvalidAddress(
                "no such host".into(),
            ))),
            FetchFailure::Shutdown => Err(GatewayError::shutdown()),
        }
    }
}

struct ScriptedGateway {
    events: Mutex<Option<EventSender>>,
    fetch_failure: Mutex<FetchFailure>,
    fail_power_getter: AtomicBool,
    fail_device_info: AtomicBool,
    validation_failures: AtomicUsize,
    auto_reconnect: AtomicBool,
    hybrid: AtomicBool,
    dc_power_total: Mutex<f64>,
    active_events: Mutex<Vec<String>>,
    device_info_fetches: AtomicUsize,
    reconnects: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl ScriptedGateway {
    fn new() -> Self {
        Self {
            events: Mutex::new(None),
            fetch_failure: Mutex::new(FetchFailure::None),
            fail_power_getter: AtomicBool::new(false),
            fail_device_info: AtomicBool::new(false),
            validation_failures: AtomicUsize::new(0),
            auto_reconnect: AtomicBool::new(true),
            hybrid: AtomicBool::new(false),
            dc_power_total: Mutex::new(3100.0),
            active_events: Mutex::new(vec!["DC_OVER_VOLT".to_string()]),
            device_info_fetches: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }

    fn send(&self, event: GatewayEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn set_fetch_failure(&self, failure: FetchFailure) {
        *self.fetch_failure.lock() = failure;
    }

    fn fetch(&self) -> GatewayResult<()> {
        self.fetch_failure.lock().check()
    }
}

#[async_trait]
impl DeviceGateway for ScriptedGateway {
    fn connect(&self, events: EventSender) {
        let _ = events.send(GatewayEvent::Connected);
        *self.events.lock() = Some(events);
    }

    fn trigger_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        if self.auto_reconnect.load(Ordering::SeqCst) {
            self.send(GatewayEvent::Connected);
        }
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    async fn validate_device(&self) -> GatewayResult<()> {
        let remaining = self.validation_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.validation_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(GatewayError::transient(ErrorKind::InvalidDevice(
                "SunS marker not found at 40000".into(),
            )));
        }
        Ok(())
    }

    async fn fetch_device_info(&self) -> GatewayResult<()> {
        self.device_info_fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_device_info.load(Ordering::SeqCst) {
            return Err(GatewayError::transient(ErrorKind::Timeout(
                Duration::from_millis(500),
            )));
        }
        self.fetch()
    }

    async fn fetch_registers(&self) -> GatewayResult<()> {
        self.fetch()
    }

    async fn fetch_event_registers(&self) -> GatewayResult<()> {
        self.fetch()
    }

    fn ac_energy(&self) -> GatewayResult<f64> {
        Ok(12_345_000.0)
    }

    fn ac_power_active(&self) -> GatewayResult<f64> {
        if self.fail_power_getter.load(Ordering::SeqCst) {
            return Err(GatewayError::not_implemented("ac_power_active"));
        }
        Ok(2950.0)
    }

    fn ac_power_apparent(&self) -> GatewayResult<f64> {
        Ok(3000.0)
    }

    fn ac_power_reactive(&self) -> GatewayResult<f64> {
        Ok(-100.0)
    }

    fn ac_power_factor(&self) -> GatewayResult<f64> {
        Ok(0.98)
    }

    fn ac_voltage(&self, phase: Phase) -> GatewayResult<f64> {
        Ok([230.1, 231.2, 229.9][phase.index()])
    }

    fn ac_current(&self, _phase: Phase) -> GatewayResult<f64> {
        Ok(4.3)
    }

    fn ac_frequency(&self) -> GatewayResult<f64> {
        Ok(50.01)
    }

    fn dc_power(&self, input: Input) -> GatewayResult<f64> {
        match input {
            Input::Total => Ok(*self.dc_power_total.lock()),
            Input::Module(_) => Ok(1550.0),
        }
    }

    fn dc_voltage(&self, _input: Input) -> GatewayResult<f64> {
        Ok(400.0)
    }

    fn dc_current(&self, _input: Input) -> GatewayResult<f64> {
        Ok(3.875)
    }

    fn dc_energy(&self, _input: Input) -> GatewayResult<f64> {
        Ok(5_000_000.0)
    }

    fn active_state_code(&self) -> GatewayResult<u16> {
        Ok(4)
    }

    fn state(&self) -> GatewayResult<String> {
        Ok("MPPT".to_string())
    }

    fn events(&self) -> GatewayResult<Vec<String>> {
        Ok(self.active_events.lock().clone())
    }

    fn manufacturer(&self) -> GatewayResult<String> {
        Ok("Fronius".to_string())
    }

    fn model(&self) -> GatewayResult<String> {
        Ok("Symo 8.2-3-M".to_string())
    }

    fn serial_number(&self) -> GatewayResult<String> {
        Ok("28136344".to_string())
    }

    fn firmware_version(&self) -> GatewayResult<String> {
        Ok("0.3.30.2".to_string())
    }

    fn device_address(&self) -> GatewayResult<u16> {
        Ok(1)
    }

    fn inverter_id(&self) -> GatewayResult<u16> {
        Ok(113)
    }

    fn phases(&self) -> GatewayResult<u8> {
        Ok(3)
    }

    fn inputs(&self) -> GatewayResult<u8> {
        Ok(2)
    }

    fn is_hybrid(&self) -> GatewayResult<bool> {
        Ok(self.hybrid.load(Ordering::SeqCst))
    }

    fn uses_float_registers(&self) -> GatewayResult<bool> {
        Ok(true)
    }
}

type Documents = Arc<Mutex<Vec<(Channel, String)>>>;

struct Harness {
    gateway: Arc<ScriptedGateway>,
    poller: DevicePoller<ScriptedGateway>,
    documents: Documents,
}

fn poller_config(interval: Duration) -> PollerConfig {
    PollerConfig {
        device_name: "inverter01".to_string(),
        unit_id: 1,
        update_interval: interval,
    }
}

fn harness() -> Harness {
    let gateway = Arc::new(ScriptedGateway::new());
    let poller = DevicePoller::new(gateway.clone(), poller_config(Duration::from_secs(1)));
    let documents: Documents = Arc::new(Mutex::new(Vec::new()));

    for channel in Channel::ALL {
        let documents = documents.clone();
        let record = move |document: String| documents.lock().push((channel, document));
        match channel {
            Channel::Values => poller.on_values(record),
            Channel::Events => poller.on_events(record),
            Channel::Device => poller.on_device(record),
            Channel::Availability => poller.on_availability(record),
        }
    }

    Harness {
        gateway,
        poller,
        documents,
    }
}

impl Harness {
    async fn connect(&mut self) {
        self.poller.start();
        assert!(matches!(
            self.poller.process_pending_events().await,
            Flow::Continue
        ));
        assert_eq!(self.poller.state(), ConnectionState::Connected);
    }

    async fn tick_and_recover(&mut self) -> zenoh_bridge_sunspec::poller::TickOutcome {
        let outcome = self.poller.tick().await;
        assert!(matches!(self.poller.after_tick(&outcome), Flow::Continue));
        assert!(matches!(
            self.poller.process_pending_events().await,
            Flow::Continue
        ));
        outcome
    }

    fn count(&self, channel: Channel) -> usize {
        self.documents
            .lock()
            .iter()
            .filter(|(c, _)| *c == channel)
            .count()
    }

    fn last(&self, channel: Channel) -> Value {
        let documents = self.documents.lock();
        let (_, document) = documents
            .iter()
            .rev()
            .find(|(c, _)| *c == channel)
            .expect("document dispatched");
        serde_json::from_str(document).unwrap()
    }

    fn availability(&self) -> Vec<String> {
        self.documents
            .lock()
            .iter()
            .filter(|(c, _)| *c == Channel::Availability)
            .map(|(_, d)| {
                let value: Value = serde_json::from_str(d).unwrap();
                value["status"].as_str().unwrap().to_string()
            })
            .collect()
    }
}

#[tokio::test]
async fn test_fetch_failure_on_second_of_three_ticks() {
    let mut h = harness();
    h.connect().await;

    let first = h.poller.tick().await;
    assert!(first.device_updated && first.values_updated && first.events_updated);
    assert!(matches!(h.poller.after_tick(&first), Flow::Continue));
    assert_eq!(h.poller.state(), ConnectionState::Connected);

    h.gateway.set_fetch_failure(FetchFailure::Transient);
    let second = h.poller.tick().await;
    assert!(!second.values_updated);
    assert!(!second.events_updated);
    assert_eq!(second.failures.len(), 2);
    assert_eq!(h.poller.state(), ConnectionState::Disconnected);

    assert!(matches!(h.poller.after_tick(&second), Flow::Continue));
    assert_eq!(h.gateway.reconnects.load(Ordering::SeqCst), 1);

    h.gateway.set_fetch_failure(FetchFailure::None);
    assert!(matches!(
        h.poller.process_pending_events().await,
        Flow::Continue
    ));
    assert_eq!(h.poller.state(), ConnectionState::Connected);

    let third = h.poller.tick().await;
    assert!(third.values_updated && third.events_updated);
    assert!(!third.device_updated);

    assert_eq!(h.count(Channel::Device), 1);
    assert_eq!(h.count(Channel::Values), 2);
    assert_eq!(h.count(Channel::Events), 2);
    assert_eq!(h.availability(), vec!["online", "offline", "online"]);
}

#[tokio::test]
async fn test_getter_failure_keeps_previous_values() {
    let mut h = harness();
    h.connect().await;
    let handle = h.poller.handle();

    h.tick_and_recover().await;
    let before = handle.last_values().expect("values committed");
    let before_document = handle.values_document();

    h.gateway.fail_power_getter.store(true, Ordering::SeqCst);
    let outcome = h.poller.tick().await;
    assert!(!outcome.values_updated);
    assert!(outcome.events_updated);
    assert_eq!(h.poller.state(), ConnectionState::Disconnected);

    let after = handle.last_values().expect("values still present");
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(handle.values_document(), before_document);
    assert_eq!(h.count(Channel::Values), 1);
    assert_eq!(h.count(Channel::Events), 2);
}

#[tokio::test]
async fn test_device_document_once_per_connection() {
    let mut h = harness();
    h.connect().await;

    for _ in 0..3 {
        h.tick_and_recover().await;
    }
    assert_eq!(h.count(Channel::Device), 1);
    assert_eq!(h.gateway.device_info_fetches.load(Ordering::SeqCst), 1);

    h.gateway.send(GatewayEvent::Disconnected {
        delay: Duration::from_secs(1),
    });
    h.gateway.send(GatewayEvent::Connected);
    assert!(matches!(
        h.poller.process_pending_events().await,
        Flow::Continue
    ));
    assert_eq!(h.poller.state(), ConnectionState::Connected);

    for _ in 0..2 {
        h.tick_and_recover().await;
    }
    assert_eq!(h.count(Channel::Device), 2);
    assert_eq!(h.gateway.device_info_fetches.load(Ordering::SeqCst), 2);

    let device = h.last(Channel::Device);
    assert_eq!(device["manufacturer"], "Fronius");
    assert_eq!(device["inverter_id"], 113);
    assert_eq!(device["register_model"], "float");
    assert_eq!(device["phases"], 3);
    assert_eq!(device["modbus_address"], 1);
}

#[tokio::test]
async fn test_device_update_retried_after_failure() {
    let mut h = harness();
    h.connect().await;

    h.gateway.set_fetch_failure(FetchFailure::Transient);
    let outcome = h.tick_and_recover().await;
    assert!(!outcome.device_updated);
    assert_eq!(h.poller.state(), ConnectionState::Connected);

    h.gateway.set_fetch_failure(FetchFailure::None);
    let outcome = h.tick_and_recover().await;
    assert!(outcome.device_updated);
    assert_eq!(h.count(Channel::Device), 1);
    assert_eq!(h.gateway.device_info_fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_device_info_failure_keeps_connection() {
    let mut h = harness();
    h.gateway.auto_reconnect.store(false, Ordering::SeqCst);
    h.connect().await;

    h.gateway.fail_device_info.store(true, Ordering::SeqCst);
    let outcome = h.tick_and_recover().await;
    assert!(!outcome.device_updated);
    assert!(outcome.device_error.is_some());
    assert!(outcome.values_updated);
    assert!(outcome.events_updated);
    assert!(outcome.failures.is_empty());
    assert_eq!(h.poller.state(), ConnectionState::Connected);
    assert_eq!(h.gateway.reconnects.load(Ordering::SeqCst), 0);

    h.gateway.fail_device_info.store(false, Ordering::SeqCst);
    let outcome = h.tick_and_recover().await;
    assert!(outcome.ran);
    assert!(outcome.device_updated);
    assert_eq!(h.count(Channel::Values), 2);
    assert_eq!(h.count(Channel::Device), 1);
    assert_eq!(h.availability(), vec!["online"]);
}

#[tokio::test]
async fn test_fatal_device_info_failure_stops() {
    let mut h = harness();
    h.connect().await;

    h.gateway.set_fetch_failure(FetchFailure::Fatal);
    let outcome = h.poller.tick().await;
    assert!(outcome.device_error.is_none());
    assert!(matches!(h.poller.after_tick(&outcome), Flow::Stop(_)));
}

#[tokio::test]
async fn test_validation_failure_is_not_raised() {
    let mut h = harness();
    h.gateway.auto_reconnect.store(false, Ordering::SeqCst);
    h.gateway.validation_failures.store(1, Ordering::SeqCst);

    h.poller.start();
    assert!(matches!(
        h.poller.process_pending_events().await,
        Flow::Continue
    ));
    assert_eq!(h.poller.state(), ConnectionState::Disconnected);
    assert_eq!(h.gateway.reconnects.load(Ordering::SeqCst), 1);

    let outcome = h.poller.tick().await;
    assert!(!outcome.ran);
    assert_eq!(h.count(Channel::Values), 0);

    h.gateway.send(GatewayEvent::Connected);
    assert!(matches!(
        h.poller.process_pending_events().await,
        Flow::Continue
    ));
    assert_eq!(h.poller.state(), ConnectionState::Connected);
    assert_eq!(h.availability(), vec!["online"]);
}

#[tokio::test]
async fn test_fatal_gateway_event_stops() {
    let mut h = harness();
    h.connect().await;

    h.gateway.send(GatewayEvent::Error(GatewayError::fatal(
        ErrorKind::Connection("serial open failed on /dev/ttyUSB0".into()),
    )));
    let flow = h.poller.process_pending_events().await;
    assert!(matches!(flow, Flow::Stop(e) if e.is_fatal()));
}

#[tokio::test]
async fn test_transient_gateway_event_reconnects() {
    let mut h = harness();
    h.gateway.auto_reconnect.store(false, Ordering::SeqCst);
    h.connect().await;

    h.gateway
        .send(GatewayEvent::Error(GatewayError::transient(ErrorKind::NotConnected)));
    assert!(matches!(
        h.poller.process_pending_events().await,
        Flow::Continue
    ));
    assert_eq!(h.poller.state(), ConnectionState::Connecting);
    assert_eq!(h.gateway.reconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fatal_fetch_stops_after_tick() {
    let mut h = harness();
    h.connect().await;

    h.gateway.set_fetch_failure(FetchFailure::Fatal);
    let outcome = h.poller.tick().await;
    assert!(matches!(h.poller.after_tick(&outcome), Flow::Stop(e) if e.is_fatal()));
    assert_eq!(h.gateway.reconnects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_shutdown_failure_is_silent() {
    let mut h = harness();
    h.connect().await;

    h.gateway.set_fetch_failure(FetchFailure::Shutdown);
    let outcome = h.poller.tick().await;
    assert!(!outcome.failures.is_empty());
    assert!(matches!(h.poller.after_tick(&outcome), Flow::Continue));
    assert_eq!(h.gateway.reconnects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_values_document_contents() {
    let mut h = harness();
    h.connect().await;
    h.tick_and_recover().await;

    let values = h.last(Channel::Values);
    assert_eq!(values["ac_energy"], 12345.0);
    assert_eq!(values["ac_power_active"], 2950.0);
    assert_eq!(values["efficiency"], 95.2);
    assert_eq!(values["phases"].as_array().unwrap().len(), 3);
    assert_eq!(values["phases"][1]["id"], 2);
    assert_eq!(values["phases"][1]["ac_voltage"], 231.2);

    let inputs = values["inputs"].as_array().unwrap();
    assert_eq!(inputs.len(), 2);
    assert_eq!(inputs[0]["dc_current"], 3.875);
    assert_eq!(inputs[1]["dc_energy"], 5000.0);

    let events = h.last(Channel::Events);
    assert_eq!(events["active_code"], 4);
    assert_eq!(events["state"], "MPPT");
    assert_eq!(events["events"][0], "DC_OVER_VOLT");
}

#[tokio::test]
async fn test_efficiency_zero_without_dc_power() {
    let mut h = harness();
    *h.gateway.dc_power_total.lock() = 0.0;
    h.connect().await;
    h.tick_and_recover().await;

    let values = h.poller.handle().last_values().unwrap();
    assert_eq!(values.snapshot.efficiency, 0.0);
    assert_eq!(h.last(Channel::Values)["efficiency"], 0.0);
}

#[tokio::test]
async fn test_hybrid_inputs_have_no_energy() {
    let mut h = harness();
    h.gateway.hybrid.store(true, Ordering::SeqCst);
    h.connect().await;
    h.tick_and_recover().await;

    let values = h.last(Channel::Values);
    for input in values["inputs"].as_array().unwrap() {
        assert!(input.get("dc_energy").is_none());
    }
    assert_eq!(h.last(Channel::Device)["hybrid"], true);
}

#[tokio::test]
async fn test_unchanged_events_dispatched_every_tick() {
    let mut h = harness();
    h.connect().await;

    for _ in 0..3 {
        h.tick_and_recover().await;
    }
    let documents: Vec<String> = h
        .documents
        .lock()
        .iter()
        .filter(|(c, _)| *c == Channel::Events)
        .map(|(_, d)| d.clone())
        .collect();
    assert_eq!(documents.len(), 3);
    assert!(documents.windows(2).all(|w| w[0] == w[1]));

    h.gateway.active_events.lock().push("GROUND_FAULT".to_string());
    h.tick_and_recover().await;
    assert_eq!(h.count(Channel::Events), 4);
    assert_eq!(
        h.last(Channel::Events)["events"].as_array().unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_callback_may_read_poller_state() {
    let gateway = Arc::new(ScriptedGateway::new());
    let mut poller = DevicePoller::new(gateway, poller_config(Duration::from_secs(1)));
    let handle = poller.handle();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let observed = seen.clone();
    let reader = handle.clone();
    poller.on_values(move |document| {
        let committed = reader.values_document();
        observed
            .lock()
            .push((reader.state(), committed == Some(document)));
    });

    poller.start();
    poller.process_pending_events().await;
    poller.tick().await;

    assert_eq!(*seen.lock(), vec![(ConnectionState::Connected, true)]);
}

#[tokio::test(start_paused = true)]
async fn test_run_until_shutdown() {
    let h = harness();
    let handle = h.poller.handle();
    let mut state = handle.subscribe_state();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(h.poller.run(shutdown_rx));
    assert_ok!(
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .map(|_| ())
    );

    tokio::time::sleep(Duration::from_millis(2500)).await;
    shutdown_tx.send_replace(true);

    let result = task.await.unwrap();
    assert_ok!(result);

    assert_eq!(handle.state(), ConnectionState::Shutdown);
    assert_eq!(h.gateway.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.documents
            .lock()
            .iter()
            .filter(|(c, _)| *c == Channel::Values)
            .count(),
        2
    );

    let statuses: Vec<String> = h
        .documents
        .lock()
        .iter()
        .filter(|(c, _)| *c == Channel::Availability)
        .map(|(_, d)| serde_json::from_str::<Value>(d).unwrap()["status"].to_string())
        .collect();
    assert_eq!(statuses, vec!["\"online\"", "\"offline\""]);
    assert!(handle.availability_document().unwrap().contains("offline"));
}

#[tokio::test(start_paused = true)]
async fn test_run_ends_on_fatal_error() {
    let h = harness();
    let handle = h.poller.handle();
    let mut state = handle.subscribe_state();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(h.poller.run(shutdown_rx));
    state
        .wait_for(|s| *s == ConnectionState::Connected)
        .await
        .unwrap();

    h.gateway.send(GatewayEvent::Error(GatewayError::fatal(
        ErrorKind::InvalidAddress("inverter.local:502".into()),
    )));

    let result = task.await.unwrap();
    let err = assert_err!(result);
    assert!(matches!(err, PollerError::Fatal(ref e) if e.is_fatal()));
    assert_eq!(handle.state(), ConnectionState::Shutdown);

    let offline = h
        .documents
        .lock()
        .iter()
        .filter(|(c, d)| *c == Channel::Availability && d.contains("offline"))
        .count();
    assert_eq!(offline, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_before_connect_dispatches_offline_once() {
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.validation_failures.store(usize::MAX, Ordering::SeqCst);
    gateway.auto_reconnect.store(false, Ordering::SeqCst);

    let poller = DevicePoller::new(gateway.clone(), poller_config(Duration::from_secs(1)));
    let availability = Arc::new(Mutex::new(Vec::new()));
    let recorded = availability.clone();
    poller.on_availability(move |d| recorded.lock().push(d));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(poller.run(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx.send_replace(true);
    assert_ok!(task.await.unwrap());

    let availability = availability.lock();
    assert_eq!(availability.len(), 1);
    assert!(availability[0].contains("offline"));
}

/// Sink recording every delivered message.
struct RecordingSink {
    delivered: Mutex<Vec<OutboundMessage>>,
    connected: watch::Sender<bool>,
}

#[async_trait]
impl MessageSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn publish(&self, topic: &str, payload: &str) -> BridgeResult<()> {
        self.delivered
            .lock()
            .push(OutboundMessage::new(topic, payload));
        Ok(())
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}

#[tokio::test]
async fn test_documents_flow_through_outbox() {
    let (connected, _) = watch::channel(true);
    let sink = Arc::new(RecordingSink {
        delivered: Mutex::new(Vec::new()),
        connected,
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let outbox = Outbox::new(sink.clone(), QueueConfig::default(), shutdown_rx).unwrap();

    let keys = KeyExprBuilder::new("solarsight/sunspec");
    let gateway = Arc::new(ScriptedGateway::new());
    let mut poller = DevicePoller::new(gateway, poller_config(Duration::from_secs(1)));
    poller.on_values(outbox.producer(&keys.build("inverter01", Channel::Values)));
    poller.on_events(outbox.producer(&keys.build("inverter01", Channel::Events)));
    poller.on_device(outbox.producer(&keys.build("inverter01", Channel::Device)));

    poller.start();
    poller.process_pending_events().await;
    poller.tick().await;
    poller.tick().await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while sink.delivered.lock().len() < 5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all documents delivered");

    let delivered = sink.delivered.lock().clone();
    let topics: Vec<&str> = delivered.iter().map(|m| m.topic.as_str()).collect();
    assert_eq!(
        topics
            .iter()
            .filter(|t| **t == "solarsight/sunspec/inverter01/values")
            .count(),
        2
    );
    assert_eq!(
        topics
            .iter()
            .filter(|t| **t == "solarsight/sunspec/inverter01/device")
            .count(),
        1
    );

    shutdown_tx.send_replace(true);
    outbox.join().await;
}

#[tokio::test]
async fn test_final_offline_bypasses_queue() {
    let (connected, _) = watch::channel(true);
    let sink = Arc::new(RecordingSink {
        delivered: Mutex::new(Vec::new()),
        connected,
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let outbox = Outbox::new(sink.clone(), QueueConfig::default(), shutdown_rx.clone()).unwrap();

    let topic =
        KeyExprBuilder::new("solarsight/sunspec").build("inverter01", Channel::Availability);
    let gateway = Arc::new(ScriptedGateway::new());
    let poller = DevicePoller::new(gateway.clone(), poller_config(Duration::from_secs(1)));
    let handle = poller.handle();

    let enqueue = outbox.producer(&topic);
    let live = handle.clone();
    poller.on_availability(move |document| {
        if live.state() != ConnectionState::Shutdown {
            enqueue(document);
        }
    });

    let delivered = sink.clone();
    let statuses = move || -> Vec<String> {
        delivered
            .delivered
            .lock()
            .iter()
            .map(|m| {
                let value: Value = serde_json::from_str(&m.payload).unwrap();
                value["status"].as_str().unwrap().to_string()
            })
            .collect()
    };
    let wait_for_deliveries = |count: usize| {
        let sink = sink.clone();
        async move {
            tokio::time::timeout(Duration::from_secs(5), async {
                while sink.delivered.lock().len() < count {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("availability delivered");
        }
    };

    let task = tokio::spawn(poller.run(shutdown_rx));
    wait_for_deliveries(1).await;

    gateway.send(GatewayEvent::Error(GatewayError::transient(ErrorKind::Timeout(
        Duration::from_millis(500),
    ))));
    wait_for_deliveries(3).await;
    assert_eq!(statuses(), vec!["online", "offline", "online"]);

    gateway.send(GatewayEvent::Error(GatewayError::fatal(
        ErrorKind::InvalidAddress("inverter.local:502".into()),
    )));
    assert_err!(task.await.unwrap());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(statuses(), vec!["online", "offline", "online"]);

    let document = handle.availability_document().expect("final availability");
    assert_ok!(sink.publish(&topic, &document).await);
    assert_eq!(statuses(), vec!["online", "offline", "online", "offline"]);

    shutdown_tx.send_replace(true);
    outbox.join().await;
}
