//! Device polling: connection state, periodic reads and snapshot dispatch.
//!
//! A [`DevicePoller`] owns one device. It is driven by a single task: gateway
//! lifecycle events arrive through its inbox, and every update interval a tick
//! reads the device, commits new snapshots and dispatches their JSON documents
//! to the registered callbacks. Readers observe committed snapshots through a
//! [`PollerHandle`] without ever waiting on device I/O.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, warn};

use solarsight_bridge_framework::wait_for_shutdown;
use solarsight_common::{
    AvailabilityDocument, Channel, DeviceDocument, DeviceSnapshot, EventSnapshot, EventsDocument,
    InputValues, PhaseValues, RegisterModel, ValueSnapshot, ValuesDocument, efficiency,
    to_document,
};

use crate::config::SunspecConfig;
use crate::gateway::{
    DeviceGateway, ErrorKind, EventSender, GatewayError, GatewayEvent, GatewayResult, Input,
    Phase, Severity,
};

/// Callback receiving one serialized document.
pub type Callback = Arc<dyn Fn(String) + Send + Sync>;

/// Connection state as seen by the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The run loop has exited.
    Shutdown,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Poller settings.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub device_name: String,
    /// Configured Modbus unit id, compared with the device-reported address.
    pub unit_id: u8,
    pub update_interval: Duration,
}

impl PollerConfig {
    pub fn from_sunspec(config: &SunspecConfig) -> Self {
        Self {
            device_name: config.device.name.clone(),
            unit_id: config.device.unit_id,
            update_interval: config.update_interval(),
        }
    }
}

/// Error ending the poller run loop.
#[derive(Debug, Error)]
pub enum PollerError {
    #[error("fatal gateway error: {0}")]
    Fatal(#[source] GatewayError),
}

/// Why a channel update was declined.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("failed to read {quantity}: {source}")]
    Gateway {
        quantity: &'static str,
        source: GatewayError,
    },

    #[error("failed to serialize {channel} document: {source}")]
    Serialize {
        channel: &'static str,
        source: solarsight_common::Error,
    },
}

impl UpdateError {
    pub fn severity(&self) -> Severity {
        match self {
            UpdateError::Gateway { source, .. } => source.severity,
            UpdateError::Serialize { .. } => Severity::Transient,
        }
    }

    /// The gateway error, when the update failed on the device side.
    pub fn gateway_error(&self) -> Option<&GatewayError> {
        match self {
            UpdateError::Gateway { source, .. } => Some(source),
            UpdateError::Serialize { .. } => None,
        }
    }
}

trait QuantityExt<T> {
    fn quantity(self, quantity: &'static str) -> Result<T, UpdateError>;
}

impl<T> QuantityExt<T> for GatewayResult<T> {
    fn quantity(self, quantity: &'static str) -> Result<T, UpdateError> {
        self.map_err(|source| UpdateError::Gateway { quantity, source })
    }
}

fn serialize<D: Serialize>(channel: Channel, document: &D) -> Result<String, UpdateError> {
    to_document(document).map_err(|source| UpdateError::Serialize {
        channel: channel.as_str(),
        source,
    })
}

/// A committed snapshot and its serialized document.
#[derive(Debug)]
pub struct Committed<T> {
    pub snapshot: T,
    pub document: String,
}

/// Slot holding the latest committed snapshot, replaced as a whole.
#[derive(Debug)]
struct Slot<T>(RwLock<Option<Arc<Committed<T>>>>);

impl<T> Slot<T> {
    fn new() -> Self {
        Self(RwLock::new(None))
    }

    fn load(&self) -> Option<Arc<Committed<T>>> {
        self.0.read().clone()
    }

    fn commit(&self, snapshot: T, document: String) -> Arc<Committed<T>> {
        let committed = Arc::new(Committed { snapshot, document });
        *self.0.write() = Some(Arc::clone(&committed));
        committed
    }
}

#[derive(Default)]
struct Callbacks {
    values: Option<Callback>,
    events: Option<Callback>,
    device: Option<Callback>,
    availability: Option<Callback>,
}

impl Callbacks {
    fn slot(&mut self, channel: Channel) -> &mut Option<Callback> {
        match channel {
            Channel::Values => &mut self.values,
            Channel::Events => &mut self.events,
            Channel::Device => &mut self.device,
            Channel::Availability => &mut self.availability,
        }
    }

    fn get(&self, channel: Channel) -> Option<Callback> {
        match channel {
            Channel::Values => self.values.clone(),
            Channel::Events => self.events.clone(),
            Channel::Device => self.device.clone(),
            Channel::Availability => self.availability.clone(),
        }
    }
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    values: Slot<ValueSnapshot>,
    events: Slot<EventSnapshot>,
    device: Slot<DeviceSnapshot>,
    availability: RwLock<Option<String>>,
    callbacks: RwLock<Callbacks>,
}

/// Read-only view of a poller, cheap to clone.
#[derive(Clone)]
pub struct PollerHandle {
    shared: Arc<Shared>,
}

impl PollerHandle {
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn last_values(&self) -> Option<Arc<Committed<ValueSnapshot>>> {
        self.shared.values.load()
    }

    pub fn last_events(&self) -> Option<Arc<Committed<EventSnapshot>>> {
        self.shared.events.load()
    }

    pub fn last_device(&self) -> Option<Arc<Committed<DeviceSnapshot>>> {
        self.shared.device.load()
    }

    /// Serialized document of the last committed values.
    pub fn values_document(&self) -> Option<String> {
        self.shared.values.load().map(|c| c.document.clone())
    }

    /// Last availability document dispatched.
    pub fn availability_document(&self) -> Option<String> {
        self.shared.availability.read().clone()
    }
}

impl std::fmt::Debug for PollerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// Whether the run loop should keep going.
#[derive(Debug)]
pub enum Flow {
    Continue,
    Stop(GatewayError),
}

/// Result of one tick.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// False when the tick was skipped because the poller was not connected.
    pub ran: bool,
    pub device_updated: bool,
    pub values_updated: bool,
    pub events_updated: bool,
    /// Transient device-info failure. Retried on the next tick, never reconnects.
    pub device_error: Option<UpdateError>,
    pub failures: Vec<UpdateError>,
}

impl TickOutcome {
    /// Most severe failure class of this tick.
    pub fn severity(&self) -> Option<Severity> {
        self.failures
            .iter()
            .map(UpdateError::severity)
            .max_by_key(|severity| match severity {
                Severity::Transient => 0,
                Severity::Shutdown => 1,
                Severity::Fatal => 2,
            })
    }

    fn fatal(&self) -> Option<&GatewayError> {
        self.failures
            .iter()
            .filter_map(UpdateError::gateway_error)
            .find(|e| e.is_fatal())
    }
}

/// Single-device poller.
pub struct DevicePoller<G> {
    gateway: Arc<G>,
    config: PollerConfig,
    inbox_tx: EventSender,
    inbox: mpsc::UnboundedReceiver<GatewayEvent>,
    device_fetched: bool,
    last_events_hash: Option<u64>,
    shared: Arc<Shared>,
}

impl<G: DeviceGateway + 'static> DevicePoller<G> {
    pub fn new(gateway: Arc<G>, config: PollerConfig) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            gateway,
            config,
            inbox_tx,
            inbox,
            device_fetched: false,
            last_events_hash: None,
            shared: Arc::new(Shared {
                state,
                values: Slot::new(),
                events: Slot::new(),
                device: Slot::new(),
                availability: RwLock::new(None),
                callbacks: RwLock::new(Callbacks::default()),
            }),
        }
    }

    pub fn handle(&self) -> PollerHandle {
        PollerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn on_values(&self, callback: impl Fn(String) + Send + Sync + 'static) {
        self.register(Channel::Values, Arc::new(callback));
    }

    pub fn on_events(&self, callback: impl Fn(String) + Send + Sync + 'static) {
        self.register(Channel::Events, Arc::new(callback));
    }

    pub fn on_device(&self, callback: impl Fn(String) + Send + Sync + 'static) {
        self.register(Channel::Device, Arc::new(callback));
    }

    pub fn on_availability(&self, callback: impl Fn(String) + Send + Sync + 'static) {
        self.register(Channel::Availability, Arc::new(callback));
    }

    fn register(&self, channel: Channel, callback: Callback) {
        *self.shared.callbacks.write().slot(channel) = Some(callback);
    }

    /// Invoke the channel's callback, if any, with no lock held.
    fn dispatch(&self, channel: Channel, document: &str) {
        let callback = self.shared.callbacks.read().get(channel);
        if let Some(callback) = callback {
            callback(document.to_string());
        }
    }

    fn dispatch_availability(&self, online: bool) {
        let document = AvailabilityDocument::new(online, chrono::Utc::now().timestamp_millis());
        match serialize(Channel::Availability, &document) {
            Ok(document) => {
                *self.shared.availability.write() = Some(document.clone());
                self.dispatch(Channel::Availability, &document);
            }
            Err(e) => warn!(error = %e, "Availability not dispatched"),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.shared.state.send_replace(state);
        if previous == state {
            return;
        }
        debug!(from = %previous, to = %state, "Connection state changed");

        let was_online = previous == ConnectionState::Connected;
        let online = state == ConnectionState::Connected;
        if was_online != online {
            self.dispatch_availability(online);
        }
    }

    /// Ask the gateway to connect. Lifecycle events arrive in the inbox.
    pub fn start(&self) {
        self.set_state(ConnectionState::Connecting);
        self.gateway.connect(self.inbox_tx.clone());
    }

    /// Apply one gateway lifecycle event.
    pub async fn handle_event(&mut self, event: GatewayEvent) -> Flow {
        if self.state() == ConnectionState::Shutdown {
            return Flow::Continue;
        }

        match event {
            GatewayEvent::Connected => match self.gateway.validate_device().await {
                Ok(()) => {
                    info!("Device connected");
                    self.set_state(ConnectionState::Connected);
                }
                Err(e) if e.is_shutdown() => debug!("Validation skipped, gateway shutting down"),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Device validation failed");
                    return Flow::Stop(e);
                }
                Err(e) => {
                    warn!(error = %e, "Device validation failed, reconnecting");
                    self.set_state(ConnectionState::Disconnected);
                    self.gateway.trigger_reconnect();
                }
            },
            GatewayEvent::Disconnected { delay } => {
                self.device_fetched = false;
                info!(retry_in = ?delay, "Device disconnected");
                self.set_state(ConnectionState::Disconnected);
            }
            GatewayEvent::Error(e) => match e.severity {
                Severity::Shutdown => debug!(error = %e, "Gateway shutting down"),
                Severity::Fatal => {
                    error!(error = %e, "Fatal gateway error");
                    return Flow::Stop(e);
                }
                Severity::Transient => {
                    warn!(error = %e, "Gateway error, reconnecting");
                    self.set_state(ConnectionState::Disconnected);
                    self.request_reconnect();
                }
            },
        }

        Flow::Continue
    }

    /// Apply every event already waiting in the inbox.
    pub async fn process_pending_events(&mut self) -> Flow {
        while let Ok(event) = self.inbox.try_recv() {
            if let Flow::Stop(e) = self.handle_event(event).await {
                return Flow::Stop(e);
            }
        }
        Flow::Continue
    }

    fn request_reconnect(&self) {
        self.gateway.trigger_reconnect();
        self.set_state(ConnectionState::Connecting);
    }

    /// Run one read-aggregate-dispatch cycle. Does nothing unless connected.
    pub async fn tick(&mut self) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        if self.state() != ConnectionState::Connected {
            return outcome;
        }
        outcome.ran = true;

        if !self.device_fetched {
            match self.update_device().await {
                Ok(device) => {
                    self.device_fetched = true;
                    outcome.device_updated = true;
                    self.dispatch(Channel::Device, &device.document);
                }
                Err(e) if e.severity() == Severity::Transient => {
                    warn!(error = %e, "Device info update failed, retrying next tick");
                    outcome.device_error = Some(e);
                }
                Err(e) => self.record_failure(&mut outcome, e),
            }
        }

        match self.update_values().await {
            Ok(values) => {
                outcome.values_updated = true;
                self.dispatch(Channel::Values, &values.document);
            }
            Err(e) => self.record_failure(&mut outcome, e),
        }

        match self.update_events().await {
            Ok(events) => {
                outcome.events_updated = true;
                self.dispatch(Channel::Events, &events.document);
            }
            Err(e) => self.record_failure(&mut outcome, e),
        }

        outcome
    }

    fn record_failure(&self, outcome: &mut TickOutcome, e: UpdateError) {
        if e.severity() == Severity::Shutdown {
            debug!(error = %e, "Update skipped, gateway shutting down");
        } else {
            warn!(error = %e, "Update failed");
        }
        self.set_state(ConnectionState::Disconnected);
        outcome.failures.push(e);
    }

    /// Recovery after a tick: reconnect on transient failures, stop on fatal ones.
    pub fn after_tick(&mut self, outcome: &TickOutcome) -> Flow {
        if let Some(e) = outcome.fatal() {
            error!(error = %e, "Fatal error during update");
            return Flow::Stop(e.clone());
        }

        match outcome.severity() {
            Some(Severity::Transient) => self.request_reconnect(),
            Some(Severity::Shutdown) | Some(Severity::Fatal) | None => {}
        }
        Flow::Continue
    }

    async fn update_device(&self) -> Result<Arc<Committed<DeviceSnapshot>>, UpdateError> {
        let gateway = &*self.gateway;
        gateway.fetch_device_info().await.quantity("device info")?;

        let register_model = if gateway.uses_float_registers().quantity("register model")? {
            RegisterModel::Float
        } else {
            RegisterModel::IntScaleFactor
        };

        let snapshot = DeviceSnapshot {
            manufacturer: gateway.manufacturer().quantity("manufacturer")?,
            model: gateway.model().quantity("model")?,
            serial: gateway.serial_number().quantity("serial number")?,
            firmware: gateway.firmware_version().quantity("firmware version")?,
            inverter_id: gateway.inverter_id().quantity("inverter id")?,
            register_model,
            phases: gateway.phases().quantity("phases")?,
            inputs: gateway.inputs().quantity("inputs")?,
            hybrid: gateway.is_hybrid().quantity("hybrid")?,
            modbus_address: gateway.device_address().quantity("device address")?,
        };

        info!(
            manufacturer = %snapshot.manufacturer,
            model = %snapshot.model,
            serial = %snapshot.serial,
            firmware = %snapshot.firmware,
            "Device identified"
        );
        info!(
            inverter_id = snapshot.inverter_id,
            register_model = snapshot.register_model.as_str(),
            phases = snapshot.phases,
            inputs = snapshot.inputs,
            hybrid = snapshot.hybrid,
            "Device configuration"
        );

        if snapshot.modbus_address != u16::from(self.config.unit_id) {
            warn!(
                configured = self.config.unit_id,
                reported = snapshot.modbus_address,
                "Configured unit id does not match device-reported address"
            );
        }

        let document = serialize(Channel::Device, &DeviceDocument::from(&snapshot))?;
        Ok(self.shared.device.commit(snapshot, document))
    }

    async fn update_values(&self) -> Result<Arc<Committed<ValueSnapshot>>, UpdateError> {
        let gateway = &*self.gateway;
        gateway.fetch_registers().await.quantity("registers")?;

        let time = chrono::Utc::now().timestamp_millis();
        let phase_count = gateway.phases().quantity("phases")?.clamp(1, 3) as usize;
        let input_count = gateway.inputs().quantity("inputs")?.max(1);
        let hybrid = gateway.is_hybrid().quantity("hybrid")?;

        let ac_energy = gateway.ac_energy().quantity("ac_energy")? * 1e-3;
        let ac_power_active = gateway.ac_power_active().quantity("ac_power_active")?;
        let ac_power_apparent = gateway.ac_power_apparent().quantity("ac_power_apparent")?;
        let ac_power_reactive = gateway.ac_power_reactive().quantity("ac_power_reactive")?;
        let ac_power_factor = gateway.ac_power_factor().quantity("ac_power_factor")?;

        let phases = Phase::ALL[..phase_count]
            .iter()
            .map(|&phase| {
                Ok(PhaseValues {
                    ac_voltage: gateway.ac_voltage(phase).quantity("ac_voltage")?,
                    ac_current: gateway.ac_current(phase).quantity("ac_current")?,
                })
            })
            .collect::<Result<Vec<_>, UpdateError>>()?;

        let ac_frequency = gateway.ac_frequency().quantity("ac_frequency")?;
        let dc_power = gateway.dc_power(Input::Total).quantity("dc_power")?;

        let inputs = (0..input_count)
            .map(|module| {
                let input = Input::Module(module);
                let dc_energy = if hybrid {
                    None
                } else {
                    match gateway.dc_energy(input) {
                        Ok(wh) => Some(wh * 1e-3),
                        Err(GatewayError {
                            kind: ErrorKind::NotImplemented(_),
                            ..
                        }) => None,
                        Err(source) => {
                            return Err(UpdateError::Gateway {
                                quantity: "dc_energy",
                                source,
                            });
                        }
                    }
                };

                Ok(InputValues {
                    dc_voltage: gateway.dc_voltage(input).quantity("dc_voltage")?,
                    dc_current: gateway.dc_current(input).quantity("dc_current")?,
                    dc_power: gateway.dc_power(input).quantity("dc_power")?,
                    dc_energy,
                })
            })
            .collect::<Result<Vec<_>, UpdateError>>()?;

        let snapshot = ValueSnapshot {
            time,
            ac_energy,
            ac_power_active,
            ac_power_apparent,
            ac_power_reactive,
            ac_power_factor,
            phases,
            ac_frequency,
            dc_power,
            efficiency: efficiency(ac_power_active, dc_power),
            inputs,
        };

        let document = serialize(Channel::Values, &ValuesDocument::from(&snapshot))?;
        debug!(document = %document, "Values updated");
        Ok(self.shared.values.commit(snapshot, document))
    }

    async fn update_events(&mut self) -> Result<Arc<Committed<EventSnapshot>>, UpdateError> {
        let gateway = &*self.gateway;
        gateway
            .fetch_event_registers()
            .await
            .quantity("event registers")?;

        let snapshot = EventSnapshot {
            active_code: gateway.active_state_code().quantity("active state code")?,
            state: gateway.state().quantity("state")?,
            events: gateway.events().quantity("events")?,
        };

        let hash = events_hash(&snapshot.events);
        if self.last_events_hash != Some(hash) {
            info!(
                state = %snapshot.state,
                active_code = snapshot.active_code,
                events = ?snapshot.events,
                "Device events changed"
            );
            self.last_events_hash = Some(hash);
        }

        let document = serialize(Channel::Events, &EventsDocument::from(&snapshot))?;
        Ok(self.shared.events.commit(snapshot, document))
    }

    /// Enter the terminal state and stop the gateway.
    async fn finish(&mut self) {
        let was_online = self.state() == ConnectionState::Connected;
        self.set_state(ConnectionState::Shutdown);
        if !was_online {
            self.dispatch_availability(false);
        }
        self.gateway.shutdown().await;
        info!("Poller stopped");
    }

    /// Connect and poll until shutdown or a fatal error.
    ///
    /// On exit the poller is in [`ConnectionState::Shutdown`], a final
    /// "offline" availability document has been dispatched and the gateway
    /// has been shut down.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), PollerError> {
        let span = tracing::info_span!("poller", device = %self.config.device_name);

        async move {
            info!(
                interval_secs = self.config.update_interval.as_secs_f64(),
                "Starting poller"
            );
            self.start();
            let result = self.run_loop(&mut shutdown).await;
            self.finish().await;
            result
        }
        .instrument(span)
        .await
    }

    async fn run_loop(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), PollerError> {
        enum Wake {
            Shutdown,
            Event(GatewayEvent),
            Tick,
        }

        let interval = self.config.update_interval;
        let mut deadline = Instant::now() + interval;

        loop {
            let wake = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => Wake::Shutdown,
                event = self.inbox.recv() => match event {
                    Some(event) => Wake::Event(event),
                    None => Wake::Shutdown,
                },
                _ = tokio::time::sleep_until(deadline) => Wake::Tick,
            };

            match wake {
                Wake::Shutdown => return Ok(()),
                Wake::Event(event) => {
                    if let Flow::Stop(e) = self.handle_event(event).await {
                        return Err(PollerError::Fatal(e));
                    }
                }
                Wake::Tick => {
                    let outcome = self.tick().await;
                    if let Flow::Stop(e) = self.after_tick(&outcome) {
                        return Err(PollerError::Fatal(e));
                    }

                    deadline += interval;
                    let now = Instant::now();
                    if deadline <= now {
                        deadline = now + interval;
                    }
                }
            }
        }
    }
}

fn events_hash(events: &[String]) -> u64 {
    let mut sorted: Vec<&String> = events.iter().collect();
    sorted.sort();
    let mut hasher = DefaultHasher::new();
    sorted.hash(&mut hasher);
    hasher.finish()
}
