//! SunSpec gateway over Modbus TCP or RTU.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_modbus::client::{Context, Reader};
use tokio_modbus::prelude::*;
use tracing::{Instrument, debug, info, warn};

use solarsight_bridge_framework::{is_shutdown, wait_for_shutdown};

use crate::config::{ConnectionConfig, DeviceConfig, ReconnectConfig};
use crate::gateway::sunspec::{
    self, CommonModel, DcPoint, END_MODEL, InverterBlock, InverterLayout, MAX_MODELS, MAX_READ,
    ModelHeader, ModelMap, MpptBlock,
};
use crate::gateway::{
    DeviceGateway, ErrorKind, EventSender, GatewayError, GatewayEvent, GatewayResult, Input,
    Phase,
};

/// Reconnect delay schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    exponential: bool,
    current: Duration,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        let min = Duration::from_secs(config.min_secs);
        Self {
            min,
            max: Duration::from_secs(config.max_secs).max(min),
            exponential: config.exponential,
            current: min,
        }
    }

    /// Delay before the next attempt; doubles up to the maximum when exponential.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        if self.exponential {
            self.current = (self.current * 2).min(self.max);
        }
        delay
    }

    /// Start over from the minimum delay.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

#[derive(Debug, Default)]
struct RegisterCache {
    common: Option<CommonModel>,
    inverter: Option<InverterBlock>,
    mppt: Option<MpptBlock>,
}

struct Inner {
    device: DeviceConfig,
    link: tokio::sync::Mutex<Option<Context>>,
    models: RwLock<Option<ModelMap>>,
    cache: RwLock<RegisterCache>,
    reconnect: Notify,
    shutdown: watch::Sender<bool>,
}

/// [`DeviceGateway`] reading a SunSpec register map through tokio-modbus.
///
/// `connect` spawns a supervisor task that opens the link, reports
/// [`GatewayEvent::Connected`], and waits for a reconnect request or shutdown.
/// Failed attempts and dropped links are followed by
/// [`GatewayEvent::Disconnected`] carrying the backoff delay.
pub struct ModbusGateway {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ModbusGateway {
    pub fn new(device: DeviceConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                device,
                link: tokio::sync::Mutex::new(None),
                models: RwLock::new(None),
                cache: RwLock::new(RegisterCache::default()),
                reconnect: Notify::new(),
                shutdown,
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Device configuration this gateway was built from.
    pub fn device(&self) -> &DeviceConfig {
        &self.inner.device
    }

    fn check_running(&self) -> GatewayResult<()> {
        if *self.inner.shutdown.borrow() {
            return Err(GatewayError::shutdown());
        }
        Ok(())
    }

    fn models(&self) -> GatewayResult<ModelMap> {
        self.check_running()?;
        self.inner
            .models
            .read()
            .clone()
            .ok_or_else(|| GatewayError::transient(ErrorKind::NotFetched("model chain")))
    }

    fn with_inverter<T>(
        &self,
        point: &'static str,
        f: impl FnOnce(&InverterBlock) -> GatewayResult<T>,
    ) -> GatewayResult<T> {
        self.check_running()?;
        let cache = self.inner.cache.read();
        let block = cache
            .inverter
            .as_ref()
            .ok_or_else(|| GatewayError::transient(ErrorKind::NotFetched(point)))?;
        f(block)
    }

    fn with_common<T>(
        &self,
        point: &'static str,
        f: impl FnOnce(&CommonModel) -> T,
    ) -> GatewayResult<T> {
        self.check_running()?;
        let cache = self.inner.cache.read();
        let common = cache
            .common
            .as_ref()
            .ok_or_else(|| GatewayError::transient(ErrorKind::NotFetched(point)))?;
        Ok(f(common))
    }

    fn dc(&self, point: &'static str, input: Input, dc: DcPoint) -> GatewayResult<f64> {
        self.check_running()?;
        let cache = self.inner.cache.read();
        let inverter = cache
            .inverter
            .as_ref()
            .ok_or_else(|| GatewayError::transient(ErrorKind::NotFetched(point)))?;
        sunspec::dc_point(inverter, cache.mppt.as_ref(), input, dc)
    }

    async fn read_model(&self, header: ModelHeader) -> GatewayResult<Vec<u16>> {
        self.inner.read(header.address, header.length).await
    }

    async fn fetch_mppt(&self, models: &ModelMap) -> GatewayResult<()> {
        let mppt = match models.mppt() {
            Some(header) => Some(MpptBlock::new(self.read_model(header).await?)?),
            None => None,
        };
        self.inner.cache.write().mppt = mppt;
        Ok(())
    }

    async fn fetch_inverter(&self, models: &ModelMap) -> GatewayResult<()> {
        let header = models.inverter()?;
        let block = InverterBlock::new(header.id, self.read_model(header).await?)?;
        self.inner.cache.write().inverter = Some(block);
        Ok(())
    }
}

impl Inner {
    fn slave(&self) -> Slave {
        Slave(self.device.unit_id)
    }

    /// Open a new Modbus context.
    async fn open(&self) -> GatewayResult<Context> {
        let timeout = self.device.timeout();

        match &self.device.connection {
            ConnectionConfig::Tcp { host, port } => {
                let stream =
                    tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host.as_str(), *port)))
                        .await
                        .map_err(|_| {
                            GatewayError::transient(ErrorKind::Connection(
                                "connection timeout".to_string(),
                            ))
                        })?
                        .map_err(|e| {
                            if e.kind() == std::io::ErrorKind::InvalidInput {
                                GatewayError::fatal(ErrorKind::InvalidAddress(format!(
                                    "{}:{}: {}",
                                    host, port, e
                                )))
                            } else {
                                GatewayError::transient(ErrorKind::Connection(e.to_string()))
                            }
                        })?;

                Ok(tcp::attach_slave(stream, self.slave()))
            }
            ConnectionConfig::Rtu {
                port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => {
                let parity = match parity.to_lowercase().as_str() {
                    "even" => tokio_serial::Parity::Even,
                    "odd" => tokio_serial::Parity::Odd,
                    _ => tokio_serial::Parity::None,
                };

                let stop_bits = match stop_bits {
                    2 => tokio_serial::StopBits::Two,
                    _ => tokio_serial::StopBits::One,
                };

                let data_bits = match data_bits {
                    5 => tokio_serial::DataBits::Five,
                    6 => tokio_serial::DataBits::Six,
                    7 => tokio_serial::DataBits::Seven,
                    _ => tokio_serial::DataBits::Eight,
                };

                let builder = tokio_serial::new(port, *baud_rate)
                    .parity(parity)
                    .stop_bits(stop_bits)
                    .data_bits(data_bits)
                    .timeout(timeout);

                let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                    GatewayError::fatal(ErrorKind::Connection(format!(
                        "serial open failed on {}: {}",
                        port, e
                    )))
                })?;

                Ok(rtu::attach_slave(serial, self.slave()))
            }
        }
    }

    /// Read `count` holding registers, split into protocol-sized requests.
    async fn read(&self, address: u16, count: u16) -> GatewayResult<Vec<u16>> {
        if *self.shutdown.borrow() {
            return Err(GatewayError::shutdown());
        }

        let timeout = self.device.timeout();
        let mut link = self.link.lock().await;
        let ctx = link
            .as_mut()
            .ok_or_else(|| GatewayError::transient(ErrorKind::NotConnected))?;

        let mut registers = Vec::with_capacity(count as usize);
        let mut offset = 0u16;
        while offset < count {
            let chunk = (count - offset).min(MAX_READ);
            let start = address.checked_add(offset).ok_or_else(|| {
                GatewayError::transient(ErrorKind::OutOfRange(format!(
                    "register {} + {}",
                    address, offset
                )))
            })?;

            let values = tokio::time::timeout(timeout, ctx.read_holding_registers(start, chunk))
                .await
                .map_err(|_| GatewayError::transient(ErrorKind::Timeout(timeout)))?
                .map_err(|e| {
                    GatewayError::transient(ErrorKind::Read {
                        address: start,
                        count: chunk,
                        message: e.to_string(),
                    })
                })?
                .map_err(|code| {
                    GatewayError::transient(ErrorKind::Exception {
                        address: start,
                        code: format!("{:?}", code),
                    })
                })?;

            if values.len() != chunk as usize {
                return Err(GatewayError::transient(ErrorKind::Read {
                    address: start,
                    count: chunk,
                    message: format!("device returned {} registers", values.len()),
                }));
            }

            registers.extend(values);
            offset += chunk;
        }

        Ok(registers)
    }

    async fn close_link(&self) {
        if self.link.lock().await.take().is_some() {
            debug!("Modbus link closed");
        }
    }

    /// Connection supervisor: connect, wait for a reconnect request, repeat.
    async fn supervise(self: Arc<Self>, events: EventSender) {
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff = Backoff::new(&self.device.reconnect);

        loop {
            if is_shutdown(&shutdown) {
                break;
            }

            match self.open().await {
                Ok(ctx) => {
                    *self.link.lock().await = Some(ctx);
                    backoff.reset();
                    info!(connection = %self.device.connection, "Modbus link established");
                    let _ = events.send(GatewayEvent::Connected);

                    tokio::select! {
                        biased;
                        _ = wait_for_shutdown(&mut shutdown) => break,
                        _ = self.reconnect.notified() => {
                            debug!("Reconnect requested");
                        }
                    }
                    self.close_link().await;
                }
                Err(e) if e.is_fatal() => {
                    let _ = events.send(GatewayEvent::Error(e));
                    break;
                }
                Err(e) => {
                    warn!(connection = %self.device.connection, error = %e, "Connection attempt failed");
                }
            }

            let delay = backoff.next_delay();
            let _ = events.send(GatewayEvent::Disconnected { delay });

            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.close_link().await;
        debug!("Modbus supervisor stopped");
    }
}

#[async_trait]
impl DeviceGateway for ModbusGateway {
    fn connect(&self, events: EventSender) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        if *self.inner.shutdown.borrow() {
            let _ = events.send(GatewayEvent::Error(GatewayError::shutdown()));
            return;
        }

        let span = tracing::info_span!("modbus", unit_id = self.inner.device.unit_id);
        let inner = Arc::clone(&self.inner);
        *supervisor = Some(tokio::spawn(inner.supervise(events).instrument(span)));
    }

    fn trigger_reconnect(&self) {
        self.inner.reconnect.notify_one();
    }

    async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let task = self.supervisor.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Modbus supervisor failed");
            }
        }
        self.inner.close_link().await;
    }

    async fn validate_device(&self) -> GatewayResult<()> {
        let base = self.inner.device.base_address;
        let marker = self.inner.read(base, 2).await?;
        if !sunspec::is_sunspec_marker(&marker) {
            return Err(GatewayError::transient(ErrorKind::InvalidDevice(format!(
                "SunS marker not found at {}",
                base
            ))));
        }

        let mut models = Vec::new();
        let mut address = base as u32 + 2;
        loop {
            if models.len() >= MAX_MODELS {
                return Err(GatewayError::transient(ErrorKind::InvalidDevice(format!(
                    "no end marker after {} models",
                    MAX_MODELS
                ))));
            }

            let header_address = u16::try_from(address)
                .ok()
                .filter(|a| *a <= u16::MAX - 2)
                .ok_or_else(|| {
                    GatewayError::transient(ErrorKind::InvalidDevice(
                        "model chain runs past the register space".to_string(),
                    ))
                })?;

            let header = self.inner.read(header_address, 2).await?;
            let (id, length) = (header[0], header[1]);
            if id == END_MODEL {
                break;
            }

            let model = ModelHeader {
                id,
                address: header_address + 2,
                length,
            };
            debug!(model = id, address = model.address, length, "Found SunSpec model");
            address = model.next_address();
            models.push(model);
        }

        let map = ModelMap::new(models);
        map.validate()?;

        *self.inner.cache.write() = RegisterCache::default();
        *self.inner.models.write() = Some(map);
        Ok(())
    }

    async fn fetch_device_info(&self) -> GatewayResult<()> {
        let models = self.models()?;
        let common = CommonModel::decode(&self.read_model(models.common()?).await?)?;
        self.inner.cache.write().common = Some(common);
        self.fetch_mppt(&models).await
    }

    async fn fetch_registers(&self) -> GatewayResult<()> {
        let models = self.models()?;
        self.fetch_inverter(&models).await?;
        self.fetch_mppt(&models).await
    }

    async fn fetch_event_registers(&self) -> GatewayResult<()> {
        let models = self.models()?;
        self.fetch_inverter(&models).await
    }

    fn ac_energy(&self) -> GatewayResult<f64> {
        self.with_inverter("ac_energy", InverterBlock::ac_energy)
    }

    fn ac_power_active(&self) -> GatewayResult<f64> {
        self.with_inverter("ac_power_active", InverterBlock::ac_power_active)
    }

    fn ac_power_apparent(&self) -> GatewayResult<f64> {
        self.with_inverter("ac_power_apparent", InverterBlock::ac_power_apparent)
    }

    fn ac_power_reactive(&self) -> GatewayResult<f64> {
        self.with_inverter("ac_power_reactive", InverterBlock::ac_power_reactive)
    }

    fn ac_power_factor(&self) -> GatewayResult<f64> {
        self.with_inverter("ac_power_factor", InverterBlock::ac_power_factor)
    }

    fn ac_voltage(&self, phase: Phase) -> GatewayResult<f64> {
        self.with_inverter("ac_voltage", |b| b.ac_voltage(phase))
    }

    fn ac_current(&self, phase: Phase) -> GatewayResult<f64> {
        self.with_inverter("ac_current", |b| b.ac_current(phase))
    }

    fn ac_frequency(&self) -> GatewayResult<f64> {
        self.with_inverter("ac_frequency", InverterBlock::ac_frequency)
    }

    fn dc_power(&self, input: Input) -> GatewayResult<f64> {
        self.dc("dc_power", input, DcPoint::Power)
    }

    fn dc_voltage(&self, input: Input) -> GatewayResult<f64> {
        self.dc("dc_voltage", input, DcPoint::Voltage)
    }

    fn dc_current(&self, input: Input) -> GatewayResult<f64> {
        self.dc("dc_current", input, DcPoint::Current)
    }

    fn dc_energy(&self, input: Input) -> GatewayResult<f64> {
        self.dc("dc_energy", input, DcPoint::Energy)
    }

    fn active_state_code(&self) -> GatewayResult<u16> {
        self.with_inverter("active_code", InverterBlock::active_state_code)
    }

    fn state(&self) -> GatewayResult<String> {
        self.with_inverter("state", |b| {
            b.operating_state()
                .map(|code| sunspec::state_name(code).to_string())
        })
    }

    fn events(&self) -> GatewayResult<Vec<String>> {
        self.with_inverter("events", |b| b.event_bits().map(sunspec::event_names))
    }

    fn manufacturer(&self) -> GatewayResult<String> {
        self.with_common("manufacturer", |c| c.manufacturer.clone())
    }

    fn model(&self) -> GatewayResult<String> {
        self.with_common("model", |c| c.model.clone())
    }

    fn serial_number(&self) -> GatewayResult<String> {
        self.with_common("serial", |c| c.serial.clone())
    }

    fn firmware_version(&self) -> GatewayResult<String> {
        self.with_common("firmware", |c| c.version.clone())
    }

    fn device_address(&self) -> GatewayResult<u16> {
        self.with_common("modbus_address", |c| c.device_address)
    }

    fn inverter_id(&self) -> GatewayResult<u16> {
        Ok(self.models()?.inverter()?.id)
    }

    fn phases(&self) -> GatewayResult<u8> {
        Ok(sunspec::phases_for_model(self.inverter_id()?))
    }

    fn inputs(&self) -> GatewayResult<u8> {
        if self.models()?.mppt().is_none() {
            return Ok(1);
        }
        let cache = self.inner.cache.read();
        let mppt = cache
            .mppt
            .as_ref()
            .ok_or_else(|| GatewayError::transient(ErrorKind::NotFetched("inputs")))?;
        Ok(mppt.module_count().max(1))
    }

    fn is_hybrid(&self) -> GatewayResult<bool> {
        Ok(self.models()?.is_hybrid())
    }

    fn uses_float_registers(&self) -> GatewayResult<bool> {
        let id = self.inverter_id()?;
        Ok(InverterLayout::for_model(id) == Some(InverterLayout::Float))
    }
}
