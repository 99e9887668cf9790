//! Controller façade (C6): composes the wire codec, gateway adapter,
//! registry, dispatcher, and OTA engine behind one caller-facing API.

use crate::config::{AdapterKind, ControllerSettings};
use crate::dispatcher::{DispatchError, Dispatcher, ResetLocation};
use crate::monitor::{EventLogRecord, Monitor};
use crate::ota::{OtaAckRouter, OtaEngine, OtaError, StartOtaData, TransferResult};
use crate::registry::{DeviceSnapshot, Registry};
use crate::transport::{CloudGatewayAdapter, GatewayAdapter, SerialGatewayAdapter, TransportError};
use crate::wire::Payload;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("adapter failed to initialize: {0}")]
    Fatal(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Ota(#[from] OtaError),
}

impl From<TransportError> for ControllerError {
    fn from(value: TransportError) -> Self {
        ControllerError::Fatal(value.to_string())
    }
}

fn build_adapter(settings: &ControllerSettings) -> Result<Box<dyn GatewayAdapter>, ControllerError> {
    match settings.adapter {
        AdapterKind::Edge => {
            let port = settings
                .serial_port
                .as_deref()
                .ok_or_else(|| ControllerError::InvalidArgument("serial_port is required for the edge adapter".into()))?;
            let adapter = SerialGatewayAdapter::open(port, settings.serial_baudrate)?;
            Ok(Box::new(adapter))
        }
        AdapterKind::Cloud => {
            let host = settings
                .mqtt_host
                .as_deref()
                .ok_or_else(|| ControllerError::InvalidArgument("mqtt_host is required for the cloud adapter".into()))?;
            let addr = (host, settings.mqtt_port);
            let adapter = CloudGatewayAdapter::connect(addr, settings.network_id, settings.mqtt_use_tls)?;
            Ok(Box::new(adapter))
        }
    }
}

/// Owns one registry, one adapter instance, and (transiently) one OTA
/// session's worth of state; the only caller surface for the CLI/HTTP front
/// ends.
pub struct Controller {
    registry: Arc<Registry>,
    adapter: Arc<dyn GatewayAdapter>,
    dispatcher: Dispatcher,
    ota: OtaEngine,
    monitor: Monitor,
    device_subset: Option<Vec<u32>>,
    terminated: Arc<AtomicBool>,
}

impl Controller {
    /// Build the concrete adapter from `settings` and wire up the controller.
    pub fn new(settings: &ControllerSettings) -> Result<Self, ControllerError> {
        let adapter = build_adapter(settings)?;
        Self::with_adapter(adapter, settings)
    }

    /// Wire up the controller around an already-constructed (but not yet
    /// initialized) adapter. Exposed so tests can supply an in-memory mock
    /// adapter in place of a real transport.
    pub fn with_adapter(
        mut adapter: Box<dyn GatewayAdapter>,
        settings: &ControllerSettings,
    ) -> Result<Self, ControllerError> {
        let registry = Registry::new(settings.inactive_timeout());
        let ack_router = Arc::new(OtaAckRouter::new());
        let (event_tx, monitor) = Monitor::channel();

        let registry_clone = registry.clone();
        let ack_router_clone = ack_router.clone();
        adapter
            .init(Box::new(move |frame| {
                match frame.payload {
                    Payload::Status {
                        device,
                        status,
                        battery_mv,
                        pos_x,
                        pos_y,
                    } => registry_clone.observe_status(
                        frame.source,
                        device,
                        status,
                        battery_mv,
                        pos_x,
                        pos_y,
                    ),
                    Payload::EventLog {
                        timestamp, data, ..
                    } => {
                        registry_clone.observe_event_log_traffic(frame.source);
                        let record = EventLogRecord::new(frame.source, timestamp, &data);
                        let _ = event_tx.send(record);
                    }
                    Payload::OtaStartAck => ack_router_clone.record_start_ack(frame.source),
                    Payload::OtaChunkAck { index } => {
                        ack_router_clone.record_chunk_ack(frame.source, index)
                    }
                    _ => {}
                }
            }))
            .map_err(|e| ControllerError::Fatal(e.to_string()))?;

        let adapter: Arc<dyn GatewayAdapter> = Arc::from(adapter);

        // Allow initial STATUS frames to arrive before any command is issued.
        thread::sleep(settings.adapter_wait_timeout());

        let dispatcher = Dispatcher::new(registry.clone(), adapter.clone());
        let ota = OtaEngine::new(
            registry.clone(),
            adapter.clone(),
            ack_router,
            settings.ota_timeout(),
            settings.ota_max_retries,
        );
        let device_subset = settings
            .device_addresses()
            .map_err(|e| ControllerError::InvalidArgument(e.to_string()))?;

        Ok(Self {
            registry,
            adapter,
            dispatcher,
            ota,
            monitor,
            device_subset,
            terminated: Arc::new(AtomicBool::new(false)),
        })
    }

    fn devices_arg(&self) -> Option<&[u32]> {
        self.device_subset.as_deref()
    }

    pub fn start(&self, timeout: Option<Duration>) -> Result<Vec<u32>, ControllerError> {
        Ok(self.dispatcher.start(self.devices_arg(), timeout)?)
    }

    pub fn stop(&self, timeout: Option<Duration>) -> Result<Vec<u32>, ControllerError> {
        Ok(self.dispatcher.stop(self.devices_arg(), timeout)?)
    }

    pub fn reset(
        &self,
        locations: &HashMap<u32, ResetLocation>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u32>, ControllerError> {
        let subset = self.device_subset.clone().unwrap_or_else(|| {
            let mut keys: Vec<u32> = locations.keys().copied().collect();
            keys.sort_unstable();
            keys
        });
        Ok(self.dispatcher.reset(locations, &subset, timeout)?)
    }

    pub fn send_message(&self, text: &str) -> Result<(), ControllerError> {
        Ok(self.dispatcher.send_message(text, self.devices_arg())?)
    }

    pub fn start_ota(&self, firmware: &[u8]) -> Result<StartOtaData, ControllerError> {
        Ok(self.ota.start_ota(firmware, self.devices_arg())?)
    }

    pub fn transfer(
        &self,
        firmware: &[u8],
        acked: &[u32],
    ) -> Result<HashMap<u32, TransferResult>, ControllerError> {
        Ok(self.ota.transfer(firmware, acked)?)
    }

    /// Snapshot of the full registry, in canonical-hex sort order.
    pub fn status_snapshot(&self) -> Vec<DeviceSnapshot> {
        self.registry.all_snapshots()
    }

    pub fn ready_devices(&self) -> Vec<u32> {
        self.registry.ready_devices()
    }

    pub fn running_devices(&self) -> Vec<u32> {
        self.registry.running_devices()
    }

    pub fn resetting_devices(&self) -> Vec<u32> {
        self.registry.resetting_devices()
    }

    /// Print a table snapshot of the registry; if `watch`, refresh every
    /// second until `timeout` elapses (or forever if `timeout` is `None`)
    /// or `terminate()` is called.
    pub fn status(&self, watch: bool, timeout: Option<Duration>) {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            print_status_table(&self.status_snapshot());
            if !watch || self.terminated.load(Ordering::Relaxed) {
                return;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return;
                }
            }
            thread::sleep(Duration::from_secs(1));
        }
    }

    /// Drain and log EVENT_LOG records until cancelled or `timeout` elapses.
    pub fn monitor(&self, run_forever: bool, timeout: Option<Duration>) {
        self.monitor
            .run(&self.terminated, run_forever, timeout.unwrap_or(Duration::from_secs(0)));
    }

    /// Close the adapter and stop background sweeps. Idempotent.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Relaxed);
        self.adapter.close();
        self.registry.stop_sweep();
    }
}

fn print_status_table(snapshots: &[DeviceSnapshot]) {
    println!("{:<10} {:<12} {:<10} {:>8} {:>8} {:>8}", "ADDRESS", "DEVICE", "STATUS", "BATT_MV", "POS_X", "POS_Y");
    for snapshot in snapshots {
        println!(
            "{:<10} {:<12} {:<10} {:>8} {:>8} {:>8}",
            snapshot.address_hex(),
            format!("{:?}", snapshot.device_type),
            format!("{:?}", snapshot.status),
            snapshot.battery_mv,
            snapshot.pos_x,
            snapshot.pos_y,
        );
    }
}
