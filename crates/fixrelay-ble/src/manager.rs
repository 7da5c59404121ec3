//! Connection manager.
//!
//! Owns the device registry and the adapter event stream. Device I/O runs in
//! per-device tasks (see [`crate::session`]) that report state changes back
//! over a channel, so the registry has a single owner. Adapter disconnect
//! events are passed to the device task as well and come back through the
//! same channel, after the task's earlier reports.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use fixrelay_core::{
    normalize_address, ConnectionState, DeviceEvent, DeviceKind, DeviceRegistry, Discovery,
};
use fixrelay_outbox::Outbox;

use crate::session::{DeviceTask, SessionReport};
use crate::BleError;

const REPORT_CHANNEL_CAPACITY: usize = 64;

/// Discovers allow-listed peripherals and runs a session per device.
pub struct ConnectionManager<O: Outbox> {
    adapter: Adapter,
    devices: DeviceTable,
    outbox: Arc<O>,
    fix_quality_threshold: u8,
    /// Peripherals we have issued a connect to, by address.
    peripherals: HashMap<String, Peripheral>,
    addresses: HashMap<PeripheralId, String>,
    tasks: JoinSet<()>,
}

impl<O: Outbox> ConnectionManager<O> {
    /// Open the Bluetooth adapter at `adapter_index`.
    pub async fn new(
        adapter_index: usize,
        allow_list: &BTreeMap<String, DeviceKind>,
        fix_quality_threshold: u8,
        outbox: Arc<O>,
    ) -> Result<Self, BleError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .nth(adapter_index)
            .ok_or(BleError::NoAdapter(adapter_index))?;
        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        Ok(Self {
            adapter,
            devices: DeviceTable::new(allow_list),
            outbox,
            fix_quality_threshold,
            peripherals: HashMap::new(),
            addresses: HashMap::new(),
            tasks: JoinSet::new(),
        })
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.devices.registry
    }

    /// Scan and manage devices until `shutdown` changes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), BleError> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!("Scanning for devices");

        let (report_tx, mut report_rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(event) = events.next() => self.handle_event(event, &report_tx).await,
                Some(report) = report_rx.recv() => self.devices.apply(&report),
                Some(joined) = self.tasks.join_next() => {
                    if let Err(e) = joined {
                        error!("Device task failed: {}", e);
                    }
                }
                else => break,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn handle_event(&mut self, event: CentralEvent, reports: &mpsc::Sender<SessionReport>) {
        match event {
            CentralEvent::DeviceDiscovered(id) => {
                let peripheral = match self.adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral,
                    Err(e) => {
                        warn!("Discovered peripheral unavailable: {}", e);
                        return;
                    }
                };
                let address = normalize_address(&peripheral.address().to_string());
                let Some((kind, link_lost)) = self.devices.admit(&address) else {
                    return;
                };
                self.addresses.insert(id, address.clone());
                self.peripherals.insert(address.clone(), peripheral.clone());
                let task = DeviceTask {
                    address,
                    kind,
                    peripheral,
                    outbox: self.outbox.clone(),
                    fix_quality_threshold: self.fix_quality_threshold,
                    reports: reports.clone(),
                    link_lost,
                };
                self.tasks.spawn(task.run());
            }
            CentralEvent::DeviceDisconnected(id) => {
                if let Some(address) = self.addresses.get(&id) {
                    self.devices.link_lost(address);
                }
            }
            _ => {}
        }
    }

    /// Stop discovery and drop every link.
    async fn shutdown(&mut self) {
        info!("Stopping BLE ingestion");
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        for address in self.devices.registry.live_addresses() {
            let Some(peripheral) = self.peripherals.get(&address) else {
                continue;
            };
            match peripheral.disconnect().await {
                Ok(()) => info!("Disconnected [{}]", address),
                Err(e) => warn!("Failed to disconnect [{}]: {}", address, e),
            }
            self.devices.apply(&SessionReport {
                address,
                event: DeviceEvent::LinkLost,
            });
        }

        self.tasks.shutdown().await;
    }
}

/// Device registry plus the link-loss signal of each device task.
#[derive(Debug)]
struct DeviceTable {
    registry: DeviceRegistry,
    links: HashMap<String, Arc<Notify>>,
}

impl DeviceTable {
    fn new(allow_list: &BTreeMap<String, DeviceKind>) -> Self {
        Self {
            registry: DeviceRegistry::new(allow_list),
            links: HashMap::new(),
        }
    }

    /// Register a discovery. Returns the device kind and its link signal if
    /// a task should be started.
    fn admit(&mut self, address: &str) -> Option<(DeviceKind, Arc<Notify>)> {
        match self.registry.discover(address) {
            Discovery::Connect(kind) => {
                let link = Arc::new(Notify::new());
                self.links.insert(address.to_string(), link.clone());
                Some((kind, link))
            }
            Discovery::AlreadyKnown(state) => {
                trace!("Discovered [{}] again while {}", address, state);
                None
            }
            Discovery::Unknown => {
                trace!("Ignoring [{}]", address);
                None
            }
        }
    }

    /// Tell the device task its link dropped. The signal is kept if the task
    /// is not listening yet.
    fn link_lost(&self, address: &str) {
        match self.links.get(address) {
            Some(link) => link.notify_one(),
            None => trace!("Disconnect for [{}] without a task", address),
        }
    }

    fn apply(&mut self, report: &SessionReport) {
        match self.registry.apply(&report.address, report.event) {
            Ok(state) => {
                debug!("[{}] {:?} -> {}", report.address, report.event, state);
                match state {
                    ConnectionState::Ready => info!("Device [{}] ready", report.address),
                    ConnectionState::Discovered | ConnectionState::Disconnected => {
                        self.links.remove(&report.address);
                    }
                    _ => {}
                }
            }
            Err(e) => warn!("{}", e),
        }
    }
}
