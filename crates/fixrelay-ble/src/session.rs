//! Per-device BLE task.
//!
//! One task per connected device: connect, enumerate services, enable
//! notifications on the data channel and feed every notification through the
//! device's session. Each step is reported back to the manager as a
//! [`DeviceEvent`].

use std::collections::BTreeSet;
use std::sync::Arc;

use btleplug::api::{Characteristic, Peripheral as _};
use btleplug::platform::Peripheral;
use futures::StreamExt;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use fixrelay_core::session::{data_channel, DataChannel};
use fixrelay_core::{DeviceEvent, DeviceKind, DeviceSession, SessionHandler};
use fixrelay_outbox::Outbox;

use crate::BleError;

/// A state change observed by a device task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub address: String,
    pub event: DeviceEvent,
}

/// Everything a device task needs.
pub struct DeviceTask<O: Outbox> {
    pub address: String,
    pub kind: DeviceKind,
    pub peripheral: Peripheral,
    pub outbox: Arc<O>,
    pub fix_quality_threshold: u8,
    pub reports: mpsc::Sender<SessionReport>,
    /// Signalled by the manager when the adapter reports the link gone.
    pub link_lost: Arc<Notify>,
}

impl<O: Outbox> DeviceTask<O> {
    async fn report(&self, event: DeviceEvent) {
        let report = SessionReport {
            address: self.address.clone(),
            event,
        };
        if self.reports.send(report).await.is_err() {
            debug!("Manager gone, dropping {:?} for [{}]", event, self.address);
        }
    }

    /// Drive the device from `Connecting` until its link goes away.
    pub async fn run(self) {
        info!("Connecting to {} device [{}]", self.kind, self.address);
        if let Err(e) = self.peripheral.connect().await {
            warn!("Connect to [{}] failed: {}", self.address, e);
            self.report(DeviceEvent::ConnectFailed).await;
            return;
        }
        info!("Connected [{}]", self.address);
        self.report(DeviceEvent::ConnectSucceeded).await;
        self.report(DeviceEvent::ResolveStarted).await;

        let mut session = DeviceSession::for_kind(self.kind, self.fix_quality_threshold);
        let channel = match self.resolve().await {
            Ok(channel) => channel,
            Err(e) => {
                error!("Cannot enable data channel on [{}]: {}", self.address, e);
                if let Err(e) = self.peripheral.disconnect().await {
                    debug!("Disconnect [{}] failed: {}", self.address, e);
                }
                self.report(DeviceEvent::ResolveFailed).await;
                return;
            }
        };
        self.report(DeviceEvent::ServicesResolved).await;
        session.on_ready(&self.address);

        match channel {
            Some(channel) => {
                if let Err(e) = self.stream(channel, &mut session).await {
                    warn!("Notification stream for [{}] failed: {}", self.address, e);
                }
            }
            // No data channel: the device stays ready until the link drops.
            None => self.link_lost.notified().await,
        }
        info!("Link to [{}] lost", self.address);
        self.report(DeviceEvent::LinkLost).await;
    }

    /// Enumerate services and subscribe to the data characteristic, if the
    /// device type has one.
    async fn resolve(&self) -> Result<Option<DataChannel>, BleError> {
        self.peripheral.discover_services().await?;
        for service in self.peripheral.services() {
            info!("[{}] service {}", self.address, service.uuid);
            for characteristic in &service.characteristics {
                debug!(
                    "[{}]   characteristic {} {:?}",
                    self.address, characteristic.uuid, characteristic.properties
                );
            }
        }

        let Some(channel) = data_channel(self.kind) else {
            return Ok(None);
        };
        let characteristic = find_data_characteristic(&self.peripheral.characteristics(), channel)?;
        self.peripheral.subscribe(&characteristic).await?;
        debug!("Notifications enabled on {} [{}]", channel.characteristic, self.address);
        Ok(Some(channel))
    }

    /// Feed notifications into the session until the stream ends or the
    /// link drops.
    async fn stream(&self, channel: DataChannel, session: &mut DeviceSession) -> Result<(), BleError> {
        let mut notifications = self.peripheral.notifications().await?;
        loop {
            let notification = tokio::select! {
                _ = self.link_lost.notified() => break,
                next = notifications.next() => match next {
                    Some(notification) => notification,
                    None => break,
                },
            };
            if notification.uuid != channel.characteristic {
                continue;
            }
            for fix in session.on_notification(&notification.value) {
                match self.outbox.enqueue(&fix).await {
                    Ok(entry) => debug!("Fix {} from [{}] queued", entry.key, self.address),
                    Err(e) => error!("Failed to queue fix from [{}]: {}", self.address, e),
                }
            }
        }
        Ok(())
    }
}

/// Locate the data characteristic within its service.
pub fn find_data_characteristic(
    characteristics: &BTreeSet<Characteristic>,
    channel: DataChannel,
) -> Result<Characteristic, BleError> {
    if !characteristics
        .iter()
        .any(|c| c.service_uuid == channel.service)
    {
        return Err(BleError::ServiceNotFound(channel.service));
    }
    characteristics
        .iter()
        .find(|c| c.service_uuid == channel.service && c.uuid == channel.characteristic)
        .cloned()
        .ok_or(BleError::CharacteristicNotFound {
            service: channel.service,
            characteristic: channel.characteristic,
        })
}
