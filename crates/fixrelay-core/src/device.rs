//! Device connection state machine.
//!
//! ```text
//! Discovered -> Connecting -> Connected -> ResolvingServices -> Ready -> Disconnected
//!                   |                              |
//!                   +-> Discovered (failed)        +-> Disconnected (no data channel)
//! ```
//!
//! The registry holds the immutable allow-list and one [`Device`] per known
//! address. It performs no I/O: the BLE layer reports what happened as
//! [`DeviceEvent`]s and acts on the returned state.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::model::{normalize_address, ConnectionState, Device, DeviceKind};

/// Something that happened to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A connect request was issued.
    ConnectRequested,
    /// The link came up.
    ConnectSucceeded,
    /// The connect request failed.
    ConnectFailed,
    /// Service enumeration started.
    ResolveStarted,
    /// Services enumerated and the data channel (if any) is delivering notifications.
    ServicesResolved,
    /// The data service/characteristic was missing or notifications could not be enabled.
    ResolveFailed,
    /// The link dropped or was closed.
    LinkLost,
}

/// Errors from applying device events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The address is not tracked by the registry.
    #[error("Unknown device [{0}]")]
    UnknownDevice(String),

    /// The event is not valid in the device's current state.
    #[error("Invalid transition for [{address}]: {event:?} while {state}")]
    Invalid {
        address: String,
        state: ConnectionState,
        event: DeviceEvent,
    },
}

/// Next state for `event` in `state`, or `None` if the event is not allowed.
pub fn next_state(state: ConnectionState, event: DeviceEvent) -> Option<ConnectionState> {
    use ConnectionState::*;
    use DeviceEvent::*;

    match (state, event) {
        (Discovered, ConnectRequested) => Some(Connecting),
        (Connecting, ConnectSucceeded) => Some(Connected),
        (Connecting, ConnectFailed) | (Connecting, LinkLost) => Some(Discovered),
        (Connected, ResolveStarted) => Some(ResolvingServices),
        (ResolvingServices, ServicesResolved) => Some(Ready),
        (ResolvingServices, ResolveFailed) => Some(Disconnected),
        (Connected, LinkLost) | (ResolvingServices, LinkLost) | (Ready, LinkLost) => {
            Some(Disconnected)
        }
        (Disconnected, LinkLost) => Some(Disconnected),
        _ => None,
    }
}

/// Outcome of a discovery event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    /// Allow-listed and new: the device is now `Connecting` and a connect
    /// request must be issued.
    Connect(DeviceKind),
    /// Already tracked; nothing to do.
    AlreadyKnown(ConnectionState),
    /// Not on the allow-list; left unconnected.
    Unknown,
}

/// Known devices keyed by hardware address.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    allow_list: BTreeMap<String, DeviceKind>,
    devices: HashMap<String, Device>,
}

impl DeviceRegistry {
    /// Create a registry for the given allow-list.
    pub fn new(allow_list: &BTreeMap<String, DeviceKind>) -> Self {
        Self {
            allow_list: allow_list
                .iter()
                .map(|(address, kind)| (normalize_address(address), *kind))
                .collect(),
            devices: HashMap::new(),
        }
    }

    /// Device type for an address, if allow-listed.
    pub fn kind_of(&self, address: &str) -> Option<DeviceKind> {
        self.allow_list.get(&normalize_address(address)).copied()
    }

    /// Handle discovery of a peripheral.
    ///
    /// Only the first discovery of an allow-listed address leads to a
    /// connect; devices left idle after a failed connect are not retried.
    pub fn discover(&mut self, address: &str) -> Discovery {
        let address = normalize_address(address);
        let Some(kind) = self.allow_list.get(&address).copied() else {
            return Discovery::Unknown;
        };
        if let Some(device) = self.devices.get(&address) {
            return Discovery::AlreadyKnown(device.state);
        }

        let mut device = Device::discovered(&address, kind);
        device.state = ConnectionState::Connecting;
        self.devices.insert(address, device);
        Discovery::Connect(kind)
    }

    /// Apply an event to a tracked device and return its new state.
    pub fn apply(
        &mut self,
        address: &str,
        event: DeviceEvent,
    ) -> Result<ConnectionState, TransitionError> {
        let address = normalize_address(address);
        let device = self
            .devices
            .get_mut(&address)
            .ok_or_else(|| TransitionError::UnknownDevice(address.clone()))?;

        let next = next_state(device.state, event).ok_or(TransitionError::Invalid {
            address,
            state: device.state,
            event,
        })?;
        device.state = next;
        Ok(next)
    }

    /// Look up a tracked device.
    pub fn get(&self, address: &str) -> Option<&Device> {
        self.devices.get(&normalize_address(address))
    }

    /// Stop tracking a device.
    pub fn remove(&mut self, address: &str) -> Option<Device> {
        self.devices.remove(&normalize_address(address))
    }

    /// All tracked devices.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Addresses of devices holding (or establishing) a link.
    pub fn live_addresses(&self) -> Vec<String> {
        let mut live: Vec<String> = self
            .devices
            .values()
            .filter(|d| {
                !matches!(
                    d.state,
                    ConnectionState::Discovered | ConnectionState::Disconnected
                )
            })
            .map(|d| d.address.clone())
            .collect();
        live.sort();
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const GPS: &str = "3c:71:bf:84:b3:86";
    const IMU: &str = "aa:bb:cc:dd:ee:ff";

    fn registry() -> DeviceRegistry {
        let mut allow_list = BTreeMap::new();
        allow_list.insert("3C:71:BF:84:B3:86".to_string(), DeviceKind::GpsSource);
        allow_list.insert(IMU.to_string(), DeviceKind::ImuSource);
        DeviceRegistry::new(&allow_list)
    }

    #[test]
    fn test_happy_path() {
        let mut registry = registry();

        assert_eq!(registry.discover(GPS), Discovery::Connect(DeviceKind::GpsSource));
        assert_eq!(registry.get(GPS).unwrap().state, ConnectionState::Connecting);

        let steps = [
            (DeviceEvent::ConnectSucceeded, ConnectionState::Connected),
            (DeviceEvent::ResolveStarted, ConnectionState::ResolvingServices),
            (DeviceEvent::ServicesResolved, ConnectionState::Ready),
            (DeviceEvent::LinkLost, ConnectionState::Disconnected),
        ];
        for (event, expected) in steps {
            assert_eq!(registry.apply(GPS, event), Ok(expected));
        }
    }

    #[test]
    fn test_unknown_device_left_alone() {
        let mut registry = registry();
        assert_eq!(registry.discover("11:22:33:44:55:66"), Discovery::Unknown);
        assert!(registry.get("11:22:33:44:55:66").is_none());
        assert_eq!(
            registry.apply("11:22:33:44:55:66", DeviceEvent::ConnectSucceeded),
            Err(TransitionError::UnknownDevice("11:22:33:44:55:66".to_string()))
        );
    }

    #[test]
    fn test_discovery_is_case_insensitive() {
        let mut registry = registry();
        assert_eq!(registry.kind_of("AA:BB:CC:DD:EE:FF"), Some(DeviceKind::ImuSource));
        assert_eq!(
            registry.discover("AA:BB:CC:DD:EE:FF"),
            Discovery::Connect(DeviceKind::ImuSource)
        );
    }

    #[test]
    fn test_failed_connect_is_not_retried() {
        let mut registry = registry();
        registry.discover(GPS);

        assert_eq!(
            registry.apply(GPS, DeviceEvent::ConnectFailed),
            Ok(ConnectionState::Discovered)
        );
        assert_eq!(
            registry.discover(GPS),
            Discovery::AlreadyKnown(ConnectionState::Discovered)
        );
        assert!(registry.live_addresses().is_empty());
    }

    #[test]
    fn test_connected_device_not_reconnected() {
        let mut registry = registry();
        registry.discover(GPS);
        registry.apply(GPS, DeviceEvent::ConnectSucceeded).unwrap();

        assert_eq!(
            registry.discover(GPS),
            Discovery::AlreadyKnown(ConnectionState::Connected)
        );
        assert_eq!(registry.live_addresses(), vec![GPS.to_string()]);
    }

    #[test]
    fn test_resolve_failure_disconnects() {
        let mut registry = registry();
        registry.discover(GPS);
        registry.apply(GPS, DeviceEvent::ConnectSucceeded).unwrap();
        registry.apply(GPS, DeviceEvent::ResolveStarted).unwrap();

        assert_eq!(
            registry.apply(GPS, DeviceEvent::ResolveFailed),
            Ok(ConnectionState::Disconnected)
        );
        // A late link-loss report is harmless
        assert_eq!(
            registry.apply(GPS, DeviceEvent::LinkLost),
            Ok(ConnectionState::Disconnected)
        );
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut registry = registry();
        registry.discover(GPS);

        assert_eq!(
            registry.apply(GPS, DeviceEvent::ServicesResolved),
            Err(TransitionError::Invalid {
                address: GPS.to_string(),
                state: ConnectionState::Connecting,
                event: DeviceEvent::ServicesResolved,
            })
        );
        // State is unchanged
        assert_eq!(registry.get(GPS).unwrap().state, ConnectionState::Connecting);
    }

    #[test]
    fn test_no_reconnect_after_disconnect() {
        assert_eq!(
            next_state(ConnectionState::Disconnected, DeviceEvent::ConnectRequested),
            None
        );
        assert_eq!(
            next_state(ConnectionState::Ready, DeviceEvent::ConnectRequested),
            None
        );
    }
}
