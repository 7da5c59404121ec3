//! # fixrelay-ble
//!
//! BLE central for the fix relay.
//!
//! The [`ConnectionManager`] scans for peripherals, connects to the ones on
//! the allow-list and binds each device's notification stream to a session
//! (GPS, IMU or generic). Completed GPS fixes are queued in the outbox.

use thiserror::Error;
use uuid::Uuid;

pub mod manager;
pub mod session;

pub use manager::ConnectionManager;

/// Errors from the BLE layer.
#[derive(Debug, Error)]
pub enum BleError {
    /// No adapter at the configured index.
    #[error("No Bluetooth adapter at index {0}")]
    NoAdapter(usize),

    /// The device does not expose its data service.
    #[error("Service {0} not found")]
    ServiceNotFound(Uuid),

    /// The data service lacks the notify characteristic.
    #[error("Characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },

    /// Error from the platform Bluetooth stack.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),
}
