//! Per-device notification handling.
//!
//! Each device type gets a session variant selected from the allow-list at
//! connect time. All variants are driven through [`SessionHandler`]:
//! `on_ready` once notifications are enabled, `on_notification` for every
//! notification value received afterwards.

use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::aggregator::NmeaFixAggregator;
use crate::model::{DeviceKind, FixRecord};
use crate::reassembly::SentenceReassembler;

/// Nordic UART service exposed by the GPS receiver.
pub const GPS_UART_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// UART TX characteristic (central to peripheral).
pub const GPS_UART_TX: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
/// UART RX characteristic (peripheral to central, notify).
pub const GPS_UART_RX: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Serial service exposed by the IMU.
pub const IMU_UART_SERVICE: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
/// Serial data characteristic of the IMU.
pub const IMU_UART_DATA: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// GATT service and characteristic carrying a device's data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChannel {
    pub service: Uuid,
    pub characteristic: Uuid,
}

/// The data channel to enable notifications on, if the device type has one.
pub fn data_channel(kind: DeviceKind) -> Option<DataChannel> {
    match kind {
        DeviceKind::Generic => None,
        DeviceKind::GpsSource => Some(DataChannel {
            service: GPS_UART_SERVICE,
            characteristic: GPS_UART_RX,
        }),
        DeviceKind::ImuSource => Some(DataChannel {
            service: IMU_UART_SERVICE,
            characteristic: IMU_UART_DATA,
        }),
    }
}

/// Capability interface of a device session.
pub trait SessionHandler: Send {
    /// Called once the device reached the ready state.
    fn on_ready(&mut self, address: &str);

    /// Handle one notification value, returning the fixes it completed.
    fn on_notification(&mut self, value: &[u8]) -> Vec<FixRecord>;
}

/// GPS receiver session: line reassembly feeding fix aggregation.
#[derive(Debug, Clone, Default)]
pub struct GpsSession {
    reassembler: SentenceReassembler,
    aggregator: NmeaFixAggregator,
}

impl GpsSession {
    pub fn new(fix_quality_threshold: u8) -> Self {
        Self {
            reassembler: SentenceReassembler::new(),
            aggregator: NmeaFixAggregator::new(fix_quality_threshold),
        }
    }

    pub fn aggregator(&self) -> &NmeaFixAggregator {
        &self.aggregator
    }
}

impl SessionHandler for GpsSession {
    fn on_ready(&mut self, address: &str) {
        info!("GPS stream ready [{}]", address);
    }

    fn on_notification(&mut self, value: &[u8]) -> Vec<FixRecord> {
        self.reassembler
            .feed(value)
            .iter()
            .filter_map(|line| self.aggregator.ingest_line(line))
            .collect()
    }
}

/// IMU session.
///
/// Frames are reassembled into lines but not decoded yet; they are traced
/// and dropped.
#[derive(Debug, Clone, Default)]
pub struct ImuSession {
    reassembler: SentenceReassembler,
}

impl SessionHandler for ImuSession {
    fn on_ready(&mut self, address: &str) {
        info!("IMU stream ready [{}]", address);
    }

    fn on_notification(&mut self, value: &[u8]) -> Vec<FixRecord> {
        for frame in self.reassembler.feed(value) {
            trace!("IMU frame: {}", frame);
        }
        Vec::new()
    }
}

/// Session variants, one per device type.
#[derive(Debug, Clone)]
pub enum DeviceSession {
    Generic,
    Gps(GpsSession),
    Imu(ImuSession),
}

impl DeviceSession {
    /// Fresh session for a device of the given type.
    pub fn for_kind(kind: DeviceKind, fix_quality_threshold: u8) -> Self {
        match kind {
            DeviceKind::Generic => DeviceSession::Generic,
            DeviceKind::GpsSource => DeviceSession::Gps(GpsSession::new(fix_quality_threshold)),
            DeviceKind::ImuSource => DeviceSession::Imu(ImuSession::default()),
        }
    }
}

impl SessionHandler for DeviceSession {
    fn on_ready(&mut self, address: &str) {
        match self {
            DeviceSession::Generic => debug!("Generic device ready [{}]", address),
            DeviceSession::Gps(session) => session.on_ready(address),
            DeviceSession::Imu(session) => session.on_ready(address),
        }
    }

    fn on_notification(&mut self, value: &[u8]) -> Vec<FixRecord> {
        match self {
            DeviceSession::Generic => Vec::new(),
            DeviceSession::Gps(session) => session.on_notification(value),
            DeviceSession::Imu(session) => session.on_notification(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n\
                          $GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A\r\n";

    #[test]
    fn test_gps_session_chunked_notifications() {
        let mut session = DeviceSession::for_kind(DeviceKind::GpsSource, 5);
        session.on_ready("3c:71:bf:84:b3:86");

        // Typical 20 byte ATT payloads
        let fixes: Vec<FixRecord> = STREAM
            .as_bytes()
            .chunks(20)
            .flat_map(|chunk| session.on_notification(chunk))
            .collect();

        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].latitude, "4807.038N");
    }

    #[test]
    fn test_imu_and_generic_emit_nothing() {
        let mut imu = DeviceSession::for_kind(DeviceKind::ImuSource, 5);
        assert!(imu.on_notification(b"ax=0.1,ay=0.2,az=9.8\n").is_empty());
        assert!(imu.on_notification(STREAM.as_bytes()).is_empty());

        let mut generic = DeviceSession::for_kind(DeviceKind::Generic, 5);
        assert!(generic.on_notification(STREAM.as_bytes()).is_empty());
    }

    #[test]
    fn test_data_channels() {
        assert_eq!(data_channel(DeviceKind::Generic), None);

        let gps = data_channel(DeviceKind::GpsSource).unwrap();
        assert_eq!(
            gps.characteristic.to_string(),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );

        let imu = data_channel(DeviceKind::ImuSource).unwrap();
        assert_eq!(imu.service.to_string(), "0000ffe0-0000-1000-8000-00805f9b34fb");
    }
}
