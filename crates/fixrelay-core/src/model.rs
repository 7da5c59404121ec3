//! Fix relay data model types.
//!
//! These types are passive data definitions shared by the ingestion side
//! (BLE sessions, NMEA aggregation) and the relay side (outbox, MQTT):
//! - Devices and their connection state
//! - Completed GPS fixes
//! - Outbox entries keyed by fix date and time

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Format of outbox entry keys: the fix date and time at microsecond resolution.
pub const ENTRY_KEY_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Knots to kilometres per hour.
pub const KNOTS_TO_KMH: f64 = 1.852;

/// Type tag selected for a device from the allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Connected and enumerated, but exposes no data channel.
    #[serde(rename = "generic")]
    Generic,
    /// GPS receiver streaming NMEA 0183 over a UART-style service.
    #[serde(rename = "gps")]
    GpsSource,
    /// Inertial measurement unit streaming sensor frames.
    #[serde(rename = "imu")]
    ImuSource,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Generic => write!(f, "generic"),
            DeviceKind::GpsSource => write!(f, "gps"),
            DeviceKind::ImuSource => write!(f, "imu"),
        }
    }
}

/// Connection lifecycle of a known peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    ResolvingServices,
    Ready,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Discovered => "discovered",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ResolvingServices => "resolving-services",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// A known BLE peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Hardware address, lower case (e.g. "3c:71:bf:84:b3:86").
    pub address: String,
    /// Type tag from the allow-list.
    pub kind: DeviceKind,
    /// Current connection state.
    pub state: ConnectionState,
}

impl Device {
    /// Create a freshly discovered device.
    pub fn discovered(address: &str, kind: DeviceKind) -> Self {
        Self {
            address: normalize_address(address),
            kind,
            state: ConnectionState::Discovered,
        }
    }
}

/// Normalize a hardware address to its stable key form.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// String field-map of a fix, as persisted in the outbox and relayed.
pub type FixFields = BTreeMap<String, String>;

/// A single resolved GPS position/velocity reading.
///
/// Every field is required; incomplete readings never become a `FixRecord`.
#[derive(Debug, Clone, PartialEq)]
pub struct FixRecord {
    /// UTC date from the recommended-minimum sentence.
    pub datestamp: NaiveDate,
    /// UTC time of the position fix.
    pub timestamp: NaiveTime,
    /// Raw NMEA latitude with hemisphere (e.g. "4807.038N").
    pub latitude: String,
    /// Raw NMEA longitude with hemisphere (e.g. "01131.000E").
    pub longitude: String,
    /// Altitude with unit (e.g. "545.400000M").
    pub altitude: String,
    /// Fix quality indicator, 0 = no fix.
    pub fix_quality: u8,
    /// Number of satellites in use.
    pub satellites: u8,
    /// Speed over ground in km/h.
    pub speed_kmh: f64,
    /// Course over ground, degrees from true north.
    pub course: f64,
}

impl FixRecord {
    /// Combined date and time of the fix.
    pub fn datetime(&self) -> NaiveDateTime {
        self.datestamp.and_time(self.timestamp)
    }

    /// Outbox key for this fix.
    pub fn entry_key(&self) -> String {
        self.datetime().format(ENTRY_KEY_FORMAT).to_string()
    }

    /// Serialize the fix into its persisted field-map.
    pub fn to_fields(&self) -> FixFields {
        let mut fields = FixFields::new();
        fields.insert(
            "datestamp".to_string(),
            self.datestamp.format("%Y-%m-%d").to_string(),
        );
        fields.insert("timestamp".to_string(), format_time(self.timestamp));
        fields.insert("lat".to_string(), self.latitude.clone());
        fields.insert("lng".to_string(), self.longitude.clone());
        fields.insert("alt".to_string(), self.altitude.clone());
        fields.insert("gps_qual".to_string(), self.fix_quality.to_string());
        fields.insert("num_sats".to_string(), self.satellites.to_string());
        fields.insert("speed".to_string(), self.speed_kmh.to_string());
        fields.insert("dir".to_string(), self.course.to_string());
        fields
    }
}

/// Format a time of day, with microseconds only when present.
fn format_time(time: NaiveTime) -> String {
    if time.nanosecond() == 0 {
        time.format("%H:%M:%S").to_string()
    } else {
        time.format("%H:%M:%S%.6f").to_string()
    }
}

/// A fix waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    /// Unique key derived from the fix date and time.
    pub key: String,
    /// Serialized fix fields.
    pub fields: FixFields,
}

impl OutboxEntry {
    /// Build the entry for a completed fix.
    pub fn from_fix(fix: &FixRecord) -> Self {
        Self {
            key: fix.entry_key(),
            fields: fix.to_fields(),
        }
    }

    /// Date and time encoded in the entry key.
    pub fn datetime(&self) -> Option<NaiveDateTime> {
        parse_entry_key(&self.key)
    }

    /// Move the key one microsecond later. Used when another receiver
    /// already queued a fix for the same instant.
    ///
    /// Returns `false` if the key does not parse.
    pub fn bump_key(&mut self) -> bool {
        let Some(next) = self
            .datetime()
            .and_then(|dt| dt.checked_add_signed(chrono::Duration::microseconds(1)))
        else {
            return false;
        };
        self.key = next.format(ENTRY_KEY_FORMAT).to_string();
        true
    }
}

/// Parse an outbox entry key back into a date and time.
///
/// Keys without a fractional second are accepted as well.
pub fn parse_entry_key(key: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(key, "%Y-%m-%dT%H:%M:%S%.f").ok()
}
