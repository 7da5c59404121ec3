//! Payload codec for relayed fixes.
//!
//! Payloads are UTF-8 JSON. The `datetime` field is derived from the outbox
//! entry key, which holds the fix date and time in UTC.

use fixrelay_core::{parse_entry_key, OutboxEntry};
use thiserror::Error;

use crate::messages::FixPayload;

/// Errors that can occur during payload encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON serialization failed.
    #[error("Failed to serialize payload: {0}")]
    SerializeError(#[from] serde_json::Error),

    /// The entry key does not hold a date and time.
    #[error("Entry key is not a timestamp: {0}")]
    InvalidKey(String),
}

/// Unix timestamp (seconds, microsecond precision) encoded in an entry key.
pub fn entry_unix_timestamp(key: &str) -> Result<f64, CodecError> {
    let datetime = parse_entry_key(key).ok_or_else(|| CodecError::InvalidKey(key.to_string()))?;
    Ok(datetime.and_utc().timestamp_micros() as f64 / 1_000_000.0)
}

/// Build the payload for an outbox entry.
pub fn build_payload(entry: &OutboxEntry) -> Result<FixPayload, CodecError> {
    Ok(FixPayload {
        fields: entry.fields.clone(),
        datetime: entry_unix_timestamp(&entry.key)?,
    })
}

/// Encode an outbox entry as a publish payload.
pub fn encode_fix_payload(entry: &OutboxEntry) -> Result<Vec<u8>, CodecError> {
    let payload = build_payload(entry)?;
    serde_json::to_vec(&payload).map_err(CodecError::from)
}

/// Decode a publish payload.
pub fn decode_fix_payload(bytes: &[u8]) -> Result<FixPayload, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use fixrelay_core::FixRecord;

    fn entry() -> OutboxEntry {
        OutboxEntry::from_fix(&FixRecord {
            datestamp: NaiveDate::from_ymd_opt(1994, 3, 23).unwrap(),
            timestamp: NaiveTime::from_hms_opt(12, 35, 19).unwrap(),
            latitude: "4807.038N".to_string(),
            longitude: "01131.000E".to_string(),
            altitude: "545.400000M".to_string(),
            fix_quality: 1,
            satellites: 8,
            speed_kmh: 41.4848,
            course: 84.4,
        })
    }

    #[test]
    fn test_entry_unix_timestamp() {
        assert_eq!(
            entry_unix_timestamp("1994-03-23T12:35:19.000000").unwrap(),
            764426119.0
        );
        assert_eq!(
            entry_unix_timestamp("1994-03-23T12:35:19.500000").unwrap(),
            764426119.5
        );
        assert!(matches!(
            entry_unix_timestamp("garbage"),
            Err(CodecError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_encode_payload() {
        let bytes = encode_fix_payload(&entry()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["lat"], "4807.038N");
        assert_eq!(json["lng"], "01131.000E");
        assert_eq!(json["speed"], "41.4848");
        assert_eq!(json["dir"], "84.4");
        assert_eq!(json["datestamp"], "1994-03-23");
        assert_eq!(json["datetime"], 764426119.0);
        // Nine fix fields plus datetime
        assert_eq!(json.as_object().unwrap().len(), 10);
    }

    #[test]
    fn test_decode_payload() {
        let entry = entry();
        let payload = decode_fix_payload(&encode_fix_payload(&entry).unwrap()).unwrap();
        assert_eq!(payload.fields, entry.fields);
        assert_eq!(payload.datetime, 764426119.0);
    }

    #[test]
    fn test_bad_key_is_not_encoded() {
        let mut entry = entry();
        entry.key = "not-a-time".to_string();
        assert!(matches!(
            encode_fix_payload(&entry),
            Err(CodecError::InvalidKey(_))
        ));
    }
}
