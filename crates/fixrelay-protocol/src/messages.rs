//! Message types published to the broker.
//!
//! Each relayed fix is one JSON object on `<prefix>/<host identity>`:
//!
//! ```json
//! {
//!   "alt": "545.400000M", "datestamp": "1994-03-23", "dir": "84.4",
//!   "gps_qual": "1", "lat": "4807.038N", "lng": "01131.000E",
//!   "num_sats": "8", "speed": "41.4848", "timestamp": "12:35:19",
//!   "datetime": 764426119.0
//! }
//! ```
//!
//! Fix fields are relayed as the strings stored in the outbox; `datetime` is
//! the Unix timestamp of the entry key.

use fixrelay_core::FixFields;
use serde::{Deserialize, Serialize};

/// Default topic prefix for fix messages.
pub const DEFAULT_TOPIC_PREFIX: &str = "gps-data";

/// JSON payload of one relayed fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixPayload {
    /// Stored fix fields.
    #[serde(flatten)]
    pub fields: FixFields,

    /// Unix timestamp of the fix in seconds.
    pub datetime: f64,
}

/// Builds publish topics scoped by host identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    prefix: String,
}

impl Default for TopicBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_PREFIX)
    }
}

impl TopicBuilder {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Topic for fixes from the given host, e.g. "gps-data/edge-01".
    pub fn fix_topic(&self, host_identity: &str) -> String {
        format!("{}/{}", self.prefix, host_identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_topic() {
        assert_eq!(TopicBuilder::default().fix_topic("edge-01"), "gps-data/edge-01");
        assert_eq!(TopicBuilder::new("fleet/gps/").fix_topic("edge-01"), "fleet/gps/edge-01");
    }

    #[test]
    fn test_payload_flattens_fields() {
        let mut fields = FixFields::new();
        fields.insert("lat".to_string(), "4807.038N".to_string());
        let payload = FixPayload {
            fields,
            datetime: 764426119.0,
        };

        let json: serde_json::Value = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["lat"], "4807.038N");
        assert_eq!(json["datetime"], 764426119.0);
        assert_eq!(json.as_object().unwrap().len(), 2);
    }
}
