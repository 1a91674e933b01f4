use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One bandwidth sample as it travels from a client to the collector.
///
/// Every message occupies its own QUIC stream and is encoded as a single JSON object.
/// Missing fields decode to their defaults so the collector can decide what to reject.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Bytes per second.
    #[serde(default)]
    pub upload_speed: f64,
    /// Bytes per second.
    #[serde(default)]
    pub download_speed: f64,
    #[serde(default)]
    pub avg_upload_packet_size: f64,
    #[serde(default)]
    pub avg_download_packet_size: f64,
}

impl TelemetryMessage {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    /// Returns the timestamp unless it is absent or at/before the unix epoch,
    /// which is how an unset clock shows up on the wire.
    pub fn valid_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp.filter(|ts| ts.timestamp() > 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn uses_snake_case_field_names() {
        let message = TelemetryMessage {
            client_id: "edge-1".into(),
            alias: "office".into(),
            timestamp: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
            upload_speed: 2000.0,
            download_speed: 512.5,
            avg_upload_packet_size: 100.0,
            avg_download_packet_size: 64.0,
        };

        let value: serde_json::Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();
        assert_eq!(value["client_id"], "edge-1");
        assert_eq!(value["timestamp"], "2024-05-01T12:00:00Z");
        assert_eq!(value["upload_speed"], 2000.0);
        assert_eq!(value["avg_download_packet_size"], 64.0);
    }

    #[test]
    fn zero_time_is_not_a_valid_timestamp() {
        let message = TelemetryMessage::decode(br#"{"client_id":"a","timestamp":"0001-01-01T00:00:00Z"}"#).unwrap();
        assert!(message.timestamp.is_some());
        assert_eq!(message.valid_timestamp(), None);

        let missing = TelemetryMessage::decode(br#"{"client_id":"a"}"#).unwrap();
        assert_eq!(missing.valid_timestamp(), None);
    }

    #[test]
    fn rejects_non_json() {
        assert!(TelemetryMessage::decode(b"upload=12").is_err());
    }
}
