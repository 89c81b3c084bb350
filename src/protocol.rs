//! Wire envelope for named events.
//!
//! One JSON text frame per event:
//! `{"event":"locationUpdate","data":{"id":"A","lat":10.0,"lng":20.0}}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GeoError;
use crate::location::{LocationSample, LOCATION_UPDATE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn location_update(sample: &LocationSample) -> Self {
        Self::new(LOCATION_UPDATE, sample.to_payload())
    }

    pub fn decode(text: &str) -> Result<Self, GeoError> {
        serde_json::from_str(text).map_err(|e| GeoError::MalformedPayload(e.to_string()))
    }

    pub fn encode(&self) -> String {
        // Value trees built from serde types always serialize
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_location_update_frame() {
        let frame = Envelope::location_update(&LocationSample::new("A", 10.0, 20.0)).encode();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(
            value,
            json!({"event": "locationUpdate", "data": {"id": "A", "lat": 10.0, "lng": 20.0}})
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode(r#"{"data": {}}"#).is_err());

        let env = Envelope::decode(r#"{"event": "ping"}"#).unwrap();
        assert_eq!(env.data, Value::Null);
    }
}
