//! Participant positions and the `locationUpdate` wire payload.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GeoError;

/// Event name carrying a [`LocationSample`] in both directions.
pub const LOCATION_UPDATE: &str = "locationUpdate";

/// Opaque participant identifier. Uniqueness is the caller's responsibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A raw `(latitude, longitude)` reading from a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Checks both axes are finite and within their geographic range.
    pub fn validate(&self) -> Result<(), GeoError> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(GeoError::MalformedPayload(format!(
                "lat {} outside [-90, 90]",
                self.lat
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(GeoError::MalformedPayload(format!(
                "lng {} outside [-180, 180]",
                self.lng
            )));
        }
        Ok(())
    }
}

/// One participant's position. Always a full replacement, never a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub id: ParticipantId,
    pub lat: f64,
    pub lng: f64,

    /// Per-participant monotonic sequence number, when the sender stamps one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl LocationSample {
    pub fn new(id: impl Into<ParticipantId>, lat: f64, lng: f64) -> Self {
        Self {
            id: id.into(),
            lat,
            lng,
            seq: None,
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.lat, self.lng)
    }

    /// Decode a sample from an untrusted event payload.
    ///
    /// Every field is checked before anything is built, so a bad payload
    /// never yields a partially filled sample.
    pub fn from_payload(payload: &Value) -> Result<Self, GeoError> {
        let obj = payload
            .as_object()
            .ok_or_else(|| GeoError::MalformedPayload("payload is not an object".into()))?;

        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GeoError::MalformedPayload("missing id".into()))?;
        let lat = obj
            .get("lat")
            .and_then(Value::as_f64)
            .ok_or_else(|| GeoError::MalformedPayload("missing lat".into()))?;
        let lng = obj
            .get("lng")
            .and_then(Value::as_f64)
            .ok_or_else(|| GeoError::MalformedPayload("missing lng".into()))?;
        let seq = match obj.get("seq") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .ok_or_else(|| GeoError::MalformedPayload("seq is not a u64".into()))?,
            ),
        };

        Coordinates::new(lat, lng).validate()?;

        Ok(Self {
            id: ParticipantId::new(id),
            lat,
            lng,
            seq,
        })
    }

    pub fn to_payload(&self) -> Value {
        // Serializing plain strings and finite floats cannot fail
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_payload() {
        let sample = LocationSample::from_payload(&json!({"id": "A", "lat": 10, "lng": 20.5})).unwrap();
        assert_eq!(sample, LocationSample::new("A", 10.0, 20.5));
        assert_eq!(sample.seq, None);

        let sample =
            LocationSample::from_payload(&json!({"id": "A", "lat": 1.0, "lng": 2.0, "seq": 9})).unwrap();
        assert_eq!(sample.seq, Some(9));
    }

    #[test]
    fn test_missing_fields_rejected() {
        for payload in [
            json!({"id": "A", "lng": 2.0}),
            json!({"id": "A", "lat": 1.0}),
            json!({"lat": 1.0, "lng": 2.0}),
            json!({"id": "", "lat": 1.0, "lng": 2.0}),
            json!({"id": 5, "lat": 1.0, "lng": 2.0}),
            json!({"id": "A", "lat": "1.0", "lng": 2.0}),
            json!({"id": "A", "lat": 1.0, "lng": 2.0, "seq": -1}),
            json!([1, 2]),
            json!(null),
        ] {
            assert!(
                matches!(LocationSample::from_payload(&payload), Err(GeoError::MalformedPayload(_))),
                "accepted {payload}"
            );
        }
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(LocationSample::from_payload(&json!({"id": "A", "lat": 90.5, "lng": 0})).is_err());
        assert!(LocationSample::from_payload(&json!({"id": "A", "lat": 0, "lng": -180.1})).is_err());
        assert!(LocationSample::from_payload(&json!({"id": "A", "lat": -90, "lng": 180})).is_ok());
        assert!(Coordinates::new(f64::NAN, 0.0).validate().is_err());
    }

    #[test]
    fn test_payload_shape() {
        let payload = LocationSample::new("p1", 1.5, -2.5).to_payload();
        assert_eq!(payload, json!({"id": "p1", "lat": 1.5, "lng": -2.5}));

        let payload = LocationSample::new("p1", 1.5, -2.5).with_seq(3).to_payload();
        assert_eq!(payload["seq"], json!(3));
    }
}
