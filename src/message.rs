//! Location message wire format: a compact 3-element JSON array
//! `["LOCATION", "<lat>", "<lon>"]`. Coordinates are carried as strings, not
//! JSON numbers, so the decimal representation the GNSS subsystem produced
//! survives the round trip untouched — floating point re-serialization would
//! otherwise perturb trailing digits.

use serde_json::Value;

const TAG: &str = "LOCATION";

/// A GNSS fix ready to be sent over the wire, or one just decoded from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationMessage {
    pub lat: String,
    pub lon: String,
}

impl LocationMessage {
    #[must_use]
    pub fn new(lat: impl Into<String>, lon: impl Into<String>) -> Self {
        Self {
            lat: lat.into(),
            lon: lon.into(),
        }
    }

    /// Encode as `["LOCATION", "<lat>", "<lon>"]`. The firmware parser is
    /// byte-for-byte strict about the `", "` separator, so this is built by
    /// hand rather than via `Value::to_string()`, which emits compact JSON
    /// with no space after the comma.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            r#"["{TAG}", {}, {}]"#,
            Value::String(self.lat.clone()),
            Value::String(self.lon.clone()),
        )
    }

    /// Decode a JSON text payload as a location message. Returns `None` if
    /// the payload isn't the 3-element `["LOCATION", lat, lon]` shape — this
    /// is how the caller distinguishes a location message from an ordinary
    /// text payload, not a parse error.
    #[must_use]
    pub fn decode(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        let array = value.as_array()?;
        let [tag, lat, lon] = array.as_slice() else {
            return None;
        };
        if tag.as_str()? != TAG {
            return None;
        }
        Some(Self::new(lat.as_str()?.to_string(), lon.as_str()?.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_form() {
        let msg = LocationMessage::new("35.681236", "139.767125");
        assert_eq!(msg.encode(), r#"["LOCATION", "35.681236", "139.767125"]"#);
    }

    #[test]
    fn test_round_trip() {
        let msg = LocationMessage::new("35.681236", "139.767125");
        let decoded = LocationMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_round_trip_preserves_exact_decimal_text() {
        // A value that would shift under float round-tripping.
        let msg = LocationMessage::new("-0.000000100", "179.9999999999999");
        let decoded = LocationMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.lat, "-0.000000100");
        assert_eq!(decoded.lon, "179.9999999999999");
    }

    #[test]
    fn test_decode_rejects_wrong_tag() {
        assert!(LocationMessage::decode(r#"["PING","1","2"]"#).is_none());
    }

    #[test]
    fn test_decode_rejects_non_array_payload() {
        assert!(LocationMessage::decode("ping").is_none());
        assert!(LocationMessage::decode(r#"{"a":1}"#).is_none());
    }

    #[test]
    fn test_decode_rejects_wrong_arity() {
        assert!(LocationMessage::decode(r#"["LOCATION","1"]"#).is_none());
        assert!(LocationMessage::decode(r#"["LOCATION","1","2","3"]"#).is_none());
    }
}
