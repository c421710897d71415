use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const TEMPERATURE_FIELD: &str = "temperature";
pub const HUMIDITY_FIELD: &str = "humidity";

/// Normalized message body: a JSON object kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TelemetryPayload(Map<String, Value>);

impl TelemetryPayload {
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn device_id(&self) -> Option<&str> {
        self.0.get("deviceId").and_then(Value::as_str)
    }

    /// Numeric view of a sensor field. Publishers send both `21.5` and
    /// `"21.50"`, so numeric strings are accepted too.
    pub fn reading(&self, field: &str) -> Option<f64> {
        match self.0.get(field)? {
            Value::Number(number) => number.as_f64(),
            Value::String(raw) => raw.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|value| value.is_finite())
    }
}

/// Parses a raw message body. The buffer is used as simd-json scratch space
/// and is left in an unspecified state.
pub fn normalize(raw: &mut [u8]) -> Result<TelemetryPayload, IngestError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(IngestError::MalformedPayload("empty body".to_string()));
    }

    let value: Value = simd_json::serde::from_slice(raw)
        .map_err(|err| IngestError::MalformedPayload(err.to_string()))?;

    match value {
        Value::Object(fields) => Ok(TelemetryPayload(fields)),
        other => Err(IngestError::MalformedPayload(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_keeps_payload_verbatim() {
        let mut body = br#"{"deviceId":"s1","temperature":21.5,"humidity":55,"site":{"room":"a"}}"#.to_vec();
        let payload = normalize(&mut body).expect("payload");
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"deviceId":"s1","temperature":21.5,"humidity":55,"site":{"room":"a"}})
        );
        assert_eq!(payload.device_id(), Some("s1"));
    }

    #[test]
    fn normalize_rejects_unparseable_bodies() {
        for body in [&b"not json"[..], b"{\"deviceId\":", b"", b"   "] {
            let mut body = body.to_vec();
            let err = normalize(&mut body).unwrap_err();
            assert!(matches!(err, IngestError::MalformedPayload(_)), "{err}");
        }
    }

    #[test]
    fn normalize_accepts_integers_beyond_64_bits() {
        for body in [
            r#"{"deviceId":"s1","serial":123456789012345678901234}"#,
            r#"{"deviceId":"s1","offset":-9223372036854775809}"#,
        ] {
            let mut raw = body.as_bytes().to_vec();
            let payload = normalize(&mut raw).unwrap_or_else(|err| panic!("{body}: {err}"));
            assert_eq!(payload.device_id(), Some("s1"));
            assert_eq!(payload.fields().len(), 2);
        }

        let mut raw = br#"{"serial":123456789012345678901234}"#.to_vec();
        let serial = normalize(&mut raw).unwrap().fields()["serial"].as_f64().unwrap();
        assert!((serial - 1.2345678901234568e23).abs() < 1e9);
    }

    #[test]
    fn normalize_rejects_non_object_json() {
        let mut body = b"[1,2,3]".to_vec();
        let err = normalize(&mut body).unwrap_err();
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn reading_coerces_numeric_strings() {
        let mut body =
            br#"{"temperature":"24.75","humidity":" 48.10 ","pressure":"high","flag":true}"#.to_vec();
        let payload = normalize(&mut body).unwrap();
        assert_eq!(payload.reading(TEMPERATURE_FIELD), Some(24.75));
        assert_eq!(payload.reading(HUMIDITY_FIELD), Some(48.1));
        assert_eq!(payload.reading("pressure"), None);
        assert_eq!(payload.reading("flag"), None);
        assert_eq!(payload.reading("missing"), None);
    }
}
