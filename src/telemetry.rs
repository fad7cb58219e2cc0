use anyhow::{bail, Result};
use chrono::DateTime;
use serde::Deserialize;
use serde_json::{Map, Value};

const SENTENCE_TYPE_KEY: &str = "sentence_type";
const TIMESTAMP_KEY: &str = "timestamp";

/// One decoded telemetry message: a partial set of fields reported by a device.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub device_id: String,
    pub timestamp_ms: i64,
    pub fields: Map<String, Value>,
}

impl FieldUpdate {
    pub fn new(device_id: impl Into<String>, timestamp_ms: i64, fields: Map<String, Value>) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp_ms,
            fields,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Int(i64),
    Float(f64),
    Str(String),
}

impl WireTimestamp {
    fn to_millis(&self) -> Option<i64> {
        match self {
            WireTimestamp::Int(ms) => Some(*ms),
            WireTimestamp::Float(ms) if ms.is_finite() => Some(ms.trunc() as i64),
            WireTimestamp::Float(_) => None,
            WireTimestamp::Str(raw) => {
                let raw = raw.trim();
                raw.parse::<i64>().ok().or_else(|| {
                    DateTime::parse_from_rfc3339(raw)
                        .ok()
                        .map(|dt| dt.timestamp_millis())
                })
            }
        }
    }
}

/// Decodes a publish on `<prefix>/<mmsi>/<sentence_type>` into a [`FieldUpdate`].
///
/// Returns `Ok(None)` for topics outside the feed and for messages without a
/// usable timestamp; those are noise on an at-least-once transport, not errors.
pub fn parse_mqtt_payload(
    topic_prefix: &str,
    topic: &str,
    payload: &mut [u8],
) -> Result<Option<FieldUpdate>> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 3 || parts[0] != topic_prefix || parts[1].trim().is_empty() {
        return Ok(None);
    }
    let device_id = parts[1].trim().to_string();

    let value: Value = simd_json::from_slice(payload)?;
    let Value::Object(mut fields) = value else {
        bail!("telemetry payload is not a JSON object");
    };

    let timestamp = fields
        .remove(TIMESTAMP_KEY)
        .and_then(|raw| serde_json::from_value::<WireTimestamp>(raw).ok())
        .and_then(|ts| ts.to_millis())
        .filter(|ms| *ms > 0);
    let Some(timestamp_ms) = timestamp else {
        tracing::trace!(topic, "dropping telemetry without timestamp");
        return Ok(None);
    };
    fields.remove(SENTENCE_TYPE_KEY);

    Ok(Some(FieldUpdate::new(device_id, timestamp_ms, fields)))
}
