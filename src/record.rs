use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Name of the field carrying the source-assigned timestamp.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// A single log record as received from the message bus.
///
/// The record keeps the full JSON object it was decoded from, so the line
/// pushed to the sink is exactly what the producer published. The parsed
/// timestamp is kept alongside for the sink's time axis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    #[serde(skip)]
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

/// Error returned when a bus payload cannot be turned into a [`LogRecord`].
#[derive(thiserror::Error, Debug)]
pub enum RecordError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is JSON but not an object")]
    NotAnObject,
}

impl LogRecord {
    /// Build a record from an explicit timestamp and field map.
    pub fn new(timestamp: DateTime<Utc>, fields: Map<String, Value>) -> Self {
        LogRecord { timestamp, fields }
    }

    /// Decode a record from raw payload bytes.
    ///
    /// The `timestamp` field may be an RFC 3339 string or a number of epoch
    /// milliseconds. When it is missing or unreadable the record is stamped
    /// with `received_at`.
    pub fn from_json_slice(payload: &[u8], received_at: DateTime<Utc>) -> Result<Self, RecordError> {
        match serde_json::from_slice::<Value>(payload)? {
            Value::Object(fields) => {
                let timestamp = fields
                    .get(TIMESTAMP_FIELD)
                    .and_then(parse_timestamp)
                    .unwrap_or(received_at);
                Ok(LogRecord { timestamp, fields })
            }
            _ => Err(RecordError::NotAnObject),
        }
    }

    /// Add or replace a field. Only meant for building records before
    /// they are handed to the shipper.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(n) => {
            let millis = match n.as_i64() {
                Some(ms) => ms,
                None => n.as_f64().filter(|ms| ms.is_finite())? as i64,
            };
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}
