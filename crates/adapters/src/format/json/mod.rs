//! JSON decoder.
//!
//! Validates a raw payload against the schema of its stream and coerces
//! every field to its schema type.  The decoder is pure: it never panics on
//! bad input and retains nothing from the payload.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::{Map, Value};
use smartcity_types::record::EventRecord;
use smartcity_types::schema::{FieldSpec, FieldType, SchemaRegistry};
use smartcity_types::StreamKind;
use thiserror::Error as ThisError;


/// Formats accepted for naive (zone-less) timestamps, interpreted as UTC.
const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum DecodeError {
    /// Not valid UTF-8 JSON, or not a JSON object.
    #[error("malformed payload: {error}")]
    MalformedPayload { error: String },

    #[error("missing required field '{field}'")]
    MissingRequiredField { field: String },

    #[error("field '{field}': expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: String,
    },
}

impl DecodeError {
    fn malformed(error: impl ToString) -> Self {
        Self::MalformedPayload {
            error: error.to_string(),
        }
    }

    fn type_mismatch(field: &str, expected: &FieldType, found: &Value) -> Self {
        Self::TypeMismatch {
            field: field.to_string(),
            expected: expected.name(),
            found: describe(found),
        }
    }
}

/// Short description of a JSON value for error messages.
fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("boolean {b}"),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) if s.chars().count() > 32 => {
            format!("string {:?}...", s.chars().take(32).collect::<String>())
        }
        Value::String(s) => format!("string {s:?}"),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

/// Decodes JSON payloads into [`EventRecord`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonDecoder {
    registry: SchemaRegistry,
}

impl JsonDecoder {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self { registry }
    }

    /// Decodes `payload` as an event of stream `kind`.
    pub fn decode(&self, payload: &[u8], kind: StreamKind) -> Result<EventRecord, DecodeError> {
        let value: Value = serde_json::from_slice(payload).map_err(DecodeError::malformed)?;
        let Value::Object(object) = value else {
            return Err(DecodeError::malformed(format!(
                "expected a JSON object, found {}",
                describe(&value)
            )));
        };
        let schema = self.registry.schema_for(kind);
        let canonical = coerce_object(&object, schema.fields, "")?;
        EventRecord::from_canonical_json(kind, Value::Object(canonical))
            .map_err(DecodeError::malformed)
    }
}

fn coerce_object(
    object: &Map<String, Value>,
    fields: &[FieldSpec],
    prefix: &str,
) -> Result<Map<String, Value>, DecodeError> {
    let mut result = Map::with_capacity(fields.len());
    for field in fields {
        let qualified = format!("{prefix}{}", field.name);
        let value = match object.get(field.name) {
            None | Some(Value::Null) if field.nullable => Value::Null,
            None | Some(Value::Null) => {
                return Err(DecodeError::MissingRequiredField { field: qualified })
            }
            Some(value) => coerce_value(value, &field.field_type, &qualified)?,
        };
        result.insert(field.name.to_string(), value);
    }
    Ok(result)
}

fn coerce_value(value: &Value, field_type: &FieldType, field: &str) -> Result<Value, DecodeError> {
    let mismatch = || DecodeError::type_mismatch(field, field_type, value);
    match field_type {
        FieldType::String => match value {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(mismatch()),
        },
        FieldType::Double => {
            let double = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            double
                .filter(|d| d.is_finite())
                .map(Value::from)
                .ok_or_else(mismatch)
        }
        FieldType::Integer => {
            let integer = match value {
                Value::Number(n) => match n.as_i64() {
                    Some(i) => i32::try_from(i).ok(),
                    None => n.as_f64().and_then(integral_f64),
                },
                Value::String(s) => s.trim().parse::<i32>().ok(),
                _ => None,
            };
            integer.map(Value::from).ok_or_else(mismatch)
        }
        FieldType::Timestamp => {
            let timestamp = match value {
                Value::String(s) => parse_timestamp(s),
                Value::Number(n) => n.as_f64().and_then(epoch_seconds),
                _ => None,
            };
            timestamp
                .map(|ts| {
                    Value::String(
                        ts.trunc_subsecs(6)
                            .to_rfc3339_opts(SecondsFormat::AutoSi, true),
                    )
                })
                .ok_or_else(mismatch)
        }
        FieldType::Struct(fields) => match value {
            Value::Object(object) => Ok(Value::Object(coerce_object(
                object,
                fields,
                &format!("{field}."),
            )?)),
            _ => Err(mismatch()),
        },
    }
}

fn integral_f64(value: f64) -> Option<i32> {
    (value.fract() == 0.0 && value >= i32::MIN as f64 && value <= i32::MAX as f64)
        .then_some(value as i32)
}

fn epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    let micros = (seconds * 1_000_000.0).round();
    if !micros.is_finite() || micros.abs() >= i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp_micros(micros as i64)
}

/// Parses an RFC 3339 timestamp, or a naive `YYYY-MM-DD HH:MM:SS[.f]`
/// timestamp (with a space or `T` separator) taken to be UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
        .map(|naive| naive.and_utc())
}
