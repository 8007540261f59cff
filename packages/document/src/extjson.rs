//! Decoding of extended JSON exports into [`Document`]s.
//!
//! Source dumps use the canonical/relaxed extended JSON wrappers for types
//! plain JSON cannot express:
//!
//! ```json
//! {
//!   "_id": {"$oid": "65a1f0c2e4b0a1b2c3d4e5f6"},
//!   "created": {"$date": "2024-01-15T14:30:00Z"},
//!   "price": {"$numberDecimal": "19.99"},
//!   "avatar": {"$binary": {"base64": "aGVsbG8=", "subType": "00"}},
//!   "match": {"$regularExpression": {"pattern": "^a", "options": "i"}}
//! }
//! ```
//!
//! Plain JSON integers become `int32` when they fit and `int64` otherwise;
//! other numbers become doubles.

use base64::Engine as _;
use chrono::{DateTime, Utc};

use crate::DocumentError;
use crate::value::{Document, ObjectId, Value};

/// Parses a file body holding either one JSON array of documents or one
/// document per line.
///
/// # Errors
///
/// Returns [`DocumentError`] if the text is not valid JSON or a document
/// uses a malformed extended JSON wrapper.
pub fn documents_from_str(text: &str) -> Result<Vec<Document>, DocumentError> {
    let trimmed = text.trim_start();

    if trimmed.starts_with('[') {
        let values: Vec<serde_json::Value> = serde_json::from_str(trimmed)?;
        return values.into_iter().map(document_from_json).collect();
    }

    trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| document_from_json(serde_json::from_str(line)?))
        .collect()
}

/// Decodes a JSON object into a [`Document`].
///
/// # Errors
///
/// Returns [`DocumentError::InvalidExtendedJson`] if `json` is not an
/// object or contains a malformed wrapper.
pub fn document_from_json(json: serde_json::Value) -> Result<Document, DocumentError> {
    match value_from_json(json)? {
        Value::Document(doc) => Ok(doc),
        other => Err(invalid(format!(
            "expected a document, found {}",
            other.type_name()
        ))),
    }
}

/// Decodes a single extended JSON value.
///
/// # Errors
///
/// Returns [`DocumentError`] if a wrapper is malformed.
pub fn value_from_json(json: serde_json::Value) -> Result<Value, DocumentError> {
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => number_value(&n)?,
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(value_from_json)
                .collect::<Result<_, _>>()?,
        ),
        serde_json::Value::Object(map) => {
            if let Some(wrapped) = wrapper_value(&map)? {
                return Ok(wrapped);
            }
            Value::Document(
                map.into_iter()
                    .map(|(key, value)| Ok((key, value_from_json(value)?)))
                    .collect::<Result<_, DocumentError>>()?,
            )
        }
    })
}

fn number_value(n: &serde_json::Number) -> Result<Value, DocumentError> {
    if let Some(i) = n.as_i64() {
        return Ok(i32::try_from(i).map_or(Value::Int64(i), Value::Int32));
    }
    n.as_f64()
        .map(Value::Double)
        .ok_or_else(|| invalid(format!("number {n} out of range")))
}

/// Recognizes `$`-prefixed wrapper objects. Returns `Ok(None)` for ordinary
/// documents.
fn wrapper_value(
    map: &serde_json::Map<String, serde_json::Value>,
) -> Result<Option<Value>, DocumentError> {
    let Some(key) = map.keys().next().filter(|k| k.starts_with('$')) else {
        return Ok(None);
    };

    let value = match (key.as_str(), map.len()) {
        ("$oid", 1) => Value::ObjectId(ObjectId::parse_str(expect_str(&map["$oid"], "$oid")?)?),
        ("$date", 1) => Value::DateTime(date_value(&map["$date"])?),
        ("$numberDecimal", 1) => Value::Decimal128(expect_str(&map[key], key)?.to_string()),
        ("$numberLong", 1) => Value::Int64(
            expect_str(&map[key], key)?
                .parse()
                .map_err(|e| invalid(format!("$numberLong: {e}")))?,
        ),
        ("$numberInt", 1) => Value::Int32(
            expect_str(&map[key], key)?
                .parse()
                .map_err(|e| invalid(format!("$numberInt: {e}")))?,
        ),
        ("$numberDouble", 1) => Value::Double(double_value(expect_str(&map[key], key)?)?),
        ("$binary", 1) => {
            let inner = map[key]
                .as_object()
                .ok_or_else(|| invalid("$binary must be an object".to_string()))?;
            let encoded = inner
                .get("base64")
                .ok_or_else(|| invalid("$binary.base64 missing".to_string()))?;
            Value::Binary(decode_base64(expect_str(encoded, "$binary.base64")?)?)
        }
        ("$binary" | "$type", 2) if map.contains_key("$binary") && map.contains_key("$type") => {
            Value::Binary(decode_base64(expect_str(&map["$binary"], "$binary")?)?)
        }
        ("$regularExpression", 1) => {
            let inner = map[key]
                .as_object()
                .ok_or_else(|| invalid("$regularExpression must be an object".to_string()))?;
            Value::Regex {
                pattern: inner
                    .get("pattern")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                options: inner
                    .get("options")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }
        }
        ("$regex" | "$options", _) if map.contains_key("$regex") => Value::Regex {
            pattern: expect_str(&map["$regex"], "$regex")?.to_string(),
            options: map
                .get("$options")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        _ => return Ok(None),
    };

    Ok(Some(value))
}

fn date_value(json: &serde_json::Value) -> Result<DateTime<Utc>, DocumentError> {
    match json {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| invalid(format!("$date {s:?}: {e}"))),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| invalid(format!("$date {n} out of range"))),
        serde_json::Value::Object(inner) => {
            let millis: i64 = inner
                .get("$numberLong")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| invalid("$date object must hold $numberLong".to_string()))?
                .parse()
                .map_err(|e| invalid(format!("$date.$numberLong: {e}")))?;
            DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| invalid(format!("$date {millis} out of range")))
        }
        other => Err(invalid(format!("unsupported $date value {other}"))),
    }
}

fn double_value(s: &str) -> Result<f64, DocumentError> {
    match s {
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        "NaN" => Ok(f64::NAN),
        _ => s
            .parse()
            .map_err(|e| invalid(format!("$numberDouble {s:?}: {e}"))),
    }
}

fn decode_base64(s: &str) -> Result<Vec<u8>, DocumentError> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| invalid(format!("base64: {e}")))
}

fn expect_str<'a>(json: &'a serde_json::Value, field: &str) -> Result<&'a str, DocumentError> {
    json.as_str()
        .ok_or_else(|| invalid(format!("{field} must be a string")))
}

fn invalid(message: String) -> DocumentError {
    DocumentError::InvalidExtendedJson { message }
}
