//! Type coercion for values with no native target representation.
//!
//! | Source type | Coerced form |
//! |---|---|
//! | datetime | ISO-8601 UTC string, millisecond precision |
//! | object id | 24-char lowercase hex |
//! | binary | standard base64 |
//! | decimal128 | decimal text |
//! | regex | pattern text |
//!
//! Coercion recurses into nested documents and arrays. Every coerced value
//! is a plain string, so running coercion a second time changes nothing.

use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::value::{Document, Value};

/// Coerces every value of `document` in place.
pub fn coerce_document(document: &mut Document) {
    for value in document.values_mut() {
        coerce_in_place(value);
    }
}

/// Returns the coerced form of `value`.
#[must_use]
pub fn coerce_value(mut value: Value) -> Value {
    coerce_in_place(&mut value);
    value
}

fn coerce_in_place(value: &mut Value) {
    match value {
        Value::Document(doc) => coerce_document(doc),
        Value::Array(items) => items.iter_mut().for_each(coerce_in_place),
        other => {
            if let Some(text) = native_text(other) {
                *other = Value::String(text);
            }
        }
    }
}

/// Returns the string form of a source-native scalar, or `None` for values
/// that already have a target representation.
#[must_use]
pub fn native_text(value: &Value) -> Option<String> {
    match value {
        Value::DateTime(dt) => Some(format_timestamp(dt)),
        Value::ObjectId(oid) => Some(oid.to_hex()),
        Value::Binary(bytes) => Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
        Value::Decimal128(text) => Some(text.clone()),
        Value::Regex { pattern, .. } => Some(pattern.clone()),
        _ => None,
    }
}

/// Formats a timestamp the way coerced documents store it
/// (`2024-01-15T14:30:00.000Z`).
#[must_use]
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;
    use crate::value::ObjectId;

    fn sample() -> Document {
        let oid = ObjectId::parse_str("65a1f0c2e4b0a1b2c3d4e5f6").unwrap();
        let when = Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap();

        let mut address = Document::new();
        address.insert("since".to_string(), Value::DateTime(when));
        address.insert("city".to_string(), Value::from("Chicago"));

        let mut doc = Document::new();
        doc.insert("owner".to_string(), Value::ObjectId(oid));
        doc.insert("created".to_string(), Value::DateTime(when));
        doc.insert("avatar".to_string(), Value::Binary(b"hello".to_vec()));
        doc.insert(
            "price".to_string(),
            Value::Decimal128("1234.5678901234567890".to_string()),
        );
        doc.insert(
            "match".to_string(),
            Value::Regex {
                pattern: "^ab+c$".to_string(),
                options: "i".to_string(),
            },
        );
        doc.insert("address".to_string(), Value::Document(address));
        doc.insert(
            "history".to_string(),
            Value::Array(vec![
                Value::DateTime(when),
                Value::Int32(7),
                Value::Array(vec![Value::ObjectId(oid)]),
            ]),
        );
        doc.insert("count".to_string(), Value::Int64(42));
        doc
    }

    #[test]
    fn coerces_native_scalars() {
        let mut doc = sample();
        coerce_document(&mut doc);

        assert_eq!(doc["owner"], Value::from("65a1f0c2e4b0a1b2c3d4e5f6"));
        assert_eq!(doc["created"], Value::from("2024-01-15T14:30:00.000Z"));
        assert_eq!(doc["avatar"], Value::from("aGVsbG8="));
        assert_eq!(doc["price"], Value::from("1234.5678901234567890"));
        assert_eq!(doc["match"], Value::from("^ab+c$"));
        assert_eq!(doc["count"], Value::Int64(42));
    }

    #[test]
    fn recurses_into_documents_and_arrays() {
        let mut doc = sample();
        coerce_document(&mut doc);

        let Value::Document(address) = &doc["address"] else {
            panic!("address should stay a document");
        };
        assert_eq!(address["since"], Value::from("2024-01-15T14:30:00.000Z"));

        assert_eq!(
            doc["history"],
            Value::Array(vec![
                Value::from("2024-01-15T14:30:00.000Z"),
                Value::Int32(7),
                Value::Array(vec![Value::from("65a1f0c2e4b0a1b2c3d4e5f6")]),
            ])
        );
    }

    #[test]
    fn coercion_is_idempotent() {
        let once = coerce_value(Value::Document(sample()));
        let twice = coerce_value(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn coerced_json_matches_value_json() {
        let native = Value::Document(sample());
        let coerced = coerce_value(native.clone());
        assert_eq!(native.to_json(), coerced.to_json());
    }
}
