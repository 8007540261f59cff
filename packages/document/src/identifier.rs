//! Canonical identifiers.
//!
//! Every document is keyed in the target by a string derived from its
//! source `_id`. The same document is seen once by the bulk copy (native
//! id) and again by the change feed, where some drivers hand the key over
//! in a wrapped textual form such as `BsonString{value='abc'}` or
//! `BsonObjectId{value=65a1...}`. Both paths must land on the same key.

use crate::value::Value;

/// Returns the canonical target key for a source `_id` value.
///
/// Object ids become hex, wrapped textual forms are unwrapped, numbers use
/// their decimal text. Any other type falls back to its raw JSON text,
/// which is logged because two representations of one logical id could
/// disagree there.
#[must_use]
pub fn canonical_id(raw: &Value) -> String {
    match raw {
        Value::ObjectId(oid) => oid.to_hex(),
        Value::String(s) => normalize_text(s),
        Value::Int32(n) => n.to_string(),
        Value::Int64(n) => n.to_string(),
        Value::Double(d) => d.to_string(),
        other => {
            log::warn!(
                "No canonical form for {} identifier, using raw text",
                other.type_name()
            );
            match other.to_json() {
                serde_json::Value::String(s) => s,
                json => json.to_string(),
            }
        }
    }
}

/// Unwraps the textual forms a driver may produce for an identifier.
///
/// - `BsonString{value='abc'}` → `abc`
/// - `BsonObjectId{value=65a1...}` → `65a1...`
/// - `BsonInt64{value="7"}` → `7`
///
/// Text that matches neither pattern is returned unchanged.
#[must_use]
pub fn normalize_text(raw: &str) -> String {
    if raw.starts_with("BsonString")
        && let Some(start) = raw.find("value='").map(|i| i + "value='".len())
        && let Some(end) = raw.rfind('\'')
        && end > start
    {
        return raw[start..end].to_string();
    }

    if raw.starts_with("Bson")
        && let Some(start) = raw.find("value=").map(|i| i + "value=".len())
        && let Some(len) = raw[start..].find('}')
        && len > 0
    {
        return strip_quotes(&raw[start..start + len]).to_string();
    }

    raw.to_string()
}

fn strip_quotes(value: &str) -> &str {
    for quote in ['\'', '"'] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
