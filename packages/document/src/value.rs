//! Document value model.
//!
//! [`Value`] mirrors the value space of the source store, including the
//! types that have no native representation in the target. Conversion to
//! JSON goes through the same rendering rules as [`crate::coerce`], so a
//! coerced document and its JSON form always agree.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::DocumentError;

/// A document: field name to value.
pub type Document = BTreeMap<String, Value>;

/// A 12-byte source-native object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// Creates an object id from its raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn bytes(&self) -> [u8; 12] {
        self.0
    }

    /// Returns the 24-character lowercase hex encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 24-character hex string.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::InvalidObjectId`] if the text is not valid
    /// hex or does not decode to exactly 12 bytes.
    pub fn parse_str(s: &str) -> Result<Self, DocumentError> {
        let invalid = || DocumentError::InvalidObjectId {
            value: s.to_string(),
        };
        let bytes = hex::decode(s).map_err(|_| invalid())?;
        let bytes: [u8; 12] = bytes.try_into().map_err(|_| invalid())?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A value inside a source document.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// 32-bit integer.
    Int32(i32),
    /// 64-bit integer.
    Int64(i64),
    /// IEEE 754 double.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Source-native timestamp.
    DateTime(DateTime<Utc>),
    /// Source-native 12-byte identifier.
    ObjectId(ObjectId),
    /// Raw binary blob.
    Binary(Vec<u8>),
    /// High-precision decimal, kept as its exact decimal text.
    Decimal128(String),
    /// Regular expression.
    Regex {
        /// The pattern text.
        pattern: String,
        /// Option flags (e.g. `"i"`).
        options: String,
    },
    /// Nested document.
    Document(Document),
    /// Sequence of values.
    Array(Vec<Self>),
}

impl Value {
    /// Returns a short name for the value's type, used in log messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::DateTime(_) => "datetime",
            Self::ObjectId(_) => "objectId",
            Self::Binary(_) => "binary",
            Self::Decimal128(_) => "decimal128",
            Self::Regex { .. } => "regex",
            Self::Document(_) => "document",
            Self::Array(_) => "array",
        }
    }

    /// Returns `true` if this value has no native target representation
    /// and must be rewritten by coercion.
    #[must_use]
    pub const fn is_source_native(&self) -> bool {
        matches!(
            self,
            Self::DateTime(_)
                | Self::ObjectId(_)
                | Self::Binary(_)
                | Self::Decimal128(_)
                | Self::Regex { .. }
        )
    }

    /// Returns the string content if this is a [`Value::String`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Renders the value as JSON. Source-native values are rendered with
    /// the coercion rules; non-finite doubles become `null`.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        if let Some(text) = crate::coerce::native_text(self) {
            return serde_json::Value::String(text);
        }

        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int32(n) => serde_json::Value::from(*n),
            Self::Int64(n) => serde_json::Value::from(*n),
            Self::Double(d) => serde_json::Number::from_f64(*d)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Document(doc) => document_to_json(doc),
            Self::Array(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            _ => serde_json::Value::Null,
        }
    }
}

/// Renders a whole document as a JSON object.
#[must_use]
pub fn document_to_json(document: &Document) -> serde_json::Value {
    serde_json::Value::Object(
        document
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect(),
    )
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Int32(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int64(n)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Self::Double(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<ObjectId> for Value {
    fn from(oid: ObjectId) -> Self {
        Self::ObjectId(oid)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::DateTime(dt)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Self::Document(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_hex_round_trip() {
        let oid = ObjectId::parse_str("65a1f0c2e4b0a1b2c3d4e5f6").unwrap();
        assert_eq!(oid.to_hex(), "65a1f0c2e4b0a1b2c3d4e5f6");
        assert_eq!(oid.to_string(), "65a1f0c2e4b0a1b2c3d4e5f6");
    }

    #[test]
    fn rejects_short_object_id() {
        assert!(ObjectId::parse_str("65a1f0").is_err());
        assert!(ObjectId::parse_str("not hex at all, not hex at").is_err());
    }

    #[test]
    fn non_finite_double_renders_null() {
        assert_eq!(Value::Double(f64::NAN).to_json(), serde_json::Value::Null);
        assert_eq!(Value::Double(1.5).to_json(), serde_json::json!(1.5));
    }

    #[test]
    fn nested_document_renders_object() {
        let mut inner = Document::new();
        inner.insert("n".to_string(), Value::Int32(3));
        let mut doc = Document::new();
        doc.insert("inner".to_string(), Value::Document(inner));
        doc.insert(
            "tags".to_string(),
            Value::Array(vec![Value::from("a"), Value::Null]),
        );

        assert_eq!(
            document_to_json(&doc),
            serde_json::json!({"inner": {"n": 3}, "tags": ["a", null]})
        );
    }
}
