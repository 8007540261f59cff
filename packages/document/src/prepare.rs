//! Turns a source document into the id and body written to the target.

use crate::DocumentError;
use crate::coerce::coerce_document;
use crate::identifier::canonical_id;
use crate::value::{Document, Value, document_to_json};

/// Name of the source-native identifier field.
pub const ID_FIELD: &str = "_id";

/// A document ready to be upserted into the target.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedDocument {
    /// Canonical target key.
    pub id: String,
    /// Coerced body: `_id` stripped, collection tag added.
    pub body: serde_json::Value,
}

/// Strips `_id`, tags the document with `tag_field = source_collection`,
/// coerces it, and derives the canonical target key.
///
/// # Errors
///
/// Returns [`DocumentError::MissingId`] if the document has no `_id`.
pub fn prepare_for_target(
    document: &Document,
    tag_field: &str,
    source_collection: &str,
) -> Result<PreparedDocument, DocumentError> {
    let raw_id = document.get(ID_FIELD).ok_or(DocumentError::MissingId)?;
    let id = canonical_id(raw_id);

    let mut body: Document = document
        .iter()
        .filter(|(key, _)| key.as_str() != ID_FIELD)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    body.insert(
        tag_field.to_string(),
        Value::String(source_collection.to_string()),
    );
    coerce_document(&mut body);

    Ok(PreparedDocument {
        id,
        body: document_to_json(&body),
    })
}

/// Returns the canonical key of a document without preparing its body.
///
/// # Errors
///
/// Returns [`DocumentError::MissingId`] if the document has no `_id`.
pub fn document_id(document: &Document) -> Result<String, DocumentError> {
    document
        .get(ID_FIELD)
        .map(canonical_id)
        .ok_or(DocumentError::MissingId)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ObjectId;

    #[test]
    fn strips_id_and_tags_collection() {
        let mut doc = Document::new();
        doc.insert(
            ID_FIELD.to_string(),
            Value::ObjectId(ObjectId::parse_str("65a1f0c2e4b0a1b2c3d4e5f6").unwrap()),
        );
        doc.insert("name".to_string(), Value::from("widget"));
        doc.insert("blob".to_string(), Value::Binary(vec![0, 1, 2]));

        let prepared = prepare_for_target(&doc, "sourceCollection", "products").unwrap();

        assert_eq!(prepared.id, "65a1f0c2e4b0a1b2c3d4e5f6");
        assert_eq!(
            prepared.body,
            serde_json::json!({
                "name": "widget",
                "blob": "AAEC",
                "sourceCollection": "products",
            })
        );
    }

    #[test]
    fn tag_overrides_existing_field() {
        let mut doc = Document::new();
        doc.insert(ID_FIELD.to_string(), Value::from("a"));
        doc.insert("sourceCollection".to_string(), Value::from("stale"));

        let prepared = prepare_for_target(&doc, "sourceCollection", "orders").unwrap();
        assert_eq!(prepared.body["sourceCollection"], "orders");
    }

    #[test]
    fn missing_id_is_an_error() {
        let doc = Document::new();
        assert!(matches!(
            prepare_for_target(&doc, "sourceCollection", "orders"),
            Err(DocumentError::MissingId)
        ));
    }
}
