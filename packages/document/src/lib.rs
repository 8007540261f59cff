#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Source document model and the transformations applied before a document
//! is written to the target store.
//!
//! Documents arrive from the source as [`Document`] maps whose values may
//! carry source-native types (timestamps, object ids, binary, decimals,
//! regular expressions). Before a write they are stripped of `_id`, tagged
//! with their originating collection, and run through [`coerce`] so that
//! every value has a plain JSON representation. The target key is derived
//! from `_id` by [`identifier::canonical_id`].

pub mod coerce;
pub mod extjson;
pub mod identifier;
pub mod prepare;
pub mod value;

pub use prepare::{ID_FIELD, PreparedDocument, document_id, prepare_for_target};
pub use value::{Document, ObjectId, Value};

/// Errors that can occur while decoding or preparing documents.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// The document has no `_id` field and cannot be keyed in the target.
    #[error("Document has no `_id` field")]
    MissingId,

    /// A string could not be decoded as a 12-byte object id.
    #[error("Invalid object id {value:?}")]
    InvalidObjectId {
        /// The offending text.
        value: String,
    },

    /// An extended JSON value was malformed.
    #[error("Invalid extended JSON: {message}")]
    InvalidExtendedJson {
        /// Description of what went wrong.
        message: String,
    },

    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}
