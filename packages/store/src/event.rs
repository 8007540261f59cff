//! Change feed events.

use std::fmt;

use docsync_document::{Document, Value};
use futures::stream::BoxStream;
use strum_macros::{AsRefStr, Display};

use crate::StoreError;

/// A stream of change events. Ends when the feed is closed.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, StoreError>>;

/// The kind of change a feed reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "camelCase")]
pub enum ChangeOperation {
    /// A new document.
    Insert,
    /// A partial update; the event carries the post-image.
    Update,
    /// A full replacement.
    Replace,
    /// A removal.
    Delete,
    /// The collection was dropped.
    Drop,
    /// The whole database was dropped.
    DropDatabase,
    /// The collection was renamed.
    Rename,
    /// The feed can no longer continue.
    Invalidate,
}

/// The database and, for collection-level events, the collection an event
/// refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    /// Database name.
    pub database: String,
    /// Collection name. `None` for database-level events.
    pub collection: Option<String>,
}

impl Namespace {
    /// Namespace of a collection.
    #[must_use]
    pub fn collection(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: Some(collection.into()),
        }
    }

    /// Namespace of a whole database.
    #[must_use]
    pub fn database(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: None,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.collection {
            Some(collection) => write!(f, "{}.{collection}", self.database),
            None => f.write_str(&self.database),
        }
    }
}

/// One event from a change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// What happened.
    pub operation: ChangeOperation,
    /// Where it happened.
    pub namespace: Namespace,
    /// The `_id` of the affected document, for document-level events.
    pub document_key: Option<Value>,
    /// The post-image for inserts, updates and replaces.
    pub full_document: Option<Document>,
}

impl ChangeEvent {
    /// A document-level event.
    #[must_use]
    pub const fn document(
        operation: ChangeOperation,
        namespace: Namespace,
        document_key: Value,
        full_document: Option<Document>,
    ) -> Self {
        Self {
            operation,
            namespace,
            document_key: Some(document_key),
            full_document,
        }
    }

    /// A collection- or database-level event with no document.
    #[must_use]
    pub const fn structural(operation: ChangeOperation, namespace: Namespace) -> Self {
        Self {
            operation,
            namespace,
            document_key: None,
            full_document: None,
        }
    }
}
