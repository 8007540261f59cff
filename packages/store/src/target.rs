//! The target store facade.

use std::fmt;

use async_trait::async_trait;

use crate::StoreError;

/// A resolved `bucket.scope.collection` in the target store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionHandle {
    /// Bucket name.
    pub bucket: String,
    /// Scope name.
    pub scope: String,
    /// Collection name.
    pub collection: String,
}

impl CollectionHandle {
    #[must_use]
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for CollectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.bucket, self.scope, self.collection)
    }
}

/// Write access to the store being migrated into.
///
/// Documents are keyed by a string id and stored as JSON objects.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Resolves a collection, failing if it cannot be opened.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the collection is unreachable.
    async fn resolve_collection(
        &self,
        bucket: &str,
        scope: &str,
        collection: &str,
    ) -> Result<CollectionHandle, StoreError>;

    /// Inserts or replaces the document stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write was not committed.
    async fn upsert(
        &self,
        handle: &CollectionHandle,
        id: &str,
        body: &serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Removes the document stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] with kind [`crate::StoreErrorKind::NotFound`]
    /// if there is no such document, or another kind if the removal failed.
    async fn remove(&self, handle: &CollectionHandle, id: &str) -> Result<(), StoreError>;

    /// Whether a document is stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the lookup failed.
    async fn exists(&self, handle: &CollectionHandle, id: &str) -> Result<bool, StoreError>;

    /// Cheap liveness probe.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Counts documents whose `tag_field` equals `tag_value`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query failed.
    async fn count_by_tag(
        &self,
        handle: &CollectionHandle,
        tag_field: &str,
        tag_value: &str,
    ) -> Result<u64, StoreError>;

    /// Deletes every document whose `tag_field` equals `tag_value` and
    /// returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the delete failed.
    async fn bulk_delete_by_tag(
        &self,
        handle: &CollectionHandle,
        tag_field: &str,
        tag_value: &str,
    ) -> Result<u64, StoreError>;
}
