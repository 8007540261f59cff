//! The source store facade.

use async_trait::async_trait;
use docsync_document::Document;

use crate::{ChangeStream, StoreError};

/// Read access to the store being migrated from.
///
/// Implementations must classify every failure into a
/// [`crate::StoreErrorKind`] before returning it.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Counts the documents currently in `database.collection`. Unknown
    /// collections count as zero.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the count cannot be taken.
    async fn count(&self, database: &str, collection: &str) -> Result<u64, StoreError>;

    /// Fetches up to `limit` documents starting at `offset`, in the
    /// collection's natural cursor order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the batch cannot be read.
    async fn fetch_batch(
        &self,
        database: &str,
        collection: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Document>, StoreError>;

    /// Cheap liveness probe.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Opens a change feed for one collection, positioned at "now", with
    /// full post-images on update.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the feed cannot be opened.
    async fn watch_collection(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<ChangeStream, StoreError>;

    /// Opens a change feed covering every collection of a database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the feed cannot be opened.
    async fn watch_database(&self, database: &str) -> Result<ChangeStream, StoreError>;

    /// Whether this deployment can produce change feeds at all. Standalone
    /// (non-replicated) deployments cannot.
    async fn supports_change_streams(&self) -> bool {
        true
    }
}
