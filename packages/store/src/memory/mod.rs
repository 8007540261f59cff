//! In-process reference stores.
//!
//! [`MemorySource`] holds databases of [`docsync_document::Document`]s,
//! publishes a [`crate::ChangeEvent`] for every mutation, and can simulate
//! outages. [`MemoryTarget`] holds JSON bodies per collection, can reject
//! chosen ids, go unavailable, and write itself out as JSON files.

mod source;
mod target;

pub use source::MemorySource;
pub use target::MemoryTarget;

/// Errors from seeding or snapshotting the in-memory stores.
#[derive(Debug, thiserror::Error)]
pub enum MemoryStoreError {
    /// I/O error (file read/write).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A seed file held an undecodable document.
    #[error("Document error in {path}: {source}")]
    Document {
        /// The offending file.
        path: String,
        /// The decoding failure.
        source: docsync_document::DocumentError,
    },
}
