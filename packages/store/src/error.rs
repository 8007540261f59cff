//! Typed store errors.

use strum_macros::{AsRefStr, Display};

/// Which store an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum StoreSide {
    /// The store being migrated from.
    Source,
    /// The store being migrated into.
    Target,
}

/// Classification of a store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum StoreErrorKind {
    /// The operation timed out.
    Timeout,
    /// The operation timed out and may or may not have been applied.
    AmbiguousTimeout,
    /// The request was canceled before completing.
    RequestCanceled,
    /// No connection could be established in time.
    ConnectionTimeout,
    /// The operation was interrupted server-side.
    Interrupted,
    /// The addressed document does not exist.
    NotFound,
    /// The store does not support the requested feature.
    Unsupported,
    /// Any other failure. Never retried.
    Other,
}

/// An error returned by a [`crate::SourceStore`] or [`crate::TargetStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{side} store {kind}: {message}")]
pub struct StoreError {
    /// Which store failed.
    pub side: StoreSide,
    /// What kind of failure this is.
    pub kind: StoreErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl StoreError {
    /// Creates an error.
    #[must_use]
    pub fn new(side: StoreSide, kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            side,
            kind,
            message: message.into(),
        }
    }

    /// Creates an error attributed to the source store.
    #[must_use]
    pub fn on_source(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self::new(StoreSide::Source, kind, message)
    }

    /// Creates an error attributed to the target store.
    #[must_use]
    pub fn on_target(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self::new(StoreSide::Target, kind, message)
    }

    /// Returns `true` for transient connectivity failures that are worth
    /// retrying and that put a unit into the connection-lost state.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            StoreErrorKind::Timeout
                | StoreErrorKind::AmbiguousTimeout
                | StoreErrorKind::RequestCanceled
                | StoreErrorKind::ConnectionTimeout
        )
    }

    /// Returns `true` for timeouts and server-side interruptions. This is
    /// the wider set retried by the tagged bulk delete.
    #[must_use]
    pub const fn is_timeout_or_interrupt(&self) -> bool {
        self.is_retryable() || matches!(self.kind, StoreErrorKind::Interrupted)
    }

    /// Returns `true` if the addressed document was absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind, StoreErrorKind::NotFound)
    }
}
