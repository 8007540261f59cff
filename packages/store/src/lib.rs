#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Facades over the source and target document stores.
//!
//! The migration engine only ever talks to [`SourceStore`] and
//! [`TargetStore`]. Every failure crossing these traits is a [`StoreError`]
//! whose [`StoreErrorKind`] is decided here, at the boundary, so callers can
//! ask [`StoreError::is_retryable`] instead of inspecting driver errors.
//!
//! [`memory`] provides in-process implementations of both traits, used by
//! the CLI and by the engine's tests.

pub mod error;
pub mod event;
pub mod memory;
pub mod source;
pub mod target;

pub use error::{StoreError, StoreErrorKind, StoreSide};
pub use event::{ChangeEvent, ChangeOperation, ChangeStream, Namespace};
pub use source::SourceStore;
pub use target::{CollectionHandle, TargetStore};
