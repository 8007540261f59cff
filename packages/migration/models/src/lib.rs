#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Data types shared by the migration engine, checkpoint stores, progress
//! sinks and the CLI.
//!
//! A [`TransferRequest`] names one migration unit: a source collection and
//! the target collection it is copied into. While a unit runs, the engine
//! emits [`MigrationProgress`] events whose [`MigrationStatus`] follows
//!
//! ```text
//! INITIALIZED/STARTED -> IN_PROGRESS -> {CONNECTION_LOST -> RESUMED}* -> COMPLETED
//!                                    \-> ERROR
//!                                    \-> COLLECTION_DROPPED
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// One migration unit: which source collection goes into which target
/// collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Source database name.
    pub source_database: String,
    /// Source collection name.
    pub source_collection: String,
    /// Target bucket.
    pub target_bucket: String,
    /// Target scope.
    pub target_scope: String,
    /// Target collection.
    pub target_collection: String,
}

impl TransferRequest {
    #[must_use]
    pub fn new(
        source_database: impl Into<String>,
        source_collection: impl Into<String>,
        target_bucket: impl Into<String>,
        target_scope: impl Into<String>,
        target_collection: impl Into<String>,
    ) -> Self {
        Self {
            source_database: source_database.into(),
            source_collection: source_collection.into(),
            target_bucket: target_bucket.into(),
            target_scope: target_scope.into(),
            target_collection: target_collection.into(),
        }
    }

    /// The key all per-unit runtime state is indexed by:
    /// `"{source_database}.{source_collection}"`.
    #[must_use]
    pub fn migration_key(&self) -> String {
        migration_key(&self.source_database, &self.source_collection)
    }
}

impl fmt::Display for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}.{}",
            self.source_database,
            self.source_collection,
            self.target_bucket,
            self.target_scope,
            self.target_collection
        )
    }
}

/// Builds a migration key from its parts.
#[must_use]
pub fn migration_key(database: &str, collection: &str) -> String {
    format!("{database}.{collection}")
}

/// Lifecycle status carried by a [`MigrationProgress`] event.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    /// Source count taken.
    Initialized,
    /// Bulk copy starting.
    Started,
    /// Periodic bulk copy progress.
    InProgress,
    /// A store became unreachable.
    ConnectionLost,
    /// Both stores are reachable again.
    Resumed,
    /// Bulk copy finished.
    Completed,
    /// Non-retryable failure outside a single document.
    Error,
    /// The source collection was dropped and its documents removed.
    CollectionDropped,
    /// A live insert, update or replace was applied.
    CdcInsert,
    /// A live delete was applied.
    CdcDelete,
}

impl MigrationStatus {
    /// Whether no further events follow for the same run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::CollectionDropped)
    }
}

/// Which part of the engine produced an event.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    /// The bulk copy.
    Migration,
    /// Live change capture.
    Cdc,
    /// Drop handling.
    Drop,
}

/// A progress event for one migration unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationProgress {
    pub source_database: String,
    pub source_collection: String,
    /// Documents committed to the target so far.
    pub transferred: u64,
    /// Source document count taken at start.
    pub total: u64,
    /// `total` adjusted by live inserts and deletes.
    pub current_total: u64,
    pub status: MigrationStatus,
    pub operation_type: OperationType,
    /// Number of changes this event reports (1 for live deltas).
    pub change_count: u64,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
    pub elapsed_ms: u64,
    /// Documents per second.
    pub speed: f64,
}

impl MigrationProgress {
    /// Creates an event with zeroed counters.
    #[must_use]
    pub fn new(
        source_database: impl Into<String>,
        source_collection: impl Into<String>,
        status: MigrationStatus,
        operation_type: OperationType,
    ) -> Self {
        Self {
            source_database: source_database.into(),
            source_collection: source_collection.into(),
            transferred: 0,
            total: 0,
            current_total: 0,
            status,
            operation_type,
            change_count: 0,
            details: BTreeMap::new(),
            elapsed_ms: 0,
            speed: 0.0,
        }
    }

    /// Creates an event for the unit described by `request`.
    #[must_use]
    pub fn for_request(
        request: &TransferRequest,
        status: MigrationStatus,
        operation_type: OperationType,
    ) -> Self {
        Self::new(
            request.source_database.clone(),
            request.source_collection.clone(),
            status,
            operation_type,
        )
    }

    #[must_use]
    pub const fn with_counts(mut self, transferred: u64, total: u64, current_total: u64) -> Self {
        self.transferred = transferred;
        self.total = total;
        self.current_total = current_total;
        self
    }

    #[must_use]
    pub const fn with_change_count(mut self, change_count: u64) -> Self {
        self.change_count = change_count;
        self
    }

    #[must_use]
    pub const fn with_timing(mut self, elapsed_ms: u64, speed: f64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self.speed = speed;
        self
    }

    #[must_use]
    pub fn with_detail(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// The migration key of the unit this event belongs to.
    #[must_use]
    pub fn migration_key(&self) -> String {
        migration_key(&self.source_database, &self.source_collection)
    }
}

/// Reported after the documents of a dropped source collection have been
/// removed from the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropNotification {
    /// Database of the unit that observed the drop.
    pub database: String,
    /// Collection of the unit that observed the drop.
    pub collection: String,
    /// The collection that was dropped.
    pub dropped_collection: String,
    /// Target documents removed.
    pub deleted_count: u64,
}

/// Stage label written by the document transfer.
pub const DOCUMENT_TRANSFER_STAGE: &str = "DOCUMENT_TRANSFER";

/// Durable progress marker for a resumable transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    /// Which transfer stage wrote this checkpoint.
    pub stage: String,
    pub success_count: u64,
    pub failure_count: u64,
    /// Identifiers of items already handled. Part of the shared checkpoint
    /// schema; the document transfer does not fill it.
    #[serde(default)]
    pub processed_ids: BTreeSet<String>,
    /// Canonical id of the last document committed in cursor order.
    pub last_processed_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// An empty document transfer checkpoint.
    #[must_use]
    pub fn document_transfer(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stage: DOCUMENT_TRANSFER_STAGE.to_string(),
            success_count: 0,
            failure_count: 0,
            processed_ids: BTreeSet::new(),
            last_processed_id: None,
            updated_at: Utc::now(),
        }
    }
}

/// Tuning knobs for the migration engine. Every field has a default, so a
/// partial config section deserializes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Documents fetched per batch.
    pub batch_size: u64,
    /// Maximum in-flight upserts per batch.
    pub concurrency: usize,
    /// Emit `IN_PROGRESS` every this many committed documents.
    pub progress_interval: u64,
    /// Attempts for count, resolve and fetch operations.
    pub operation_retries: u32,
    /// Base delay for those attempts; attempt `n` waits `base * n^2`.
    pub operation_retry_base_ms: u64,
    /// Attempts per document upsert.
    pub upsert_retries: u32,
    /// First backoff for non-connectivity upsert failures; doubles per
    /// attempt.
    pub upsert_backoff_ms: u64,
    /// Interval between health probes while a unit is connection-lost.
    pub health_check_interval_ms: u64,
    /// Attempts for the tagged bulk delete after a drop.
    pub drop_delete_retries: u32,
    /// Linear backoff step for the tagged bulk delete.
    pub drop_delete_backoff_ms: u64,
    /// Field added to every target document naming its source collection.
    pub tag_field: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 4000,
            concurrency: 3000,
            progress_interval: 1000,
            operation_retries: 5,
            operation_retry_base_ms: 1000,
            upsert_retries: 3,
            upsert_backoff_ms: 500,
            health_check_interval_ms: 5000,
            drop_delete_retries: 5,
            drop_delete_backoff_ms: 1000,
            tag_field: "sourceCollection".to_string(),
        }
    }
}

impl MigrationConfig {
    #[must_use]
    pub const fn operation_retry_base(&self) -> Duration {
        Duration::from_millis(self.operation_retry_base_ms)
    }

    #[must_use]
    pub const fn upsert_backoff(&self) -> Duration {
        Duration::from_millis(self.upsert_backoff_ms)
    }

    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    #[must_use]
    pub const fn drop_delete_backoff(&self) -> Duration {
        Duration::from_millis(self.drop_delete_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use super::*;

    #[test]
    fn migration_key_joins_database_and_collection() {
        let request = TransferRequest::new("shop", "orders", "b", "s", "c");
        assert_eq!(request.migration_key(), "shop.orders");
        assert_eq!(request.to_string(), "shop.orders -> b.s.c");
    }

    #[test]
    fn status_uses_screaming_snake_case() {
        assert_eq!(MigrationStatus::ConnectionLost.to_string(), "CONNECTION_LOST");
        assert_eq!(
            MigrationStatus::from_str("COLLECTION_DROPPED").unwrap(),
            MigrationStatus::CollectionDropped
        );
        assert_eq!(
            serde_json::to_value(MigrationStatus::CdcInsert).unwrap(),
            serde_json::json!("CDC_INSERT")
        );
        assert_eq!(OperationType::Cdc.as_ref(), "CDC");
    }

    #[test]
    fn terminal_statuses() {
        assert!(MigrationStatus::Completed.is_terminal());
        assert!(MigrationStatus::Error.is_terminal());
        assert!(MigrationStatus::CollectionDropped.is_terminal());
        assert!(!MigrationStatus::Resumed.is_terminal());
    }

    #[test]
    fn progress_serializes_camel_case() {
        let event = MigrationProgress::new(
            "shop",
            "orders",
            MigrationStatus::Initialized,
            OperationType::Migration,
        )
        .with_counts(0, 10, 10)
        .with_detail("event", "initial_count");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["sourceCollection"], "orders");
        assert_eq!(json["currentTotal"], 10);
        assert_eq!(json["operationType"], "MIGRATION");
        assert_eq!(json["details"]["event"], "initial_count");
    }

    #[test]
    fn checkpoint_json_round_trip() {
        let mut checkpoint = Checkpoint::document_transfer("run-1");
        checkpoint.success_count = 40;
        checkpoint.last_processed_id = Some("abc".to_string());

        let text = serde_json::to_string(&checkpoint).unwrap();
        assert!(text.contains("\"lastProcessedId\":\"abc\""));
        let parsed: Checkpoint = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, checkpoint);
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: MigrationConfig = toml::from_str("batch_size = 10").unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.concurrency, 3000);
        assert_eq!(config.progress_interval, 1000);
        assert_eq!(config.health_check_interval(), Duration::from_secs(5));
        assert_eq!(config.tag_field, "sourceCollection");
    }
}
