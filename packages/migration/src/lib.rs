#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Migration and change capture engine.
//!
//! A [`MigrationEngine`] copies a source collection into a target
//! collection in batches while a capture worker mirrors live changes made
//! on the source in the meantime. Every copied document is tagged with its
//! source collection so several source collections can share one target
//! collection and a dropped one can be removed without touching the rest.
//!
//! Transient store failures pause the affected unit until both stores
//! answer again (reported as `CONNECTION_LOST` / `RESUMED`); resumable runs
//! record a [`Checkpoint`](docsync_migration_models::Checkpoint) after each
//! batch.
//!
//! ```ignore
//! let engine = MigrationEngine::builder(source, target)
//!     .sink(Arc::new(LogProgressSink))
//!     .config(config)
//!     .build();
//!
//! let outcome = engine
//!     .transfer_collection(&TransferRequest::new("shop", "orders", "main", "_default", "orders"))
//!     .await?;
//! ```

mod capture;
mod drop;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod stop;
mod supervisor;
mod transfer;
mod write;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use docsync_checkpoint::{CheckpointError, CheckpointStore};
use docsync_migration_models::{MigrationConfig, TransferRequest, migration_key};
use docsync_store::{SourceStore, StoreError, TargetStore};

pub use capture::drop_worker_key;
pub use progress::{
    BroadcastProgressSink, FanoutProgressSink, LogProgressSink, NullProgressSink,
    ProgressMessage, ProgressSink, null_sink,
};
pub use stop::StopHandle;

use crate::capture::WorkerRegistry;
use crate::registry::UnitRegistry;
use crate::stop::StopSignal;
use crate::supervisor::Supervisor;

/// Errors that end a transfer without it completing.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// A transfer with the same migration key is still running.
    #[error("A transfer for {key} is already running")]
    AlreadyRunning { key: String },

    /// A store operation failed for good.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Loading, saving or deleting a checkpoint failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// A resumable transfer was requested from an engine built without a
    /// checkpoint store.
    #[error("No checkpoint store is configured")]
    NoCheckpointStore,
}

/// Totals of one transfer run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferSummary {
    /// Documents committed to the target, including those counted by a
    /// resumed checkpoint.
    pub transferred: u64,
    /// Documents given up on after their retries.
    pub failed: u64,
    pub elapsed: Duration,
    /// Documents per second.
    pub speed: f64,
}

/// How a transfer run ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransferOutcome {
    /// Every batch was processed.
    Completed(TransferSummary),
    /// An operator stop interrupted the run.
    Stopped(TransferSummary),
    /// The source collection was dropped during the run.
    Dropped(TransferSummary),
}

impl TransferOutcome {
    #[must_use]
    pub const fn summary(&self) -> &TransferSummary {
        match self {
            Self::Completed(summary) | Self::Stopped(summary) | Self::Dropped(summary) => summary,
        }
    }

    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// State shared by the orchestrator and every capture worker.
pub(crate) struct EngineInner {
    pub(crate) source: Arc<dyn SourceStore>,
    pub(crate) target: Arc<dyn TargetStore>,
    pub(crate) sink: Arc<dyn ProgressSink>,
    pub(crate) checkpoints: Option<Arc<dyn CheckpointStore>>,
    pub(crate) config: MigrationConfig,
    pub(crate) stop: Arc<StopSignal>,
    pub(crate) units: UnitRegistry,
    pub(crate) workers: WorkerRegistry,
    /// Requests with capture started, by migration key. Used by drop
    /// workers to find the target of a dropped collection.
    pub(crate) known_requests: DashMap<String, TransferRequest>,
    pub(crate) drop_lock: tokio::sync::Mutex<()>,
    pub(crate) supervisor: Supervisor,
}

/// Builds a [`MigrationEngine`].
pub struct MigrationEngineBuilder {
    source: Arc<dyn SourceStore>,
    target: Arc<dyn TargetStore>,
    sink: Option<Arc<dyn ProgressSink>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    config: MigrationConfig,
}

impl MigrationEngineBuilder {
    /// Where progress events go. Defaults to [`LogProgressSink`].
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn config(mut self, config: MigrationConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables [`MigrationEngine::transfer_with_checkpoints`].
    #[must_use]
    pub fn checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    #[must_use]
    pub fn build(self) -> MigrationEngine {
        let sink = self.sink.unwrap_or_else(|| Arc::new(LogProgressSink));
        let supervisor = Supervisor::new(
            Arc::clone(&self.source),
            Arc::clone(&self.target),
            Arc::clone(&sink),
            self.config.health_check_interval(),
        );

        MigrationEngine {
            inner: Arc::new(EngineInner {
                source: self.source,
                target: self.target,
                sink,
                checkpoints: self.checkpoints,
                config: self.config,
                stop: Arc::new(StopSignal::new()),
                units: UnitRegistry::new(),
                workers: WorkerRegistry::default(),
                known_requests: DashMap::new(),
                drop_lock: tokio::sync::Mutex::new(()),
                supervisor,
            }),
        }
    }
}

/// Runs transfers and live change capture between one source and one
/// target store.
///
/// Cheap to clone; clones share all running state.
#[derive(Clone)]
pub struct MigrationEngine {
    inner: Arc<EngineInner>,
}

impl MigrationEngine {
    #[must_use]
    pub fn builder(
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
    ) -> MigrationEngineBuilder {
        MigrationEngineBuilder {
            source,
            target,
            sink: None,
            checkpoints: None,
            config: MigrationConfig::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MigrationConfig {
        &self.inner.config
    }

    /// Copies `request`'s source collection into its target collection
    /// and starts mirroring live changes.
    ///
    /// # Errors
    ///
    /// * [`MigrationError::AlreadyRunning`] if the unit is already running
    /// * [`MigrationError::Store`] if counting, resolving the target or
    ///   fetching a batch fails for good
    pub async fn transfer_collection(
        &self,
        request: &TransferRequest,
    ) -> Result<TransferOutcome, MigrationError> {
        transfer::run(&self.inner, request, None).await
    }

    /// Like [`MigrationEngine::transfer_collection`], resuming from and
    /// recording progress in the checkpoint `checkpoint_id`.
    ///
    /// # Errors
    ///
    /// Everything [`MigrationEngine::transfer_collection`] returns, plus
    /// [`MigrationError::Checkpoint`] and
    /// [`MigrationError::NoCheckpointStore`].
    pub async fn transfer_with_checkpoints(
        &self,
        request: &TransferRequest,
        checkpoint_id: &str,
    ) -> Result<TransferOutcome, MigrationError> {
        transfer::run(&self.inner, request, Some(checkpoint_id)).await
    }

    /// Starts live capture for `request` without a bulk copy. Does nothing
    /// for workers that are already running.
    pub fn start_change_capture(&self, request: &TransferRequest) {
        if self.inner.stop.reset_if_stopped() {
            log::debug!("Cleared previous stop before starting capture");
        }
        capture::start(&self.inner, request);
    }

    /// Stops the collection worker of `database.collection`. Returns
    /// `false` if none was running.
    ///
    /// The unit's request stays known, so a later drop of the collection
    /// still clears the target collection it was written to.
    pub fn stop_change_capture(&self, database: &str, collection: &str) -> bool {
        let key = migration_key(database, collection);
        let stopped = self.inner.workers.stop(&key);
        if stopped {
            log::info!("Stopped change capture for {key}");
        }
        stopped
    }

    /// Stops one unit: its running transfer, if any, and its collection
    /// worker. Returns `false` if neither was running.
    pub fn stop_unit(&self, database: &str, collection: &str) -> bool {
        let key = migration_key(database, collection);
        let unit = self.inner.units.get(&key);
        if let Some(unit) = &unit {
            log::info!("Stopping transfer {key}");
            unit.token().cancel();
        }
        self.stop_change_capture(database, collection) || unit.is_some()
    }

    /// Stops every running transfer and capture worker.
    pub fn stop_migration(&self) {
        log::info!("Stopping all transfers and change capture");
        self.inner.stop.stop();
        let stopped = self.inner.workers.stop_all();
        log::debug!("Signalled {} capture workers", stopped.len());
    }

    /// A handle that can request [`MigrationEngine::stop_migration`]'s
    /// global stop from elsewhere.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(Arc::clone(&self.inner.stop))
    }

    /// Keys of every running capture worker, sorted.
    #[must_use]
    pub fn active_workers(&self) -> Vec<String> {
        self.inner.workers.keys()
    }

    /// Migration keys of every running transfer, sorted.
    #[must_use]
    pub fn active_units(&self) -> Vec<String> {
        self.inner.units.keys()
    }

    /// Stops everything and waits for the capture workers to exit.
    pub async fn shutdown(&self) {
        self.inner.stop.stop();
        let handles = self.inner.workers.stop_all();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                log::error!("Capture worker panicked: {e}");
            }
        }
    }
}
