//! Progress reporting.
//!
//! The engine reports through a [`ProgressSink`]; how events are rendered
//! or shipped is up to the implementation. Stock sinks cover logging,
//! in-process fan-out to subscribers, and silence.

use std::sync::Arc;

use docsync_migration_models::{
    DropNotification, MigrationProgress, MigrationStatus, OperationType,
};
use tokio::sync::broadcast;

/// Receives progress events from the engine.
///
/// Implementations must be `Send + Sync` since the orchestrator and every
/// capture worker share one sink. Calls must not block for long.
pub trait ProgressSink: Send + Sync {
    /// Receives a progress event.
    fn emit(&self, progress: &MigrationProgress);

    /// Receives a drop notification. Defaults to forwarding the
    /// `COLLECTION_DROPPED` event built by [`drop_progress`].
    fn emit_drop(&self, notification: &DropNotification) {
        self.emit(&drop_progress(notification));
    }
}

/// The `COLLECTION_DROPPED` progress event for a drop notification.
#[must_use]
pub fn drop_progress(notification: &DropNotification) -> MigrationProgress {
    MigrationProgress::new(
        notification.database.clone(),
        notification.collection.clone(),
        MigrationStatus::CollectionDropped,
        OperationType::Drop,
    )
    .with_change_count(notification.deleted_count)
    .with_detail("droppedCollection", notification.dropped_collection.clone())
    .with_detail("deletedCount", notification.deleted_count)
}

/// Logs one line per event.
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn emit(&self, progress: &MigrationProgress) {
        let key = progress.migration_key();
        match progress.status {
            MigrationStatus::ConnectionLost => log::warn!(
                "[{key}] connection lost at {}/{}",
                progress.transferred,
                progress.current_total
            ),
            MigrationStatus::Error => log::error!("[{key}] failed: {:?}", progress.details),
            MigrationStatus::Completed => log::info!(
                "[{key}] completed: {} documents in {}ms ({:.1} docs/s)",
                progress.transferred,
                progress.elapsed_ms,
                progress.speed
            ),
            status => log::info!(
                "[{key}] {status} ({}) {}/{} (current total {})",
                progress.operation_type,
                progress.transferred,
                progress.total,
                progress.current_total
            ),
        }
    }
}

/// Ignores every event.
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn emit(&self, _progress: &MigrationProgress) {}
}

/// Returns a shared [`NullProgressSink`].
#[must_use]
pub fn null_sink() -> Arc<dyn ProgressSink> {
    Arc::new(NullProgressSink)
}

/// Forwards every event to several sinks in order.
pub struct FanoutProgressSink {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl FanoutProgressSink {
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn ProgressSink>>) -> Self {
        Self { sinks }
    }
}

impl ProgressSink for FanoutProgressSink {
    fn emit(&self, progress: &MigrationProgress) {
        for sink in &self.sinks {
            sink.emit(progress);
        }
    }

    fn emit_drop(&self, notification: &DropNotification) {
        for sink in &self.sinks {
            sink.emit_drop(notification);
        }
    }
}

/// A message delivered to [`BroadcastProgressSink`] subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressMessage {
    Progress(MigrationProgress),
    Dropped(DropNotification),
}

/// Publishes events to any number of live subscribers.
///
/// Events emitted while nobody is subscribed are discarded, and a
/// subscriber that falls more than `capacity` messages behind skips ahead.
pub struct BroadcastProgressSink {
    sender: broadcast::Sender<ProgressMessage>,
}

impl BroadcastProgressSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressMessage> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl ProgressSink for BroadcastProgressSink {
    fn emit(&self, progress: &MigrationProgress) {
        let _ = self.sender.send(ProgressMessage::Progress(progress.clone()));
    }

    fn emit_drop(&self, notification: &DropNotification) {
        let _ = self.sender.send(ProgressMessage::Dropped(notification.clone()));
    }
}
