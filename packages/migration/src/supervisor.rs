//! Connection-loss supervision.
//!
//! When any retryable failure surfaces mid-run, the affected unit enters
//! the connection-lost state and waits here until both stores answer a
//! ping again. Many tasks of one unit (concurrent upserts, the capture
//! worker) may hit the same outage at once; the unit's flag makes sure
//! exactly one `CONNECTION_LOST` and one `RESUMED` are emitted per outage.

use std::sync::Arc;
use std::time::Duration;

use docsync_migration_models::{MigrationStatus, OperationType};
use docsync_store::{SourceStore, StoreError, TargetStore};
use tokio_util::sync::CancellationToken;

use crate::progress::ProgressSink;
use crate::registry::UnitState;
use crate::retry::sleep_or_cancel;

pub struct Supervisor {
    source: Arc<dyn SourceStore>,
    target: Arc<dyn TargetStore>,
    sink: Arc<dyn ProgressSink>,
    interval: Duration,
}

impl Supervisor {
    pub fn new(
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
        sink: Arc<dyn ProgressSink>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            target,
            sink,
            interval,
        }
    }

    /// Puts `unit` into the connection-lost state, emitting
    /// `CONNECTION_LOST` if this call performed the transition.
    pub fn report_lost(&self, unit: &UnitState, error: &StoreError) {
        if unit.enter_connection_lost() {
            log::warn!(
                "Connection lost during {}: {error}",
                unit.request().migration_key()
            );
            self.sink.emit(
                &unit
                    .progress(MigrationStatus::ConnectionLost, OperationType::Migration)
                    .with_detail("error", error.to_string())
                    .with_detail("store", error.side.as_ref()),
            );
        }
    }

    /// Reports the outage for `unit`, waits for both stores, and emits
    /// `RESUMED` if this call cleared the state. Returns `false` if
    /// `token` fired first.
    pub async fn recover(
        &self,
        unit: &UnitState,
        error: &StoreError,
        token: &CancellationToken,
    ) -> bool {
        self.report_lost(unit, error);
        if !self.wait_until_healthy(token).await {
            return false;
        }

        if unit.clear_connection_lost() {
            log::info!("Connection restored for {}", unit.request().migration_key());
            self.sink
                .emit(&unit.progress(MigrationStatus::Resumed, OperationType::Migration));
        }
        true
    }

    /// Polls both stores every interval until both answer. Returns `false`
    /// if `token` fired first.
    pub async fn wait_until_healthy(&self, token: &CancellationToken) -> bool {
        loop {
            if token.is_cancelled() {
                return false;
            }
            if self.stores_healthy().await {
                return true;
            }
            log::debug!("Stores unreachable, checking again in {:?}", self.interval);
            if !sleep_or_cancel(self.interval, token).await {
                return false;
            }
        }
    }

    async fn stores_healthy(&self) -> bool {
        if let Err(e) = self.source.ping().await {
            log::debug!("Source ping failed: {e}");
            return false;
        }
        if let Err(e) = self.target.ping().await {
            log::debug!("Target ping failed: {e}");
            return false;
        }
        true
    }
}
