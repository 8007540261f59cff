//! Per-unit runtime state.
//!
//! A [`UnitState`] exists from the start of a transfer until it completes,
//! stops, fails or is dropped. The orchestrator and the unit's capture
//! worker both update its counters, so every counter is an atomic and
//! every adjustment is a single read-modify-write.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use docsync_migration_models::{MigrationProgress, MigrationStatus, OperationType, TransferRequest};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::MigrationError;

/// Live counters and flags for one running unit.
#[derive(Debug)]
pub struct UnitState {
    request: TransferRequest,
    inserted: AtomicU64,
    deleted: AtomicU64,
    initial_count: AtomicU64,
    transferred: AtomicU64,
    current_total: AtomicU64,
    started_at: Instant,
    connection_lost: AtomicBool,
    dropped: AtomicBool,
    writes_in_flight: AtomicU64,
    drained: Notify,
    token: CancellationToken,
}

impl UnitState {
    fn new(request: TransferRequest, token: CancellationToken) -> Self {
        Self {
            request,
            inserted: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
            initial_count: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
            current_total: AtomicU64::new(0),
            started_at: Instant::now(),
            connection_lost: AtomicBool::new(false),
            dropped: AtomicBool::new(false),
            writes_in_flight: AtomicU64::new(0),
            drained: Notify::new(),
            token,
        }
    }

    #[must_use]
    pub const fn request(&self) -> &TransferRequest {
        &self.request
    }

    /// Cancelled on operator stop, unit stop, or drop.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Records the source count as both the initial and the current total.
    pub fn set_initial_count(&self, count: u64) {
        self.initial_count.store(count, Ordering::SeqCst);
        self.current_total.store(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn initial_count(&self) -> u64 {
        self.initial_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn current_total(&self) -> u64 {
        self.current_total.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn inserted(&self) -> u64 {
        self.inserted.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Starts the transferred counter at a resumed checkpoint's count.
    pub fn seed_transferred(&self, count: u64) {
        self.transferred.store(count, Ordering::SeqCst);
    }

    /// Counts one committed bulk-copy document and returns the new total.
    pub fn add_transferred(&self) -> u64 {
        self.transferred.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Records a live insert. Returns the adjusted current total.
    pub fn record_insert(&self) -> u64 {
        self.inserted.fetch_add(1, Ordering::SeqCst);
        self.current_total.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Records a live delete. Returns the adjusted current total, which
    /// never goes below zero.
    pub fn record_delete(&self) -> u64 {
        self.deleted.fetch_add(1, Ordering::SeqCst);
        let previous = self
            .current_total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                Some(total.saturating_sub(1))
            })
            .unwrap_or_default();
        previous.saturating_sub(1)
    }

    /// Flips the unit into the connection-lost state. Only the caller that
    /// performed the flip gets `true`.
    pub fn enter_connection_lost(&self) -> bool {
        self.connection_lost
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Clears the connection-lost state. Only the caller that performed the
    /// clear gets `true`.
    pub fn clear_connection_lost(&self) -> bool {
        self.connection_lost
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        self.connection_lost.load(Ordering::SeqCst)
    }

    /// Marks the unit's source collection as dropped and cancels its token.
    pub fn mark_dropped(&self) {
        self.dropped.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    #[must_use]
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Counts a target write as in flight until the guard drops.
    #[must_use]
    pub fn begin_write(&self) -> InFlightWrite<'_> {
        self.writes_in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightWrite { unit: self }
    }

    /// Resolves once no target write of this unit is in flight.
    pub async fn writes_drained(&self) {
        loop {
            let drained = self.drained.notified();
            if self.writes_in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Documents per second since the unit started.
    #[must_use]
    pub fn speed(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            #[allow(clippy::cast_precision_loss)]
            let transferred = self.transferred() as f64;
            transferred / secs
        } else {
            0.0
        }
    }

    /// A progress event for this unit carrying its current counters.
    #[must_use]
    pub fn progress(&self, status: MigrationStatus, operation_type: OperationType) -> MigrationProgress {
        let elapsed_ms = u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX);
        MigrationProgress::for_request(&self.request, status, operation_type)
            .with_counts(self.transferred(), self.initial_count(), self.current_total())
            .with_timing(elapsed_ms, self.speed())
    }
}

/// Held for the duration of one target write. See [`UnitState::begin_write`].
pub struct InFlightWrite<'a> {
    unit: &'a UnitState,
}

impl Drop for InFlightWrite<'_> {
    fn drop(&mut self) {
        if self.unit.writes_in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.unit.drained.notify_waiters();
        }
    }
}

/// All running units, keyed by migration key.
#[derive(Debug, Default)]
pub struct UnitRegistry {
    units: DashMap<String, Arc<UnitState>>,
}

impl UnitRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a unit whose token is a child of `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::AlreadyRunning`] if the unit's key is
    /// already registered.
    pub fn register(
        &self,
        request: &TransferRequest,
        parent: &CancellationToken,
    ) -> Result<Arc<UnitState>, MigrationError> {
        let key = request.migration_key();
        match self.units.entry(key) {
            Entry::Occupied(entry) => Err(MigrationError::AlreadyRunning {
                key: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                let state = Arc::new(UnitState::new(request.clone(), parent.child_token()));
                entry.insert(Arc::clone(&state));
                Ok(state)
            }
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<UnitState>> {
        self.units.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes `state` if it is still the registered state for its key.
    pub fn release(&self, state: &Arc<UnitState>) {
        self.units
            .remove_if(&state.request.migration_key(), |_, current| {
                Arc::ptr_eq(current, state)
            });
    }

    /// Keys of every running unit, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.units.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }
}

/// Releases a unit's state when the transfer that registered it returns,
/// whichever way it returns.
pub struct UnitGuard<'a> {
    registry: &'a UnitRegistry,
    state: Arc<UnitState>,
}

impl<'a> UnitGuard<'a> {
    #[must_use]
    pub const fn new(registry: &'a UnitRegistry, state: Arc<UnitState>) -> Self {
        Self { registry, state }
    }
}

impl Drop for UnitGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.state);
    }
}
