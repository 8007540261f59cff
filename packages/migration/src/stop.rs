//! Operator stop.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// The engine-wide stop flag.
///
/// Every unit and capture worker runs under a child of the current token,
/// so cancelling it reaches all of them. A new transfer replaces a fired
/// token with a fresh one, leaving already-stopped work stopped.
#[derive(Debug, Default)]
pub struct StopSignal {
    token: Mutex<CancellationToken>,
}

impl StopSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CancellationToken> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The token new work should derive its own token from.
    #[must_use]
    pub fn current(&self) -> CancellationToken {
        self.lock().clone()
    }

    /// Fires the stop.
    pub fn stop(&self) {
        self.lock().cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.lock().is_cancelled()
    }

    /// Replaces a fired token with a fresh one. Returns `true` if a reset
    /// happened.
    pub fn reset_if_stopped(&self) -> bool {
        let mut token = self.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
            true
        } else {
            false
        }
    }
}

/// A cloneable handle that lets a collaborator (for example the owner of
/// a progress sink, or a ctrl-c handler) request an operator stop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    signal: Arc<StopSignal>,
}

impl StopHandle {
    pub(crate) const fn new(signal: Arc<StopSignal>) -> Self {
        Self { signal }
    }

    /// Requests a stop of every running transfer and capture worker.
    pub fn stop(&self) {
        log::info!("Stop requested");
        self.signal.stop();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.signal.is_stopped()
    }

    /// Resolves once the current stop fires.
    #[must_use]
    pub fn stopped(&self) -> WaitForCancellationFutureOwned {
        self.signal.current().cancelled_owned()
    }
}
