//! Per-document upsert with retry, shared by the bulk copy and the
//! capture workers.

use docsync_store::CollectionHandle;
use tokio_util::sync::CancellationToken;

use crate::EngineInner;
use crate::registry::UnitState;
use crate::retry::sleep_or_cancel;

/// How a single document write ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Committed,
    /// Retries exhausted. The failure has been logged.
    Failed,
    Stopped,
}

/// Upserts one document, retrying up to `upsert_retries` times.
///
/// Retryable failures put `unit` (when given) into the connection-lost
/// state and wait for both stores before the next attempt; other failures
/// back off exponentially from `upsert_backoff`. Each attempt counts as an
/// in-flight write of `unit` until the store answers.
pub async fn upsert_document(
    ctx: &EngineInner,
    handle: &CollectionHandle,
    id: &str,
    body: &serde_json::Value,
    unit: Option<&UnitState>,
    token: &CancellationToken,
) -> WriteOutcome {
    let attempts = ctx.config.upsert_retries.saturating_add(1);
    let mut backoff = ctx.config.upsert_backoff();

    for attempt in 1..=attempts {
        if token.is_cancelled() {
            return WriteOutcome::Stopped;
        }

        let in_flight = unit.map(UnitState::begin_write);
        let result = ctx.target.upsert(handle, id, body).await;
        drop(in_flight);
        let error = match result {
            Ok(()) => return WriteOutcome::Committed,
            Err(e) => e,
        };

        if attempt == attempts {
            log::error!("Giving up on document {id} in {handle} after {attempts} attempts: {error}");
            break;
        }

        let resumed = if error.is_retryable() {
            match unit {
                Some(unit) => ctx.supervisor.recover(unit, &error, token).await,
                None => {
                    log::warn!("Upsert of {id} into {handle} hit {error}, waiting for stores");
                    ctx.supervisor.wait_until_healthy(token).await
                }
            }
        } else {
            log::warn!(
                "Upsert of {id} into {handle} failed (attempt {attempt}/{attempts}): {error}, \
                 retrying in {backoff:?}"
            );
            let slept = sleep_or_cancel(backoff, token).await;
            backoff = backoff.saturating_mul(2);
            slept
        };

        if !resumed {
            return WriteOutcome::Stopped;
        }
    }

    WriteOutcome::Failed
}
