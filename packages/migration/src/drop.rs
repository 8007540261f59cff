//! Drop handling.
//!
//! A target collection may hold documents from several source collections,
//! told apart only by the tag field. Dropping one source collection removes
//! only the target documents carrying its tag.

use docsync_migration_models::{DropNotification, TransferRequest};
use docsync_store::StoreError;
use tokio_util::sync::CancellationToken;

use crate::EngineInner;
use crate::retry::{sleep_or_cancel, with_retry};

/// Reacts to the drop of `request`'s source collection: stops its unit,
/// stops its capture worker, and deletes its tagged target documents.
///
/// The delete waits until the unit's in-flight upserts have answered, so
/// no document of the dropped collection lands after it.
///
/// Returns the number of documents deleted, or `None` if there was nothing
/// to delete or `token` fired first.
///
/// # Errors
///
/// Returns [`StoreError`] if the delete still fails after its retries.
pub async fn handle_drop(
    ctx: &EngineInner,
    request: &TransferRequest,
    token: &CancellationToken,
) -> Result<Option<u64>, StoreError> {
    let key = request.migration_key();
    log::info!("Source collection {key} was dropped");

    if let Some(unit) = ctx.units.get(&key) {
        unit.mark_dropped();
        tokio::select! {
            () = unit.writes_drained() => {}
            () = token.cancelled() => return Ok(None),
        }
    }
    ctx.known_requests.remove(&key);

    delete_tagged(ctx, request, token).await
}

/// Deletes the target documents tagged with `request`'s source collection.
///
/// At most one tagged delete runs at a time across the engine. Counts
/// first and skips silently when nothing matches, so the same drop seen by
/// two workers is only reported once.
///
/// # Errors
///
/// Returns [`StoreError`] if the delete still fails after its retries.
pub async fn delete_tagged(
    ctx: &EngineInner,
    request: &TransferRequest,
    token: &CancellationToken,
) -> Result<Option<u64>, StoreError> {
    let _serialized = ctx.drop_lock.lock().await;

    let tag_field = ctx.config.tag_field.as_str();
    let tag = request.source_collection.as_str();
    let attempts = ctx.config.operation_retries;
    let base = ctx.config.operation_retry_base();

    let handle = with_retry("resolve drop target", attempts, base, token, || {
        ctx.target.resolve_collection(
            &request.target_bucket,
            &request.target_scope,
            &request.target_collection,
        )
    })
    .await?;

    let count = with_retry("count tagged documents", attempts, base, token, || {
        ctx.target.count_by_tag(&handle, tag_field, tag)
    })
    .await?;
    if count == 0 {
        log::debug!("No documents tagged {tag_field}={tag} in {handle}, nothing to delete");
        return Ok(None);
    }

    let retries = ctx.config.drop_delete_retries.max(1);
    let step = ctx.config.drop_delete_backoff();
    let mut attempt = 1;

    loop {
        if token.is_cancelled() {
            return Ok(None);
        }

        match ctx.target.bulk_delete_by_tag(&handle, tag_field, tag).await {
            Ok(deleted) => {
                log::info!("Deleted {deleted} documents tagged {tag_field}={tag} from {handle}");
                ctx.sink.emit_drop(&DropNotification {
                    database: request.source_database.clone(),
                    collection: request.source_collection.clone(),
                    dropped_collection: tag.to_string(),
                    deleted_count: deleted,
                });
                return Ok(Some(deleted));
            }
            Err(e) if e.is_timeout_or_interrupt() && attempt < retries => {
                let delay = step.saturating_mul(attempt);
                log::warn!(
                    "Tagged delete of {tag} failed (attempt {attempt}/{retries}): {e}, \
                     retrying in {delay:?}"
                );
                if !sleep_or_cancel(delay, token).await {
                    return Ok(None);
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
