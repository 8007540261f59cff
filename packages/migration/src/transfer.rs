//! The bulk-copy orchestrator.
//!
//! One call copies one unit: count, resolve the target, start capture,
//! then fetch and write batches in cursor order until the initial count is
//! covered. The unit's token is checked at every batch boundary and after
//! every fetch; a fired token ends the run as stopped or, if the source
//! collection was dropped, as dropped.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use docsync_document::{Document, PreparedDocument, document_id, prepare_for_target};
use docsync_migration_models::{
    Checkpoint, DOCUMENT_TRANSFER_STAGE, MigrationStatus, OperationType, TransferRequest,
};
use docsync_store::{CollectionHandle, StoreError, StoreErrorKind};
use futures::{StreamExt as _, stream};
use tokio_util::sync::CancellationToken;

use crate::registry::{UnitGuard, UnitState};
use crate::retry::with_retry;
use crate::write::{WriteOutcome, upsert_document};
use crate::{EngineInner, MigrationError, TransferOutcome, TransferSummary, capture};

enum Step<T> {
    Done(T),
    /// The unit's token fired.
    Halted,
    Failed(StoreError),
}

struct BatchResult {
    committed: u64,
    failed: u64,
    /// Canonical id of the committed document furthest along in cursor
    /// order.
    last_committed: Option<String>,
}

/// Runs one transfer, resuming from `checkpoint_id` when given.
pub async fn run(
    ctx: &Arc<EngineInner>,
    request: &TransferRequest,
    checkpoint_id: Option<&str>,
) -> Result<TransferOutcome, MigrationError> {
    if ctx.stop.reset_if_stopped() {
        log::debug!("Cleared previous stop before starting {request}");
    }
    let unit = ctx.units.register(request, &ctx.stop.current())?;
    let _guard = UnitGuard::new(&ctx.units, Arc::clone(&unit));
    log::info!("Starting transfer {request}");

    let result = copy(ctx, &unit, checkpoint_id).await;
    if let Err(e) = &result {
        log::error!("Transfer {request} failed: {e}");
        ctx.sink.emit(
            &unit
                .progress(MigrationStatus::Error, OperationType::Migration)
                .with_detail("error", e.to_string()),
        );
    }
    result
}

async fn copy(
    ctx: &Arc<EngineInner>,
    unit: &UnitState,
    checkpoint_id: Option<&str>,
) -> Result<TransferOutcome, MigrationError> {
    let request = unit.request();
    let token = unit.token();
    let db = request.source_database.as_str();
    let coll = request.source_collection.as_str();

    let mut checkpoint = match checkpoint_id {
        Some(id) => Some(open_checkpoint(ctx, id).await?),
        None => None,
    };
    let mut failed = 0;
    if let Some(checkpoint) = &checkpoint {
        unit.seed_transferred(checkpoint.success_count);
        failed = checkpoint.failure_count;
    }

    let total = match resilient(ctx, unit, "count source documents", || {
        ctx.source.count(db, coll)
    })
    .await
    {
        Step::Done(total) => total,
        Step::Halted => return Ok(halted(unit, failed)),
        Step::Failed(e) => return Err(e.into()),
    };
    unit.set_initial_count(total);
    ctx.sink.emit(
        &unit
            .progress(MigrationStatus::Initialized, OperationType::Migration)
            .with_detail("event", "initial_count"),
    );

    let handle = match resilient(ctx, unit, "resolve target collection", || {
        ctx.target.resolve_collection(
            &request.target_bucket,
            &request.target_scope,
            &request.target_collection,
        )
    })
    .await
    {
        Step::Done(handle) => handle,
        Step::Halted => return Ok(halted(unit, failed)),
        Step::Failed(e) => return Err(e.into()),
    };

    ctx.sink
        .emit(&unit.progress(MigrationStatus::Started, OperationType::Migration));
    capture::start(ctx, request);

    let batch_size = ctx.config.batch_size.max(1);
    let mut resume_after = checkpoint
        .as_ref()
        .and_then(|checkpoint| checkpoint.last_processed_id.clone());
    let mut offset = 0;

    while offset < total {
        if token.is_cancelled() {
            return Ok(halted(unit, failed));
        }

        let batch = match fetch(ctx, unit, offset, batch_size).await {
            Step::Done(batch) => batch,
            Step::Halted => return Ok(halted(unit, failed)),
            Step::Failed(e) => return Err(e.into()),
        };
        if token.is_cancelled() {
            return Ok(halted(unit, failed));
        }
        if batch.is_empty() {
            log::debug!("Source returned no documents at offset {offset} of {total}, finishing");
            break;
        }
        offset += batch_size;

        let pending = match &resume_after {
            Some(resume_id) => {
                let Some(found) = position_of(&batch, resume_id) else {
                    log::debug!("Skipping batch at offset {}: already transferred", offset - batch_size);
                    continue;
                };
                log::info!("Resuming {request} after document {resume_id}");
                resume_after = None;
                &batch[found + 1..]
            }
            None => &batch[..],
        };

        let result = write_batch(ctx, unit, &handle, pending, total).await;
        failed += result.failed;
        if token.is_cancelled() {
            return Ok(halted(unit, failed));
        }
        log::debug!(
            "Batch at offset {} of {request}: {} committed, {} failed",
            offset - batch_size,
            result.committed,
            result.failed
        );

        if let Some(checkpoint) = &mut checkpoint
            && result.committed > 0
        {
            checkpoint.success_count = unit.transferred();
            checkpoint.failure_count = failed;
            checkpoint.last_processed_id = result.last_committed;
            checkpoint.updated_at = Utc::now();
            save_checkpoint(ctx, checkpoint).await;
        }
    }

    if let Some(resume_id) = resume_after {
        log::warn!("Checkpointed document {resume_id} was never found in {request}, nothing was resumed");
    }
    if token.is_cancelled() {
        return Ok(halted(unit, failed));
    }

    let transferred = unit.transferred();
    let summary = summary(unit, failed);
    ctx.sink.emit(
        &unit
            .progress(MigrationStatus::Completed, OperationType::Migration)
            .with_counts(transferred, transferred, transferred),
    );
    log::info!(
        "Transfer {request} completed: {transferred} documents, {failed} failed, in {:?}",
        summary.elapsed
    );

    if let Some(checkpoint) = &checkpoint
        && let Some(store) = &ctx.checkpoints
        && let Err(e) = store.delete(&checkpoint.id).await
    {
        log::warn!("Could not delete checkpoint {}: {e}", checkpoint.id);
    }

    Ok(TransferOutcome::Completed(summary))
}

async fn open_checkpoint(ctx: &EngineInner, id: &str) -> Result<Checkpoint, MigrationError> {
    let store = ctx
        .checkpoints
        .as_ref()
        .ok_or(MigrationError::NoCheckpointStore)?;

    if let Some(checkpoint) = store.load(id).await? {
        if checkpoint.stage != DOCUMENT_TRANSFER_STAGE {
            log::warn!(
                "Checkpoint {id} was written by stage {}, resuming it as a document transfer",
                checkpoint.stage
            );
        }
        log::info!(
            "Loaded checkpoint {id}: {} transferred, last id {:?}",
            checkpoint.success_count,
            checkpoint.last_processed_id
        );
        return Ok(checkpoint);
    }

    let checkpoint = Checkpoint::document_transfer(id);
    store.save(&checkpoint).await?;
    log::info!("Created checkpoint {id}");
    Ok(checkpoint)
}

async fn save_checkpoint(ctx: &EngineInner, checkpoint: &Checkpoint) {
    let Some(store) = &ctx.checkpoints else {
        return;
    };
    if let Err(e) = store.save(checkpoint).await {
        log::warn!("Could not save checkpoint {}: {e}", checkpoint.id);
    }
}

/// Runs a discrete operation through the retry wrapper. If retries run out
/// on a retryable failure, waits for both stores and tries once more.
async fn resilient<T, F, Fut>(ctx: &EngineInner, unit: &UnitState, label: &str, mut op: F) -> Step<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let token = unit.token();
    let attempts = ctx.config.operation_retries;
    let base = ctx.config.operation_retry_base();

    let error = match with_retry(label, attempts, base, token, &mut op).await {
        Ok(value) => return Step::Done(value),
        Err(e) => e,
    };
    if token.is_cancelled() {
        return Step::Halted;
    }
    if !error.is_retryable() {
        return Step::Failed(error);
    }
    if !ctx.supervisor.recover(unit, &error, token).await {
        return Step::Halted;
    }

    match with_retry(label, attempts, base, token, op).await {
        Ok(value) => Step::Done(value),
        Err(_) if token.is_cancelled() => Step::Halted,
        Err(e) => Step::Failed(e),
    }
}

/// Fetches one batch, waiting out any number of outages.
async fn fetch(ctx: &EngineInner, unit: &UnitState, offset: u64, limit: u64) -> Step<Vec<Document>> {
    let request = unit.request();
    let token = unit.token();
    let label = format!("fetch {} at offset {offset}", request.migration_key());

    loop {
        let step = resilient(ctx, unit, &label, || {
            fetch_or_cancel(ctx, request, offset, limit, token)
        })
        .await;
        match step {
            Step::Failed(e) if e.is_retryable() => {
                log::warn!("{label} still failing after recovery: {e}");
            }
            step => return step,
        }
    }
}

async fn fetch_or_cancel(
    ctx: &EngineInner,
    request: &TransferRequest,
    offset: u64,
    limit: u64,
    token: &CancellationToken,
) -> Result<Vec<Document>, StoreError> {
    tokio::select! {
        () = token.cancelled() => Err(StoreError::on_source(
            StoreErrorKind::Interrupted,
            "fetch cancelled",
        )),
        batch = ctx.source.fetch_batch(
            &request.source_database,
            &request.source_collection,
            offset,
            limit,
        ) => batch,
    }
}

fn position_of(batch: &[Document], id: &str) -> Option<usize> {
    batch
        .iter()
        .position(|document| document_id(document).is_ok_and(|candidate| candidate == id))
}

/// Writes `documents` with at most `concurrency` upserts in flight,
/// counting each document as it commits.
async fn write_batch(
    ctx: &EngineInner,
    unit: &UnitState,
    handle: &CollectionHandle,
    documents: &[Document],
    total: u64,
) -> BatchResult {
    let request = unit.request();
    let token = unit.token();
    let interval = ctx.config.progress_interval.max(1);

    let prepared: Vec<(usize, PreparedDocument)> = documents
        .iter()
        .enumerate()
        .filter_map(|(index, document)| {
            match prepare_for_target(document, &ctx.config.tag_field, &request.source_collection) {
                Ok(prepared) => Some((index, prepared)),
                Err(e) => {
                    log::warn!("Skipping document in {}: {e}", request.migration_key());
                    None
                }
            }
        })
        .collect();

    let mut writes = stream::iter(prepared)
        .map(move |(index, document)| async move {
            let outcome =
                upsert_document(ctx, handle, &document.id, &document.body, Some(unit), token)
                    .await;
            (index, document.id, outcome)
        })
        .buffer_unordered(ctx.config.concurrency.max(1));

    let mut result = BatchResult {
        committed: 0,
        failed: 0,
        last_committed: None,
    };
    let mut last_index = None;

    while let Some((index, id, outcome)) = writes.next().await {
        match outcome {
            WriteOutcome::Committed => {
                result.committed += 1;
                if last_index.is_none_or(|last| index > last) {
                    last_index = Some(index);
                    result.last_committed = Some(id);
                }

                let transferred = unit.add_transferred();
                if transferred % interval == 0 || transferred == total {
                    ctx.sink.emit(
                        &unit.progress(MigrationStatus::InProgress, OperationType::Migration),
                    );
                }
            }
            WriteOutcome::Failed => result.failed += 1,
            WriteOutcome::Stopped => {}
        }
    }

    result
}

fn summary(unit: &UnitState, failed: u64) -> TransferSummary {
    TransferSummary {
        transferred: unit.transferred(),
        failed,
        elapsed: unit.elapsed(),
        speed: unit.speed(),
    }
}

fn halted(unit: &UnitState, failed: u64) -> TransferOutcome {
    let summary = summary(unit, failed);
    let key = unit.request().migration_key();
    if unit.is_dropped() {
        log::info!("Transfer {key} ended: source collection dropped");
        TransferOutcome::Dropped(summary)
    } else {
        log::info!(
            "Transfer {key} stopped after {} documents",
            summary.transferred
        );
        TransferOutcome::Stopped(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use docsync_checkpoint::{CheckpointStore, MemoryCheckpointStore};
    use docsync_document::{ID_FIELD, Value};
    use docsync_migration_models::MigrationConfig;
    use docsync_store::memory::{MemorySource, MemoryTarget};
    use docsync_store::{ChangeStream, SourceStore};

    use super::*;
    use crate::MigrationEngine;
    use crate::progress::testing::RecordingSink;

    struct Harness {
        source: Arc<MemorySource>,
        target: Arc<MemoryTarget>,
        sink: Arc<RecordingSink>,
        checkpoints: Arc<MemoryCheckpointStore>,
        engine: MigrationEngine,
    }

    fn config(batch_size: u64) -> MigrationConfig {
        MigrationConfig {
            batch_size,
            concurrency: 4,
            progress_interval: 2,
            operation_retries: 2,
            operation_retry_base_ms: 1,
            upsert_retries: 1,
            upsert_backoff_ms: 1,
            health_check_interval_ms: 5,
            drop_delete_retries: 3,
            drop_delete_backoff_ms: 1,
            ..MigrationConfig::default()
        }
    }

    fn harness(batch_size: u64) -> Harness {
        let source = Arc::new(MemorySource::new());
        let target = Arc::new(MemoryTarget::new());
        let sink = Arc::new(RecordingSink::default());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let engine = MigrationEngine::builder(source.clone(), target.clone())
            .sink(sink.clone())
            .checkpoints(checkpoints.clone())
            .config(config(batch_size))
            .build();

        Harness {
            source,
            target,
            sink,
            checkpoints,
            engine,
        }
    }

    fn doc(id: impl Into<Value>, name: &str) -> Document {
        let mut doc = Document::new();
        doc.insert(ID_FIELD.to_string(), id.into());
        doc.insert("name".to_string(), Value::from(name));
        doc
    }

    fn numbered(count: i32) -> Vec<Document> {
        (1..=count).map(|i| doc(i, &format!("item {i}"))).collect()
    }

    fn request(collection: &str) -> TransferRequest {
        TransferRequest::new("shop", collection, "main", "_default", "shared")
    }

    fn shared() -> CollectionHandle {
        CollectionHandle::new("main", "_default", "shared")
    }

    fn tagged(target: &MemoryTarget, collection: &str) -> usize {
        target
            .documents(&shared())
            .values()
            .filter(|body| body["sourceCollection"] == collection)
            .count()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition was not reached in time");
    }

    #[tokio::test]
    async fn small_collection_completes_in_one_batch() {
        let h = harness(10);
        h.source.seed("shop", "orders", numbered(5));

        let outcome = h.engine.transfer_collection(&request("orders")).await.unwrap();

        assert!(outcome.is_completed());
        assert_eq!(outcome.summary().transferred, 5);
        assert_eq!(h.sink.count("orders", MigrationStatus::Started), 1);
        assert_eq!(h.sink.count("orders", MigrationStatus::Completed), 1);
        assert_eq!(
            h.sink.statuses_for("orders").first(),
            Some(&MigrationStatus::Initialized)
        );

        let completed = h.sink.last("orders", MigrationStatus::Completed).unwrap();
        assert_eq!(
            (completed.transferred, completed.total, completed.current_total),
            (5, 5, 5)
        );

        let stored = h.target.get(&shared(), "3").unwrap();
        assert_eq!(stored["sourceCollection"], "orders");
        assert_eq!(stored["name"], "item 3");
        assert!(stored.get(ID_FIELD).is_none());
        assert_eq!(h.target.len(&shared()), 5);

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn permanently_failing_document_is_skipped() {
        let h = harness(10);
        h.source.seed("shop", "orders", numbered(3));
        h.target.reject_id("2");

        let outcome = h.engine.transfer_collection(&request("orders")).await.unwrap();

        assert!(outcome.is_completed());
        assert_eq!(outcome.summary().transferred, 2);
        assert_eq!(outcome.summary().failed, 1);
        assert_eq!(h.sink.count("orders", MigrationStatus::Error), 0);
        assert_eq!(
            h.sink
                .last("orders", MigrationStatus::Completed)
                .unwrap()
                .transferred,
            2
        );
        assert!(h.target.get(&shared(), "2").is_none());

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn transferred_counter_matches_committed_upserts() {
        let h = harness(3);
        h.source.seed("shop", "orders", numbered(7));
        h.target.reject_id("4");

        let outcome = h.engine.transfer_collection(&request("orders")).await.unwrap();

        assert_eq!(outcome.summary().transferred, h.target.upsert_count());
        assert_eq!(outcome.summary().transferred, 6);

        let reported: Vec<u64> = h
            .sink
            .events()
            .into_iter()
            .filter(|e| e.status == MigrationStatus::InProgress)
            .map(|e| e.transferred)
            .collect();
        assert_eq!(reported, vec![2, 4, 6]);

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn source_outage_is_reported_once_and_resumed() {
        let h = harness(2);
        h.source.seed("shop", "orders", numbered(6));
        h.source.schedule_outage(2, 2);

        let outcome = h.engine.transfer_collection(&request("orders")).await.unwrap();

        assert!(outcome.is_completed());
        assert_eq!(outcome.summary().transferred, 6);
        assert_eq!(h.sink.count("orders", MigrationStatus::ConnectionLost), 1);
        assert_eq!(h.sink.count("orders", MigrationStatus::Resumed), 1);

        let statuses = h.sink.statuses_for("orders");
        let position = |status| statuses.iter().position(|s| *s == status).unwrap();
        assert!(position(MigrationStatus::ConnectionLost) < position(MigrationStatus::Resumed));
        assert!(position(MigrationStatus::Resumed) < position(MigrationStatus::Completed));
        assert_eq!(
            h.sink
                .last("orders", MigrationStatus::Completed)
                .unwrap()
                .transferred,
            6
        );

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn target_outage_mid_batch_is_reported_once_and_resumed() {
        let h = harness(2);
        h.source.seed("shop", "orders", numbered(6));
        h.source.set_fetch_delay(Duration::from_millis(100));

        let running = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.transfer_collection(&request("orders")).await })
        };
        wait_until(|| h.target.len(&shared()) >= 2).await;

        h.target.set_available(false);
        wait_until(|| h.sink.count("orders", MigrationStatus::ConnectionLost) == 1).await;
        h.target.set_available(true);

        let outcome = running.await.unwrap().unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.summary().transferred, 6);
        assert_eq!(h.target.len(&shared()), 6);
        assert_eq!(h.sink.count("orders", MigrationStatus::ConnectionLost), 1);
        assert_eq!(h.sink.count("orders", MigrationStatus::Resumed), 1);
        assert_eq!(
            h.sink
                .last("orders", MigrationStatus::Completed)
                .unwrap()
                .transferred,
            6
        );

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn drop_mid_run_removes_only_its_own_documents() {
        let h = harness(2);
        h.source.seed("shop", "collB", numbered(3));
        h.source.seed(
            "shop",
            "collA",
            (10..16).map(|i| doc(i, "a")).collect::<Vec<_>>(),
        );

        let outcome = h.engine.transfer_collection(&request("collB")).await.unwrap();
        assert!(outcome.is_completed());

        h.source.set_fetch_delay(Duration::from_millis(100));
        let running = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.transfer_collection(&request("collA")).await })
        };

        wait_until(|| tagged(&h.target, "collA") >= 2).await;
        let written = tagged(&h.target, "collA");
        assert!(h.source.drop_collection("shop", "collA"));

        let outcome = running.await.unwrap().unwrap();
        assert!(matches!(outcome, TransferOutcome::Dropped(_)));

        wait_until(|| !h.engine.active_workers().contains(&"shop.collA".to_string())).await;
        assert_eq!(tagged(&h.target, "collA"), 0);
        assert_eq!(tagged(&h.target, "collB"), 3);
        assert_eq!(h.target.len(&shared()), 3);

        let drops = h.sink.drops();
        assert_eq!(drops.len(), 1);
        assert_eq!(drops[0].dropped_collection, "collA");
        assert_eq!(drops[0].deleted_count, written as u64);
        assert_eq!(h.sink.count("collA", MigrationStatus::Completed), 0);
        assert_eq!(h.sink.count("collA", MigrationStatus::CollectionDropped), 1);
        assert!(h.engine.active_units().is_empty());
        assert!(h.engine.active_workers().contains(&"shop.collB".to_string()));

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn drop_waits_for_upserts_already_in_flight() {
        let h = harness(4);
        h.source.seed("shop", "orders", numbered(4));
        h.target.set_upsert_delay(Duration::from_millis(150));

        let running = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.transfer_collection(&request("orders")).await })
        };
        wait_until(|| h.source.open_feeds() == 2).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(h.source.drop_collection("shop", "orders"));
        let outcome = running.await.unwrap().unwrap();
        assert!(matches!(outcome, TransferOutcome::Dropped(_)));
        wait_until(|| h.engine.active_workers().is_empty()).await;

        assert!(h.target.is_empty(&shared()));
        let drops = h.sink.drops();
        assert_eq!(drops.len(), 1);
        assert_eq!(drops[0].deleted_count, 4);

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn tagged_delete_retries_timeouts_up_to_the_limit() {
        let h = harness(10);
        h.source.seed("shop", "orders", numbered(3));
        h.engine.transfer_collection(&request("orders")).await.unwrap();
        wait_until(|| h.source.open_feeds() == 2).await;

        h.target
            .fail_bulk_deletes(h.engine.config().drop_delete_retries - 1);
        h.source.drop_collection("shop", "orders");
        wait_until(|| h.engine.active_workers().is_empty()).await;

        let drops = h.sink.drops();
        assert_eq!(drops.len(), 1);
        assert_eq!(drops[0].deleted_count, 3);
        assert!(h.target.is_empty(&shared()));

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn tagged_delete_gives_up_after_the_limit() {
        let h = harness(10);
        h.source.seed("shop", "orders", numbered(3));
        h.engine.transfer_collection(&request("orders")).await.unwrap();
        wait_until(|| h.source.open_feeds() == 2).await;

        // Both the collection worker and the drop listener attempt the delete.
        h.target
            .fail_bulk_deletes(h.engine.config().drop_delete_retries * 2);
        h.source.drop_collection("shop", "orders");
        wait_until(|| h.engine.active_workers().is_empty()).await;

        assert!(h.sink.drops().is_empty());
        assert_eq!(tagged(&h.target, "orders"), 3);

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn drop_after_capture_stop_clears_the_collection_it_wrote_to() {
        let h = harness(10);
        h.source.seed("shop", "collA", numbered(2));
        h.source
            .seed("shop", "collB", (20..23).map(|i| doc(i, "b")).collect::<Vec<_>>());
        let archive = TransferRequest::new("shop", "collB", "main", "_default", "archive");
        let archived = CollectionHandle::new("main", "_default", "archive");

        h.engine.transfer_collection(&request("collA")).await.unwrap();
        h.engine.transfer_collection(&archive).await.unwrap();
        wait_until(|| h.source.open_feeds() == 3).await;

        assert!(h.engine.stop_change_capture("shop", "collB"));
        wait_until(|| h.source.open_feeds() == 2).await;
        assert_eq!(h.target.len(&archived), 3);

        h.source.drop_collection("shop", "collB");
        wait_until(|| h.sink.drops().len() == 1).await;

        assert!(h.target.is_empty(&archived));
        assert_eq!(h.sink.drops()[0].deleted_count, 3);
        assert_eq!(tagged(&h.target, "collA"), 2);

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn drop_after_completion_leaves_other_collections() {
        let h = harness(10);
        h.source.seed("shop", "collA", numbered(4));
        h.source
            .seed("shop", "collB", (20..23).map(|i| doc(i, "b")).collect::<Vec<_>>());

        h.engine.transfer_collection(&request("collA")).await.unwrap();
        h.engine.transfer_collection(&request("collB")).await.unwrap();
        wait_until(|| h.source.open_feeds() == 3).await;

        h.source.drop_collection("shop", "collB");
        wait_until(|| h.sink.drops().len() == 1).await;

        assert_eq!(tagged(&h.target, "collA"), 4);
        assert_eq!(tagged(&h.target, "collB"), 0);
        assert_eq!(h.sink.drops()[0].deleted_count, 3);

        wait_until(|| {
            let workers = h.engine.active_workers();
            !workers.contains(&"shop.collB".to_string())
                && !workers.contains(&crate::drop_worker_key("shop"))
        })
        .await;
        assert!(h.engine.active_workers().contains(&"shop.collA".to_string()));

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn database_drop_removes_every_known_collection() {
        let h = harness(10);
        h.source.seed("shop", "collA", numbered(2));
        h.source
            .seed("shop", "collB", (20..23).map(|i| doc(i, "b")).collect::<Vec<_>>());

        h.engine.transfer_collection(&request("collA")).await.unwrap();
        h.engine.transfer_collection(&request("collB")).await.unwrap();
        wait_until(|| h.source.open_feeds() == 3).await;

        h.source.drop_database("shop");
        wait_until(|| h.target.is_empty(&shared())).await;
        wait_until(|| h.engine.active_workers().is_empty()).await;

        let mut dropped: Vec<_> = h
            .sink
            .drops()
            .into_iter()
            .map(|n| (n.dropped_collection, n.deleted_count))
            .collect();
        dropped.sort();
        assert_eq!(
            dropped,
            vec![("collA".to_string(), 2), ("collB".to_string(), 3)]
        );

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn resumes_after_checkpointed_document() {
        let h = harness(3);
        let documents: Vec<_> = (0..10).map(|i| doc(format!("d{i:02}"), "x")).collect();
        h.source.seed("shop", "orders", documents);
        h.checkpoints
            .save(&Checkpoint {
                success_count: 4,
                last_processed_id: Some("d03".to_string()),
                ..Checkpoint::document_transfer("orders-run")
            })
            .await
            .unwrap();

        let outcome = h
            .engine
            .transfer_with_checkpoints(&request("orders"), "orders-run")
            .await
            .unwrap();

        assert!(outcome.is_completed());
        assert_eq!(outcome.summary().transferred, 10);
        assert_eq!(h.target.upsert_count(), 6);
        assert!(h.target.get(&shared(), "d03").is_none());
        assert!(h.target.get(&shared(), "d04").is_some());
        assert_eq!(
            h.sink
                .last("orders", MigrationStatus::Completed)
                .unwrap()
                .transferred,
            10
        );
        assert!(h.checkpoints.load("orders-run").await.unwrap().is_none());

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn stopped_run_keeps_checkpoint_for_next_run() {
        let h = harness(2);
        let documents: Vec<_> = (0..6).map(|i| doc(format!("d{i:02}"), "x")).collect();
        h.source.seed("shop", "orders", documents);
        h.source.set_fetch_delay(Duration::from_millis(100));

        let running = {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .transfer_with_checkpoints(&request("orders"), "orders-run")
                    .await
            })
        };

        wait_until(|| h.target.len(&shared()) >= 2).await;
        h.engine.stop_migration();

        let outcome = running.await.unwrap().unwrap();
        assert!(matches!(outcome, TransferOutcome::Stopped(_)));
        assert_eq!(outcome.summary().transferred, 2);
        assert_eq!(h.sink.count("orders", MigrationStatus::Completed), 0);
        assert_eq!(h.sink.count("orders", MigrationStatus::Error), 0);

        let saved = h.checkpoints.load("orders-run").await.unwrap().unwrap();
        assert_eq!(saved.success_count, 2);
        assert_eq!(saved.last_processed_id.as_deref(), Some("d01"));

        h.source.set_fetch_delay(Duration::ZERO);
        let outcome = h
            .engine
            .transfer_with_checkpoints(&request("orders"), "orders-run")
            .await
            .unwrap();

        assert!(outcome.is_completed());
        assert_eq!(outcome.summary().transferred, 6);
        assert_eq!(h.target.len(&shared()), 6);
        assert_eq!(h.target.upsert_count(), 6);
        assert!(h.checkpoints.load("orders-run").await.unwrap().is_none());

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn live_changes_are_mirrored_after_the_copy() {
        let h = harness(10);
        h.source.seed("shop", "orders", numbered(2));

        h.engine.transfer_collection(&request("orders")).await.unwrap();
        wait_until(|| h.source.open_feeds() == 2).await;

        h.source.insert("shop", "orders", doc(3, "new"));
        wait_until(|| h.target.get(&shared(), "3").is_some()).await;

        h.source.update("shop", "orders", doc(1, "renamed"));
        wait_until(|| {
            h.target
                .get(&shared(), "1")
                .is_some_and(|body| body["name"] == "renamed")
        })
        .await;

        assert!(h.source.delete("shop", "orders", &Value::Int32(2)));
        wait_until(|| h.target.get(&shared(), "2").is_none()).await;

        assert_eq!(h.target.len(&shared()), 2);
        assert_eq!(h.sink.count("orders", MigrationStatus::CdcInsert), 0);
        assert_eq!(h.sink.count("orders", MigrationStatus::CdcDelete), 0);

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn live_delete_survives_a_target_outage() {
        let h = harness(10);
        h.source.seed("shop", "orders", numbered(3));
        h.engine.transfer_collection(&request("orders")).await.unwrap();
        wait_until(|| h.source.open_feeds() == 2).await;

        h.target.set_available(false);
        assert!(h.source.delete("shop", "orders", &Value::Int32(2)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.target.get(&shared(), "2").is_some());

        h.target.set_available(true);
        wait_until(|| h.target.get(&shared(), "2").is_none()).await;
        assert_eq!(h.target.len(&shared()), 2);
        assert_eq!(h.sink.count("orders", MigrationStatus::ConnectionLost), 0);

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn live_delete_during_the_copy_reports_connection_loss() {
        let h = harness(2);
        h.source.seed("shop", "orders", numbered(4));
        h.source.set_fetch_delay(Duration::from_millis(200));

        let running = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.transfer_collection(&request("orders")).await })
        };
        wait_until(|| h.target.len(&shared()) >= 2 && h.source.open_feeds() == 2).await;

        h.target.set_available(false);
        h.source.delete("shop", "orders", &Value::Int32(1));
        wait_until(|| h.sink.count("orders", MigrationStatus::ConnectionLost) == 1).await;
        h.target.set_available(true);
        wait_until(|| h.sink.count("orders", MigrationStatus::CdcDelete) == 1).await;

        let outcome = running.await.unwrap().unwrap();
        assert!(outcome.is_completed());
        assert!(h.target.get(&shared(), "1").is_none());
        assert_eq!(h.sink.count("orders", MigrationStatus::ConnectionLost), 1);
        assert_eq!(h.sink.count("orders", MigrationStatus::Resumed), 1);

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn live_changes_during_the_copy_adjust_current_total() {
        let h = harness(2);
        h.source.seed("shop", "orders", numbered(4));
        h.source.set_fetch_delay(Duration::from_millis(200));

        let running = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.transfer_collection(&request("orders")).await })
        };

        wait_until(|| h.target.len(&shared()) >= 2 && h.source.open_feeds() == 2).await;

        h.source.insert("shop", "orders", doc(99, "live"));
        wait_until(|| h.sink.count("orders", MigrationStatus::CdcInsert) == 1).await;
        let inserted = h.sink.last("orders", MigrationStatus::CdcInsert).unwrap();
        assert_eq!((inserted.total, inserted.current_total), (4, 5));
        assert_eq!(inserted.operation_type, OperationType::Cdc);
        assert_eq!(inserted.change_count, 1);

        h.source.delete("shop", "orders", &Value::Int32(1));
        wait_until(|| h.sink.count("orders", MigrationStatus::CdcDelete) == 1).await;
        let deleted = h.sink.last("orders", MigrationStatus::CdcDelete).unwrap();
        assert_eq!(deleted.current_total, 4);

        let outcome = running.await.unwrap().unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.summary().transferred, 4);

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn unsupported_change_streams_only_disable_capture() {
        let h = harness(10);
        h.source.seed("shop", "orders", numbered(3));
        h.source.set_change_streams_supported(false);

        let outcome = h.engine.transfer_collection(&request("orders")).await.unwrap();

        assert!(outcome.is_completed());
        assert_eq!(h.target.len(&shared()), 3);
        wait_until(|| h.engine.active_workers().is_empty()).await;
        assert_eq!(h.source.open_feeds(), 0);

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_run_of_the_same_unit_is_rejected() {
        let h = harness(1);
        h.source.seed("shop", "orders", numbered(3));
        h.source.set_fetch_delay(Duration::from_millis(50));

        let running = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.transfer_collection(&request("orders")).await })
        };
        wait_until(|| h.engine.active_units() == vec!["shop.orders".to_string()]).await;

        let second = h.engine.transfer_collection(&request("orders")).await;
        assert!(matches!(
            second,
            Err(MigrationError::AlreadyRunning { key }) if key == "shop.orders"
        ));

        assert!(h.engine.stop_unit("shop", "orders"));
        let outcome = running.await.unwrap().unwrap();
        assert!(matches!(outcome, TransferOutcome::Stopped(_)));

        h.engine.shutdown().await;
    }

    struct MisconfiguredSource;

    #[async_trait]
    impl SourceStore for MisconfiguredSource {
        async fn count(&self, _database: &str, _collection: &str) -> Result<u64, StoreError> {
            Err(StoreError::on_source(StoreErrorKind::Other, "authentication failed"))
        }

        async fn fetch_batch(
            &self,
            _database: &str,
            _collection: &str,
            _offset: u64,
            _limit: u64,
        ) -> Result<Vec<Document>, StoreError> {
            Ok(Vec::new())
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn watch_collection(
            &self,
            _database: &str,
            _collection: &str,
        ) -> Result<ChangeStream, StoreError> {
            Err(StoreError::on_source(StoreErrorKind::Unsupported, "no feeds"))
        }

        async fn watch_database(&self, _database: &str) -> Result<ChangeStream, StoreError> {
            Err(StoreError::on_source(StoreErrorKind::Unsupported, "no feeds"))
        }
    }

    #[tokio::test]
    async fn structural_failure_reports_error() {
        let sink = Arc::new(RecordingSink::default());
        let engine = MigrationEngine::builder(
            Arc::new(MisconfiguredSource),
            Arc::new(MemoryTarget::new()),
        )
        .sink(sink.clone())
        .config(config(10))
        .build();

        let result = engine.transfer_collection(&request("orders")).await;

        assert!(matches!(result, Err(MigrationError::Store(e)) if e.kind == StoreErrorKind::Other));
        assert_eq!(sink.count("orders", MigrationStatus::Error), 1);
        assert_eq!(sink.count("orders", MigrationStatus::Started), 0);
        assert!(engine.active_units().is_empty());
    }

    #[tokio::test]
    async fn resumable_run_needs_a_checkpoint_store() {
        let sink = Arc::new(RecordingSink::default());
        let engine =
            MigrationEngine::builder(Arc::new(MemorySource::new()), Arc::new(MemoryTarget::new()))
                .sink(sink.clone())
                .build();

        let result = engine
            .transfer_with_checkpoints(&request("orders"), "orders-run")
            .await;

        assert!(matches!(result, Err(MigrationError::NoCheckpointStore)));
        assert_eq!(sink.count("orders", MigrationStatus::Error), 1);
        assert!(engine.active_units().is_empty());
    }
}
