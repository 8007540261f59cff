//! Live change capture.
//!
//! Each unit gets a collection worker that mirrors inserts, updates,
//! replaces and deletes into the target. Each source database gets one
//! drop worker (key `"{db}.dropEvents"`) that watches for collection and
//! database drops regardless of which collections are being migrated.
//! Workers are tokio tasks registered in a [`WorkerRegistry`] under their
//! key; a worker always removes its own entry when it exits.
//!
//! A worker waits out store outages, reporting connection loss while its
//! unit is running, and then retries the event it was applying.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use docsync_document::{ID_FIELD, identifier::canonical_id, prepare_for_target};
use docsync_migration_models::{
    MigrationStatus, OperationType, TransferRequest, migration_key,
};
use docsync_store::{ChangeEvent, ChangeOperation, ChangeStream, CollectionHandle, StoreError};
use futures::StreamExt as _;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::EngineInner;
use crate::drop::handle_drop;
use crate::write::{WriteOutcome, upsert_document};

/// Registry key of a database's drop worker.
#[must_use]
pub fn drop_worker_key(database: &str) -> String {
    format!("{database}.dropEvents")
}

struct WorkerEntry {
    generation: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Running capture workers by key.
#[derive(Default)]
pub struct WorkerRegistry {
    entries: DashMap<String, WorkerEntry>,
    next_generation: AtomicU64,
}

impl WorkerRegistry {
    /// Spawns a worker under `key` unless a live one is already registered.
    /// The worker receives a child of `parent` and its generation, which it
    /// must pass to [`WorkerRegistry::release`] on exit.
    pub fn spawn_if_absent<F, Fut>(&self, key: String, parent: &CancellationToken, worker: F) -> bool
    where
        F: FnOnce(CancellationToken, u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let spawn = |worker: F| {
            let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
            let token = parent.child_token();
            let handle = tokio::spawn(worker(token.clone(), generation));
            WorkerEntry {
                generation,
                token,
                handle,
            }
        };

        match self.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                if !entry.get().token.is_cancelled() {
                    return false;
                }
                log::debug!("Replacing stopped worker {}", entry.key());
                entry.insert(spawn(worker));
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(spawn(worker));
                true
            }
        }
    }

    /// Removes `key` if it still belongs to `generation`.
    pub fn release(&self, key: &str, generation: u64) {
        self.entries
            .remove_if(key, |_, entry| entry.generation == generation);
    }

    /// Cancels and unregisters one worker. Returns `false` if none ran.
    pub fn stop(&self, key: &str) -> bool {
        self.entries.remove(key).is_some_and(|(_, entry)| {
            entry.token.cancel();
            true
        })
    }

    /// Cancels and unregisters every worker, returning their join handles.
    pub fn stop_all(&self) -> Vec<JoinHandle<()>> {
        let keys: Vec<_> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.iter()
            .filter_map(|key| self.entries.remove(key))
            .map(|(_, entry)| {
                entry.token.cancel();
                entry.handle
            })
            .collect()
    }

    /// Keys of every registered worker, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

/// Starts the collection worker for `request` and, if its database has
/// none yet, the database drop worker.
pub fn start(ctx: &Arc<EngineInner>, request: &TransferRequest) {
    let key = request.migration_key();
    ctx.known_requests.insert(key.clone(), request.clone());
    let parent = ctx.stop.current();

    let spawned = ctx.workers.spawn_if_absent(key.clone(), &parent, |token, generation| {
        run_collection_worker(Arc::clone(ctx), request.clone(), token, generation)
    });
    if spawned {
        log::info!("Started change capture for {key}");
    }

    let drop_key = drop_worker_key(&request.source_database);
    let spawned = ctx.workers.spawn_if_absent(drop_key.clone(), &parent, |token, generation| {
        run_database_worker(Arc::clone(ctx), request.clone(), token, generation)
    });
    if spawned {
        log::info!("Started drop listener {drop_key}");
    }
}

enum Flow {
    Continue,
    Terminate,
}

/// Opens a feed, waiting out retryable failures. `None` means the worker
/// should exit.
async fn open_feed<F, Fut>(
    ctx: &EngineInner,
    label: &str,
    token: &CancellationToken,
    mut open: F,
) -> Option<ChangeStream>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ChangeStream, StoreError>>,
{
    loop {
        if token.is_cancelled() {
            return None;
        }
        match open().await {
            Ok(stream) => return Some(stream),
            Err(e) if e.is_retryable() => {
                log::warn!("Could not open change feed for {label}: {e}, waiting for stores");
                if !ctx.supervisor.wait_until_healthy(token).await {
                    return None;
                }
            }
            Err(e) => {
                log::error!("Could not open change feed for {label}: {e}");
                return None;
            }
        }
    }
}

/// Reads the next event. `None` means the worker should exit; a
/// retryable feed error yields `Some(Err(..))` so the caller can reopen.
async fn next_event(
    stream: &mut ChangeStream,
    label: &str,
    token: &CancellationToken,
) -> Option<Result<ChangeEvent, StoreError>> {
    let next = tokio::select! {
        () = token.cancelled() => return None,
        next = stream.next() => next,
    };

    match next {
        None => {
            log::info!("Change feed for {label} closed");
            None
        }
        Some(Err(e)) if !e.is_retryable() => {
            log::error!("Change feed for {label} failed: {e}");
            None
        }
        other => other,
    }
}

/// Waits out a retryable failure hit by `key`'s capture worker. While the
/// unit is still running it enters the connection-lost state; otherwise
/// the worker only waits for both stores. Returns `false` if `token` fired.
async fn wait_out(
    ctx: &EngineInner,
    key: &str,
    error: &StoreError,
    token: &CancellationToken,
) -> bool {
    match ctx.units.get(key) {
        Some(unit) => ctx.supervisor.recover(&unit, error, token).await,
        None => {
            log::warn!("Change capture for {key} hit {error}, waiting for stores");
            ctx.supervisor.wait_until_healthy(token).await
        }
    }
}

/// Runs `op` until it succeeds or fails with a non-retryable error,
/// waiting out every outage in between. `None` means `token` fired.
async fn until_settled<T, F, Fut>(
    ctx: &EngineInner,
    key: &str,
    token: &CancellationToken,
    mut op: F,
) -> Option<Result<T, StoreError>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    loop {
        if token.is_cancelled() {
            return None;
        }
        match op().await {
            Err(e) if e.is_retryable() => {
                if !wait_out(ctx, key, &e, token).await {
                    return None;
                }
            }
            result => return Some(result),
        }
    }
}

async fn run_collection_worker(
    ctx: Arc<EngineInner>,
    request: TransferRequest,
    token: CancellationToken,
    generation: u64,
) {
    let key = request.migration_key();
    collection_worker(&ctx, &request, &key, &token).await;
    ctx.workers.release(&key, generation);
    log::debug!("Change capture for {key} exited");
}

async fn collection_worker(
    ctx: &EngineInner,
    request: &TransferRequest,
    key: &str,
    token: &CancellationToken,
) {
    if !ctx.source.supports_change_streams().await {
        log::warn!("Source does not support change streams, live capture for {key} is disabled");
        return;
    }

    let handle = match until_settled(ctx, key, token, || {
        ctx.target.resolve_collection(
            &request.target_bucket,
            &request.target_scope,
            &request.target_collection,
        )
    })
    .await
    {
        Some(Ok(handle)) => handle,
        Some(Err(e)) => {
            log::error!("Change capture for {key} could not resolve its target: {e}");
            return;
        }
        None => return,
    };

    loop {
        let Some(mut stream) = open_feed(ctx, key, token, || {
            ctx.source
                .watch_collection(&request.source_database, &request.source_collection)
        })
        .await
        else {
            return;
        };

        loop {
            match next_event(&mut stream, key, token).await {
                None => return,
                Some(Err(e)) => {
                    log::warn!("Change feed for {key} interrupted: {e}, reopening");
                    if !wait_out(ctx, key, &e, token).await {
                        return;
                    }
                    break;
                }
                Some(Ok(event)) => {
                    if let Flow::Terminate = apply_event(ctx, request, &handle, event, token).await {
                        return;
                    }
                }
            }
        }
    }
}

async fn apply_event(
    ctx: &EngineInner,
    request: &TransferRequest,
    handle: &CollectionHandle,
    event: ChangeEvent,
    token: &CancellationToken,
) -> Flow {
    match event.operation {
        ChangeOperation::Insert | ChangeOperation::Update | ChangeOperation::Replace => {
            apply_write(ctx, request, handle, event, token).await;
            Flow::Continue
        }
        ChangeOperation::Delete => {
            apply_delete(ctx, request, handle, event, token).await;
            Flow::Continue
        }
        ChangeOperation::Drop | ChangeOperation::DropDatabase => {
            if let Err(e) = handle_drop(ctx, request, token).await {
                log::error!(
                    "Failed to delete documents of dropped collection {}: {e}",
                    request.migration_key()
                );
            }
            Flow::Terminate
        }
        other => {
            log::info!(
                "Ignoring {other} event on {}",
                request.migration_key()
            );
            Flow::Continue
        }
    }
}

async fn apply_write(
    ctx: &EngineInner,
    request: &TransferRequest,
    handle: &CollectionHandle,
    event: ChangeEvent,
    token: &CancellationToken,
) {
    let key = request.migration_key();
    let Some(document) = event.full_document else {
        log::warn!("{} event on {key} carried no document, skipping", event.operation);
        return;
    };

    let prepared = match prepare_for_target(
        &document,
        &ctx.config.tag_field,
        &request.source_collection,
    ) {
        Ok(prepared) => prepared,
        Err(e) => {
            log::warn!("Skipping {} event on {key}: {e}", event.operation);
            return;
        }
    };

    let unit = ctx.units.get(&key);
    let outcome = upsert_document(
        ctx,
        handle,
        &prepared.id,
        &prepared.body,
        unit.as_deref(),
        token,
    )
    .await;

    if outcome == WriteOutcome::Committed
        && let Some(unit) = unit
    {
        let current_total = unit.record_insert();
        ctx.sink.emit(
            &unit
                .progress(MigrationStatus::CdcInsert, OperationType::Cdc)
                .with_counts(unit.transferred(), unit.initial_count(), current_total)
                .with_change_count(1)
                .with_detail("event", event.operation.as_ref())
                .with_detail("documentId", prepared.id),
        );
    }
}

async fn apply_delete(
    ctx: &EngineInner,
    request: &TransferRequest,
    handle: &CollectionHandle,
    event: ChangeEvent,
    token: &CancellationToken,
) {
    let key = request.migration_key();
    let Some(raw_id) = event.document_key else {
        log::warn!("Delete event on {key} carried no {ID_FIELD}, skipping");
        return;
    };
    let id = canonical_id(&raw_id);

    let exists = match until_settled(ctx, &key, token, || ctx.target.exists(handle, &id)).await {
        Some(Ok(exists)) => exists,
        Some(Err(e)) => {
            log::error!("Could not check {id} in {handle} for delete: {e}");
            return;
        }
        None => return,
    };
    if !exists {
        log::debug!("Deleted document {id} is not in {handle}, skipping");
        return;
    }

    match until_settled(ctx, &key, token, || ctx.target.remove(handle, &id)).await {
        Some(Ok(())) => {}
        Some(Err(e)) if e.is_not_found() => log::debug!("Document {id} was already removed"),
        Some(Err(e)) => {
            log::error!("Could not remove {id} from {handle}: {e}");
            return;
        }
        None => return,
    }

    if let Some(unit) = ctx.units.get(&key) {
        let current_total = unit.record_delete();
        ctx.sink.emit(
            &unit
                .progress(MigrationStatus::CdcDelete, OperationType::Cdc)
                .with_counts(unit.transferred(), unit.initial_count(), current_total)
                .with_change_count(1)
                .with_detail("event", "delete")
                .with_detail("documentId", id),
        );
    }
}

async fn run_database_worker(
    ctx: Arc<EngineInner>,
    request: TransferRequest,
    token: CancellationToken,
    generation: u64,
) {
    let key = drop_worker_key(&request.source_database);
    database_worker(&ctx, &request, &key, &token).await;
    ctx.workers.release(&key, generation);
    log::debug!("Drop listener {key} exited");
}

async fn database_worker(
    ctx: &EngineInner,
    started_with: &TransferRequest,
    key: &str,
    token: &CancellationToken,
) {
    if !ctx.source.supports_change_streams().await {
        log::warn!("Source does not support change streams, drop listener {key} is disabled");
        return;
    }
    let database = started_with.source_database.as_str();

    loop {
        let Some(mut stream) =
            open_feed(ctx, key, token, || ctx.source.watch_database(database)).await
        else {
            return;
        };

        loop {
            let event = match next_event(&mut stream, key, token).await {
                None => return,
                Some(Err(e)) => {
                    log::warn!("Drop listener {key} interrupted: {e}, reopening");
                    if !ctx.supervisor.wait_until_healthy(token).await {
                        return;
                    }
                    break;
                }
                Some(Ok(event)) => event,
            };

            let dropped = match (event.operation, event.namespace.collection) {
                (ChangeOperation::Drop, Some(collection)) => {
                    vec![request_for(ctx, started_with, &collection)]
                }
                (ChangeOperation::DropDatabase, _) => known_requests_in(ctx, database),
                _ => continue,
            };

            for request in &dropped {
                if let Err(e) = handle_drop(ctx, request, token).await {
                    log::error!(
                        "Failed to delete documents of dropped collection {}: {e}",
                        request.migration_key()
                    );
                }
                ctx.workers.stop(&request.migration_key());
            }
            return;
        }
    }
}

/// The known request for `database.collection`, or one built from the
/// worker's own request pointed at that collection.
fn request_for(ctx: &EngineInner, started_with: &TransferRequest, collection: &str) -> TransferRequest {
    ctx.known_requests
        .get(&migration_key(&started_with.source_database, collection))
        .map_or_else(
            || TransferRequest {
                source_collection: collection.to_string(),
                ..started_with.clone()
            },
            |entry| entry.value().clone(),
        )
}

fn known_requests_in(ctx: &EngineInner, database: &str) -> Vec<TransferRequest> {
    let mut requests: Vec<_> = ctx
        .known_requests
        .iter()
        .filter(|entry| entry.value().source_database == database)
        .map(|entry| entry.value().clone())
        .collect();
    requests.sort_by_key(TransferRequest::migration_key);
    requests
}
