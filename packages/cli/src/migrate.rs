//! The `migrate` command.
//!
//! Seeds an in-memory source from extended-JSON files, runs every selected
//! transfer concurrently with one progress bar each, and writes the target
//! collections out as JSON snapshots when done.

use std::sync::Arc;
use std::time::Instant;

use docsync_checkpoint::FileCheckpointStore;
use docsync_cli_utils::{IndicatifProgressSink, MultiProgress};
use docsync_migration::{MigrationEngine, MigrationError, StopHandle, TransferOutcome};
use docsync_store::memory::{MemorySource, MemoryTarget};

use crate::config::{DocsyncConfig, TransferEntry};

/// Runs `transfers` to completion, or until ctrl-c.
///
/// With `follow`, keeps mirroring live changes after the copies finish
/// until ctrl-c.
///
/// # Errors
///
/// Returns an error if seeding or the snapshot fails, or if any transfer
/// ended with an error.
pub async fn run(
    config: &DocsyncConfig,
    transfers: &[TransferEntry],
    follow: bool,
    multi: &MultiProgress,
) -> Result<(), Box<dyn std::error::Error>> {
    if transfers.is_empty() {
        log::warn!("No transfers to run");
        return Ok(());
    }

    let source = Arc::new(MemorySource::new());
    let loaded = source.load_dir(&config.source.seed_dir)?;
    log::info!(
        "Loaded {loaded} documents from {}",
        config.source.seed_dir.display()
    );

    let target = Arc::new(MemoryTarget::new());
    let engine = MigrationEngine::builder(source, target.clone())
        .sink(Arc::new(IndicatifProgressSink::new(multi)))
        .checkpoints(Arc::new(FileCheckpointStore::new(&config.checkpoints.dir)))
        .config(config.engine.clone())
        .build();

    let stop = engine.stop_handle();
    tokio::spawn(stop_on_ctrl_c(stop.clone()));

    let start = Instant::now();
    let results = futures::future::join_all(
        transfers
            .iter()
            .map(|entry| run_transfer(&engine, entry)),
    )
    .await;

    let mut failures = 0;
    for (entry, result) in transfers.iter().zip(results) {
        let key = entry.request.migration_key();
        match result {
            Ok(TransferOutcome::Completed(summary)) => log::info!(
                "{key}: {} documents ({} failed) in {:.1}s",
                summary.transferred,
                summary.failed,
                summary.elapsed.as_secs_f64()
            ),
            Ok(TransferOutcome::Stopped(summary)) => {
                log::warn!("{key}: stopped after {} documents", summary.transferred);
            }
            Ok(TransferOutcome::Dropped(_)) => log::warn!("{key}: source collection was dropped"),
            Err(e) => {
                log::error!("{key}: {e}");
                failures += 1;
            }
        }
    }
    log::info!(
        "All transfers finished in {:.1}s",
        start.elapsed().as_secs_f64()
    );

    if follow && !stop.is_stopped() {
        log::info!(
            "Following live changes on {} workers, press ctrl-c to stop",
            engine.active_workers().len()
        );
        stop.stopped().await;
    }
    engine.shutdown().await;

    let written = target.snapshot_to_dir(&config.target.output_dir)?;
    log::info!(
        "Wrote {written} target collections to {}",
        config.target.output_dir.display()
    );

    if failures > 0 {
        return Err(format!("{failures} of {} transfers failed", transfers.len()).into());
    }
    Ok(())
}

async fn run_transfer(
    engine: &MigrationEngine,
    entry: &TransferEntry,
) -> Result<TransferOutcome, MigrationError> {
    match &entry.checkpoint_id {
        Some(id) => engine.transfer_with_checkpoints(&entry.request, id).await,
        None => engine.transfer_collection(&entry.request).await,
    }
}

async fn stop_on_ctrl_c(stop: StopHandle) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => stop.stop(),
        Err(e) => log::error!("Could not listen for ctrl-c: {e}"),
    }
}
