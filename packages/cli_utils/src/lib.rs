#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared CLI utilities for docsync binaries.
//!
//! Provides [`IndicatifProgressSink`], which renders migration progress as
//! one `indicatif` bar per unit, plus [`init_logger`] which sets up
//! `indicatif-log-bridge` so that `log::info!` and friends are suspended
//! while progress bars redraw.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use docsync_migration::ProgressSink;
use docsync_migration_models::{MigrationProgress, MigrationStatus};
use indicatif::{ProgressBar, ProgressStyle};

pub use indicatif::MultiProgress;

/// Renders each unit's progress events on its own [`ProgressBar`].
///
/// A unit's bar is created on its first event as a spinner and becomes a
/// full bar once the initial count is known. Live changes move the bar's
/// length with the unit's current total.
pub struct IndicatifProgressSink {
    multi: MultiProgress,
    bars: Mutex<BTreeMap<String, ProgressBar>>,
    bar_style: ProgressStyle,
}

impl IndicatifProgressSink {
    #[must_use]
    pub fn new(multi: &MultiProgress) -> Self {
        let bar_style = ProgressStyle::with_template(
            "  {msg} {wide_bar:.cyan/dim} {pos}/{len} {percent}% [{eta}]",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");

        Self {
            multi: multi.clone(),
            bars: Mutex::new(BTreeMap::new()),
            bar_style,
        }
    }

    fn bars(&self) -> MutexGuard<'_, BTreeMap<String, ProgressBar>> {
        self.bars.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bar(&self, key: &str) -> ProgressBar {
        self.bars()
            .entry(key.to_string())
            .or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new_spinner());
                bar.enable_steady_tick(Duration::from_millis(100));
                bar.set_style(
                    ProgressStyle::with_template("{spinner:.cyan} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                bar.set_message(key.to_string());
                bar
            })
            .clone()
    }

    /// Current position of a unit's bar, if it has one.
    #[must_use]
    pub fn position(&self, key: &str) -> Option<u64> {
        self.bars().get(key).map(ProgressBar::position)
    }

    /// Length of a unit's bar, if it has one and it is known.
    #[must_use]
    pub fn length(&self, key: &str) -> Option<u64> {
        self.bars().get(key).and_then(ProgressBar::length)
    }
}

impl ProgressSink for IndicatifProgressSink {
    fn emit(&self, progress: &MigrationProgress) {
        let key = progress.migration_key();
        let bar = self.bar(&key);

        match progress.status {
            MigrationStatus::Initialized => {
                bar.set_length(progress.total);
                bar.set_position(progress.transferred);
                bar.set_style(self.bar_style.clone());
            }
            MigrationStatus::Started | MigrationStatus::Resumed => {
                bar.set_message(key);
            }
            MigrationStatus::InProgress => bar.set_position(progress.transferred),
            MigrationStatus::CdcInsert | MigrationStatus::CdcDelete => {
                bar.set_length(progress.current_total);
                bar.set_message(format!("{key} (live {})", progress.status));
            }
            MigrationStatus::ConnectionLost => {
                bar.set_message(format!("{key} (connection lost, waiting)"));
            }
            MigrationStatus::Completed => {
                bar.set_length(progress.total);
                bar.set_position(progress.transferred);
                bar.finish_with_message(format!(
                    "{key}: {} documents in {:.1}s ({:.0} docs/s)",
                    progress.transferred,
                    Duration::from_millis(progress.elapsed_ms).as_secs_f64(),
                    progress.speed
                ));
            }
            MigrationStatus::Error => {
                let error = progress
                    .details
                    .get("error")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("unknown error");
                bar.abandon_with_message(format!("{key}: failed: {error}"));
            }
            MigrationStatus::CollectionDropped => {
                bar.abandon_with_message(format!(
                    "{key}: source dropped, {} target documents deleted",
                    progress.change_count
                ));
            }
        }
    }
}

/// Initializes the global logger wrapped in `indicatif-log-bridge` so that
/// `log::info!` and friends are suspended while progress bars redraw.
///
/// Returns the [`MultiProgress`] that all progress bars must be added to.
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();

    let logger = pretty_env_logger::formatted_builder()
        .parse_env("RUST_LOG")
        .build();
    let level = logger.filter();

    indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .ok(); // already set in tests

    log::set_max_level(level);

    multi
}
