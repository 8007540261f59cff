#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Durable storage for [`Checkpoint`]s.
//!
//! The resumable transfer loads a checkpoint by id at start, replaces it
//! after every completed batch, and deletes it once the unit completes.
//! [`FileCheckpointStore`] keeps one JSON file per checkpoint;
//! [`MemoryCheckpointStore`] is process-local.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use docsync_migration_models::Checkpoint;

/// Errors from a checkpoint store.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// I/O error (file read/write).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A checkpoint could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The id cannot be used as a storage key.
    #[error("Invalid checkpoint id {id:?}")]
    InvalidId {
        /// The rejected id.
        id: String,
    },
}

/// Key-value storage of checkpoints by id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Returns the checkpoint stored under `id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the store cannot be read.
    async fn load(&self, id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Stores `checkpoint`, replacing any previous one with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the checkpoint cannot be written.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Removes the checkpoint stored under `id`. Removing an absent
    /// checkpoint is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the checkpoint cannot be removed.
    async fn delete(&self, id: &str) -> Result<(), CheckpointError>;

    /// Returns every stored checkpoint, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the store cannot be read.
    async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError>;
}

/// Process-local checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: DashMap<String, Checkpoint>,
}

impl MemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.checkpoints.get(id).map(|entry| entry.value().clone()))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.checkpoints
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), CheckpointError> {
        self.checkpoints.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let mut checkpoints: Vec<_> = self
            .checkpoints
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        checkpoints.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(checkpoints)
    }
}

/// Stores each checkpoint as `{dir}/{id}.json`.
///
/// Writes go to a temporary file that is renamed over the previous one, so
/// a crash mid-write leaves the last complete checkpoint in place.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Creates a store rooted at `dir`. The directory is created on first
    /// write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory checkpoints are written to.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, CheckpointError> {
        if id.is_empty()
            || id.starts_with('.')
            || id.contains(['/', '\\'])
            || id.chars().any(char::is_control)
        {
            return Err(CheckpointError::InvalidId { id: id.to_string() });
        }
        Ok(self.dir.join(format!("{id}.json")))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(&checkpoint.id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(checkpoint)?).await?;
        tokio::fs::rename(&tmp, &path).await?;

        log::debug!(
            "Saved checkpoint {} ({} transferred)",
            checkpoint.id,
            checkpoint.success_count
        );
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), CheckpointError> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                log::debug!("Deleted checkpoint {id}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut checkpoints = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let text = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<Checkpoint>(&text) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => log::warn!("Skipping unreadable checkpoint {}: {e}", path.display()),
            }
        }

        checkpoints.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(checkpoints)
    }
}
