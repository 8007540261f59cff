use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::MemoryStoreError;
use crate::{CollectionHandle, StoreError, StoreErrorKind, TargetStore};

type Collection = BTreeMap<String, serde_json::Value>;

/// An in-memory target store keyed by [`CollectionHandle`] and document id.
pub struct MemoryTarget {
    collections: Mutex<BTreeMap<CollectionHandle, Collection>>,
    rejected_ids: Mutex<BTreeSet<String>>,
    available: AtomicBool,
    failing_bulk_deletes: AtomicU32,
    upsert_delay_ms: AtomicU64,
    upserts: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn tagged(body: &serde_json::Value, tag_field: &str, tag_value: &str) -> bool {
    body.get(tag_field).and_then(serde_json::Value::as_str) == Some(tag_value)
}

impl Default for MemoryTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTarget {
    #[must_use]
    pub fn new() -> Self {
        Self {
            collections: Mutex::new(BTreeMap::new()),
            rejected_ids: Mutex::new(BTreeSet::new()),
            available: AtomicBool::new(true),
            failing_bulk_deletes: AtomicU32::new(0),
            upsert_delay_ms: AtomicU64::new(0),
            upserts: AtomicU64::new(0),
        }
    }

    /// Makes every upsert of `id` fail with a non-retryable error.
    pub fn reject_id(&self, id: impl Into<String>) {
        lock(&self.rejected_ids).insert(id.into());
    }

    /// Makes every operation fail with a connection timeout until turned
    /// back on.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Holds every upsert for `delay` before it is applied.
    pub fn set_upsert_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.upsert_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Makes the next `count` bulk deletes fail with a timeout.
    pub fn fail_bulk_deletes(&self, count: u32) {
        self.failing_bulk_deletes.store(count, Ordering::SeqCst);
    }

    /// Number of committed upserts since creation.
    #[must_use]
    pub fn upsert_count(&self) -> u64 {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Returns the body stored under `id`.
    #[must_use]
    pub fn get(&self, handle: &CollectionHandle, id: &str) -> Option<serde_json::Value> {
        lock(&self.collections)
            .get(handle)
            .and_then(|collection| collection.get(id))
            .cloned()
    }

    /// Returns a copy of every document in a collection, keyed by id.
    #[must_use]
    pub fn documents(&self, handle: &CollectionHandle) -> BTreeMap<String, serde_json::Value> {
        lock(&self.collections)
            .get(handle)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of documents in a collection.
    #[must_use]
    pub fn len(&self, handle: &CollectionHandle) -> usize {
        lock(&self.collections).get(handle).map_or(0, BTreeMap::len)
    }

    /// Whether a collection holds no documents.
    #[must_use]
    pub fn is_empty(&self, handle: &CollectionHandle) -> bool {
        self.len(handle) == 0
    }

    /// Writes every collection to `{dir}/{bucket}/{scope}/{collection}.json`
    /// as a pretty-printed JSON object of id to body. Returns the number of
    /// files written.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryStoreError`] if a file cannot be written.
    pub fn snapshot_to_dir(&self, dir: &Path) -> Result<usize, MemoryStoreError> {
        let collections = lock(&self.collections).clone();

        for (handle, documents) in &collections {
            let scope_dir = dir.join(&handle.bucket).join(&handle.scope);
            std::fs::create_dir_all(&scope_dir)?;
            let path = scope_dir.join(format!("{}.json", handle.collection));
            std::fs::write(&path, serde_json::to_string_pretty(documents)?)?;
            log::debug!(
                "Wrote {} documents to {}",
                documents.len(),
                path.display()
            );
        }

        Ok(collections.len())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::on_target(
                StoreErrorKind::ConnectionTimeout,
                "target unavailable",
            ))
        }
    }
}

#[async_trait]
impl TargetStore for MemoryTarget {
    async fn resolve_collection(
        &self,
        bucket: &str,
        scope: &str,
        collection: &str,
    ) -> Result<CollectionHandle, StoreError> {
        self.check_available()?;
        let handle = CollectionHandle::new(bucket, scope, collection);
        lock(&self.collections).entry(handle.clone()).or_default();
        Ok(handle)
    }

    async fn upsert(
        &self,
        handle: &CollectionHandle,
        id: &str,
        body: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let delay = self.upsert_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if lock(&self.rejected_ids).contains(id) {
            return Err(StoreError::on_target(
                StoreErrorKind::Other,
                format!("document {id} rejected"),
            ));
        }

        lock(&self.collections)
            .entry(handle.clone())
            .or_default()
            .insert(id.to_string(), body.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, handle: &CollectionHandle, id: &str) -> Result<(), StoreError> {
        self.check_available()?;
        lock(&self.collections)
            .get_mut(handle)
            .and_then(|collection| collection.remove(id))
            .map(|_| ())
            .ok_or_else(|| {
                StoreError::on_target(StoreErrorKind::NotFound, format!("document {id} not found"))
            })
    }

    async fn exists(&self, handle: &CollectionHandle, id: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(lock(&self.collections)
            .get(handle)
            .is_some_and(|collection| collection.contains_key(id)))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn count_by_tag(
        &self,
        handle: &CollectionHandle,
        tag_field: &str,
        tag_value: &str,
    ) -> Result<u64, StoreError> {
        self.check_available()?;
        let count = lock(&self.collections).get(handle).map_or(0, |collection| {
            collection
                .values()
                .filter(|body| tagged(body, tag_field, tag_value))
                .count()
        });
        Ok(count as u64)
    }

    async fn bulk_delete_by_tag(
        &self,
        handle: &CollectionHandle,
        tag_field: &str,
        tag_value: &str,
    ) -> Result<u64, StoreError> {
        self.check_available()?;

        let pending = self.failing_bulk_deletes.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_bulk_deletes.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::on_target(
                StoreErrorKind::Timeout,
                "bulk delete timed out",
            ));
        }

        let mut collections = lock(&self.collections);
        let Some(collection) = collections.get_mut(handle) else {
            return Ok(0);
        };
        let before = collection.len();
        collection.retain(|_, body| !tagged(body, tag_field, tag_value));
        Ok((before - collection.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> CollectionHandle {
        CollectionHandle::new("bucket", "scope", "items")
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let target = MemoryTarget::new();
        let handle = target
            .resolve_collection("bucket", "scope", "items")
            .await
            .unwrap();

        target
            .upsert(&handle, "a", &serde_json::json!({"v": 1}))
            .await
            .unwrap();
        target
            .upsert(&handle, "a", &serde_json::json!({"v": 2}))
            .await
            .unwrap();

        assert_eq!(target.len(&handle), 1);
        assert_eq!(target.get(&handle, "a"), Some(serde_json::json!({"v": 2})));
        assert_eq!(target.upsert_count(), 2);
    }

    #[tokio::test]
    async fn remove_missing_is_not_found() {
        let target = MemoryTarget::new();
        let err = target.remove(&handle(), "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn rejected_ids_fail_permanently() {
        let target = MemoryTarget::new();
        target.reject_id("bad");
        let err = target
            .upsert(&handle(), "bad", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(target.upsert_count(), 0);
    }

    #[tokio::test]
    async fn unavailable_target_fails_retryably() {
        let target = MemoryTarget::new();
        target.set_available(false);
        assert!(target.ping().await.unwrap_err().is_retryable());
        target.set_available(true);
        assert!(target.ping().await.is_ok());
    }

    #[tokio::test]
    async fn bulk_delete_only_touches_tagged_documents() {
        let target = MemoryTarget::new();
        let handle = handle();
        for (id, tag) in [("1", "collA"), ("2", "collA"), ("3", "collB")] {
            target
                .upsert(&handle, id, &serde_json::json!({"sourceCollection": tag}))
                .await
                .unwrap();
        }

        assert_eq!(
            target
                .count_by_tag(&handle, "sourceCollection", "collA")
                .await
                .unwrap(),
            2
        );

        target.fail_bulk_deletes(1);
        assert!(
            target
                .bulk_delete_by_tag(&handle, "sourceCollection", "collA")
                .await
                .unwrap_err()
                .is_timeout_or_interrupt()
        );
        assert_eq!(
            target
                .bulk_delete_by_tag(&handle, "sourceCollection", "collA")
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            target.documents(&handle).keys().collect::<Vec<_>>(),
            vec!["3"]
        );
    }

    #[tokio::test]
    async fn snapshot_writes_one_file_per_collection() {
        let dir = std::env::temp_dir().join("docsync_memory_target_snapshot");
        let _ = std::fs::remove_dir_all(&dir);

        let target = MemoryTarget::new();
        target
            .upsert(&handle(), "a", &serde_json::json!({"v": 1}))
            .await
            .unwrap();

        assert_eq!(target.snapshot_to_dir(&dir).unwrap(), 1);
        let written: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.join("bucket").join("scope").join("items.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(written, serde_json::json!({"a": {"v": 1}}));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
