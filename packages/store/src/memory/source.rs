use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use docsync_document::{Document, ID_FIELD, Value, extjson};
use futures::StreamExt as _;
use futures::channel::mpsc;

use super::MemoryStoreError;
use crate::{
    ChangeEvent, ChangeOperation, ChangeStream, Namespace, SourceStore, StoreError, StoreErrorKind,
};

type EventSender = mpsc::UnboundedSender<Result<ChangeEvent, StoreError>>;

/// An in-memory source store.
///
/// Every mutation made through [`MemorySource::insert`],
/// [`MemorySource::update`], [`MemorySource::delete`] and the drop methods
/// is published to the open change feeds that cover it. Seeding with
/// [`MemorySource::seed`] or [`MemorySource::load_dir`] is silent.
pub struct MemorySource {
    state: Mutex<SourceState>,
    outage: Mutex<OutageState>,
    fetch_calls: AtomicU64,
    fetch_delay_ms: AtomicU64,
    change_streams: AtomicBool,
}

#[derive(Default)]
struct SourceState {
    databases: BTreeMap<String, BTreeMap<String, Vec<Document>>>,
    subscribers: Vec<Subscriber>,
}

struct Subscriber {
    namespace: Namespace,
    sender: EventSender,
}

impl Subscriber {
    fn wants(&self, namespace: &Namespace) -> bool {
        self.namespace.database == namespace.database
            && (self.namespace.collection.is_none()
                || namespace.collection.is_none()
                || self.namespace.collection == namespace.collection)
    }
}

#[derive(Default)]
struct OutageState {
    unavailable: bool,
    scheduled: Option<(u64, u32)>,
    active: bool,
    failing_pings: u32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key_of(document: &Document) -> Value {
    document.get(ID_FIELD).cloned().unwrap_or(Value::Null)
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    /// Creates an empty store that supports change feeds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SourceState::default()),
            outage: Mutex::new(OutageState::default()),
            fetch_calls: AtomicU64::new(0),
            fetch_delay_ms: AtomicU64::new(0),
            change_streams: AtomicBool::new(true),
        }
    }

    /// Appends documents to a collection without publishing events.
    pub fn seed(
        &self,
        database: &str,
        collection: &str,
        documents: impl IntoIterator<Item = Document>,
    ) {
        let mut state = lock(&self.state);
        state
            .databases
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default()
            .extend(documents);
    }

    /// Seeds from a directory laid out as `{dir}/{database}/{collection}.json`,
    /// each file holding extended JSON (an array or one document per line).
    ///
    /// Returns the number of documents loaded.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryStoreError`] if a file cannot be read or decoded.
    pub fn load_dir(&self, dir: &Path) -> Result<usize, MemoryStoreError> {
        let mut loaded = 0;

        let mut databases: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
        databases.sort_by_key(std::fs::DirEntry::path);

        for database in databases {
            if !database.file_type()?.is_dir() {
                continue;
            }
            let database_name = database.file_name().to_string_lossy().to_string();

            let mut files: Vec<_> =
                std::fs::read_dir(database.path())?.collect::<Result<_, _>>()?;
            files.sort_by_key(std::fs::DirEntry::path);

            for file in files {
                let path = file.path();
                if path.extension().is_none_or(|ext| ext != "json") {
                    continue;
                }
                let Some(collection) = path.file_stem().map(|s| s.to_string_lossy().to_string())
                else {
                    continue;
                };

                let text = std::fs::read_to_string(&path)?;
                let documents = extjson::documents_from_str(&text).map_err(|source| {
                    MemoryStoreError::Document {
                        path: path.display().to_string(),
                        source,
                    }
                })?;

                log::debug!(
                    "Seeded {database_name}.{collection} with {} documents",
                    documents.len()
                );
                loaded += documents.len();
                self.seed(&database_name, &collection, documents);
            }
        }

        Ok(loaded)
    }

    /// Marks the deployment as unable to produce change feeds.
    pub fn set_change_streams_supported(&self, supported: bool) {
        self.change_streams.store(supported, Ordering::SeqCst);
    }

    /// Delays every [`SourceStore::fetch_batch`] call.
    pub fn set_fetch_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.fetch_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Makes every operation fail with a connection timeout until turned
    /// back on.
    pub fn set_available(&self, available: bool) {
        lock(&self.outage).unavailable = !available;
    }

    /// Starts an outage on the `on_fetch`-th call to
    /// [`SourceStore::fetch_batch`] (counted from creation, 1-based). While
    /// the outage lasts every operation fails with a connection timeout.
    /// It ends on the first [`SourceStore::ping`] after `failing_pings`
    /// pings have failed.
    pub fn schedule_outage(&self, on_fetch: u64, failing_pings: u32) {
        lock(&self.outage).scheduled = Some((on_fetch, failing_pings));
    }

    /// Number of [`SourceStore::fetch_batch`] calls so far.
    #[must_use]
    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of change feeds still open.
    #[must_use]
    pub fn open_feeds(&self) -> usize {
        let mut state = lock(&self.state);
        state.subscribers.retain(|s| !s.sender.is_closed());
        state.subscribers.len()
    }

    /// Returns a copy of a collection's documents in cursor order.
    #[must_use]
    pub fn documents(&self, database: &str, collection: &str) -> Vec<Document> {
        lock(&self.state)
            .databases
            .get(database)
            .and_then(|collections| collections.get(collection))
            .cloned()
            .unwrap_or_default()
    }

    /// Inserts a document and publishes an insert event.
    pub fn insert(&self, database: &str, collection: &str, document: Document) {
        let mut state = lock(&self.state);
        let key = key_of(&document);
        state
            .databases
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default()
            .push(document.clone());
        Self::publish(
            &mut state,
            &ChangeEvent::document(
                ChangeOperation::Insert,
                Namespace::collection(database, collection),
                key,
                Some(document),
            ),
        );
    }

    /// Replaces the document with the same `_id` (inserting it if absent)
    /// and publishes an update event carrying the post-image.
    pub fn update(&self, database: &str, collection: &str, document: Document) {
        self.write(ChangeOperation::Update, database, collection, document);
    }

    /// Like [`MemorySource::update`] but publishes a replace event.
    pub fn replace(&self, database: &str, collection: &str, document: Document) {
        self.write(ChangeOperation::Replace, database, collection, document);
    }

    fn write(
        &self,
        operation: ChangeOperation,
        database: &str,
        collection: &str,
        document: Document,
    ) {
        let mut state = lock(&self.state);
        let key = key_of(&document);
        let documents = state
            .databases
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default();

        match documents.iter_mut().find(|d| key_of(d) == key) {
            Some(existing) => existing.clone_from(&document),
            None => documents.push(document.clone()),
        }

        Self::publish(
            &mut state,
            &ChangeEvent::document(
                operation,
                Namespace::collection(database, collection),
                key,
                Some(document),
            ),
        );
    }

    /// Deletes the document with the given `_id`. Publishes a delete event
    /// and returns `true` if it existed.
    pub fn delete(&self, database: &str, collection: &str, id: &Value) -> bool {
        let mut state = lock(&self.state);
        let Some(documents) = state
            .databases
            .get_mut(database)
            .and_then(|collections| collections.get_mut(collection))
        else {
            return false;
        };

        let before = documents.len();
        documents.retain(|d| key_of(d) != *id);
        if documents.len() == before {
            return false;
        }

        Self::publish(
            &mut state,
            &ChangeEvent::document(
                ChangeOperation::Delete,
                Namespace::collection(database, collection),
                id.clone(),
                None,
            ),
        );
        true
    }

    /// Drops a collection. Publishes a drop event and closes the feeds
    /// watching that collection. Returns `false` if it did not exist.
    pub fn drop_collection(&self, database: &str, collection: &str) -> bool {
        let mut state = lock(&self.state);
        let existed = state
            .databases
            .get_mut(database)
            .and_then(|collections| collections.remove(collection))
            .is_some();
        if !existed {
            return false;
        }

        let namespace = Namespace::collection(database, collection);
        Self::publish(
            &mut state,
            &ChangeEvent::structural(ChangeOperation::Drop, namespace.clone()),
        );
        state.subscribers.retain(|s| s.namespace != namespace);
        true
    }

    /// Drops a whole database. Publishes a drop-database event and closes
    /// every feed on that database. Returns `false` if it did not exist.
    pub fn drop_database(&self, database: &str) -> bool {
        let mut state = lock(&self.state);
        if state.databases.remove(database).is_none() {
            return false;
        }

        Self::publish(
            &mut state,
            &ChangeEvent::structural(ChangeOperation::DropDatabase, Namespace::database(database)),
        );
        state.subscribers.retain(|s| s.namespace.database != database);
        true
    }

    /// Fails every open feed with a timeout and closes it, as a dropped
    /// connection would.
    pub fn interrupt_feeds(&self) {
        let mut state = lock(&self.state);
        for subscriber in state.subscribers.drain(..) {
            let _ = subscriber.sender.unbounded_send(Err(StoreError::on_source(
                StoreErrorKind::Timeout,
                "change feed interrupted",
            )));
        }
    }

    fn publish(state: &mut SourceState, event: &ChangeEvent) {
        state.subscribers.retain(|s| {
            !s.wants(&event.namespace) || s.sender.unbounded_send(Ok(event.clone())).is_ok()
        });
    }

    fn check_available(&self) -> Result<(), StoreError> {
        let outage = lock(&self.outage);
        if outage.unavailable || outage.active {
            return Err(StoreError::on_source(
                StoreErrorKind::ConnectionTimeout,
                "source unavailable",
            ));
        }
        Ok(())
    }

    fn subscribe(&self, namespace: Namespace) -> Result<ChangeStream, StoreError> {
        self.check_available()?;
        let (sender, receiver) = mpsc::unbounded();
        lock(&self.state)
            .subscribers
            .push(Subscriber { namespace, sender });
        Ok(receiver.boxed())
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn count(&self, database: &str, collection: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let state = lock(&self.state);
        let count = state
            .databases
            .get(database)
            .and_then(|collections| collections.get(collection))
            .map_or(0, Vec::len);
        Ok(count as u64)
    }

    async fn fetch_batch(
        &self,
        database: &str,
        collection: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Document>, StoreError> {
        let delay = self.fetch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let call = self.fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut outage = lock(&self.outage);
            if let Some((on_fetch, failing_pings)) = outage.scheduled
                && call >= on_fetch
            {
                log::debug!("Simulated source outage starting on fetch {call}");
                outage.scheduled = None;
                outage.active = true;
                outage.failing_pings = failing_pings;
            }
        }
        self.check_available()?;

        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let state = lock(&self.state);
        Ok(state
            .databases
            .get(database)
            .and_then(|collections| collections.get(collection))
            .map(|documents| documents.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut outage = lock(&self.outage);
        if outage.unavailable {
            return Err(StoreError::on_source(
                StoreErrorKind::ConnectionTimeout,
                "source unavailable",
            ));
        }
        if outage.active {
            if outage.failing_pings > 0 {
                outage.failing_pings -= 1;
                return Err(StoreError::on_source(
                    StoreErrorKind::ConnectionTimeout,
                    "source unavailable",
                ));
            }
            log::debug!("Simulated source outage over");
            outage.active = false;
        }
        Ok(())
    }

    async fn watch_collection(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<ChangeStream, StoreError> {
        self.subscribe(Namespace::collection(database, collection))
    }

    async fn watch_database(&self, database: &str) -> Result<ChangeStream, StoreError> {
        self.subscribe(Namespace::database(database))
    }

    async fn supports_change_streams(&self) -> bool {
        self.change_streams.load(Ordering::SeqCst)
    }
}
