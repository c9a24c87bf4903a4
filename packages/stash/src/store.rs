//! The top-level document store.
//!
//! A [`Store`] keeps every document in a [`PathTrie`], tracks which
//! documents each document depends on, queues change events, and hands
//! persisted collections to a [`Persistor`]. All in-memory changes are
//! synchronous; only persistence and deferred delivery run as local tasks.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::{Rc, Weak};

use serde_json::{json, Value as JsonValue};
use stash_core_store::{Path, PathTrie, RefCountedPathStore};
use stash_json_store::{FlushReport, HydrationReport, PersistOp, Persistor};
use tokio::sync::broadcast;

use crate::broadcast::{BroadcastManager, ChangeEvent, EventKind, ObserverId};
use crate::config::{DeliveryMode, StoreConfig};
use crate::{Error, Result};

/// Cheap-to-clone handle to one store.
///
/// The store is single-threaded. With persistence or
/// [`DeliveryMode::Deferred`] it spawns local tasks, so it must be used
/// inside a `tokio::task::LocalSet`.
///
/// # Example
///
/// ```rust
/// use serde_json::json;
/// use stash::{path, DeliveryMode, EventKind, Store, StoreConfig};
///
/// let store = Store::new(StoreConfig::new().with_delivery(DeliveryMode::Manual)).unwrap();
/// store.write(&path!("users/alice"), json!({"name": "Alice"}), EventKind::Added).unwrap();
///
/// assert_eq!(store.get(&path!("users/alice")), Some(json!({"name": "Alice"})));
/// assert_eq!(store.get_all(&path!("users")).unwrap().len(), 1);
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Rc<Inner>,
}

struct Inner {
    config: StoreConfig,
    documents: RefCell<PathTrie<JsonValue>>,
    /// How many documents depend on each path.
    dependents: RefCell<RefCountedPathStore<()>>,
    /// What each document depends on, as last computed.
    dependencies: RefCell<BTreeMap<Path, BTreeSet<Path>>>,
    broadcast: RefCell<BroadcastManager>,
    delivery_scheduled: Cell<bool>,
    persistor: Option<Persistor>,
}

impl Store {
    /// Create an empty store. Nothing is read from disk; see
    /// [`open`](Self::open).
    pub fn new(config: StoreConfig) -> Result<Self> {
        let persistor = match &config.persistence {
            Some(persistence) if persistence.enabled => Some(Persistor::new(persistence.clone())?),
            _ => None,
        };

        Ok(Self {
            inner: Rc::new(Inner {
                config,
                documents: RefCell::new(PathTrie::new()),
                dependents: RefCell::new(RefCountedPathStore::new()),
                dependencies: RefCell::new(BTreeMap::new()),
                broadcast: RefCell::new(BroadcastManager::new()),
                delivery_scheduled: Cell::new(false),
                persistor,
            }),
        })
    }

    /// Create a store and load every persisted document into it.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let store = Self::new(config)?;
        store.hydrate().await?;
        Ok(store)
    }

    /// Load persisted documents. Each one is announced as
    /// [`EventKind::Hydrated`] and is not written back to disk. Documents
    /// already in memory are kept.
    pub async fn hydrate(&self) -> Result<HydrationReport> {
        let Some(persistor) = &self.inner.persistor else {
            return Ok(HydrationReport::default());
        };
        let report = persistor.hydrate().await?;

        let mut loaded = 0;
        for (path, value) in &report.documents {
            if !path.is_document() || self.exists(path) {
                continue;
            }
            self.apply_write(path, value.clone(), EventKind::Hydrated, false);
            loaded += 1;
        }
        log::debug!("Loaded {} persisted document(s)", loaded);
        Ok(report)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Write a document and announce it as `kind`.
    pub fn write(&self, path: &Path, value: JsonValue, kind: EventKind) -> Result<()> {
        require_document(path)?;
        self.apply_write(path, value, kind, true);
        Ok(())
    }

    /// Write a document, announced as added or modified depending on
    /// whether it existed.
    pub fn set(&self, path: &Path, value: JsonValue) -> Result<()> {
        let kind = if self.exists(path) {
            EventKind::Modified
        } else {
            EventKind::Added
        };
        self.write(path, value, kind)
    }

    pub fn add(&self, path: &Path, value: JsonValue) -> Result<()> {
        self.write(path, value, EventKind::Added)
    }

    fn apply_write(&self, path: &Path, value: JsonValue, kind: EventKind, persist: bool) {
        let inner = &self.inner;
        let depends_on: BTreeSet<Path> = inner
            .config
            .dependencies_for(path)
            .map(|builder| builder(&value).into_iter().collect())
            .unwrap_or_default();
        self.set_dependencies(path, depends_on);

        if let Some(persistor) = self.persistor_for(path).filter(|_| persist) {
            persistor.enqueue(PersistOp::Write {
                path: path.clone(),
                value: value.clone(),
            });
        }

        inner.documents.borrow_mut().insert(path, value);
        inner.broadcast.borrow_mut().enqueue(path, kind);
        self.schedule_delivery();
    }

    /// Delete a document or a collection, with everything nested under it.
    /// Returns whether any document was removed.
    pub fn delete(&self, path: &Path) -> Result<bool> {
        if path.is_empty() {
            return Err(Error::InvalidPath {
                path: path.clone(),
                expected: "document or collection",
            });
        }
        let inner = &self.inner;

        let removed: Vec<Path> = inner
            .documents
            .borrow()
            .iter_prefix(path)
            .map(|(path, _)| path)
            .collect();
        inner.documents.borrow_mut().remove_subtree(path);

        for document in &removed {
            self.set_dependencies(document, BTreeSet::new());
        }
        inner
            .broadcast
            .borrow_mut()
            .enqueue_removal_under(path, removed.iter().cloned());

        if !removed.is_empty() {
            if let Some(persistor) = &inner.persistor {
                persistor.enqueue(PersistOp::Delete { path: path.clone() });
            }
        }
        self.schedule_delivery();
        Ok(!removed.is_empty())
    }

    pub fn get(&self, path: &Path) -> Option<JsonValue> {
        self.inner.documents.borrow().get(path).cloned()
    }

    /// Documents directly inside a collection, keyed by id. `None` if the
    /// collection was never written or was deleted as a whole.
    pub fn get_all(&self, collection: &Path) -> Option<BTreeMap<String, JsonValue>> {
        let documents = self.inner.documents.borrow();
        let found = documents.get_all(collection)?;
        Some(
            found
                .into_iter()
                .map(|(id, value)| (id, value.clone()))
                .collect(),
        )
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.inner.documents.borrow().contains(path)
    }

    pub fn len(&self) -> usize {
        self.inner.documents.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.documents.borrow().is_empty()
    }

    /// Observe changes to `path` and everything under it.
    ///
    /// The observer runs during a delivery pass, once per merged event.
    /// Dropping the returned [`Subscription`] unregisters it.
    pub fn subscribe<F>(&self, path: &Path, observer: F) -> Subscription
    where
        F: Fn(&ChangeEvent, Option<&JsonValue>) + 'static,
    {
        let id = self
            .inner
            .broadcast
            .borrow_mut()
            .register(path, Rc::new(observer));
        Subscription {
            store: Rc::downgrade(&self.inner),
            path: path.clone(),
            id: Some(id),
        }
    }

    /// Deliver every pending event now. Returns the number of events.
    ///
    /// Observers may write, delete and (un)subscribe; their writes are
    /// queued for the next pass.
    pub fn deliver_pending(&self) -> usize {
        let inner = &self.inner;
        inner.delivery_scheduled.set(false);
        let events = inner.broadcast.borrow_mut().take_pending();

        for event in &events {
            let observers = inner.broadcast.borrow().observers_for(&event.path);
            if observers.is_empty() {
                continue;
            }
            let value = match event.kind {
                EventKind::Removed => None,
                _ => self.get(&event.path),
            };
            for observer in observers {
                observer(event, value.as_ref());
            }
        }
        events.len()
    }

    /// Events waiting for the next delivery pass.
    pub fn pending_events(&self) -> Vec<ChangeEvent> {
        self.inner.broadcast.borrow().pending()
    }

    fn schedule_delivery(&self) {
        let inner = &self.inner;
        if inner.config.delivery == DeliveryMode::Manual
            || !inner.broadcast.borrow().has_pending()
            || inner.delivery_scheduled.replace(true)
        {
            return;
        }

        let store = Rc::downgrade(inner);
        tokio::task::spawn_local(async move {
            if let Some(inner) = store.upgrade() {
                Store { inner }.deliver_pending();
            }
        });
    }

    /// Apply every queued persistence operation and flush to disk.
    pub async fn flush(&self) -> FlushReport {
        match &self.inner.persistor {
            Some(persistor) => persistor.settle().await,
            None => FlushReport::default(),
        }
    }

    /// Remove every document, pending event and persisted file.
    /// Subscriptions stay registered.
    pub async fn clear_all(&self) -> Result<()> {
        let inner = &self.inner;
        inner.documents.borrow_mut().clear();
        inner.dependents.borrow_mut().clear();
        inner.dependencies.borrow_mut().clear();
        inner.broadcast.borrow_mut().clear();

        if let Some(persistor) = &inner.persistor {
            persistor.clear_all().await?;
        }
        Ok(())
    }

    /// Paths the document at `path` depends on.
    pub fn dependencies_of(&self, path: &Path) -> Vec<Path> {
        self.inner
            .dependencies
            .borrow()
            .get(path)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of documents that depend on `path`.
    pub fn dependents_count(&self, path: &Path) -> u32 {
        self.inner.dependents.borrow().count(path)
    }

    fn set_dependencies(&self, path: &Path, depends_on: BTreeSet<Path>) {
        let inner = &self.inner;
        let previous = inner
            .dependencies
            .borrow_mut()
            .remove(path)
            .unwrap_or_default();

        let mut dependents = inner.dependents.borrow_mut();
        for added in depends_on.difference(&previous) {
            dependents.inc(added);
        }
        for released in previous.difference(&depends_on) {
            if let Err(err) = dependents.dec(released) {
                debug_assert!(false, "released dependency of '{}': {}", path, err);
            }
        }

        if !depends_on.is_empty() {
            inner
                .dependencies
                .borrow_mut()
                .insert(path.clone(), depends_on);
        }
    }

    fn persistor_for(&self, path: &Path) -> Option<&Persistor> {
        self.inner
            .persistor
            .as_ref()
            .filter(|persistor| persistor.config().is_persisted(path))
    }

    pub fn persistor(&self) -> Option<&Persistor> {
        self.inner.persistor.as_ref()
    }

    /// Receive a report after every flush. `None` without persistence.
    pub fn persistence_reports(&self) -> Option<broadcast::Receiver<FlushReport>> {
        self.inner.persistor.as_ref().map(Persistor::reports)
    }

    /// Diagnostic snapshot of the document index, the pending events and
    /// the dependency counts. The format is not stable.
    pub fn debug_dump(&self) -> JsonValue {
        let inner = &self.inner;
        let documents: serde_json::Map<String, JsonValue> = inner
            .documents
            .borrow()
            .iter()
            .map(|(path, value)| (path.to_string(), value.clone()))
            .collect();

        json!({
            "documents": documents,
            "pending": inner.broadcast.borrow().pending(),
            "dependencies": inner.dependents.borrow().inspect(),
            "observers": inner.broadcast.borrow().observer_count(),
        })
    }
}

fn require_document(path: &Path) -> Result<()> {
    if path.is_document() {
        Ok(())
    } else {
        Err(Error::InvalidPath {
            path: path.clone(),
            expected: "document",
        })
    }
}

/// Keeps an observer registered. Dropping it, or calling
/// [`cancel`](Self::cancel), unregisters the observer.
pub struct Subscription {
    store: Weak<Inner>,
    path: Path,
    id: Option<ObserverId>,
}

impl Subscription {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cancel(mut self) {
        self.unregister();
    }

    fn unregister(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        if let Some(inner) = self.store.upgrade() {
            inner.broadcast.borrow_mut().unregister(&self.path, id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unregister();
    }
}
