use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::rc::Rc;

use serde_json::Value as JsonValue;
use stash_core_store::{Path, RefCountedPathStore};
use tokio::sync::{Mutex, OnceCell};

use crate::local_disk::ShardDirectory;
use crate::shard::SyncOutcome;
use crate::{Error, Result};

/// Which shard currently holds each persisted document.
///
/// Stored in the persistence directory as the snapshot of its
/// `RefCountedPathStore`, so nested documents resolve through the same
/// trie as their parents.
pub struct ShardResolver {
    assignments: RefCell<RefCountedPathStore<String>>,
    directory: Rc<ShardDirectory>,
    file: PathBuf,
    dirty: Cell<bool>,
    hydration: OnceCell<()>,
    io: Mutex<()>,
}

impl ShardResolver {
    pub fn new(directory: Rc<ShardDirectory>) -> Self {
        let file = directory.resolver_file();
        Self {
            assignments: RefCell::new(RefCountedPathStore::new()),
            directory,
            file,
            dirty: Cell::new(false),
            hydration: OnceCell::new(),
            io: Mutex::new(()),
        }
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydration.initialized()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    pub async fn hydrate(&self) -> Result<()> {
        self.hydration
            .get_or_try_init(|| self.load())
            .await
            .map(|_| ())
    }

    async fn load(&self) -> Result<()> {
        let _io = self.io.lock().await;
        let corrupt = |message: String| {
            log::warn!("Resolver file is corrupt: {}", message);
            Error::CorruptResolver { message }
        };

        let bytes = match self.directory.read(&self.file).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(()),
            Err(err) => return Err(corrupt(err.to_string())),
        };
        let snapshot: JsonValue =
            serde_json::from_slice(&bytes).map_err(|err| corrupt(err.to_string()))?;
        let loaded = RefCountedPathStore::<String>::from_snapshot(&snapshot)
            .map_err(|err| corrupt(err.to_string()))?;

        let mut assignments = self.assignments.borrow_mut();
        for (path, shard) in loaded.assignments() {
            if assignments.assigned(&path).is_none() {
                assignments.assign(&path, shard.clone());
            }
        }
        log::debug!("Hydrated resolver ({} assignments)", loaded.assignments().len());
        Ok(())
    }

    /// Replace every assignment and treat the resolver as hydrated.
    ///
    /// Used to rebuild a resolver whose file could not be read.
    pub fn replace(&self, assignments: impl IntoIterator<Item = (Path, String)>) {
        let mut store = RefCountedPathStore::new();
        for (path, shard) in assignments {
            store.assign(&path, shard);
        }
        *self.assignments.borrow_mut() = store;
        let _ = self.hydration.set(());
        self.dirty.set(true);
    }

    pub fn resolve(&self, path: &Path) -> Option<String> {
        self.assignments.borrow().assigned(path).cloned()
    }

    pub fn assign(&self, path: &Path, shard: &str) {
        let mut assignments = self.assignments.borrow_mut();
        if assignments.assigned(path).map(String::as_str) != Some(shard) {
            assignments.assign(path, shard.to_string());
            self.dirty.set(true);
        }
    }

    /// Point `path` at `shard`, returning the previous shard when it
    /// differs.
    pub fn reassign(&self, path: &Path, shard: &str) -> Option<String> {
        let previous = self.resolve(path);
        self.assign(path, shard);
        previous.filter(|previous| previous != shard)
    }

    pub fn unassign(&self, path: &Path) -> Option<String> {
        let removed = self.assignments.borrow_mut().unassign(path);
        if removed.is_some() {
            self.dirty.set(true);
        }
        removed
    }

    /// Remove every assignment at or under `path`.
    pub fn unassign_subtree(&self, path: &Path) -> Vec<(Path, String)> {
        let removed = self.assignments.borrow_mut().unassign_subtree(path);
        if !removed.is_empty() {
            self.dirty.set(true);
        }
        removed
    }

    pub fn assignments(&self) -> Vec<(Path, String)> {
        self.assignments
            .borrow()
            .assignments()
            .into_iter()
            .map(|(path, shard)| (path, shard.clone()))
            .collect()
    }

    /// Every shard name in use.
    pub fn shard_names(&self) -> BTreeSet<String> {
        self.assignments
            .borrow()
            .assignments()
            .into_iter()
            .map(|(_, shard)| shard.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.borrow().is_empty()
    }

    /// Write the snapshot if it changed, or delete the file once no
    /// assignment is left.
    pub async fn sync(&self) -> Result<SyncOutcome> {
        if !self.is_hydrated() || !self.dirty.get() {
            return Ok(SyncOutcome::Unchanged);
        }
        let _io = self.io.lock().await;
        if !self.dirty.get() {
            return Ok(SyncOutcome::Unchanged);
        }

        let body = match self.is_empty() {
            true => None,
            false => Some(serde_json::to_vec(&self.assignments.borrow().inspect())?),
        };

        self.dirty.set(false);
        let result = match body {
            None => self.directory.remove(&self.file).await.map(|removed| {
                if removed {
                    SyncOutcome::Deleted
                } else {
                    SyncOutcome::Unchanged
                }
            }),
            Some(body) => self
                .directory
                .write_atomic(&self.file, &body)
                .await
                .map(|_| SyncOutcome::Persisted),
        };
        if result.is_err() {
            self.dirty.set(true);
        }
        result
    }

    /// Forget every assignment without touching the file.
    pub(crate) fn clear(&self) {
        self.assignments.borrow_mut().clear();
        self.dirty.set(false);
    }

    pub async fn delete_file(&self) -> Result<bool> {
        let _io = self.io.lock().await;
        self.directory.remove(&self.file).await
    }
}
