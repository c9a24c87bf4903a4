//! One persisted file of documents.
//!
//! A shard is a flat bag `document path -> JSON value`. Its content lives in
//! memory and is written to disk as a single JSON object keyed by the full
//! document path string.
//!
//! Hydration is memoized in a `tokio::sync::OnceCell`: every caller before
//! the first load completes awaits the same in-flight read, and later
//! callers return immediately. File operations on one shard are sequenced
//! on the shard's own I/O guard.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;

use serde_json::Value as JsonValue;
use stash_core_store::Path;
use tokio::sync::{Mutex, OnceCell};

use crate::cipher::ShardCodec;
use crate::local_disk::ShardDirectory;
use crate::{Error, Result};

/// What a `sync` did on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Unchanged,
    Persisted,
    Deleted,
}

pub struct Shard {
    name: String,
    file: PathBuf,
    directory: Rc<ShardDirectory>,
    codec: Box<dyn ShardCodec>,
    content: RefCell<BTreeMap<String, JsonValue>>,
    dirty: Cell<bool>,
    hydration: OnceCell<()>,
    io: Mutex<()>,
    file_reads: Cell<usize>,
}

impl Shard {
    pub fn new(name: &str, directory: Rc<ShardDirectory>, codec: Box<dyn ShardCodec>) -> Self {
        let file = directory.shard_file(name, codec.is_encrypted());
        Self {
            name: name.to_string(),
            file,
            directory,
            codec,
            content: RefCell::new(BTreeMap::new()),
            dirty: Cell::new(false),
            hydration: OnceCell::new(),
            io: Mutex::new(()),
            file_reads: Cell::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name used in logs and reports: `posts` or `posts (encrypted)`.
    pub fn label(&self) -> String {
        if self.is_encrypted() {
            format!("{} (encrypted)", self.name)
        } else {
            self.name.clone()
        }
    }

    pub fn file_path(&self) -> &std::path::Path {
        &self.file
    }

    pub fn is_encrypted(&self) -> bool {
        self.codec.is_encrypted()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydration.initialized()
    }

    pub fn is_empty(&self) -> bool {
        self.content.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.content.borrow().len()
    }

    /// Number of times the backing file has been read.
    pub fn file_reads(&self) -> usize {
        self.file_reads.get()
    }

    /// Load the backing file once. Safe to call any number of times,
    /// concurrently or not.
    pub async fn hydrate(&self) -> Result<()> {
        self.hydration
            .get_or_try_init(|| self.load())
            .await
            .map(|_| ())
    }

    async fn load(&self) -> Result<()> {
        let _io = self.io.lock().await;
        self.file_reads.set(self.file_reads.get() + 1);

        let bytes = match self.directory.read(&self.file).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                log::debug!("Shard {} has no file yet", self.label());
                return Ok(());
            }
            Err(err) => return Err(self.corrupt(err.to_string())),
        };

        let decoded = self
            .codec
            .decode(&bytes)
            .map_err(|err| self.corrupt(err.to_string()))?;
        let entries: BTreeMap<String, JsonValue> =
            serde_json::from_slice(&decoded).map_err(|err| self.corrupt(err.to_string()))?;

        log::debug!("Hydrated shard {} ({} entries)", self.label(), entries.len());
        let mut content = self.content.borrow_mut();
        for (key, value) in entries {
            content.entry(key).or_insert(value);
        }
        Ok(())
    }

    fn corrupt(&self, message: String) -> Error {
        log::warn!("Shard {} is corrupt: {}", self.label(), message);
        Error::CorruptShard {
            shard: self.label(),
            message,
        }
    }

    /// Drop all content and treat the shard as hydrated and empty.
    ///
    /// Used after a failed hydration. The shard is marked dirty so the next
    /// sync replaces or deletes the unreadable file.
    pub fn reset(&self) {
        self.content.borrow_mut().clear();
        let _ = self.hydration.set(());
        self.dirty.set(true);
    }

    /// Drop all content without scheduling any disk change.
    pub(crate) fn discard(&self) {
        self.content.borrow_mut().clear();
        self.dirty.set(false);
    }

    pub fn write(&self, path: &Path, value: JsonValue) {
        self.content.borrow_mut().insert(path.to_string(), value);
        self.dirty.set(true);
    }

    /// Remove `path`, and with `recursive` every entry nested under it.
    /// Returns the number of entries removed.
    pub fn remove(&self, path: &Path, recursive: bool) -> usize {
        let removed = if recursive {
            self.take_under(path).len()
        } else {
            usize::from(self.content.borrow_mut().remove(&path.to_string()).is_some())
        };
        if removed > 0 {
            self.dirty.set(true);
        }
        removed
    }

    pub fn has_value(&self, path: &Path) -> bool {
        self.content.borrow().contains_key(&path.to_string())
    }

    pub fn get(&self, path: &Path) -> Option<JsonValue> {
        self.content.borrow().get(&path.to_string()).cloned()
    }

    /// Snapshot of every entry, in key order.
    pub fn entries(&self) -> Vec<(String, JsonValue)> {
        self.content
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Remove and return every entry at or under `path`.
    fn take_under(&self, path: &Path) -> BTreeMap<String, JsonValue> {
        let mut content = self.content.borrow_mut();
        if path.is_empty() {
            return std::mem::take(&mut *content);
        }

        let exact = path.to_string();
        let nested = format!("{}/", exact);
        let keys: Vec<String> = content
            .range(exact.clone()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(&exact))
            .filter(|k| **k == exact || k.starts_with(&nested))
            .cloned()
            .collect();

        keys.into_iter()
            .filter_map(|k| content.remove_entry(&k))
            .collect()
    }

    /// Move every entry at or under `path` from `other` into this shard.
    ///
    /// Both shards are hydrated first, concurrently. Returns the moved keys.
    pub async fn graft(&self, other: &Shard, path: &Path) -> Result<Vec<String>> {
        let (mine, theirs) = tokio::join!(self.hydrate(), other.hydrate());
        mine?;
        theirs?;

        let moved = other.take_under(path);
        let keys: Vec<String> = moved.keys().cloned().collect();
        if !moved.is_empty() {
            log::debug!(
                "Grafting {} entries under '{}' from {} into {}",
                moved.len(),
                path,
                other.label(),
                self.label()
            );
            self.content.borrow_mut().extend(moved);
            self.dirty.set(true);
            other.dirty.set(true);
        }
        Ok(keys)
    }

    /// Write the full content to disk if there is something to write.
    ///
    /// No-op for empty, clean or never-hydrated shards. Returns whether the
    /// file was written.
    pub async fn persist(&self) -> Result<bool> {
        if !self.needs_persist() {
            return Ok(false);
        }
        let _io = self.io.lock().await;
        if !self.needs_persist() {
            return Ok(false);
        }
        self.write_file().await?;
        Ok(true)
    }

    fn needs_persist(&self) -> bool {
        self.is_hydrated() && self.dirty.get() && !self.is_empty()
    }

    /// Bring the backing file in line with memory: delete it when the shard
    /// is empty, write it when dirty.
    pub async fn sync(&self) -> Result<SyncOutcome> {
        if !self.is_hydrated() {
            return Ok(SyncOutcome::Unchanged);
        }
        let _io = self.io.lock().await;

        if self.is_empty() {
            self.dirty.set(false);
            return match self.directory.remove(&self.file).await? {
                true => Ok(SyncOutcome::Deleted),
                false => Ok(SyncOutcome::Unchanged),
            };
        }

        if !self.dirty.get() {
            return Ok(SyncOutcome::Unchanged);
        }
        self.write_file().await?;
        Ok(SyncOutcome::Persisted)
    }

    /// Delete the backing file, waiting for any in-flight write.
    pub async fn delete_file(&self) -> Result<bool> {
        let _io = self.io.lock().await;
        self.directory.remove(&self.file).await
    }

    /// Caller holds the I/O guard.
    async fn write_file(&self) -> Result<()> {
        let body = serde_json::to_vec(&*self.content.borrow())?;
        let stored = self.codec.encode(&body)?;

        // Mutations that land while the write is in flight re-mark the shard.
        self.dirty.set(false);
        if let Err(err) = self.directory.write_atomic(&self.file, &stored).await {
            self.dirty.set(true);
            return Err(err);
        }
        Ok(())
    }
}

/// A plaintext shard and, when a key is configured, an encrypted shard
/// sharing one logical name.
///
/// A document lives in exactly one half: writing it to one half removes it
/// from the other.
pub struct DualShard {
    name: String,
    plain: Shard,
    encrypted: Option<Shard>,
}

impl DualShard {
    pub fn new(name: &str, plain: Shard, encrypted: Option<Shard>) -> Self {
        Self {
            name: name.to_string(),
            plain,
            encrypted,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plain(&self) -> &Shard {
        &self.plain
    }

    pub fn encrypted(&self) -> Option<&Shard> {
        self.encrypted.as_ref()
    }

    /// Both halves, plaintext first.
    pub fn halves(&self) -> impl Iterator<Item = &Shard> {
        std::iter::once(&self.plain).chain(self.encrypted.as_ref())
    }

    fn half(&self, encrypted: bool) -> Result<&Shard> {
        if encrypted {
            self.encrypted.as_ref().ok_or_else(|| Error::MissingKey {
                collection: self.name.clone(),
            })
        } else {
            Ok(&self.plain)
        }
    }

    /// Hydrate both halves concurrently. The first failure is returned; the
    /// other half is still hydrated.
    pub async fn hydrate(&self) -> Result<()> {
        match &self.encrypted {
            Some(encrypted) => {
                let (plain, encrypted) = tokio::join!(self.plain.hydrate(), encrypted.hydrate());
                plain.and(encrypted)
            }
            None => self.plain.hydrate().await,
        }
    }

    pub fn is_hydrated(&self) -> bool {
        self.halves().all(Shard::is_hydrated)
    }

    pub fn write(&self, path: &Path, value: JsonValue, encrypted: bool) -> Result<()> {
        let target = self.half(encrypted)?;
        for half in self.halves() {
            if !std::ptr::eq(half, target) {
                half.remove(path, false);
            }
        }
        target.write(path, value);
        Ok(())
    }

    pub fn remove(&self, path: &Path, recursive: bool) -> usize {
        self.halves().map(|half| half.remove(path, recursive)).sum()
    }

    pub fn get(&self, path: &Path) -> Option<JsonValue> {
        self.halves().find_map(|half| half.get(path))
    }

    pub fn has_value(&self, path: &Path) -> bool {
        self.halves().any(|half| half.has_value(path))
    }

    pub fn entries(&self) -> Vec<(String, JsonValue)> {
        self.halves().flat_map(Shard::entries).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.halves().all(Shard::is_empty)
    }

    pub fn is_dirty(&self) -> bool {
        self.halves().any(Shard::is_dirty)
    }

    /// Graft half-by-half: plaintext entries stay plaintext, encrypted
    /// entries stay encrypted.
    pub async fn graft(&self, other: &DualShard, path: &Path) -> Result<Vec<String>> {
        let mut moved = self.plain.graft(&other.plain, path).await?;
        if let (Some(mine), Some(theirs)) = (&self.encrypted, &other.encrypted) {
            moved.extend(mine.graft(theirs, path).await?);
        }
        Ok(moved)
    }
}
