//! Coordinates the resolver and the shards.
//!
//! Writes and deletes are queued synchronously and applied in order by a
//! single pump task. Applying an operation only touches in-memory shard
//! content; disk writes happen in throttled flushes.
//!
//! Everything here is `!Send`. The persistor spawns its pump and flush
//! timer with `tokio::task::spawn_local`, so it must be driven from inside
//! a `tokio::task::LocalSet`.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

use serde_json::Value as JsonValue;
use stash_core_store::Path;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinSet;

use crate::cipher::{EncryptedCodec, PlainCodec};
use crate::config::PersistenceConfig;
use crate::local_disk::{ShardDirectory, RESOLVER_FILE};
use crate::resolver::ShardResolver;
use crate::shard::{DualShard, Shard, SyncOutcome};
use crate::Result;

const REPORT_CAPACITY: usize = 16;

/// `(shard label, error)` for a shard half that was unreadable and reset.
type Corruption = (String, String);

/// A queued persistence operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistOp {
    Write { path: Path, value: JsonValue },
    /// Delete a document, or every document under a collection.
    Delete { path: Path },
}

impl PersistOp {
    pub fn path(&self) -> &Path {
        match self {
            PersistOp::Write { path, .. } | PersistOp::Delete { path } => path,
        }
    }
}

/// Outcome of one flush. Failures are isolated per shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Shards (and the resolver) written to disk.
    pub synced: Vec<String>,
    /// Shards (and the resolver) whose files were deleted.
    pub deleted: Vec<String>,
    /// `(shard, error)` for every shard or operation that failed, including
    /// shards found unreadable since the previous flush and reset to empty.
    pub failed: Vec<(String, String)>,
}

impl FlushReport {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of loading everything from disk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HydrationReport {
    /// Every persisted document, in path order.
    pub documents: Vec<(Path, JsonValue)>,
    /// Shards that could not be read and were reset to empty.
    pub corrupt_shards: Vec<String>,
    /// True if the resolver file was unreadable and rebuilt from the shards.
    pub resolver_rebuilt: bool,
}

#[derive(Clone)]
pub struct Persistor {
    inner: Rc<Inner>,
}

struct Inner {
    config: PersistenceConfig,
    directory: Rc<ShardDirectory>,
    resolver: ShardResolver,
    shards: RefCell<BTreeMap<String, Rc<DualShard>>>,
    queue: RefCell<VecDeque<PersistOp>>,
    pumping: Cell<bool>,
    idle: Notify,
    flush_armed: Cell<bool>,
    /// Bumped by `clear_all`; operations started under an older generation
    /// are abandoned at their next suspension point.
    generation: Cell<u64>,
    /// Shards reset while applying operations, reported by the next flush.
    lost: RefCell<Vec<Corruption>>,
    reports: broadcast::Sender<FlushReport>,
}

impl Persistor {
    pub fn new(config: PersistenceConfig) -> Result<Self> {
        config.validate()?;
        let directory = Rc::new(ShardDirectory::new(config.directory.clone())?);
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);

        Ok(Self {
            inner: Rc::new(Inner {
                resolver: ShardResolver::new(directory.clone()),
                config,
                directory,
                shards: RefCell::new(BTreeMap::new()),
                queue: RefCell::new(VecDeque::new()),
                pumping: Cell::new(false),
                idle: Notify::new(),
                flush_armed: Cell::new(false),
                generation: Cell::new(0),
                lost: RefCell::new(Vec::new()),
                reports,
            }),
        })
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.inner.config
    }

    pub fn resolver(&self) -> &ShardResolver {
        &self.inner.resolver
    }

    /// Receive every flush report from now on.
    pub fn reports(&self) -> broadcast::Receiver<FlushReport> {
        self.inner.reports.subscribe()
    }

    /// The shard registered under `name`, if any operation has touched it.
    pub fn shard(&self, name: &str) -> Option<Rc<DualShard>> {
        self.inner.shards.borrow().get(name).cloned()
    }

    pub fn shard_names(&self) -> Vec<String> {
        self.inner.shards.borrow().keys().cloned().collect()
    }

    fn shard_or_create(&self, name: &str) -> Rc<DualShard> {
        let mut shards = self.inner.shards.borrow_mut();
        if let Some(shard) = shards.get(name) {
            return shard.clone();
        }

        let directory = &self.inner.directory;
        let plain = Shard::new(name, directory.clone(), Box::new(PlainCodec));
        let encrypted = self
            .inner
            .config
            .encryption_key
            .as_ref()
            .map(|key| Shard::new(name, directory.clone(), Box::new(EncryptedCodec::new(key))));
        let shard = Rc::new(DualShard::new(name, plain, encrypted));
        shards.insert(name.to_string(), shard.clone());
        shard
    }

    /// Queue an operation. Operations are applied in the order they were
    /// queued.
    pub fn enqueue(&self, op: PersistOp) {
        self.inner.queue.borrow_mut().push_back(op);
        if !self.inner.pumping.replace(true) {
            let this = self.clone();
            tokio::task::spawn_local(async move { this.pump().await });
        }
    }

    /// Number of operations waiting to be applied.
    pub fn pending(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    async fn pump(&self) {
        loop {
            let op = self.inner.queue.borrow_mut().pop_front();
            let Some(op) = op else {
                break;
            };
            let generation = self.inner.generation.get();
            let path = op.path().clone();
            if let Err(err) = self.apply(op, generation).await {
                log::error!("Failed to persist '{}': {}", path, err);
                let _ = self.inner.reports.send(FlushReport {
                    failed: vec![(path.to_string(), err.to_string())],
                    ..FlushReport::default()
                });
            }
        }
        self.inner.pumping.set(false);
        self.inner.idle.notify_waiters();
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.inner.generation.get() != generation
    }

    async fn apply(&self, op: PersistOp, generation: u64) -> Result<()> {
        if let Some(corrupt) = self.ensure_resolver().await? {
            self.record_lost(corrupt);
        }
        if self.is_stale(generation) {
            return Ok(());
        }
        match op {
            PersistOp::Write { path, value } => self.apply_write(path, value, generation).await,
            PersistOp::Delete { path } => self.apply_delete(path, generation).await,
        }
    }

    async fn apply_write(&self, path: Path, value: JsonValue, generation: u64) -> Result<()> {
        let config = &self.inner.config;
        let resolver = &self.inner.resolver;
        let name = config.shard_for(&path, &value);
        let encrypted = config.is_encrypted(&path);

        let target = self.shard_or_create(&name);
        self.load_for_update(&target).await;
        if self.is_stale(generation) {
            return Ok(());
        }

        let previous = resolver.resolve(&path).filter(|previous| *previous != name);
        if let Some(previous) = previous {
            let old = self.shard_or_create(&previous);
            self.load_for_update(&old).await;
            if self.is_stale(generation) {
                return Ok(());
            }
            let moved = target.graft(&old, &path).await?;
            log::debug!(
                "Moved '{}' from shard {} to {} ({} entries)",
                path,
                previous,
                name,
                moved.len()
            );
            for key in moved {
                if let Ok(moved_path) = Path::parse(&key) {
                    resolver.assign(&moved_path, &name);
                }
            }
        }

        resolver.assign(&path, &name);
        target.write(&path, value, encrypted)?;
        self.schedule_flush();
        Ok(())
    }

    async fn apply_delete(&self, path: Path, generation: u64) -> Result<()> {
        let removed = self.inner.resolver.unassign_subtree(&path);
        let affected: BTreeSet<String> = removed.into_iter().map(|(_, shard)| shard).collect();
        for name in affected {
            let shard = self.shard_or_create(&name);
            self.load_for_update(&shard).await;
            if self.is_stale(generation) {
                return Ok(());
            }
            shard.remove(&path, true);
        }
        self.schedule_flush();
        Ok(())
    }

    /// Hydrate the resolver, rebuilding it from the shard files if its own
    /// file is unreadable.
    ///
    /// Returns `None` when the file was read (or absent), otherwise the
    /// shard halves found corrupt while rebuilding.
    async fn ensure_resolver(&self) -> Result<Option<Vec<Corruption>>> {
        match self.inner.resolver.hydrate().await {
            Ok(()) => Ok(None),
            Err(err) if err.is_corruption() => {
                log::warn!("Rebuilding resolver from shard files: {}", err);
                let (shards, corrupt) = self.load_shards().await?;
                let documents = self.reconcile(&shards);
                self.inner
                    .resolver
                    .replace(documents.into_iter().map(|(path, name, _)| (path, name)));
                Ok(Some(corrupt))
            }
            Err(err) => Err(err),
        }
    }

    /// Hydrate both halves of a shard, resetting any half that cannot be
    /// read.
    async fn hydrate_shard(&self, shard: &DualShard) -> Vec<Corruption> {
        let mut corrupt = Vec::new();
        for half in shard.halves() {
            if let Err(err) = half.hydrate().await {
                log::warn!("Resetting shard {}: {}", half.label(), err);
                half.reset();
                corrupt.push((half.label(), err.to_string()));
            }
        }
        corrupt
    }

    /// Hydrate a shard an operation is about to change.
    ///
    /// Assignments into a half that had to be reset no longer have data
    /// behind them and are dropped; the reset is reported by the next flush.
    async fn load_for_update(&self, shard: &DualShard) {
        let corrupt = self.hydrate_shard(shard).await;
        if corrupt.is_empty() {
            return;
        }

        let resolver = &self.inner.resolver;
        for (path, name) in resolver.assignments() {
            if name == shard.name() && !shard.has_value(&path) {
                resolver.unassign(&path);
            }
        }
        self.record_lost(corrupt);
    }

    fn record_lost(&self, corrupt: Vec<Corruption>) {
        if corrupt.is_empty() {
            return;
        }
        for (label, err) in &corrupt {
            log::error!("Documents in shard {} were lost: {}", label, err);
        }
        self.inner.lost.borrow_mut().extend(corrupt);
        self.schedule_flush();
    }

    /// Hydrate, concurrently, every shard the resolver lists or that has a
    /// file on disk.
    async fn load_shards(&self) -> Result<(BTreeMap<String, Rc<DualShard>>, Vec<Corruption>)> {
        let mut names = self.inner.resolver.shard_names();
        for (name, encrypted) in self.inner.directory.list_shards().await? {
            if encrypted && self.inner.config.encryption_key.is_none() {
                log::warn!("Ignoring encrypted shard {}: no encryption key configured", name);
                continue;
            }
            names.insert(name);
        }

        let mut corrupt = Vec::new();
        let mut loads = JoinSet::new();
        for name in &names {
            let this = self.clone();
            let shard = self.shard_or_create(name);
            loads.spawn_local(async move { this.hydrate_shard(&shard).await });
        }
        while let Some(loaded) = loads.join_next().await {
            match loaded {
                Ok(found) => corrupt.extend(found),
                Err(err) => log::error!("Shard hydration task failed: {}", err),
            }
        }
        corrupt.sort();

        let shards: BTreeMap<String, Rc<DualShard>> = names
            .iter()
            .map(|name| (name.clone(), self.shard_or_create(name)))
            .collect();
        Ok((shards, corrupt))
    }

    /// Pick one holder for every document found in `shards`.
    ///
    /// A document held by several shards keeps the copy its assignment
    /// points at (the first shard by name when unassigned) and is removed
    /// from the others. Assignments without data are dropped. Returns
    /// `(path, shard, value)` for every document, in path order.
    fn reconcile(
        &self,
        shards: &BTreeMap<String, Rc<DualShard>>,
    ) -> Vec<(Path, String, JsonValue)> {
        let resolver = &self.inner.resolver;
        let mut holders: BTreeMap<Path, Vec<(String, JsonValue)>> = BTreeMap::new();
        for (name, shard) in shards {
            for (key, value) in shard.entries() {
                match Path::parse(&key) {
                    Ok(path) => holders.entry(path).or_default().push((name.clone(), value)),
                    Err(err) => log::warn!("Skipping entry '{}' in shard {}: {}", key, name, err),
                }
            }
        }

        for (path, _) in resolver.assignments() {
            if !holders.contains_key(&path) {
                resolver.unassign(&path);
            }
        }

        let mut documents = Vec::with_capacity(holders.len());
        for (path, mut found) in holders {
            let chosen = resolver
                .resolve(&path)
                .and_then(|assigned| found.iter().position(|(name, _)| *name == assigned))
                .unwrap_or(0);
            let (name, value) = found.swap_remove(chosen);
            for (other, _) in found {
                if let Some(shard) = shards.get(&other) {
                    log::warn!("Dropping duplicate of '{}' from shard {}", path, other);
                    shard.remove(&path, false);
                }
            }
            documents.push((path, name, value));
        }
        documents
    }

    fn schedule_flush(&self) {
        if self.inner.flush_armed.replace(true) {
            return;
        }
        let throttle = self.inner.config.throttle;
        log::debug!("Flush scheduled in {:?}", throttle);

        let this = self.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(throttle).await;
            this.inner.flush_armed.set(false);
            this.flush().await;
        });
    }

    /// Sync every hydrated shard and the resolver now.
    pub async fn flush(&self) -> FlushReport {
        let shards: Vec<Rc<DualShard>> = self.inner.shards.borrow().values().cloned().collect();
        let mut report = FlushReport {
            failed: self.inner.lost.take(),
            ..FlushReport::default()
        };

        for dual in shards {
            for half in dual.halves() {
                let outcome = half.sync().await;
                record(&mut report, half.label(), outcome);
            }
        }
        let outcome = self.inner.resolver.sync().await;
        record(&mut report, RESOLVER_FILE.to_string(), outcome);

        if report.is_ok() {
            log::debug!(
                "Flushed {} shard(s), deleted {}",
                report.synced.len(),
                report.deleted.len()
            );
        } else {
            log::error!("Flush failed for {} shard(s)", report.failed.len());
        }
        let _ = self.inner.reports.send(report.clone());
        report
    }

    /// Wait for every queued operation to be applied, then flush.
    pub async fn settle(&self) -> FlushReport {
        loop {
            // Registered before the check so a pump finishing in between is
            // not missed.
            let idle = self.inner.idle.notified();
            if !self.inner.pumping.get() {
                break;
            }
            idle.await;
        }
        self.flush().await
    }

    /// Delete every shard file and the resolver file and forget all
    /// in-memory state. Queued operations are dropped.
    pub async fn clear_all(&self) -> Result<()> {
        let inner = &self.inner;
        inner.generation.set(inner.generation.get() + 1);
        inner.queue.borrow_mut().clear();
        inner.lost.borrow_mut().clear();

        let shards: Vec<Rc<DualShard>> = std::mem::take(&mut *inner.shards.borrow_mut())
            .into_values()
            .collect();
        for dual in &shards {
            for half in dual.halves() {
                half.discard();
            }
        }
        inner.resolver.clear();

        let mut first_error = None;
        for dual in &shards {
            for half in dual.halves() {
                if let Err(err) = half.delete_file().await {
                    log::error!("Failed to delete shard {}: {}", half.label(), err);
                    first_error.get_or_insert(err);
                }
            }
        }

        // Files of shards this process never touched, including encrypted
        // files left without a key.
        for (name, encrypted) in inner.directory.list_shards().await? {
            if inner.shards.borrow().contains_key(&name) {
                continue;
            }
            let file = inner.directory.shard_file(&name, encrypted);
            if let Err(err) = inner.directory.remove(&file).await {
                first_error.get_or_insert(err);
            }
        }

        if let Err(err) = inner.resolver.delete_file().await {
            first_error.get_or_insert(err);
        }
        log::debug!("Cleared persistence directory {}", inner.directory.root().display());
        first_error.map_or(Ok(()), Err)
    }

    /// Load everything on disk.
    ///
    /// The resolver is read first (and rebuilt if unreadable), then every
    /// shard it lists or that has a file is hydrated concurrently and the
    /// entries are reconciled against the resolver.
    pub async fn hydrate(&self) -> Result<HydrationReport> {
        let rebuilt = self.ensure_resolver().await?;
        let (shards, mut corrupt) = self.load_shards().await?;

        let resolver_rebuilt = rebuilt.is_some();
        corrupt.extend(rebuilt.into_iter().flatten());
        let mut corrupt_shards: Vec<String> = corrupt.into_iter().map(|(label, _)| label).collect();
        corrupt_shards.sort();
        corrupt_shards.dedup();

        let mut documents = Vec::new();
        for (path, name, value) in self.reconcile(&shards) {
            self.inner.resolver.assign(&path, &name);
            documents.push((path, value));
        }

        log::debug!(
            "Hydrated {} document(s) from {} shard(s)",
            documents.len(),
            shards.len()
        );
        Ok(HydrationReport {
            documents,
            corrupt_shards,
            resolver_rebuilt,
        })
    }
}

fn record(report: &mut FlushReport, label: String, outcome: Result<SyncOutcome>) {
    match outcome {
        Ok(SyncOutcome::Persisted) => report.synced.push(label),
        Ok(SyncOutcome::Deleted) => report.deleted.push(label),
        Ok(SyncOutcome::Unchanged) => {}
        Err(err) => {
            log::error!("Failed to sync {}: {}", label, err);
            report.failed.push((label, err.to_string()));
        }
    }
}
