//! Storage engine
//!
//! Ties the pieces together: one manifest, one write-ahead log, one LSM
//! tree per store, a shared memory budget and a background executor.
//! Commits are durable once the WAL append returns; memtables and run
//! files are rebuilt from manifest plus WAL on open.

use crate::compaction::CompactionStrategy;
use crate::config;
use crate::exec::TaskExecutor;
use crate::forest::{FlushScheduler, ForestMemoryManager};
use crate::lsm::{LsmTree, LsmTreeReport};
use crate::manifest::{ManifestFile, ManifestOperation, StoreMetadata};
use crate::wal::{WalConfig, WalEntry, WalFileReport, WalReadBuffer, WriteAheadLog};
use crate::{Command, Result, StoreId, StrataError, Tsn};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub wal_segment_size: u64,
    pub max_forest_size: u64,
    pub flush_threshold_size: u64,
    pub checkpoint_operations_threshold: usize,
    pub executor_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wal_segment_size: config::WAL_SEGMENT_SIZE,
            max_forest_size: config::MAX_FOREST_SIZE,
            flush_threshold_size: config::FLUSH_THRESHOLD_SIZE,
            checkpoint_operations_threshold: config::CHECKPOINT_OPERATIONS_THRESHOLD,
            executor_threads: config::EXECUTOR_THREADS,
        }
    }
}

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Open,
    Closed,
    Panic,
}

/// One-shot failure latch. A background task that cannot guarantee
/// on-disk consistency anymore trips it; every operation afterwards
/// fails with [`StrataError::Panicked`].
pub(crate) struct Killswitch {
    tripped: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl Killswitch {
    fn new() -> Self {
        Self {
            tripped: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    pub(crate) fn trip(&self, reason: String) {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            error!(reason = %reason, "engine entered panic state");
            *self.reason.lock() = Some(reason);
        }
    }

    fn check(&self) -> Result<()> {
        if self.tripped.load(Ordering::SeqCst) {
            let reason = self
                .reason
                .lock()
                .clone()
                .unwrap_or_else(|| "unknown".into());
            return Err(StrataError::Panicked(reason));
        }
        Ok(())
    }
}

/// A set of writes committed atomically under one TSN.
#[derive(Debug, Default)]
pub struct WriteBatch {
    writes: Vec<(StoreId, WriteOp)>,
}

#[derive(Debug)]
enum WriteOp {
    Put { key: Bytes, value: Bytes },
    Delete { key: Bytes },
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, store_id: StoreId, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.writes.push((
            store_id,
            WriteOp::Put {
                key: key.into(),
                value: value.into(),
            },
        ));
        self
    }

    pub fn delete(mut self, store_id: StoreId, key: impl Into<Bytes>) -> Self {
        self.writes.push((store_id, WriteOp::Delete { key: key.into() }));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }
}

/// Point-in-time view of the engine, for diagnostics.
#[derive(Debug)]
pub struct EngineReport {
    pub state: ManagerState,
    pub next_tsn: Tsn,
    pub manifest_sequence_number: u64,
    pub forest_bytes: u64,
    pub forest_stall_duration: std::time::Duration,
    pub wal_files: Vec<WalFileReport>,
    pub stores: Vec<LsmTreeReport>,
}

pub struct StorageEngine {
    root: PathBuf,
    config: EngineConfig,
    manifest: Arc<ManifestFile>,
    wal: Arc<WriteAheadLog>,
    trees: RwLock<BTreeMap<StoreId, Arc<LsmTree>>>,
    forest: Arc<ForestMemoryManager>,
    executor: Arc<TaskExecutor>,
    killswitch: Arc<Killswitch>,
    state: RwLock<ManagerState>,
    /// Next TSN to hand out; committed TSNs are strictly below.
    next_tsn: AtomicU64,
    /// Held from TSN allocation through the WAL append, so commit
    /// entries reach the log in ascending TSN order.
    commit_lock: Mutex<()>,
}

impl StorageEngine {
    /// Open the engine rooted at `root`, creating directories on first
    /// use. Replays the manifest, then the WAL tail that is not yet
    /// covered by run files.
    pub fn open(root: &Path, config: EngineConfig) -> Result<Arc<Self>> {
        let stores_dir = root.join("stores");
        let wal_dir = root.join("wal");
        std::fs::create_dir_all(&stores_dir)?;
        std::fs::create_dir_all(&wal_dir)?;

        let manifest = Arc::new(ManifestFile::open(root)?);
        let mut trees = BTreeMap::new();
        for store_id in manifest.current().stores.keys() {
            let tree = LsmTree::open(store_id.clone(), &stores_dir, Arc::clone(&manifest))?;
            trees.insert(store_id.clone(), tree);
        }

        // replay only what the run files do not already hold; the log
        // itself must reach at least as far as the run files do
        let watermarks: HashMap<StoreId, Tsn> = trees
            .iter()
            .map(|(store_id, tree)| (store_id.clone(), tree.persisted_max_tsn()))
            .collect();
        let max_persisted_tsn = watermarks.values().copied().max().unwrap_or(0);

        let wal = Arc::new(WriteAheadLog::open(
            &wal_dir,
            WalConfig {
                max_segment_size: config.wal_segment_size,
            },
            max_persisted_tsn,
        )?);
        wal.generate_checksums_for_completed_files()?;

        let mut buffer = WalReadBuffer::new(watermarks);
        wal.replay_into(&mut buffer)?;

        let mut highest_tsn = buffer.highest_completed_tsn();
        for tree in trees.values() {
            highest_tsn = highest_tsn.max(tree.persisted_max_tsn());
        }
        let mut replayed = 0usize;
        for (store_id, commands) in buffer.into_commands() {
            let Some(tree) = trees.get(&store_id) else {
                warn!(store = %store_id, "log holds writes for an unknown store, dropping them");
                continue;
            };
            for command in commands {
                tree.apply_command(command);
                replayed += 1;
            }
        }

        info!(
            root = %root.display(),
            stores = trees.len(),
            replayed_commands = replayed,
            next_tsn = highest_tsn + 1,
            "storage engine opened"
        );

        let forest = Arc::new(ForestMemoryManager::new(
            config.max_forest_size,
            config.flush_threshold_size,
        ));
        // replayed data sits in memtables again, charge it to the forest
        for (store_id, tree) in &trees {
            let bytes = tree.memory_bytes();
            if bytes > 0 {
                forest.restore_size(store_id, bytes);
            }
        }
        let executor = Arc::new(TaskExecutor::new(config.executor_threads));
        Ok(Arc::new(Self {
            root: root.to_path_buf(),
            config,
            manifest,
            wal,
            trees: RwLock::new(trees),
            forest,
            executor,
            killswitch: Arc::new(Killswitch::new()),
            state: RwLock::new(ManagerState::Open),
            next_tsn: AtomicU64::new(highest_tsn + 1),
            commit_lock: Mutex::new(()),
        }))
    }

    pub fn state(&self) -> ManagerState {
        if self.killswitch.check().is_err() {
            return ManagerState::Panic;
        }
        *self.state.read()
    }

    fn check_open(&self) -> Result<()> {
        self.killswitch.check()?;
        match *self.state.read() {
            ManagerState::Open => Ok(()),
            ManagerState::Closed => Err(StrataError::Closed),
            ManagerState::Panic => Err(StrataError::Panicked("engine panicked".into())),
        }
    }

    fn tree(&self, store_id: &StoreId) -> Result<Arc<LsmTree>> {
        self.trees
            .read()
            .get(store_id)
            .cloned()
            .ok_or_else(|| StrataError::StoreNotFound(store_id.to_string()))
    }

    /// Create a new, empty store.
    pub fn create_store(
        &self,
        store_id: StoreId,
        strategy: CompactionStrategy,
    ) -> Result<Arc<LsmTree>> {
        self.check_open()?;
        let mut trees = self.trees.write();
        if trees.contains_key(&store_id) {
            return Err(StrataError::StoreAlreadyExists(store_id.to_string()));
        }

        let created_at_tsn = self.next_tsn.load(Ordering::SeqCst);
        let metadata = StoreMetadata::new(store_id.clone(), strategy, created_at_tsn);
        self.manifest
            .append_operation(|sequence_number| ManifestOperation::CreateStore {
                sequence_number,
                metadata,
            })?;

        let tree = LsmTree::open(
            store_id.clone(),
            &self.root.join("stores"),
            Arc::clone(&self.manifest),
        )?;
        trees.insert(store_id, Arc::clone(&tree));
        Ok(tree)
    }

    pub fn store(&self, store_id: &StoreId) -> Result<Arc<LsmTree>> {
        self.check_open()?;
        self.tree(store_id)
    }

    pub fn store_ids(&self) -> Vec<StoreId> {
        self.trees.read().keys().cloned().collect()
    }

    /// Delete a store with everything it holds.
    pub fn delete_store(&self, store_id: &StoreId) -> Result<()> {
        self.check_open()?;
        let mut trees = self.trees.write();
        let tree = trees
            .remove(store_id)
            .ok_or_else(|| StrataError::StoreNotFound(store_id.to_string()))?;

        let id = store_id.clone();
        self.manifest
            .append_operation(|sequence_number| ManifestOperation::DeleteStore {
                sequence_number,
                store_id: id,
            })?;
        tree.destroy()?;
        self.forest.remove_tree(store_id);

        let dir = self.root.join("stores").join(store_id.path());
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(store = %store_id, "store deleted");
        Ok(())
    }

    /// Commit a batch of writes atomically. Returns the TSN the batch
    /// was committed under; the data is durable when this returns.
    ///
    /// May block when the forest memory limit is reached, until a
    /// background flush frees space.
    pub fn commit(self: &Arc<Self>, batch: WriteBatch) -> Result<Tsn> {
        self.check_open()?;
        if batch.is_empty() {
            return Err(StrataError::InvalidFormat(
                "cannot commit an empty batch".into(),
            ));
        }

        // resolve all trees up front so a bad store id fails before the
        // WAL sees anything
        let mut resolved: Vec<(Arc<LsmTree>, StoreId, WriteOp)> = Vec::with_capacity(batch.len());
        for (store_id, op) in batch.writes {
            let tree = self.tree(&store_id)?;
            resolved.push((tree, store_id, op));
        }

        let tsn;
        let mut commands: Vec<(Arc<LsmTree>, StoreId, Command)> =
            Vec::with_capacity(resolved.len());
        {
            let _commit_guard = self.commit_lock.lock();
            tsn = self.next_tsn.fetch_add(1, Ordering::SeqCst);
            let mut entries = Vec::with_capacity(resolved.len() + 2);
            entries.push(WalEntry::TransactionStart { tsn });
            for (tree, store_id, op) in resolved {
                let command = match op {
                    WriteOp::Put { key, value } => Command::Put { key, tsn, value },
                    WriteOp::Delete { key } => Command::Del { key, tsn },
                };
                entries.push(WalEntry::TransactionCommand {
                    store_id: store_id.clone(),
                    command: command.clone(),
                });
                commands.push((tree, store_id, command));
            }
            entries.push(WalEntry::TransactionCommit { tsn });

            if let Err(e) = self.wal.append(&entries) {
                // a torn append leaves the log in an unknown state
                self.killswitch.trip(format!("log append failed: {}", e));
                return Err(e);
            }
        }

        let mut added: HashMap<StoreId, u64> = HashMap::new();
        for (tree, store_id, command) in commands {
            let bytes = tree.apply_command(command) as u64;
            *added.entry(store_id).or_insert(0) += bytes;
        }

        let scheduler = BackgroundFlushScheduler {
            engine: Arc::downgrade(self),
        };
        for (store_id, bytes) in added {
            self.forest.add_size(&store_id, bytes, &scheduler);
        }
        Ok(tsn)
    }

    /// Read `key` from a store at `read_tsn`, or the latest committed
    /// version when `None`.
    pub fn get(&self, store_id: &StoreId, key: &[u8], read_tsn: Option<Tsn>) -> Result<Option<Bytes>> {
        self.check_open()?;
        let tree = self.tree(store_id)?;
        tree.get(key, read_tsn.unwrap_or(u64::MAX))
    }

    /// Flush one store's memtables and run the follow-up housekeeping.
    pub fn flush_store(&self, store_id: &StoreId) -> Result<()> {
        let tree = self.tree(store_id)?;
        let flushed = tree.flush()?;
        self.forest.flush_completed(store_id, tree.memory_bytes());
        if flushed {
            self.manifest
                .create_checkpoint_if_operations_exceed(self.config.checkpoint_operations_threshold)?;
        }
        Ok(())
    }

    /// Flush every store that holds in-memory data, synchronously.
    pub fn flush_all_trees(&self) -> Result<()> {
        let trees: Vec<(StoreId, Arc<LsmTree>)> = self
            .trees
            .read()
            .iter()
            .map(|(id, tree)| (id.clone(), Arc::clone(tree)))
            .collect();
        for (store_id, tree) in trees {
            tree.flush()?;
            self.forest.flush_completed(&store_id, tree.memory_bytes());
        }
        self.manifest
            .create_checkpoint_if_operations_exceed(self.config.checkpoint_operations_threshold)?;
        Ok(())
    }

    /// Run one compaction round on a store if its strategy asks for one.
    pub fn compact_store(&self, store_id: &StoreId) -> Result<bool> {
        self.check_open()?;
        let tree = self.tree(store_id)?;
        let compacted = tree.compact(self.history_watermark())?;
        if compacted {
            self.manifest
                .create_checkpoint_if_operations_exceed(self.config.checkpoint_operations_threshold)?;
        }
        Ok(compacted)
    }

    /// Merge all of a store's files into one run, dropping dead versions.
    pub fn full_compaction(&self, store_id: &StoreId) -> Result<bool> {
        self.check_open()?;
        let tree = self.tree(store_id)?;
        tree.full_compaction(self.history_watermark())
    }

    /// Drop log segments no store needs anymore. Returns how many
    /// segment files were deleted.
    pub fn shorten_wal(&self) -> Result<usize> {
        self.check_open()?;
        self.wal.generate_checksums_for_completed_files()?;
        self.wal.shorten(self.wal_low_watermark())
    }

    /// Lowest TSN any store may still need replayed from the log.
    fn wal_low_watermark(&self) -> Tsn {
        self.trees
            .read()
            .values()
            .map(|tree| tree.wal_low_watermark())
            .min()
            .unwrap_or(u64::MAX)
    }

    /// TSN below which old versions are invisible to every reader.
    /// No read snapshots are tracked, so this is the latest commit.
    fn history_watermark(&self) -> Tsn {
        self.next_tsn.load(Ordering::SeqCst).saturating_sub(1)
    }

    pub fn report(&self) -> Result<EngineReport> {
        let stores = self
            .trees
            .read()
            .values()
            .map(|tree| tree.report())
            .collect();
        Ok(EngineReport {
            state: self.state(),
            next_tsn: self.next_tsn.load(Ordering::SeqCst),
            manifest_sequence_number: self.manifest.current().last_sequence_number,
            forest_bytes: self.forest.actual_forest_size(),
            forest_stall_duration: self.forest.total_stall_duration(),
            wal_files: self.wal.report()?,
            stores,
        })
    }

    /// Flush everything, trim the log and stop background work. The
    /// engine rejects all operations afterwards.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != ManagerState::Open {
                return Ok(());
            }
            *state = ManagerState::Closed;
        }
        self.killswitch.check()?;

        self.flush_all_trees()?;
        self.wal.generate_checksums_for_completed_files()?;
        self.wal.shorten(self.wal_low_watermark())?;
        self.executor.shutdown();
        info!(root = %self.root.display(), "storage engine closed");
        Ok(())
    }
}

/// Hands flush requests from the memory manager to the executor. Each
/// flush is followed by a compaction check, so stores converge towards
/// their strategy's shape without anyone asking.
struct BackgroundFlushScheduler {
    engine: Weak<StorageEngine>,
}

impl FlushScheduler for BackgroundFlushScheduler {
    fn schedule_flush(&self, store_id: &StoreId) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let store_id = store_id.clone();
        let task_engine = Arc::clone(&engine);
        let spawned = engine.executor.execute_async("flush", move || {
            let result = match task_engine.flush_store(&store_id) {
                Ok(()) => match task_engine.compact_store(&store_id) {
                    Ok(_) => Ok(()),
                    // the engine or store went away under us
                    Err(StrataError::Closed) | Err(StrataError::StoreNotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                },
                // the store was deleted before the flush ran
                Err(StrataError::StoreNotFound(_)) => Ok(()),
                Err(e) => Err(e),
            };
            result.map_err(|e| {
                task_engine
                    .killswitch
                    .trip(format!("background maintenance failed: {}", e));
                e
            })
        });
        if let Err(e) = spawned {
            warn!(error = %e, "could not schedule flush");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &Path) -> Arc<StorageEngine> {
        StorageEngine::open(dir, EngineConfig::default()).unwrap()
    }

    fn store(name: &str) -> StoreId {
        StoreId::parse(name).unwrap()
    }

    #[test]
    fn test_commit_and_read() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        engine
            .create_store(store("kv"), CompactionStrategy::default())
            .unwrap();

        let tsn = engine
            .commit(
                WriteBatch::new()
                    .put(store("kv"), &b"a"[..], &b"1"[..])
                    .put(store("kv"), &b"b"[..], &b"2"[..]),
            )
            .unwrap();
        assert_eq!(tsn, 1);

        assert_eq!(
            engine.get(&store("kv"), b"a", None).unwrap(),
            Some(Bytes::from_static(b"1"))
        );
        assert_eq!(engine.get(&store("kv"), b"c", None).unwrap(), None);
    }

    #[test]
    fn test_commit_to_unknown_store_fails_before_logging() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        let result = engine.commit(WriteBatch::new().put(store("nope"), &b"k"[..], &b"v"[..]));
        assert!(matches!(result, Err(StrataError::StoreNotFound(_))));
        // the failed commit burned no TSN
        assert_eq!(engine.report().unwrap().next_tsn, 1);
    }

    #[test]
    fn test_recovery_from_wal_after_crash() {
        let dir = TempDir::new().unwrap();
        {
            let engine = open(dir.path());
            engine
                .create_store(store("kv"), CompactionStrategy::default())
                .unwrap();
            engine
                .commit(WriteBatch::new().put(store("kv"), &b"k"[..], &b"unflushed"[..]))
                .unwrap();
            // dropped without close: nothing was flushed
        }

        let engine = open(dir.path());
        assert_eq!(
            engine.get(&store("kv"), b"k", None).unwrap(),
            Some(Bytes::from_static(b"unflushed"))
        );
        // recovered commits are not handed out again
        let tsn = engine
            .commit(WriteBatch::new().put(store("kv"), &b"k2"[..], &b"v"[..]))
            .unwrap();
        assert_eq!(tsn, 2);
    }

    #[test]
    fn test_recovery_skips_flushed_data() {
        let dir = TempDir::new().unwrap();
        {
            let engine = open(dir.path());
            engine
                .create_store(store("kv"), CompactionStrategy::default())
                .unwrap();
            engine
                .commit(WriteBatch::new().put(store("kv"), &b"a"[..], &b"flushed"[..]))
                .unwrap();
            engine.flush_store(&store("kv")).unwrap();
            engine
                .commit(WriteBatch::new().put(store("kv"), &b"b"[..], &b"tail"[..]))
                .unwrap();
        }

        let engine = open(dir.path());
        assert_eq!(
            engine.get(&store("kv"), b"a", None).unwrap(),
            Some(Bytes::from_static(b"flushed"))
        );
        assert_eq!(
            engine.get(&store("kv"), b"b", None).unwrap(),
            Some(Bytes::from_static(b"tail"))
        );
        // only the unflushed tail lives in memory again
        let report = engine.report().unwrap();
        let kv = &report.stores[0];
        assert_eq!(kv.file_count, 1);
        assert!(kv.memory_bytes > 0);
    }

    #[test]
    fn test_snapshot_reads() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        engine
            .create_store(store("kv"), CompactionStrategy::default())
            .unwrap();
        let first = engine
            .commit(WriteBatch::new().put(store("kv"), &b"k"[..], &b"v1"[..]))
            .unwrap();
        let second = engine
            .commit(WriteBatch::new().put(store("kv"), &b"k"[..], &b"v2"[..]))
            .unwrap();

        assert_eq!(
            engine.get(&store("kv"), b"k", Some(first)).unwrap(),
            Some(Bytes::from_static(b"v1"))
        );
        assert_eq!(
            engine.get(&store("kv"), b"k", Some(second)).unwrap(),
            Some(Bytes::from_static(b"v2"))
        );
        assert_eq!(engine.get(&store("kv"), b"k", Some(0)).unwrap(), None);
    }

    #[test]
    fn test_delete_store_removes_everything() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        engine
            .create_store(store("gone"), CompactionStrategy::default())
            .unwrap();
        engine
            .commit(WriteBatch::new().put(store("gone"), &b"k"[..], &b"v"[..]))
            .unwrap();
        engine.flush_store(&store("gone")).unwrap();

        engine.delete_store(&store("gone")).unwrap();
        assert!(matches!(
            engine.get(&store("gone"), b"k", None),
            Err(StrataError::StoreNotFound(_))
        ));
        assert!(!dir.path().join("stores").join("gone").exists());

        // the id can be reused
        engine
            .create_store(store("gone"), CompactionStrategy::default())
            .unwrap();
        assert_eq!(engine.get(&store("gone"), b"k", None).unwrap(), None);
    }

    #[test]
    fn test_wal_shortening_after_flush() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.wal_segment_size = 64; // force rotation on every commit
        let engine = StorageEngine::open(dir.path(), config).unwrap();
        engine
            .create_store(store("kv"), CompactionStrategy::default())
            .unwrap();
        for i in 0..4u32 {
            engine
                .commit(WriteBatch::new().put(
                    store("kv"),
                    format!("key-{}", i).into_bytes(),
                    &b"value"[..],
                ))
                .unwrap();
        }

        engine.flush_all_trees().unwrap();
        let deleted = engine.shorten_wal().unwrap();
        assert!(deleted > 0);

        // everything still readable after a restart
        engine.close().unwrap();
        drop(engine);
        let engine = open(dir.path());
        assert_eq!(
            engine.get(&store("kv"), b"key-0", None).unwrap(),
            Some(Bytes::from_static(b"value"))
        );
    }

    #[test]
    fn test_closed_engine_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        engine
            .create_store(store("kv"), CompactionStrategy::default())
            .unwrap();
        engine.close().unwrap();

        assert!(matches!(
            engine.commit(WriteBatch::new().put(store("kv"), &b"k"[..], &b"v"[..])),
            Err(StrataError::Closed)
        ));
        assert!(matches!(
            engine.get(&store("kv"), b"k", None),
            Err(StrataError::Closed)
        ));
        // close is idempotent
        engine.close().unwrap();
    }

    #[test]
    fn test_killswitch_poisons_engine() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        engine
            .create_store(store("kv"), CompactionStrategy::default())
            .unwrap();
        engine.killswitch.trip("disk on fire".into());

        let result = engine.commit(WriteBatch::new().put(store("kv"), &b"k"[..], &b"v"[..]));
        assert!(matches!(result, Err(StrataError::Panicked(reason)) if reason.contains("fire")));
        assert_eq!(engine.state(), ManagerState::Panic);
    }

    #[test]
    fn test_atomic_batch_spans_stores() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        engine
            .create_store(store("a"), CompactionStrategy::default())
            .unwrap();
        engine
            .create_store(store("b"), CompactionStrategy::default())
            .unwrap();

        let tsn = engine
            .commit(
                WriteBatch::new()
                    .put(store("a"), &b"k"[..], &b"va"[..])
                    .put(store("b"), &b"k"[..], &b"vb"[..]),
            )
            .unwrap();

        // both writes carry the same TSN
        let a = engine.store(&store("a")).unwrap();
        let b = engine.store(&store("b")).unwrap();
        assert_eq!(a.get_command(b"k", u64::MAX).unwrap().unwrap().tsn(), tsn);
        assert_eq!(b.get_command(b"k", u64::MAX).unwrap().unwrap().tsn(), tsn);
    }

    #[test]
    fn test_checkpoint_compacts_manifest() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.checkpoint_operations_threshold = 3;
        let engine = StorageEngine::open(dir.path(), config).unwrap();
        engine
            .create_store(store("kv"), CompactionStrategy::default())
            .unwrap();
        for i in 0..5u32 {
            engine
                .commit(WriteBatch::new().put(
                    store("kv"),
                    format!("k{}", i).into_bytes(),
                    &b"v"[..],
                ))
                .unwrap();
            engine.flush_store(&store("kv")).unwrap();
        }

        // sequence numbers survive the rewrite
        drop(engine);
        let engine = open(dir.path());
        let report = engine.report().unwrap();
        assert!(report.manifest_sequence_number >= 6);
        assert_eq!(
            engine.get(&store("kv"), b"k0", None).unwrap(),
            Some(Bytes::from_static(b"v"))
        );
    }

    #[test]
    fn test_reopen_without_wal_is_rejected() {
        let dir = TempDir::new().unwrap();
        {
            let engine = open(dir.path());
            engine
                .create_store(store("kv"), CompactionStrategy::default())
                .unwrap();
            engine
                .commit(WriteBatch::new().put(store("kv"), &b"k1"[..], &b"v1"[..]))
                .unwrap();
            engine.flush_store(&store("kv")).unwrap();
            engine
                .commit(WriteBatch::new().put(store("kv"), &b"k2"[..], &b"v2"[..]))
                .unwrap();
            // dropped without close, like a crash
        }
        std::fs::remove_dir_all(dir.path().join("wal")).unwrap();

        // run files prove committed data existed; a missing log must not
        // silently swallow k2
        let result = StorageEngine::open(dir.path(), EngineConfig::default());
        assert!(matches!(result, Err(StrataError::WalRecovery(_))));
    }

    #[test]
    fn test_concurrent_commit_tsns_ascend_in_log() {
        use crate::wal::{WalEntryStream, WalFile};

        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        engine
            .create_store(store("kv"), CompactionStrategy::default())
            .unwrap();

        let mut writers = Vec::new();
        for thread in 0..8u32 {
            let engine = Arc::clone(&engine);
            writers.push(std::thread::spawn(move || {
                for i in 0..25u32 {
                    let key = format!("k{}-{}", thread, i).into_bytes();
                    engine
                        .commit(WriteBatch::new().put(store("kv"), key, &b"v"[..]))
                        .unwrap();
                }
            }));
        }
        for writer in writers {
            writer.join().unwrap();
        }

        let wal_dir = dir.path().join("wal");
        let mut sequence_numbers: Vec<u64> = std::fs::read_dir(&wal_dir)
            .unwrap()
            .filter_map(|entry| {
                WalFile::parse_sequence_number(&entry.unwrap().file_name().to_string_lossy())
            })
            .collect();
        sequence_numbers.sort_unstable();

        let mut last_commit = 0u64;
        for sequence_number in sequence_numbers {
            let content = std::fs::read(wal_dir.join(WalFile::file_name(sequence_number))).unwrap();
            for item in WalEntryStream::new(Bytes::from(content)) {
                if let WalEntry::TransactionCommit { tsn } = item.unwrap() {
                    assert!(tsn > last_commit, "commit {} after {}", tsn, last_commit);
                    last_commit = tsn;
                }
            }
        }
        assert_eq!(last_commit, 200);
    }

    #[test]
    fn test_background_flush_runs_compaction() {
        use crate::compaction::{FileSeparationStrategy, LeveledCompactionStrategy};

        fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
            while !condition() {
                assert!(
                    std::time::Instant::now() < deadline,
                    "timed out waiting for {}",
                    what
                );
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        }

        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.flush_threshold_size = 64;
        let engine = StorageEngine::open(dir.path(), config).unwrap();
        let strategy = CompactionStrategy::Leveled(LeveledCompactionStrategy {
            level0_file_count_trigger: 2,
            file_separation: FileSeparationStrategy::SingleFile,
            ..LeveledCompactionStrategy::default()
        });
        engine.create_store(store("auto"), strategy).unwrap();
        let tree = engine.store(&store("auto")).unwrap();

        for round in 0..2u32 {
            let key = format!("k{}", round).into_bytes();
            engine
                .commit(WriteBatch::new().put(store("auto"), key, vec![0u8; 128]))
                .unwrap();
            // each commit crosses the threshold and schedules a flush
            wait_until("background flush", || tree.report().memory_bytes == 0);
        }

        // the second flush put two files at level 0; the follow-up check
        // merges them without an explicit compact call
        wait_until("automatic compaction", || tree.report().file_count == 1);
        assert_eq!(
            engine.get(&store("auto"), b"k0", None).unwrap(),
            Some(Bytes::from(vec![0u8; 128]))
        );
    }
}
