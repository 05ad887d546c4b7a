//! One LSM tree per store.

use super::garbage::{FilePin, GarbageFileTracker};
use super::memtable::MemTable;
use crate::compaction::{
    CompactableFile, CompactionStrategy, CompactionTask, FileSeparationStrategy,
    LeveledCompactionProcess, MergeIterator, TieredCompactionProcess, VersionRetention,
};
use crate::manifest::{ManifestFile, ManifestOperation, StoreMetadata};
use crate::sstable::{self, RunFileMeta, RunFileReader, RunFileWriter};
use crate::{Command, FileIndex, Result, StoreId, StrataError, Tsn};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Snapshot of one tree's shape, for reporting.
#[derive(Debug, Clone)]
pub struct LsmTreeReport {
    pub store_id: StoreId,
    pub memory_bytes: u64,
    pub immutable_memtables: usize,
    pub file_count: usize,
    pub garbage_files: usize,
}

pub struct LsmTree {
    store_id: StoreId,
    dir: PathBuf,
    manifest: Arc<ManifestFile>,
    garbage: Arc<GarbageFileTracker>,
    active: RwLock<Arc<MemTable>>,
    /// Oldest first.
    immutable: RwLock<Vec<Arc<MemTable>>>,
    files: RwLock<BTreeMap<FileIndex, Arc<RunFileReader>>>,
    /// Serializes flush and compaction; also guards file index allocation.
    maintenance: Mutex<()>,
    /// Never reuses an index, even one the manifest forgot about.
    next_file_index: AtomicU64,
}

impl LsmTree {
    /// Open the tree for a store the manifest already knows. Reads back
    /// all listed run files and sweeps orphaned ones.
    pub fn open(store_id: StoreId, stores_dir: &Path, manifest: Arc<ManifestFile>) -> Result<Arc<Self>> {
        let metadata = Self::require_metadata(&manifest, &store_id)?;
        let dir = stores_dir.join(store_id.path());
        std::fs::create_dir_all(&dir)?;

        let mut files = BTreeMap::new();
        for index in metadata.all_file_indices() {
            let path = dir.join(sstable::file_name(index));
            let reader = RunFileReader::open(&path)?;
            if reader.meta().file_index != index {
                return Err(StrataError::Corruption(format!(
                    "run file {} claims index {}",
                    path.display(),
                    reader.meta().file_index
                )));
            }
            files.insert(index, Arc::new(reader));
        }

        let mut next_file_index = metadata.next_free_file_index();
        for entry in std::fs::read_dir(&dir)? {
            let name = entry?.file_name();
            if let Some(index) = name.to_str().and_then(sstable::parse_file_index) {
                next_file_index = next_file_index.max(index + 1);
            }
        }

        let garbage = Arc::new(GarbageFileTracker::new(&dir));
        garbage.rebuild(&metadata.all_file_indices())?;
        garbage.collect()?;

        info!(
            store = %store_id,
            files = files.len(),
            "opened store"
        );

        Ok(Arc::new(Self {
            store_id,
            dir,
            manifest,
            garbage,
            active: RwLock::new(Arc::new(MemTable::new())),
            immutable: RwLock::new(Vec::new()),
            files: RwLock::new(files),
            maintenance: Mutex::new(()),
            next_file_index: AtomicU64::new(next_file_index),
        }))
    }

    pub fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    /// Apply one committed command to the active memtable. Returns the
    /// bytes the entry added, for forest accounting.
    pub fn apply_command(&self, command: Command) -> usize {
        self.active.read().apply(command)
    }

    /// Point lookup: the newest version of `key` visible at `max_tsn`.
    /// Tombstones read as absent.
    pub fn get(&self, key: &[u8], max_tsn: Tsn) -> Result<Option<Bytes>> {
        Ok(self
            .get_command(key, max_tsn)?
            .and_then(|command| command.value().cloned()))
    }

    /// Like [`get`](Self::get), but exposes the winning command,
    /// tombstones included.
    pub fn get_command(&self, key: &[u8], max_tsn: Tsn) -> Result<Option<Command>> {
        // memtables hold strictly newer data than run files, and the
        // active one is newer than any immutable
        if let Some(command) = self.active.read().get(key, max_tsn) {
            return Ok(Some(command));
        }
        for memtable in self.immutable.read().iter().rev() {
            if let Some(command) = memtable.get(key, max_tsn) {
                return Ok(Some(command));
            }
        }

        // collect candidate files under the lock, pin them, then read
        // without blocking concurrent maintenance
        let candidates: Vec<(Arc<RunFileReader>, FilePin)> = {
            let files = self.files.read();
            files
                .iter()
                .filter(|(_, reader)| {
                    reader.meta().may_contain_key(key) && reader.meta().min_tsn <= max_tsn
                })
                .map(|(index, reader)| (Arc::clone(reader), self.garbage.pin(*index)))
                .collect()
        };

        let mut best: Option<Command> = None;
        for (reader, _pin) in &candidates {
            if let Some(command) = reader.get(key, max_tsn)? {
                if best.as_ref().map_or(true, |b| command.tsn() > b.tsn()) {
                    best = Some(command);
                }
            }
        }
        Ok(best)
    }

    /// Write all in-memory data out as one run file and record it in the
    /// manifest. Returns whether anything was written.
    pub fn flush(&self) -> Result<bool> {
        let _guard = self.maintenance.lock();

        // seal the active memtable; writers move on to a fresh one
        {
            let mut active = self.active.write();
            if !active.is_empty() {
                let sealed = std::mem::replace(&mut *active, Arc::new(MemTable::new()));
                self.immutable.write().push(sealed);
            }
        }
        let memtables: Vec<Arc<MemTable>> = self.immutable.read().clone();
        if memtables.is_empty() {
            return Ok(false);
        }

        let max_tsn = memtables.iter().filter_map(|m| m.max_tsn()).max().unwrap_or(0);
        let sources: Vec<_> = memtables
            .iter()
            .map(|m| m.commands().into_iter().map(Ok))
            .collect();
        let merged = MergeIterator::new(sources)?;

        let first_index = self.next_file_index.load(Ordering::Relaxed);
        let mut writer = RunFileWriter::new(
            &self.dir,
            first_index,
            FileSeparationStrategy::SingleFile,
            0,
            max_tsn,
        );
        for command in merged {
            writer.add(&command?)?;
        }
        let metas = writer.finish()?;
        let meta = match metas.as_slice() {
            [meta] => meta.clone(),
            _ => {
                return Err(StrataError::Internal(format!(
                    "flush produced {} run files, expected exactly one",
                    metas.len()
                )))
            }
        };
        self.next_file_index
            .store(meta.file_index + 1, Ordering::Relaxed);

        let store_id = self.store_id.clone();
        self.manifest.append_operation(|sequence_number| ManifestOperation::Flush {
            sequence_number,
            store_id,
            file_index: meta.file_index,
        })?;

        let reader = Arc::new(RunFileReader::open(&self.dir.join(sstable::file_name(meta.file_index)))?);
        self.files.write().insert(meta.file_index, reader);
        self.immutable
            .write()
            .retain(|m| !memtables.iter().any(|f| Arc::ptr_eq(m, f)));

        info!(
            store = %self.store_id,
            file_index = meta.file_index,
            entries = meta.entry_count,
            max_tsn,
            "memtable flushed"
        );
        Ok(true)
    }

    /// Run one compaction round if the store's strategy asks for one.
    ///
    /// `history_watermark` is the lowest TSN any reader may still
    /// request; history strictly below it is dropped.
    pub fn compact(&self, history_watermark: Tsn) -> Result<bool> {
        let _guard = self.maintenance.lock();
        let metadata = Self::require_metadata(&self.manifest, &self.store_id)?;
        let candidates = self.compactable_files(&metadata)?;

        let task = match &metadata.compaction_strategy {
            CompactionStrategy::Leveled(strategy) => {
                LeveledCompactionProcess::check(strategy, &candidates)
            }
            CompactionStrategy::Tiered(strategy) => {
                TieredCompactionProcess::check(strategy, &candidates)
            }
        };
        let Some(task) = task else {
            return Ok(false);
        };

        debug!(store = %self.store_id, trigger = ?task.trigger(), "compaction triggered");
        let inputs: BTreeSet<FileIndex> = task.file_indices().iter().copied().collect();
        let outputs = self.merge_files(
            &inputs,
            metadata.compaction_strategy.file_separation().clone(),
            VersionRetention::DropHistoryOlderThan(history_watermark),
            task.keep_tombstones(),
        )?;
        let output_indices: BTreeSet<FileIndex> = outputs.iter().map(|m| m.file_index).collect();

        let store_id = self.store_id.clone();
        self.manifest
            .append_operation(|sequence_number| match &task {
                CompactionTask::Leveled {
                    lower_level,
                    upper_level,
                    ..
                } => ManifestOperation::LeveledCompaction {
                    sequence_number,
                    store_id: store_id.clone(),
                    lower_level: *lower_level,
                    upper_level: *upper_level,
                    input_file_indices: inputs.clone(),
                    output_file_indices: output_indices.clone(),
                },
                CompactionTask::Tiered { input_tiers, .. } => {
                    ManifestOperation::TieredCompaction {
                        sequence_number,
                        store_id: store_id.clone(),
                        input_tiers: input_tiers.clone(),
                        input_file_indices: inputs.clone(),
                        output_file_indices: output_indices.clone(),
                    }
                }
            })?;

        self.install_outputs(task.file_indices(), &outputs)?;
        info!(
            store = %self.store_id,
            trigger = ?task.trigger(),
            inputs = task.file_indices().len(),
            outputs = outputs.len(),
            "compaction finished"
        );
        Ok(true)
    }

    /// Merge every run file of the store into the deepest level or tier,
    /// dropping all history below the watermark and all tombstones.
    pub fn full_compaction(&self, history_watermark: Tsn) -> Result<bool> {
        let _guard = self.maintenance.lock();
        let metadata = Self::require_metadata(&self.manifest, &self.store_id)?;
        let inputs = metadata.all_file_indices();
        if inputs.is_empty() {
            return Ok(false);
        }

        let output_level_or_tier = match &metadata.compaction_strategy {
            CompactionStrategy::Leveled(strategy) => strategy.max_levels,
            CompactionStrategy::Tiered(_) => metadata.max_level_or_tier().unwrap_or(0),
        };
        let outputs = self.merge_files(
            &inputs,
            metadata.compaction_strategy.file_separation().clone(),
            VersionRetention::DropHistoryOlderThan(history_watermark),
            false,
        )?;
        let output_indices: BTreeSet<FileIndex> = outputs.iter().map(|m| m.file_index).collect();

        let store_id = self.store_id.clone();
        let input_indices = inputs.clone();
        self.manifest
            .append_operation(|sequence_number| ManifestOperation::FullCompaction {
                sequence_number,
                store_id,
                input_file_indices: input_indices,
                output_file_indices: output_indices,
                output_level_or_tier,
            })?;

        let input_list: Vec<FileIndex> = inputs.into_iter().collect();
        self.install_outputs(&input_list, &outputs)?;
        info!(
            store = %self.store_id,
            inputs = input_list.len(),
            outputs = outputs.len(),
            "full compaction finished"
        );
        Ok(true)
    }

    /// Drop all in-memory and on-disk state. Called after the manifest
    /// recorded the store's deletion.
    pub fn destroy(&self) -> Result<()> {
        let _guard = self.maintenance.lock();
        let indices: Vec<FileIndex> = {
            let mut files = self.files.write();
            let indices = files.keys().copied().collect();
            files.clear();
            indices
        };
        self.immutable.write().clear();
        *self.active.write() = Arc::new(MemTable::new());
        self.garbage.register(indices);
        self.garbage.collect()?;
        Ok(())
    }

    /// Highest TSN known to be fully persisted in run files. WAL entries
    /// at or below this need no replay for this store.
    pub fn persisted_max_tsn(&self) -> Tsn {
        self.files
            .read()
            .values()
            .map(|reader| reader.meta().max_tsn)
            .max()
            .unwrap_or(0)
    }

    /// The highest TSN whose WAL entries this store no longer needs.
    /// `u64::MAX` when everything is persisted.
    pub fn wal_low_watermark(&self) -> Tsn {
        let mut min_unflushed: Option<Tsn> = self.active.read().min_tsn();
        for memtable in self.immutable.read().iter() {
            min_unflushed = match (min_unflushed, memtable.min_tsn()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        match min_unflushed {
            Some(tsn) => tsn.saturating_sub(1),
            None => u64::MAX,
        }
    }

    /// Bytes currently held in memtables.
    pub fn memory_bytes(&self) -> u64 {
        let active = self.active.read().size_bytes() as u64;
        let immutable: u64 = self
            .immutable
            .read()
            .iter()
            .map(|m| m.size_bytes() as u64)
            .sum();
        active + immutable
    }

    pub fn report(&self) -> LsmTreeReport {
        LsmTreeReport {
            store_id: self.store_id.clone(),
            memory_bytes: self.memory_bytes(),
            immutable_memtables: self.immutable.read().len(),
            file_count: self.files.read().len(),
            garbage_files: self.garbage.garbage_count(),
        }
    }

    fn require_metadata(manifest: &ManifestFile, store_id: &StoreId) -> Result<StoreMetadata> {
        manifest
            .current()
            .store(store_id)
            .cloned()
            .ok_or_else(|| StrataError::StoreNotFound(store_id.to_string()))
    }

    fn compactable_files(&self, metadata: &StoreMetadata) -> Result<Vec<CompactableFile>> {
        let files = self.files.read();
        let mut candidates = Vec::with_capacity(files.len());
        for (index, info) in &metadata.files {
            let Some(reader) = files.get(index) else {
                return Err(StrataError::Internal(format!(
                    "manifest lists file {} but it is not open",
                    index
                )));
            };
            let meta = reader.meta();
            let size_bytes = std::fs::metadata(reader.path())?.len();
            candidates.push(CompactableFile {
                index: *index,
                level_or_tier: info.level_or_tier,
                size_bytes,
                min_key: Bytes::copy_from_slice(&meta.min_key),
                max_key: Bytes::copy_from_slice(&meta.max_key),
                min_tsn: meta.min_tsn,
                max_tsn: meta.max_tsn,
                head_entries: meta.head_entries,
                history_entries: meta.history_entries,
            });
        }
        Ok(candidates)
    }

    /// Merge the given input files into fresh output files. Does not
    /// touch the manifest or the open file map.
    fn merge_files(
        &self,
        inputs: &BTreeSet<FileIndex>,
        separation: FileSeparationStrategy,
        retention: VersionRetention,
        keep_tombstones: bool,
    ) -> Result<Vec<RunFileMeta>> {
        let files = self.files.read();
        let mut sources = Vec::with_capacity(inputs.len());
        let mut number_of_merges = 0u64;
        let mut max_completely_written_tsn = 0;
        for index in inputs {
            let reader = files.get(index).ok_or_else(|| {
                StrataError::Internal(format!("compaction input file {} is not open", index))
            })?;
            number_of_merges = number_of_merges.max(reader.meta().number_of_merges);
            max_completely_written_tsn =
                max_completely_written_tsn.max(reader.meta().max_completely_written_tsn);
            sources.push(reader.cursor()?);
        }
        drop(files);

        let merged = crate::compaction::merge::merge_commands(sources, retention, keep_tombstones)?;
        let first_index = self.next_file_index.load(Ordering::Relaxed);
        let mut writer = RunFileWriter::new(
            &self.dir,
            first_index,
            separation,
            number_of_merges + 1,
            max_completely_written_tsn,
        );
        for command in merged {
            writer.add(&command?)?;
        }
        let metas = writer.finish_with_at_least_one_file()?;
        if let Some(last) = metas.last() {
            self.next_file_index
                .store(last.file_index + 1, Ordering::Relaxed);
        }
        Ok(metas)
    }

    /// Swap compaction inputs for outputs in the open file map, then park
    /// the inputs for deletion.
    fn install_outputs(&self, inputs: &[FileIndex], outputs: &[RunFileMeta]) -> Result<()> {
        let mut opened = Vec::with_capacity(outputs.len());
        for meta in outputs {
            let path = self.dir.join(sstable::file_name(meta.file_index));
            opened.push((meta.file_index, Arc::new(RunFileReader::open(&path)?)));
        }
        {
            let mut files = self.files.write();
            for index in inputs {
                files.remove(index);
            }
            for (index, reader) in opened {
                files.insert(index, reader);
            }
        }
        self.garbage.register(inputs.iter().copied());
        self.garbage.collect()?;
        Ok(())
    }
}
