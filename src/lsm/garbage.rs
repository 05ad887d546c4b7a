//! Tracking and deletion of run files that fell out of the manifest.
//!
//! Compactions retire their input files, but a concurrent read may still
//! hold one open. Retired files are therefore parked here and only
//! deleted once nothing pins them. The set is not persisted; on open it
//! is rebuilt by diffing the store directory against the manifest.

use crate::sstable;
use crate::{FileIndex, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Default)]
struct TrackerState {
    /// File indices retired from the manifest but not yet deleted.
    garbage: BTreeSet<FileIndex>,
    /// Reader pin counts per file index.
    pins: HashMap<FileIndex, usize>,
}

/// Deferred deletion of retired run files for one store directory.
pub struct GarbageFileTracker {
    dir: PathBuf,
    state: Mutex<TrackerState>,
}

impl GarbageFileTracker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Scan the store directory and mark every run file the manifest
    /// does not know as garbage.
    pub fn rebuild(&self, live_files: &BTreeSet<FileIndex>) -> Result<()> {
        let mut orphans = BTreeSet::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(index) = sstable::parse_file_index(name) {
                if !live_files.contains(&index) {
                    orphans.insert(index);
                }
            }
        }
        if !orphans.is_empty() {
            warn!(
                dir = %self.dir.display(),
                count = orphans.len(),
                "found run files unknown to the manifest, marking as garbage"
            );
        }
        self.state.lock().garbage.extend(orphans);
        Ok(())
    }

    /// Mark retired file indices for deletion.
    pub fn register(&self, indices: impl IntoIterator<Item = FileIndex>) {
        self.state.lock().garbage.extend(indices);
    }

    /// Pin a file against deletion while a reader uses it.
    pub fn pin(self: &Arc<Self>, index: FileIndex) -> FilePin {
        *self.state.lock().pins.entry(index).or_insert(0) += 1;
        FilePin {
            tracker: Arc::clone(self),
            index,
        }
    }

    fn unpin(&self, index: FileIndex) {
        let mut state = self.state.lock();
        if let Some(count) = state.pins.get_mut(&index) {
            *count -= 1;
            if *count == 0 {
                state.pins.remove(&index);
            }
        }
    }

    /// Delete every unpinned garbage file. Returns how many were removed.
    pub fn collect(&self) -> Result<usize> {
        let deletable: Vec<FileIndex> = {
            let state = self.state.lock();
            state
                .garbage
                .iter()
                .filter(|index| !state.pins.contains_key(index))
                .copied()
                .collect()
        };

        let mut deleted = 0;
        for index in deletable {
            let path = self.file_path(index);
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!(file = %path.display(), "deleted garbage run file");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.state.lock().garbage.remove(&index);
            deleted += 1;
        }
        Ok(deleted)
    }

    pub fn garbage_count(&self) -> usize {
        self.state.lock().garbage.len()
    }

    fn file_path(&self, index: FileIndex) -> PathBuf {
        self.dir.join(sstable::file_name(index))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Keeps one run file alive for the duration of a read.
pub struct FilePin {
    tracker: Arc<GarbageFileTracker>,
    index: FileIndex,
}

impl Drop for FilePin {
    fn drop(&mut self) {
        self.tracker.unpin(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, index: FileIndex) {
        std::fs::write(dir.join(sstable::file_name(index)), b"x").unwrap();
    }

    #[test]
    fn test_collect_deletes_registered_files() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), 1);
        touch(dir.path(), 2);

        let tracker = GarbageFileTracker::new(dir.path());
        tracker.register([1]);
        assert_eq!(tracker.collect().unwrap(), 1);

        assert!(!dir.path().join(sstable::file_name(1)).exists());
        assert!(dir.path().join(sstable::file_name(2)).exists());
        assert_eq!(tracker.garbage_count(), 0);
    }

    #[test]
    fn test_pinned_files_survive_collection() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), 3);

        let tracker = Arc::new(GarbageFileTracker::new(dir.path()));
        tracker.register([3]);

        let pin = tracker.pin(3);
        assert_eq!(tracker.collect().unwrap(), 0);
        assert!(dir.path().join(sstable::file_name(3)).exists());

        drop(pin);
        assert_eq!(tracker.collect().unwrap(), 1);
        assert!(!dir.path().join(sstable::file_name(3)).exists());
    }

    #[test]
    fn test_rebuild_finds_orphans() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), 1);
        touch(dir.path(), 2);
        touch(dir.path(), 3);
        std::fs::write(dir.path().join("not-a-run-file"), b"x").unwrap();

        let tracker = GarbageFileTracker::new(dir.path());
        let live: BTreeSet<FileIndex> = [1, 3].into_iter().collect();
        tracker.rebuild(&live).unwrap();

        assert_eq!(tracker.garbage_count(), 1);
        assert_eq!(tracker.collect().unwrap(), 1);
        assert!(dir.path().join(sstable::file_name(1)).exists());
        assert!(!dir.path().join(sstable::file_name(2)).exists());
    }
}
