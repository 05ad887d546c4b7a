//! Manifest
//!
//! The manifest file is the authoritative record of which run files make
//! up which store. It is an append-only log; every line holds one JSON
//! operation prefixed by the CRC32 of the JSON text:
//!
//! ```text
//! 1a2b3c4d {"type":"flush","sequenceNumber":3,...}
//! ```
//!
//! Replay folds the operations into an in-memory [`Manifest`] snapshot,
//! validating every precondition on the way. A rejected operation aborts
//! the open with a [`StrataError::ManifestReplay`].

pub mod operation;
pub mod store_metadata;

pub use operation::ManifestOperation;
pub use store_metadata::{LsmFileInfo, StoreMetadata};

use crate::wal::file::{atomic_write, fsync_dir};
use crate::{Result, StoreId, StrataError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const MANIFEST_FILE_NAME: &str = "manifest";

/// Immutable snapshot of the manifest state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub stores: BTreeMap<StoreId, StoreMetadata>,
    pub last_sequence_number: u64,
}

impl Manifest {
    pub fn store(&self, store_id: &StoreId) -> Option<&StoreMetadata> {
        self.stores.get(store_id)
    }
}

struct ManifestInner {
    manifest: Manifest,
    writer: File,
    /// Operations in the current file, checkpoints included.
    operations_in_file: usize,
}

/// The on-disk manifest log plus its current in-memory fold.
pub struct ManifestFile {
    path: PathBuf,
    inner: Mutex<ManifestInner>,
}

impl ManifestFile {
    /// Open (or create) the manifest and replay it.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE_NAME);
        if !path.exists() {
            File::create(&path)?.sync_all()?;
            fsync_dir(dir)?;
        }

        // after a crash, make sure what we replay is what the disk holds
        let mut file = OpenOptions::new().read(true).open(&path)?;
        file.sync_all()?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;

        let mut manifest = Manifest::default();
        let mut operations_in_file = 0usize;
        for (line_number, line) in content.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let operation = Self::parse_line(line, line_number + 1)?;
            Self::check_sequencing(&manifest, &operation, operations_in_file == 0)?;
            operation.apply_to(&mut manifest)?;
            operations_in_file += 1;
        }

        info!(
            path = %path.display(),
            operations = operations_in_file,
            stores = manifest.stores.len(),
            last_sequence_number = manifest.last_sequence_number,
            "manifest replayed"
        );

        let writer = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(ManifestInner {
                manifest,
                writer,
                operations_in_file,
            }),
        })
    }

    fn parse_line(line: &str, line_number: usize) -> Result<ManifestOperation> {
        let (hash, json) = line.split_once(' ').ok_or_else(|| {
            StrataError::Corruption(format!(
                "manifest line {} has no checksum separator",
                line_number
            ))
        })?;
        let expected = u32::from_str_radix(hash, 16).map_err(|_| {
            StrataError::Corruption(format!(
                "manifest line {} has invalid checksum '{}'",
                line_number, hash
            ))
        })?;
        let actual = crc32fast::hash(json.as_bytes());
        if expected != actual {
            return Err(StrataError::ChecksumMismatch { expected, actual });
        }
        serde_json::from_str(json).map_err(|e| {
            StrataError::Corruption(format!("manifest line {} is not valid: {}", line_number, e))
        })
    }

    fn check_sequencing(
        manifest: &Manifest,
        operation: &ManifestOperation,
        is_first: bool,
    ) -> Result<()> {
        let sequence_number = operation.sequence_number();
        if operation.is_checkpoint() {
            if !is_first {
                return Err(StrataError::ManifestReplay {
                    sequence_number,
                    reason: "checkpoint is only valid as the first operation".into(),
                });
            }
            return Ok(());
        }
        let expected = manifest.last_sequence_number + 1;
        if sequence_number != expected {
            return Err(StrataError::ManifestReplay {
                sequence_number,
                reason: format!("expected sequence number {}", expected),
            });
        }
        Ok(())
    }

    fn render_line(operation: &ManifestOperation) -> Result<String> {
        let json = serde_json::to_string(operation)
            .map_err(|e| StrataError::Internal(format!("manifest serialization failed: {}", e)))?;
        Ok(format!("{:08x} {}\n", crc32fast::hash(json.as_bytes()), json))
    }

    /// Current snapshot.
    pub fn current(&self) -> Manifest {
        self.inner.lock().manifest.clone()
    }

    /// Append one operation. The closure receives the sequence number the
    /// operation must carry; the operation is validated against the
    /// current state before it is persisted, and the new snapshot is
    /// returned.
    pub fn append_operation<F>(&self, build: F) -> Result<Manifest>
    where
        F: FnOnce(u64) -> ManifestOperation,
    {
        let mut inner = self.inner.lock();
        let sequence_number = inner.manifest.last_sequence_number + 1;
        let operation = build(sequence_number);
        if operation.sequence_number() != sequence_number {
            return Err(StrataError::Internal(format!(
                "manifest operation built with sequence number {}, expected {}",
                operation.sequence_number(),
                sequence_number
            )));
        }
        if operation.is_checkpoint() {
            return Err(StrataError::Internal(
                "checkpoints are written by rewrite, not append".into(),
            ));
        }

        let mut next = inner.manifest.clone();
        operation.apply_to(&mut next)?;

        let line = Self::render_line(&operation)?;
        inner.writer.write_all(line.as_bytes())?;
        inner.writer.sync_all()?;

        debug!(sequence_number, "manifest operation appended");
        inner.manifest = next.clone();
        inner.operations_in_file += 1;
        Ok(next)
    }

    /// Collapse the log into a single checkpoint operation once it holds
    /// more than `max_operations` entries. Returns whether a rewrite
    /// happened.
    pub fn create_checkpoint_if_operations_exceed(&self, max_operations: usize) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.operations_in_file <= max_operations {
            return Ok(false);
        }
        let checkpoint = ManifestOperation::Checkpoint {
            sequence_number: inner.manifest.last_sequence_number + 1,
            stores: inner.manifest.stores.clone(),
        };
        let line = Self::render_line(&checkpoint)?;
        atomic_write(&self.path, line.as_bytes())?;

        checkpoint.apply_to(&mut inner.manifest)?;
        inner.writer = OpenOptions::new().append(true).open(&self.path)?;
        inner.operations_in_file = 1;
        info!(
            operations_before = max_operations,
            sequence_number = inner.manifest.last_sequence_number,
            "manifest checkpoint written"
        );
        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn operations_in_file(&self) -> usize {
        self.inner.lock().operations_in_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::CompactionStrategy;
    use std::fs;
    use tempfile::TempDir;

    fn create_store_op(sequence_number: u64, name: &str) -> ManifestOperation {
        ManifestOperation::CreateStore {
            sequence_number,
            metadata: StoreMetadata::new(
                StoreId::parse(name).unwrap(),
                CompactionStrategy::default(),
                1,
            ),
        }
    }

    #[test]
    fn test_append_and_replay_deterministic() {
        let dir = TempDir::new().unwrap();
        let store = StoreId::parse("alpha").unwrap();
        let snapshot = {
            let manifest = ManifestFile::open(dir.path()).unwrap();
            manifest
                .append_operation(|seq| create_store_op(seq, "alpha"))
                .unwrap();
            manifest
                .append_operation(|seq| ManifestOperation::Flush {
                    sequence_number: seq,
                    store_id: store.clone(),
                    file_index: 0,
                })
                .unwrap()
        };

        let reopened = ManifestFile::open(dir.path()).unwrap();
        assert_eq!(reopened.current(), snapshot);
        assert_eq!(reopened.current().last_sequence_number, 2);
    }

    #[test]
    fn test_rejected_operation_is_not_persisted() {
        let dir = TempDir::new().unwrap();
        let manifest = ManifestFile::open(dir.path()).unwrap();
        let result = manifest.append_operation(|seq| ManifestOperation::Flush {
            sequence_number: seq,
            store_id: StoreId::parse("missing").unwrap(),
            file_index: 0,
        });
        assert!(matches!(result, Err(StrataError::ManifestReplay { .. })));
        assert_eq!(manifest.current(), Manifest::default());
        drop(manifest);

        // the invalid line never hit the disk
        let reopened = ManifestFile::open(dir.path()).unwrap();
        assert_eq!(reopened.current(), Manifest::default());
    }

    #[test]
    fn test_corrupted_line_detected() {
        let dir = TempDir::new().unwrap();
        {
            let manifest = ManifestFile::open(dir.path()).unwrap();
            manifest
                .append_operation(|seq| create_store_op(seq, "beta"))
                .unwrap();
        }
        let path = dir.path().join(MANIFEST_FILE_NAME);
        let mut content = fs::read_to_string(&path).unwrap();
        content = content.replace("beta", "betA");
        fs::write(&path, content).unwrap();

        let result = ManifestFile::open(dir.path());
        assert!(matches!(
            result,
            Err(StrataError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_sequence_gap_detected() {
        let dir = TempDir::new().unwrap();
        {
            let manifest = ManifestFile::open(dir.path()).unwrap();
            manifest
                .append_operation(|seq| create_store_op(seq, "gamma"))
                .unwrap();
        }
        let path = dir.path().join(MANIFEST_FILE_NAME);
        let op = create_store_op(5, "delta");
        let line = ManifestFile::render_line(&op).unwrap();
        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str(&line);
        fs::write(&path, content).unwrap();

        let result = ManifestFile::open(dir.path());
        assert!(matches!(
            result,
            Err(StrataError::ManifestReplay {
                sequence_number: 5,
                ..
            })
        ));
    }

    #[test]
    fn test_checkpoint_rewrite() {
        let dir = TempDir::new().unwrap();
        let manifest = ManifestFile::open(dir.path()).unwrap();
        for i in 0..5 {
            manifest
                .append_operation(|seq| create_store_op(seq, &format!("store{}", i)))
                .unwrap();
        }
        assert!(!manifest
            .create_checkpoint_if_operations_exceed(10)
            .unwrap());
        assert!(manifest.create_checkpoint_if_operations_exceed(3).unwrap());
        assert_eq!(manifest.operations_in_file(), 1);

        let before = manifest.current();
        assert_eq!(before.last_sequence_number, 6);
        drop(manifest);

        // appends after the rewrite continue the sequence
        let reopened = ManifestFile::open(dir.path()).unwrap();
        assert_eq!(reopened.current().stores.len(), 5);
        reopened
            .append_operation(|seq| {
                assert_eq!(seq, 7);
                create_store_op(seq, "aftercheckpoint")
            })
            .unwrap();
    }
}
