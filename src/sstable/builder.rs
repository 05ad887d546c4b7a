//! Run file writer

use super::{file_name, RunFileMeta, MAGIC};
use crate::compaction::FileSeparationStrategy;
use crate::wal::file::fsync_dir;
use crate::{Command, FileIndex, Result, StrataError, Tsn};
use bytes::{BufMut, BytesMut};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Writes a sorted command stream out as one or more run files,
/// allocating ascending file indices and honoring the store's file
/// separation strategy.
pub struct RunFileWriter {
    dir: PathBuf,
    separation: FileSeparationStrategy,
    number_of_merges: u64,
    max_completely_written_tsn: Tsn,
    next_index: FileIndex,
    current: Option<OpenFile>,
    finished: Vec<RunFileMeta>,
}

struct OpenFile {
    writer: BufWriter<File>,
    meta: RunFileMeta,
    data_bytes: u64,
    last_key: Vec<u8>,
}

impl RunFileWriter {
    pub fn new(
        dir: &Path,
        first_index: FileIndex,
        separation: FileSeparationStrategy,
        number_of_merges: u64,
        max_completely_written_tsn: Tsn,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            separation,
            number_of_merges,
            max_completely_written_tsn,
            next_index: first_index,
            current: None,
            finished: Vec::new(),
        }
    }

    /// Append the next command. Commands must arrive in ascending
    /// (key, TSN) order.
    pub fn add(&mut self, command: &Command) -> Result<()> {
        if let Some(current) = &self.current {
            let key_changed = current.last_key.as_slice() != command.key().as_ref();
            if key_changed && self.should_roll(current.data_bytes) {
                // roll only between key groups so all versions of a key
                // share a file
                self.finish_current()?;
            }
        }

        if self.current.is_none() {
            self.open_next(command)?;
        }
        let current = self.current.as_mut().expect("file was just opened");

        let mut buf = BytesMut::with_capacity(4 + command.byte_size());
        buf.put_u32_le(command.byte_size() as u32);
        command.write_to(&mut buf);
        current.writer.write_all(&buf)?;
        current.data_bytes += buf.len() as u64;

        let meta = &mut current.meta;
        let same_key =
            meta.entry_count > 0 && current.last_key.as_slice() == command.key().as_ref();
        meta.max_key = command.key().to_vec();
        meta.min_tsn = meta.min_tsn.min(command.tsn());
        meta.max_tsn = meta.max_tsn.max(command.tsn());
        meta.entry_count += 1;
        if same_key {
            // previous entry of the same key just became history
            meta.head_entries -= 1;
            meta.history_entries += 1;
        }
        meta.head_entries += 1;
        current.last_key = command.key().to_vec();
        Ok(())
    }

    fn should_roll(&self, data_bytes: u64) -> bool {
        match self.separation {
            FileSeparationStrategy::SingleFile => false,
            FileSeparationStrategy::SizeBased { max_file_size } => data_bytes >= max_file_size,
        }
    }

    fn open_next(&mut self, first_command: &Command) -> Result<()> {
        let index = self.next_index;
        self.next_index += 1;
        let path = self.dir.join(file_name(index));
        let file = File::create(&path)?;
        self.current = Some(OpenFile {
            writer: BufWriter::new(file),
            meta: RunFileMeta {
                file_index: index,
                min_key: first_command.key().to_vec(),
                max_key: first_command.key().to_vec(),
                min_tsn: Tsn::MAX,
                max_tsn: 0,
                entry_count: 0,
                head_entries: 0,
                history_entries: 0,
                number_of_merges: self.number_of_merges,
                max_completely_written_tsn: self.max_completely_written_tsn,
            },
            data_bytes: 0,
            last_key: Vec::new(),
        });
        Ok(())
    }

    fn finish_current(&mut self) -> Result<()> {
        let Some(mut current) = self.current.take() else {
            return Ok(());
        };
        let meta_bytes = bincode::serialize(&current.meta)
            .map_err(|e| StrataError::InvalidFormat(e.to_string()))?;
        let mut footer = BytesMut::with_capacity(meta_bytes.len() + 12);
        footer.put_slice(&meta_bytes);
        footer.put_u32_le(meta_bytes.len() as u32);
        footer.put_u32_le(crc32fast::hash(&meta_bytes));
        footer.put_slice(MAGIC);
        current.writer.write_all(&footer)?;
        current.writer.flush()?;
        current.writer.get_ref().sync_all()?;

        debug!(
            file = %self.dir.join(file_name(current.meta.file_index)).display(),
            entries = current.meta.entry_count,
            "run file written"
        );
        self.finished.push(current.meta);
        Ok(())
    }

    /// Seal all files and fsync the directory. Returns the metadata of
    /// every file written, in index order.
    pub fn finish(mut self) -> Result<Vec<RunFileMeta>> {
        self.finish_current()?;
        if !self.finished.is_empty() {
            fsync_dir(&self.dir)?;
        }
        Ok(self.finished)
    }

    /// Like [`finish`](Self::finish), but writes an empty run file when
    /// no command was ever added. A compaction result must be backed by
    /// at least one file even if the merge dropped every version.
    pub fn finish_with_at_least_one_file(mut self) -> Result<Vec<RunFileMeta>> {
        if self.current.is_none() && self.finished.is_empty() {
            let index = self.next_index;
            self.next_index += 1;
            let file = File::create(self.dir.join(file_name(index)))?;
            self.current = Some(OpenFile {
                writer: BufWriter::new(file),
                meta: RunFileMeta {
                    file_index: index,
                    min_key: Vec::new(),
                    max_key: Vec::new(),
                    min_tsn: 0,
                    max_tsn: 0,
                    entry_count: 0,
                    head_entries: 0,
                    history_entries: 0,
                    number_of_merges: self.number_of_merges,
                    max_completely_written_tsn: self.max_completely_written_tsn,
                },
                data_bytes: 0,
                last_key: Vec::new(),
            });
        }
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_writer_produces_no_files() {
        let dir = TempDir::new().unwrap();
        let writer = RunFileWriter::new(
            dir.path(),
            0,
            FileSeparationStrategy::SingleFile,
            0,
            0,
        );
        assert!(writer.finish().unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_forced_output_writes_empty_file() {
        let dir = TempDir::new().unwrap();
        let writer = RunFileWriter::new(
            dir.path(),
            3,
            FileSeparationStrategy::SingleFile,
            1,
            9,
        );
        let metas = writer.finish_with_at_least_one_file().unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].file_index, 3);
        assert_eq!(metas[0].entry_count, 0);

        let reader = crate::sstable::RunFileReader::open(&dir.path().join(file_name(3))).unwrap();
        assert!(!reader.meta().may_contain_key(b"anything"));
        assert_eq!(reader.cursor().unwrap().count(), 0);
    }

    #[test]
    fn test_metadata_tracks_versions() {
        let dir = TempDir::new().unwrap();
        let mut writer = RunFileWriter::new(
            dir.path(),
            5,
            FileSeparationStrategy::SingleFile,
            2,
            40,
        );
        writer.add(&Command::put(&b"a"[..], 10, &b"v1"[..])).unwrap();
        writer.add(&Command::put(&b"a"[..], 20, &b"v2"[..])).unwrap();
        writer.add(&Command::del(&b"b"[..], 30)).unwrap();
        let metas = writer.finish().unwrap();

        assert_eq!(metas.len(), 1);
        let meta = &metas[0];
        assert_eq!(meta.file_index, 5);
        assert_eq!(meta.min_key, b"a".to_vec());
        assert_eq!(meta.max_key, b"b".to_vec());
        assert_eq!(meta.min_tsn, 10);
        assert_eq!(meta.max_tsn, 30);
        assert_eq!(meta.entry_count, 3);
        assert_eq!(meta.head_entries, 2);
        assert_eq!(meta.history_entries, 1);
        assert_eq!(meta.number_of_merges, 2);
        assert_eq!(meta.max_completely_written_tsn, 40);
    }

    #[test]
    fn test_size_based_separation_rolls_between_keys() {
        let dir = TempDir::new().unwrap();
        let mut writer = RunFileWriter::new(
            dir.path(),
            0,
            FileSeparationStrategy::SizeBased { max_file_size: 64 },
            0,
            0,
        );
        for i in 0..20u32 {
            let key = format!("key-{:04}", i);
            writer
                .add(&Command::put(key.into_bytes(), i as u64 + 1, vec![0u8; 16]))
                .unwrap();
        }
        let metas = writer.finish().unwrap();
        assert!(metas.len() > 1);
        // indices are dense and ascending
        for (offset, meta) in metas.iter().enumerate() {
            assert_eq!(meta.file_index, offset as u64);
        }
        let total: u64 = metas.iter().map(|m| m.entry_count).sum();
        assert_eq!(total, 20);
    }
}
