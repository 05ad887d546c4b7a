//! Run file reader

use super::{RunFileMeta, MAGIC};
use crate::{Command, Result, StrataError, Tsn};
use bytes::{Buf, Bytes};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Reader for a single run file. Opening validates the footer and loads
/// the metadata; the data section is streamed on demand.
pub struct RunFileReader {
    path: PathBuf,
    meta: RunFileMeta,
    data_len: u64,
}

impl RunFileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < 12 {
            return Err(StrataError::Corruption(format!(
                "run file {} is too short ({} bytes)",
                path.display(),
                file_len
            )));
        }

        file.seek(SeekFrom::End(-12))?;
        let mut footer = [0u8; 12];
        file.read_exact(&mut footer)?;
        if &footer[8..12] != MAGIC {
            return Err(StrataError::Corruption(format!(
                "run file {} has invalid magic",
                path.display()
            )));
        }
        let meta_len = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]) as u64;
        let expected = u32::from_le_bytes([footer[4], footer[5], footer[6], footer[7]]);
        if meta_len + 12 > file_len {
            return Err(StrataError::Corruption(format!(
                "run file {} metadata length {} exceeds file size",
                path.display(),
                meta_len
            )));
        }

        file.seek(SeekFrom::End(-12 - meta_len as i64))?;
        let mut meta_bytes = vec![0u8; meta_len as usize];
        file.read_exact(&mut meta_bytes)?;
        let actual = crc32fast::hash(&meta_bytes);
        if actual != expected {
            return Err(StrataError::ChecksumMismatch { expected, actual });
        }
        let meta: RunFileMeta = bincode::deserialize(&meta_bytes)
            .map_err(|e| StrataError::InvalidFormat(e.to_string()))?;

        Ok(Self {
            path: path.to_path_buf(),
            meta,
            data_len: file_len - 12 - meta_len,
        })
    }

    pub fn meta(&self) -> &RunFileMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cursor over all commands, in (key, TSN) order.
    pub fn cursor(&self) -> Result<RunFileCursor> {
        let file = File::open(&self.path)?;
        Ok(RunFileCursor {
            reader: BufReader::new(file),
            remaining_bytes: self.data_len,
            remaining_entries: self.meta.entry_count,
        })
    }

    /// Newest version of `key` visible to a reader at `max_tsn`.
    ///
    /// A returned tombstone means the key was deleted; `None` means this
    /// file simply has nothing to say about the key.
    pub fn get(&self, key: &[u8], max_tsn: Tsn) -> Result<Option<Command>> {
        if !self.meta.may_contain_key(key) {
            return Ok(None);
        }
        let mut best = None;
        for item in self.cursor()? {
            let command = item?;
            match command.key().as_ref().cmp(key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Greater => break,
                std::cmp::Ordering::Equal => {
                    if command.tsn() <= max_tsn {
                        // ascending TSN order, later hits are newer
                        best = Some(command);
                    }
                }
            }
        }
        Ok(best)
    }
}

/// Streaming cursor over a run file's data section.
pub struct RunFileCursor {
    reader: BufReader<File>,
    remaining_bytes: u64,
    remaining_entries: u64,
}

impl RunFileCursor {
    fn read_next(&mut self) -> Result<Command> {
        let mut len_bytes = [0u8; 4];
        self.reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as u64;
        if len + 4 > self.remaining_bytes {
            return Err(StrataError::Corruption(
                "run file entry overruns data section".into(),
            ));
        }
        let mut entry = vec![0u8; len as usize];
        self.reader.read_exact(&mut entry)?;
        self.remaining_bytes -= len + 4;
        let mut buf = Bytes::from(entry);
        let command = Command::read_from(&mut buf)?;
        if buf.has_remaining() {
            return Err(StrataError::Corruption(
                "run file entry has trailing bytes".into(),
            ));
        }
        Ok(command)
    }
}

impl Iterator for RunFileCursor {
    type Item = Result<Command>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining_entries == 0 {
            return None;
        }
        self.remaining_entries -= 1;
        match self.read_next() {
            Ok(command) => Some(Ok(command)),
            Err(e) => {
                self.remaining_entries = 0;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::FileSeparationStrategy;
    use crate::sstable::{file_name, RunFileWriter};
    use tempfile::TempDir;

    fn write_sample(dir: &Path) -> Vec<Command> {
        let commands = vec![
            Command::put(&b"a"[..], 1, &b"a1"[..]),
            Command::put(&b"a"[..], 5, &b"a5"[..]),
            Command::del(&b"b"[..], 3),
            Command::put(&b"c"[..], 2, &b"c2"[..]),
        ];
        let mut writer =
            RunFileWriter::new(dir, 0, FileSeparationStrategy::SingleFile, 0, 5);
        for command in &commands {
            writer.add(command).unwrap();
        }
        writer.finish().unwrap();
        commands
    }

    #[test]
    fn test_cursor_roundtrip() {
        let dir = TempDir::new().unwrap();
        let commands = write_sample(dir.path());

        let reader = RunFileReader::open(&dir.path().join(file_name(0))).unwrap();
        assert_eq!(reader.meta().entry_count, 4);
        let read: Vec<_> = reader
            .cursor()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(read, commands);
    }

    #[test]
    fn test_get_respects_read_tsn() {
        let dir = TempDir::new().unwrap();
        write_sample(dir.path());
        let reader = RunFileReader::open(&dir.path().join(file_name(0))).unwrap();

        assert_eq!(
            reader.get(b"a", 10).unwrap(),
            Some(Command::put(&b"a"[..], 5, &b"a5"[..]))
        );
        assert_eq!(
            reader.get(b"a", 3).unwrap(),
            Some(Command::put(&b"a"[..], 1, &b"a1"[..]))
        );
        // visible tombstone is reported, not hidden
        assert_eq!(reader.get(b"b", 4).unwrap(), Some(Command::del(&b"b"[..], 3)));
        // not in the file at all
        assert_eq!(reader.get(b"x", 10).unwrap(), None);
        // nothing visible that early
        assert_eq!(reader.get(b"b", 2).unwrap(), None);
    }

    #[test]
    fn test_corrupted_metadata_detected() {
        let dir = TempDir::new().unwrap();
        write_sample(dir.path());
        let path = dir.path().join(file_name(0));
        let mut content = std::fs::read(&path).unwrap();
        let len = content.len();
        // flip a bit inside the metadata section
        content[len - 20] ^= 0xFF;
        std::fs::write(&path, content).unwrap();

        let result = RunFileReader::open(&path);
        assert!(matches!(
            result,
            Err(StrataError::ChecksumMismatch { .. })
                | Err(StrataError::InvalidFormat(_))
        ));
    }
}
