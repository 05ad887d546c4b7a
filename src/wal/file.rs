//! WAL segment files, their sidecar checksums, and the summary file

use crate::{Result, StrataError};
use bytes::Bytes;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const WAL_FILE_PREFIX: &str = "wal_";
pub const WAL_FILE_SUFFIX: &str = ".log";
pub const CHECKSUM_SUFFIX: &str = ".crc32";
pub const SUMMARY_FILE_NAME: &str = "wal_summary";

/// Fsync a directory so renames and deletions inside it are durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Atomically replace `path` with `content` via a temp file rename.
pub(crate) fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| StrataError::Internal(format!("{} has no parent", path.display())))?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    fsync_dir(dir)?;
    Ok(())
}

/// A single WAL segment file on disk, named `wal_<seq>.log`.
///
/// Sealed segments (everything but the highest sequence number) are
/// immutable and may carry a sidecar `.crc32` file holding the CRC32 of
/// the full segment content.
#[derive(Debug, Clone)]
pub struct WalFile {
    path: PathBuf,
    sequence_number: u64,
}

impl WalFile {
    pub fn file_name(sequence_number: u64) -> String {
        format!("{}{:020}{}", WAL_FILE_PREFIX, sequence_number, WAL_FILE_SUFFIX)
    }

    /// Parse a WAL segment file name; returns `None` for unrelated files.
    pub fn parse_sequence_number(file_name: &str) -> Option<u64> {
        let stem = file_name
            .strip_prefix(WAL_FILE_PREFIX)?
            .strip_suffix(WAL_FILE_SUFFIX)?;
        stem.parse().ok()
    }

    pub fn new(dir: &Path, sequence_number: u64) -> Self {
        Self {
            path: dir.join(Self::file_name(sequence_number)),
            sequence_number,
        }
    }

    pub fn create(dir: &Path, sequence_number: u64) -> Result<Self> {
        let wal_file = Self::new(dir, sequence_number);
        OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&wal_file.path)?;
        fsync_dir(dir)?;
        Ok(wal_file)
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Fsync the file. Required before basing recovery decisions on its
    /// content: after a crash the page cache and the disk may disagree.
    pub fn sync(&self) -> Result<()> {
        OpenOptions::new()
            .read(true)
            .open(&self.path)?
            .sync_all()?;
        Ok(())
    }

    /// Read the full segment content into memory.
    pub fn read_all(&self) -> Result<Bytes> {
        let mut file = File::open(&self.path)?;
        let mut content = Vec::with_capacity(self.size()? as usize);
        file.read_to_end(&mut content)?;
        Ok(Bytes::from(content))
    }

    /// Open the segment for appending.
    pub fn open_for_append(&self) -> Result<File> {
        Ok(OpenOptions::new().append(true).open(&self.path)?)
    }

    /// Truncate the segment to `len` bytes and fsync.
    pub fn truncate_to(&self, len: u64) -> Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(len)?;
        file.sync_all()?;
        Ok(())
    }

    /// Delete the segment and its sidecar checksum, if any.
    pub fn delete(&self) -> Result<()> {
        fs::remove_file(&self.path)?;
        let checksum = self.checksum_path();
        if checksum.exists() {
            fs::remove_file(&checksum)?;
        }
        Ok(())
    }

    fn checksum_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(CHECKSUM_SUFFIX);
        self.path.with_file_name(name)
    }

    pub fn has_checksum_file(&self) -> bool {
        self.checksum_path().exists()
    }

    /// Remove the sidecar checksum, making the segment appendable again.
    pub fn delete_checksum_file(&self) -> Result<()> {
        match fs::remove_file(self.checksum_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Compute and persist the sidecar checksum if it does not exist yet.
    /// Only called for sealed segments; the active segment still grows.
    pub fn create_checksum_file_if_missing(&self) -> Result<()> {
        let checksum_path = self.checksum_path();
        if checksum_path.exists() {
            return Ok(());
        }
        let content = self.read_all()?;
        let checksum = crc32fast::hash(&content);
        atomic_write(&checksum_path, &checksum.to_le_bytes())?;
        debug!(
            file = %self.path.display(),
            checksum,
            "created WAL sidecar checksum"
        );
        Ok(())
    }

    /// Validate the segment against its sidecar checksum, if one exists.
    pub fn validate_checksum(&self) -> Result<()> {
        let checksum_path = self.checksum_path();
        if !checksum_path.exists() {
            return Ok(());
        }
        let stored = fs::read(&checksum_path)?;
        if stored.len() != 4 {
            return Err(StrataError::Corruption(format!(
                "WAL checksum file {} has invalid length {}",
                checksum_path.display(),
                stored.len()
            )));
        }
        let expected = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
        let actual = crc32fast::hash(&self.read_all()?);
        if expected != actual {
            return Err(StrataError::ChecksumMismatch { expected, actual });
        }
        Ok(())
    }
}

/// The WAL summary file: a single little-endian u64 holding the highest
/// WAL sequence number that has been dropped by shortening.
///
/// Persisted before the dropped files are deleted, so a crash between the
/// two steps leaves only deletable leftovers behind.
#[derive(Debug)]
pub struct WalSummaryFile {
    path: PathBuf,
}

impl WalSummaryFile {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(SUMMARY_FILE_NAME),
        }
    }

    /// The highest dropped sequence number, or `None` if nothing was
    /// ever dropped.
    pub fn read(&self) -> Result<Option<u64>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read(&self.path)?;
        if content.len() != 8 {
            return Err(StrataError::Corruption(format!(
                "WAL summary file has invalid length {}",
                content.len()
            )));
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&content);
        Ok(Some(u64::from_le_bytes(bytes)))
    }

    pub fn write(&self, highest_dropped: u64) -> Result<()> {
        atomic_write(&self.path, &highest_dropped.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_name_roundtrip() {
        let name = WalFile::file_name(42);
        assert_eq!(WalFile::parse_sequence_number(&name), Some(42));
        assert_eq!(WalFile::parse_sequence_number("manifest"), None);
        assert_eq!(WalFile::parse_sequence_number("wal_abc.log"), None);
    }

    #[test]
    fn test_checksum_sidecar() {
        let dir = TempDir::new().unwrap();
        let file = WalFile::create(dir.path(), 1).unwrap();
        fs::write(file.path(), b"some wal content").unwrap();

        assert!(!file.has_checksum_file());
        file.create_checksum_file_if_missing().unwrap();
        assert!(file.has_checksum_file());
        file.validate_checksum().unwrap();

        // corrupt the segment, the sidecar must catch it
        fs::write(file.path(), b"some wal CONTENT").unwrap();
        assert!(matches!(
            file.validate_checksum(),
            Err(StrataError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_delete_removes_sidecar() {
        let dir = TempDir::new().unwrap();
        let file = WalFile::create(dir.path(), 3).unwrap();
        file.create_checksum_file_if_missing().unwrap();
        file.delete().unwrap();
        assert!(!file.path().exists());
        assert!(!file.has_checksum_file());
    }

    #[test]
    fn test_summary_file() {
        let dir = TempDir::new().unwrap();
        let summary = WalSummaryFile::new(dir.path());
        assert_eq!(summary.read().unwrap(), None);

        summary.write(17).unwrap();
        assert_eq!(summary.read().unwrap(), Some(17));

        summary.write(23).unwrap();
        assert_eq!(summary.read().unwrap(), Some(23));
    }
}
