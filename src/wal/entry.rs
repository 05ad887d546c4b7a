//! WAL entry types and serialization

use crate::types::read_length_prefixed;
use crate::{Command, Result, StoreId, StrataError, Tsn};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const TYPE_TRANSACTION_START: u8 = 0x10;
const TYPE_TRANSACTION_COMMAND: u8 = 0x20;
const TYPE_TRANSACTION_COMMIT: u8 = 0x30;

/// A single WAL entry.
///
/// Wire format:
/// - 1 byte: entry type (0x10 start, 0x20 command, 0x30 commit)
/// - 4 bytes: CRC32 of the payload
/// - N bytes: payload (little-endian fields)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalEntry {
    /// A transaction began. Payload: TSN.
    TransactionStart { tsn: Tsn },
    /// A single command within a transaction. Payload: store id, command.
    TransactionCommand { store_id: StoreId, command: Command },
    /// A transaction committed. Payload: TSN. Durability boundary:
    /// commands of a transaction only count once its commit is on disk.
    TransactionCommit { tsn: Tsn },
}

impl WalEntry {
    pub fn type_byte(&self) -> u8 {
        match self {
            WalEntry::TransactionStart { .. } => TYPE_TRANSACTION_START,
            WalEntry::TransactionCommand { .. } => TYPE_TRANSACTION_COMMAND,
            WalEntry::TransactionCommit { .. } => TYPE_TRANSACTION_COMMIT,
        }
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, WalEntry::TransactionCommit { .. })
    }

    fn payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            WalEntry::TransactionStart { tsn } | WalEntry::TransactionCommit { tsn } => {
                buf.put_u64_le(*tsn);
            }
            WalEntry::TransactionCommand { store_id, command } => {
                let path = store_id.path().as_bytes();
                buf.put_u32_le(path.len() as u32);
                buf.put_slice(path);
                command.write_to(&mut buf);
            }
        }
        buf.freeze()
    }

    /// Serialize the entry including its checksum.
    pub fn serialize(&self) -> Bytes {
        let payload = self.payload();
        let mut buf = BytesMut::with_capacity(5 + payload.len());
        buf.put_u8(self.type_byte());
        buf.put_u32_le(crc32fast::hash(&payload));
        buf.put_slice(&payload);
        buf.freeze()
    }

    pub fn serialized_size(&self) -> usize {
        let payload_len = match self {
            WalEntry::TransactionStart { .. } | WalEntry::TransactionCommit { .. } => 8,
            WalEntry::TransactionCommand { store_id, command } => {
                4 + store_id.path().len() + command.byte_size()
            }
        };
        1 + 4 + payload_len
    }

    /// Read one entry from the front of `buf`, advancing it past the entry.
    ///
    /// Returns `TruncatedInput` when the buffer ends inside the entry; the
    /// caller decides whether that is tolerable (active file tail) or fatal.
    /// `buf.is_empty()` before the call means a clean end of input.
    pub fn read_from(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(StrataError::TruncatedInput("Missing WAL entry type".into()));
        }
        let entry_type = buf.get_u8();
        if buf.remaining() < 4 {
            return Err(StrataError::TruncatedInput(
                "Missing WAL entry checksum".into(),
            ));
        }
        let expected = buf.get_u32_le();

        let payload_start = buf.clone();
        let entry = match entry_type {
            TYPE_TRANSACTION_START => {
                if buf.remaining() < 8 {
                    return Err(StrataError::TruncatedInput(
                        "Incomplete transaction start payload".into(),
                    ));
                }
                WalEntry::TransactionStart {
                    tsn: buf.get_u64_le(),
                }
            }
            TYPE_TRANSACTION_COMMIT => {
                if buf.remaining() < 8 {
                    return Err(StrataError::TruncatedInput(
                        "Incomplete transaction commit payload".into(),
                    ));
                }
                WalEntry::TransactionCommit {
                    tsn: buf.get_u64_le(),
                }
            }
            TYPE_TRANSACTION_COMMAND => {
                let path = read_length_prefixed(buf, "WAL store id")?;
                let path = std::str::from_utf8(&path)
                    .map_err(|e| StrataError::InvalidFormat(e.to_string()))?;
                let store_id = StoreId::parse(path)?;
                let command = Command::read_from(buf)?;
                WalEntry::TransactionCommand { store_id, command }
            }
            other => {
                return Err(StrataError::InvalidFormat(format!(
                    "Invalid WAL entry type: {:#04x}",
                    other
                )))
            }
        };

        let payload_len = payload_start.len() - buf.len();
        let actual = crc32fast::hash(&payload_start[..payload_len]);
        if actual != expected {
            return Err(StrataError::ChecksumMismatch { expected, actual });
        }
        Ok(entry)
    }
}

/// Iterator over the entries of a fully buffered WAL file.
///
/// Yields entries until the buffer is exhausted or an error occurs. After
/// an error the iterator is fused.
pub struct WalEntryStream {
    buf: Bytes,
    /// Byte offset of the end of the last successfully read entry.
    consumed: u64,
    failed: bool,
}

impl WalEntryStream {
    pub fn new(buf: Bytes) -> Self {
        Self {
            buf,
            consumed: 0,
            failed: false,
        }
    }

    /// Byte offset just past the last entry successfully yielded.
    pub fn consumed_bytes(&self) -> u64 {
        self.consumed
    }
}

impl Iterator for WalEntryStream {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }
        let before = self.buf.len();
        match WalEntry::read_from(&mut self.buf) {
            Ok(entry) => {
                self.consumed += (before - self.buf.len()) as u64;
                Some(Ok(entry))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<WalEntry> {
        let store = StoreId::parse("test/store").unwrap();
        vec![
            WalEntry::TransactionStart { tsn: 7 },
            WalEntry::TransactionCommand {
                store_id: store.clone(),
                command: Command::put(&b"alpha"[..], 7, &b"one"[..]),
            },
            WalEntry::TransactionCommand {
                store_id: store,
                command: Command::del(&b"beta"[..], 7),
            },
            WalEntry::TransactionCommit { tsn: 7 },
        ]
    }

    #[test]
    fn test_entry_roundtrip() {
        for entry in sample_entries() {
            let serialized = entry.serialize();
            assert_eq!(serialized.len(), entry.serialized_size());

            let mut buf = serialized;
            let decoded = WalEntry::read_from(&mut buf).unwrap();
            assert_eq!(decoded, entry);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_checksum_validation() {
        let mut data = WalEntry::TransactionStart { tsn: 99 }.serialize().to_vec();
        data[7] ^= 0xFF;

        let result = WalEntry::read_from(&mut Bytes::from(data));
        assert!(matches!(
            result,
            Err(StrataError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_stream_reads_all_entries() {
        let entries = sample_entries();
        let mut buf = BytesMut::new();
        for entry in &entries {
            buf.put_slice(&entry.serialize());
        }
        let total = buf.len() as u64;

        let mut stream = WalEntryStream::new(buf.freeze());
        let decoded: Vec<_> = stream.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(decoded, entries);
        assert_eq!(stream.consumed_bytes(), total);
    }

    #[test]
    fn test_stream_truncated_tail() {
        let entries = sample_entries();
        let mut buf = BytesMut::new();
        for entry in &entries {
            buf.put_slice(&entry.serialize());
        }
        let full = buf.len();
        buf.truncate(full - 3);

        let mut stream = WalEntryStream::new(buf.freeze());
        let mut ok = 0;
        let mut saw_truncation = false;
        for item in stream.by_ref() {
            match item {
                Ok(_) => ok += 1,
                Err(e) => {
                    assert!(e.is_truncation());
                    saw_truncation = true;
                }
            }
        }
        assert_eq!(ok, entries.len() - 1);
        assert!(saw_truncation);
        // consumed stops at the last complete entry boundary
        let boundary: usize = entries[..entries.len() - 1]
            .iter()
            .map(|e| e.serialized_size())
            .sum();
        assert_eq!(stream.consumed_bytes(), boundary as u64);
    }
}
