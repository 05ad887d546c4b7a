//! Core types for Strata

use crate::{Result, StrataError};
use bytes::{Buf, BufMut, Bytes};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Transaction serial number. Strictly monotonic, starts at 1; 0 means
/// "no transaction" (e.g. an empty store).
pub type Tsn = u64;

/// Identifier of an immutable run file within a store directory.
pub type FileIndex = u64;

/// Level (leveled stores) or tier (tiered stores) of a run file.
pub type LevelOrTier = u32;

/// Identifier of a store: a slash-separated path of non-empty segments.
///
/// Segments contain only lowercase ASCII letters and digits. The path
/// doubles as the store's directory path below the engine root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreId(Arc<str>);

impl StoreId {
    /// Parse and validate a store id.
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(StrataError::InvalidFormat(
                "Store id must not be empty".into(),
            ));
        }
        for segment in path.split('/') {
            if segment.is_empty() {
                return Err(StrataError::InvalidFormat(format!(
                    "Store id '{}' contains an empty path segment",
                    path
                )));
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            {
                return Err(StrataError::InvalidFormat(format!(
                    "Store id segment '{}' contains invalid characters",
                    segment
                )));
            }
        }
        Ok(StoreId(Arc::from(path)))
    }

    /// The slash-separated path of this store.
    pub fn path(&self) -> &str {
        &self.0
    }

    /// Path segments, in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for StoreId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for StoreId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        StoreId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A key paired with the transaction serial number that wrote it.
///
/// Orders by key first, then ascending TSN, so all versions of a key are
/// adjacent with the oldest version first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyAndTsn {
    pub key: Bytes,
    pub tsn: Tsn,
}

impl KeyAndTsn {
    pub fn new(key: impl Into<Bytes>, tsn: Tsn) -> Self {
        Self {
            key: key.into(),
            tsn,
        }
    }
}

const OPCODE_PUT: u8 = 0x01;
const OPCODE_DEL: u8 = 0x02;

/// A single versioned write: either a value assignment or a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Put {
        key: Bytes,
        tsn: Tsn,
        value: Bytes,
    },
    Del {
        key: Bytes,
        tsn: Tsn,
    },
}

impl Command {
    pub fn put(key: impl Into<Bytes>, tsn: Tsn, value: impl Into<Bytes>) -> Self {
        Command::Put {
            key: key.into(),
            tsn,
            value: value.into(),
        }
    }

    pub fn del(key: impl Into<Bytes>, tsn: Tsn) -> Self {
        Command::Del {
            key: key.into(),
            tsn,
        }
    }

    pub fn key(&self) -> &Bytes {
        match self {
            Command::Put { key, .. } | Command::Del { key, .. } => key,
        }
    }

    pub fn tsn(&self) -> Tsn {
        match self {
            Command::Put { tsn, .. } | Command::Del { tsn, .. } => *tsn,
        }
    }

    pub fn key_and_tsn(&self) -> KeyAndTsn {
        KeyAndTsn::new(self.key().clone(), self.tsn())
    }

    /// The written value, or `None` for a tombstone.
    pub fn value(&self) -> Option<&Bytes> {
        match self {
            Command::Put { value, .. } => Some(value),
            Command::Del { .. } => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Command::Del { .. })
    }

    /// Serialized size in bytes.
    ///
    /// Format:
    /// - 1 byte: opcode
    /// - 4 bytes: key length
    /// - N bytes: key
    /// - 8 bytes: TSN
    /// - 4 bytes: value length (PUT only)
    /// - N bytes: value (PUT only)
    pub fn byte_size(&self) -> usize {
        match self {
            Command::Put { key, value, .. } => 1 + 4 + key.len() + 8 + 4 + value.len(),
            Command::Del { key, .. } => 1 + 4 + key.len() + 8,
        }
    }

    /// Write the binary representation.
    pub fn write_to(&self, buf: &mut impl BufMut) {
        match self {
            Command::Put { key, tsn, value } => {
                buf.put_u8(OPCODE_PUT);
                buf.put_u32_le(key.len() as u32);
                buf.put_slice(key);
                buf.put_u64_le(*tsn);
                buf.put_u32_le(value.len() as u32);
                buf.put_slice(value);
            }
            Command::Del { key, tsn } => {
                buf.put_u8(OPCODE_DEL);
                buf.put_u32_le(key.len() as u32);
                buf.put_slice(key);
                buf.put_u64_le(*tsn);
            }
        }
    }

    /// Read a command back from the buffer, advancing it.
    pub fn read_from(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(StrataError::TruncatedInput("Missing command opcode".into()));
        }
        let opcode = buf.get_u8();
        let key = read_length_prefixed(buf, "command key")?;
        if buf.remaining() < 8 {
            return Err(StrataError::TruncatedInput("Missing command TSN".into()));
        }
        let tsn = buf.get_u64_le();
        match opcode {
            OPCODE_PUT => {
                let value = read_length_prefixed(buf, "command value")?;
                Ok(Command::Put { key, tsn, value })
            }
            OPCODE_DEL => Ok(Command::Del { key, tsn }),
            other => Err(StrataError::InvalidFormat(format!(
                "Invalid command opcode: {:#04x}",
                other
            ))),
        }
    }
}

impl PartialOrd for Command {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Command {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key()
            .cmp(other.key())
            .then_with(|| self.tsn().cmp(&other.tsn()))
    }
}

pub(crate) fn read_length_prefixed(buf: &mut impl Buf, what: &str) -> Result<Bytes> {
    if buf.remaining() < 4 {
        return Err(StrataError::TruncatedInput(format!(
            "Missing length prefix for {}",
            what
        )));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(StrataError::TruncatedInput(format!(
            "Incomplete {}: need {} bytes, have {}",
            what,
            len,
            buf.remaining()
        )));
    }
    Ok(buf.copy_to_bytes(len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_store_id_validation() {
        assert!(StoreId::parse("users").is_ok());
        assert!(StoreId::parse("app/users/byname2").is_ok());
        assert!(StoreId::parse("").is_err());
        assert!(StoreId::parse("a//b").is_err());
        assert!(StoreId::parse("a/b c").is_err());
        assert!(StoreId::parse("/a").is_err());
        // segments are lowercase alphanumeric only
        assert!(StoreId::parse("Users").is_err());
        assert!(StoreId::parse("by-name").is_err());
        assert!(StoreId::parse("by_name").is_err());
    }

    #[test]
    fn test_key_and_tsn_ordering() {
        let a = KeyAndTsn::new(&b"apple"[..], 5);
        let b = KeyAndTsn::new(&b"apple"[..], 9);
        let c = KeyAndTsn::new(&b"banana"[..], 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_command_roundtrip() {
        let put = Command::put(&b"key-1"[..], 42, &b"value-1"[..]);
        let del = Command::del(&b"key-2"[..], 43);

        for cmd in [put, del] {
            let mut buf = BytesMut::new();
            cmd.write_to(&mut buf);
            assert_eq!(buf.len(), cmd.byte_size());

            let mut bytes = buf.freeze();
            let decoded = Command::read_from(&mut bytes).unwrap();
            assert_eq!(decoded, cmd);
            assert_eq!(bytes.remaining(), 0);
        }
    }

    #[test]
    fn test_command_truncated() {
        let cmd = Command::put(&b"key"[..], 7, &b"value"[..]);
        let mut buf = BytesMut::new();
        cmd.write_to(&mut buf);
        let cut = &buf[..buf.len() - 2];

        let result = Command::read_from(&mut std::io::Cursor::new(cut));
        assert!(matches!(result, Err(StrataError::TruncatedInput(_))));
    }
}
