//! State machine snapshots.
//!
//! A snapshot captures the state machine at a committed index, letting a
//! follower too far behind for incremental catch-up be brought current in
//! one transfer, and letting the journal discard entries the snapshot
//! covers.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quill_core::limits::SNAPSHOT_BYTES_MAX;
use quill_core::{LogIndex, TermId};

/// Header size: magic (4) + version (4) + index (8) + term (8) +
/// data length (8) + checksum (4).
const SNAPSHOT_HEADER_SIZE: usize = 36;

const SNAPSHOT_MAGIC: u32 = 0x514C_5350; // "QLSP"

const SNAPSHOT_VERSION: u32 = 1;

/// A point-in-time serialization of the state machine.
///
/// Represents all committed state up to and including
/// `last_included_index` at `last_included_term`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Last log index included in this snapshot.
    pub last_included_index: LogIndex,
    /// Term of the last included entry.
    pub last_included_term: TermId,
    /// Serialized state machine state.
    pub data: Bytes,
    /// CRC32 of the data.
    pub checksum: u32,
}

impl Snapshot {
    /// Creates a snapshot, computing the data checksum.
    ///
    /// # Panics
    /// Panics if the data exceeds the snapshot size limit.
    #[must_use]
    pub fn new(last_included_index: LogIndex, last_included_term: TermId, data: Bytes) -> Self {
        assert!(
            data.len() as u64 <= SNAPSHOT_BYTES_MAX,
            "snapshot data exceeds maximum size: {} > {SNAPSHOT_BYTES_MAX}",
            data.len()
        );

        let checksum = crc32fast::hash(&data);
        Self {
            last_included_index,
            last_included_term,
            data,
            checksum,
        }
    }

    /// Creates an empty snapshot for a fresh node.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            last_included_index: LogIndex::new(0),
            last_included_term: TermId::new(0),
            data: Bytes::new(),
            checksum: 0,
        }
    }

    /// Returns true if this snapshot covers nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.last_included_index.get() == 0 && self.data.is_empty()
    }

    /// Verifies the stored checksum against the data.
    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        self.is_empty() || crc32fast::hash(&self.data) == self.checksum
    }

    /// Encodes the snapshot for storage or the wire.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SNAPSHOT_HEADER_SIZE + self.data.len());
        buf.put_u32_le(SNAPSHOT_MAGIC);
        buf.put_u32_le(SNAPSHOT_VERSION);
        buf.put_u64_le(self.last_included_index.get());
        buf.put_u64_le(self.last_included_term.get());
        buf.put_u64_le(self.data.len() as u64);
        buf.put_u32_le(self.checksum);
        buf.extend_from_slice(&self.data);
        buf.freeze()
    }

    /// Decodes a snapshot, verifying magic, version, length and checksum.
    ///
    /// Returns `None` if the bytes are invalid or corrupted.
    #[must_use]
    pub fn decode(mut data: Bytes) -> Option<Self> {
        if data.len() < SNAPSHOT_HEADER_SIZE {
            return None;
        }

        if data.get_u32_le() != SNAPSHOT_MAGIC {
            return None;
        }
        if data.get_u32_le() != SNAPSHOT_VERSION {
            return None;
        }

        let last_included_index = LogIndex::new(data.get_u64_le());
        let last_included_term = TermId::new(data.get_u64_le());
        let data_len = data.get_u64_le();
        let checksum = data.get_u32_le();

        if data.remaining() as u64 != data_len || data_len > SNAPSHOT_BYTES_MAX {
            return None;
        }
        if !data.is_empty() && crc32fast::hash(&data) != checksum {
            return None;
        }

        Some(Self {
            last_included_index,
            last_included_term,
            data,
            checksum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_roundtrip() {
        let snapshot = Snapshot::new(
            LogIndex::new(42),
            TermId::new(7),
            Bytes::from("state machine image"),
        );

        let decoded = Snapshot::decode(snapshot.encode()).unwrap();
        assert_eq!(decoded, snapshot);
        assert!(decoded.verify_checksum());
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = Snapshot::empty();
        assert!(snapshot.is_empty());
        assert!(snapshot.verify_checksum());
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0xDEAD_BEEF);
        buf.put_u32_le(SNAPSHOT_VERSION);
        buf.put_u64_le(0);
        buf.put_u64_le(0);
        buf.put_u64_le(0);
        buf.put_u32_le(0);
        assert!(Snapshot::decode(buf.freeze()).is_none());
    }

    #[test]
    fn test_decode_rejects_corrupted_data() {
        let snapshot = Snapshot::new(LogIndex::new(1), TermId::new(1), Bytes::from("payload"));
        let mut encoded = BytesMut::from(&snapshot.encode()[..]);
        let tail = encoded.len() - 1;
        encoded[tail] ^= 0xFF;

        assert!(Snapshot::decode(encoded.freeze()).is_none());
    }
}
