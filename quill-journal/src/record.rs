//! Journal record framing.
//!
//! Each record in a segment file has the following binary format:
//!
//! ```text
//! +----------+----------+----------+
//! |  Length  | Payload  |  CRC32   |
//! | (4 bytes)| (N bytes)| (4 bytes)|
//! +----------+----------+----------+
//! ```
//!
//! - Length: payload length in bytes
//! - Payload: opaque application data
//! - CRC32: checksum of Length + Payload
//!
//! The checksum trails the payload deliberately: a crash mid-write leaves
//! an incomplete or mismatched trailer, which recovery detects and
//! truncates. All integers are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use quill_core::limits::RECORD_PAYLOAD_BYTES_MAX;

use crate::error::{JournalError, JournalResult};

/// Bytes of framing around each payload (length prefix + CRC trailer).
pub const RECORD_OVERHEAD: u64 = 8;

/// A framed journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The opaque payload.
    pub payload: Bytes,
}

impl Record {
    /// Creates a new record.
    ///
    /// # Errors
    /// Returns `RecordTooLarge` if the payload exceeds the limit.
    pub fn new(payload: Bytes) -> JournalResult<Self> {
        if payload.len() > RECORD_PAYLOAD_BYTES_MAX as usize {
            return Err(JournalError::RecordTooLarge {
                size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
                max: RECORD_PAYLOAD_BYTES_MAX,
            });
        }
        Ok(Self { payload })
    }

    /// Returns the total on-disk size of this record.
    #[must_use]
    pub fn frame_size(&self) -> u64 {
        RECORD_OVERHEAD + self.payload.len() as u64
    }

    /// Encodes the record to bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        // Safe cast: payload length validated in `new`.
        #[allow(clippy::cast_possible_truncation)]
        let length = self.payload.len() as u32;
        buf.put_u32_le(length);
        buf.put_slice(&self.payload);
        buf.put_u32_le(checksum(length, &self.payload));
    }

    /// Decodes one record from the front of `buf`.
    ///
    /// Returns the record and the number of bytes consumed, or `None` if
    /// the buffer ends before a complete record (a torn tail, not an
    /// error; the caller decides whether that is acceptable).
    ///
    /// # Errors
    /// Returns `ChecksumMismatch` if the trailer does not match the data,
    /// or `Corruption` if the length field is implausible.
    pub fn decode(mut buf: &[u8], position: u64) -> JournalResult<Option<(Self, u64)>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let length = buf.get_u32_le();
        if length > RECORD_PAYLOAD_BYTES_MAX {
            return Err(JournalError::Corruption {
                position,
                reason: "record length exceeds maximum",
            });
        }

        let length_usize = length as usize;
        if buf.len() < length_usize + 4 {
            return Ok(None);
        }

        let payload = Bytes::copy_from_slice(&buf[..length_usize]);
        buf.advance(length_usize);
        let stored_crc = buf.get_u32_le();

        let expected = checksum(length, &payload);
        if expected != stored_crc {
            return Err(JournalError::ChecksumMismatch {
                position,
                expected,
                actual: stored_crc,
            });
        }

        Ok(Some((Self { payload }, RECORD_OVERHEAD + u64::from(length))))
    }
}

/// Computes the CRC32 of a record's length and payload.
fn checksum(length: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&length.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}
