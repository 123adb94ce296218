//! Wire codecs for store queries, replies, and control payloads.
//!
//! All integers are little-endian. Queries travel outside the replicated
//! log (read path); command replies are what [`crate::JournalStore`]
//! returns from `execute`, so clients decode them to learn a write's
//! outcome. Domain failures ride inside replies as an `Error` variant,
//! never as transport errors.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quill_core::PartitionId;

use crate::error::{StoreError, StoreResult};

const QUERY_GET: u8 = 0;
const QUERY_PARTITIONS: u8 = 1;

const REPLY_APPENDED: u8 = 0;
const REPLY_SCALED: u8 = 1;
const REPLY_RECORDS: u8 = 2;
const REPLY_PARTITIONS: u8 = 3;
const REPLY_ERROR: u8 = 4;

/// A read-only query against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreQuery {
    /// Records of `partition` overlapping offsets `[offset, offset + length)`.
    Get {
        /// Partition to read.
        partition: PartitionId,
        /// First record offset of interest.
        offset: u64,
        /// Number of offsets to cover.
        length: u32,
    },
    /// The current partition set.
    Partitions,
}

impl StoreQuery {
    /// Encodes the query.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(17);
        match *self {
            Self::Get {
                partition,
                offset,
                length,
            } => {
                buf.put_u8(QUERY_GET);
                buf.put_u32_le(partition.get());
                buf.put_u64_le(offset);
                buf.put_u32_le(length);
            }
            Self::Partitions => buf.put_u8(QUERY_PARTITIONS),
        }
        buf.freeze()
    }

    /// Decodes a query frame.
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidFrame`] on a short or unknown frame.
    pub fn decode(mut buf: impl Buf) -> StoreResult<Self> {
        if buf.remaining() < 1 {
            return Err(StoreError::invalid("empty query"));
        }
        match buf.get_u8() {
            QUERY_GET => {
                if buf.remaining() < 16 {
                    return Err(StoreError::invalid("short get query"));
                }
                Ok(Self::Get {
                    partition: PartitionId::new(buf.get_u32_le()),
                    offset: buf.get_u64_le(),
                    length: buf.get_u32_le(),
                })
            }
            QUERY_PARTITIONS => Ok(Self::Partitions),
            _ => Err(StoreError::invalid("unknown query tag")),
        }
    }
}

/// A record slice returned by a `Get` query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Cumulative offset of this record's batch within its partition.
    pub start_offset: u64,
    /// Record payload.
    pub payload: Bytes,
}

/// Outcome of an `execute` or `query` call, as returned to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreReply {
    /// A batch was appended at this cumulative offset.
    Appended {
        /// Offset of the first record of the batch.
        position: u64,
    },
    /// The partition set was replaced.
    Scaled,
    /// Records matching a `Get` query, in offset order.
    Records(Vec<StoredRecord>),
    /// The current partition set, ascending.
    Partitions(Vec<PartitionId>),
    /// A domain failure; the command still consumed its log index.
    Error(String),
}

impl StoreReply {
    /// Encodes the reply.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Appended { position } => {
                buf.put_u8(REPLY_APPENDED);
                buf.put_u64_le(*position);
            }
            Self::Scaled => buf.put_u8(REPLY_SCALED),
            Self::Records(records) => {
                buf.put_u8(REPLY_RECORDS);
                // Safe cast: record counts are bounded by query length.
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u32_le(records.len() as u32);
                for record in records {
                    buf.put_u64_le(record.start_offset);
                    // Safe cast: payloads are bounded by the record limit.
                    #[allow(clippy::cast_possible_truncation)]
                    buf.put_u32_le(record.payload.len() as u32);
                    buf.put_slice(&record.payload);
                }
            }
            Self::Partitions(partitions) => {
                buf.put_u8(REPLY_PARTITIONS);
                // Safe cast: partition sets are small.
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u32_le(partitions.len() as u32);
                for partition in partitions {
                    buf.put_u32_le(partition.get());
                }
            }
            Self::Error(message) => {
                buf.put_u8(REPLY_ERROR);
                // Safe cast: error messages are short.
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u32_le(message.len() as u32);
                buf.put_slice(message.as_bytes());
            }
        }
        buf.freeze()
    }

    /// Decodes a reply frame.
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidFrame`] on a short or unknown frame.
    pub fn decode(mut buf: impl Buf) -> StoreResult<Self> {
        if buf.remaining() < 1 {
            return Err(StoreError::invalid("empty reply"));
        }
        match buf.get_u8() {
            REPLY_APPENDED => {
                if buf.remaining() < 8 {
                    return Err(StoreError::invalid("short appended reply"));
                }
                Ok(Self::Appended {
                    position: buf.get_u64_le(),
                })
            }
            REPLY_SCALED => Ok(Self::Scaled),
            REPLY_RECORDS => {
                if buf.remaining() < 4 {
                    return Err(StoreError::invalid("short records reply"));
                }
                let count = buf.get_u32_le();
                let mut records = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    if buf.remaining() < 12 {
                        return Err(StoreError::invalid("short record header"));
                    }
                    let start_offset = buf.get_u64_le();
                    let len = buf.get_u32_le() as usize;
                    if buf.remaining() < len {
                        return Err(StoreError::invalid("short record payload"));
                    }
                    records.push(StoredRecord {
                        start_offset,
                        payload: buf.copy_to_bytes(len),
                    });
                }
                Ok(Self::Records(records))
            }
            REPLY_PARTITIONS => {
                if buf.remaining() < 4 {
                    return Err(StoreError::invalid("short partitions reply"));
                }
                let count = buf.get_u32_le();
                let mut partitions = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    if buf.remaining() < 4 {
                        return Err(StoreError::invalid("short partition id"));
                    }
                    partitions.push(PartitionId::new(buf.get_u32_le()));
                }
                Ok(Self::Partitions(partitions))
            }
            REPLY_ERROR => {
                if buf.remaining() < 4 {
                    return Err(StoreError::invalid("short error reply"));
                }
                let len = buf.get_u32_le() as usize;
                if buf.remaining() < len {
                    return Err(StoreError::invalid("short error message"));
                }
                let raw = buf.copy_to_bytes(len);
                let message = String::from_utf8(raw.to_vec())
                    .map_err(|_| StoreError::invalid("error message is not utf-8"))?;
                Ok(Self::Error(message))
            }
            _ => Err(StoreError::invalid("unknown reply tag")),
        }
    }
}

/// Encodes a partition set for a scale control entry.
#[must_use]
pub fn encode_partition_set(partitions: &[PartitionId]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + partitions.len() * 4);
    // Safe cast: partition sets are small.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(partitions.len() as u32);
    for partition in partitions {
        buf.put_u32_le(partition.get());
    }
    buf.freeze()
}

/// Decodes a partition set from a scale control entry.
///
/// # Errors
/// Returns [`StoreError::InvalidFrame`] on a malformed payload.
pub fn decode_partition_set(mut buf: impl Buf) -> StoreResult<Vec<PartitionId>> {
    if buf.remaining() < 4 {
        return Err(StoreError::invalid("short partition set"));
    }
    let count = buf.get_u32_le();
    let mut partitions = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        if buf.remaining() < 4 {
            return Err(StoreError::invalid("short partition set entry"));
        }
        partitions.push(PartitionId::new(buf.get_u32_le()));
    }
    Ok(partitions)
}
