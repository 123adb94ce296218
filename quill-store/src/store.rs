//! The partitioned journal store.
//!
//! Committed write entries land in per-partition batch lists addressed by
//! cumulative record offset: a batch appended with `batch_size` N occupies
//! offsets `[next, next + N)` of its partition. Reads address records by
//! offset range and never touch the replicated log.
//!
//! Scale commands travel on a reserved control partition so consensus can
//! treat them as ordinary write entries.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quill_core::PartitionId;
use quill_raft::{EntryKind, LogEntry, StateMachine};
use tracing::{debug, warn};

use crate::codec::{
    decode_partition_set, StoreQuery, StoreReply, StoredRecord,
};
use crate::error::{StoreError, StoreResult};

/// Partition reserved for store control commands (partition scaling).
pub const CONTROL_PARTITION: PartitionId = PartitionId::new(u32::MAX);

const SNAPSHOT_MAGIC: u32 = 0x514C_5354; // "QLST"

/// One appended batch.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Batch {
    /// Cumulative record offset of the batch's first record.
    start_offset: u64,
    /// Records in the batch.
    batch_size: u32,
    payload: Bytes,
}

/// A single partition: batches in append order, offsets cumulative.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Partition {
    batches: Vec<Batch>,
    next_offset: u64,
}

impl Partition {
    fn append(&mut self, batch_size: u32, payload: Bytes) -> u64 {
        let start_offset = self.next_offset;
        self.batches.push(Batch {
            start_offset,
            batch_size,
            payload,
        });
        self.next_offset += u64::from(batch_size);
        start_offset
    }

    /// Batches overlapping `[offset, offset + length)`, in offset order.
    fn get(&self, offset: u64, length: u32) -> Vec<StoredRecord> {
        let end = offset.saturating_add(u64::from(length));
        let first = self
            .batches
            .partition_point(|b| b.start_offset + u64::from(b.batch_size) <= offset);
        self.batches[first..]
            .iter()
            .take_while(|b| b.start_offset < end)
            .map(|b| StoredRecord {
                start_offset: b.start_offset,
                payload: b.payload.clone(),
            })
            .collect()
    }
}

/// The replicated journal-store state machine.
///
/// Contains no consensus logic; the consensus engine feeds it committed
/// entries through the executor and every node converges on the same
/// partition contents.
#[derive(Debug, Default)]
pub struct JournalStore {
    partitions: BTreeMap<PartitionId, Partition>,
}

impl JournalStore {
    /// Creates an empty store with no partitions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-provisioned with the given partitions.
    #[must_use]
    pub fn with_partitions(partitions: impl IntoIterator<Item = PartitionId>) -> Self {
        let mut store = Self::new();
        for partition in partitions {
            store.partitions.insert(partition, Partition::default());
        }
        store
    }

    /// Returns the current partition set, ascending.
    #[must_use]
    pub fn partitions(&self) -> Vec<PartitionId> {
        self.partitions.keys().copied().collect()
    }

    /// Returns the next record offset of a partition, if it exists.
    #[must_use]
    pub fn next_offset(&self, partition: PartitionId) -> Option<u64> {
        self.partitions.get(&partition).map(|p| p.next_offset)
    }

    fn append(&mut self, entry: &LogEntry) -> StoreReply {
        let Some(partition) = self.partitions.get_mut(&entry.partition) else {
            return StoreReply::Error(format!("unknown partition {}", entry.partition));
        };
        if entry.batch_size == 0 {
            return StoreReply::Error("empty batch".to_string());
        }
        let position = partition.append(entry.batch_size, entry.payload.clone());
        debug!(
            partition = %entry.partition,
            position,
            batch_size = entry.batch_size,
            "Appended batch"
        );
        StoreReply::Appended { position }
    }

    /// Replaces the partition set, keeping data of retained partitions.
    fn scale(&mut self, target: &[PartitionId]) -> StoreReply {
        if target.contains(&CONTROL_PARTITION) {
            return StoreReply::Error("control partition is reserved".to_string());
        }
        let mut next = BTreeMap::new();
        for &partition in target {
            let existing = self.partitions.remove(&partition).unwrap_or_default();
            next.insert(partition, existing);
        }
        for dropped in self.partitions.keys() {
            debug!(partition = %dropped, "Dropping partition on scale");
        }
        self.partitions = next;
        StoreReply::Scaled
    }

    /// Serializes the full partition map.
    fn encode_state(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(SNAPSHOT_MAGIC);
        // Safe cast: partition sets are small.
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(self.partitions.len() as u32);
        for (id, partition) in &self.partitions {
            buf.put_u32_le(id.get());
            buf.put_u64_le(partition.next_offset);
            // Safe cast: batch counts fit the retained-history bound.
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u32_le(partition.batches.len() as u32);
            for batch in &partition.batches {
                buf.put_u64_le(batch.start_offset);
                buf.put_u32_le(batch.batch_size);
                // Safe cast: payloads bounded by the record limit.
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u32_le(batch.payload.len() as u32);
                buf.put_slice(&batch.payload);
            }
        }
        buf.freeze()
    }

    fn decode_state(mut buf: impl Buf) -> StoreResult<BTreeMap<PartitionId, Partition>> {
        if buf.remaining() < 8 || buf.get_u32_le() != SNAPSHOT_MAGIC {
            return Err(StoreError::InvalidSnapshot {
                reason: "bad magic",
            });
        }
        let partition_count = buf.get_u32_le();
        let mut partitions = BTreeMap::new();
        for _ in 0..partition_count {
            if buf.remaining() < 16 {
                return Err(StoreError::InvalidSnapshot {
                    reason: "short partition header",
                });
            }
            let id = PartitionId::new(buf.get_u32_le());
            let next_offset = buf.get_u64_le();
            let batch_count = buf.get_u32_le();
            let mut batches = Vec::with_capacity(batch_count.min(1024) as usize);
            for _ in 0..batch_count {
                if buf.remaining() < 16 {
                    return Err(StoreError::InvalidSnapshot {
                        reason: "short batch header",
                    });
                }
                let start_offset = buf.get_u64_le();
                let batch_size = buf.get_u32_le();
                let len = buf.get_u32_le() as usize;
                if buf.remaining() < len {
                    return Err(StoreError::InvalidSnapshot {
                        reason: "short batch payload",
                    });
                }
                batches.push(Batch {
                    start_offset,
                    batch_size,
                    payload: buf.copy_to_bytes(len),
                });
            }
            partitions.insert(
                id,
                Partition {
                    batches,
                    next_offset,
                },
            );
        }
        Ok(partitions)
    }
}

impl StateMachine for JournalStore {
    fn execute(&mut self, entry: &LogEntry) -> Bytes {
        debug_assert!(entry.kind == EntryKind::Write);
        let reply = if entry.partition == CONTROL_PARTITION {
            match decode_partition_set(&entry.payload[..]) {
                Ok(target) => self.scale(&target),
                Err(e) => StoreReply::Error(e.to_string()),
            }
        } else {
            self.append(entry)
        };
        reply.encode()
    }

    fn query(&self, request: &Bytes) -> Bytes {
        let reply = match StoreQuery::decode(&request[..]) {
            Ok(StoreQuery::Get {
                partition,
                offset,
                length,
            }) => match self.partitions.get(&partition) {
                Some(p) if offset < p.next_offset || (offset == 0 && p.next_offset == 0) => {
                    StoreReply::Records(p.get(offset, length))
                }
                Some(p) => StoreReply::Error(format!(
                    "offset {offset} out of range (next offset {})",
                    p.next_offset
                )),
                None => StoreReply::Error(format!("unknown partition {partition}")),
            },
            Ok(StoreQuery::Partitions) => StoreReply::Partitions(self.partitions()),
            Err(e) => StoreReply::Error(e.to_string()),
        };
        reply.encode()
    }

    fn take_snapshot(&self) -> Bytes {
        self.encode_state()
    }

    fn restore_snapshot(&mut self, data: &Bytes) {
        match Self::decode_state(&data[..]) {
            Ok(partitions) => {
                self.partitions = partitions;
                debug!(partitions = self.partitions.len(), "Restored store snapshot");
            }
            // The snapshot passed consensus-level checksum validation, so
            // a structural failure here means an incompatible format.
            Err(e) => warn!(error = %e, "Rejected store snapshot blob"),
        }
    }
}
