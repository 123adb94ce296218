//! Persistent consensus state.
//!
//! Two things must survive crashes for safety: the term/vote record
//! (persisted before any vote is cast or granted) and the log entries
//! themselves. The storage trait is separate from the pure state machine:
//! [`crate::RaftNode`] emits persist outputs and the runtime performs
//! them, keeping the consensus core deterministic.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use quill_core::{LogIndex, NodeId, TermId};

use crate::error::{RaftError, RaftResult};
use crate::log::LogEntry;

/// The term/vote record, persisted before participating in any election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PersistentState {
    /// Latest term this node has seen; monotonically non-decreasing.
    pub current_term: TermId,
    /// Candidate that received this node's vote in the current term.
    pub voted_for: Option<NodeId>,
}

impl PersistentState {
    /// Creates a fresh state (term 0, no vote).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current_term: TermId::new(0),
            voted_for: None,
        }
    }

    /// Creates a state with the given values.
    #[must_use]
    pub const fn with_values(current_term: TermId, voted_for: Option<NodeId>) -> Self {
        Self {
            current_term,
            voted_for,
        }
    }

    /// Encodes the record with a trailing CRC32.
    ///
    /// Format: term (8) + vote flag (1) + voted-for (8, zero if absent) +
    /// CRC32 of the preceding 17 bytes. Little-endian.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(21);
        buf.put_u64_le(self.current_term.get());
        match self.voted_for {
            Some(id) => {
                buf.put_u8(1);
                buf.put_u64_le(id.get());
            }
            None => {
                buf.put_u8(0);
                buf.put_u64_le(0);
            }
        }
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    /// Decodes a record, verifying its checksum.
    ///
    /// # Errors
    /// Returns `PersistenceCorruption` if the bytes are malformed or the
    /// checksum does not match. Term/vote corruption is fatal: a node
    /// that cannot trust its vote record must not participate.
    pub fn decode(mut buf: &[u8]) -> RaftResult<Self> {
        if buf.len() != 21 {
            return Err(RaftError::PersistenceCorruption {
                reason: format!("term/vote record has {} bytes, expected 21", buf.len()),
            });
        }

        let stored_crc = u32::from_le_bytes([buf[17], buf[18], buf[19], buf[20]]);
        if crc32fast::hash(&buf[..17]) != stored_crc {
            return Err(RaftError::PersistenceCorruption {
                reason: "term/vote record checksum mismatch".to_string(),
            });
        }

        let current_term = TermId::new(buf.get_u64_le());
        let flag = buf.get_u8();
        let id = buf.get_u64_le();
        let voted_for = match flag {
            0 => None,
            1 => Some(NodeId::new(id)),
            _ => {
                return Err(RaftError::PersistenceCorruption {
                    reason: "term/vote record has invalid vote flag".to_string(),
                })
            }
        };

        Ok(Self {
            current_term,
            voted_for,
        })
    }
}

/// Durable storage for consensus state.
///
/// Implementations must guarantee that data survives crashes once a
/// method returns successfully.
#[async_trait]
pub trait RaftStorage: Send + Sync {
    /// Persists the term/vote record.
    ///
    /// Must complete before the node responds to the RPC that changed
    /// the term or vote.
    ///
    /// # Errors
    /// Returns an error if the record cannot be persisted.
    async fn save_state(&mut self, state: PersistentState) -> RaftResult<()>;

    /// Loads the term/vote record. Returns `None` on a fresh start.
    ///
    /// # Errors
    /// Returns `PersistenceCorruption` if a record exists but is invalid.
    async fn load_state(&self) -> RaftResult<Option<PersistentState>>;

    /// Durably truncates the log after `from_index - 1` and appends the
    /// given entries starting at `from_index`.
    ///
    /// Conflict truncation and append are one operation so a crash
    /// between them cannot leave a divergent suffix.
    ///
    /// # Errors
    /// Returns an error if the entries cannot be persisted.
    async fn append_entries(&mut self, from_index: LogIndex, entries: &[LogEntry])
        -> RaftResult<()>;

    /// Loads all retained entries in index order.
    ///
    /// # Errors
    /// Returns an error if the log cannot be read.
    async fn load_entries(&self) -> RaftResult<Vec<LogEntry>>;

    /// Discards entries covered by a snapshot, up to and including
    /// `last_included_index`. Coarse deletion is permitted.
    ///
    /// # Errors
    /// Returns an error if compaction fails.
    async fn compact(&mut self, last_included_index: LogIndex) -> RaftResult<()>;

    /// Persists a snapshot.
    ///
    /// # Errors
    /// Returns an error if the snapshot cannot be written.
    async fn save_snapshot(&mut self, snapshot: &crate::Snapshot) -> RaftResult<()>;

    /// Loads the latest snapshot. Returns `None` if none exists.
    ///
    /// # Errors
    /// Returns `PersistenceCorruption` if a snapshot exists but fails
    /// validation.
    async fn load_snapshot(&self) -> RaftResult<Option<crate::Snapshot>>;
}

/// In-memory storage for tests and simulation.
///
/// Provides no durability; it exists so the consensus engine can be
/// exercised without touching disk.
#[derive(Debug, Default)]
pub struct MemoryRaftStorage {
    state: Option<PersistentState>,
    entries: Vec<LogEntry>,
    snapshot: Option<crate::Snapshot>,
}

impl MemoryRaftStorage {
    /// Creates empty in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RaftStorage for MemoryRaftStorage {
    async fn save_state(&mut self, state: PersistentState) -> RaftResult<()> {
        self.state = Some(state);
        Ok(())
    }

    async fn load_state(&self) -> RaftResult<Option<PersistentState>> {
        Ok(self.state)
    }

    async fn append_entries(
        &mut self,
        from_index: LogIndex,
        entries: &[LogEntry],
    ) -> RaftResult<()> {
        self.entries.retain(|e| e.index < from_index);
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    async fn load_entries(&self) -> RaftResult<Vec<LogEntry>> {
        Ok(self.entries.clone())
    }

    async fn compact(&mut self, last_included_index: LogIndex) -> RaftResult<()> {
        self.entries.retain(|e| e.index > last_included_index);
        Ok(())
    }

    async fn save_snapshot(&mut self, snapshot: &crate::Snapshot) -> RaftResult<()> {
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(&self) -> RaftResult<Option<crate::Snapshot>> {
        Ok(self.snapshot.clone())
    }
}
