//! Replicated log entries and the in-memory log.
//!
//! The log layers term/index semantics over raw journal bytes: conflict
//! truncation on divergent terms, snapshot prefixes, and the up-to-date
//! comparison used by elections.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quill_core::{LogIndex, PartitionId, TermId};

use crate::error::{RaftError, RaftResult};

/// What a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// An application command to apply to the state machine.
    Write,
    /// A cluster membership change.
    Configuration,
    /// A barrier appended by a new leader so prior-term entries become
    /// committable under the current-term rule.
    NoOp,
}

impl EntryKind {
    const fn tag(self) -> u8 {
        match self {
            Self::Write => 0,
            Self::Configuration => 1,
            Self::NoOp => 2,
        }
    }

    const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Write),
            1 => Some(Self::Configuration),
            2 => Some(Self::NoOp),
            _ => None,
        }
    }
}

/// A single entry in the replicated log.
///
/// Immutable once appended. `partition`/`batch_offset`/`batch_size` are
/// opaque to consensus; the journal-store state machine uses them to
/// address records within client batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Term in which the entry was created.
    pub term: TermId,
    /// Index of the entry (1-based, gapless).
    pub index: LogIndex,
    /// Entry kind.
    pub kind: EntryKind,
    /// Opaque command payload.
    pub payload: Bytes,
    /// Target partition for write entries.
    pub partition: PartitionId,
    /// Offset of this entry within its client batch.
    pub batch_offset: u32,
    /// Total records in the client batch this entry belongs to.
    pub batch_size: u32,
}

impl LogEntry {
    /// Creates a write entry.
    #[must_use]
    pub const fn write(
        term: TermId,
        index: LogIndex,
        partition: PartitionId,
        batch_size: u32,
        payload: Bytes,
    ) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Write,
            payload,
            partition,
            batch_offset: 0,
            batch_size,
        }
    }

    /// Creates a no-op barrier entry.
    #[must_use]
    pub const fn noop(term: TermId, index: LogIndex) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::NoOp,
            payload: Bytes::new(),
            partition: PartitionId::new(0),
            batch_offset: 0,
            batch_size: 0,
        }
    }

    /// Creates a configuration-change entry.
    #[must_use]
    pub const fn configuration(term: TermId, index: LogIndex, payload: Bytes) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Configuration,
            payload,
            partition: PartitionId::new(0),
            batch_offset: 0,
            batch_size: 0,
        }
    }

    /// Encodes the entry for storage or the wire.
    ///
    /// Format (little-endian): term (8) + index (8) + kind (1) +
    /// partition (4) + `batch_offset` (4) + `batch_size` (4) +
    /// payload length (4) + payload.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.term.get());
        buf.put_u64_le(self.index.get());
        buf.put_u8(self.kind.tag());
        buf.put_u32_le(self.partition.get());
        buf.put_u32_le(self.batch_offset);
        buf.put_u32_le(self.batch_size);
        // Safe cast: payloads bounded by RECORD_PAYLOAD_BYTES_MAX.
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    /// Returns the encoded size in bytes.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        33 + self.payload.len()
    }

    /// Decodes an entry.
    ///
    /// # Errors
    /// Returns `PersistenceCorruption` if the bytes are malformed.
    pub fn decode(buf: &mut impl Buf) -> RaftResult<Self> {
        if buf.remaining() < 33 {
            return Err(RaftError::PersistenceCorruption {
                reason: "log entry shorter than fixed header".to_string(),
            });
        }

        let term = TermId::new(buf.get_u64_le());
        let index = LogIndex::new(buf.get_u64_le());
        let kind =
            EntryKind::from_tag(buf.get_u8()).ok_or_else(|| RaftError::PersistenceCorruption {
                reason: "unknown log entry kind".to_string(),
            })?;
        let partition = PartitionId::new(buf.get_u32_le());
        let batch_offset = buf.get_u32_le();
        let batch_size = buf.get_u32_le();
        let payload_len = buf.get_u32_le() as usize;

        if buf.remaining() < payload_len {
            return Err(RaftError::PersistenceCorruption {
                reason: "log entry payload truncated".to_string(),
            });
        }
        let payload = buf.copy_to_bytes(payload_len);

        Ok(Self {
            term,
            index,
            kind,
            payload,
            partition,
            batch_offset,
            batch_size,
        })
    }
}

/// The in-memory replicated log.
///
/// Entries start at `prefix_index + 1`; everything at or below the prefix
/// has been compacted into a snapshot. The prefix term is retained so
/// consistency checks against the boundary still work.
#[derive(Debug, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    prefix_index: u64,
    prefix_term: TermId,
}

impl RaftLog {
    /// Creates an empty log.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            prefix_index: 0,
            prefix_term: TermId::new(0),
        }
    }

    /// Returns true if no entries are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the first retained index (0 if none).
    #[must_use]
    pub fn first_index(&self) -> LogIndex {
        if self.entries.is_empty() {
            LogIndex::new(0)
        } else {
            LogIndex::new(self.prefix_index + 1)
        }
    }

    /// Returns the index below which entries have been compacted away.
    #[must_use]
    pub const fn prefix_index(&self) -> LogIndex {
        LogIndex::new(self.prefix_index)
    }

    /// Returns the last appended index (the prefix index if empty).
    #[must_use]
    pub fn last_index(&self) -> LogIndex {
        LogIndex::new(self.prefix_index + self.entries.len() as u64)
    }

    /// Returns the term of the last entry (the prefix term if empty).
    #[must_use]
    pub fn last_term(&self) -> TermId {
        self.entries.last().map_or(self.prefix_term, |e| e.term)
    }

    /// Gets an entry by index, if retained.
    #[must_use]
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        let i = index.get();
        if i <= self.prefix_index {
            return None;
        }
        // Safe cast: retained entries fit in memory.
        #[allow(clippy::cast_possible_truncation)]
        let offset = (i - self.prefix_index - 1) as usize;
        self.entries.get(offset)
    }

    /// Returns the term at an index: the prefix term at the boundary, the
    /// entry's term if retained, 0 otherwise.
    #[must_use]
    pub fn term_at(&self, index: LogIndex) -> TermId {
        if index.get() == self.prefix_index {
            self.prefix_term
        } else {
            self.get(index).map_or(TermId::new(0), |e| e.term)
        }
    }

    /// Appends entries as leader, assigning the current term and the next
    /// contiguous indices. Returns the index of the last appended entry.
    pub fn append_as_leader(&mut self, term: TermId, mut entries: Vec<LogEntry>) -> LogIndex {
        let mut next = self.last_index();
        for entry in &mut entries {
            next = next.next();
            entry.term = term;
            entry.index = next;
        }
        self.entries.append(&mut entries);

        debug_assert!(self.last_index() == next || self.entries.is_empty());
        next
    }

    /// Appends entries as follower after the leader's consistency check.
    ///
    /// Existing entries that conflict (same index, different term) are
    /// truncated before the new entries are appended. Entries already
    /// present with matching terms are skipped.
    ///
    /// # Errors
    /// Returns `LogMismatch` if the entry at `prev_log_index` does not
    /// carry `prev_log_term`.
    pub fn append_as_follower(
        &mut self,
        prev_log_index: LogIndex,
        prev_log_term: TermId,
        entries: Vec<LogEntry>,
    ) -> RaftResult<LogIndex> {
        let local_term = self.term_at(prev_log_index);
        let matches = prev_log_index.get() == 0
            || prev_log_index.get() <= self.prefix_index
            || (self.get(prev_log_index).is_some() && local_term == prev_log_term);
        if !matches {
            return Err(RaftError::LogMismatch {
                prev_log_index,
                expected_term: prev_log_term,
                actual_term: local_term,
            });
        }

        for entry in entries {
            if entry.index.get() <= self.prefix_index {
                // Already covered by the snapshot prefix.
                continue;
            }
            if let Some(existing) = self.get(entry.index) {
                if existing.term == entry.term {
                    continue;
                }
                // Conflict: discard from here on.
                self.truncate_after(LogIndex::new(entry.index.get() - 1));
            }

            debug_assert!(entry.index.get() == self.last_index().get() + 1);
            self.entries.push(entry);
        }

        Ok(self.last_index())
    }

    /// Truncates the log after the given index, keeping entries up to and
    /// including `last_to_keep`.
    pub fn truncate_after(&mut self, last_to_keep: LogIndex) {
        let keep = last_to_keep.get().saturating_sub(self.prefix_index);
        // Safe cast: retained entries fit in memory.
        #[allow(clippy::cast_possible_truncation)]
        let keep = keep as usize;
        if keep < self.entries.len() {
            self.entries.truncate(keep);
        }
    }

    /// Returns up to `max_count` entries starting at `start_index`.
    ///
    /// Entries below the retained range are silently skipped; the caller
    /// detects that case via [`RaftLog::prefix_index`] and falls back to
    /// snapshot transfer.
    #[must_use]
    pub fn entries_from(&self, start_index: LogIndex, max_count: usize) -> Vec<LogEntry> {
        let start = start_index.get().max(self.prefix_index + 1);
        if start > self.last_index().get() {
            return Vec::new();
        }
        // Safe cast: retained entries fit in memory.
        #[allow(clippy::cast_possible_truncation)]
        let offset = (start - self.prefix_index - 1) as usize;
        let end = offset.saturating_add(max_count).min(self.entries.len());
        self.entries[offset..end].to_vec()
    }

    /// Replaces the prefix through `last_included_index`, used when a
    /// snapshot is installed or the log is compacted behind one.
    ///
    /// Retained entries beyond the snapshot that are consistent with it
    /// are kept; an inconsistent suffix is discarded entirely.
    pub fn install_snapshot(&mut self, last_included_index: LogIndex, last_included_term: TermId) {
        let keep_suffix = self.term_at(last_included_index) == last_included_term
            && last_included_index <= self.last_index();

        if keep_suffix {
            let drop = last_included_index.get().saturating_sub(self.prefix_index);
            // Safe cast: retained entries fit in memory.
            #[allow(clippy::cast_possible_truncation)]
            self.entries.drain(..(drop as usize).min(self.entries.len()));
        } else {
            self.entries.clear();
        }

        self.prefix_index = last_included_index.get();
        self.prefix_term = last_included_term;

        debug_assert!(self.last_index() >= last_included_index);
    }

    /// Checks whether a candidate's log at (`other_term`, `other_index`)
    /// is at least as up-to-date as ours. Compared lexicographically by
    /// (term, index).
    #[must_use]
    pub fn is_up_to_date(&self, other_term: TermId, other_index: LogIndex) -> bool {
        let my_term = self.last_term();
        let my_index = self.last_index();
        other_term > my_term || (other_term == my_term && other_index >= my_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_entry(term: u64, index: u64) -> LogEntry {
        LogEntry::write(
            TermId::new(term),
            LogIndex::new(index),
            PartitionId::new(0),
            1,
            Bytes::from(format!("entry-{index}")),
        )
    }

    #[test]
    fn test_entry_codec_roundtrip() {
        let mut entry = write_entry(3, 7);
        entry.partition = PartitionId::new(2);
        entry.batch_offset = 1;
        entry.batch_size = 5;

        let mut buf = BytesMut::new();
        entry.encode(&mut buf);
        assert_eq!(buf.len(), entry.encoded_size());

        let decoded = LogEntry::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_entry_decode_truncated_is_corruption() {
        let mut buf = BytesMut::new();
        write_entry(1, 1).encode(&mut buf);
        buf.truncate(buf.len() - 4);

        let result = LogEntry::decode(&mut buf.freeze());
        assert!(matches!(
            result,
            Err(RaftError::PersistenceCorruption { .. })
        ));
    }

    #[test]
    fn test_append_as_leader_assigns_indices() {
        let mut log = RaftLog::new();
        let last = log.append_as_leader(
            TermId::new(2),
            vec![write_entry(0, 0), write_entry(0, 0)],
        );

        assert_eq!(last, LogIndex::new(2));
        assert_eq!(log.get(LogIndex::new(1)).unwrap().term, TermId::new(2));
        assert_eq!(log.get(LogIndex::new(2)).unwrap().term, TermId::new(2));
    }

    #[test]
    fn test_append_as_follower_detects_mismatch() {
        let mut log = RaftLog::new();
        log.append_as_leader(TermId::new(1), vec![write_entry(0, 0)]);

        let result = log.append_as_follower(
            LogIndex::new(1),
            TermId::new(2),
            vec![write_entry(2, 2)],
        );
        assert!(matches!(result, Err(RaftError::LogMismatch { .. })));
    }

    #[test]
    fn test_append_as_follower_truncates_conflicts() {
        let mut log = RaftLog::new();
        log.append_as_leader(
            TermId::new(1),
            vec![write_entry(0, 0), write_entry(0, 0), write_entry(0, 0)],
        );

        // Overwrite indices 2..3 with term-2 entries.
        let replacement = vec![
            LogEntry::write(
                TermId::new(2),
                LogIndex::new(2),
                PartitionId::new(0),
                1,
                Bytes::from("new-2"),
            ),
            LogEntry::write(
                TermId::new(2),
                LogIndex::new(3),
                PartitionId::new(0),
                1,
                Bytes::from("new-3"),
            ),
        ];
        let last = log
            .append_as_follower(LogIndex::new(1), TermId::new(1), replacement)
            .unwrap();

        assert_eq!(last, LogIndex::new(3));
        assert_eq!(log.term_at(LogIndex::new(2)), TermId::new(2));
        assert_eq!(log.term_at(LogIndex::new(3)), TermId::new(2));
    }

    #[test]
    fn test_duplicate_append_is_idempotent() {
        let mut log = RaftLog::new();
        let entries = vec![write_entry(1, 1), write_entry(1, 2)];
        log.append_as_follower(LogIndex::new(0), TermId::new(0), entries.clone())
            .unwrap();
        log.append_as_follower(LogIndex::new(0), TermId::new(0), entries)
            .unwrap();

        assert_eq!(log.last_index(), LogIndex::new(2));
    }

    #[test]
    fn test_install_snapshot_compacts_prefix() {
        let mut log = RaftLog::new();
        log.append_as_leader(
            TermId::new(1),
            vec![write_entry(0, 0), write_entry(0, 0), write_entry(0, 0)],
        );

        log.install_snapshot(LogIndex::new(2), TermId::new(1));

        assert_eq!(log.prefix_index(), LogIndex::new(2));
        assert_eq!(log.last_index(), LogIndex::new(3));
        assert!(log.get(LogIndex::new(2)).is_none());
        assert!(log.get(LogIndex::new(3)).is_some());
        assert_eq!(log.term_at(LogIndex::new(2)), TermId::new(1));
    }

    #[test]
    fn test_install_snapshot_discards_conflicting_suffix() {
        let mut log = RaftLog::new();
        log.append_as_leader(TermId::new(1), vec![write_entry(0, 0), write_entry(0, 0)]);

        // Snapshot claims a different term at index 2.
        log.install_snapshot(LogIndex::new(2), TermId::new(3));

        assert!(log.is_empty());
        assert_eq!(log.last_index(), LogIndex::new(2));
        assert_eq!(log.last_term(), TermId::new(3));
    }

    #[test]
    fn test_is_up_to_date() {
        let mut log = RaftLog::new();
        log.append_as_leader(TermId::new(1), vec![write_entry(0, 0)]);
        log.append_as_leader(TermId::new(2), vec![write_entry(0, 0)]);

        assert!(log.is_up_to_date(TermId::new(3), LogIndex::new(1)));
        assert!(!log.is_up_to_date(TermId::new(2), LogIndex::new(1)));
        assert!(log.is_up_to_date(TermId::new(2), LogIndex::new(2)));
        assert!(!log.is_up_to_date(TermId::new(1), LogIndex::new(5)));
    }

    #[test]
    fn test_entries_from_bounded() {
        let mut log = RaftLog::new();
        log.append_as_leader(
            TermId::new(1),
            vec![write_entry(0, 0), write_entry(0, 0), write_entry(0, 0)],
        );

        let entries = log.entries_from(LogIndex::new(2), 1);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].index, LogIndex::new(2));

        assert!(log.entries_from(LogIndex::new(9), 10).is_empty());
    }
}
