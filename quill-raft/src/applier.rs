//! State machine executor.
//!
//! Applies committed entries to the application-supplied state machine
//! strictly in index order, exactly once. Domain failures are part of a
//! command's result payload, never errors through the consensus path: a
//! misbehaving command must not desynchronize nodes, so a failed command
//! still advances the apply watermark.

use bytes::Bytes;
use quill_core::LogIndex;
use tracing::{debug, trace};

use crate::log::{EntryKind, LogEntry};
use crate::snapshot::Snapshot;

/// Contract an application state machine implements to be replicated.
///
/// `execute` is called for each committed write entry, in index order,
/// exactly once per node. Implementations report domain errors inside the
/// returned result payload.
pub trait StateMachine: Send {
    /// Applies a committed command and returns its result payload.
    fn execute(&mut self, entry: &LogEntry) -> Bytes;

    /// Answers a read-only query against current state, bypassing the log.
    fn query(&self, request: &Bytes) -> Bytes;

    /// Serializes the current state for a snapshot.
    fn take_snapshot(&self) -> Bytes;

    /// Replaces the current state with a snapshot's.
    fn restore_snapshot(&mut self, data: &Bytes);
}

/// Drives a state machine from committed entries.
///
/// Owns the apply watermark; the consensus engine hands entries over via
/// [`Applier::apply`] and the executor guarantees order and idempotence
/// even if the engine re-emits an already applied index after recovery.
pub struct Applier<M: StateMachine> {
    machine: M,
    last_applied: LogIndex,
}

impl<M: StateMachine> Applier<M> {
    /// Creates an executor over a fresh state machine.
    pub const fn new(machine: M) -> Self {
        Self {
            machine,
            last_applied: LogIndex::new(0),
        }
    }

    /// Creates an executor whose machine was restored from a snapshot
    /// covering `last_applied`.
    pub const fn recovered(machine: M, last_applied: LogIndex) -> Self {
        Self {
            machine,
            last_applied,
        }
    }

    /// Returns the highest applied index.
    #[must_use]
    pub const fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Returns the underlying state machine.
    #[must_use]
    pub const fn machine(&self) -> &M {
        &self.machine
    }

    /// Applies one committed entry, returning its result payload.
    ///
    /// Duplicate deliveries (index at or below the watermark) are
    /// ignored; non-write entries advance the watermark without touching
    /// the machine.
    ///
    /// # Panics
    /// Panics if an index is skipped: a gap means committed entries were
    /// lost, which is unrecoverable.
    pub fn apply(&mut self, entry: &LogEntry) -> Option<Bytes> {
        if entry.index <= self.last_applied {
            trace!(index = %entry.index, "Skipping already applied entry");
            return None;
        }
        assert!(
            entry.index == self.last_applied.next(),
            "apply gap: expected {}, got {}",
            self.last_applied.next(),
            entry.index
        );

        let result = match entry.kind {
            EntryKind::Write => Some(self.machine.execute(entry)),
            EntryKind::Configuration | EntryKind::NoOp => None,
        };

        self.last_applied = entry.index;
        debug!(index = %entry.index, kind = ?entry.kind, "Applied entry");
        result
    }

    /// Answers a read-only query.
    #[must_use]
    pub fn query(&self, request: &Bytes) -> Bytes {
        self.machine.query(request)
    }

    /// Takes a snapshot of the machine at the current apply watermark.
    #[must_use]
    pub fn snapshot(&self, last_included_term: quill_core::TermId) -> Snapshot {
        Snapshot::new(self.last_applied, last_included_term, self.machine.take_snapshot())
    }

    /// Restores the machine from a snapshot and moves the watermark to
    /// its boundary.
    pub fn restore(&mut self, snapshot: &Snapshot) {
        self.machine.restore_snapshot(&snapshot.data);
        self.last_applied = snapshot.last_included_index;
    }
}
