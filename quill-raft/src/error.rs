//! Consensus error types.

use quill_core::{LogIndex, NodeId, TermId};
use thiserror::Error;

/// Result type for consensus operations.
pub type RaftResult<T> = Result<T, RaftError>;

/// Errors that can occur in the consensus engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaftError {
    /// The follower's log does not contain an entry matching
    /// `prev_log_index`/`prev_log_term`. Recoverable: the leader backs up
    /// its next-index and retries with an earlier prefix.
    #[error("log mismatch at index {prev_log_index}: expected term {expected_term}, log has {actual_term}")]
    LogMismatch {
        /// Index the leader expected to match.
        prev_log_index: LogIndex,
        /// Term the leader claimed for that index.
        expected_term: TermId,
        /// Term actually present locally (0 if absent).
        actual_term: TermId,
    },

    /// Operation requires leadership this node does not hold.
    #[error("not leader, hint: {leader_hint:?}")]
    NotLeader {
        /// Last known leader, if any.
        leader_hint: Option<NodeId>,
    },

    /// Requested index is outside the retained log.
    #[error("index {index} outside retained log [{first}, {last}]")]
    IndexOutOfRange {
        /// Requested index.
        index: LogIndex,
        /// First retained index.
        first: LogIndex,
        /// Last appended index.
        last: LogIndex,
    },

    /// Persisted state is corrupt. Fatal: the node must stop participating
    /// in consensus rather than risk violating its promises.
    #[error("persisted consensus state corrupt: {reason}")]
    PersistenceCorruption {
        /// Why the state is considered corrupt.
        reason: String,
    },

    /// Underlying storage failure.
    #[error("consensus storage failure during {operation}: {message}")]
    Storage {
        /// The operation that failed.
        operation: &'static str,
        /// Error description.
        message: String,
    },
}

impl RaftError {
    /// Creates a storage error.
    pub fn storage(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Storage {
            operation,
            message: err.to_string(),
        }
    }

    /// Returns true if the node must halt consensus participation.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::PersistenceCorruption { .. })
    }
}
