//! Journal error types.
//!
//! All errors are explicit and typed. Corruption is kept distinct from
//! recoverable conditions: a torn tail found during recovery is expected
//! after a crash, a bad checksum in the interior of the journal is not.

use thiserror::Error;

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors that can occur during journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Requested position range falls outside `[min, max]`.
    #[error("position out of range: requested [{position}, {position_end}), valid [{min}, {max})")]
    OutOfRange {
        /// Start of the requested range.
        position: u64,
        /// Exclusive end of the requested range.
        position_end: u64,
        /// Lowest retained position.
        min: u64,
        /// Highest appended position.
        max: u64,
    },

    /// Record payload exceeds the maximum size.
    #[error("record too large: {size} bytes exceeds max {max} bytes")]
    RecordTooLarge {
        /// Actual payload size.
        size: u32,
        /// Maximum allowed payload size.
        max: u32,
    },

    /// Persisted data is corrupt. Fatal: the node must not continue
    /// serving from this journal.
    #[error("journal corruption at position {position}: {reason}")]
    Corruption {
        /// Byte position where corruption was detected.
        position: u64,
        /// Why the data is considered corrupt.
        reason: &'static str,
    },

    /// Checksum mismatch on a record read back from storage.
    #[error("checksum mismatch at position {position}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Byte position of the record.
        position: u64,
        /// Checksum computed from the data.
        expected: u32,
        /// Checksum stored in the record.
        actual: u32,
    },

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// The operation that failed.
        operation: &'static str,
        /// Error description.
        message: String,
    },
}

impl JournalError {
    /// Creates an I/O error.
    pub fn io(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }

    /// Returns true if this error indicates unrecoverable corruption.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corruption { .. } | Self::ChecksumMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_display() {
        let err = JournalError::OutOfRange {
            position: 100,
            position_end: 200,
            min: 0,
            max: 150,
        };
        let msg = format!("{err}");
        assert!(msg.contains("100"));
        assert!(msg.contains("150"));
    }

    #[test]
    fn test_is_corruption() {
        assert!(JournalError::ChecksumMismatch {
            position: 0,
            expected: 1,
            actual: 2
        }
        .is_corruption());
        assert!(!JournalError::io("read", "boom").is_corruption());
    }
}
