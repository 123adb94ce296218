//! Store error types.

use thiserror::Error;

/// Errors produced by the journal store and its codecs.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A query, reply, or control payload could not be decoded.
    #[error("undecodable store frame: {reason}")]
    InvalidFrame {
        /// What was wrong with the frame.
        reason: &'static str,
    },

    /// The snapshot blob failed structural validation.
    #[error("undecodable store snapshot: {reason}")]
    InvalidSnapshot {
        /// What was wrong with the blob.
        reason: &'static str,
    },
}

impl StoreError {
    pub(crate) const fn invalid(reason: &'static str) -> Self {
        Self::InvalidFrame { reason }
    }
}

/// Convenience alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
