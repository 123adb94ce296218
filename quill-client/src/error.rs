//! Client errors.

use quill_runtime::{CodecError, TransportError};
use thiserror::Error;

/// Errors surfaced to client callers.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No node acknowledged leadership before the caller's deadline.
    #[error("no leader available within the deadline")]
    LeaderUnavailable,

    /// The operation missed its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The store rejected the operation.
    #[error("store error: {message}")]
    Store {
        /// The store's error text.
        message: String,
    },

    /// The server answered with something the client cannot interpret.
    #[error("unexpected reply: {reason}")]
    UnexpectedReply {
        /// What was wrong with the reply.
        reason: String,
    },

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Codec failure.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
