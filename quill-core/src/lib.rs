//! Quill core - shared types for the replicated journal.
//!
//! Strongly-typed identifiers and workspace-wide limits used by every
//! other Quill crate. This crate stays dependency-free so that leaf
//! crates can depend on it without pulling in the async stack.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod types;

pub use types::{LogIndex, NodeId, PartitionId, Position, RequestId, TermId};

/// Workspace-wide limits.
///
/// Explicit, named limits; every bounded resource in the system refers to
/// one of these rather than a magic number.
pub mod limits {
    /// Maximum payload size of a single journal record (16 MB).
    pub const RECORD_PAYLOAD_BYTES_MAX: u32 = 16 * 1024 * 1024;

    /// Maximum size of a single RPC frame (16 MB + framing headroom).
    pub const FRAME_BYTES_MAX: u32 = 17 * 1024 * 1024;

    /// Maximum number of entries shipped in one append request.
    pub const APPEND_ENTRIES_BATCH_MAX: u32 = 1000;

    /// Maximum number of nodes in a cluster (voters plus observers).
    pub const CLUSTER_SIZE_MAX: usize = 9;

    /// Minimum election timeout in milliseconds.
    pub const ELECTION_TIMEOUT_MS_MIN: u64 = 150;

    /// Maximum election timeout in milliseconds.
    pub const ELECTION_TIMEOUT_MS_MAX: u64 = 2_000;

    /// Heartbeat interval in milliseconds.
    pub const HEARTBEAT_INTERVAL_MS: u64 = 50;

    /// Maximum snapshot size (256 MB).
    pub const SNAPSHOT_BYTES_MAX: u64 = 256 * 1024 * 1024;

    /// Maximum number of in-flight append requests per follower.
    pub const REPLICATION_IN_FLIGHT_MAX: usize = 8;
}
