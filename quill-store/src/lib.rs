//! Quill Store - the replicated partitioned journal store.
//!
//! This crate is the application side of the replication framework: a
//! [`JournalStore`] state machine that partitions an append-only record
//! space, plus the wire codecs clients use to talk to it. It contains no
//! consensus logic; `quill-raft`'s executor drives it from committed
//! entries.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod codec;
mod error;
mod store;

pub use codec::{
    decode_partition_set, encode_partition_set, StoreQuery, StoreReply, StoredRecord,
};
pub use error::{StoreError, StoreResult};
pub use store::{JournalStore, CONTROL_PARTITION};
