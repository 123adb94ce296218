//! Quill journal - durable, position-addressed append-only byte log.
//!
//! The journal is the ground truth for replicated entries: an append-only
//! sequence of CRC-framed records stored in segment files, addressed by
//! global byte position. It has no consensus awareness; the replication
//! layer owns term/index semantics.
//!
//! # Positions
//!
//! Three byte positions describe the journal at all times:
//!
//! - `min`: lowest retained position (older data may have been shrunk away)
//! - `max`: highest appended position (possibly not yet durable)
//! - `flushed`: highest position guaranteed durable
//!
//! The invariant `min <= flushed <= max` always holds, and after recovery
//! `flushed == max` by definition of durability.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod error;
mod journal;
mod record;
mod storage;

pub use config::JournalConfig;
pub use error::{JournalError, JournalResult};
pub use journal::Journal;
pub use record::{Record, RECORD_OVERHEAD};
pub use storage::{MemoryStorage, Storage, StorageFile, TokioStorage};
