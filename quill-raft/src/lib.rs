//! Quill Raft - consensus engine and replicated log.
//!
//! The consensus core is a pure state machine ([`RaftNode`]): it consumes
//! timer events, peer messages, and client requests, and emits
//! [`RaftOutput`] actions the runtime performs. All I/O (persistence,
//! networking, timers) lives outside this crate's core, which keeps
//! elections and replication deterministic and testable without a
//! network or a clock.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod applier;
mod config;
mod error;
mod journal_storage;
mod log;
mod message;
mod snapshot;
mod state;
mod storage;

pub use applier::{Applier, StateMachine};
pub use config::{ClusterConfiguration, Member, RaftConfig, Role};
pub use error::{RaftError, RaftResult};
pub use journal_storage::JournalRaftStorage;
pub use log::{EntryKind, LogEntry, RaftLog};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    Message, ReadRequest, RequestVoteRequest, RequestVoteResponse,
};
pub use snapshot::Snapshot;
pub use state::{RaftNode, RaftOutput, RaftState};
pub use storage::{MemoryRaftStorage, PersistentState, RaftStorage};
