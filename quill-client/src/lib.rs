//! Quill client - leader-aware access to the replicated journal.
//!
//! A [`Router`] tracks the cluster leader through a TTL cache, follows
//! `NotLeader` redirects, and retries within the caller's deadline. The
//! wire side is behind the [`ClusterRpc`] trait so routing policy can be
//! tested with scripted responses.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod leader_cache;
mod router;

pub use error::{ClientError, ClientResult};
pub use leader_cache::{LeaderCache, LEADER_TTL_DEFAULT};
pub use router::{ClusterRpc, Router, TcpClusterRpc};
