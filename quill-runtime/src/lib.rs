//! Quill runtime - wire protocol, TCP transport, and node hosting.
//!
//! This crate turns the pure consensus engine into a running node: a
//! framed wire protocol shared by peer and client traffic, a TCP
//! transport with reconnecting peer links and a correlated RPC client,
//! the `NodeServer` event loop that performs engine outputs in order,
//! and the validated node configuration.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod codec;
pub mod config;
pub mod server;
pub mod transport;

pub use codec::{
    decode_frame, encode_frame, CodecError, CodecResult, Direction, Frame, FrameHeader, Payload,
    PayloadRegistry, Status,
};
pub use config::{ConfigError, ConfigResult, NodeConfig, PeerConfig, TimingConfig};
pub use server::{NodeServer, NodeStatus, ServerError, ServerHandle, ServerResult};
pub use transport::{
    Inbound, PeerInfo, ReplyHandle, RpcClient, Transport, TransportConfig, TransportError,
    TransportHandle, TransportResult,
};
