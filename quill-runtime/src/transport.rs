//! TCP transport for node and client RPC.
//!
//! One listener per node serves both peer consensus traffic and client
//! requests; every connection speaks the framed protocol from
//! [`crate::codec`].
//!
//! Consensus messages are one-way frames: responses to an append are
//! themselves consensus messages sent over the responder's own outbound
//! link, so peer links never wait for replies. Client requests are
//! correlated: [`RpcClient`] matches responses to pending requests by
//! request id, with time-based eviction so abandoned calls cannot leak
//! correlation entries.
//!
//! Outbound peer links reconnect lazily with exponential backoff.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use quill_core::{NodeId, RequestId};
use quill_raft::Message;
use socket2::{Domain, Socket, Type};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{
    decode_frame, encode_frame, message_frame, CodecError, Frame, Payload, PayloadRegistry,
};

/// Read buffer size per connection (1 MB).
const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Connection timeout in milliseconds.
const CONNECT_TIMEOUT_MS: u64 = 5000;

/// Maximum pending frames per peer link.
const MAX_PENDING_FRAMES: usize = 1000;

/// Interval between correlation-table eviction sweeps.
const EVICTION_SWEEP_MS: u64 = 500;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to bind to address.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        /// The address we tried to bind.
        addr: SocketAddr,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Failed to connect.
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        /// The remote address.
        addr: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport is shut down.
    #[error("transport is shut down")]
    Shutdown,

    /// Unknown peer.
    #[error("unknown peer: {0}")]
    UnknownPeer(NodeId),

    /// Send queue full.
    #[error("send queue full for peer {0}")]
    QueueFull(NodeId),

    /// The connection closed before a response arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// No response within the caller's deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// A decoded inbound frame plus a handle for replying on its connection.
pub struct Inbound {
    /// The raw frame (header drives response correlation).
    pub frame: Frame,
    /// The decoded payload.
    pub payload: Payload,
    /// Writes response frames back to the originating connection.
    pub reply: ReplyHandle,
}

/// Write side of an inbound connection.
#[derive(Clone)]
pub struct ReplyHandle {
    tx: mpsc::Sender<Bytes>,
}

impl ReplyHandle {
    /// Sends a response frame on the connection this request arrived on.
    ///
    /// # Errors
    /// Returns an error if encoding fails or the connection is gone.
    pub async fn send(&self, frame: &Frame) -> TransportResult<()> {
        let encoded = encode_frame(frame)?;
        self.tx
            .send(encoded)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

/// Configuration for a peer node.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// The peer's node ID.
    pub node_id: NodeId,
    /// The peer's address (ip:port or hostname:port, resolved at connect
    /// time).
    pub addr: String,
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// This node's ID.
    pub node_id: NodeId,
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Known peers.
    pub peers: Vec<PeerInfo>,
}

impl TransportConfig {
    /// Creates a new transport configuration.
    #[must_use]
    pub const fn new(node_id: NodeId, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            peers: Vec::new(),
        }
    }

    /// Adds a peer.
    #[must_use]
    pub fn with_peer(mut self, node_id: NodeId, addr: impl Into<String>) -> Self {
        self.peers.push(PeerInfo {
            node_id,
            addr: addr.into(),
        });
        self
    }
}

/// State of an outbound peer link.
struct PeerConnection {
    sender: mpsc::Sender<Bytes>,
}

/// Handle for sending consensus messages to peers.
#[derive(Clone)]
pub struct TransportHandle {
    node_id: NodeId,
    peers: Arc<RwLock<HashMap<NodeId, PeerConnection>>>,
    shutdown: Arc<Mutex<bool>>,
}

impl TransportHandle {
    /// Sends a one-way consensus message to its destination peer.
    ///
    /// # Errors
    /// Returns an error if the peer is unknown, the queue is full, or the
    /// transport is shut down.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn send(&self, message: &Message) -> TransportResult<()> {
        let to = message.to();
        debug_assert!(to != self.node_id, "cannot send message to self");

        if *self.shutdown.lock().await {
            return Err(TransportError::Shutdown);
        }

        // Encode upfront to catch codec errors early.
        let encoded = encode_frame(&message_frame(message))?;

        let peers = self.peers.read().await;
        let conn = peers.get(&to).ok_or(TransportError::UnknownPeer(to))?;
        conn.sender
            .try_send(encoded)
            .map_err(|_| TransportError::QueueFull(to))
    }

    /// Returns this node's ID.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Requests transport shutdown.
    pub async fn shutdown(&self) {
        *self.shutdown.lock().await = true;
    }
}

/// The node-side transport: listener plus outbound peer links.
pub struct Transport {
    config: TransportConfig,
    peers: Arc<RwLock<HashMap<NodeId, PeerConnection>>>,
    incoming_tx: mpsc::Sender<Inbound>,
    shutdown: Arc<Mutex<bool>>,
    registry: Arc<PayloadRegistry>,
}

impl Transport {
    /// Creates a transport, returning it and the inbound frame stream.
    #[must_use]
    pub fn new(config: TransportConfig) -> (Self, mpsc::Receiver<Inbound>) {
        let (incoming_tx, incoming_rx) = mpsc::channel(1024);
        let transport = Self {
            config,
            peers: Arc::new(RwLock::new(HashMap::new())),
            incoming_tx,
            shutdown: Arc::new(Mutex::new(false)),
            registry: Arc::new(PayloadRegistry::standard()),
        };
        (transport, incoming_rx)
    }

    /// Binds the listener and starts peer links.
    ///
    /// Returns the local address actually bound (useful with port 0) and
    /// a handle for outbound sends.
    ///
    /// # Errors
    /// Returns an error if binding fails.
    pub async fn start(self) -> TransportResult<(TransportHandle, SocketAddr)> {
        let listener = create_reusable_listener(self.config.listen_addr).map_err(|e| {
            TransportError::BindFailed {
                addr: self.config.listen_addr,
                source: e,
            }
        })?;
        let local_addr = listener.local_addr()?;

        info!(
            node = %self.config.node_id,
            addr = %local_addr,
            "Transport listening"
        );

        let handle = TransportHandle {
            node_id: self.config.node_id,
            peers: Arc::clone(&self.peers),
            shutdown: Arc::clone(&self.shutdown),
        };

        for peer in &self.config.peers {
            self.start_peer_link(peer.node_id, peer.addr.clone()).await;
        }

        let shutdown = Arc::clone(&self.shutdown);
        let incoming_tx = self.incoming_tx.clone();
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            Self::accept_loop(listener, incoming_tx, registry, shutdown).await;
        });

        Ok((handle, local_addr))
    }

    /// Starts the sender loop for one outbound peer link.
    async fn start_peer_link(&self, peer_id: NodeId, addr: String) {
        let (tx, rx) = mpsc::channel(MAX_PENDING_FRAMES);
        {
            let mut peers = self.peers.write().await;
            peers.insert(peer_id, PeerConnection { sender: tx });
        }

        let shutdown = Arc::clone(&self.shutdown);
        let node_id = self.config.node_id;
        tokio::spawn(async move {
            Self::sender_loop(node_id, peer_id, addr, rx, shutdown).await;
        });
    }

    /// Drains one peer's outbound queue, reconnecting with backoff.
    async fn sender_loop(
        node_id: NodeId,
        peer_id: NodeId,
        addr: String,
        mut rx: mpsc::Receiver<Bytes>,
        shutdown: Arc<Mutex<bool>>,
    ) {
        const MAX_RECONNECT_DELAY_MS: u64 = 10_000;
        let mut stream: Option<TcpStream> = None;
        let mut reconnect_delay_ms: u64 = 100;

        loop {
            if *shutdown.lock().await {
                debug!(node = %node_id, peer = %peer_id, "Sender loop shutting down");
                break;
            }

            let Some(data) = rx.recv().await else {
                break;
            };

            if stream.is_none() {
                match connect(&addr).await {
                    Ok(s) => {
                        stream = Some(s);
                        reconnect_delay_ms = 100;
                        info!(node = %node_id, peer = %peer_id, addr = %addr, "Connected to peer");
                    }
                    Err(e) => {
                        warn!(node = %node_id, peer = %peer_id, error = %e, "Connect failed, will retry");
                        tokio::time::sleep(Duration::from_millis(reconnect_delay_ms)).await;
                        reconnect_delay_ms = (reconnect_delay_ms * 2).min(MAX_RECONNECT_DELAY_MS);
                        // The frame is dropped; replication retries it.
                        continue;
                    }
                }
            }

            if let Some(ref mut s) = stream {
                if let Err(e) = write_all(s, &data).await {
                    warn!(peer = %peer_id, error = %e, "Send failed, reconnecting");
                    stream = None;
                }
            }
        }
    }

    /// Accepts inbound connections.
    async fn accept_loop(
        listener: TcpListener,
        incoming_tx: mpsc::Sender<Inbound>,
        registry: Arc<PayloadRegistry>,
        shutdown: Arc<Mutex<bool>>,
    ) {
        loop {
            if *shutdown.lock().await {
                break;
            }

            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!(peer_addr = %peer_addr, "Accepted connection");
                    let tx = incoming_tx.clone();
                    let registry = Arc::clone(&registry);
                    tokio::spawn(async move {
                        if let Err(e) = Self::connection_loop(stream, tx, &registry).await {
                            debug!(peer_addr = %peer_addr, error = %e, "Connection ended");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            }
        }
    }

    /// Reads frames from one inbound connection and forwards them.
    async fn connection_loop(
        stream: TcpStream,
        incoming_tx: mpsc::Sender<Inbound>,
        registry: &PayloadRegistry,
    ) -> TransportResult<()> {
        let (mut read_half, write_half) = stream.into_split();

        // Writer task: serializes response frames onto the socket.
        let (reply_tx, reply_rx) = mpsc::channel::<Bytes>(64);
        tokio::spawn(write_loop(write_half, reply_rx));
        let reply = ReplyHandle { tx: reply_tx };

        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        loop {
            let bytes_read = read_half.read_buf(&mut buffer).await?;
            if bytes_read == 0 {
                debug!("Connection closed by peer");
                return Ok(());
            }

            while !buffer.is_empty() {
                match decode_frame(&buffer) {
                    Ok((frame, consumed)) => {
                        let _ = buffer.split_to(consumed);
                        match registry.decode(&frame) {
                            Ok(payload) => {
                                let inbound = Inbound {
                                    frame,
                                    payload,
                                    reply: reply.clone(),
                                };
                                if incoming_tx.send(inbound).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "Dropping undecodable frame");
                            }
                        }
                    }
                    Err(CodecError::InsufficientData { .. }) => break,
                    Err(e) => return Err(e.into()),
                }
            }

            if buffer.capacity() > READ_BUFFER_SIZE * 2 {
                buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
            }
        }
    }
}

/// One pending RPC awaiting its response.
struct PendingRpc {
    tx: oneshot::Sender<Frame>,
    deadline: Instant,
}

/// Correlated request/response client for one remote node.
///
/// Assigns a fresh request id per call and completes the caller when the
/// matching response frame arrives. Entries whose deadline passes are
/// evicted by a background sweep, so an abandoned caller never leaks a
/// correlation slot.
pub struct RpcClient {
    addr: String,
    writer: Mutex<Option<OwnedWriteHalf>>,
    pending: Arc<Mutex<HashMap<RequestId, PendingRpc>>>,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Creates a client for the given address; the connection is dialed
    /// lazily on first call.
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Arc<Self> {
        let client = Arc::new(Self {
            addr: addr.into(),
            writer: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        });

        // Eviction sweep for abandoned requests.
        let pending = Arc::clone(&client.pending);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(EVICTION_SWEEP_MS));
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut table = pending.lock().await;
                let before = table.len();
                table.retain(|_, entry| entry.deadline > now);
                let evicted = before - table.len();
                if evicted > 0 {
                    debug!(evicted, "Evicted expired correlation entries");
                }
                if Arc::strong_count(&pending) == 1 {
                    break;
                }
            }
        });

        client
    }

    /// Sends a request frame and awaits the correlated response.
    ///
    /// # Errors
    /// `Timeout` if no response arrives within `timeout`; connection and
    /// codec errors otherwise.
    pub async fn call(
        &self,
        frame_type: u8,
        destination: NodeId,
        payload: Bytes,
        timeout: Duration,
    ) -> TransportResult<Frame> {
        let request_id = RequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let frame = Frame::request(request_id, frame_type, destination, false, payload);
        let encoded = encode_frame(&frame)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.pending.lock().await;
            table.insert(
                request_id,
                PendingRpc {
                    tx,
                    deadline: Instant::now() + timeout,
                },
            );
        }

        if let Err(e) = self.write(&encoded).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&request_id);
                Err(TransportError::ConnectionClosed)
            }
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    /// Writes bytes, dialing or redialing the connection as needed.
    async fn write(&self, data: &[u8]) -> TransportResult<()> {
        let mut writer = self.writer.lock().await;

        if writer.is_none() {
            *writer = Some(self.dial().await?);
        }

        // One reconnect attempt on a stale connection.
        if let Some(w) = writer.as_mut() {
            if w.write_all(data).await.is_ok() && w.flush().await.is_ok() {
                return Ok(());
            }
        }
        *writer = Some(self.dial().await?);
        let w = writer.as_mut().ok_or(TransportError::ConnectionClosed)?;
        w.write_all(data).await?;
        w.flush().await?;
        Ok(())
    }

    /// Dials the remote node and spawns the response reader.
    async fn dial(&self) -> TransportResult<OwnedWriteHalf> {
        let stream = connect(&self.addr).await?;
        let (mut read_half, write_half) = stream.into_split();

        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
            loop {
                match read_half.read_buf(&mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                while !buffer.is_empty() {
                    match decode_frame(&buffer) {
                        Ok((frame, consumed)) => {
                            let _ = buffer.split_to(consumed);
                            let entry = pending.lock().await.remove(&frame.header.request_id);
                            if let Some(entry) = entry {
                                let _ = entry.tx.send(frame);
                            } else {
                                debug!(
                                    request_id = %frame.header.request_id,
                                    "Dropping response with no pending request"
                                );
                            }
                        }
                        Err(CodecError::InsufficientData { .. }) => break,
                        Err(e) => {
                            warn!(error = %e, "Closing connection on undecodable response");
                            return;
                        }
                    }
                }
            }
        });

        Ok(write_half)
    }
}

/// Connects with a timeout, resolving hostnames at dial time.
async fn connect(addr: &str) -> TransportResult<TcpStream> {
    let timeout = Duration::from_millis(CONNECT_TIMEOUT_MS);
    let connect_future = async {
        let mut addrs = tokio::net::lookup_host(addr).await?;
        let resolved = addrs.next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses found for {addr}"),
            )
        })?;
        TcpStream::connect(resolved).await
    };

    match tokio::time::timeout(timeout, connect_future).await {
        Ok(Ok(stream)) => {
            // Nagle off: consensus latency matters more than throughput.
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(TransportError::ConnectFailed {
            addr: addr.to_string(),
            source: e,
        }),
        Err(_) => Err(TransportError::ConnectFailed {
            addr: addr.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timed out"),
        }),
    }
}

async fn write_all(stream: &mut TcpStream, data: &[u8]) -> TransportResult<()> {
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

/// Drains a reply queue onto the write half of a connection.
async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(data) = rx.recv().await {
        if write_half.write_all(&data).await.is_err() || write_half.flush().await.is_err() {
            break;
        }
    }
}

/// Creates a TCP listener with `SO_REUSEADDR` enabled, so restarts can
/// rebind a port still in `TIME_WAIT`.
fn create_reusable_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}
