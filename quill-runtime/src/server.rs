//! Node runtime.
//!
//! `NodeServer` hosts one consensus node: it owns the pure engine, the
//! state-machine executor, and durable storage, and turns engine outputs
//! into real effects. Timers, persistence, networking, and client
//! correlation all live here; the engine itself stays free of I/O.
//!
//! Output ordering matters: the engine emits persistence outputs before
//! any message that depends on them, and this loop performs outputs
//! strictly in order, so a vote or an acknowledged entry is durable
//! before the corresponding message leaves the node.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use quill_core::{LogIndex, NodeId, PartitionId, RequestId, TermId};
use quill_raft::{
    Applier, LogEntry, Message, RaftConfig, RaftError, RaftNode, RaftOutput, RaftStorage,
    StateMachine,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::codec::{encode_leader, Frame, FrameHeader, Payload, Status};
use crate::config::NodeConfig;
use crate::transport::{Inbound, ReplyHandle, TransportHandle};

/// Maximum client appends awaiting commit before the node sheds load.
const PENDING_APPENDS_MAX: usize = 1024;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The server loop is gone.
    #[error("server unavailable")]
    Unavailable,

    /// This node is not the leader.
    #[error("not leader, hint: {leader_hint:?}")]
    NotLeader {
        /// Last known leader, if any.
        leader_hint: Option<NodeId>,
    },

    /// Too many requests in flight.
    #[error("server busy")]
    ServerBusy,

    /// Consensus failure.
    #[error(transparent)]
    Raft(#[from] RaftError),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// A point-in-time view of the node.
#[derive(Debug, Clone, Copy)]
pub struct NodeStatus {
    /// This node's ID.
    pub node_id: NodeId,
    /// True if this node is the leader.
    pub is_leader: bool,
    /// Last known leader, if any.
    pub leader_id: Option<NodeId>,
    /// Current term.
    pub term: TermId,
    /// Highest committed index.
    pub commit_index: LogIndex,
    /// Highest applied index.
    pub last_applied: LogIndex,
}

/// Commands accepted by the server loop.
enum ServerCommand {
    Append {
        partition: PartitionId,
        batch_size: u32,
        data: Bytes,
        response: oneshot::Sender<ServerResult<(LogIndex, Bytes)>>,
    },
    Status(oneshot::Sender<NodeStatus>),
    Shutdown,
}

/// Handle to a running node server.
#[derive(Clone)]
pub struct ServerHandle {
    commands: mpsc::Sender<ServerCommand>,
}

impl ServerHandle {
    /// Appends one batch through consensus, resolving once committed and
    /// applied. Returns the entry's log index and the state machine's
    /// result payload.
    ///
    /// # Errors
    /// `NotLeader` with a hint if this node cannot accept writes,
    /// `ServerBusy` under load, `Unavailable` if the loop is gone.
    pub async fn append(
        &self,
        partition: PartitionId,
        batch_size: u32,
        data: Bytes,
    ) -> ServerResult<(LogIndex, Bytes)> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ServerCommand::Append {
                partition,
                batch_size,
                data,
                response: tx,
            })
            .await
            .map_err(|_| ServerError::Unavailable)?;
        rx.await.map_err(|_| ServerError::Unavailable)?
    }

    /// Returns a snapshot of the node's consensus state.
    ///
    /// # Errors
    /// `Unavailable` if the loop is gone.
    pub async fn status(&self) -> ServerResult<NodeStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ServerCommand::Status(tx))
            .await
            .map_err(|_| ServerError::Unavailable)?;
        rx.await.map_err(|_| ServerError::Unavailable)
    }

    /// Polls until some node is known as leader, or `timeout` elapses.
    /// Returns `true` once a leader is known.
    pub async fn wait_for_leader(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.status().await {
                Ok(status) if status.leader_id.is_some() => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Requests the server loop to stop.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(ServerCommand::Shutdown).await;
    }
}

/// Who gets the answer when a pending request resolves.
enum Responder {
    Network {
        header: FrameHeader,
        reply: ReplyHandle,
    },
    Local(oneshot::Sender<ServerResult<(LogIndex, Bytes)>>),
}

/// A registered linearizable read waiting for its apply watermark.
struct WaitingRead {
    read_index: LogIndex,
    header: FrameHeader,
    reply: ReplyHandle,
    request: Bytes,
}

/// Timer state owned by the run loop.
struct Timers {
    election_deadline: Instant,
    heartbeat: Interval,
}

/// One consensus node with its executor and durable storage.
pub struct NodeServer<M: StateMachine, S: RaftStorage> {
    config: NodeConfig,
    node: RaftNode,
    applier: Applier<M>,
    storage: S,
    /// Client appends keyed by the log index that resolves them.
    pending_appends: HashMap<LogIndex, Responder>,
    /// Linearizable reads registered with the engine, awaiting `ReadReady`.
    registered_reads: HashMap<RequestId, (FrameHeader, ReplyHandle, Bytes)>,
    /// Reads past the heartbeat round but ahead of the apply watermark.
    waiting_reads: Vec<WaitingRead>,
    next_read_id: RequestId,
    applied_since_snapshot: u64,
    outgoing: Vec<Message>,
}

impl<M, S> NodeServer<M, S>
where
    M: StateMachine + 'static,
    S: RaftStorage + 'static,
{
    /// Opens a node over recovered storage: loads the term/vote record,
    /// snapshot, and retained entries, restores the state machine, and
    /// rebuilds the engine.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or storage
    /// recovery fails.
    pub async fn recover(config: NodeConfig, storage: S, machine: M) -> ServerResult<Self> {
        config.validate()?;

        let state = storage.load_state().await?.unwrap_or_default();
        let snapshot = storage.load_snapshot().await?;
        let entries = storage.load_entries().await?;

        let mut applier = Applier::new(machine);
        if let Some(ref snapshot) = snapshot {
            applier.restore(snapshot);
        }

        let raft_config = RaftConfig::new(config.node_id, config.cluster_nodes());
        let node = RaftNode::restore(raft_config, state, entries, snapshot);

        info!(
            node = %config.node_id,
            term = %node.current_term(),
            last_applied = %applier.last_applied(),
            "Recovered node"
        );

        Ok(Self {
            config,
            node,
            applier,
            storage,
            pending_appends: HashMap::new(),
            registered_reads: HashMap::new(),
            waiting_reads: Vec::new(),
            next_read_id: RequestId::new(1),
            applied_since_snapshot: 0,
            outgoing: Vec::new(),
        })
    }

    /// Runs without network transport: messages are logged and dropped.
    /// Useful for single-node operation and tests.
    pub fn run(self) -> (ServerHandle, impl std::future::Future<Output = ()>) {
        // The sender travels with the loop so the inbound arm stays
        // pending instead of closing it.
        let (idle_tx, idle_rx) = mpsc::channel(1);
        self.run_inner(None, idle_rx, Some(idle_tx))
    }

    /// Runs with TCP transport for peer and client traffic.
    pub fn run_with_transport(
        self,
        transport: TransportHandle,
        incoming: mpsc::Receiver<Inbound>,
    ) -> (ServerHandle, impl std::future::Future<Output = ()>) {
        self.run_inner(Some(transport), incoming, None)
    }

    fn run_inner(
        self,
        transport: Option<TransportHandle>,
        incoming: mpsc::Receiver<Inbound>,
        inbound_guard: Option<mpsc::Sender<Inbound>>,
    ) -> (ServerHandle, impl std::future::Future<Output = ()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let handle = ServerHandle { commands: cmd_tx };
        let future = self.run_loop(cmd_rx, transport, incoming, inbound_guard);
        (handle, future)
    }

    /// The main event loop.
    async fn run_loop(
        mut self,
        mut commands: mpsc::Receiver<ServerCommand>,
        transport: Option<TransportHandle>,
        mut incoming: mpsc::Receiver<Inbound>,
        _inbound_guard: Option<mpsc::Sender<Inbound>>,
    ) {
        enum Event {
            Command(Option<ServerCommand>),
            Inbound(Option<Inbound>),
            ElectionTimeout,
            HeartbeatTick,
        }

        let mut heartbeat = interval(self.config.timing.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut timers = Timers {
            election_deadline: Instant::now() + self.config.timing.random_election_timeout(),
            heartbeat,
        };

        loop {
            // Select resolves to an event first so its borrows end before
            // the handlers touch the timers.
            let event = tokio::select! {
                cmd = commands.recv() => Event::Command(cmd),
                inbound = incoming.recv() => Event::Inbound(inbound),
                () = tokio::time::sleep_until(timers.election_deadline) => Event::ElectionTimeout,
                _ = timers.heartbeat.tick() => Event::HeartbeatTick,
            };

            let step = match event {
                Event::Command(None) | Event::Inbound(None) => break,
                Event::Command(Some(cmd)) => match cmd {
                    ServerCommand::Append { partition, batch_size, data, response } => {
                        self.handle_local_append(partition, batch_size, data, response, &mut timers)
                            .await
                    }
                    ServerCommand::Status(tx) => {
                        let _ = tx.send(self.status());
                        Ok(())
                    }
                    ServerCommand::Shutdown => {
                        info!(node = %self.config.node_id, "Server shutting down");
                        break;
                    }
                },
                Event::Inbound(Some(inbound)) => self.handle_inbound(inbound, &mut timers).await,
                Event::ElectionTimeout => {
                    let outputs = self.node.handle_election_timeout();
                    timers.election_deadline =
                        Instant::now() + self.config.timing.random_election_timeout();
                    self.process_outputs(outputs, &mut timers).await
                }
                Event::HeartbeatTick => {
                    let outputs = self.node.handle_heartbeat_timeout();
                    self.process_outputs(outputs, &mut timers).await
                }
            };

            if let Err(e) = step {
                // Persistence failures are fatal: the node must not keep
                // making promises it cannot durably honor.
                error!(node = %self.config.node_id, error = %e, "Fatal server error, stopping");
                break;
            }

            self.flush_outgoing(transport.as_ref()).await;
        }
    }

    /// Handles one decoded frame from the transport.
    async fn handle_inbound(&mut self, inbound: Inbound, timers: &mut Timers) -> ServerResult<()> {
        let Inbound {
            frame,
            payload,
            reply,
        } = inbound;
        match payload {
            Payload::Raft(message) => {
                let outputs = self.node.handle_message(message);
                self.process_outputs(outputs, timers).await
            }
            Payload::Append {
                partition,
                batch_size,
                data,
            } => {
                self.handle_client_append(partition, batch_size, data, frame.header, reply, timers)
                    .await
            }
            Payload::Query {
                linearizable,
                request,
            } => {
                self.handle_client_query(linearizable, request, frame.header, reply, timers)
                    .await
            }
            Payload::GetLeader => {
                let response = Frame::response(
                    &frame.header,
                    Status::Ok,
                    String::new(),
                    encode_leader(self.node.leader_id()),
                );
                self.send_reply(&reply, &response).await;
                Ok(())
            }
            Payload::Reply(_) | Payload::Leader(_) => {
                warn!(frame_type = frame.header.frame_type, "Dropping unexpected response frame");
                Ok(())
            }
        }
    }

    /// Submits a client append through consensus, deferring the answer
    /// until the entry commits and applies.
    async fn handle_client_append(
        &mut self,
        partition: PartitionId,
        batch_size: u32,
        data: Bytes,
        header: FrameHeader,
        reply: ReplyHandle,
        timers: &mut Timers,
    ) -> ServerResult<()> {
        if self.pending_appends.len() >= PENDING_APPENDS_MAX {
            let response = Frame::response(
                &header,
                Status::ServerBusy,
                "too many requests in flight".to_string(),
                Bytes::new(),
            );
            self.send_reply(&reply, &response).await;
            return Ok(());
        }

        match self.submit_entry(partition, batch_size, data) {
            Ok((index, outputs)) => {
                self.pending_appends
                    .insert(index, Responder::Network { header, reply });
                self.process_outputs(outputs, timers).await
            }
            Err(RaftError::NotLeader { leader_hint }) => {
                let response = Frame::response(
                    &header,
                    Status::NotLeader,
                    "not leader".to_string(),
                    encode_leader(leader_hint),
                );
                self.send_reply(&reply, &response).await;
                Ok(())
            }
            Err(e) => {
                let response =
                    Frame::response(&header, Status::Error, e.to_string(), Bytes::new());
                self.send_reply(&reply, &response).await;
                Ok(())
            }
        }
    }

    /// Same as [`Self::handle_client_append`] for in-process callers.
    async fn handle_local_append(
        &mut self,
        partition: PartitionId,
        batch_size: u32,
        data: Bytes,
        response: oneshot::Sender<ServerResult<(LogIndex, Bytes)>>,
        timers: &mut Timers,
    ) -> ServerResult<()> {
        if self.pending_appends.len() >= PENDING_APPENDS_MAX {
            let _ = response.send(Err(ServerError::ServerBusy));
            return Ok(());
        }

        match self.submit_entry(partition, batch_size, data) {
            Ok((index, outputs)) => {
                self.pending_appends.insert(index, Responder::Local(response));
                self.process_outputs(outputs, timers).await
            }
            Err(RaftError::NotLeader { leader_hint }) => {
                let _ = response.send(Err(ServerError::NotLeader { leader_hint }));
                Ok(())
            }
            Err(e) => {
                let _ = response.send(Err(e.into()));
                Ok(())
            }
        }
    }

    fn submit_entry(
        &mut self,
        partition: PartitionId,
        batch_size: u32,
        data: Bytes,
    ) -> Result<(LogIndex, Vec<RaftOutput>), RaftError> {
        // Term and index are assigned by the engine on append.
        let entry = LogEntry::write(TermId::new(0), LogIndex::new(0), partition, batch_size, data);
        self.node.handle_client_entries(vec![entry])
    }

    /// Serves a read: local reads answer immediately from applied state;
    /// linearizable reads go through a heartbeat-confirmed read index.
    async fn handle_client_query(
        &mut self,
        linearizable: bool,
        request: Bytes,
        header: FrameHeader,
        reply: ReplyHandle,
        timers: &mut Timers,
    ) -> ServerResult<()> {
        if !linearizable {
            let result = self.applier.query(&request);
            let response = Frame::response(&header, Status::Ok, String::new(), result);
            self.send_reply(&reply, &response).await;
            return Ok(());
        }

        let read_id = self.next_read_id;
        self.next_read_id = self.next_read_id.next();

        // Register before processing outputs: on a single-voter cluster
        // the engine confirms the read in the same call.
        self.registered_reads
            .insert(read_id, (header, reply, request));
        match self.node.handle_read_request(read_id) {
            Ok(outputs) => self.process_outputs(outputs, timers).await,
            Err(RaftError::NotLeader { leader_hint }) => {
                if let Some((header, reply, _)) = self.registered_reads.remove(&read_id) {
                    let response = Frame::response(
                        &header,
                        Status::NotLeader,
                        "not leader".to_string(),
                        encode_leader(leader_hint),
                    );
                    self.send_reply(&reply, &response).await;
                }
                Ok(())
            }
            Err(e) => {
                if let Some((header, reply, _)) = self.registered_reads.remove(&read_id) {
                    let response =
                        Frame::response(&header, Status::Error, e.to_string(), Bytes::new());
                    self.send_reply(&reply, &response).await;
                }
                Ok(())
            }
        }
    }

    /// Performs engine outputs strictly in emission order.
    async fn process_outputs(
        &mut self,
        outputs: Vec<RaftOutput>,
        timers: &mut Timers,
    ) -> ServerResult<()> {
        for output in outputs {
            match output {
                RaftOutput::SendMessage(message) => self.outgoing.push(message),
                RaftOutput::PersistState(state) => {
                    self.storage.save_state(state).await?;
                }
                RaftOutput::PersistEntries { from_index, entries } => {
                    self.storage.append_entries(from_index, &entries).await?;
                }
                RaftOutput::ResetElectionTimer => {
                    timers.election_deadline =
                        Instant::now() + self.config.timing.random_election_timeout();
                }
                RaftOutput::ResetHeartbeatTimer => {
                    timers.heartbeat.reset();
                }
                RaftOutput::CommitEntry { entry } => {
                    self.apply_committed(entry).await?;
                }
                RaftOutput::RestoreSnapshot(snapshot) => {
                    info!(
                        last_included = %snapshot.last_included_index,
                        "Restoring state machine from snapshot"
                    );
                    self.applier.restore(&snapshot);
                    self.storage.save_snapshot(&snapshot).await?;
                    self.storage.compact(snapshot.last_included_index).await?;
                    self.applied_since_snapshot = 0;
                }
                RaftOutput::BecameLeader => {
                    info!(node = %self.config.node_id, term = %self.node.current_term(), "Became leader");
                }
                RaftOutput::SteppedDown => {
                    warn!(node = %self.config.node_id, "Stepped down from leadership");
                    self.fail_pending_not_leader().await;
                }
                RaftOutput::ReadReady {
                    request_id,
                    read_index,
                } => {
                    if let Some((header, reply, request)) =
                        self.registered_reads.remove(&request_id)
                    {
                        if self.applier.last_applied() >= read_index {
                            let result = self.applier.query(&request);
                            let response =
                                Frame::response(&header, Status::Ok, String::new(), result);
                            self.send_reply(&reply, &response).await;
                        } else {
                            self.waiting_reads.push(WaitingRead {
                                read_index,
                                header,
                                reply,
                                request,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies one committed entry and resolves whatever waits on it.
    async fn apply_committed(&mut self, entry: LogEntry) -> ServerResult<()> {
        let index = entry.index;
        let result = self.applier.apply(&entry);
        self.applied_since_snapshot += 1;

        if let Some(responder) = self.pending_appends.remove(&index) {
            let payload = result.unwrap_or_default();
            match responder {
                Responder::Network { header, reply } => {
                    let response = Frame::response(&header, Status::Ok, String::new(), payload);
                    self.send_reply(&reply, &response).await;
                }
                Responder::Local(tx) => {
                    let _ = tx.send(Ok((index, payload)));
                }
            }
        }

        self.serve_ready_reads().await;
        self.maybe_snapshot().await
    }

    /// Answers queued linearizable reads whose watermark has been applied.
    async fn serve_ready_reads(&mut self) {
        let last_applied = self.applier.last_applied();
        let mut ready = Vec::new();
        self.waiting_reads.retain(|read| {
            if read.read_index <= last_applied {
                ready.push((read.header.clone(), read.reply.clone(), read.request.clone()));
                false
            } else {
                true
            }
        });
        for (header, reply, request) in ready {
            let result = self.applier.query(&request);
            let response = Frame::response(&header, Status::Ok, String::new(), result);
            self.send_reply(&reply, &response).await;
        }
    }

    /// Takes a snapshot and compacts the journal once enough entries have
    /// been applied since the last one.
    async fn maybe_snapshot(&mut self) -> ServerResult<()> {
        let interval = self.config.snapshot_interval_entries;
        if interval == 0 || self.applied_since_snapshot < interval {
            return Ok(());
        }

        let last_applied = self.applier.last_applied();
        let term = self.node.log().term_at(last_applied);
        let snapshot = self.applier.snapshot(term);

        self.storage.save_snapshot(&snapshot).await?;
        self.storage.compact(snapshot.last_included_index).await?;
        self.node.compact_to(snapshot);
        self.applied_since_snapshot = 0;

        debug!(node = %self.config.node_id, %last_applied, "Snapshot taken and journal compacted");
        Ok(())
    }

    /// Fails every pending request with a redirect after losing leadership.
    async fn fail_pending_not_leader(&mut self) {
        let leader_hint = self.node.leader_id();
        for (_, responder) in self.pending_appends.drain() {
            match responder {
                Responder::Network { header, reply } => {
                    let response = Frame::response(
                        &header,
                        Status::NotLeader,
                        "leadership lost".to_string(),
                        encode_leader(leader_hint),
                    );
                    if let Err(e) = reply.send(&response).await {
                        debug!(error = %e, "Failed to send redirect");
                    }
                }
                Responder::Local(tx) => {
                    let _ = tx.send(Err(ServerError::NotLeader { leader_hint }));
                }
            }
        }

        for (_, (header, reply, _)) in self.registered_reads.drain() {
            let response = Frame::response(
                &header,
                Status::NotLeader,
                "leadership lost".to_string(),
                encode_leader(leader_hint),
            );
            let _ = reply.send(&response).await;
        }
        for read in self.waiting_reads.drain(..) {
            let response = Frame::response(
                &read.header,
                Status::NotLeader,
                "leadership lost".to_string(),
                encode_leader(leader_hint),
            );
            let _ = read.reply.send(&response).await;
        }
    }

    async fn send_reply(&self, reply: &ReplyHandle, response: &Frame) {
        if let Err(e) = reply.send(response).await {
            debug!(error = %e, "Failed to send response");
        }
    }

    /// Flushes queued outbound messages after all preceding persistence
    /// has completed.
    async fn flush_outgoing(&mut self, transport: Option<&TransportHandle>) {
        for message in self.outgoing.drain(..) {
            match transport {
                Some(t) => {
                    if let Err(e) = t.send(&message).await {
                        warn!(to = %message.to(), error = %e, "Failed to send message to peer");
                    }
                }
                None => {
                    debug!(to = %message.to(), "Dropping message (no transport)");
                }
            }
        }
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.config.node_id,
            is_leader: self.node.is_leader(),
            leader_id: self.node.leader_id(),
            term: self.node.current_term(),
            commit_index: self.node.commit_index(),
            last_applied: self.applier.last_applied(),
        }
    }
}
