//! The consensus state machine.
//!
//! [`RaftNode`] is pure: it consumes timer events, messages, and client
//! requests, and emits [`RaftOutput`] actions for the runtime to perform
//! (send a message, persist state, apply a committed entry). No I/O
//! happens here, which keeps elections and replication deterministic and
//! directly testable.
//!
//! Output order is significant: persistence outputs precede the message
//! sends that depend on them, and the runtime must honor that order (a
//! vote must be durable before the response leaves the node).

use std::collections::{HashMap, HashSet};

use quill_core::limits::APPEND_ENTRIES_BATCH_MAX;
use quill_core::{LogIndex, NodeId, RequestId, TermId};
use tracing::{debug, info, warn};

use crate::config::{ClusterConfiguration, RaftConfig, Role};
use crate::error::{RaftError, RaftResult};
use crate::log::{EntryKind, LogEntry, RaftLog};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    Message, RequestVoteRequest, RequestVoteResponse,
};
use crate::snapshot::Snapshot;
use crate::storage::PersistentState;

/// Consensus role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RaftState {
    /// Passive; responds to RPCs and waits for heartbeats.
    #[default]
    Follower,
    /// Actively seeking votes.
    Candidate,
    /// Handles client writes and drives replication.
    Leader,
}

/// Actions the runtime must perform on behalf of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftOutput {
    /// Send a message to another node.
    SendMessage(Message),
    /// Durably persist the term/vote record before sending any message
    /// that follows this output.
    PersistState(PersistentState),
    /// Durably truncate the log after `from_index - 1` and append the
    /// given entries.
    PersistEntries {
        /// First index of the appended entries.
        from_index: LogIndex,
        /// The entries to persist.
        entries: Vec<LogEntry>,
    },
    /// Restart the election timer with a fresh randomized timeout.
    ResetElectionTimer,
    /// Restart the heartbeat timer.
    ResetHeartbeatTimer,
    /// A committed entry ready for the state machine executor, emitted
    /// strictly in index order.
    CommitEntry {
        /// The committed entry.
        entry: LogEntry,
    },
    /// Replace local state machine state with the snapshot's.
    RestoreSnapshot(Snapshot),
    /// This node won an election.
    BecameLeader,
    /// This node lost leadership.
    SteppedDown,
    /// A registered linearizable read is safe to serve once the state
    /// machine has applied through `read_index`.
    ReadReady {
        /// The read this completes.
        request_id: RequestId,
        /// Apply watermark the read must observe.
        read_index: LogIndex,
    },
}

/// A linearizable read awaiting a heartbeat round.
#[derive(Debug)]
struct PendingRead {
    request_id: RequestId,
    read_index: LogIndex,
    acks: HashSet<NodeId>,
}

/// A consensus node.
///
/// Pure state machine: inputs in, outputs out, no I/O.
#[derive(Debug)]
pub struct RaftNode {
    config: RaftConfig,

    // Persistent state, mirrored to storage through outputs.
    current_term: TermId,
    voted_for: Option<NodeId>,
    log: RaftLog,
    snapshot: Snapshot,

    // Volatile state.
    state: RaftState,
    commit_index: LogIndex,
    last_applied: LogIndex,
    leader_id: Option<NodeId>,

    // Leader state, reinitialized on election.
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,

    // Candidate state.
    votes_received: HashSet<NodeId>,

    // Leader read-index tracking.
    pending_reads: Vec<PendingRead>,
}

impl RaftNode {
    /// Creates a fresh node (term 0, empty log).
    #[must_use]
    pub fn new(config: RaftConfig) -> Self {
        Self::restore(config, PersistentState::new(), Vec::new(), None)
    }

    /// Restores a node from persisted state.
    ///
    /// `entries` are the retained log entries in index order; `snapshot`
    /// is the latest durable snapshot if any. The commit and apply
    /// watermarks restart at the snapshot boundary: everything beyond it
    /// is re-proven by the next leader's replication.
    #[must_use]
    pub fn restore(
        config: RaftConfig,
        state: PersistentState,
        entries: Vec<LogEntry>,
        snapshot: Option<Snapshot>,
    ) -> Self {
        let snapshot = snapshot.unwrap_or_else(Snapshot::empty);
        let mut log = RaftLog::new();
        if !snapshot.is_empty() {
            log.install_snapshot(snapshot.last_included_index, snapshot.last_included_term);
        }
        let prefix = log.prefix_index();
        let prefix_term = log.term_at(prefix);
        if !entries.is_empty() {
            // Entries come from our own storage; a mismatch here means the
            // persisted log and snapshot disagree, which restore treats as
            // absent data rather than guessing.
            if log.append_as_follower(prefix, prefix_term, entries).is_err() {
                warn!("Persisted entries inconsistent with snapshot, discarding suffix");
            }
        }

        let commit_index = snapshot.last_included_index;
        Self {
            config,
            current_term: state.current_term,
            voted_for: state.voted_for,
            log,
            snapshot,
            state: RaftState::Follower,
            commit_index,
            last_applied: commit_index,
            leader_id: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: HashSet::new(),
            pending_reads: Vec::new(),
        }
    }

    /// Returns this node's ID.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Returns the current term.
    #[must_use]
    pub const fn current_term(&self) -> TermId {
        self.current_term
    }

    /// Returns the current role.
    #[must_use]
    pub const fn state(&self) -> RaftState {
        self.state
    }

    /// Returns true if this node is the leader.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.state == RaftState::Leader
    }

    /// Returns the current leader if known.
    #[must_use]
    pub const fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    /// Returns the commit index.
    #[must_use]
    pub const fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Returns the last applied index.
    #[must_use]
    pub const fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Returns the log.
    #[must_use]
    pub const fn log(&self) -> &RaftLog {
        &self.log
    }

    /// Returns the active configuration.
    #[must_use]
    pub const fn config(&self) -> &RaftConfig {
        &self.config
    }

    /// Returns the current term/vote record.
    #[must_use]
    pub const fn persistent_state(&self) -> PersistentState {
        PersistentState::with_values(self.current_term, self.voted_for)
    }

    /// Adopts a freshly taken snapshot and compacts the log behind it.
    ///
    /// Called by the runtime after it has made the snapshot durable.
    pub fn compact_to(&mut self, snapshot: Snapshot) {
        debug_assert!(snapshot.last_included_index <= self.last_applied);

        let term = self.log.term_at(snapshot.last_included_index);
        self.log.install_snapshot(snapshot.last_included_index, term);
        info!(
            last_included = %snapshot.last_included_index,
            "Compacted log behind snapshot"
        );
        self.snapshot = snapshot;
    }

    /// Handles an election timeout.
    ///
    /// Observers never start elections; leaders ignore the timer.
    pub fn handle_election_timeout(&mut self) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();

        if self.state == RaftState::Leader || self.config.role() == Role::Observer {
            return outputs;
        }

        let prev_term = self.current_term;
        self.current_term = TermId::new(self.current_term.get() + 1);
        self.state = RaftState::Candidate;
        self.voted_for = Some(self.config.node_id);
        self.votes_received.clear();
        self.votes_received.insert(self.config.node_id);
        self.leader_id = None;

        debug_assert!(self.current_term.get() == prev_term.get() + 1);

        info!(term = %self.current_term, "Starting election");

        // The self-vote must be durable before any vote request leaves.
        outputs.push(RaftOutput::PersistState(self.persistent_state()));
        outputs.push(RaftOutput::ResetElectionTimer);

        for peer in self.config.voter_peers() {
            let request = RequestVoteRequest::new(
                self.current_term,
                self.config.node_id,
                peer,
                self.log.last_index(),
                self.log.last_term(),
            );
            outputs.push(RaftOutput::SendMessage(Message::RequestVote(request)));
        }

        // Single-voter cluster: quorum is already met.
        if self.votes_received.len() >= self.config.quorum_size() {
            outputs.extend(self.become_leader());
        }

        outputs
    }

    /// Handles a heartbeat timeout (leader only).
    pub fn handle_heartbeat_timeout(&mut self) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();
        if self.state != RaftState::Leader {
            return outputs;
        }

        for peer in self.config.replication_peers() {
            outputs.extend(self.replicate_to(peer));
        }
        outputs.push(RaftOutput::ResetHeartbeatTimer);
        outputs
    }

    /// Handles a client write: appends the entries in the leader's term
    /// and starts replication.
    ///
    /// Returns the index of the last appended entry.
    ///
    /// # Errors
    /// Returns `NotLeader` with a leader hint if this node cannot accept
    /// writes.
    pub fn handle_client_entries(
        &mut self,
        entries: Vec<LogEntry>,
    ) -> RaftResult<(LogIndex, Vec<RaftOutput>)> {
        if self.state != RaftState::Leader {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader_id,
            });
        }

        let from_index = self.log.last_index().next();
        let last = self.log.append_as_leader(self.current_term, entries);
        let appended = self.log.entries_from(from_index, usize::MAX);

        let mut outputs = vec![RaftOutput::PersistEntries {
            from_index,
            entries: appended,
        }];
        for peer in self.config.replication_peers() {
            outputs.extend(self.replicate_to(peer));
        }
        outputs.extend(self.try_advance_commit_index());

        Ok((last, outputs))
    }

    /// Registers a linearizable read.
    ///
    /// The read completes via [`RaftOutput::ReadReady`] once a quorum of
    /// voters has acknowledged this node's leadership at or after the
    /// current commit index. The caller then waits for the apply
    /// watermark to reach the read index before answering.
    ///
    /// # Errors
    /// Returns `NotLeader` if this node is not the leader.
    pub fn handle_read_request(&mut self, request_id: RequestId) -> RaftResult<Vec<RaftOutput>> {
        if self.state != RaftState::Leader {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader_id,
            });
        }

        let read_index = self.commit_index;
        let mut acks = HashSet::new();
        if self.config.is_voter(self.config.node_id) {
            acks.insert(self.config.node_id);
        }

        if acks.len() >= self.config.quorum_size() {
            return Ok(vec![RaftOutput::ReadReady {
                request_id,
                read_index,
            }]);
        }

        self.pending_reads.push(PendingRead {
            request_id,
            read_index,
            acks,
        });

        // Confirm leadership with an immediate heartbeat round.
        let mut outputs = Vec::new();
        for peer in self.config.voter_peers() {
            outputs.extend(self.replicate_to(peer));
        }
        Ok(outputs)
    }

    /// Handles an incoming message.
    pub fn handle_message(&mut self, message: Message) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();

        if message.term() > self.current_term {
            outputs.extend(self.step_down(message.term()));
        }

        let handled = match message {
            Message::RequestVote(req) => self.handle_request_vote(&req),
            Message::RequestVoteResponse(resp) => self.handle_request_vote_response(&resp),
            Message::AppendEntries(req) => self.handle_append_entries(req),
            Message::AppendEntriesResponse(resp) => self.handle_append_entries_response(&resp),
            Message::InstallSnapshot(req) => self.handle_install_snapshot(req),
            Message::InstallSnapshotResponse(resp) => {
                self.handle_install_snapshot_response(&resp)
            }
        };
        outputs.extend(handled);
        outputs
    }

    /// Steps down to follower in a (possibly) newer term.
    fn step_down(&mut self, new_term: TermId) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();
        let was_leader = self.state == RaftState::Leader;

        debug!(from = %self.current_term, to = %new_term, "Stepping down");

        self.current_term = new_term;
        self.state = RaftState::Follower;
        self.voted_for = None;
        self.votes_received.clear();
        // Reads registered under the old leadership can never be served.
        self.pending_reads.clear();

        outputs.push(RaftOutput::PersistState(self.persistent_state()));
        if was_leader {
            outputs.push(RaftOutput::SteppedDown);
        }
        outputs
    }

    fn handle_request_vote(&mut self, req: &RequestVoteRequest) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();

        let grant = req.term >= self.current_term
            && self.voted_for.map_or(true, |id| id == req.candidate_id)
            && self.log.is_up_to_date(req.last_log_term, req.last_log_index);

        if grant {
            self.voted_for = Some(req.candidate_id);
            // The vote must be durable before the response leaves.
            outputs.push(RaftOutput::PersistState(self.persistent_state()));
            outputs.push(RaftOutput::ResetElectionTimer);
        }

        debug!(candidate = %req.candidate_id, term = %req.term, grant, "Vote request");

        let response = RequestVoteResponse::new(
            self.current_term,
            self.config.node_id,
            req.candidate_id,
            grant,
        );
        outputs.push(RaftOutput::SendMessage(Message::RequestVoteResponse(
            response,
        )));
        outputs
    }

    fn handle_request_vote_response(&mut self, resp: &RequestVoteResponse) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();
        if self.state != RaftState::Candidate || resp.term != self.current_term {
            return outputs;
        }

        // Only voter votes count toward quorum.
        if resp.vote_granted && self.config.is_voter(resp.from) {
            self.votes_received.insert(resp.from);
            if self.votes_received.len() >= self.config.quorum_size() {
                outputs.extend(self.become_leader());
            }
        }
        outputs
    }

    fn become_leader(&mut self) -> Vec<RaftOutput> {
        debug_assert!(self.votes_received.len() >= self.config.quorum_size());

        self.state = RaftState::Leader;
        self.leader_id = Some(self.config.node_id);

        let next = self.log.last_index().next();
        for peer in self.config.replication_peers() {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, LogIndex::new(0));
        }

        info!(term = %self.current_term, "Won election");

        let mut outputs = vec![RaftOutput::BecameLeader, RaftOutput::ResetHeartbeatTimer];

        // Barrier entry: prior-term entries become committable only once a
        // current-term entry is replicated.
        let from_index = self.log.last_index().next();
        let barrier = LogEntry::noop(self.current_term, from_index);
        self.log
            .append_as_leader(self.current_term, vec![barrier.clone()]);
        outputs.push(RaftOutput::PersistEntries {
            from_index,
            entries: vec![barrier],
        });

        for peer in self.config.replication_peers() {
            outputs.extend(self.replicate_to(peer));
        }
        outputs.extend(self.try_advance_commit_index());
        outputs
    }

    fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();

        if req.term < self.current_term {
            outputs.push(self.append_response(req.leader_id, false, self.log.last_index()));
            return outputs;
        }

        if self.state == RaftState::Candidate {
            self.state = RaftState::Follower;
            self.votes_received.clear();
        }
        self.leader_id = Some(req.leader_id);
        outputs.push(RaftOutput::ResetElectionTimer);

        let from_index = req.prev_log_index.next();
        // The index this request proves replicated through, independent of
        // any stale suffix the follower may still retain.
        let covered = LogIndex::new(req.prev_log_index.get() + req.entries.len() as u64);
        let entries = req.entries;
        match self
            .log
            .append_as_follower(req.prev_log_index, req.prev_log_term, entries.clone())
        {
            Ok(_) => {
                if !entries.is_empty() {
                    outputs.push(RaftOutput::PersistEntries {
                        from_index,
                        entries,
                    });
                }

                if req.leader_commit > self.commit_index {
                    let new_commit = req.leader_commit.min(self.log.last_index());
                    outputs.extend(self.apply_committed(new_commit));
                }

                outputs.push(self.append_response(req.leader_id, true, covered));
            }
            Err(e) => {
                debug!(error = %e, "Append consistency check failed");
                outputs.push(self.append_response(req.leader_id, false, self.log.last_index()));
            }
        }
        outputs
    }

    fn append_response(&self, to: NodeId, success: bool, match_index: LogIndex) -> RaftOutput {
        RaftOutput::SendMessage(Message::AppendEntriesResponse(AppendEntriesResponse::new(
            self.current_term,
            self.config.node_id,
            to,
            success,
            match_index,
        )))
    }

    fn handle_append_entries_response(&mut self, resp: &AppendEntriesResponse) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();
        if self.state != RaftState::Leader || resp.term != self.current_term {
            return outputs;
        }

        if resp.success {
            // Heartbeat acks can report an older watermark; match never
            // moves backwards.
            let matched = self
                .match_index
                .get(&resp.from)
                .copied()
                .unwrap_or_default()
                .max(resp.match_index);
            self.match_index.insert(resp.from, matched);
            self.next_index.insert(resp.from, matched.next());

            outputs.extend(self.acknowledge_reads(resp.from));
            outputs.extend(self.try_advance_commit_index());
        } else {
            // Back up: retry with an earlier prefix, bounded below by the
            // follower's reported last index.
            let next = self
                .next_index
                .get(&resp.from)
                .copied()
                .unwrap_or(LogIndex::new(1));
            let backed = LogIndex::new(next.get().saturating_sub(1).max(1))
                .min(resp.match_index.next());
            self.next_index.insert(resp.from, backed);

            outputs.extend(self.replicate_to(resp.from));
        }
        outputs
    }

    /// Records a heartbeat acknowledgment against pending reads and
    /// completes those confirmed by a quorum.
    fn acknowledge_reads(&mut self, from: NodeId) -> Vec<RaftOutput> {
        if self.pending_reads.is_empty() || !self.config.is_voter(from) {
            return Vec::new();
        }

        let quorum = self.config.quorum_size();
        let mut outputs = Vec::new();
        for read in &mut self.pending_reads {
            read.acks.insert(from);
        }
        self.pending_reads.retain(|read| {
            if read.acks.len() >= quorum {
                outputs.push(RaftOutput::ReadReady {
                    request_id: read.request_id,
                    read_index: read.read_index,
                });
                false
            } else {
                true
            }
        });
        outputs
    }

    /// Ships entries (or a snapshot) to one peer.
    fn replicate_to(&self, peer: NodeId) -> Vec<RaftOutput> {
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(LogIndex::new(1));

        // The needed prefix is gone: fall back to snapshot transfer.
        if next <= self.log.prefix_index() && !self.snapshot.is_empty() {
            debug!(%peer, %next, "Next index compacted away, sending snapshot");
            return vec![RaftOutput::SendMessage(Message::InstallSnapshot(
                InstallSnapshotRequest {
                    term: self.current_term,
                    leader_id: self.config.node_id,
                    to: peer,
                    snapshot: self.snapshot.clone(),
                },
            ))];
        }

        let prev_index = LogIndex::new(next.get().saturating_sub(1));
        let prev_term = self.log.term_at(prev_index);
        let entries = self
            .log
            .entries_from(next, APPEND_ENTRIES_BATCH_MAX as usize);

        vec![RaftOutput::SendMessage(Message::AppendEntries(
            AppendEntriesRequest::new(
                self.current_term,
                self.config.node_id,
                peer,
                prev_index,
                prev_term,
                entries,
                self.commit_index,
            ),
        ))]
    }

    fn handle_install_snapshot(&mut self, req: InstallSnapshotRequest) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();

        if req.term < self.current_term {
            outputs.push(self.install_snapshot_response(req.leader_id));
            return outputs;
        }

        if self.state == RaftState::Candidate {
            self.state = RaftState::Follower;
            self.votes_received.clear();
        }
        self.leader_id = Some(req.leader_id);
        outputs.push(RaftOutput::ResetElectionTimer);

        let snapshot = req.snapshot;
        if !snapshot.verify_checksum() {
            warn!(leader = %req.leader_id, "Rejecting snapshot with bad checksum");
            outputs.push(self.install_snapshot_response(req.leader_id));
            return outputs;
        }

        if snapshot.last_included_index > self.commit_index {
            info!(
                last_included = %snapshot.last_included_index,
                "Installing snapshot"
            );
            self.log
                .install_snapshot(snapshot.last_included_index, snapshot.last_included_term);
            self.commit_index = snapshot.last_included_index;
            self.last_applied = snapshot.last_included_index;
            self.snapshot = snapshot.clone();
            outputs.push(RaftOutput::RestoreSnapshot(snapshot));
        }

        outputs.push(self.install_snapshot_response(req.leader_id));
        outputs
    }

    fn install_snapshot_response(&self, to: NodeId) -> RaftOutput {
        RaftOutput::SendMessage(Message::InstallSnapshotResponse(InstallSnapshotResponse {
            term: self.current_term,
            from: self.config.node_id,
            to,
            match_index: self.log.last_index(),
        }))
    }

    fn handle_install_snapshot_response(
        &mut self,
        resp: &InstallSnapshotResponse,
    ) -> Vec<RaftOutput> {
        if self.state != RaftState::Leader || resp.term != self.current_term {
            return Vec::new();
        }

        self.match_index.insert(resp.from, resp.match_index);
        self.next_index.insert(resp.from, resp.match_index.next());
        self.try_advance_commit_index()
    }

    /// Advances the commit index to the highest current-term entry
    /// replicated to a majority of voters.
    fn try_advance_commit_index(&mut self) -> Vec<RaftOutput> {
        if self.state != RaftState::Leader {
            return Vec::new();
        }

        let prev_commit = self.commit_index;
        let mut outputs = Vec::new();

        for n in (self.commit_index.get() + 1)..=self.log.last_index().get() {
            let idx = LogIndex::new(n);

            // Prior-term entries are never committed directly; they commit
            // as a side effect of a current-term entry above them.
            if self.log.term_at(idx) != self.current_term {
                continue;
            }

            let mut count = usize::from(self.config.is_voter(self.config.node_id));
            for voter in self.config.voter_peers() {
                if self.match_index.get(&voter).copied().unwrap_or_default() >= idx {
                    count += 1;
                }
            }

            if count >= self.config.quorum_size() {
                outputs.extend(self.apply_committed(idx));
            }
        }

        debug_assert!(self.commit_index >= prev_commit);
        outputs
    }

    /// Raises the commit index and emits apply outputs in index order.
    fn apply_committed(&mut self, new_commit: LogIndex) -> Vec<RaftOutput> {
        debug_assert!(new_commit <= self.log.last_index());

        let mut outputs = Vec::new();
        if new_commit <= self.commit_index {
            return outputs;
        }
        self.commit_index = new_commit;

        while self.last_applied < self.commit_index {
            let idx = self.last_applied.next();
            if let Some(entry) = self.log.get(idx) {
                let entry = entry.clone();
                if entry.kind == EntryKind::Configuration {
                    if let Some(configuration) = ClusterConfiguration::decode(&entry.payload) {
                        info!(members = configuration.members.len(), "Applying configuration");
                        self.config.apply_configuration(configuration);
                    } else {
                        warn!(index = %idx, "Undecodable configuration entry, keeping membership");
                    }
                }
                outputs.push(RaftOutput::CommitEntry { entry });
            }
            self.last_applied = idx;
        }

        debug_assert!(self.last_applied == self.commit_index);
        outputs
    }
}
