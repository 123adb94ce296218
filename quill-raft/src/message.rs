//! Consensus RPC message types.

use quill_core::{LogIndex, NodeId, RequestId, TermId};

use crate::log::LogEntry;
use crate::snapshot::Snapshot;

/// Messages exchanged between consensus nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Vote request from a candidate.
    RequestVote(RequestVoteRequest),
    /// Response to a vote request.
    RequestVoteResponse(RequestVoteResponse),
    /// Log replication from the leader (empty entries is a heartbeat).
    AppendEntries(AppendEntriesRequest),
    /// Response to a replication request.
    AppendEntriesResponse(AppendEntriesResponse),
    /// Full-state transfer to a follower too far behind for prefix retry.
    InstallSnapshot(InstallSnapshotRequest),
    /// Acknowledgment of a snapshot install.
    InstallSnapshotResponse(InstallSnapshotResponse),
}

impl Message {
    /// Returns the sender of this message.
    #[must_use]
    pub const fn from(&self) -> NodeId {
        match self {
            Self::RequestVote(r) => r.candidate_id,
            Self::RequestVoteResponse(r) => r.from,
            Self::AppendEntries(r) => r.leader_id,
            Self::AppendEntriesResponse(r) => r.from,
            Self::InstallSnapshot(r) => r.leader_id,
            Self::InstallSnapshotResponse(r) => r.from,
        }
    }

    /// Returns the destination of this message.
    #[must_use]
    pub const fn to(&self) -> NodeId {
        match self {
            Self::RequestVote(r) => r.to,
            Self::RequestVoteResponse(r) => r.to,
            Self::AppendEntries(r) => r.to,
            Self::AppendEntriesResponse(r) => r.to,
            Self::InstallSnapshot(r) => r.to,
            Self::InstallSnapshotResponse(r) => r.to,
        }
    }

    /// Returns the term carried by this message.
    #[must_use]
    pub const fn term(&self) -> TermId {
        match self {
            Self::RequestVote(r) => r.term,
            Self::RequestVoteResponse(r) => r.term,
            Self::AppendEntries(r) => r.term,
            Self::AppendEntriesResponse(r) => r.term,
            Self::InstallSnapshot(r) => r.term,
            Self::InstallSnapshotResponse(r) => r.term,
        }
    }
}

/// Vote request sent by candidates during elections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: TermId,
    /// Candidate requesting the vote.
    pub candidate_id: NodeId,
    /// Target node.
    pub to: NodeId,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: TermId,
}

impl RequestVoteRequest {
    /// Creates a vote request.
    #[must_use]
    pub const fn new(
        term: TermId,
        candidate_id: NodeId,
        to: NodeId,
        last_log_index: LogIndex,
        last_log_term: TermId,
    ) -> Self {
        Self {
            term,
            candidate_id,
            to,
            last_log_index,
            last_log_term,
        }
    }
}

/// Vote response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVoteResponse {
    /// Voter's current term.
    pub term: TermId,
    /// The voter.
    pub from: NodeId,
    /// The candidate.
    pub to: NodeId,
    /// True if the vote was granted.
    pub vote_granted: bool,
}

impl RequestVoteResponse {
    /// Creates a vote response.
    #[must_use]
    pub const fn new(term: TermId, from: NodeId, to: NodeId, vote_granted: bool) -> Self {
        Self {
            term,
            from,
            to,
            vote_granted,
        }
    }
}

/// Replication request from the leader; doubles as the heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: TermId,
    /// The leader.
    pub leader_id: NodeId,
    /// Target follower.
    pub to: NodeId,
    /// Index of the entry immediately preceding the shipped ones.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: TermId,
    /// Entries to replicate (empty for heartbeat).
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// Creates a replication request.
    #[must_use]
    pub const fn new(
        term: TermId,
        leader_id: NodeId,
        to: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: TermId,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> Self {
        Self {
            term,
            leader_id,
            to,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        }
    }

    /// Returns true if this request carries no entries.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Replication response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    /// Responder's current term.
    pub term: TermId,
    /// The responder.
    pub from: NodeId,
    /// The leader.
    pub to: NodeId,
    /// True if the consistency check passed and entries were stored.
    pub success: bool,
    /// The responder's last log index, for next-index tracking.
    pub match_index: LogIndex,
}

impl AppendEntriesResponse {
    /// Creates a replication response.
    #[must_use]
    pub const fn new(
        term: TermId,
        from: NodeId,
        to: NodeId,
        success: bool,
        match_index: LogIndex,
    ) -> Self {
        Self {
            term,
            from,
            to,
            success,
            match_index,
        }
    }
}

/// Snapshot transfer to a follower whose next index was compacted away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshotRequest {
    /// Leader's term.
    pub term: TermId,
    /// The leader.
    pub leader_id: NodeId,
    /// Target follower.
    pub to: NodeId,
    /// The snapshot to install.
    pub snapshot: Snapshot,
}

/// Acknowledgment of a snapshot install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallSnapshotResponse {
    /// Responder's current term.
    pub term: TermId,
    /// The responder.
    pub from: NodeId,
    /// The leader.
    pub to: NodeId,
    /// Last index now covered by the responder's log.
    pub match_index: LogIndex,
}

/// A client read registered with the leader; completes once leadership is
/// confirmed by a heartbeat round and the read index is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    /// Correlates the completion back to the waiting caller.
    pub request_id: RequestId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_accessors() {
        let req = RequestVoteRequest::new(
            TermId::new(3),
            NodeId::new(1),
            NodeId::new(2),
            LogIndex::new(0),
            TermId::new(0),
        );
        let msg = Message::RequestVote(req);

        assert_eq!(msg.from(), NodeId::new(1));
        assert_eq!(msg.to(), NodeId::new(2));
        assert_eq!(msg.term(), TermId::new(3));
    }

    #[test]
    fn test_heartbeat_has_no_entries() {
        let req = AppendEntriesRequest::new(
            TermId::new(1),
            NodeId::new(1),
            NodeId::new(2),
            LogIndex::new(0),
            TermId::new(0),
            Vec::new(),
            LogIndex::new(0),
        );
        assert!(req.is_heartbeat());
    }
}
