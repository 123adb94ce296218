//! Consensus configuration and cluster membership.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quill_core::limits::{
    CLUSTER_SIZE_MAX, ELECTION_TIMEOUT_MS_MAX, ELECTION_TIMEOUT_MS_MIN, HEARTBEAT_INTERVAL_MS,
};
use quill_core::NodeId;

/// Role of a cluster member.
///
/// Voters participate in elections and count toward quorum. Observers
/// receive replicated entries but never vote and never count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Full consensus participant.
    Voter,
    /// Replication-only participant.
    Observer,
}

/// A member of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    /// The member's node ID.
    pub id: NodeId,
    /// The member's role.
    pub role: Role,
}

impl Member {
    /// Creates a voting member.
    #[must_use]
    pub const fn voter(id: NodeId) -> Self {
        Self {
            id,
            role: Role::Voter,
        }
    }

    /// Creates an observer member.
    #[must_use]
    pub const fn observer(id: NodeId) -> Self {
        Self {
            id,
            role: Role::Observer,
        }
    }
}

/// The active cluster membership, carried in `Configuration` log entries.
///
/// Exactly one configuration is active at any committed index; a new one
/// takes effect when its entry commits. Membership changes are applied one
/// node at a time, so no joint-majority window is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfiguration {
    /// All members, voters and observers.
    pub members: Vec<Member>,
}

impl ClusterConfiguration {
    /// Creates a configuration from a member list.
    #[must_use]
    pub const fn new(members: Vec<Member>) -> Self {
        Self { members }
    }

    /// Encodes the configuration as a log entry payload.
    ///
    /// Format: count (4 bytes) then per member node ID (8 bytes) and role
    /// tag (1 byte). Little-endian.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.members.len() * 9);
        // Safe cast: member count bounded by CLUSTER_SIZE_MAX.
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(self.members.len() as u32);
        for member in &self.members {
            buf.put_u64_le(member.id.get());
            buf.put_u8(match member.role {
                Role::Voter => 0,
                Role::Observer => 1,
            });
        }
        buf.freeze()
    }

    /// Decodes a configuration from a log entry payload.
    ///
    /// Returns `None` if the payload is malformed.
    #[must_use]
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < 4 {
            return None;
        }
        let count = buf.get_u32_le() as usize;
        if count > CLUSTER_SIZE_MAX || buf.len() < count * 9 {
            return None;
        }

        let mut members = Vec::with_capacity(count);
        for _ in 0..count {
            let id = NodeId::new(buf.get_u64_le());
            let role = match buf.get_u8() {
                0 => Role::Voter,
                1 => Role::Observer,
                _ => return None,
            };
            members.push(Member { id, role });
        }
        Some(Self { members })
    }
}

/// Configuration for a consensus node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's ID.
    pub node_id: NodeId,

    /// All cluster members, including this node.
    pub members: Vec<Member>,

    /// Minimum election timeout in milliseconds.
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds.
    pub election_timeout_max_ms: u64,

    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
}

impl RaftConfig {
    /// Creates a configuration for an all-voter cluster.
    ///
    /// # Panics
    /// Panics if the cluster is empty, too large, or this node is absent.
    #[must_use]
    pub fn new(node_id: NodeId, voters: Vec<NodeId>) -> Self {
        let members = voters.into_iter().map(Member::voter).collect();
        Self::with_members(node_id, members)
    }

    /// Creates a configuration from an explicit member list.
    ///
    /// # Panics
    /// Panics if the cluster is empty, too large, or this node is absent.
    #[must_use]
    pub fn with_members(node_id: NodeId, members: Vec<Member>) -> Self {
        assert!(!members.is_empty(), "cluster cannot be empty");
        assert!(
            members.len() <= CLUSTER_SIZE_MAX,
            "cluster size {} exceeds maximum {}",
            members.len(),
            CLUSTER_SIZE_MAX
        );
        assert!(
            members.iter().any(|m| m.id == node_id),
            "node_id must be in cluster"
        );

        Self {
            node_id,
            members,
            election_timeout_min_ms: ELECTION_TIMEOUT_MS_MIN,
            election_timeout_max_ms: ELECTION_TIMEOUT_MS_MAX,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
        }
    }

    /// Returns this node's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.members
            .iter()
            .find(|m| m.id == self.node_id)
            .map_or(Role::Observer, |m| m.role)
    }

    /// Returns the IDs of all voting members.
    #[must_use]
    pub fn voters(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .filter(|m| m.role == Role::Voter)
            .map(|m| m.id)
            .collect()
    }

    /// Returns voting peers (voters excluding this node).
    #[must_use]
    pub fn voter_peers(&self) -> Vec<NodeId> {
        self.voters()
            .into_iter()
            .filter(|&id| id != self.node_id)
            .collect()
    }

    /// Returns all peers that receive replication (voters and observers,
    /// excluding this node).
    #[must_use]
    pub fn replication_peers(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .map(|m| m.id)
            .filter(|&id| id != self.node_id)
            .collect()
    }

    /// Returns the quorum size: a strict majority of voters.
    #[must_use]
    pub fn quorum_size(&self) -> usize {
        self.voters().len() / 2 + 1
    }

    /// Returns true if the given node is a voter.
    #[must_use]
    pub fn is_voter(&self, id: NodeId) -> bool {
        self.members
            .iter()
            .any(|m| m.id == id && m.role == Role::Voter)
    }

    /// Replaces the membership with a newly committed configuration.
    pub fn apply_configuration(&mut self, configuration: ClusterConfiguration) {
        self.members = configuration.members;
    }

    /// Sets a custom election timeout range.
    ///
    /// # Panics
    /// Panics if `min_ms > max_ms`.
    #[must_use]
    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        assert!(min_ms <= max_ms, "min must be <= max");
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.members.is_empty() {
            return Err("cluster cannot be empty");
        }
        if self.members.len() > CLUSTER_SIZE_MAX {
            return Err("cluster too large");
        }
        if !self.members.iter().any(|m| m.id == self.node_id) {
            return Err("node_id not in cluster");
        }
        if self.voters().is_empty() {
            return Err("cluster has no voters");
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err("election timeout min > max");
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err("heartbeat interval must be less than election timeout");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_excludes_observers() {
        let members = vec![
            Member::voter(NodeId::new(1)),
            Member::voter(NodeId::new(2)),
            Member::voter(NodeId::new(3)),
            Member::observer(NodeId::new(4)),
        ];
        let config = RaftConfig::with_members(NodeId::new(1), members);

        assert_eq!(config.quorum_size(), 2);
        assert_eq!(config.voter_peers().len(), 2);
        assert_eq!(config.replication_peers().len(), 3);
        assert!(!config.is_voter(NodeId::new(4)));
    }

    #[test]
    fn test_configuration_roundtrip() {
        let configuration = ClusterConfiguration::new(vec![
            Member::voter(NodeId::new(1)),
            Member::observer(NodeId::new(9)),
        ]);

        let encoded = configuration.encode();
        let decoded = ClusterConfiguration::decode(&encoded).unwrap();
        assert_eq!(decoded, configuration);
    }

    #[test]
    fn test_configuration_decode_rejects_garbage() {
        assert!(ClusterConfiguration::decode(&[1, 2]).is_none());
        // Implausible member count.
        let mut buf = BytesMut::new();
        buf.put_u32_le(u32::MAX);
        assert!(ClusterConfiguration::decode(&buf).is_none());
    }

    #[test]
    #[should_panic(expected = "node_id must be in cluster")]
    fn test_node_not_in_cluster_panics() {
        let _ = RaftConfig::new(NodeId::new(1), vec![NodeId::new(2), NodeId::new(3)]);
    }

    #[test]
    fn test_validate_requires_voters() {
        let config = RaftConfig::with_members(
            NodeId::new(1),
            vec![Member::observer(NodeId::new(1))],
        );
        assert_eq!(config.validate(), Err("cluster has no voters"));
    }
}
