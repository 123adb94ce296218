//! Node runtime configuration.
//!
//! Explicit validated structs with documented defaults. Operator-facing
//! key/value properties bind to named fields; unknown keys are reported
//! with a warning, never silently ignored.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use quill_core::limits::{
    ELECTION_TIMEOUT_MS_MAX, ELECTION_TIMEOUT_MS_MIN, HEARTBEAT_INTERVAL_MS,
};
use quill_core::NodeId;
use thiserror::Error;
use tracing::warn;

use crate::transport::TransportConfig;

/// Default snapshot interval in applied entries (0 disables snapshots).
pub const SNAPSHOT_INTERVAL_ENTRIES_DEFAULT: u64 = 10_000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A timing constraint is violated.
    #[error("invalid timing: {message}")]
    InvalidTiming {
        /// What is wrong.
        message: String,
    },

    /// A property value failed to parse.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// The property key.
        key: String,
        /// The rejected value.
        value: String,
    },

    /// A peer entry is malformed.
    #[error("invalid peer: {message}")]
    InvalidPeer {
        /// What is wrong.
        message: String,
    },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// A peer node in the cluster.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Peer's node ID.
    pub node_id: NodeId,
    /// Peer's address, resolved at connect time.
    pub addr: String,
}

impl PeerConfig {
    /// Creates a new peer configuration.
    #[must_use]
    pub fn new(node_id: NodeId, addr: impl Into<String>) -> Self {
        Self {
            node_id,
            addr: addr.into(),
        }
    }
}

/// Consensus timing configuration.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Minimum randomized election timeout.
    pub election_timeout_min: Duration,
    /// Maximum randomized election timeout.
    pub election_timeout_max: Duration,
    /// Leader heartbeat interval.
    pub heartbeat_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(ELECTION_TIMEOUT_MS_MIN),
            election_timeout_max: Duration::from_millis(2 * ELECTION_TIMEOUT_MS_MIN),
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
        }
    }
}

impl TimingConfig {
    /// Timing suitable for tests: fast elections, fast heartbeats.
    #[must_use]
    pub const fn fast_for_testing() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(50),
            election_timeout_max: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(20),
        }
    }

    /// Validates the timing configuration.
    ///
    /// # Errors
    /// Returns an error if the range is inverted, out of bounds, or the
    /// heartbeat is not comfortably shorter than the election timeout.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.election_timeout_max < self.election_timeout_min {
            return Err(ConfigError::InvalidTiming {
                message: "election_timeout_max must be >= election_timeout_min".to_string(),
            });
        }
        let min_ms = self.election_timeout_min.as_millis();
        let max_ms = self.election_timeout_max.as_millis();
        if min_ms < u128::from(ELECTION_TIMEOUT_MS_MIN) / 3
            || max_ms > u128::from(ELECTION_TIMEOUT_MS_MAX)
        {
            return Err(ConfigError::InvalidTiming {
                message: format!("election timeout [{min_ms}ms, {max_ms}ms] out of bounds"),
            });
        }
        if self.election_timeout_min <= self.heartbeat_interval * 2 {
            return Err(ConfigError::InvalidTiming {
                message: "election_timeout_min must be > 2x heartbeat_interval".to_string(),
            });
        }
        Ok(())
    }

    /// Picks a fresh randomized election timeout within the range.
    #[must_use]
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;

        // Safe cast: bounds are validated to fit in u64 milliseconds.
        #[allow(clippy::cast_possible_truncation)]
        let min_ms = self.election_timeout_min.as_millis() as u64;
        #[allow(clippy::cast_possible_truncation)]
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(ms)
    }
}

/// Configuration for one node of the replicated journal.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's unique identifier.
    pub node_id: NodeId,
    /// Address to bind for peer and client connections.
    pub listen_addr: SocketAddr,
    /// Other cluster members.
    pub peers: Vec<PeerConfig>,
    /// Root of the node's durable state (journal segments, term/vote
    /// record, snapshot file).
    pub data_dir: PathBuf,
    /// Consensus timing.
    pub timing: TimingConfig,
    /// Take a snapshot every this many applied entries; 0 disables.
    pub snapshot_interval_entries: u64,
    /// Storage tuning properties passed through to the journal layer.
    pub storage_properties: BTreeMap<String, String>,
}

impl NodeConfig {
    /// Creates a configuration with default tuning.
    #[must_use]
    pub fn new(node_id: NodeId, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            peers: Vec::new(),
            data_dir: PathBuf::from("data"),
            timing: TimingConfig::default(),
            snapshot_interval_entries: SNAPSHOT_INTERVAL_ENTRIES_DEFAULT,
            storage_properties: BTreeMap::new(),
        }
    }

    /// Sets the peer list.
    #[must_use]
    pub fn with_peers(mut self, peers: Vec<PeerConfig>) -> Self {
        self.peers = peers;
        self
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Sets the timing configuration.
    #[must_use]
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Sets the snapshot interval in applied entries.
    #[must_use]
    pub const fn with_snapshot_interval(mut self, entries: u64) -> Self {
        self.snapshot_interval_entries = entries;
        self
    }

    /// Applies operator-supplied properties over the current values.
    ///
    /// Recognized keys: `election.timeout.min.ms`, `election.timeout.max.ms`,
    /// `heartbeat.interval.ms`, `snapshot.interval.entries`. Keys with a
    /// `journal.` prefix are collected for the journal layer; anything else
    /// is reported with a warning and left unapplied.
    ///
    /// # Errors
    /// Returns an error if a recognized value does not parse or the
    /// resulting configuration fails validation.
    pub fn apply_properties(
        mut self,
        properties: &BTreeMap<String, String>,
    ) -> ConfigResult<Self> {
        for (key, value) in properties {
            let parse_ms = || {
                value.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                    key: key.clone(),
                    value: value.clone(),
                })
            };
            match key.as_str() {
                "election.timeout.min.ms" => {
                    self.timing.election_timeout_min = Duration::from_millis(parse_ms()?);
                }
                "election.timeout.max.ms" => {
                    self.timing.election_timeout_max = Duration::from_millis(parse_ms()?);
                }
                "heartbeat.interval.ms" => {
                    self.timing.heartbeat_interval = Duration::from_millis(parse_ms()?);
                }
                "snapshot.interval.entries" => {
                    self.snapshot_interval_entries = parse_ms()?;
                }
                _ if key.starts_with("journal.") => {
                    self.storage_properties.insert(key.clone(), value.clone());
                }
                _ => warn!(key, "Unknown node property, ignoring"),
            }
        }

        self.validate()?;
        Ok(self)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error on bad timing or duplicate peer IDs.
    pub fn validate(&self) -> ConfigResult<()> {
        self.timing.validate()?;

        let mut seen = std::collections::HashSet::new();
        for peer in &self.peers {
            if peer.node_id == self.node_id {
                return Err(ConfigError::InvalidPeer {
                    message: format!("peer list contains this node ({})", self.node_id),
                });
            }
            if !seen.insert(peer.node_id) {
                return Err(ConfigError::InvalidPeer {
                    message: format!("duplicate peer {}", peer.node_id),
                });
            }
        }
        Ok(())
    }

    /// Returns all cluster voter IDs including this node, sorted.
    #[must_use]
    pub fn cluster_nodes(&self) -> Vec<NodeId> {
        let mut nodes = vec![self.node_id];
        nodes.extend(self.peers.iter().map(|p| p.node_id));
        nodes.sort_by_key(|n| n.get());
        nodes
    }

    /// Builds the transport configuration for this node.
    #[must_use]
    pub fn transport_config(&self) -> TransportConfig {
        let mut config = TransportConfig::new(self.node_id, self.listen_addr);
        for peer in &self.peers {
            config = config.with_peer(peer.node_id, peer.addr.clone());
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> NodeConfig {
        NodeConfig::new(NodeId::new(1), "127.0.0.1:9001".parse().unwrap()).with_peers(vec![
            PeerConfig::new(NodeId::new(2), "127.0.0.1:9002"),
            PeerConfig::new(NodeId::new(3), "127.0.0.1:9003"),
        ])
    }

    #[test]
    fn test_default_timing_is_valid() {
        assert!(TimingConfig::default().validate().is_ok());
        assert!(TimingConfig::fast_for_testing().validate().is_ok());
    }

    #[test]
    fn test_inverted_election_range_rejected() {
        let timing = TimingConfig {
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(200),
            ..Default::default()
        };
        assert!(timing.validate().is_err());
    }

    #[test]
    fn test_random_timeout_within_range() {
        let timing = TimingConfig::default();
        for _ in 0..100 {
            let t = timing.random_election_timeout();
            assert!(t >= timing.election_timeout_min);
            assert!(t <= timing.election_timeout_max);
        }
    }

    #[test]
    fn test_cluster_nodes_sorted_with_self() {
        let nodes = base().cluster_nodes();
        assert_eq!(
            nodes,
            vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)]
        );
    }

    #[test]
    fn test_duplicate_peer_rejected() {
        let config = NodeConfig::new(NodeId::new(1), "127.0.0.1:9001".parse().unwrap())
            .with_peers(vec![
                PeerConfig::new(NodeId::new(2), "a"),
                PeerConfig::new(NodeId::new(2), "b"),
            ]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_properties_binds_known_keys() {
        let mut props = BTreeMap::new();
        props.insert("election.timeout.min.ms".to_string(), "200".to_string());
        props.insert("election.timeout.max.ms".to_string(), "400".to_string());
        props.insert("heartbeat.interval.ms".to_string(), "40".to_string());
        props.insert("snapshot.interval.entries".to_string(), "500".to_string());
        props.insert("journal.segment_size_bytes".to_string(), "65536".to_string());
        props.insert("some.unknown.knob".to_string(), "1".to_string());

        let config = base().apply_properties(&props).unwrap();
        assert_eq!(config.timing.election_timeout_min, Duration::from_millis(200));
        assert_eq!(config.snapshot_interval_entries, 500);
        assert_eq!(
            config.storage_properties.get("journal.segment_size_bytes"),
            Some(&"65536".to_string())
        );
    }

    #[test]
    fn test_apply_properties_rejects_bad_value() {
        let mut props = BTreeMap::new();
        props.insert("heartbeat.interval.ms".to_string(), "soon".to_string());
        assert!(base().apply_properties(&props).is_err());
    }
}
