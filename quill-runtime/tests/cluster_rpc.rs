//! End-to-end test: a real three-node cluster over TCP.
//!
//! Each node runs the full stack: transport, server loop, consensus
//! engine, and the journal store as its state machine. A client speaks
//! the framed protocol against whichever node won the election.

use std::time::Duration;

use bytes::Bytes;
use quill_core::{NodeId, PartitionId};
use quill_raft::MemoryRaftStorage;
use quill_runtime::codec::{
    encode_client_append, encode_client_query, encode_leader, TYPE_CLIENT_APPEND,
    TYPE_CLIENT_QUERY, TYPE_GET_LEADER,
};
use quill_runtime::{
    NodeConfig, NodeServer, PeerConfig, RpcClient, ServerHandle, Status, TimingConfig, Transport,
};
use quill_store::{JournalStore, StoreQuery, StoreReply};

/// Routes node logs to the test writer; `RUST_LOG` controls verbosity.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct TestCluster {
    handles: Vec<ServerHandle>,
    addrs: Vec<String>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl TestCluster {
    /// Starts `size` nodes on reserved loopback ports.
    async fn start(size: u64) -> Self {
        init_logging();
        let ports: Vec<u16> = (0..size).map(|_| reserve_port()).collect();
        let mut handles = Vec::new();
        let mut addrs = Vec::new();
        let mut tasks = Vec::new();

        for (i, &port) in ports.iter().enumerate() {
            let node_id = NodeId::new(i as u64 + 1);
            let peers = ports
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(j, &p)| PeerConfig::new(NodeId::new(j as u64 + 1), format!("127.0.0.1:{p}")))
                .collect();

            let config = NodeConfig::new(node_id, format!("127.0.0.1:{port}").parse().unwrap())
                .with_peers(peers)
                .with_timing(TimingConfig::fast_for_testing())
                .with_snapshot_interval(0);

            let (transport, incoming) = Transport::new(config.transport_config());
            let (transport_handle, addr) = transport.start().await.unwrap();

            let machine =
                JournalStore::with_partitions([PartitionId::new(0), PartitionId::new(1)]);
            let server = NodeServer::recover(config, MemoryRaftStorage::new(), machine)
                .await
                .unwrap();
            let (handle, future) = server.run_with_transport(transport_handle, incoming);

            handles.push(handle);
            addrs.push(addr.to_string());
            tasks.push(tokio::spawn(future));
        }

        Self {
            handles,
            addrs,
            tasks,
        }
    }

    /// Waits for an election to settle and returns the leader's slot.
    async fn leader(&self) -> usize {
        for handle in &self.handles {
            assert!(handle.wait_for_leader(Duration::from_secs(5)).await);
        }
        for _ in 0..100 {
            for (i, handle) in self.handles.iter().enumerate() {
                if handle.status().await.unwrap().is_leader {
                    return i;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no leader elected");
    }

    async fn stop(self) {
        for handle in &self.handles {
            handle.shutdown().await;
        }
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Reserves a loopback port by binding and dropping a listener.
fn reserve_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_append_and_read_over_tcp() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.leader().await;
    let leader_id = NodeId::new(leader as u64 + 1);

    let client = RpcClient::new(cluster.addrs[leader].clone());

    // Append one batch to partition 1.
    let response = client
        .call(
            TYPE_CLIENT_APPEND,
            leader_id,
            encode_client_append(PartitionId::new(1), 1, &Bytes::from_static(b"first-record")),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(response.header.status, Status::Ok);
    let reply = StoreReply::decode(response.payload).unwrap();
    assert!(matches!(reply, StoreReply::Appended { position: 0 }));

    // The leader applies before answering, so a local read on the leader
    // sees the record.
    let query = StoreQuery::Get {
        partition: PartitionId::new(1),
        offset: 0,
        length: 1,
    };
    let response = client
        .call(
            TYPE_CLIENT_QUERY,
            leader_id,
            encode_client_query(false, &query.encode()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(response.header.status, Status::Ok);
    match StoreReply::decode(response.payload).unwrap() {
        StoreReply::Records(records) => {
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].payload, Bytes::from_static(b"first-record"));
        }
        other => panic!("expected records, got {other:?}"),
    }

    cluster.stop().await;
}

#[tokio::test]
async fn test_follower_redirects_appends() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.leader().await;
    let follower = (leader + 1) % 3;
    let leader_id = NodeId::new(leader as u64 + 1);

    let client = RpcClient::new(cluster.addrs[follower].clone());
    let response = client
        .call(
            TYPE_CLIENT_APPEND,
            NodeId::new(follower as u64 + 1),
            encode_client_append(PartitionId::new(0), 1, &Bytes::from_static(b"nope")),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert_eq!(response.header.status, Status::NotLeader);
    // The redirect carries the leader hint in its payload.
    assert_eq!(response.payload, encode_leader(Some(leader_id)));

    cluster.stop().await;
}

#[tokio::test]
async fn test_get_leader_from_any_node() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.leader().await;
    let leader_id = NodeId::new(leader as u64 + 1);

    for (i, addr) in cluster.addrs.iter().enumerate() {
        let client = RpcClient::new(addr.clone());
        let response = client
            .call(
                TYPE_GET_LEADER,
                NodeId::new(i as u64 + 1),
                Bytes::new(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(response.header.status, Status::Ok);
        assert_eq!(response.payload, encode_leader(Some(leader_id)));
    }

    cluster.stop().await;
}

#[tokio::test]
async fn test_linearizable_read_sees_latest_write() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.leader().await;
    let leader_id = NodeId::new(leader as u64 + 1);

    let client = RpcClient::new(cluster.addrs[leader].clone());
    let response = client
        .call(
            TYPE_CLIENT_APPEND,
            leader_id,
            encode_client_append(PartitionId::new(0), 2, &Bytes::from_static(b"fresh")),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(response.header.status, Status::Ok);

    // Linearizable read goes through a heartbeat round before answering.
    let query = StoreQuery::Get {
        partition: PartitionId::new(0),
        offset: 0,
        length: 2,
    };
    let response = client
        .call(
            TYPE_CLIENT_QUERY,
            leader_id,
            encode_client_query(true, &query.encode()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(response.header.status, Status::Ok);
    match StoreReply::decode(response.payload).unwrap() {
        StoreReply::Records(records) => {
            assert_eq!(records[0].payload, Bytes::from_static(b"fresh"));
        }
        other => panic!("expected records, got {other:?}"),
    }

    cluster.stop().await;
}
