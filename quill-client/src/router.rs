//! Client router.
//!
//! Resolves which node currently leads the cluster and drives every
//! operation against it: append, read, and partition scaling. On a
//! `NotLeader` redirect the router follows the hint, on transport failure
//! it rediscovers, and every retry is bounded by the caller's deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use quill_core::{NodeId, PartitionId};
use quill_runtime::codec::{
    decode_leader, encode_client_append, encode_client_query, TYPE_CLIENT_APPEND,
    TYPE_CLIENT_QUERY, TYPE_GET_LEADER,
};
use quill_runtime::{Frame, RpcClient, Status, TransportError, TransportResult};
use quill_store::{
    encode_partition_set, StoreQuery, StoreReply, StoredRecord, CONTROL_PARTITION,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};
use crate::leader_cache::LeaderCache;

/// Backoff before retrying a `ServerBusy` answer.
const BUSY_BACKOFF: Duration = Duration::from_millis(100);

/// Poll interval for leader probing.
const PROBE_INTERVAL: Duration = Duration::from_millis(50);

/// One RPC round against a specific node.
///
/// The seam between routing policy and the wire: production uses TCP,
/// tests script answers.
#[async_trait]
pub trait ClusterRpc: Send + Sync {
    /// Sends one request frame to `node` and awaits its response.
    async fn call(
        &self,
        node: NodeId,
        frame_type: u8,
        payload: Bytes,
        timeout: Duration,
    ) -> TransportResult<Frame>;
}

/// TCP-backed cluster RPC with one lazily dialed client per node.
pub struct TcpClusterRpc {
    addrs: HashMap<NodeId, String>,
    clients: Mutex<HashMap<NodeId, Arc<RpcClient>>>,
}

impl TcpClusterRpc {
    /// Creates an RPC layer over the given node addresses.
    #[must_use]
    pub fn new(addrs: HashMap<NodeId, String>) -> Self {
        Self {
            addrs,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client_for(&self, node: NodeId) -> TransportResult<Arc<RpcClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&node) {
            return Ok(Arc::clone(client));
        }
        let addr = self
            .addrs
            .get(&node)
            .ok_or(TransportError::UnknownPeer(node))?;
        let client = RpcClient::new(addr.clone());
        clients.insert(node, Arc::clone(&client));
        Ok(client)
    }
}

#[async_trait]
impl ClusterRpc for TcpClusterRpc {
    async fn call(
        &self,
        node: NodeId,
        frame_type: u8,
        payload: Bytes,
        timeout: Duration,
    ) -> TransportResult<Frame> {
        let client = self.client_for(node).await?;
        client.call(frame_type, node, payload, timeout).await
    }
}

/// Routes client operations to the cluster leader.
pub struct Router {
    rpc: Arc<dyn ClusterRpc>,
    nodes: Vec<NodeId>,
    cache: Mutex<LeaderCache>,
}

impl Router {
    /// Creates a router over the given RPC layer and node set.
    #[must_use]
    pub fn new(rpc: Arc<dyn ClusterRpc>, nodes: Vec<NodeId>) -> Self {
        Self {
            rpc,
            nodes,
            cache: Mutex::new(LeaderCache::with_defaults()),
        }
    }

    /// Creates a TCP router from node addresses.
    #[must_use]
    pub fn connect(addrs: HashMap<NodeId, String>) -> Self {
        let mut nodes: Vec<NodeId> = addrs.keys().copied().collect();
        nodes.sort_by_key(|n| n.get());
        Self::new(Arc::new(TcpClusterRpc::new(addrs)), nodes)
    }

    /// Appends one batch to a partition, returning its start offset.
    ///
    /// # Errors
    /// `LeaderUnavailable` if no leader answers before the deadline,
    /// `Store` if the state machine rejects the batch.
    pub async fn append(
        &self,
        partition: PartitionId,
        batch_size: u32,
        data: Bytes,
        timeout: Duration,
    ) -> ClientResult<u64> {
        let payload = encode_client_append(partition, batch_size, &data);
        let frame = self
            .call_leader(TYPE_CLIENT_APPEND, payload, timeout)
            .await?;
        match decode_reply(&frame)? {
            StoreReply::Appended { position } => Ok(position),
            StoreReply::Error(message) => Err(ClientError::Store { message }),
            other => Err(unexpected(&other)),
        }
    }

    /// Reads records overlapping `[offset, offset + length)` from a
    /// partition. `linearizable` routes the read through a leader
    /// confirmation round; otherwise the leader answers from applied
    /// state.
    ///
    /// # Errors
    /// `LeaderUnavailable` if no leader answers before the deadline,
    /// `Store` for unknown partitions or out-of-range offsets.
    pub async fn get(
        &self,
        partition: PartitionId,
        offset: u64,
        length: u32,
        linearizable: bool,
        timeout: Duration,
    ) -> ClientResult<Vec<StoredRecord>> {
        let query = StoreQuery::Get {
            partition,
            offset,
            length,
        };
        let payload = encode_client_query(linearizable, &query.encode());
        let frame = self.call_leader(TYPE_CLIENT_QUERY, payload, timeout).await?;
        match decode_reply(&frame)? {
            StoreReply::Records(records) => Ok(records),
            StoreReply::Error(message) => Err(ClientError::Store { message }),
            other => Err(unexpected(&other)),
        }
    }

    /// Returns the cluster's current partition set.
    ///
    /// # Errors
    /// `LeaderUnavailable` if no leader answers before the deadline.
    pub async fn partitions(&self, timeout: Duration) -> ClientResult<Vec<PartitionId>> {
        let payload = encode_client_query(false, &StoreQuery::Partitions.encode());
        let frame = self.call_leader(TYPE_CLIENT_QUERY, payload, timeout).await?;
        match decode_reply(&frame)? {
            StoreReply::Partitions(partitions) => Ok(partitions),
            StoreReply::Error(message) => Err(ClientError::Store { message }),
            other => Err(unexpected(&other)),
        }
    }

    /// Replaces the partition set cluster-wide. The change replicates as
    /// an ordinary control entry, so it lands on every node in log order
    /// relative to appends.
    ///
    /// # Errors
    /// `LeaderUnavailable` if no leader answers before the deadline,
    /// `Store` if the target set is invalid.
    pub async fn scale_partitions(
        &self,
        target: &[PartitionId],
        timeout: Duration,
    ) -> ClientResult<()> {
        let payload =
            encode_client_append(CONTROL_PARTITION, 1, &encode_partition_set(target));
        let frame = self
            .call_leader(TYPE_CLIENT_APPEND, payload, timeout)
            .await?;
        match decode_reply(&frame)? {
            StoreReply::Scaled => Ok(()),
            StoreReply::Error(message) => Err(ClientError::Store { message }),
            other => Err(unexpected(&other)),
        }
    }

    /// Asks the cluster who leads, probing nodes until one answers with a
    /// hint or the deadline passes.
    ///
    /// # Errors
    /// `LeaderUnavailable` if every probe fails or comes back empty.
    pub async fn get_leader(&self, timeout: Duration) -> ClientResult<NodeId> {
        let deadline = Instant::now() + timeout;
        self.discover_leader(deadline).await
    }

    /// Polls until some node is known as leader. Returns `true` once a
    /// leader is known, `false` if the timeout elapses first.
    pub async fn wait_for_leader(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.discover_leader(deadline).await.is_ok() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }

    /// Sends one operation to the leader, following redirects and backing
    /// off on busy answers until the deadline.
    async fn call_leader(
        &self,
        frame_type: u8,
        payload: Bytes,
        timeout: Duration,
    ) -> ClientResult<Frame> {
        let deadline = Instant::now() + timeout;

        loop {
            let leader = self.resolve_leader(deadline).await?;
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(ClientError::LeaderUnavailable);
            };

            match self
                .rpc
                .call(leader, frame_type, payload.clone(), remaining)
                .await
            {
                Ok(frame) => match frame.header.status {
                    Status::Ok => return Ok(frame),
                    Status::NotLeader => {
                        let hint = decode_leader(&frame.payload).unwrap_or(None);
                        debug!(node = %leader, ?hint, "Redirected");
                        let mut cache = self.cache.lock().await;
                        match hint {
                            Some(new_leader) if new_leader != leader => {
                                cache.update(new_leader, Instant::now());
                            }
                            _ => cache.invalidate(),
                        }
                    }
                    Status::ServerBusy => {
                        debug!(node = %leader, "Server busy, backing off");
                        tokio::time::sleep(BUSY_BACKOFF).await;
                    }
                    Status::Timeout => return Err(ClientError::Timeout),
                    Status::Error => {
                        return Err(ClientError::Store {
                            message: frame.header.error,
                        })
                    }
                },
                Err(e) => {
                    warn!(node = %leader, error = %e, "Leader call failed");
                    self.cache.lock().await.invalidate();
                }
            }

            if Instant::now() >= deadline {
                return Err(ClientError::LeaderUnavailable);
            }
        }
    }

    /// Returns the cached leader, or discovers one.
    async fn resolve_leader(&self, deadline: Instant) -> ClientResult<NodeId> {
        if let Some(leader) = self.cache.lock().await.get(Instant::now()) {
            return Ok(leader);
        }
        self.discover_leader(deadline).await
    }

    /// Probes every node for a leader hint until one answers.
    async fn discover_leader(&self, deadline: Instant) -> ClientResult<NodeId> {
        loop {
            for &node in &self.nodes {
                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    return Err(ClientError::LeaderUnavailable);
                };
                let probe = self
                    .rpc
                    .call(node, TYPE_GET_LEADER, Bytes::new(), remaining.min(PROBE_INTERVAL * 4))
                    .await;
                match probe {
                    Ok(frame) if frame.header.status == Status::Ok => {
                        if let Ok(Some(leader)) = decode_leader(&frame.payload) {
                            self.cache.lock().await.update(leader, Instant::now());
                            return Ok(leader);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => debug!(node = %node, error = %e, "Leader probe failed"),
                }
            }

            if Instant::now() >= deadline {
                return Err(ClientError::LeaderUnavailable);
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }
}

fn decode_reply(frame: &Frame) -> ClientResult<StoreReply> {
    StoreReply::decode(frame.payload.clone()).map_err(|e| ClientError::UnexpectedReply {
        reason: e.to_string(),
    })
}

fn unexpected(reply: &StoreReply) -> ClientError {
    ClientError::UnexpectedReply {
        reason: format!("reply does not match the operation: {reply:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::RequestId;
    use std::collections::VecDeque;

    /// Scripted RPC: each node has a queue of canned responses.
    struct MockRpc {
        responses: Mutex<HashMap<NodeId, VecDeque<TransportResult<Frame>>>>,
        calls: Mutex<Vec<(NodeId, u8)>>,
    }

    impl MockRpc {
        fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        async fn push(&self, node: u64, response: TransportResult<Frame>) {
            self.responses
                .lock()
                .await
                .entry(NodeId::new(node))
                .or_default()
                .push_back(response);
        }
    }

    #[async_trait]
    impl ClusterRpc for MockRpc {
        async fn call(
            &self,
            node: NodeId,
            frame_type: u8,
            _payload: Bytes,
            _timeout: Duration,
        ) -> TransportResult<Frame> {
            self.calls.lock().await.push((node, frame_type));
            self.responses
                .lock()
                .await
                .get_mut(&node)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Err(TransportError::ConnectionClosed))
        }
    }

    fn response(frame_type: u8, status: Status, payload: Bytes) -> Frame {
        let request = Frame::request(RequestId::new(1), frame_type, NodeId::new(0), false, Bytes::new());
        Frame::response(&request.header, status, String::new(), payload)
    }

    fn leader_frame(leader: Option<u64>) -> Frame {
        response(
            TYPE_GET_LEADER,
            Status::Ok,
            quill_runtime::codec::encode_leader(leader.map(NodeId::new)),
        )
    }

    fn router(rpc: Arc<MockRpc>) -> Router {
        Router::new(rpc, vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)])
    }

    #[tokio::test]
    async fn test_append_discovers_leader_and_succeeds() {
        let rpc = Arc::new(MockRpc::new());
        rpc.push(1, Ok(leader_frame(Some(2)))).await;
        rpc.push(
            2,
            Ok(response(
                TYPE_CLIENT_APPEND,
                Status::Ok,
                StoreReply::Appended { position: 0 }.encode(),
            )),
        )
        .await;

        let router = router(Arc::clone(&rpc));
        let position = router
            .append(PartitionId::new(0), 1, Bytes::from_static(b"x"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(position, 0);

        let calls = rpc.calls.lock().await;
        assert_eq!(calls[0], (NodeId::new(1), TYPE_GET_LEADER));
        assert_eq!(calls[1], (NodeId::new(2), TYPE_CLIENT_APPEND));
    }

    #[tokio::test]
    async fn test_redirect_follows_hint() {
        let rpc = Arc::new(MockRpc::new());
        rpc.push(1, Ok(leader_frame(Some(1)))).await;
        // Node 1 lost leadership to node 3 in the meantime.
        rpc.push(
            1,
            Ok(response(
                TYPE_CLIENT_APPEND,
                Status::NotLeader,
                quill_runtime::codec::encode_leader(Some(NodeId::new(3))),
            )),
        )
        .await;
        rpc.push(
            3,
            Ok(response(
                TYPE_CLIENT_APPEND,
                Status::Ok,
                StoreReply::Appended { position: 4 }.encode(),
            )),
        )
        .await;

        let router = router(Arc::clone(&rpc));
        let position = router
            .append(PartitionId::new(0), 1, Bytes::from_static(b"x"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(position, 4);

        let calls = rpc.calls.lock().await;
        assert_eq!(calls.last(), Some(&(NodeId::new(3), TYPE_CLIENT_APPEND)));
    }

    #[tokio::test]
    async fn test_no_leader_before_deadline() {
        let rpc = Arc::new(MockRpc::new());
        for node in 1..=3 {
            rpc.push(node, Ok(leader_frame(None))).await;
            rpc.push(node, Ok(leader_frame(None))).await;
        }

        let router = router(rpc);
        let result = router
            .append(
                PartitionId::new(0),
                1,
                Bytes::from_static(b"x"),
                Duration::from_millis(120),
            )
            .await;
        assert!(matches!(result, Err(ClientError::LeaderUnavailable)));
    }

    #[tokio::test]
    async fn test_wait_for_leader_polls_until_known() {
        let rpc = Arc::new(MockRpc::new());
        // First sweep: nobody knows. Second sweep: node 1 answers.
        rpc.push(1, Ok(leader_frame(None))).await;
        rpc.push(2, Ok(leader_frame(None))).await;
        rpc.push(3, Ok(leader_frame(None))).await;
        rpc.push(1, Ok(leader_frame(Some(2)))).await;

        let router = router(rpc);
        assert!(router.wait_for_leader(Duration::from_secs(1)).await);
        assert_eq!(
            router.cache.lock().await.get(Instant::now()),
            Some(NodeId::new(2))
        );
    }

    #[tokio::test]
    async fn test_wait_for_leader_gives_up() {
        let rpc = Arc::new(MockRpc::new());
        let router = router(rpc);
        assert!(!router.wait_for_leader(Duration::from_millis(120)).await);
    }

    #[tokio::test]
    async fn test_busy_leader_is_retried() {
        let rpc = Arc::new(MockRpc::new());
        rpc.push(1, Ok(leader_frame(Some(1)))).await;
        rpc.push(
            1,
            Ok(response(TYPE_CLIENT_APPEND, Status::ServerBusy, Bytes::new())),
        )
        .await;
        rpc.push(
            1,
            Ok(response(
                TYPE_CLIENT_APPEND,
                Status::Ok,
                StoreReply::Appended { position: 8 }.encode(),
            )),
        )
        .await;

        let router = router(rpc);
        let position = router
            .append(PartitionId::new(0), 1, Bytes::from_static(b"x"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(position, 8);
    }

    #[tokio::test]
    async fn test_store_error_is_not_retried() {
        let rpc = Arc::new(MockRpc::new());
        rpc.push(1, Ok(leader_frame(Some(1)))).await;
        rpc.push(
            1,
            Ok(response(
                TYPE_CLIENT_APPEND,
                Status::Ok,
                StoreReply::Error("unknown partition partition-9".to_string()).encode(),
            )),
        )
        .await;

        let router = router(rpc);
        let result = router
            .append(PartitionId::new(9), 1, Bytes::from_static(b"x"), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(ClientError::Store { .. })));
    }

    #[tokio::test]
    async fn test_scale_partitions_round_trip() {
        let rpc = Arc::new(MockRpc::new());
        rpc.push(1, Ok(leader_frame(Some(1)))).await;
        rpc.push(
            1,
            Ok(response(
                TYPE_CLIENT_APPEND,
                Status::Ok,
                StoreReply::Scaled.encode(),
            )),
        )
        .await;

        let router = router(rpc);
        router
            .scale_partitions(
                &[PartitionId::new(0), PartitionId::new(7)],
                Duration::from_secs(1),
            )
            .await
            .unwrap();
    }
}
