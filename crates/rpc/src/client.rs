use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use koinos_p2p_network::{Control, OutboundRequestId, PeerId};
use koinos_p2p_types::{BlockId, ChainId, P2pError};

use crate::{PeerRpcRequest, PeerRpcResponse};

type RpcResult = Result<Bytes, String>;

/// Responses parked here are dropped if unclaimed for this long.
const UNCLAIMED_TTL: Duration = Duration::from_secs(60);

/// Correlates outbound peer RPC request ids with their waiting callers.
///
/// The network task resolves results from its own loop, so a response can
/// arrive before the caller has learned its request id; such results are
/// parked until claimed.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<Inner<OutboundRequestId>>>,
}

struct Inner<K> {
    waiting: HashMap<K, oneshot::Sender<RpcResult>>,
    unclaimed: HashMap<K, (Instant, RpcResult)>,
}

impl<K> Default for Inner<K> {
    fn default() -> Self {
        Self {
            waiting: HashMap::new(),
            unclaimed: HashMap::new(),
        }
    }
}

impl<K: std::hash::Hash + Eq> Inner<K> {
    fn resolve(&mut self, request_id: K, result: RpcResult) {
        let now = Instant::now();
        self.unclaimed
            .retain(|_, (parked_at, _)| now.duration_since(*parked_at) < UNCLAIMED_TTL);

        match self.waiting.remove(&request_id) {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => {
                self.unclaimed.insert(request_id, (now, result));
            }
        }
    }

    fn wait(&mut self, request_id: K) -> oneshot::Receiver<RpcResult> {
        let (reply, rx) = oneshot::channel();

        match self.unclaimed.remove(&request_id) {
            Some((_, result)) => {
                let _ = reply.send(result);
            }
            None => {
                self.waiting.insert(request_id, reply);
            }
        }

        rx
    }

    fn forget(&mut self, request_id: &K) {
        self.waiting.remove(request_id);
        self.unclaimed.remove(request_id);
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver the outcome of a request. Called by the node dispatcher for
    /// both responses and outbound failures.
    pub fn resolve(&self, request_id: OutboundRequestId, result: RpcResult) {
        self.inner
            .lock()
            .expect("pending requests lock")
            .resolve(request_id, result)
    }

    fn wait(&self, request_id: OutboundRequestId) -> oneshot::Receiver<RpcResult> {
        self.inner
            .lock()
            .expect("pending requests lock")
            .wait(request_id)
    }

    fn forget(&self, request_id: OutboundRequestId) {
        self.inner
            .lock()
            .expect("pending requests lock")
            .forget(&request_id)
    }
}

/// Client side of the peer RPC service, one instance shared by all peer
/// workers.
#[derive(Clone)]
pub struct PeerRpcClient {
    control: Control,
    pending: PendingRequests,
    rpc_timeout: Duration,
}

impl PeerRpcClient {
    pub fn new(control: Control, pending: PendingRequests, rpc_timeout: Duration) -> Self {
        Self {
            control,
            pending,
            rpc_timeout,
        }
    }

    async fn call(
        &self,
        peer: PeerId,
        request: &PeerRpcRequest,
        timeout: Duration,
    ) -> Result<PeerRpcResponse, P2pError> {
        let body = serde_json::to_vec(request)
            .map(Bytes::from)
            .map_err(|e| P2pError::Serialization(e.to_string()))?;

        let request_id = self
            .control
            .rpc_request(peer, body)
            .await
            .map_err(|e| P2pError::PeerRpc(e.to_string()))?;

        let rx = self.pending.wait(request_id);

        let result = match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                debug!(%peer, %request_id, "Peer RPC timed out");
                self.pending.forget(request_id);
                return Err(P2pError::PeerRpcTimeout);
            }
            Ok(Err(_)) => return Err(P2pError::PeerRpc("response channel closed".to_string())),
            Ok(Ok(result)) => result,
        };

        let bytes = result.map_err(P2pError::PeerRpc)?;

        let response: PeerRpcResponse = serde_json::from_slice(&bytes)
            .map_err(|e| P2pError::Deserialization(e.to_string()))?;

        match response {
            PeerRpcResponse::Error { message } => Err(P2pError::PeerRpc(message)),
            response => Ok(response),
        }
    }

    pub async fn get_chain_id(&self, peer: PeerId) -> Result<ChainId, P2pError> {
        match self
            .call(peer, &PeerRpcRequest::GetChainId, self.rpc_timeout)
            .await?
        {
            PeerRpcResponse::ChainId { id } => Ok(id),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_head_block(&self, peer: PeerId) -> Result<(BlockId, u64), P2pError> {
        match self
            .call(peer, &PeerRpcRequest::GetHeadBlock, self.rpc_timeout)
            .await?
        {
            PeerRpcResponse::HeadBlock { id, height } => Ok((id, height)),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_ancestor_block_id(
        &self,
        peer: PeerId,
        parent_id: BlockId,
        child_height: u64,
    ) -> Result<BlockId, P2pError> {
        let request = PeerRpcRequest::GetAncestorBlockId {
            parent_id,
            child_height,
        };

        match self.call(peer, &request, self.rpc_timeout).await? {
            PeerRpcResponse::AncestorBlockId { id } => Ok(id),
            other => Err(unexpected(&other)),
        }
    }

    /// Fetch serialized blocks under the given deadline. Downloads carry
    /// their own, longer timeout than the other methods.
    pub async fn get_blocks(
        &self,
        peer: PeerId,
        head_id: BlockId,
        start_height: u64,
        num_blocks: u32,
        timeout: Duration,
    ) -> Result<Vec<Bytes>, P2pError> {
        let request = PeerRpcRequest::GetBlocks {
            head_id,
            start_height,
            num_blocks,
        };

        match self.call(peer, &request, timeout).await? {
            PeerRpcResponse::Blocks { blocks } => Ok(blocks),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &PeerRpcResponse) -> P2pError {
    P2pError::PeerRpc(format!("unexpected response: {response:?}"))
}
