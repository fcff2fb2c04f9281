use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use koinos_p2p_network::PeerId;
use koinos_p2p_types::{BlockId, ChainId, P2pError};

use crate::PeerRpcClient;

/// A remote peer's RPC surface, as used by the peer connection worker.
#[async_trait]
pub trait RemoteRpc: Send + Sync + 'static {
    async fn get_chain_id(&self, peer: PeerId) -> Result<ChainId, P2pError>;

    async fn get_head_block(&self, peer: PeerId) -> Result<(BlockId, u64), P2pError>;

    async fn get_ancestor_block_id(
        &self,
        peer: PeerId,
        parent_id: BlockId,
        child_height: u64,
    ) -> Result<BlockId, P2pError>;

    async fn get_blocks(
        &self,
        peer: PeerId,
        head_id: BlockId,
        start_height: u64,
        num_blocks: u32,
        timeout: Duration,
    ) -> Result<Vec<Bytes>, P2pError>;
}

#[async_trait]
impl RemoteRpc for PeerRpcClient {
    async fn get_chain_id(&self, peer: PeerId) -> Result<ChainId, P2pError> {
        PeerRpcClient::get_chain_id(self, peer).await
    }

    async fn get_head_block(&self, peer: PeerId) -> Result<(BlockId, u64), P2pError> {
        PeerRpcClient::get_head_block(self, peer).await
    }

    async fn get_ancestor_block_id(
        &self,
        peer: PeerId,
        parent_id: BlockId,
        child_height: u64,
    ) -> Result<BlockId, P2pError> {
        PeerRpcClient::get_ancestor_block_id(self, peer, parent_id, child_height).await
    }

    async fn get_blocks(
        &self,
        peer: PeerId,
        head_id: BlockId,
        start_height: u64,
        num_blocks: u32,
        timeout: Duration,
    ) -> Result<Vec<Bytes>, P2pError> {
        PeerRpcClient::get_blocks(self, peer, head_id, start_height, num_blocks, timeout).await
    }
}
