use async_trait::async_trait;

use koinos_p2p_types::{Block, BlockId, BlockTopology, ChainId, ForkHeads, Transaction};

use crate::RpcError;

/// The local chain as seen by the p2p daemon.
///
/// Consensus, validation and storage all live behind this trait; the p2p
/// layer only submits blocks and transactions and asks topology questions.
#[async_trait]
pub trait LocalRpc: Send + Sync + 'static {
    async fn get_chain_id(&self) -> Result<ChainId, RpcError>;

    /// Topology of the current head block.
    async fn get_head_info(&self) -> Result<BlockTopology, RpcError>;

    async fn get_fork_heads(&self) -> Result<ForkHeads, RpcError>;

    /// Blocks at heights `[start_height, start_height + num_blocks)` on the
    /// fork containing `head_id`.
    async fn get_blocks_by_height(
        &self,
        head_id: &BlockId,
        start_height: u64,
        num_blocks: u32,
    ) -> Result<Vec<Block>, RpcError>;

    async fn get_blocks_by_id(&self, ids: &[BlockId]) -> Result<Vec<Block>, RpcError>;

    async fn apply_block(&self, block: &Block) -> Result<(), RpcError>;

    async fn apply_transaction(&self, transaction: &Transaction) -> Result<(), RpcError>;

    /// Connectivity probe against the chain service.
    async fn is_connected_to_chain(&self) -> Result<bool, RpcError>;

    /// Connectivity probe against the block store.
    async fn is_connected_to_block_store(&self) -> Result<bool, RpcError>;
}
