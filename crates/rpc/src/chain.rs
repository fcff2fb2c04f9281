use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use koinos_p2p_types::{Block, BlockId, BlockTopology, ChainId, ForkHeads, Transaction};

use crate::{BusError, LocalRpc, MessageBus, RpcError};

const CONTENT_TYPE: &str = "application/json";
const CHAIN_TARGET: &str = "chain";
const BLOCK_STORE_TARGET: &str = "block_store";

/// [`LocalRpc`] implementation speaking JSON request/reply over the bus.
#[derive(Clone)]
pub struct ChainClient {
    bus: Arc<dyn MessageBus>,
    timeout: Duration,
}

#[derive(Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
enum ChainRequest<'a> {
    GetChainId,
    GetHeadInfo,
    GetForkHeads,
    SubmitBlock { block: &'a Block },
    SubmitTransaction { transaction: &'a Transaction },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
enum ChainResponse {
    ChainId {
        chain_id: ChainId,
    },
    HeadInfo {
        head_topology: BlockTopology,
        #[serde(default)]
        #[allow(dead_code)]
        last_irreversible_block: u64,
    },
    ForkHeads(ForkHeads),
    SubmitBlock,
    SubmitTransaction,
    Error(ErrorReply),
}

#[derive(Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
enum BlockStoreRequest<'a> {
    GetBlocksByHeight {
        head_block_id: &'a BlockId,
        ancestor_start_height: u64,
        num_blocks: u32,
    },
    GetBlocksById {
        block_ids: &'a [BlockId],
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
enum BlockStoreResponse {
    Blocks { block_items: Vec<Block> },
    Error(ErrorReply),
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

impl ErrorReply {
    const BLOCK_IRREVERSIBILITY: &'static str = "block_irreversibility";
}

impl ChainClient {
    pub fn new(bus: Arc<dyn MessageBus>, timeout: Duration) -> Self {
        Self { bus, timeout }
    }

    async fn exchange(&self, target: &str, request: &impl Serialize) -> Result<Bytes, RpcError> {
        let payload = serde_json::to_vec(request)
            .map(Bytes::from)
            .map_err(|e| RpcError::Serialization(e.to_string()))?;

        let reply = tokio::time::timeout(
            self.timeout,
            self.bus.rpc(CONTENT_TYPE, target, payload),
        )
        .await
        .map_err(|_| RpcError::LocalRpcTimeout)?;

        reply.map_err(|e| match e {
            BusError::Timeout => RpcError::LocalRpcTimeout,
            BusError::Unavailable(e) => RpcError::LocalRpc(e),
        })
    }

    async fn chain_request(&self, request: ChainRequest<'_>) -> Result<ChainResponse, RpcError> {
        let reply = self.exchange(CHAIN_TARGET, &request).await?;

        serde_json::from_slice(&reply)
            .map_err(|e| RpcError::LocalRpc(format!("malformed chain reply: {e}")))
    }

    async fn block_store_request(
        &self,
        request: BlockStoreRequest<'_>,
    ) -> Result<Vec<Block>, RpcError> {
        let reply = self.exchange(BLOCK_STORE_TARGET, &request).await?;

        let response: BlockStoreResponse = serde_json::from_slice(&reply)
            .map_err(|e| RpcError::LocalRpc(format!("malformed block store reply: {e}")))?;

        match response {
            BlockStoreResponse::Blocks { block_items } => Ok(block_items),
            BlockStoreResponse::Error(e) => Err(RpcError::LocalRpc(e.message)),
        }
    }
}

#[async_trait::async_trait]
impl LocalRpc for ChainClient {
    async fn get_chain_id(&self) -> Result<ChainId, RpcError> {
        match self.chain_request(ChainRequest::GetChainId).await? {
            ChainResponse::ChainId { chain_id } => Ok(chain_id),
            ChainResponse::Error(e) => Err(RpcError::LocalRpc(e.message)),
            other => Err(RpcError::LocalRpc(format!("unexpected reply: {other:?}"))),
        }
    }

    async fn get_head_info(&self) -> Result<BlockTopology, RpcError> {
        match self.chain_request(ChainRequest::GetHeadInfo).await? {
            ChainResponse::HeadInfo { head_topology, .. } => Ok(head_topology),
            ChainResponse::Error(e) => Err(RpcError::LocalRpc(e.message)),
            other => Err(RpcError::LocalRpc(format!("unexpected reply: {other:?}"))),
        }
    }

    async fn get_fork_heads(&self) -> Result<ForkHeads, RpcError> {
        match self.chain_request(ChainRequest::GetForkHeads).await? {
            ChainResponse::ForkHeads(fork_heads) => Ok(fork_heads),
            ChainResponse::Error(e) => Err(RpcError::LocalRpc(e.message)),
            other => Err(RpcError::LocalRpc(format!("unexpected reply: {other:?}"))),
        }
    }

    async fn get_blocks_by_height(
        &self,
        head_id: &BlockId,
        start_height: u64,
        num_blocks: u32,
    ) -> Result<Vec<Block>, RpcError> {
        self.block_store_request(BlockStoreRequest::GetBlocksByHeight {
            head_block_id: head_id,
            ancestor_start_height: start_height,
            num_blocks,
        })
        .await
    }

    async fn get_blocks_by_id(&self, ids: &[BlockId]) -> Result<Vec<Block>, RpcError> {
        self.block_store_request(BlockStoreRequest::GetBlocksById { block_ids: ids })
            .await
    }

    async fn apply_block(&self, block: &Block) -> Result<(), RpcError> {
        debug!(id = %block.id, height = block.header.height, "Submitting block");

        match self
            .chain_request(ChainRequest::SubmitBlock { block })
            .await?
        {
            ChainResponse::SubmitBlock => Ok(()),
            ChainResponse::Error(e) if e.code.as_deref() == Some(ErrorReply::BLOCK_IRREVERSIBILITY) => {
                Err(RpcError::BlockIrreversibility(e.message))
            }
            ChainResponse::Error(e) => Err(RpcError::BlockApplication(e.message)),
            other => Err(RpcError::LocalRpc(format!("unexpected reply: {other:?}"))),
        }
    }

    async fn apply_transaction(&self, transaction: &Transaction) -> Result<(), RpcError> {
        debug!(id = %transaction.id, "Submitting transaction");

        match self
            .chain_request(ChainRequest::SubmitTransaction { transaction })
            .await?
        {
            ChainResponse::SubmitTransaction => Ok(()),
            ChainResponse::Error(e) => Err(RpcError::TransactionApplication(e.message)),
            other => Err(RpcError::LocalRpc(format!("unexpected reply: {other:?}"))),
        }
    }

    async fn is_connected_to_chain(&self) -> Result<bool, RpcError> {
        Ok(self.get_chain_id().await.is_ok())
    }

    async fn is_connected_to_block_store(&self) -> Result<bool, RpcError> {
        Ok(self.get_blocks_by_id(&[]).await.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct ScriptedBus {
        reply: Bytes,
    }

    #[async_trait]
    impl MessageBus for ScriptedBus {
        async fn rpc(
            &self,
            _content_type: &str,
            _target: &str,
            _payload: Bytes,
        ) -> Result<Bytes, BusError> {
            Ok(self.reply.clone())
        }

        fn subscribe_broadcast(&self, _topic: &str) -> mpsc::Receiver<Bytes> {
            mpsc::channel(1).1
        }
    }

    fn client(reply: &str) -> ChainClient {
        ChainClient::new(
            Arc::new(ScriptedBus {
                reply: Bytes::copy_from_slice(reply.as_bytes()),
            }),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn chain_id_reply_decodes() {
        let client = client(r#"{"type":"chain_id","value":{"chain_id":"abcd"}}"#);

        let chain_id = client.get_chain_id().await.unwrap();
        assert_eq!(chain_id.as_bytes(), &[0xab, 0xcd]);
    }

    #[tokio::test]
    async fn error_reply_is_local_rpc_error() {
        let client = client(r#"{"type":"error","value":{"message":"no head"}}"#);

        let err = client.get_head_info().await.unwrap_err();
        assert!(matches!(err, RpcError::LocalRpc(_)));
    }

    #[tokio::test]
    async fn irreversibility_code_maps_to_its_own_error() {
        let client = client(
            r#"{"type":"error","value":{"message":"too old","code":"block_irreversibility"}}"#,
        );

        let err = client.apply_block(&Block::default()).await.unwrap_err();
        assert!(matches!(err, RpcError::BlockIrreversibility(_)));
    }

    #[tokio::test]
    async fn rejected_block_maps_to_application_error() {
        let client = client(r#"{"type":"error","value":{"message":"bad signature"}}"#);

        let err = client.apply_block(&Block::default()).await.unwrap_err();
        assert!(matches!(err, RpcError::BlockApplication(_)));
    }

    #[tokio::test]
    async fn malformed_reply_is_local_rpc_error() {
        let client = client("not json");

        let err = client.get_chain_id().await.unwrap_err();
        assert!(matches!(err, RpcError::LocalRpc(_)));
    }
}
