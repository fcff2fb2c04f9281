use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use koinos_p2p_network::PeerId;
use koinos_p2p_types::{P2pError, PeerError};

use crate::{LocalRpc, PeerRpcRequest, PeerRpcResponse, RpcError};

/// Server side of the peer RPC service: answers remote peers by asking the
/// local chain.
pub struct PeerRpcServer {
    local: Arc<dyn LocalRpc>,
    process_timeout: Duration,
    tx_err: mpsc::Sender<PeerError>,
}

impl PeerRpcServer {
    pub fn new(
        local: Arc<dyn LocalRpc>,
        process_timeout: Duration,
        tx_err: mpsc::Sender<PeerError>,
    ) -> Self {
        Self {
            local,
            process_timeout,
            tx_err,
        }
    }

    /// Handle one inbound request body, always producing a response body.
    ///
    /// Faults while serving are reported on the error channel, attributed to
    /// the requesting peer; self-inflicted kinds carry a small weight there.
    pub async fn handle(&self, peer: PeerId, body: Bytes) -> Bytes {
        let request: PeerRpcRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                self.report(peer, P2pError::Deserialization(e.to_string()))
                    .await;
                return encode(&PeerRpcResponse::error("malformed request"));
            }
        };

        debug!(%peer, ?request, "Serving peer request");

        let response = match tokio::time::timeout(self.process_timeout, self.serve(&request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let message = e.to_string();
                self.report(peer, P2pError::from(e)).await;
                PeerRpcResponse::error(message)
            }
            Err(_) => {
                warn!(%peer, ?request, "Timed out serving peer request");
                self.report(peer, P2pError::ProcessRequestTimeout).await;
                PeerRpcResponse::error("request processing timed out")
            }
        };

        encode(&response)
    }

    async fn serve(&self, request: &PeerRpcRequest) -> Result<PeerRpcResponse, RpcError> {
        match request {
            PeerRpcRequest::GetChainId => {
                let id = self.local.get_chain_id().await?;
                Ok(PeerRpcResponse::ChainId { id })
            }

            PeerRpcRequest::GetHeadBlock => {
                let head = self.local.get_head_info().await?;
                Ok(PeerRpcResponse::HeadBlock {
                    id: head.id,
                    height: head.height,
                })
            }

            PeerRpcRequest::GetAncestorBlockId {
                parent_id,
                child_height,
            } => {
                let blocks = self
                    .local
                    .get_blocks_by_height(parent_id, *child_height, 1)
                    .await?;

                if blocks.len() != 1 {
                    return Err(RpcError::UnexpectedResultCount(blocks.len()));
                }

                Ok(PeerRpcResponse::AncestorBlockId {
                    id: blocks[0].id.clone(),
                })
            }

            PeerRpcRequest::GetBlocks {
                head_id,
                start_height,
                num_blocks,
            } => {
                let blocks = self
                    .local
                    .get_blocks_by_height(head_id, *start_height, *num_blocks)
                    .await?;

                let blocks = blocks
                    .iter()
                    .map(|block| {
                        serde_json::to_vec(block)
                            .map(Bytes::from)
                            .map_err(|e| RpcError::Serialization(e.to_string()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(PeerRpcResponse::Blocks { blocks })
            }
        }
    }

    async fn report(&self, peer: PeerId, error: P2pError) {
        if self.tx_err.send(PeerError::new(peer, error)).await.is_err() {
            debug!("Error channel closed, dropping peer error report");
        }
    }
}

fn encode(response: &PeerRpcResponse) -> Bytes {
    // A response this small cannot fail to serialize.
    serde_json::to_vec(response)
        .map(Bytes::from)
        .unwrap_or_else(|_| Bytes::from_static(b"{\"result\":\"error\",\"value\":{\"message\":\"internal\"}}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use koinos_p2p_types::{Block, BlockHeader, BlockId, BlockTopology, ChainId, ForkHeads, Transaction};

    /// A scripted chain: block ids are the block height plus a per-chain
    /// delta, so distinct test chains produce distinct ids.
    struct TestChain {
        chain_id: ChainId,
        height: u64,
        id_delta: u64,
    }

    impl TestChain {
        fn block_id(&self, height: u64) -> BlockId {
            BlockId::from((height + self.id_delta).to_be_bytes().to_vec())
        }

        fn block(&self, height: u64) -> Block {
            Block {
                id: self.block_id(height),
                header: BlockHeader {
                    previous: self.block_id(height.saturating_sub(1)),
                    height,
                    timestamp: height * 3_000,
                },
                payload: Bytes::new(),
            }
        }
    }

    #[async_trait]
    impl LocalRpc for TestChain {
        async fn get_chain_id(&self) -> Result<ChainId, RpcError> {
            Ok(self.chain_id.clone())
        }

        async fn get_head_info(&self) -> Result<BlockTopology, RpcError> {
            Ok(self.block(self.height).topology())
        }

        async fn get_fork_heads(&self) -> Result<ForkHeads, RpcError> {
            Ok(ForkHeads {
                last_irreversible_block: self.block(self.height.saturating_sub(10)).topology(),
                heads: vec![self.block(self.height).topology()],
            })
        }

        async fn get_blocks_by_height(
            &self,
            _head_id: &BlockId,
            start_height: u64,
            num_blocks: u32,
        ) -> Result<Vec<Block>, RpcError> {
            Ok((start_height..start_height + num_blocks as u64)
                .filter(|h| *h <= self.height)
                .map(|h| self.block(h))
                .collect())
        }

        async fn get_blocks_by_id(&self, ids: &[BlockId]) -> Result<Vec<Block>, RpcError> {
            let _ = ids;
            Ok(vec![])
        }

        async fn apply_block(&self, _block: &Block) -> Result<(), RpcError> {
            Ok(())
        }

        async fn apply_transaction(&self, _transaction: &Transaction) -> Result<(), RpcError> {
            Ok(())
        }

        async fn is_connected_to_chain(&self) -> Result<bool, RpcError> {
            Ok(true)
        }

        async fn is_connected_to_block_store(&self) -> Result<bool, RpcError> {
            Ok(true)
        }
    }

    fn server(height: u64) -> (PeerRpcServer, mpsc::Receiver<PeerError>) {
        let (tx_err, rx_err) = mpsc::channel(16);
        let local = Arc::new(TestChain {
            chain_id: ChainId::from(vec![0xaa]),
            height,
            id_delta: 0,
        });

        (
            PeerRpcServer::new(local, Duration::from_secs(1), tx_err),
            rx_err,
        )
    }

    async fn call(server: &PeerRpcServer, request: &PeerRpcRequest) -> PeerRpcResponse {
        let body = Bytes::from(serde_json::to_vec(request).unwrap());
        let reply = server.handle(PeerId::random(), body).await;
        serde_json::from_slice(&reply).unwrap()
    }

    #[tokio::test]
    async fn serves_chain_id_and_head() {
        let (server, _rx) = server(128);

        let response = call(&server, &PeerRpcRequest::GetChainId).await;
        assert_eq!(
            response,
            PeerRpcResponse::ChainId {
                id: ChainId::from(vec![0xaa])
            }
        );

        let response = call(&server, &PeerRpcRequest::GetHeadBlock).await;
        let PeerRpcResponse::HeadBlock { height, .. } = response else {
            panic!("expected head block, got {response:?}");
        };
        assert_eq!(height, 128);
    }

    #[tokio::test]
    async fn ancestor_requires_exactly_one_block() {
        let (server, _rx) = server(128);

        // Height beyond the chain tip returns zero blocks.
        let response = call(
            &server,
            &PeerRpcRequest::GetAncestorBlockId {
                parent_id: BlockId::from(vec![0x01]),
                child_height: 1_000,
            },
        )
        .await;

        assert!(matches!(response, PeerRpcResponse::Error { .. }));
    }

    #[tokio::test]
    async fn blocks_are_served_in_ascending_order() {
        let (server, _rx) = server(128);

        let response = call(
            &server,
            &PeerRpcRequest::GetBlocks {
                head_id: BlockId::from(vec![0x01]),
                start_height: 10,
                num_blocks: 3,
            },
        )
        .await;

        let PeerRpcResponse::Blocks { blocks } = response else {
            panic!("expected blocks, got {response:?}");
        };

        let heights: Vec<u64> = blocks
            .iter()
            .map(|b| serde_json::from_slice::<Block>(b).unwrap().header.height)
            .collect();

        assert_eq!(heights, vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn malformed_request_reports_deserialization_error() {
        let (server, mut rx) = server(128);

        let reply = server
            .handle(PeerId::random(), Bytes::from_static(b"not json"))
            .await;

        let response: PeerRpcResponse = serde_json::from_slice(&reply).unwrap();
        assert!(matches!(response, PeerRpcResponse::Error { .. }));

        let reported = rx.recv().await.unwrap();
        assert_eq!(
            reported.kind(),
            koinos_p2p_types::ErrorKind::Deserialization
        );
    }
}
