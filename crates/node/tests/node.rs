//! End-to-end tests against an in-memory bus and a scripted chain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;

use koinos_p2p_config::Config;
use koinos_p2p_node::Node;
use koinos_p2p_rpc::{BusError, MessageBus};
use koinos_p2p_types::{Block, BlockHeader, BlockId, BlockTopology};

/// A scripted chain behind an in-memory bus. Block ids are the height plus
/// a per-chain delta, so distinct test chains produce distinct ids.
struct TestChain {
    chain_id: String,
    id_delta: u64,
    state: Mutex<ChainState>,
}

struct ChainState {
    height: u64,
    applied: Vec<u64>,
}

impl TestChain {
    fn new(chain_id: &str, height: u64, id_delta: u64) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            id_delta,
            state: Mutex::new(ChainState {
                height,
                applied: vec![],
            }),
        }
    }

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

    fn topology(&self, height: u64) -> BlockTopology {
        self.block(height).topology()
    }

    fn applied(&self) -> Vec<u64> {
        self.state.lock().unwrap().applied.clone()
    }
}

/// In-memory stand-in for the production message bus.
struct TestBus {
    chain: Arc<TestChain>,
    broadcast_senders: Mutex<HashMap<String, mpsc::Sender<Bytes>>>,
}

impl TestBus {
    fn new(chain: Arc<TestChain>) -> Arc<Self> {
        Arc::new(Self {
            chain,
            broadcast_senders: Mutex::new(HashMap::new()),
        })
    }

    fn handle_chain(&self, request: &serde_json::Value) -> serde_json::Value {
        let chain = &self.chain;

        match request["type"].as_str() {
            Some("get_chain_id") => json!({
                "type": "chain_id",
                "value": { "chain_id": chain.chain_id }
            }),

            Some("get_head_info") => {
                let height = chain.state.lock().unwrap().height;
                json!({
                    "type": "head_info",
                    "value": {
                        "head_topology": chain.topology(height),
                        "last_irreversible_block": height.saturating_sub(10),
                    }
                })
            }

            Some("get_fork_heads") => {
                let height = chain.state.lock().unwrap().height;
                json!({
                    "type": "fork_heads",
                    "value": {
                        "last_irreversible_block": chain.topology(0),
                        "heads": [chain.topology(height)],
                    }
                })
            }

            Some("submit_block") => {
                let block: Block =
                    serde_json::from_value(request["value"]["block"].clone()).unwrap();

                let mut state = chain.state.lock().unwrap();
                state.applied.push(block.header.height);
                state.height = state.height.max(block.header.height);

                json!({ "type": "submit_block" })
            }

            Some("submit_transaction") => json!({ "type": "submit_transaction" }),

            other => json!({
                "type": "error",
                "value": { "message": format!("unknown chain request: {other:?}") }
            }),
        }
    }

    fn handle_block_store(&self, request: &serde_json::Value) -> serde_json::Value {
        let chain = &self.chain;

        match request["type"].as_str() {
            Some("get_blocks_by_height") => {
                let start = request["value"]["ancestor_start_height"].as_u64().unwrap();
                let num = request["value"]["num_blocks"].as_u64().unwrap();
                let height = chain.state.lock().unwrap().height;

                let blocks: Vec<Block> = (start..start + num)
                    .filter(|h| *h <= height)
                    .map(|h| chain.block(h))
                    .collect();

                json!({
                    "type": "blocks",
                    "value": { "block_items": blocks }
                })
            }

            Some("get_blocks_by_id") => json!({
                "type": "blocks",
                "value": { "block_items": [] }
            }),

            other => json!({
                "type": "error",
                "value": { "message": format!("unknown block store request: {other:?}") }
            }),
        }
    }
}

#[async_trait]
impl MessageBus for TestBus {
    async fn rpc(
        &self,
        _content_type: &str,
        target: &str,
        payload: Bytes,
    ) -> Result<Bytes, BusError> {
        let request: serde_json::Value = serde_json::from_slice(&payload)
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        let reply = match target {
            "chain" => self.handle_chain(&request),
            "block_store" => self.handle_block_store(&request),
            other => json!({
                "type": "error",
                "value": { "message": format!("unknown target: {other}") }
            }),
        };

        Ok(Bytes::from(serde_json::to_vec(&reply).unwrap()))
    }

    fn subscribe_broadcast(&self, topic: &str) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(16);
        self.broadcast_senders
            .lock()
            .unwrap()
            .insert(topic.to_string(), tx);
        rx
    }
}

fn node_config(seed: &str) -> Config {
    let mut config = Config::default();
    config.node.seed = seed.to_string();
    config.node.listen_addr = "/ip4/127.0.0.1/tcp/0".parse().unwrap();
    config
}

#[tokio::test]
async fn node_exports_a_dialable_peer_address() {
    let chain = Arc::new(TestChain::new("aa", 128, 0));
    let bus = TestBus::new(chain);

    let mut node = Node::new(node_config("test1"), bus).await.unwrap();
    node.start().await.unwrap();

    let addr = node.peer_address().to_string();
    let peer_id = node.peer_id();

    assert!(addr.starts_with("/ip4/127.0.0.1/tcp/"));
    assert!(addr.ends_with(&format!("/p2p/{peer_id}")));
    // Port 0 resolved to a real port.
    assert!(!addr.contains("/tcp/0/"));

    node.close().await;
}

#[tokio::test]
async fn identity_is_deterministic_in_the_seed() {
    let make = |seed: &str| {
        let chain = Arc::new(TestChain::new("aa", 0, 0));
        let config = node_config(seed);
        let bus = TestBus::new(chain);
        async move { Node::new(config, bus).await.unwrap() }
    };

    let a = make("test1").await;
    let b = make("test1").await;
    let c = make("test2").await;

    assert_eq!(a.peer_id(), b.peer_id());
    assert_ne!(a.peer_id(), c.peer_id());

    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn lagging_node_syncs_from_its_peer() {
    let chain_a = Arc::new(TestChain::new("aa", 5, 0));
    let chain_b = Arc::new(TestChain::new("aa", 0, 0));

    let mut node_a = Node::new(node_config("seed-a"), TestBus::new(chain_a.clone()))
        .await
        .unwrap();
    node_a.start().await.unwrap();

    let mut config_b = node_config("seed-b");
    config_b.node.initial_peers = vec![node_a.peer_address()];

    let mut node_b = Node::new(config_b, TestBus::new(chain_b.clone()))
        .await
        .unwrap();
    node_b.start().await.unwrap();

    // Node B discovers A's head through its peer worker and downloads the
    // missing blocks through the peer RPC service.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);

    loop {
        if chain_b.applied() == vec![1, 2, 3, 4, 5] {
            break;
        }

        assert!(
            tokio::time::Instant::now() < deadline,
            "sync did not complete, applied: {:?}",
            chain_b.applied()
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    node_b.close().await;
    node_a.close().await;
}
