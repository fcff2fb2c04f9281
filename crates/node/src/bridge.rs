//! Bridge from the local bus broadcasts into the gossip controller and the
//! sync tracker.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use koinos_p2p_gossip::GossipHandle;
use koinos_p2p_rpc::{
    MessageBus, BLOCK_ACCEPT_TOPIC, FORKS_UPDATE_TOPIC, TRANSACTION_ACCEPT_TOPIC,
};
use koinos_p2p_sync::{TrackerHandle, TrackerMsg};
use koinos_p2p_types::{BlockAccepted, ForkHeads};

pub struct BusBridge;

impl BusBridge {
    pub fn spawn(
        bus: Arc<dyn MessageBus>,
        gossip: GossipHandle,
        tracker: TrackerHandle,
        token: CancellationToken,
    ) {
        let mut rx_blocks = bus.subscribe_broadcast(BLOCK_ACCEPT_TOPIC);
        let mut rx_transactions = bus.subscribe_broadcast(TRANSACTION_ACCEPT_TOPIC);
        let mut rx_forks = bus.subscribe_broadcast(FORKS_UPDATE_TOPIC);

        {
            let gossip = gossip.clone();
            let tracker = tracker.clone();
            let token = token.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,

                        payload = rx_blocks.recv() => match payload {
                            Some(payload) => {
                                // The serialized payload goes out verbatim.
                                gossip.publish_block(payload.clone()).await;

                                match serde_json::from_slice::<BlockAccepted>(&payload) {
                                    Ok(accepted) => {
                                        tracker
                                            .send(TrackerMsg::BlockAccepted(
                                                accepted.block.topology(),
                                            ))
                                            .await;
                                    }
                                    Err(e) => {
                                        warn!("Malformed block accept broadcast: {e}")
                                    }
                                }
                            }
                            None => return,
                        },
                    }
                }
            });
        }

        {
            let token = token.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,

                        payload = rx_transactions.recv() => match payload {
                            Some(payload) => gossip.publish_transaction(payload).await,
                            None => return,
                        },
                    }
                }
            });
        }

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,

                    payload = rx_forks.recv() => match payload {
                        Some(payload) => match serde_json::from_slice::<ForkHeads>(&payload) {
                            Ok(fork_heads) => {
                                debug!(
                                    lib = fork_heads.last_irreversible_block.height,
                                    "Fork heads update"
                                );
                                tracker.send(TrackerMsg::ForkHeads(fork_heads)).await;
                            }
                            Err(e) => warn!("Malformed fork heads broadcast: {e}"),
                        },
                        None => return,
                    },
                }
            }
        });
    }
}
