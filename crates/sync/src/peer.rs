//! Per-peer connection worker.
//!
//! One worker per connected peer, spawned by the connection manager under a
//! per-peer cancellation scope. The worker verifies the peer during a
//! handshake, then runs a head poll task and a downloader task until it is
//! cancelled or hits a terminal fault.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use koinos_p2p_config::{Checkpoint, PeerConnectionConfig, SyncConfig};
use koinos_p2p_network::PeerId;
use koinos_p2p_rpc::{LocalRpc, RemoteRpc, RpcError};
use koinos_p2p_types::{
    Block, GossipVote, NodeUpdate, P2pError, PeerError, PeerHeadInfo,
};

use crate::tracker::{TrackerHandle, TrackerMsg};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum PeerState {
    Starting,
    Handshaking,
    Running,
    Cancelled,
    Errored,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::Starting => "starting",
            PeerState::Handshaking => "handshaking",
            PeerState::Running => "running",
            PeerState::Cancelled => "cancelled",
            PeerState::Errored => "errored",
        };
        s.fmt(f)
    }
}

#[derive(Clone)]
pub struct PeerConnection {
    peer: PeerId,
    remote: Arc<dyn RemoteRpc>,
    local: Arc<dyn LocalRpc>,
    config: PeerConnectionConfig,
    sync_config: SyncConfig,
    checkpoints: Vec<Checkpoint>,
    tracker: TrackerHandle,
    updates: watch::Receiver<NodeUpdate>,
    tx_err: mpsc::Sender<PeerError>,
}

impl PeerConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer: PeerId,
        remote: Arc<dyn RemoteRpc>,
        local: Arc<dyn LocalRpc>,
        config: PeerConnectionConfig,
        sync_config: SyncConfig,
        checkpoints: Vec<Checkpoint>,
        tracker: TrackerHandle,
        tx_err: mpsc::Sender<PeerError>,
    ) -> Self {
        let updates = tracker.subscribe_updates();

        Self {
            peer,
            remote,
            local,
            config,
            sync_config,
            checkpoints,
            tracker,
            updates,
            tx_err,
        }
    }

    pub fn spawn(self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    pub async fn run(self, token: CancellationToken) {
        debug!(peer = %self.peer, state = %PeerState::Starting, "Peer worker");

        let head = match self.handshake_loop(&token).await {
            Ok(head) => head,
            Err(state) => {
                debug!(peer = %self.peer, %state, "Peer worker exiting");
                return;
            }
        };

        info!(
            peer = %self.peer,
            head_height = head.head_height,
            state = %PeerState::Running,
            "Peer verified"
        );

        let (tx_head, rx_head) = watch::channel(head);

        let poll = {
            let worker = self.clone();
            let token = token.clone();
            tokio::spawn(async move { worker.head_poll_loop(token, tx_head).await })
        };

        let download = {
            let worker = self.clone();
            let token = token.clone();
            tokio::spawn(async move { worker.download_loop(token, rx_head).await })
        };

        let _ = tokio::join!(poll, download);

        debug!(peer = %self.peer, "Peer worker exited");
    }

    /// Run the handshake until it succeeds, the fault is terminal, or the
    /// scope is cancelled. Returns the peer's head on success.
    async fn handshake_loop(&self, token: &CancellationToken) -> Result<PeerHeadInfo, PeerState> {
        debug!(peer = %self.peer, state = %PeerState::Handshaking, "Peer worker");

        loop {
            let result = tokio::select! {
                _ = token.cancelled() => return Err(PeerState::Cancelled),
                result = self.handshake() => result,
            };

            match result {
                Ok(head) => return Ok(head),
                Err(error) => {
                    let terminal = error.is_terminal();
                    self.report(error).await;

                    if terminal {
                        // Terminal faults score at the disconnect threshold;
                        // this worker never queries the peer again.
                        token.cancel();
                        return Err(PeerState::Errored);
                    }

                    tokio::select! {
                        _ = token.cancelled() => return Err(PeerState::Cancelled),
                        _ = tokio::time::sleep(self.config.head_poll_interval) => {}
                    }
                }
            }
        }
    }

    /// Verify the peer: same chain id, a fork containing our last
    /// irreversible block, and agreement on every configured checkpoint.
    async fn handshake(&self) -> Result<PeerHeadInfo, P2pError> {
        let local_chain_id = self.local.get_chain_id().await.map_err(P2pError::from)?;
        let remote_chain_id = self.remote.get_chain_id(self.peer).await?;

        if remote_chain_id != local_chain_id {
            return Err(P2pError::ChainIdMismatch {
                local: local_chain_id,
                remote: remote_chain_id,
            });
        }

        let (head_id, head_height) = self.remote.get_head_block(self.peer).await?;

        let lib = self.updates.borrow().lib.clone();
        if !lib.is_genesis() && head_height >= lib.height {
            let ancestor = self
                .remote
                .get_ancestor_block_id(self.peer, head_id.clone(), lib.height)
                .await?;

            if ancestor != lib.id {
                return Err(P2pError::ChainNotConnected(format!(
                    "peer fork does not contain {} at height {}",
                    lib.id, lib.height
                )));
            }
        }

        for checkpoint in &self.checkpoints {
            if checkpoint.height > head_height {
                continue;
            }

            let id = self
                .remote
                .get_ancestor_block_id(self.peer, head_id.clone(), checkpoint.height)
                .await?;

            if id != checkpoint.id {
                return Err(P2pError::CheckpointMismatch {
                    height: checkpoint.height,
                });
            }
        }

        let head = PeerHeadInfo::new(head_id.clone(), head_height);

        self.tracker
            .send(TrackerMsg::PeerHead {
                peer: self.peer,
                head_id,
                head_height,
            })
            .await;

        Ok(head)
    }

    /// Poll the remote head and publish a gossip vote at every interval.
    async fn head_poll_loop(&self, token: CancellationToken, tx_head: watch::Sender<PeerHeadInfo>) {
        let mut tick = tokio::time::interval(self.config.head_poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tick.tick() => {}
            }

            match self.remote.get_head_block(self.peer).await {
                Ok((head_id, head_height)) => {
                    let _ = tx_head.send(PeerHeadInfo::new(head_id.clone(), head_height));

                    self.tracker
                        .send(TrackerMsg::PeerHead {
                            peer: self.peer,
                            head_id,
                            head_height,
                        })
                        .await;

                    let local_height = self.updates.borrow().head.height;
                    let synced =
                        head_height.abs_diff(local_height) <= self.sync_config.synced_threshold_blocks;

                    self.tracker
                        .send(TrackerMsg::GossipVote(GossipVote {
                            peer: self.peer,
                            synced,
                        }))
                        .await;
                }

                Err(error) => {
                    let terminal = error.is_terminal();
                    self.report(error).await;

                    if terminal {
                        token.cancel();
                        return;
                    }
                }
            }
        }
    }

    /// Download blocks whenever the interest window allows it. The update
    /// channel is last-value-wins, so a backlog of stale windows is never
    /// observed.
    async fn download_loop(
        &self,
        token: CancellationToken,
        rx_head: watch::Receiver<PeerHeadInfo>,
    ) {
        let mut updates = self.updates.clone();

        loop {
            let update = updates.borrow_and_update().clone();

            if !update.interest.is_empty() {
                self.download_window(&update, &rx_head).await;
            }

            tokio::select! {
                _ = token.cancelled() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.tracker.send(TrackerMsg::ReleaseClaims(self.peer)).await;
    }

    /// Claim and fetch batches until the window is exhausted for this peer.
    /// Heights are strictly ascending; claims not applied are released.
    async fn download_window(&self, update: &NodeUpdate, rx_head: &watch::Receiver<PeerHeadInfo>) {
        loop {
            let peer_head = rx_head.borrow().clone();

            let claim = self
                .tracker
                .claim_range(
                    self.peer,
                    update.interest.start_height,
                    self.config.download_batch_size,
                )
                .await;

            let Some(claim) = claim else {
                return;
            };

            // Clip to what the peer can actually serve.
            if claim.start_height > peer_head.head_height {
                self.tracker.send(TrackerMsg::ReleaseClaims(self.peer)).await;
                return;
            }

            let num_blocks = claim
                .num_blocks
                .min((peer_head.head_height - claim.start_height + 1).min(u32::MAX as u64) as u32);

            debug!(
                peer = %self.peer,
                start = claim.start_height,
                num = num_blocks,
                "Downloading blocks"
            );

            let blocks = self
                .remote
                .get_blocks(
                    self.peer,
                    peer_head.head_id.clone(),
                    claim.start_height,
                    num_blocks,
                    self.config.download_timeout,
                )
                .await;

            let blocks = match blocks {
                Ok(blocks) => blocks,
                Err(error) => {
                    self.tracker.send(TrackerMsg::ReleaseClaims(self.peer)).await;
                    self.report(error).await;
                    return;
                }
            };

            if blocks.is_empty() {
                self.tracker.send(TrackerMsg::ReleaseClaims(self.peer)).await;
                self.report(P2pError::PeerRpc("got 0 blocks from peer".to_string()))
                    .await;
                return;
            }

            let mut expected_height = claim.start_height;

            for bytes in &blocks {
                let block: Block = match serde_json::from_slice(bytes) {
                    Ok(block) => block,
                    Err(e) => {
                        self.tracker.send(TrackerMsg::ReleaseClaims(self.peer)).await;
                        self.report(P2pError::Deserialization(e.to_string())).await;
                        return;
                    }
                };

                if block.header.height != expected_height {
                    self.tracker.send(TrackerMsg::ReleaseClaims(self.peer)).await;
                    self.report(P2pError::PeerRpc(format!(
                        "expected block at height {expected_height}, got {}",
                        block.header.height
                    )))
                    .await;
                    return;
                }

                if let Err(error) = self.apply_block(&block).await {
                    self.tracker.send(TrackerMsg::ReleaseClaims(self.peer)).await;
                    self.report(error).await;
                    return;
                }

                expected_height += 1;
            }

            // Claimed heights beyond what the peer served go back to the pool.
            if (expected_height - claim.start_height) < claim.num_blocks as u64 {
                self.tracker.send(TrackerMsg::ReleaseClaims(self.peer)).await;
            }
        }
    }

    async fn apply_block(&self, block: &Block) -> Result<(), P2pError> {
        match self.local.apply_block(block).await {
            Ok(()) => {
                debug!(peer = %self.peer, id = %block.id, height = block.header.height, "Applied block");

                self.tracker
                    .send(TrackerMsg::BlockApplied {
                        peer: self.peer,
                        topology: block.topology(),
                    })
                    .await;

                Ok(())
            }

            // Local bus faults are ours; the download is retried on the
            // next interest tick.
            Err(e @ (RpcError::LocalRpc(_) | RpcError::LocalRpcTimeout)) => {
                warn!(peer = %self.peer, error = %e, "Local chain unavailable while applying block");
                Err(P2pError::from(e))
            }

            Err(e) => Err(P2pError::from(e)),
        }
    }

    async fn report(&self, error: P2pError) {
        warn!(peer = %self.peer, %error, "Peer worker fault");

        if self
            .tx_err
            .send(PeerError::new(self.peer, error))
            .await
            .is_err()
        {
            debug!("Error channel closed, dropping peer error report");
        }
    }
}
