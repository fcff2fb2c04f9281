//! Sync state tracker: aggregates peer heads and gossip votes, derives the
//! download interest window, arbitrates download claims, and decides when
//! the node switches between syncing and gossiping.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use koinos_p2p_config::SyncConfig;
use koinos_p2p_network::PeerId;
use koinos_p2p_types::{
    BlockId, BlockTopology, DownloadInterest, ForkHeads, GossipVote, NodeUpdate,
};

#[derive(Debug)]
pub enum TrackerMsg {
    /// A worker refreshed its peer's head.
    PeerHead {
        peer: PeerId,
        head_id: BlockId,
        head_height: u64,
    },

    /// A worker's periodic synced/not-synced verdict for its peer.
    GossipVote(GossipVote),

    /// Fork heads update from the local chain.
    ForkHeads(ForkHeads),

    /// A block the local chain just accepted.
    BlockAccepted(BlockTopology),

    /// A worker requests a contiguous sub-range of the interest window to
    /// download. The granted range is disjoint from every other claim.
    ClaimRange {
        peer: PeerId,
        start_height: u64,
        max_blocks: u32,
        reply: oneshot::Sender<Option<DownloadInterest>>,
    },

    /// A claimed block was applied to the local chain.
    BlockApplied {
        peer: PeerId,
        topology: BlockTopology,
    },

    /// A worker abandons whatever it still has claimed.
    ReleaseClaims(PeerId),

    /// A peer disconnected; all its state is dropped.
    PeerRemoved(PeerId),
}

/// Cloneable handle to the tracker task.
#[derive(Clone, Debug)]
pub struct TrackerHandle {
    tx: mpsc::Sender<TrackerMsg>,
    rx_update: watch::Receiver<NodeUpdate>,
    rx_synced: watch::Receiver<bool>,
}

impl TrackerHandle {
    pub async fn send(&self, msg: TrackerMsg) {
        if self.tx.send(msg).await.is_err() {
            debug!("Tracker channel closed, dropping message");
        }
    }

    /// Last-value-wins channel of node updates consumed by peer workers.
    pub fn subscribe_updates(&self) -> watch::Receiver<NodeUpdate> {
        self.rx_update.clone()
    }

    /// The sticky synced flag consumed by the gossip controller.
    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.rx_synced.clone()
    }

    pub async fn claim_range(
        &self,
        peer: PeerId,
        start_height: u64,
        max_blocks: u32,
    ) -> Option<DownloadInterest> {
        let (reply, rx) = oneshot::channel();

        self.send(TrackerMsg::ClaimRange {
            peer,
            start_height,
            max_blocks,
            reply,
        })
        .await;

        rx.await.ok().flatten()
    }
}

pub struct SyncStateTracker {
    config: SyncConfig,
    rx_msg: mpsc::Receiver<TrackerMsg>,
    tx_update: watch::Sender<NodeUpdate>,
    tx_synced: watch::Sender<bool>,

    head: BlockTopology,
    lib: BlockTopology,
    peer_heads: HashMap<PeerId, (BlockId, u64)>,
    votes: HashMap<PeerId, bool>,
    synced: bool,

    /// Height -> downloading peer, disjoint claims only.
    in_flight: HashMap<u64, PeerId>,

    /// Height -> block id applied this session, pruned as the head advances.
    applied: HashMap<u64, BlockId>,
}

impl SyncStateTracker {
    /// Build a tracker and its handle. The tracker itself must then be
    /// driven with [`SyncStateTracker::run`].
    pub fn channel(config: SyncConfig) -> (TrackerHandle, SyncStateTracker) {
        let (tx, rx_msg) = mpsc::channel(64);
        let (tx_update, rx_update) = watch::channel(NodeUpdate::default());
        let (tx_synced, rx_synced) = watch::channel(false);

        let handle = TrackerHandle {
            tx,
            rx_update,
            rx_synced,
        };

        let tracker = SyncStateTracker {
            config,
            rx_msg,
            tx_update,
            tx_synced,
            head: BlockTopology::default(),
            lib: BlockTopology::default(),
            peer_heads: HashMap::new(),
            votes: HashMap::new(),
            synced: false,
            in_flight: HashMap::new(),
            applied: HashMap::new(),
        };

        (handle, tracker)
    }

    pub async fn run(mut self, token: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.recompute_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,

                _ = tick.tick() => self.recompute(),

                msg = self.rx_msg.recv() => match msg {
                    Some(msg) => {
                        self.handle_msg(msg);
                        self.recompute();
                    }
                    None => return,
                },
            }
        }
    }

    fn handle_msg(&mut self, msg: TrackerMsg) {
        match msg {
            TrackerMsg::PeerHead {
                peer,
                head_id,
                head_height,
            } => {
                self.peer_heads.insert(peer, (head_id, head_height));
            }

            TrackerMsg::GossipVote(vote) => {
                self.votes.insert(vote.peer, vote.synced);
            }

            TrackerMsg::ForkHeads(fork_heads) => {
                if let Some(head) = fork_heads.best_head() {
                    self.advance_head(head.clone());
                }
                self.lib = fork_heads.last_irreversible_block;
            }

            TrackerMsg::BlockAccepted(topology) => {
                self.advance_head(topology);
            }

            TrackerMsg::ClaimRange {
                peer,
                start_height,
                max_blocks,
                reply,
            } => {
                let granted = self.claim_range(peer, start_height, max_blocks);
                let _ = reply.send(granted);
            }

            TrackerMsg::BlockApplied { peer, topology } => {
                if self.in_flight.get(&topology.height) == Some(&peer) {
                    self.in_flight.remove(&topology.height);
                }

                // A block extending the head moves it; the fork-heads
                // broadcast remains authoritative and may move it again.
                if topology.height == self.head.height + 1 && topology.previous == self.head.id {
                    self.head = topology.clone();
                }

                self.applied.insert(topology.height, topology.id);
            }

            TrackerMsg::ReleaseClaims(peer) => {
                self.in_flight.retain(|_, claimant| *claimant != peer);
            }

            TrackerMsg::PeerRemoved(peer) => {
                self.peer_heads.remove(&peer);
                self.votes.remove(&peer);
                self.in_flight.retain(|_, claimant| *claimant != peer);
            }
        }
    }

    fn advance_head(&mut self, topology: BlockTopology) {
        if topology.height >= self.head.height {
            self.head = topology;
        }
    }

    fn max_peer_head(&self) -> u64 {
        self.peer_heads.values().map(|(_, h)| *h).max().unwrap_or(0)
    }

    fn median_peer_head(&self) -> Option<u64> {
        if self.peer_heads.is_empty() {
            return None;
        }

        let mut heights: Vec<u64> = self.peer_heads.values().map(|(_, h)| *h).collect();
        heights.sort_unstable();
        Some(heights[heights.len() / 2])
    }

    /// `start = local_head + 1`,
    /// `num = min(window, max(0, max_peer_head - local_head))`.
    fn compute_interest(&self) -> DownloadInterest {
        let behind = self.max_peer_head().saturating_sub(self.head.height);

        DownloadInterest {
            start_height: self.head.height + 1,
            num_blocks: behind.min(self.config.window_size as u64) as u32,
        }
    }

    fn compute_synced(&self) -> bool {
        let Some(median) = self.median_peer_head() else {
            return self.synced;
        };

        if self.synced {
            // Sticky: fall back only when lagging far behind.
            median.saturating_sub(self.head.height) <= self.config.resync_threshold_blocks
        } else {
            let votes = self.votes.values().filter(|synced| **synced).count();

            median.saturating_sub(self.head.height) <= self.config.synced_threshold_blocks
                && votes >= self.config.synced_votes_required
        }
    }

    fn recompute(&mut self) {
        // Claims and applied marks at or below the head are settled.
        let head_height = self.head.height;
        self.in_flight.retain(|height, _| *height > head_height);
        self.applied.retain(|height, _| *height > head_height);

        let update = NodeUpdate {
            head: self.head.clone(),
            lib: self.lib.clone(),
            interest: self.compute_interest(),
        };

        if *self.tx_update.borrow() != update {
            debug!(
                start = update.interest.start_height,
                num = update.interest.num_blocks,
                "Download interest changed"
            );
            let _ = self.tx_update.send(update);
        }

        let synced = self.compute_synced();
        if synced != self.synced {
            info!(synced, head = self.head.height, "Sync state changed");
            self.synced = synced;
            let _ = self.tx_synced.send(synced);
        }
    }

    /// Grant the longest contiguous unclaimed run inside the interest
    /// window, starting at or after `start_height`, capped by `max_blocks`.
    fn claim_range(
        &mut self,
        peer: PeerId,
        start_height: u64,
        max_blocks: u32,
    ) -> Option<DownloadInterest> {
        if max_blocks == 0 {
            return None;
        }

        let interest = self.compute_interest();
        if interest.is_empty() {
            return None;
        }

        let taken = |tracker: &Self, height: u64| {
            tracker.in_flight.contains_key(&height) || tracker.applied.contains_key(&height)
        };

        let mut start = start_height.max(interest.start_height);
        while interest.contains(start) && taken(self, start) {
            start += 1;
        }

        if !interest.contains(start) {
            return None;
        }

        let mut num = 0u32;
        while num < max_blocks && interest.contains(start + num as u64) && !taken(self, start + num as u64)
        {
            num += 1;
        }

        for height in start..start + num as u64 {
            self.in_flight.insert(height, peer);
        }

        Some(DownloadInterest {
            start_height: start,
            num_blocks: num,
        })
    }
}
