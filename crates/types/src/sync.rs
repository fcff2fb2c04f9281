use std::time::Instant;

use libp2p_identity::PeerId;

use crate::{BlockId, BlockTopology};

/// The contiguous half-open height window `[start, start + num)` the local
/// node is willing to download.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DownloadInterest {
    pub start_height: u64,
    pub num_blocks: u32,
}

impl DownloadInterest {
    pub fn is_empty(&self) -> bool {
        self.num_blocks == 0
    }

    /// Exclusive end of the window.
    pub fn end_height(&self) -> u64 {
        self.start_height + self.num_blocks as u64
    }

    pub fn contains(&self, height: u64) -> bool {
        height >= self.start_height && height < self.end_height()
    }
}

/// Snapshot of the local node broadcast to every peer worker.
///
/// Carried on a watch channel, so a slow worker only ever observes the most
/// recent value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeUpdate {
    /// Topology of the local head block.
    pub head: BlockTopology,

    /// Topology of the last irreversible block.
    pub lib: BlockTopology,

    /// The height window the node currently wants to download.
    pub interest: DownloadInterest,
}

/// Per-peer cache of the remote head, refreshed by the head poll task.
#[derive(Clone, Debug)]
pub struct PeerHeadInfo {
    pub head_id: BlockId,
    pub head_height: u64,
    pub last_observed_at: Instant,
}

impl PeerHeadInfo {
    pub fn new(head_id: BlockId, head_height: u64) -> Self {
        Self {
            head_id,
            head_height,
            last_observed_at: Instant::now(),
        }
    }
}

/// A peer worker's periodic verdict on whether its peer looks synchronized
/// with the local node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GossipVote {
    pub peer: PeerId,
    pub synced: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_window_bounds() {
        let interest = DownloadInterest {
            start_height: 101,
            num_blocks: 64,
        };

        assert!(!interest.is_empty());
        assert_eq!(interest.end_height(), 165);
        assert!(interest.contains(101));
        assert!(interest.contains(164));
        assert!(!interest.contains(165));
        assert!(!interest.contains(100));
    }
}
