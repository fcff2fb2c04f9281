use std::collections::HashMap;
use std::time::{Duration, Instant};

use koinos_p2p_network::{PeerId, Topic};

/// Per-peer fixed-window message budget for inbound gossip.
#[derive(Debug)]
pub struct RateGate {
    window: Duration,
    limit_blocks: u32,
    limit_transactions: u32,
    counts: HashMap<(PeerId, Topic), WindowCount>,
}

#[derive(Debug)]
struct WindowCount {
    window_start: Instant,
    count: u32,
}

impl RateGate {
    pub fn new(limit_blocks: u32, limit_transactions: u32) -> Self {
        Self {
            window: Duration::from_secs(1),
            limit_blocks,
            limit_transactions,
            counts: HashMap::new(),
        }
    }

    fn limit(&self, topic: Topic) -> u32 {
        match topic {
            Topic::Block => self.limit_blocks,
            Topic::Transaction => self.limit_transactions,
        }
    }

    /// Whether a message from `peer` on `topic` is within budget at `now`.
    pub fn allow(&mut self, topic: Topic, peer: PeerId, now: Instant) -> bool {
        let window = self.window;
        let limit = self.limit(topic);

        // Windows that rolled over are dead weight.
        self.counts
            .retain(|_, entry| now.saturating_duration_since(entry.window_start) < window);

        let entry = self.counts.entry((peer, topic)).or_insert(WindowCount {
            window_start: now,
            count: 0,
        });

        if entry.count >= limit {
            return false;
        }

        entry.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_per_peer_and_per_topic() {
        let mut gate = RateGate::new(2, 2);
        let peer_a = PeerId::random();
        let peer_b = PeerId::random();
        let now = Instant::now();

        assert!(gate.allow(Topic::Block, peer_a, now));
        assert!(gate.allow(Topic::Block, peer_a, now));
        assert!(!gate.allow(Topic::Block, peer_a, now));

        // Other peers and topics have their own budget.
        assert!(gate.allow(Topic::Block, peer_b, now));
        assert!(gate.allow(Topic::Transaction, peer_a, now));
    }

    #[test]
    fn budget_resets_when_the_window_rolls() {
        let mut gate = RateGate::new(1, 1);
        let peer = PeerId::random();
        let now = Instant::now();

        assert!(gate.allow(Topic::Block, peer, now));
        assert!(!gate.allow(Topic::Block, peer, now));

        let later = now + Duration::from_secs(1);
        assert!(gate.allow(Topic::Block, peer, later));
    }
}
