//! Error score reputation engine.
//!
//! Each peer accumulates a score from the faults it causes; the score decays
//! continuously with a configurable halflife. A peer at or above the
//! threshold is disconnected and gated from reconnecting until the score
//! decays back under it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use koinos_p2p_config::ErrorScoreConfig;
use koinos_p2p_network::{GateRequest, PeerId};
use koinos_p2p_types::{ErrorKind, PeerError};

#[derive(Debug)]
struct ErrorScoreRecord {
    last_update: Instant,
    score: u64,
}

/// Continuous exponential decay, floored to an integer: repeated
/// applications at the same instant are idempotent.
fn decayed(score: u64, elapsed: Duration, halflife: Duration) -> u64 {
    let halflife = halflife.as_secs_f64();
    if halflife <= 0.0 {
        return score;
    }

    let decay_constant = std::f64::consts::LN_2 / halflife;
    (score as f64 * (-decay_constant * elapsed.as_secs_f64()).exp()) as u64
}

/// The score map and its decay algebra. Owned exclusively by
/// [`ErrorScoreService`]; parameterized on the clock so the math is
/// deterministic under test.
#[derive(Debug)]
pub struct ErrorScorer {
    scores: HashMap<PeerId, ErrorScoreRecord>,
    config: ErrorScoreConfig,
}

impl ErrorScorer {
    pub fn new(config: ErrorScoreConfig) -> Self {
        Self {
            scores: HashMap::new(),
            config,
        }
    }

    pub fn threshold(&self) -> u64 {
        self.config.threshold
    }

    fn decay_record(record: &mut ErrorScoreRecord, now: Instant, halflife: Duration) {
        let elapsed = now.saturating_duration_since(record.last_update);
        record.score = decayed(record.score, elapsed, halflife);
        record.last_update = now;
    }

    /// Record a fault and return the peer's updated score.
    pub fn report(&mut self, peer: PeerId, kind: ErrorKind, now: Instant) -> u64 {
        let weight = self.config.score_for(kind);
        let halflife = self.config.decay_halflife;

        let record = self.scores.entry(peer).or_insert_with(|| ErrorScoreRecord {
            last_update: now,
            score: 0,
        });

        Self::decay_record(record, now, halflife);
        record.score += weight;
        record.score
    }

    /// True iff the peer has no record or its decayed score is strictly
    /// below the threshold.
    pub fn can_connect(&mut self, peer: PeerId, now: Instant) -> bool {
        let halflife = self.config.decay_halflife;

        match self.scores.get_mut(&peer) {
            Some(record) => {
                Self::decay_record(record, now, halflife);
                record.score < self.config.threshold
            }
            None => true,
        }
    }

    /// The peer's decayed score at `now`.
    pub fn score(&mut self, peer: PeerId, now: Instant) -> u64 {
        let halflife = self.config.decay_halflife;

        match self.scores.get_mut(&peer) {
            Some(record) => {
                Self::decay_record(record, now, halflife);
                record.score
            }
            None => 0,
        }
    }

    /// Drop records that have decayed to nothing.
    pub fn prune(&mut self, now: Instant) {
        let halflife = self.config.decay_halflife;

        self.scores.retain(|_, record| {
            let elapsed = now.saturating_duration_since(record.last_update);
            decayed(record.score, elapsed, halflife) > 0
        });
    }

    #[cfg(test)]
    fn tracked_peers(&self) -> usize {
        self.scores.len()
    }
}

/// The single task serializing all score reads and writes.
///
/// Drains the shared error channel and the host's `can_connect` queries;
/// when a report pushes a peer to the threshold, a disconnect command is
/// pushed towards the host on its own channel.
pub struct ErrorScoreService {
    scorer: ErrorScorer,
    rx_err: mpsc::Receiver<PeerError>,
    rx_gate: mpsc::Receiver<GateRequest>,
    tx_disconnect: mpsc::Sender<PeerId>,
}

impl ErrorScoreService {
    pub fn new(
        config: ErrorScoreConfig,
        rx_err: mpsc::Receiver<PeerError>,
        rx_gate: mpsc::Receiver<GateRequest>,
        tx_disconnect: mpsc::Sender<PeerId>,
    ) -> Self {
        Self {
            scorer: ErrorScorer::new(config),
            rx_err,
            rx_gate,
            tx_disconnect,
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,

                err = self.rx_err.recv() => match err {
                    Some(err) => self.handle_error(err, &token),
                    None => return,
                },

                req = self.rx_gate.recv() => match req {
                    Some(GateRequest { peer, reply }) => {
                        let allowed = self.scorer.can_connect(peer, Instant::now());
                        let _ = reply.send(allowed);
                    }
                    None => return,
                },
            }
        }
    }

    fn handle_error(&mut self, err: PeerError, token: &CancellationToken) {
        let kind = err.kind();
        let score = self.scorer.report(err.peer, kind, Instant::now());

        info!(
            peer = %err.peer,
            error = %err.error,
            score,
            "Encountered peer error"
        );

        if score >= self.scorer.threshold() {
            let tx = self.tx_disconnect.clone();
            let peer = err.peer;
            let token = token.clone();

            // The disconnect channel may be full; never block score
            // processing on it.
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    result = tx.send(peer) => {
                        if result.is_err() {
                            debug!(%peer, "Disconnect channel closed");
                        }
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbtest::arbtest;

    fn config(threshold: u64, halflife: Duration) -> ErrorScoreConfig {
        ErrorScoreConfig {
            threshold,
            decay_halflife: halflife,
            ..ErrorScoreConfig::default()
        }
    }

    #[test]
    fn report_then_halflife_halves_the_score() {
        let mut scorer = ErrorScorer::new(config(150, Duration::from_secs(60)));
        let peer = PeerId::random();
        let t0 = Instant::now();

        let score = scorer.report(peer, ErrorKind::PeerRpcTimeout, t0);
        assert_eq!(score, 1_000);

        let score = scorer.score(peer, t0 + Duration::from_secs(60));
        assert!((499..=500).contains(&score), "score was {score}");
    }

    #[test]
    fn two_reports_compose_decay_and_weight() {
        // score(t2) = floor(score(t1) * exp(-ln2 * dt / halflife)) + weight
        arbtest(|u| {
            let halflife = Duration::from_secs(u.int_in_range(10..=600)?);
            let dt = Duration::from_secs(u.int_in_range(0..=1_200)?);

            let mut scorer = ErrorScorer::new(config(u64::MAX, halflife));
            let peer = PeerId::random();
            let t1 = Instant::now();

            let first = scorer.report(peer, ErrorKind::BlockApplication, t1);
            let expected = decayed(first, dt, halflife) + 10_000;

            let second = scorer.report(peer, ErrorKind::BlockApplication, t1 + dt);
            assert_eq!(second, expected);

            Ok(())
        });
    }

    #[test]
    fn score_is_monotone_non_increasing_without_reports() {
        arbtest(|u| {
            let mut scorer = ErrorScorer::new(config(u64::MAX, Duration::from_secs(60)));
            let peer = PeerId::random();
            let t0 = Instant::now();

            scorer.report(peer, ErrorKind::BlockApplication, t0);

            let mut elapsed = Duration::ZERO;
            let mut previous = scorer.score(peer, t0);

            for _ in 0..u.int_in_range(1..=20)? {
                elapsed += Duration::from_secs(u.int_in_range(0..=120)?);
                let current = scorer.score(peer, t0 + elapsed);
                assert!(current <= previous, "score increased without a report");
                previous = current;
            }

            Ok(())
        });
    }

    #[test]
    fn can_connect_matches_threshold_comparison() {
        let mut scorer = ErrorScorer::new(config(10_000, Duration::from_secs(600)));
        let peer = PeerId::random();
        let t0 = Instant::now();

        assert!(scorer.can_connect(peer, t0));

        // One block application fault: exactly at the threshold.
        scorer.report(peer, ErrorKind::BlockApplication, t0);
        assert!(!scorer.can_connect(peer, t0));

        // After decay below the threshold, connection is allowed again.
        assert!(scorer.can_connect(peer, t0 + Duration::from_secs(60)));
    }

    #[test]
    fn identical_reports_at_identical_times_are_deterministic() {
        let peer = PeerId::random();
        let t0 = Instant::now();

        let run = || {
            let mut scorer = ErrorScorer::new(config(u64::MAX, Duration::from_secs(60)));
            scorer.report(peer, ErrorKind::Deserialization, t0);
            scorer.report(peer, ErrorKind::Deserialization, t0 + Duration::from_secs(30))
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn decay_then_report_reaches_threshold() {
        // Weight 100, halflife 60s, threshold 150: one report leaves head
        // room, a second after one halflife lands exactly on the threshold.
        let mut config = config(150, Duration::from_secs(60));
        config.block_application = 100;

        let mut scorer = ErrorScorer::new(config);
        let peer = PeerId::random();
        let t0 = Instant::now();

        assert_eq!(scorer.report(peer, ErrorKind::BlockApplication, t0), 100);
        assert!(scorer.can_connect(peer, t0));

        let t1 = t0 + Duration::from_secs(60);
        let score = scorer.report(peer, ErrorKind::BlockApplication, t1);
        assert!(score >= 150, "score was {score}");
        assert!(!scorer.can_connect(peer, t1));
    }

    #[test]
    fn terminal_kind_reaches_threshold_in_one_report() {
        let mut scorer = ErrorScorer::new(ErrorScoreConfig::default());
        let peer = PeerId::random();
        let t0 = Instant::now();

        let score = scorer.report(peer, ErrorKind::ChainIdMismatch, t0);
        assert!(score >= scorer.threshold());
        assert!(!scorer.can_connect(peer, t0));
    }

    #[test]
    fn fully_decayed_records_are_pruned() {
        let mut scorer = ErrorScorer::new(config(u64::MAX, Duration::from_secs(1)));
        let peer = PeerId::random();
        let t0 = Instant::now();

        scorer.report(peer, ErrorKind::PeerRpcTimeout, t0);
        assert_eq!(scorer.tracked_peers(), 1);

        // 1000 * 2^-60 rounds to zero.
        scorer.prune(t0 + Duration::from_secs(60));
        assert_eq!(scorer.tracked_peers(), 0);
    }
}
