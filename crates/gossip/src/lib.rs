//! Gossip controller.
//!
//! Publishes accepted blocks and transactions on the overlay and, once the
//! node is synchronized, applies inbound gossip to the local chain. Inbound
//! processing is gated on the sync tracker's verdict (or forced by
//! configuration); publishing always proceeds.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use koinos_p2p_config::GossipConfig;
use koinos_p2p_network::{Control, PeerId, Topic};
use koinos_p2p_rpc::LocalRpc;
use koinos_p2p_types::{BlockAccepted, P2pError, PeerError, TransactionAccepted};

mod rate;
pub use rate::RateGate;

/// An inbound gossip message, as routed by the node dispatcher.
#[derive(Debug)]
pub struct InboundMessage {
    pub topic: Topic,
    /// Original signer of the message.
    pub source: Option<PeerId>,
    /// Peer that forwarded the message; faults are charged to it.
    pub propagator: PeerId,
    pub data: Bytes,
}

/// Publish half of the controller, used by the bus bridge.
#[derive(Clone, Debug)]
pub struct GossipHandle {
    control: Control,
}

impl GossipHandle {
    /// Publish an already-serialized block-accepted payload verbatim.
    pub async fn publish_block(&self, payload: Bytes) {
        if let Err(e) = self.control.publish(Topic::Block, payload).await {
            debug!("Error publishing block: {e}");
        }
    }

    /// Publish an already-serialized transaction-accepted payload verbatim.
    pub async fn publish_transaction(&self, payload: Bytes) {
        if let Err(e) = self.control.publish(Topic::Transaction, payload).await {
            debug!("Error publishing transaction: {e}");
        }
    }
}

pub struct GossipController {
    control: Control,
    local: Arc<dyn LocalRpc>,
    self_peer: PeerId,
    force_gossip: bool,
    enabled: bool,
    rate: RateGate,
    rx_synced: watch::Receiver<bool>,
    rx_inbound: mpsc::Receiver<InboundMessage>,
    tx_err: mpsc::Sender<PeerError>,
}

impl GossipController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        control: Control,
        local: Arc<dyn LocalRpc>,
        self_peer: PeerId,
        config: &GossipConfig,
        force_gossip: bool,
        rx_synced: watch::Receiver<bool>,
        rx_inbound: mpsc::Receiver<InboundMessage>,
        tx_err: mpsc::Sender<PeerError>,
    ) -> Self {
        Self {
            control,
            local,
            self_peer,
            force_gossip,
            enabled: false,
            rate: RateGate::new(config.rate_limit_blocks, config.rate_limit_transactions),
            rx_synced,
            rx_inbound,
            tx_err,
        }
    }

    pub fn handle(&self) -> GossipHandle {
        GossipHandle {
            control: self.control.clone(),
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        if self.force_gossip {
            info!("Gossip forced on by configuration");
        }

        let synced = *self.rx_synced.borrow();
        self.set_enabled(synced || self.force_gossip).await;

        loop {
            tokio::select! {
                _ = token.cancelled() => return,

                changed = self.rx_synced.changed() => {
                    if changed.is_err() {
                        return;
                    }

                    let synced = *self.rx_synced.borrow();
                    self.set_enabled(synced || self.force_gossip).await;
                }

                msg = self.rx_inbound.recv() => match msg {
                    Some(msg) => self.handle_inbound(msg).await,
                    None => return,
                },
            }
        }
    }

    async fn set_enabled(&mut self, enable: bool) {
        if enable == self.enabled {
            return;
        }

        self.enabled = enable;

        if enable {
            info!("Starting gossip mode");
            for topic in Topic::all() {
                if let Err(e) = self.control.subscribe(*topic).await {
                    debug!(%topic, "Error subscribing: {e}");
                }
            }
        } else {
            info!("Stopping gossip mode");
            for topic in Topic::all() {
                if let Err(e) = self.control.unsubscribe(*topic).await {
                    debug!(%topic, "Error unsubscribing: {e}");
                }
            }
        }
    }

    async fn handle_inbound(&mut self, msg: InboundMessage) {
        if !self.enabled {
            return;
        }

        // Every inbound message is charged to its propagator's budget,
        // echoes of our own gossip included.
        if !self.rate.allow(msg.topic, msg.propagator, Instant::now()) {
            debug!(
                topic = %msg.topic,
                peer = %msg.propagator,
                "Rate gate dropped gossip message"
            );
            return;
        }

        // Our own published messages come back from the mesh.
        if msg.source == Some(self.self_peer) {
            trace!(topic = %msg.topic, "Ignoring own gossip message");
            return;
        }

        match msg.topic {
            Topic::Block => self.handle_block(msg).await,
            Topic::Transaction => self.handle_transaction(msg).await,
        }
    }

    async fn handle_block(&self, msg: InboundMessage) {
        let accepted: BlockAccepted = match serde_json::from_slice(&msg.data) {
            Ok(accepted) => accepted,
            Err(e) => {
                self.report(msg.propagator, P2pError::Deserialization(e.to_string()))
                    .await;
                return;
            }
        };

        debug!(
            id = %accepted.block.id,
            height = accepted.block.header.height,
            peer = %msg.propagator,
            "Gossip block received"
        );

        if let Err(e) = self.local.apply_block(&accepted.block).await {
            self.report(msg.propagator, P2pError::from(e)).await;
        }
    }

    async fn handle_transaction(&self, msg: InboundMessage) {
        let accepted: TransactionAccepted = match serde_json::from_slice(&msg.data) {
            Ok(accepted) => accepted,
            Err(e) => {
                self.report(msg.propagator, P2pError::Deserialization(e.to_string()))
                    .await;
                return;
            }
        };

        trace!(
            id = %accepted.transaction.id,
            peer = %msg.propagator,
            "Gossip transaction received"
        );

        if let Err(e) = self.local.apply_transaction(&accepted.transaction).await {
            self.report(msg.propagator, P2pError::from(e)).await;
        }
    }

    async fn report(&self, peer: PeerId, error: P2pError) {
        debug!(%peer, %error, "Gossip fault");

        if self.tx_err.send(PeerError::new(peer, error)).await.is_err() {
            debug!("Error channel closed, dropping gossip error report");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    use koinos_p2p_network::CtrlMsg;
    use koinos_p2p_rpc::RpcError;
    use koinos_p2p_types::{
        Block, BlockId, BlockTopology, ChainId, ErrorKind, ForkHeads, Transaction,
    };

    struct RecordingLocal {
        applied_blocks: Mutex<Vec<BlockId>>,
        applied_transactions: Mutex<usize>,
        reject_blocks: bool,
    }

    impl RecordingLocal {
        fn new(reject_blocks: bool) -> Self {
            Self {
                applied_blocks: Mutex::new(vec![]),
                applied_transactions: Mutex::new(0),
                reject_blocks,
            }
        }
    }

    #[async_trait]
    impl LocalRpc for RecordingLocal {
        async fn get_chain_id(&self) -> Result<ChainId, RpcError> {
            Ok(ChainId::default())
        }

        async fn get_head_info(&self) -> Result<BlockTopology, RpcError> {
            Ok(BlockTopology::default())
        }

        async fn get_fork_heads(&self) -> Result<ForkHeads, RpcError> {
            Ok(ForkHeads::default())
        }

        async fn get_blocks_by_height(
            &self,
            _head_id: &BlockId,
            _start_height: u64,
            _num_blocks: u32,
        ) -> Result<Vec<Block>, RpcError> {
            Ok(vec![])
        }

        async fn get_blocks_by_id(&self, _ids: &[BlockId]) -> Result<Vec<Block>, RpcError> {
            Ok(vec![])
        }

        async fn apply_block(&self, block: &Block) -> Result<(), RpcError> {
            if self.reject_blocks {
                return Err(RpcError::BlockApplication("rejected".to_string()));
            }
            self.applied_blocks.lock().unwrap().push(block.id.clone());
            Ok(())
        }

        async fn apply_transaction(&self, _transaction: &Transaction) -> Result<(), RpcError> {
            *self.applied_transactions.lock().unwrap() += 1;
            Ok(())
        }

        async fn is_connected_to_chain(&self) -> Result<bool, RpcError> {
            Ok(true)
        }

        async fn is_connected_to_block_store(&self) -> Result<bool, RpcError> {
            Ok(true)
        }
    }

    struct Fixture {
        tx_inbound: mpsc::Sender<InboundMessage>,
        tx_synced: watch::Sender<bool>,
        rx_ctrl: mpsc::Receiver<CtrlMsg>,
        rx_err: mpsc::Receiver<PeerError>,
        local: Arc<RecordingLocal>,
        self_peer: PeerId,
        token: CancellationToken,
    }

    fn fixture(force_gossip: bool, reject_blocks: bool) -> Fixture {
        let (control, rx_ctrl) = Control::detached(32);
        let (tx_inbound, rx_inbound) = mpsc::channel(64);
        let (tx_synced, rx_synced) = watch::channel(false);
        let (tx_err, rx_err) = mpsc::channel(64);

        let local = Arc::new(RecordingLocal::new(reject_blocks));
        let self_peer = PeerId::random();

        let controller = GossipController::new(
            control,
            local.clone(),
            self_peer,
            &GossipConfig::default(),
            force_gossip,
            rx_synced,
            rx_inbound,
            tx_err,
        );

        let token = CancellationToken::new();
        tokio::spawn(controller.run(token.clone()));

        Fixture {
            tx_inbound,
            tx_synced,
            rx_ctrl,
            rx_err,
            local,
            self_peer,
            token,
        }
    }

    fn block_payload(height: u64) -> Bytes {
        let accepted = BlockAccepted {
            block: Block {
                id: BlockId::from(height.to_be_bytes().to_vec()),
                ..Block::default()
            },
        };
        Bytes::from(serde_json::to_vec(&accepted).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn flipping_synced_subscribes_and_unsubscribes() {
        let mut fx = fixture(false, false);

        fx.tx_synced.send(true).unwrap();
        for expected in [Topic::Block, Topic::Transaction] {
            match fx.rx_ctrl.recv().await {
                Some(CtrlMsg::Subscribe(topic)) => assert_eq!(topic, expected),
                other => panic!("expected subscribe, got {other:?}"),
            }
        }

        fx.tx_synced.send(false).unwrap();
        for expected in [Topic::Block, Topic::Transaction] {
            match fx.rx_ctrl.recv().await {
                Some(CtrlMsg::Unsubscribe(topic)) => assert_eq!(topic, expected),
                other => panic!("expected unsubscribe, got {other:?}"),
            }
        }

        fx.token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn force_gossip_subscribes_immediately() {
        let mut fx = fixture(true, false);

        match fx.rx_ctrl.recv().await {
            Some(CtrlMsg::Subscribe(_)) => {}
            other => panic!("expected subscribe, got {other:?}"),
        }

        fx.token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn own_messages_are_never_applied() {
        let fx = fixture(true, false);

        fx.tx_inbound
            .send(InboundMessage {
                topic: Topic::Block,
                source: Some(fx.self_peer),
                propagator: PeerId::random(),
                data: block_payload(7),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.local.applied_blocks.lock().unwrap().is_empty());

        fx.token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn peer_messages_are_applied() {
        let fx = fixture(true, false);

        fx.tx_inbound
            .send(InboundMessage {
                topic: Topic::Block,
                source: Some(PeerId::random()),
                propagator: PeerId::random(),
                data: block_payload(7),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.local.applied_blocks.lock().unwrap().len(), 1);

        fx.token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_block_is_charged_to_the_propagator() {
        let mut fx = fixture(true, true);

        let propagator = PeerId::random();
        fx.tx_inbound
            .send(InboundMessage {
                topic: Topic::Block,
                source: Some(PeerId::random()),
                propagator,
                data: block_payload(7),
            })
            .await
            .unwrap();

        let err = fx.rx_err.recv().await.unwrap();
        assert_eq!(err.peer, propagator);
        assert_eq!(err.kind(), ErrorKind::BlockApplication);

        fx.token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn echoes_still_spend_the_propagator_budget() {
        let fx = fixture(true, false);

        // Default block budget is 10 per second: a propagator replaying our
        // own block back at us burns through it before the window rolls.
        let propagator = PeerId::random();
        for _ in 0..10 {
            fx.tx_inbound
                .send(InboundMessage {
                    topic: Topic::Block,
                    source: Some(fx.self_peer),
                    propagator,
                    data: block_payload(7),
                })
                .await
                .unwrap();
        }

        // A genuine message from the same propagator is now rate-gated.
        fx.tx_inbound
            .send(InboundMessage {
                topic: Topic::Block,
                source: Some(PeerId::random()),
                propagator,
                data: block_payload(8),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.local.applied_blocks.lock().unwrap().is_empty());

        fx.token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payload_is_charged_to_the_propagator() {
        let mut fx = fixture(true, false);

        let propagator = PeerId::random();
        fx.tx_inbound
            .send(InboundMessage {
                topic: Topic::Transaction,
                source: Some(PeerId::random()),
                propagator,
                data: Bytes::from_static(b"not json"),
            })
            .await
            .unwrap();

        let err = fx.rx_err.recv().await.unwrap();
        assert_eq!(err.peer, propagator);
        assert_eq!(err.kind(), ErrorKind::Deserialization);

        fx.token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn messages_are_dropped_while_disabled() {
        let fx = fixture(false, false);

        fx.tx_inbound
            .send(InboundMessage {
                topic: Topic::Block,
                source: Some(PeerId::random()),
                propagator: PeerId::random(),
                data: block_payload(7),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.local.applied_blocks.lock().unwrap().is_empty());

        fx.token.cancel();
    }
}
