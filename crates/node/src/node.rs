use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, Result};
use libp2p::multiaddr::Protocol;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use koinos_p2p_config::Config;
use koinos_p2p_gossip::{GossipController, InboundMessage};
use koinos_p2p_network::{
    self as network, ConnectionGate, Control, Event, GateRequest, Handle, Multiaddr, PeerId,
};
use koinos_p2p_rpc::{
    ChainClient, LocalRpc, MessageBus, PeerRpcClient, PeerRpcServer, PendingRequests, RemoteRpc,
};
use koinos_p2p_sync::{
    ConnectionEvent, ConnectionManager, ErrorScoreService, SyncStateTracker, TrackerMsg,
};

use crate::bridge::BusBridge;
use crate::identity;

/// How long `start` waits for the host to report its listen address.
const LISTEN_TIMEOUT: Duration = Duration::from_secs(10);

/// The assembled p2p node.
///
/// `new` brings up the host and starts listening; `start` spawns every
/// background task under one cancellation scope; `close` tears it all down.
pub struct Node {
    config: Config,
    bus: Arc<dyn MessageBus>,
    token: CancellationToken,
    peer_id: PeerId,
    control: Control,
    handle: Option<Handle>,
    rx_gate: Option<mpsc::Receiver<GateRequest>>,
    listen_addr: Multiaddr,
}

impl Node {
    pub async fn new(config: Config, bus: Arc<dyn MessageBus>) -> Result<Self> {
        let keypair = identity::generate_keypair(&config.node.seed);
        let (gate, rx_gate) = ConnectionGate::channel(32);

        let network_config = network::Config::from_node_config(&config);
        let handle = network::spawn(keypair, network_config, gate).await?;

        let peer_id = handle.peer_id();
        let control = handle.control();
        let listen_addr = config.node.listen_addr.clone();

        Ok(Self {
            config,
            bus,
            token: CancellationToken::new(),
            peer_id,
            control,
            handle: Some(handle),
            rx_gate: Some(rx_gate),
            listen_addr,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The multiaddress other peers should dial, with the peer id
    /// encapsulated.
    pub fn peer_address(&self) -> Multiaddr {
        let mut addr = self.listen_addr.clone();
        addr.push(Protocol::P2p(self.peer_id));
        addr
    }

    pub fn control(&self) -> Control {
        self.control.clone()
    }

    /// Spawn all background tasks. Returns once the host reports the
    /// address it actually listens on.
    pub async fn start(&mut self) -> Result<()> {
        let mut handle = self
            .handle
            .take()
            .ok_or_else(|| eyre!("node already started"))?;
        let rx_gate = self.rx_gate.take().expect("gate receiver");

        // The host binds asynchronously; wait for the resolved address so
        // that port 0 configurations export a dialable peer address.
        let deadline = tokio::time::sleep(LISTEN_TIMEOUT);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return Err(eyre!("timed out waiting for listen address")),

                event = handle.recv() => match event {
                    Some(Event::Listening(addr)) => {
                        info!(%addr, "Host is listening");
                        self.listen_addr = addr;
                        break;
                    }
                    Some(event) => debug!("Event before listening: {event:?}"),
                    None => return Err(eyre!("network task exited during startup")),
                },
            }
        }

        let token = &self.token;
        let control = self.control.clone();

        // Error score engine and its disconnect path.
        let (tx_err, rx_err) = mpsc::channel(256);
        let (tx_disconnect, mut rx_disconnect) = mpsc::channel::<PeerId>(64);

        let scorer = ErrorScoreService::new(
            self.config.error_score.clone(),
            rx_err,
            rx_gate,
            tx_disconnect,
        );
        tokio::spawn(scorer.run(token.child_token()));

        {
            let control = control.clone();
            let token = token.child_token();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        peer = rx_disconnect.recv() => match peer {
                            Some(peer) => {
                                if let Err(e) = control.disconnect(peer).await {
                                    debug!(%peer, "Error requesting disconnect: {e}");
                                }
                            }
                            None => return,
                        },
                    }
                }
            });
        }

        // Sync state tracker.
        let (tracker, tracker_task) = SyncStateTracker::channel(self.config.sync);
        tokio::spawn(tracker_task.run(token.child_token()));

        // Local chain and peer RPC plumbing.
        let chain: Arc<dyn LocalRpc> = Arc::new(ChainClient::new(
            self.bus.clone(),
            self.config.peer.rpc_timeout,
        ));

        let pending = PendingRequests::new();
        let remote: Arc<dyn RemoteRpc> = Arc::new(PeerRpcClient::new(
            control.clone(),
            pending.clone(),
            self.config.peer.rpc_timeout,
        ));

        let server = Arc::new(PeerRpcServer::new(
            chain.clone(),
            self.config.peer.rpc_timeout,
            tx_err.clone(),
        ));

        // Connection manager.
        let (tx_conn, rx_conn) = mpsc::channel(32);
        let manager = ConnectionManager::new(
            control.clone(),
            remote,
            chain.clone(),
            self.config.peer,
            self.config.sync,
            self.config.node.checkpoints.clone(),
            &self.config.node.initial_peers,
            tracker.clone(),
            tx_err.clone(),
            rx_conn,
        );
        tokio::spawn(manager.run(token.child_token()));

        // Gossip controller.
        let (tx_gossip, rx_gossip) = mpsc::channel(64);
        let controller = GossipController::new(
            control.clone(),
            chain.clone(),
            self.peer_id,
            &self.config.gossip,
            self.config.node.force_gossip,
            tracker.subscribe_synced(),
            rx_gossip,
            tx_err.clone(),
        );
        let gossip_handle = controller.handle();
        tokio::spawn(controller.run(token.child_token()));

        // Bus bridge.
        BusBridge::spawn(
            self.bus.clone(),
            gossip_handle,
            tracker.clone(),
            token.child_token(),
        );

        // Prime the tracker with the chain's current fork heads.
        {
            let chain = chain.clone();
            let tracker = tracker.clone();
            let token = token.child_token();
            let retry = self.config.peer.rpc_timeout;

            tokio::spawn(async move {
                loop {
                    match chain.get_fork_heads().await {
                        Ok(fork_heads) => {
                            tracker.send(TrackerMsg::ForkHeads(fork_heads)).await;
                            return;
                        }
                        Err(e) => warn!("Could not fetch fork heads yet: {e}"),
                    }

                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(retry) => {}
                    }
                }
            });
        }

        // Event dispatcher.
        tokio::spawn(dispatch(
            handle,
            tx_conn,
            tx_gossip,
            pending,
            server,
            control,
            token.child_token(),
        ));

        info!(peer_id = %self.peer_id, "Node started");
        Ok(())
    }

    /// Cancel every task and shut the host down.
    pub async fn close(self) {
        info!(peer_id = %self.peer_id, "Closing node");

        self.token.cancel();

        if let Err(e) = self.control.shutdown().await {
            debug!("Network already gone during shutdown: {e}");
        }
    }
}

/// Route host events to their consumers.
async fn dispatch(
    mut handle: Handle,
    tx_conn: mpsc::Sender<ConnectionEvent>,
    tx_gossip: mpsc::Sender<InboundMessage>,
    pending: PendingRequests,
    server: Arc<PeerRpcServer>,
    control: Control,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = handle.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        match event {
            Event::Listening(addr) => debug!(%addr, "New listen address"),

            Event::PeerConnected(peer) => {
                if tx_conn.send(ConnectionEvent::Connected(peer)).await.is_err() {
                    return;
                }
            }

            Event::PeerDisconnected(peer) => {
                if tx_conn
                    .send(ConnectionEvent::Disconnected(peer))
                    .await
                    .is_err()
                {
                    return;
                }
            }

            Event::GossipMessage {
                topic,
                source,
                propagator,
                data,
            } => {
                let msg = InboundMessage {
                    topic,
                    source,
                    propagator,
                    data,
                };

                if tx_gossip.send(msg).await.is_err() {
                    return;
                }
            }

            Event::RpcRequest {
                request_id,
                peer,
                body,
            } => {
                let server = server.clone();
                let control = control.clone();

                tokio::spawn(async move {
                    let reply = server.handle(peer, body).await;
                    if let Err(e) = control.rpc_reply(request_id, reply).await {
                        debug!(%peer, "Error sending RPC reply: {e}");
                    }
                });
            }

            Event::RpcResponse {
                request_id, body, ..
            } => {
                pending.resolve(request_id, Ok(body));
            }

            Event::RpcFailure {
                request_id, error, ..
            } => {
                pending.resolve(request_id, Err(error));
            }
        }
    }
}
