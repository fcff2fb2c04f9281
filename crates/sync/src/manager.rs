//! Connection manager: one worker per connected peer, reconnection of
//! static seeds with geometric backoff, and the initial connect loop.

use std::collections::HashMap;
use std::sync::Arc;

use multiaddr::Multiaddr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use koinos_p2p_config::{Checkpoint, PeerConnectionConfig, SyncConfig};
use koinos_p2p_network::{peer_id_from_multiaddr, Control, PeerId};
use koinos_p2p_rpc::{LocalRpc, RemoteRpc};
use koinos_p2p_types::PeerError;

use crate::backoff::GeometricBackoff;
use crate::peer::PeerConnection;
use crate::tracker::{TrackerHandle, TrackerMsg};

/// Host connection notifications, as routed by the node dispatcher.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

struct PeerScope {
    token: CancellationToken,
}

pub struct ConnectionManager {
    control: Control,
    remote: Arc<dyn RemoteRpc>,
    local: Arc<dyn LocalRpc>,
    peer_config: PeerConnectionConfig,
    sync_config: SyncConfig,
    checkpoints: Vec<Checkpoint>,
    tracker: TrackerHandle,
    tx_err: mpsc::Sender<PeerError>,
    rx_events: mpsc::Receiver<ConnectionEvent>,

    initial_peers: HashMap<PeerId, Multiaddr>,
    connected: HashMap<PeerId, PeerScope>,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        control: Control,
        remote: Arc<dyn RemoteRpc>,
        local: Arc<dyn LocalRpc>,
        peer_config: PeerConnectionConfig,
        sync_config: SyncConfig,
        checkpoints: Vec<Checkpoint>,
        initial_peers: &[Multiaddr],
        tracker: TrackerHandle,
        tx_err: mpsc::Sender<PeerError>,
        rx_events: mpsc::Receiver<ConnectionEvent>,
    ) -> Self {
        let mut peers = HashMap::new();

        for addr in initial_peers {
            match peer_id_from_multiaddr(addr) {
                Some(peer_id) => {
                    peers.insert(peer_id, addr.clone());
                }
                None => warn!(%addr, "Initial peer address has no peer id, skipping"),
            }
        }

        Self {
            control,
            remote,
            local,
            peer_config,
            sync_config,
            checkpoints,
            tracker,
            tx_err,
            rx_events,
            initial_peers: peers,
            connected: HashMap::new(),
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        // Peers that connected before this task started still get workers.
        if let Ok(peers) = self.control.connected_peers().await {
            for peer in peers {
                self.handle_connected(peer, &token);
            }
        }

        tokio::spawn(connect_initial_peers(
            self.control.clone(),
            self.initial_peers.clone(),
            token.clone(),
        ));

        loop {
            tokio::select! {
                _ = token.cancelled() => break,

                event = self.rx_events.recv() => match event {
                    Some(ConnectionEvent::Connected(peer)) => {
                        self.handle_connected(peer, &token);
                    }
                    Some(ConnectionEvent::Disconnected(peer)) => {
                        self.handle_disconnected(peer, &token).await;
                    }
                    None => break,
                },
            }
        }

        for (_, scope) in self.connected.drain() {
            scope.token.cancel();
        }
    }

    fn handle_connected(&mut self, peer: PeerId, token: &CancellationToken) {
        if self.connected.contains_key(&peer) {
            return;
        }

        info!(%peer, "Connected to peer");

        let scope = token.child_token();

        let worker = PeerConnection::new(
            peer,
            self.remote.clone(),
            self.local.clone(),
            self.peer_config,
            self.sync_config,
            self.checkpoints.clone(),
            self.tracker.clone(),
            self.tx_err.clone(),
        );

        worker.spawn(scope.clone());
        self.connected.insert(peer, PeerScope { token: scope });
    }

    async fn handle_disconnected(&mut self, peer: PeerId, token: &CancellationToken) {
        let Some(scope) = self.connected.remove(&peer) else {
            return;
        };

        info!(%peer, "Disconnected from peer");

        scope.token.cancel();
        self.tracker.send(TrackerMsg::PeerRemoved(peer)).await;

        // Only static seeds are reconnected.
        if let Some(addr) = self.initial_peers.get(&peer) {
            tokio::spawn(reconnect(
                self.control.clone(),
                peer,
                addr.clone(),
                token.clone(),
            ));
        }
    }
}

/// Redial a dropped seed until the host reports success or the scope is
/// cancelled, doubling the delay from 1s up to 30s.
async fn reconnect(control: Control, peer: PeerId, addr: Multiaddr, token: CancellationToken) {
    let mut backoff = GeometricBackoff::new();

    loop {
        info!(%peer, "Attempting to connect to peer");

        match control.dial(addr.clone()).await {
            Ok(()) => return,
            Err(e) => info!(%peer, "Error connecting to peer: {e}"),
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(backoff.next_delay()) => {}
        }
    }
}

/// Dial every configured seed once per cycle until all have connected,
/// sleeping between cycles on the shared backoff schedule.
async fn connect_initial_peers(
    control: Control,
    peers: HashMap<PeerId, Multiaddr>,
    token: CancellationToken,
) {
    let mut pending = peers;
    let mut backoff = GeometricBackoff::new();

    while !pending.is_empty() {
        let mut newly_connected = Vec::new();

        for (peer, addr) in &pending {
            info!(%peer, "Attempting to connect to peer");

            match control.dial(addr.clone()).await {
                Ok(()) => newly_connected.push(*peer),
                Err(e) => info!(%peer, "Error connecting to peer: {e}"),
            }
        }

        for peer in newly_connected {
            pending.remove(&peer);
        }

        if pending.is_empty() {
            break;
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(backoff.next_delay()) => {}
        }
    }

    debug!("All initial peers connected");
}
