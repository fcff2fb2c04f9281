use std::collections::HashMap;
use std::ops::ControlFlow;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use libp2p::request_response::{self as rpc};
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{self, ConnectionId, SwarmEvent};
use libp2p::{gossipsub, identify, SwarmBuilder};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, error_span, info, trace, warn, Instrument};

pub use libp2p::identity::Keypair;
pub use libp2p::request_response::{InboundRequestId, OutboundRequestId};
pub use libp2p::{Multiaddr, PeerId};

use koinos_p2p_config::GossipConfig;

pub mod behaviour;
pub mod codec;
pub mod gate;
pub mod handle;

mod topic;
pub use topic::Topic;

pub use behaviour::PEER_RPC_PROTOCOL;
pub use gate::{ConnectionGate, GateRequest};
pub use handle::{Control, Handle, NetworkError};

use behaviour::{Behaviour, NetworkEvent};
use codec::{RawRequest, RawResponse};

#[derive(Clone, Debug)]
pub struct Config {
    pub listen_addr: Multiaddr,
    pub direct_peers: Vec<Multiaddr>,
    pub enable_peer_exchange: bool,
    pub gossipsub: GossipConfig,
    pub rpc_timeout: Duration,
    pub rpc_max_size: usize,
    pub idle_connection_timeout: Duration,
}

impl Config {
    pub fn from_node_config(config: &koinos_p2p_config::Config) -> Self {
        let gossipsub = if config.node.enable_bootstrap {
            config.gossip.bootstrap()
        } else {
            config.gossip
        };

        Self {
            listen_addr: config.node.listen_addr.clone(),
            direct_peers: config.node.direct_peers.clone(),
            enable_peer_exchange: config.node.enable_peer_exchange,
            gossipsub,
            // The request/response deadline must cover the slowest RPC,
            // which is a block download batch.
            rpc_timeout: config.peer.download_timeout,
            rpc_max_size: config.peer.max_rpc_size.as_u64() as usize,
            idle_connection_timeout: Duration::from_secs(60),
        }
    }

    fn apply_to_swarm(&self, cfg: swarm::Config) -> swarm::Config {
        cfg.with_idle_connection_timeout(self.idle_connection_timeout)
    }
}

/// An event emitted by the host towards the rest of the node.
#[derive(Debug)]
pub enum Event {
    Listening(Multiaddr),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    GossipMessage {
        topic: Topic,
        /// Original signer of the message, if known.
        source: Option<PeerId>,
        /// Peer that forwarded the message to us.
        propagator: PeerId,
        data: Bytes,
    },
    RpcRequest {
        request_id: InboundRequestId,
        peer: PeerId,
        body: Bytes,
    },
    RpcResponse {
        request_id: OutboundRequestId,
        peer: PeerId,
        body: Bytes,
    },
    RpcFailure {
        request_id: OutboundRequestId,
        peer: PeerId,
        error: String,
    },
}

#[derive(Debug)]
pub enum CtrlMsg {
    Publish(Topic, Bytes),
    Subscribe(Topic),
    Unsubscribe(Topic),
    Dial(Multiaddr, oneshot::Sender<Result<(), String>>),
    Disconnect(PeerId),
    RpcRequest(PeerId, Bytes, oneshot::Sender<OutboundRequestId>),
    RpcReply(InboundRequestId, Bytes),
    ConnectedPeers(oneshot::Sender<Vec<PeerId>>),
    Shutdown,
}

#[derive(Debug, Default)]
struct State {
    rpc_channels: HashMap<InboundRequestId, rpc::ResponseChannel<RawResponse>>,
    pending_dials: HashMap<ConnectionId, oneshot::Sender<Result<(), String>>>,
}

/// Extract the peer id component of a multiaddr, if present.
pub fn peer_id_from_multiaddr(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|protocol| match protocol {
        libp2p::multiaddr::Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

pub async fn spawn(
    keypair: Keypair,
    config: Config,
    gate: ConnectionGate,
) -> Result<Handle, eyre::Report> {
    let behaviour = Behaviour::new(&config, &keypair)?;

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            libp2p::tcp::Config::new().nodelay(true),
            libp2p::noise::Config::new,
            libp2p::yamux::Config::default,
        )?
        .with_dns()?
        .with_behaviour(|_| behaviour)?
        .with_swarm_config(|cfg| config.apply_to_swarm(cfg))
        .build();

    let (tx_event, rx_event) = mpsc::channel(32);
    let (tx_ctrl, rx_ctrl) = mpsc::channel(32);

    let peer_id = *swarm.local_peer_id();
    let span = error_span!("network");

    info!(parent: span.clone(), %peer_id, "Starting network service");

    let task = tokio::task::spawn(run(config, swarm, gate, rx_ctrl, tx_event).instrument(span));

    Ok(Handle::new(peer_id, Control::new(tx_ctrl), rx_event, task))
}

async fn run(
    config: Config,
    mut swarm: swarm::Swarm<Behaviour>,
    gate: ConnectionGate,
    mut rx_ctrl: mpsc::Receiver<CtrlMsg>,
    tx_event: mpsc::Sender<Event>,
) {
    let mut state = State::default();

    if let Err(e) = swarm.listen_on(config.listen_addr.clone()) {
        error!("Error listening on {}: {e}", config.listen_addr);
        return;
    }

    for addr in &config.direct_peers {
        let Some(peer_id) = peer_id_from_multiaddr(addr) else {
            warn!(%addr, "Direct peer address has no peer id, skipping");
            continue;
        };

        swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);

        if let Err(e) = swarm.dial(addr.clone()) {
            warn!(%addr, "Error dialing direct peer: {e}");
        }
    }

    loop {
        let result = tokio::select! {
            event = swarm.select_next_some() => {
                handle_swarm_event(event, &gate, &mut swarm, &mut state, &tx_event).await
            }

            Some(ctrl) = rx_ctrl.recv() => {
                handle_ctrl_msg(&mut swarm, &mut state, &gate, ctrl).await
            }
        };

        match result {
            ControlFlow::Continue(()) => continue,
            ControlFlow::Break(()) => break,
        }
    }
}

async fn handle_ctrl_msg(
    swarm: &mut swarm::Swarm<Behaviour>,
    state: &mut State,
    gate: &ConnectionGate,
    msg: CtrlMsg,
) -> ControlFlow<()> {
    match msg {
        CtrlMsg::Publish(topic, data) => {
            let msg_size = data.len();
            let result = swarm
                .behaviour_mut()
                .gossipsub
                .publish(topic.to_gossipsub_topic(), data);

            match result {
                Ok(message_id) => {
                    debug!(%topic, size = %msg_size, %message_id, "Published message")
                }
                Err(gossipsub::PublishError::InsufficientPeers) => {
                    debug!(%topic, "No mesh peers to publish to")
                }
                Err(e) => error!(%topic, "Error publishing message: {e}"),
            }

            ControlFlow::Continue(())
        }

        CtrlMsg::Subscribe(topic) => {
            match swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&topic.to_gossipsub_topic())
            {
                Ok(_) => debug!(%topic, "Subscribed to topic"),
                Err(e) => error!(%topic, "Error subscribing to topic: {e}"),
            }

            ControlFlow::Continue(())
        }

        CtrlMsg::Unsubscribe(topic) => {
            let _ = swarm
                .behaviour_mut()
                .gossipsub
                .unsubscribe(&topic.to_gossipsub_topic());

            debug!(%topic, "Unsubscribed from topic");
            ControlFlow::Continue(())
        }

        CtrlMsg::Dial(addr, reply) => {
            if let Some(peer_id) = peer_id_from_multiaddr(&addr) {
                if !gate.can_connect(peer_id).await {
                    debug!(%peer_id, "Dial blocked by connection gate");
                    let _ = reply.send(Err("peer is gated".to_string()));
                    return ControlFlow::Continue(());
                }
            }

            let opts = DialOpts::from(addr.clone());
            let connection_id = opts.connection_id();

            match swarm.dial(opts) {
                Ok(()) => {
                    state.pending_dials.insert(connection_id, reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(e.to_string()));
                }
            }

            ControlFlow::Continue(())
        }

        CtrlMsg::Disconnect(peer) => {
            if swarm.disconnect_peer_id(peer).is_ok() {
                info!(%peer, "Disconnecting peer");
            }

            ControlFlow::Continue(())
        }

        CtrlMsg::RpcRequest(peer, body, reply) => {
            let request_id = swarm
                .behaviour_mut()
                .peer_rpc
                .send_request(&peer, RawRequest(body));

            if reply.send(request_id).is_err() {
                debug!(%peer, "RPC requester went away before the id was returned");
            }

            ControlFlow::Continue(())
        }

        CtrlMsg::RpcReply(request_id, body) => {
            let Some(channel) = state.rpc_channels.remove(&request_id) else {
                error!(%request_id, "Received RPC reply for unknown request id");
                return ControlFlow::Continue(());
            };

            if swarm
                .behaviour_mut()
                .peer_rpc
                .send_response(channel, RawResponse(body))
                .is_err()
            {
                debug!(%request_id, "Peer hung up before the RPC response was sent");
            }

            ControlFlow::Continue(())
        }

        CtrlMsg::ConnectedPeers(reply) => {
            let peers = swarm.connected_peers().copied().collect();
            let _ = reply.send(peers);
            ControlFlow::Continue(())
        }

        CtrlMsg::Shutdown => ControlFlow::Break(()),
    }
}

async fn handle_swarm_event(
    event: SwarmEvent<NetworkEvent>,
    gate: &ConnectionGate,
    swarm: &mut swarm::Swarm<Behaviour>,
    state: &mut State,
    tx_event: &mpsc::Sender<Event>,
) -> ControlFlow<()> {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            debug!(%address, "Node is listening");

            if let Err(e) = tx_event.send(Event::Listening(address)).await {
                error!("Error sending listening event to handle: {e}");
                return ControlFlow::Break(());
            }
        }

        SwarmEvent::ConnectionEstablished {
            peer_id,
            connection_id,
            num_established,
            ..
        } => {
            trace!("Connected to {peer_id} with connection id {connection_id}");

            if let Some(reply) = state.pending_dials.remove(&connection_id) {
                let _ = reply.send(Ok(()));
            }

            if !gate.can_connect(peer_id).await {
                info!(%peer_id, "Connection gate rejected peer, disconnecting");
                let _ = swarm.disconnect_peer_id(peer_id);
                return ControlFlow::Continue(());
            }

            if num_established.get() == 1 {
                if let Err(e) = tx_event.send(Event::PeerConnected(peer_id)).await {
                    error!("Error sending peer connected event to handle: {e}");
                    return ControlFlow::Break(());
                }
            }
        }

        SwarmEvent::OutgoingConnectionError {
            connection_id,
            error,
            ..
        } => {
            debug!("Error dialing peer: {error}");

            if let Some(reply) = state.pending_dials.remove(&connection_id) {
                let _ = reply.send(Err(error.to_string()));
            }
        }

        SwarmEvent::ConnectionClosed {
            peer_id,
            num_established,
            cause,
            ..
        } => {
            match cause {
                Some(cause) => warn!("Connection closed with {peer_id}, reason: {cause}"),
                None => warn!("Connection closed with {peer_id}, reason: unknown"),
            }

            if num_established == 0 {
                if let Err(e) = tx_event.send(Event::PeerDisconnected(peer_id)).await {
                    error!("Error sending peer disconnected event to handle: {e}");
                    return ControlFlow::Break(());
                }
            }
        }

        SwarmEvent::Behaviour(NetworkEvent::Identify(event)) => match *event {
            identify::Event::Sent { peer_id, .. } => {
                trace!("Sent identity to {peer_id}");
            }

            identify::Event::Received { peer_id, info, .. } => {
                trace!(
                    "Received identity from {peer_id}: protocol={:?}",
                    info.protocol_version
                );
            }

            _ => (),
        },

        SwarmEvent::Behaviour(NetworkEvent::Ping(event)) => match &event.result {
            Ok(rtt) => trace!("Received pong from {} in {rtt:?}", event.peer),
            Err(e) => trace!("Received pong from {} with error: {e}", event.peer),
        },

        SwarmEvent::Behaviour(NetworkEvent::GossipSub(event)) => {
            return handle_gossipsub_event(event, tx_event).await;
        }

        SwarmEvent::Behaviour(NetworkEvent::PeerRpc(event)) => {
            return handle_peer_rpc_event(event, state, tx_event).await;
        }

        swarm_event => {
            trace!("Unhandled swarm event: {swarm_event:?}");
        }
    }

    ControlFlow::Continue(())
}

async fn handle_gossipsub_event(
    event: gossipsub::Event,
    tx_event: &mpsc::Sender<Event>,
) -> ControlFlow<()> {
    match event {
        gossipsub::Event::Subscribed { peer_id, topic } => {
            if Topic::from_topic_hash(&topic).is_none() {
                trace!("Peer {peer_id} tried to subscribe to unknown topic: {topic}");
                return ControlFlow::Continue(());
            }

            trace!("Peer {peer_id} subscribed to {topic}");
        }

        gossipsub::Event::Unsubscribed { peer_id, topic } => {
            trace!("Peer {peer_id} unsubscribed from {topic}");
        }

        gossipsub::Event::Message {
            propagation_source,
            message_id,
            message,
            ..
        } => {
            let Some(topic) = Topic::from_topic_hash(&message.topic) else {
                trace!(
                    "Received message {message_id} from {propagation_source} on unknown topic: {}",
                    message.topic
                );

                return ControlFlow::Continue(());
            };

            trace!(
                "Received message {message_id} from {propagation_source} on {topic} of {} bytes",
                message.data.len()
            );

            let event = Event::GossipMessage {
                topic,
                source: message.source,
                propagator: propagation_source,
                data: Bytes::from(message.data),
            };

            if let Err(e) = tx_event.send(event).await {
                error!("Error sending message to handle: {e}");
                return ControlFlow::Break(());
            }
        }

        gossipsub::Event::SlowPeer {
            peer_id,
            failed_messages,
        } => {
            trace!(
                "Slow peer detected: {peer_id}, total failed messages: {}",
                failed_messages.total()
            );
        }

        gossipsub::Event::GossipsubNotSupported { peer_id } => {
            trace!("Peer does not support GossipSub: {peer_id}");
        }
    }

    ControlFlow::Continue(())
}

async fn handle_peer_rpc_event(
    event: rpc::Event<RawRequest, RawResponse>,
    state: &mut State,
    tx_event: &mpsc::Sender<Event>,
) -> ControlFlow<()> {
    match event {
        rpc::Event::Message { peer, message, .. } => {
            let event = match message {
                rpc::Message::Request {
                    request_id,
                    request,
                    channel,
                } => {
                    state.rpc_channels.insert(request_id, channel);

                    Event::RpcRequest {
                        request_id,
                        peer,
                        body: request.0,
                    }
                }

                rpc::Message::Response {
                    request_id,
                    response,
                } => Event::RpcResponse {
                    request_id,
                    peer,
                    body: response.0,
                },
            };

            if let Err(e) = tx_event.send(event).await {
                error!("Error sending RPC event to handle: {e}");
                return ControlFlow::Break(());
            }

            ControlFlow::Continue(())
        }

        rpc::Event::OutboundFailure {
            peer,
            request_id,
            error,
            ..
        } => {
            let event = Event::RpcFailure {
                request_id,
                peer,
                error: error.to_string(),
            };

            if let Err(e) = tx_event.send(event).await {
                error!("Error sending RPC failure to handle: {e}");
                return ControlFlow::Break(());
            }

            ControlFlow::Continue(())
        }

        rpc::Event::InboundFailure {
            peer,
            request_id,
            error,
            ..
        } => {
            debug!(%peer, %request_id, "Inbound RPC failure: {error}");
            state.rpc_channels.remove(&request_id);
            ControlFlow::Continue(())
        }

        rpc::Event::ResponseSent { .. } => ControlFlow::Continue(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_extraction_from_multiaddr() {
        let peer_id = PeerId::random();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/8888/p2p/{peer_id}")
            .parse()
            .unwrap();

        assert_eq!(peer_id_from_multiaddr(&addr), Some(peer_id));

        let bare: Multiaddr = "/ip4/127.0.0.1/tcp/8888".parse().unwrap();
        assert_eq!(peer_id_from_multiaddr(&bare), None);
    }
}
