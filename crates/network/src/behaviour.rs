use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use eyre::{eyre, Result};
use libp2p::identity::Keypair;
use libp2p::request_response::{self as rpc, ProtocolSupport};
use libp2p::swarm::NetworkBehaviour;
use libp2p::{gossipsub, identify, ping, StreamProtocol};
use sha2::{Digest, Sha256};

use crate::codec::{Codec, RawRequest, RawResponse};
use crate::Config;

/// Service id of the peer RPC protocol.
pub const PEER_RPC_PROTOCOL: &str = "/koinos/peerrpc/1.0.0";

#[derive(Debug)]
pub enum NetworkEvent {
    Identify(Box<identify::Event>),
    Ping(ping::Event),
    GossipSub(gossipsub::Event),
    PeerRpc(rpc::Event<RawRequest, RawResponse>),
}

impl From<identify::Event> for NetworkEvent {
    fn from(event: identify::Event) -> Self {
        Self::Identify(Box::new(event))
    }
}

impl From<ping::Event> for NetworkEvent {
    fn from(event: ping::Event) -> Self {
        Self::Ping(event)
    }
}

impl From<gossipsub::Event> for NetworkEvent {
    fn from(event: gossipsub::Event) -> Self {
        Self::GossipSub(event)
    }
}

impl From<rpc::Event<RawRequest, RawResponse>> for NetworkEvent {
    fn from(event: rpc::Event<RawRequest, RawResponse>) -> Self {
        Self::PeerRpc(event)
    }
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "NetworkEvent")]
pub struct Behaviour {
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub gossipsub: gossipsub::Behaviour,
    pub peer_rpc: rpc::Behaviour<Codec>,
}

impl std::fmt::Debug for Behaviour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Behaviour").finish()
    }
}

/// Message id at the mesh layer: SHA-256 of the payload, base64url without
/// padding. This is the deduplication key, so every node must compute the
/// same id for the same payload.
pub fn message_id(message: &gossipsub::Message) -> gossipsub::MessageId {
    let digest = Sha256::digest(&message.data);
    gossipsub::MessageId::new(URL_SAFE_NO_PAD.encode(digest).as_bytes())
}

fn gossipsub_config(config: &Config) -> Result<gossipsub::Config> {
    let mut builder = gossipsub::ConfigBuilder::default();

    builder
        .max_transmit_size(config.gossipsub.max_message_size.as_u64() as usize)
        .heartbeat_interval(Duration::from_secs(1))
        .validation_mode(gossipsub::ValidationMode::Strict)
        .history_gossip(3)
        .history_length(5)
        .mesh_n(config.gossipsub.mesh_n)
        .mesh_n_low(config.gossipsub.mesh_n_low)
        .mesh_n_high(config.gossipsub.mesh_n_high)
        .mesh_outbound_min(config.gossipsub.mesh_outbound_min)
        .message_id_fn(message_id);

    if config.enable_peer_exchange {
        builder.do_px().prune_peers(16);
    }

    builder.build().map_err(|e| eyre!("gossipsub config: {e}"))
}

impl Behaviour {
    pub const PROTOCOL: [(StreamProtocol, ProtocolSupport); 1] = [(
        StreamProtocol::new(PEER_RPC_PROTOCOL),
        ProtocolSupport::Full,
    )];

    pub fn new(config: &Config, keypair: &Keypair) -> Result<Self> {
        let identify = identify::Behaviour::new(identify::Config::new(
            PEER_RPC_PROTOCOL.to_string(),
            keypair.public(),
        ));

        let ping = ping::Behaviour::new(ping::Config::new().with_interval(Duration::from_secs(5)));

        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(keypair.clone()),
            gossipsub_config(config)?,
        )
        .map_err(|e| eyre!("gossipsub behaviour: {e}"))?;

        let peer_rpc = rpc::Behaviour::with_codec(
            Codec::new(config.rpc_max_size),
            Self::PROTOCOL,
            rpc::Config::default().with_request_timeout(config.rpc_timeout),
        );

        Ok(Self {
            identify,
            ping,
            gossipsub,
            peer_rpc,
        })
    }
}
