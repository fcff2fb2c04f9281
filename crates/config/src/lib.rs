use std::time::Duration;

use bytesize::ByteSize;
use multiaddr::Multiaddr;
use serde::{Deserialize, Serialize};

use koinos_p2p_types::{BlockId, ErrorKind};

/// Top-level configuration for the p2p daemon.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub error_score: ErrorScoreConfig,

    #[serde(default)]
    pub peer: PeerConnectionConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub gossip: GossipConfig,
}

/// Options that affect the whole node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Peers to connect to at startup and to reconnect to on disconnect.
    #[serde(default)]
    pub initial_peers: Vec<Multiaddr>,

    /// Peers to hold explicit gossip links to.
    #[serde(default)]
    pub direct_peers: Vec<Multiaddr>,

    /// Force gossip mode on startup, regardless of sync state.
    #[serde(default)]
    pub force_gossip: bool,

    /// Allow pruned gossip peers to be exchanged between nodes.
    pub enable_peer_exchange: bool,

    /// Run as a bootstrap node: no gossip mesh is formed.
    #[serde(default)]
    pub enable_bootstrap: bool,

    /// Seed for deterministic key generation. Empty means random.
    #[serde(default)]
    pub seed: String,

    /// Address to listen for incoming connections.
    pub listen_addr: Multiaddr,

    /// Known block ids at fixed heights; peers advertising a different block
    /// at a checkpoint height are disconnected.
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            initial_peers: vec![],
            direct_peers: vec![],
            force_gossip: false,
            enable_peer_exchange: true,
            enable_bootstrap: false,
            seed: String::new(),
            listen_addr: "/ip4/127.0.0.1/tcp/8888"
                .parse()
                .expect("valid multiaddr"),
            checkpoints: vec![],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u64,
    pub id: BlockId,
}

/// Weights and decay parameters for the error score engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorScoreConfig {
    /// A peer whose decayed score reaches this value is disconnected and
    /// gated from reconnecting.
    pub threshold: u64,

    /// Time after which an un-refreshed error score halves.
    #[serde(with = "humantime_serde")]
    pub decay_halflife: Duration,

    pub transaction_application: u64,
    pub block_application: u64,
    pub deserialization: u64,
    pub block_irreversibility: u64,
    pub peer_rpc: u64,
    pub peer_rpc_timeout: u64,
    pub chain_id_mismatch: u64,
    pub chain_not_connected: u64,
    pub checkpoint_mismatch: u64,
    pub local_rpc: u64,
    pub local_rpc_timeout: u64,
    pub serialization: u64,
    pub process_request_timeout: u64,
    pub unknown: u64,
}

impl ErrorScoreConfig {
    pub const DEFAULT_THRESHOLD: u64 = 100_000;

    pub fn score_for(&self, kind: ErrorKind) -> u64 {
        match kind {
            ErrorKind::TransactionApplication => self.transaction_application,
            ErrorKind::BlockApplication => self.block_application,
            ErrorKind::Deserialization => self.deserialization,
            ErrorKind::BlockIrreversibility => self.block_irreversibility,
            ErrorKind::PeerRpc => self.peer_rpc,
            ErrorKind::PeerRpcTimeout => self.peer_rpc_timeout,
            ErrorKind::ChainIdMismatch => self.chain_id_mismatch,
            ErrorKind::ChainNotConnected => self.chain_not_connected,
            ErrorKind::CheckpointMismatch => self.checkpoint_mismatch,
            ErrorKind::LocalRpc => self.local_rpc,
            ErrorKind::LocalRpcTimeout => self.local_rpc_timeout,
            ErrorKind::Serialization => self.serialization,
            ErrorKind::ProcessRequestTimeout => self.process_request_timeout,
            ErrorKind::Unknown => self.unknown,
        }
    }
}

impl Default for ErrorScoreConfig {
    fn default() -> Self {
        Self {
            threshold: Self::DEFAULT_THRESHOLD,
            decay_halflife: Duration::from_secs(600),
            transaction_application: 1_000,
            block_application: 10_000,
            deserialization: 10_000,
            block_irreversibility: 10_000,
            peer_rpc: 10_000,
            peer_rpc_timeout: 1_000,
            chain_id_mismatch: Self::DEFAULT_THRESHOLD,
            chain_not_connected: Self::DEFAULT_THRESHOLD,
            checkpoint_mismatch: Self::DEFAULT_THRESHOLD,
            local_rpc: 100,
            local_rpc_timeout: 100,
            serialization: 100,
            process_request_timeout: 100,
            unknown: 10_000,
        }
    }
}

/// Timings for the per-peer connection worker.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConnectionConfig {
    /// Interval between remote head polls.
    #[serde(with = "humantime_serde")]
    pub head_poll_interval: Duration,

    /// Deadline for a single block download RPC.
    #[serde(with = "humantime_serde")]
    pub download_timeout: Duration,

    /// Deadline for every other peer or local RPC.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,

    /// Maximum number of blocks fetched by one download RPC.
    pub download_batch_size: u32,

    /// Maximum size of a single peer RPC message; a full download batch
    /// must fit in one.
    pub max_rpc_size: ByteSize,
}

impl Default for PeerConnectionConfig {
    fn default() -> Self {
        Self {
            head_poll_interval: Duration::from_secs(10),
            download_timeout: Duration::from_secs(30),
            rpc_timeout: Duration::from_secs(5),
            download_batch_size: 20,
            max_rpc_size: ByteSize::mib(10),
        }
    }
}

/// Parameters of the sync state tracker.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Size of the download interest window, in blocks.
    pub window_size: u32,

    /// A peer within this many blocks of the local head votes "synced".
    pub synced_threshold_blocks: u64,

    /// Fall back out of gossip mode when lagging the median peer head by
    /// more than this many blocks.
    pub resync_threshold_blocks: u64,

    /// Minimum number of synced votes before gossip mode can engage.
    pub synced_votes_required: usize,

    /// Interval of the tracker's recompute tick.
    #[serde(with = "humantime_serde")]
    pub recompute_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            window_size: 64,
            synced_threshold_blocks: 5,
            resync_threshold_blocks: 60,
            synced_votes_required: 1,
            recompute_interval: Duration::from_secs(1),
        }
    }
}

/// Gossipsub mesh tuning and inbound rate gates.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipConfig {
    pub mesh_n: usize,
    pub mesh_n_low: usize,
    pub mesh_n_high: usize,
    pub mesh_outbound_min: usize,

    /// The maximum size of messages sent over pub-sub.
    pub max_message_size: ByteSize,

    /// Inbound block messages accepted per peer per second.
    pub rate_limit_blocks: u32,

    /// Inbound transaction messages accepted per peer per second.
    pub rate_limit_transactions: u32,
}

impl GossipConfig {
    /// Mesh parameters for a bootstrap node: all degrees zero, so the node
    /// never grafts mesh links and only relays peer exchange.
    pub fn bootstrap(self) -> Self {
        Self {
            mesh_n: 0,
            mesh_n_low: 0,
            mesh_n_high: 0,
            mesh_outbound_min: 0,
            ..self
        }
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            mesh_n: 6,
            mesh_n_low: 5,
            mesh_n_high: 12,
            mesh_outbound_min: 2,
            max_message_size: ByteSize::mib(4),
            rate_limit_blocks: 10,
            rate_limit_transactions: 200,
        }
    }
}
