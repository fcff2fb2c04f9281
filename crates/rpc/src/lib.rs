mod bus;
pub use bus::{BusError, MessageBus};

mod error;
pub use error::RpcError;

mod local;
pub use local::LocalRpc;

mod chain;
pub use chain::ChainClient;

mod wire;
pub use wire::{PeerRpcRequest, PeerRpcResponse};

mod server;
pub use server::PeerRpcServer;

mod client;
pub use client::{PeerRpcClient, PendingRequests};

mod remote;
pub use remote::RemoteRpc;

/// Broadcast subjects the node subscribes to on the local bus.
pub const BLOCK_ACCEPT_TOPIC: &str = "koinos.block.accept";
pub const TRANSACTION_ACCEPT_TOPIC: &str = "koinos.transaction.accept";
pub const FORKS_UPDATE_TOPIC: &str = "koinos.forks.update";
