use libp2p_identity::PeerId;
use thiserror::Error;

/// Every fault the p2p layer can attribute to a peer (or to itself).
///
/// Construction sites pick the variant; the error score engine only ever
/// looks at the [`ErrorKind`] tag.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum P2pError {
    #[error("transaction application error: {0}")]
    TransactionApplication(String),

    #[error("block application error: {0}")]
    BlockApplication(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("block irreversibility error: {0}")]
    BlockIrreversibility(String),

    #[error("peer rpc error: {0}")]
    PeerRpc(String),

    #[error("peer rpc timeout")]
    PeerRpcTimeout,

    #[error("chain id mismatch, local {local}, remote {remote}")]
    ChainIdMismatch {
        local: crate::ChainId,
        remote: crate::ChainId,
    },

    #[error("peer's chain does not connect to ours: {0}")]
    ChainNotConnected(String),

    #[error("checkpoint mismatch at height {height}")]
    CheckpointMismatch { height: u64 },

    #[error("local rpc error: {0}")]
    LocalRpc(String),

    #[error("local rpc timeout")]
    LocalRpcTimeout,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("timed out processing peer request")]
    ProcessRequestTimeout,

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl P2pError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            P2pError::TransactionApplication(_) => ErrorKind::TransactionApplication,
            P2pError::BlockApplication(_) => ErrorKind::BlockApplication,
            P2pError::Deserialization(_) => ErrorKind::Deserialization,
            P2pError::BlockIrreversibility(_) => ErrorKind::BlockIrreversibility,
            P2pError::PeerRpc(_) => ErrorKind::PeerRpc,
            P2pError::PeerRpcTimeout => ErrorKind::PeerRpcTimeout,
            P2pError::ChainIdMismatch { .. } => ErrorKind::ChainIdMismatch,
            P2pError::ChainNotConnected(_) => ErrorKind::ChainNotConnected,
            P2pError::CheckpointMismatch { .. } => ErrorKind::CheckpointMismatch,
            P2pError::LocalRpc(_) => ErrorKind::LocalRpc,
            P2pError::LocalRpcTimeout => ErrorKind::LocalRpcTimeout,
            P2pError::Serialization(_) => ErrorKind::Serialization,
            P2pError::ProcessRequestTimeout => ErrorKind::ProcessRequestTimeout,
            P2pError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Kinds that end the peer worker immediately.
    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }
}

/// The enumerated tag driving error score weights.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransactionApplication,
    BlockApplication,
    Deserialization,
    BlockIrreversibility,
    PeerRpc,
    PeerRpcTimeout,
    ChainIdMismatch,
    ChainNotConnected,
    CheckpointMismatch,
    LocalRpc,
    LocalRpcTimeout,
    Serialization,
    ProcessRequestTimeout,
    Unknown,
}

impl ErrorKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ErrorKind::ChainIdMismatch
                | ErrorKind::ChainNotConnected
                | ErrorKind::CheckpointMismatch
        )
    }
}

/// An error originating from a peer, reported on the shared error channel.
#[derive(Clone, Debug)]
pub struct PeerError {
    pub peer: PeerId,
    pub error: P2pError,
}

impl PeerError {
    pub fn new(peer: PeerId, error: P2pError) -> Self {
        Self { peer, error }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}
