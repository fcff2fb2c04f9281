use thiserror::Error;

use koinos_p2p_types::P2pError;

/// Failures of calls into the local chain.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("local rpc error: {0}")]
    LocalRpc(String),

    #[error("local rpc timed out")]
    LocalRpcTimeout,

    #[error("block application failed: {0}")]
    BlockApplication(String),

    #[error("block is below irreversibility: {0}")]
    BlockIrreversibility(String),

    #[error("transaction application failed: {0}")]
    TransactionApplication(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("expected exactly one block, got {0}")]
    UnexpectedResultCount(usize),
}

impl From<RpcError> for P2pError {
    fn from(error: RpcError) -> Self {
        match error {
            RpcError::LocalRpc(e) => P2pError::LocalRpc(e),
            RpcError::LocalRpcTimeout => P2pError::LocalRpcTimeout,
            RpcError::BlockApplication(e) => P2pError::BlockApplication(e),
            RpcError::BlockIrreversibility(e) => P2pError::BlockIrreversibility(e),
            RpcError::TransactionApplication(e) => P2pError::TransactionApplication(e),
            RpcError::Serialization(e) => P2pError::Serialization(e),
            RpcError::UnexpectedResultCount(n) => {
                P2pError::LocalRpc(format!("expected exactly one block, got {n}"))
            }
        }
    }
}
