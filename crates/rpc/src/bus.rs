use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus request timed out")]
    Timeout,

    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

/// The request/reply message bus connecting the p2p daemon to the rest of
/// the node. The transport itself (an AMQP-style broker in production) is
/// out of scope; tests provide an in-memory implementation.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Perform a request/reply exchange with the named service.
    async fn rpc(&self, content_type: &str, target: &str, payload: Bytes)
        -> Result<Bytes, BusError>;

    /// Subscribe to a broadcast subject. Every published payload is
    /// delivered on the returned channel.
    fn subscribe_broadcast(&self, topic: &str) -> mpsc::Receiver<Bytes>;
}
