use libp2p::PeerId;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// A point-in-time `can_connect` query, answered by the error score engine.
#[derive(Debug)]
pub struct GateRequest {
    pub peer: PeerId,
    pub reply: oneshot::Sender<bool>,
}

/// Connection gate consulted by the swarm task on dial and on every
/// established connection.
#[derive(Clone, Debug)]
pub struct ConnectionGate {
    tx: mpsc::Sender<GateRequest>,
}

impl ConnectionGate {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<GateRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn can_connect(&self, peer: PeerId) -> bool {
        let (reply, rx) = oneshot::channel();

        if self.tx.send(GateRequest { peer, reply }).await.is_err() {
            debug!(%peer, "Connection gate unavailable, denying connection");
            return false;
        }

        rx.await.unwrap_or(false)
    }
}
