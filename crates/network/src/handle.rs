use bytes::Bytes;
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::{CtrlMsg, Event, OutboundRequestId, Topic};

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network task has shut down")]
    Closed,

    #[error("dial failed: {0}")]
    Dial(String),
}

/// Cloneable sender half of the network handle.
#[derive(Clone, Debug)]
pub struct Control {
    tx_ctrl: mpsc::Sender<CtrlMsg>,
}

impl Control {
    pub(crate) fn new(tx_ctrl: mpsc::Sender<CtrlMsg>) -> Self {
        Self { tx_ctrl }
    }

    /// A control not backed by a live swarm, with the receiving side
    /// handed to the caller. Used by tests that script the host.
    pub fn detached(capacity: usize) -> (Self, mpsc::Receiver<CtrlMsg>) {
        let (tx_ctrl, rx_ctrl) = mpsc::channel(capacity);
        (Self { tx_ctrl }, rx_ctrl)
    }

    async fn send(&self, msg: CtrlMsg) -> Result<(), NetworkError> {
        self.tx_ctrl.send(msg).await.map_err(|_| NetworkError::Closed)
    }

    pub async fn publish(&self, topic: Topic, data: Bytes) -> Result<(), NetworkError> {
        self.send(CtrlMsg::Publish(topic, data)).await
    }

    pub async fn subscribe(&self, topic: Topic) -> Result<(), NetworkError> {
        self.send(CtrlMsg::Subscribe(topic)).await
    }

    pub async fn unsubscribe(&self, topic: Topic) -> Result<(), NetworkError> {
        self.send(CtrlMsg::Unsubscribe(topic)).await
    }

    /// Dial a peer and wait for the connection to be established or fail.
    pub async fn dial(&self, addr: Multiaddr) -> Result<(), NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.send(CtrlMsg::Dial(addr, reply)).await?;

        rx.await
            .map_err(|_| NetworkError::Closed)?
            .map_err(NetworkError::Dial)
    }

    pub async fn disconnect(&self, peer: PeerId) -> Result<(), NetworkError> {
        self.send(CtrlMsg::Disconnect(peer)).await
    }

    /// Send a peer RPC request; the response arrives later as an
    /// [`Event::RpcResponse`] carrying the returned request id.
    pub async fn rpc_request(
        &self,
        peer: PeerId,
        body: Bytes,
    ) -> Result<OutboundRequestId, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.send(CtrlMsg::RpcRequest(peer, body, reply)).await?;
        rx.await.map_err(|_| NetworkError::Closed)
    }

    pub async fn rpc_reply(
        &self,
        request_id: crate::InboundRequestId,
        body: Bytes,
    ) -> Result<(), NetworkError> {
        self.send(CtrlMsg::RpcReply(request_id, body)).await
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerId>, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.send(CtrlMsg::ConnectedPeers(reply)).await?;
        rx.await.map_err(|_| NetworkError::Closed)
    }

    pub async fn shutdown(&self) -> Result<(), NetworkError> {
        self.send(CtrlMsg::Shutdown).await
    }
}

/// Owner's view of the running network task.
#[derive(Debug)]
pub struct Handle {
    peer_id: PeerId,
    control: Control,
    rx_event: mpsc::Receiver<Event>,
    task: JoinHandle<()>,
}

impl Handle {
    pub(crate) fn new(
        peer_id: PeerId,
        control: Control,
        rx_event: mpsc::Receiver<Event>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            peer_id,
            control,
            rx_event,
            task,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn control(&self) -> Control {
        self.control.clone()
    }

    /// Receive the next network event. Returns `None` once the task exits.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx_event.recv().await
    }

    /// Wait for the network task to exit.
    pub async fn join(self) {
        let _ = self.task.await;
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}
