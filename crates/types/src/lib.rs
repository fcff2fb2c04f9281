mod block;
pub use block::{
    Block, BlockAccepted, BlockHeader, BlockTopology, ForkHeads, Transaction, TransactionAccepted,
};

mod ids;
pub use ids::{BlockId, ChainId, TransactionId};

mod error;
pub use error::{ErrorKind, P2pError, PeerError};

mod sync;
pub use sync::{DownloadInterest, GossipVote, NodeUpdate, PeerHeadInfo};

pub mod ser;

pub use libp2p_identity::PeerId;
