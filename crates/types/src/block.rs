use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::{BlockId, TransactionId};

/// A node in the DAG of known blocks.
///
/// For a non-genesis block, `previous` is the id of the block at
/// `height - 1` on the same fork.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockTopology {
    pub id: BlockId,
    pub height: u64,
    pub previous: BlockId,
}

impl BlockTopology {
    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub previous: BlockId,
    pub height: u64,
    pub timestamp: u64,
}

/// A full block as carried over the peer wire and the local bus.
///
/// The transaction payload is opaque to the p2p layer; only the header is
/// ever inspected here.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub header: BlockHeader,
    #[serde(with = "crate::ser::hex_bytes")]
    pub payload: Bytes,
}

impl Block {
    pub fn topology(&self) -> BlockTopology {
        BlockTopology {
            id: self.id.clone(),
            height: self.header.height,
            previous: self.header.previous.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    #[serde(with = "crate::ser::hex_bytes")]
    pub payload: Bytes,
}

/// Payload of the `koinos.block.accept` broadcast.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAccepted {
    pub block: Block,
}

/// Payload of the `koinos.transaction.accept` broadcast.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAccepted {
    pub transaction: Transaction,
}

/// Payload of the `koinos.forks.update` broadcast.
///
/// `heads` are the leaves of the block DAG currently tracked as candidate
/// tips; the first entry is the fork the chain considers its head.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkHeads {
    pub last_irreversible_block: BlockTopology,
    pub heads: Vec<BlockTopology>,
}

impl ForkHeads {
    /// The topology of the preferred fork head, if any.
    pub fn best_head(&self) -> Option<&BlockTopology> {
        self.heads.first()
    }
}
