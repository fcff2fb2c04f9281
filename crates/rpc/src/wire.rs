use bytes::Bytes;
use serde::{Deserialize, Serialize};

use koinos_p2p_types::{BlockId, ChainId};

/// Requests of the `/koinos/peerrpc/1.0.0` service.
///
/// Framing is the host codec's concern; these are the JSON bodies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum PeerRpcRequest {
    GetChainId,
    GetHeadBlock,
    GetAncestorBlockId {
        parent_id: BlockId,
        child_height: u64,
    },
    GetBlocks {
        head_id: BlockId,
        start_height: u64,
        num_blocks: u32,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "value", rename_all = "snake_case")]
pub enum PeerRpcResponse {
    ChainId {
        id: ChainId,
    },
    HeadBlock {
        id: BlockId,
        height: u64,
    },
    AncestorBlockId {
        id: BlockId,
    },
    /// Serialized blocks, ordered by ascending height.
    Blocks {
        #[serde(with = "koinos_p2p_types::ser::hex_bytes_vec")]
        blocks: Vec<Bytes>,
    },
    Error {
        message: String,
    },
}

impl PeerRpcResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape_is_stable() {
        let request = PeerRpcRequest::GetAncestorBlockId {
            parent_id: BlockId::from(vec![0x01]),
            child_height: 42,
        };

        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"method":"get_ancestor_block_id","params":{"parent_id":"01","child_height":42}}"#
        );
    }

    #[test]
    fn blocks_travel_as_hex() {
        let response = PeerRpcResponse::Blocks {
            blocks: vec![Bytes::from_static(&[0xab]), Bytes::from_static(&[0xcd])],
        };

        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(json, r#"{"result":"blocks","value":{"blocks":["ab","cd"]}}"#);
    }
}
