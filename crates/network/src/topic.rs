use core::fmt;

use libp2p::gossipsub;

/// The two gossip topics of the overlay.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Block,
    Transaction,
}

impl Topic {
    pub fn all() -> &'static [Topic] {
        &[Topic::Block, Topic::Transaction]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Block => "koinos.blocks",
            Topic::Transaction => "koinos.transactions",
        }
    }

    pub fn to_gossipsub_topic(self) -> gossipsub::IdentTopic {
        gossipsub::IdentTopic::new(self.as_str())
    }

    pub fn from_topic_hash(hash: &gossipsub::TopicHash) -> Option<Self> {
        match hash.as_str() {
            "koinos.blocks" => Some(Topic::Block),
            "koinos.transactions" => Some(Topic::Transaction),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.as_str().fmt(f)
    }
}
