use libp2p::gossipsub::{IdentTopic, TopicHash};

/// Canonical pub/sub topics. The strings are part of the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GossipTopic {
    Transactions,
    Blocks,
    ContentIds,
}

pub const BLOCK_SYNC_PROTOCOL: &str = "/coinjecture/blocksync/1.0.0";

impl GossipTopic {
    pub const fn as_str(&self) -> &'static str {
        match self {
            GossipTopic::Transactions => "/coinjecture/tx/1.0.0",
            GossipTopic::Blocks => "/coinjecture/blocks/1.0.0",
            GossipTopic::ContentIds => "/coinjecture/cids/1.0.0",
        }
    }

    pub fn ident(self) -> IdentTopic {
        IdentTopic::new(self.as_str())
    }

    pub fn from_hash(hash: &TopicHash) -> Option<Self> {
        Self::from_str(hash.as_str())
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "/coinjecture/tx/1.0.0" => Some(GossipTopic::Transactions),
            "/coinjecture/blocks/1.0.0" => Some(GossipTopic::Blocks),
            "/coinjecture/cids/1.0.0" => Some(GossipTopic::ContentIds),
            _ => None,
        }
    }

    pub const fn all() -> [GossipTopic; 3] {
        [
            GossipTopic::Transactions,
            GossipTopic::Blocks,
            GossipTopic::ContentIds,
        ]
    }
}

impl std::fmt::Display for GossipTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
