use serde::{Deserialize, Serialize};

use crate::errors::ChainResult;

use super::{hex_serde, Address, Block, BlockHeader, Transaction};

/// Upper bound a block-sync responder will serve in one request.
pub const MAX_SYNC_BLOCKS: usize = 128;

/// Block as it travels on the gossip wire: flat header fields plus the
/// full body.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockMessage {
    pub block_number: u64,
    #[serde(with = "hex_serde::hash")]
    pub parent_hash: [u8; 32],
    #[serde(with = "hex_serde::hash")]
    pub state_root: [u8; 32],
    #[serde(with = "hex_serde::hash")]
    pub tx_root: [u8; 32],
    pub timestamp: i64,
    #[serde(with = "hex_serde::hash")]
    pub validator: Address,
    pub difficulty: u64,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    #[serde(with = "hex_serde::hash")]
    pub extra_data: [u8; 32],
    pub transactions: Vec<Transaction>,
    #[serde(with = "hex_serde::hash")]
    pub block_hash: [u8; 32],
}

impl From<&Block> for BlockMessage {
    fn from(block: &Block) -> Self {
        let header = &block.header;
        Self {
            block_number: header.block_number,
            parent_hash: header.parent_hash,
            state_root: header.state_root,
            tx_root: header.tx_root,
            timestamp: header.timestamp,
            validator: header.validator,
            difficulty: header.difficulty,
            nonce: header.nonce,
            gas_limit: header.gas_limit,
            gas_used: header.gas_used,
            extra_data: header.extra_data,
            transactions: block.transactions.clone(),
            block_hash: block.block_hash,
        }
    }
}

impl BlockMessage {
    pub fn into_block(self) -> Block {
        Block {
            header: BlockHeader {
                block_number: self.block_number,
                parent_hash: self.parent_hash,
                state_root: self.state_root,
                tx_root: self.tx_root,
                timestamp: self.timestamp,
                validator: self.validator,
                difficulty: self.difficulty,
                nonce: self.nonce,
                gas_limit: self.gas_limit,
                gas_used: self.gas_used,
                extra_data: self.extra_data,
            },
            transactions: self.transactions,
            block_hash: self.block_hash,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CidType {
    Problem,
    Solution,
    Block,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CidMetadata {
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_hash: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Off-chain content announcement. The payload itself travels out of band.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CidMessage {
    pub cid: String,
    #[serde(rename = "type")]
    pub cid_type: CidType,
    pub block_number: u64,
    pub timestamp: i64,
    pub publisher: String,
    pub metadata: CidMetadata,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockSyncRequest {
    pub from_block: u64,
    pub to_block: u64,
    pub max_blocks: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockSyncResponse {
    pub blocks: Vec<BlockMessage>,
}

/// Read-only view of the archive the block-sync responder serves from.
/// Implemented by the state store; must not take the writer gate.
pub trait BlockSource: Send + Sync + 'static {
    fn sync_range(&self, from: u64, to: u64, max: usize) -> ChainResult<Vec<BlockMessage>>;
}
