use serde::{Deserialize, Serialize};

use crate::crypto::sha256;
use crate::errors::{ChainError, ChainResult};
use crate::merkle::merkle_root;

use super::{Address, Transaction};

/// Consensus hard cap on per-block gas. Built blocks pack against the
/// configured (lower) budget; received blocks above this are invalid.
pub const MAX_BLOCK_GAS: u64 = 50_000_000;

/// Received blocks may lead local wall clock by at most this many seconds.
pub const MAX_TIMESTAMP_DRIFT_SECS: i64 = 15;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_number: u64,
    pub parent_hash: [u8; 32],
    pub state_root: [u8; 32],
    pub tx_root: [u8; 32],
    pub timestamp: i64,
    pub validator: Address,
    pub difficulty: u64,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub extra_data: [u8; 32],
}

impl BlockHeader {
    /// Little-endian concatenation of all header fields in declaration
    /// order. Two nodes must agree on this bit-for-bit.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(208);
        data.extend_from_slice(&self.block_number.to_le_bytes());
        data.extend_from_slice(&self.parent_hash);
        data.extend_from_slice(&self.state_root);
        data.extend_from_slice(&self.tx_root);
        data.extend_from_slice(&(self.timestamp as u64).to_le_bytes());
        data.extend_from_slice(&self.validator);
        data.extend_from_slice(&self.difficulty.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        data.extend_from_slice(&self.gas_limit.to_le_bytes());
        data.extend_from_slice(&self.gas_used.to_le_bytes());
        data.extend_from_slice(&self.extra_data);
        data
    }

    pub fn hash(&self) -> [u8; 32] {
        sha256(&self.canonical_bytes())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub block_hash: [u8; 32],
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        let block_hash = header.hash();
        Self {
            header,
            transactions,
            block_hash,
        }
    }

    pub fn tx_hashes(&self) -> Vec<[u8; 32]> {
        self.transactions.iter().map(Transaction::hash).collect()
    }

    pub fn compute_tx_root(&self) -> [u8; 32] {
        merkle_root(&self.tx_hashes())
    }

    /// Structural validation against a known parent and the local clock.
    /// State-dependent checks (state root, per-tx apply) happen in the
    /// state store.
    pub fn validate_structure(
        &self,
        parent_hash: [u8; 32],
        parent_number: u64,
        parent_timestamp: i64,
        now: i64,
    ) -> ChainResult<()> {
        let header = &self.header;
        if header.block_number != parent_number + 1 {
            return Err(ChainError::Consensus(format!(
                "block number {} does not extend head {}",
                header.block_number, parent_number
            )));
        }
        if header.parent_hash != parent_hash {
            return Err(ChainError::Consensus("parent hash mismatch".into()));
        }
        if parent_number > 0 && header.timestamp <= parent_timestamp {
            return Err(ChainError::Consensus(format!(
                "timestamp {} not after parent {}",
                header.timestamp, parent_timestamp
            )));
        }
        if header.timestamp > now + MAX_TIMESTAMP_DRIFT_SECS {
            return Err(ChainError::Consensus(format!(
                "timestamp {} too far in the future",
                header.timestamp
            )));
        }
        if header.gas_limit == 0 || header.gas_limit > MAX_BLOCK_GAS {
            return Err(ChainError::Consensus(format!(
                "gas limit {} outside (0, {MAX_BLOCK_GAS}]",
                header.gas_limit
            )));
        }
        if header.gas_used > header.gas_limit {
            return Err(ChainError::Consensus(format!(
                "gas used {} exceeds limit {}",
                header.gas_used, header.gas_limit
            )));
        }
        let declared_gas: u64 = self.transactions.iter().map(|tx| tx.gas_limit).sum();
        if declared_gas != header.gas_used {
            return Err(ChainError::Consensus(format!(
                "gas used {} does not match body total {declared_gas}",
                header.gas_used
            )));
        }
        if header.hash() != self.block_hash {
            return Err(ChainError::Consensus("block hash mismatch".into()));
        }
        if self.compute_tx_root() != header.tx_root {
            return Err(ChainError::Consensus("transaction root mismatch".into()));
        }
        Ok(())
    }
}

/// Archived form of a block: header fields plus the serialized body
/// payload. Rows are append-only; nothing updates or deletes them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredBlock {
    pub header: BlockHeader,
    pub block_hash: [u8; 32],
    pub tx_count: u32,
    pub tx_data: Vec<u8>,
    pub created_at: i64,
}

impl StoredBlock {
    pub fn from_block(block: &Block, created_at: i64) -> ChainResult<Self> {
        Ok(Self {
            header: block.header.clone(),
            block_hash: block.block_hash,
            tx_count: block.transactions.len() as u32,
            tx_data: serde_json::to_vec(&block.transactions)?,
            created_at,
        })
    }

    pub fn into_block(self) -> ChainResult<Block> {
        let transactions: Vec<Transaction> = serde_json::from_slice(&self.tx_data)?;
        Ok(Block {
            header: self.header,
            transactions,
            block_hash: self.block_hash,
        })
    }
}

/// Single-row head pointer kept alongside the archive.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainState {
    pub head_block_number: u64,
    pub head_block_hash: [u8; 32],
    pub genesis_hash: [u8; 32],
    pub genesis_timestamp: i64,
    pub block_time_seconds: u64,
    pub validator_count: u64,
    pub total_blocks: u64,
    pub total_transactions: u64,
    pub updated_at: i64,
}

impl ChainState {
    pub fn empty() -> Self {
        Self {
            head_block_number: 0,
            head_block_hash: [0u8; 32],
            genesis_hash: [0u8; 32],
            genesis_timestamp: 0,
            block_time_seconds: 0,
            validator_count: 0,
            total_blocks: 0,
            total_transactions: 0,
            updated_at: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            block_number: 1,
            parent_hash: [0u8; 32],
            state_root: [3u8; 32],
            tx_root: [0u8; 32],
            timestamp: 1_700_000_000,
            validator: [1u8; 32],
            difficulty: 1,
            nonce: 0,
            gas_limit: 30_000_000,
            gas_used: 0,
            extra_data: [0u8; 32],
        }
    }

    #[test]
    fn header_hash_is_pure_and_field_sensitive() {
        let header = sample_header();
        assert_eq!(header.hash(), header.hash());

        let mut other = sample_header();
        other.extra_data[31] = 1;
        assert_ne!(header.hash(), other.hash());
    }

    #[test]
    fn canonical_bytes_are_little_endian_in_field_order() {
        let header = sample_header();
        let bytes = header.canonical_bytes();
        assert_eq!(bytes.len(), 208);
        assert_eq!(&bytes[0..8], &1u64.to_le_bytes());
        assert_eq!(&bytes[8..40], &header.parent_hash);
        assert_eq!(&bytes[176..208], &header.extra_data);
    }

    #[test]
    fn structure_validation_rejects_future_timestamps() {
        let mut header = sample_header();
        header.timestamp = 2_000;
        let block = Block::new(header, Vec::new());
        let err = block
            .validate_structure([0u8; 32], 0, 0, 1_000)
            .unwrap_err();
        assert!(matches!(err, ChainError::Consensus(_)));
    }

    #[test]
    fn structure_validation_rejects_tampered_hash() {
        let block = {
            let mut block = Block::new(sample_header(), Vec::new());
            block.block_hash[0] ^= 0xff;
            block
        };
        let err = block
            .validate_structure([0u8; 32], 0, 0, block.header.timestamp)
            .unwrap_err();
        assert!(matches!(err, ChainError::Consensus(_)));
    }

    #[test]
    fn stored_block_roundtrips_body() {
        let block = Block::new(sample_header(), Vec::new());
        let stored = StoredBlock::from_block(&block, 42).expect("store");
        assert_eq!(stored.tx_count, 0);
        let restored = stored.into_block().expect("restore");
        assert_eq!(restored, block);
    }
}
