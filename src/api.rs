//! Read-only query surface consumed by external collaborators (the HTTP
//! faucet, wallets, dashboards). Everything here is a read path: no call
//! acquires the state-store writer gate, and nothing can stall block
//! production.

use serde::Serialize;

use crate::errors::ChainResult;
use crate::node::NodeHandle;
use crate::types::{hex_serde, Account, Address, Block, BlockMessage};

#[derive(Clone, Debug, Serialize)]
pub struct AccountView {
    #[serde(with = "hex_serde::hash")]
    pub address: Address,
    pub balance: u64,
    pub nonce: u64,
}

impl From<Account> for AccountView {
    fn from(account: Account) -> Self {
        Self {
            address: account.address,
            balance: account.balance,
            nonce: account.nonce,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ChainStats {
    pub head_block_number: u64,
    #[serde(with = "hex_serde::hash")]
    pub head_block_hash: [u8; 32],
    pub block_time_seconds: u64,
    pub validator_count: u64,
    pub total_blocks: u64,
    pub total_transactions: u64,
    pub mempool_size: u32,
}

/// Thin facade over [`NodeHandle`] with the exact operation set the
/// external read-only interface is allowed to use.
#[derive(Clone)]
pub struct QueryApi {
    node: NodeHandle,
}

impl QueryApi {
    pub fn new(node: NodeHandle) -> Self {
        Self { node }
    }

    pub fn get_block_by_number(&self, number: u64) -> ChainResult<Option<BlockMessage>> {
        Ok(self
            .node
            .get_block_by_number(number)?
            .as_ref()
            .map(BlockMessage::from))
    }

    pub fn get_block_by_hash(&self, hash: &[u8; 32]) -> ChainResult<Option<BlockMessage>> {
        Ok(self
            .node
            .get_block_by_hash(hash)?
            .as_ref()
            .map(BlockMessage::from))
    }

    pub fn get_latest_block(&self) -> ChainResult<Option<BlockMessage>> {
        Ok(self.node.get_latest_block()?.as_ref().map(BlockMessage::from))
    }

    pub fn get_block_range(&self, start: u64, end: u64) -> ChainResult<Vec<BlockMessage>> {
        let blocks: Vec<Block> = self.node.get_block_range(start, end)?;
        Ok(blocks.iter().map(BlockMessage::from).collect())
    }

    pub fn get_account(&self, address: &Address) -> ChainResult<Option<AccountView>> {
        Ok(self.node.get_account(address)?.map(AccountView::from))
    }

    pub fn export_checkpoint(&self, block_number: u64) -> ChainResult<Vec<u8>> {
        self.node.export_checkpoint(block_number)
    }

    pub fn chain_stats(&self) -> ChainResult<ChainStats> {
        let chain = self.node.chain_state()?;
        Ok(ChainStats {
            head_block_number: chain.head_block_number,
            head_block_hash: chain.head_block_hash,
            block_time_seconds: chain.block_time_seconds,
            validator_count: chain.validator_count,
            total_blocks: chain.total_blocks,
            total_transactions: chain.total_transactions,
            mempool_size: self.node.mempool_size(),
        })
    }
}
