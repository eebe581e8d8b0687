use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::BlockConfig;
use crate::errors::{ChainError, ChainResult};
use crate::mempool::Mempool;
use crate::merkle::merkle_root;
use crate::state::StateStore;
use crate::types::{
    unix_timestamp, Address, Block, BlockHeader, Transaction, MAX_BLOCK_GAS,
};

/// How many candidates to pull from the mempool per drain round.
const DRAIN_CHUNK: usize = 256;

/// Assembles blocks from mempool contents and applies produced or received
/// blocks to the state store.
pub struct BlockBuilder {
    state: Arc<StateStore>,
    mempool: Arc<Mempool>,
    config: BlockConfig,
}

struct SenderProjection {
    nonce: u64,
    balance: u64,
}

impl BlockBuilder {
    pub fn new(state: Arc<StateStore>, mempool: Arc<Mempool>, config: BlockConfig) -> Self {
        Self {
            state,
            mempool,
            config,
        }
    }

    /// Select the best admissible transactions and seal them into the next
    /// block. Rejected candidates go back to the mempool; aging will purge
    /// the hopeless ones.
    pub fn build_block(
        &self,
        parent_hash: [u8; 32],
        block_number: u64,
        validator: Address,
    ) -> ChainResult<Block> {
        let gas_cap = self.config.gas_limit.min(MAX_BLOCK_GAS);
        let mut included: Vec<Transaction> = Vec::new();
        let mut returned: Vec<Transaction> = Vec::new();
        let mut projections: HashMap<Address, SenderProjection> = HashMap::new();
        let mut gas_used: u64 = 0;

        'drain: loop {
            let candidates = self.mempool.pop_best(DRAIN_CHUNK);
            if candidates.is_empty() {
                break;
            }
            let mut pending = candidates.into_iter();
            while let Some(tx) = pending.next() {
                if included.len() >= self.config.max_tx_per_block {
                    returned.push(tx);
                    continue;
                }
                if gas_used + tx.gas_limit > gas_cap {
                    // Gas budget exhausted; everything left goes back.
                    returned.push(tx);
                    returned.extend(pending);
                    let mut rest = self.mempool.pop_best(usize::MAX);
                    returned.append(&mut rest);
                    break 'drain;
                }

                let projection = match projections.entry(tx.from) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => match self.state.get_account(entry.key())? {
                        Some(account) => entry.insert(SenderProjection {
                            nonce: account.nonce,
                            balance: account.balance,
                        }),
                        None => {
                            debug!(tx = %hex::encode(tx.hash()), "sender unknown, skipping");
                            returned.push(tx);
                            continue;
                        }
                    },
                };
                if tx.nonce != projection.nonce {
                    debug!(
                        tx = %hex::encode(tx.hash()),
                        expected = projection.nonce,
                        got = tx.nonce,
                        "nonce mismatch, skipping"
                    );
                    returned.push(tx);
                    continue;
                }
                let cost = match tx.total_cost() {
                    Ok(cost) => cost,
                    Err(err) => {
                        warn!(?err, "dropping overflowing transaction");
                        continue;
                    }
                };
                if projection.balance < cost {
                    debug!(tx = %hex::encode(tx.hash()), "insufficient projected balance, skipping");
                    returned.push(tx);
                    continue;
                }

                projection.nonce += 1;
                projection.balance -= cost;
                gas_used += tx.gas_limit;
                included.push(tx);
            }
        }

        self.mempool.restore(returned);

        let state_root = self.state.preview_state_root(&included)?;
        let tx_hashes: Vec<[u8; 32]> = included.iter().map(Transaction::hash).collect();
        let tx_root = merkle_root(&tx_hashes);

        let now = unix_timestamp();
        let head = self.state.chain_state()?;
        let timestamp = if head.total_blocks > 0 && head.head_block_hash == parent_hash {
            let parent_ts = self
                .state
                .latest_block()?
                .map(|block| block.header.timestamp)
                .unwrap_or(0);
            now.max(parent_ts + 1)
        } else {
            now
        };

        let header = BlockHeader {
            block_number,
            parent_hash,
            state_root,
            tx_root,
            timestamp,
            validator,
            difficulty: 1,
            nonce: 0,
            gas_limit: gas_cap,
            gas_used,
            extra_data: [0u8; 32],
        };
        let block = Block::new(header, included);
        debug!(
            block_number,
            tx_count = block.transactions.len(),
            gas_used,
            "built block"
        );
        Ok(block)
    }

    /// Fully validate and atomically apply a block, then drop its
    /// transactions from the mempool. Returns the settled state root.
    pub fn apply_block(&self, block: &Block) -> ChainResult<[u8; 32]> {
        let head = self.state.chain_state()?;
        let parent_timestamp = if head.total_blocks > 0 {
            self.state
                .latest_block()?
                .map(|parent| parent.header.timestamp)
                .unwrap_or(0)
        } else {
            0
        };
        block.validate_structure(
            head.head_block_hash,
            head.head_block_number,
            parent_timestamp,
            unix_timestamp(),
        )?;
        for tx in &block.transactions {
            tx.validate_basic().map_err(|err| match err {
                ChainError::Transaction(reason) => ChainError::Consensus(reason),
                other => other,
            })?;
        }

        let state_root = self.state.apply_block(block)?;

        for tx in &block.transactions {
            self.mempool.remove(&tx.hash());
        }
        info!(
            block_number = block.header.block_number,
            tx_count = block.transactions.len(),
            "applied block"
        );
        Ok(state_root)
    }
}
