use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use tracing::debug;

use crate::errors::{ChainError, ChainResult};
use crate::merkle::merkle_root;
use crate::types::{
    unix_timestamp, Account, Address, Block, BlockMessage, BlockSource, ChainState, StoredBlock,
    Transaction, TxRecord, TxType, ValidatorRecord, MAX_SYNC_BLOCKS, MIN_ESCROW_AMOUNT,
};

pub const STORAGE_SCHEMA_VERSION: u32 = 1;

const CF_ACCOUNTS: &str = "accounts";
const CF_BLOCKS: &str = "blocks";
const CF_BLOCK_INDEX: &str = "block_index";
const CF_TRANSACTIONS: &str = "transactions";
const CF_VALIDATORS: &str = "validators";
const CF_METADATA: &str = "metadata";

const CHAIN_STATE_KEY: &[u8] = b"chain_state";
const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

const COLUMN_FAMILIES: [&str; 6] = [
    CF_ACCOUNTS,
    CF_BLOCKS,
    CF_BLOCK_INDEX,
    CF_TRANSACTIONS,
    CF_VALIDATORS,
    CF_METADATA,
];

/// Durable home of the account map, the append-only block archive, and the
/// chain head pointer. One exclusive writer, many concurrent readers.
pub struct StateStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    write_gate: RwLock<()>,
}

impl StateStore {
    pub fn open(path: &Path) -> ChainResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, descriptors)?;
        let store = Self {
            db: Arc::new(db),
            write_gate: RwLock::new(()),
        };
        store.ensure_schema_supported()?;
        Ok(store)
    }

    fn cf(&self, name: &str) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ChainError::Config(format!("missing column family {name}")))
    }

    fn ensure_schema_supported(&self) -> ChainResult<()> {
        let metadata = self.cf(CF_METADATA)?;
        match self.db.get_cf(&metadata, SCHEMA_VERSION_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Config("invalid schema version encoding".into()))?;
                let version = u32::from_be_bytes(bytes);
                if version != STORAGE_SCHEMA_VERSION {
                    return Err(ChainError::Config(format!(
                        "storage schema version {version} is not supported \
                         (expected {STORAGE_SCHEMA_VERSION})"
                    )));
                }
                Ok(())
            }
            None => {
                self.db.put_cf(
                    &metadata,
                    SCHEMA_VERSION_KEY,
                    STORAGE_SCHEMA_VERSION.to_be_bytes(),
                )?;
                Ok(())
            }
        }
    }

    pub fn schema_version(&self) -> u32 {
        STORAGE_SCHEMA_VERSION
    }

    // ---- accounts ----

    pub fn get_account(&self, address: &Address) -> ChainResult<Option<Account>> {
        let _guard = self.write_gate.read();
        self.read_account(address)
    }

    fn read_account(&self, address: &Address) -> ChainResult<Option<Account>> {
        let cf = self.cf(CF_ACCOUNTS)?;
        match self.db.get_cf(&cf, address)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn create_account(&self, address: Address, initial_balance: u64) -> ChainResult<Account> {
        let _guard = self.write_gate.write();
        if self.read_account(&address)?.is_some() {
            return Err(ChainError::Transaction(format!(
                "account {} already exists",
                hex::encode(address)
            )));
        }
        let account = Account::new(address, initial_balance, unix_timestamp());
        let cf = self.cf(CF_ACCOUNTS)?;
        self.db
            .put_cf(&cf, address, bincode::serialize(&account)?)?;
        Ok(account)
    }

    // ---- blocks ----

    pub fn chain_state(&self) -> ChainResult<ChainState> {
        let _guard = self.write_gate.read();
        self.read_chain_state()
    }

    fn read_chain_state(&self) -> ChainResult<ChainState> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, CHAIN_STATE_KEY)? {
            Some(value) => Ok(bincode::deserialize(&value)?),
            None => Ok(ChainState::empty()),
        }
    }

    pub fn get_block_by_number(&self, number: u64) -> ChainResult<Option<Block>> {
        let _guard = self.write_gate.read();
        self.read_block(number)
    }

    fn read_block(&self, number: u64) -> ChainResult<Option<Block>> {
        let cf = self.cf(CF_BLOCKS)?;
        match self.db.get_cf(&cf, number.to_be_bytes())? {
            Some(value) => {
                let stored: StoredBlock = bincode::deserialize(&value)?;
                Ok(Some(stored.into_block()?))
            }
            None => Ok(None),
        }
    }

    pub fn get_block_by_hash(&self, hash: &[u8; 32]) -> ChainResult<Option<Block>> {
        let _guard = self.write_gate.read();
        let index = self.cf(CF_BLOCK_INDEX)?;
        match self.db.get_cf(&index, hash)? {
            Some(value) => {
                let bytes: [u8; 8] = value
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Config("invalid block index encoding".into()))?;
                self.read_block(u64::from_be_bytes(bytes))
            }
            None => Ok(None),
        }
    }

    pub fn latest_block(&self) -> ChainResult<Option<Block>> {
        let _guard = self.write_gate.read();
        let head = self.read_chain_state()?;
        if head.total_blocks == 0 {
            return Ok(None);
        }
        self.read_block(head.head_block_number)
    }

    pub fn get_block_range(&self, start: u64, end: u64) -> ChainResult<Vec<Block>> {
        let _guard = self.write_gate.read();
        if end < start {
            return Ok(Vec::new());
        }
        let cf = self.cf(CF_BLOCKS)?;
        let mut blocks = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start.to_be_bytes(), Direction::Forward),
        );
        for entry in iter {
            let (key, value) = entry?;
            let bytes: [u8; 8] = key
                .as_ref()
                .try_into()
                .map_err(|_| ChainError::Config("invalid block key encoding".into()))?;
            if u64::from_be_bytes(bytes) > end {
                break;
            }
            let stored: StoredBlock = bincode::deserialize(&value)?;
            blocks.push(stored.into_block()?);
        }
        Ok(blocks)
    }

    pub fn get_block_count(&self) -> ChainResult<u64> {
        Ok(self.chain_state()?.total_blocks)
    }

    /// Record the configured block cadence in the head row. Called once at
    /// boot; purely informational for downstream readers.
    pub fn set_block_time(&self, seconds: u64) -> ChainResult<()> {
        let _guard = self.write_gate.write();
        let mut chain = self.read_chain_state()?;
        if chain.block_time_seconds == seconds {
            return Ok(());
        }
        chain.block_time_seconds = seconds;
        chain.updated_at = unix_timestamp();
        let cf = self.cf(CF_METADATA)?;
        self.db
            .put_cf(&cf, CHAIN_STATE_KEY, bincode::serialize(&chain)?)?;
        Ok(())
    }

    pub fn has_transaction(&self, tx_hash: &[u8; 32]) -> ChainResult<bool> {
        let _guard = self.write_gate.read();
        let cf = self.cf(CF_TRANSACTIONS)?;
        Ok(self.db.get_cf(&cf, tx_hash)?.is_some())
    }

    pub fn get_validator(&self, address: &Address) -> ChainResult<Option<ValidatorRecord>> {
        let _guard = self.write_gate.read();
        let cf = self.cf(CF_VALIDATORS)?;
        match self.db.get_cf(&cf, address)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Run the body against current state without committing anything.
    /// Returns the state root the block would settle on.
    pub fn preview_state_root(&self, transactions: &[Transaction]) -> ChainResult<[u8; 32]> {
        let _guard = self.write_gate.read();
        let touched = self.apply_to_cache(transactions, unix_timestamp())?;
        Ok(state_root_of(&touched))
    }

    /// Atomically apply a block: mutate accounts in body order, archive the
    /// block and its transactions, and advance the head pointer in a single
    /// write batch. Any per-transaction failure rejects the whole block and
    /// leaves every column family untouched.
    pub fn apply_block(&self, block: &Block) -> ChainResult<[u8; 32]> {
        let _guard = self.write_gate.write();

        let head = self.read_chain_state()?;
        if block.header.block_number != head.head_block_number + 1 {
            return Err(ChainError::Consensus(format!(
                "block {} does not extend head {}",
                block.header.block_number, head.head_block_number
            )));
        }
        if block.header.parent_hash != head.head_block_hash {
            return Err(ChainError::Consensus("parent hash mismatch".into()));
        }
        let blocks_cf = self.cf(CF_BLOCKS)?;
        let number_key = block.header.block_number.to_be_bytes();
        if self.db.get_cf(&blocks_cf, number_key)?.is_some() {
            return Err(ChainError::Consensus(format!(
                "block {} already archived",
                block.header.block_number
            )));
        }
        let tx_cf = self.cf(CF_TRANSACTIONS)?;
        for tx in &block.transactions {
            if self.db.get_cf(&tx_cf, tx.hash())?.is_some() {
                return Err(ChainError::Consensus(format!(
                    "transaction {} already included",
                    hex::encode(tx.hash())
                )));
            }
        }

        let now = unix_timestamp();
        let touched = self.apply_to_cache(&block.transactions, block.header.timestamp)?;
        let state_root = state_root_of(&touched);
        if state_root != block.header.state_root {
            return Err(ChainError::Consensus(format!(
                "state root mismatch: computed {}, header {}",
                hex::encode(state_root),
                hex::encode(block.header.state_root)
            )));
        }

        let mut batch = WriteBatch::default();
        let accounts_cf = self.cf(CF_ACCOUNTS)?;
        for account in touched.values() {
            batch.put_cf(&accounts_cf, account.address, bincode::serialize(account)?);
        }
        self.archive_into(&mut batch, block, head, now)?;

        self.db.write(batch)?;
        debug!(
            block_number = block.header.block_number,
            tx_count = block.transactions.len(),
            "block applied"
        );
        Ok(state_root)
    }

    /// Archive a block without replaying its transactions against account
    /// state. Used when backfilling history below a trusted checkpoint;
    /// normal extension goes through [`StateStore::apply_block`].
    pub fn save_block(&self, block: &Block) -> ChainResult<()> {
        let _guard = self.write_gate.write();
        let head = self.read_chain_state()?;
        if block.header.block_number != head.head_block_number + 1 {
            return Err(ChainError::Consensus(format!(
                "block {} does not extend head {}",
                block.header.block_number, head.head_block_number
            )));
        }
        let blocks_cf = self.cf(CF_BLOCKS)?;
        if self
            .db
            .get_cf(&blocks_cf, block.header.block_number.to_be_bytes())?
            .is_some()
        {
            return Err(ChainError::Consensus(format!(
                "block {} already archived",
                block.header.block_number
            )));
        }
        let mut batch = WriteBatch::default();
        self.archive_into(&mut batch, block, head, unix_timestamp())?;
        self.db.write(batch)?;
        Ok(())
    }

    /// Archive writes shared by apply and save: the block row, the
    /// hash index, per-transaction rows, validator upkeep, and the head
    /// pointer. The caller commits the batch.
    fn archive_into(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
        head: ChainState,
        now: i64,
    ) -> ChainResult<()> {
        let blocks_cf = self.cf(CF_BLOCKS)?;
        let number_key = block.header.block_number.to_be_bytes();
        let stored = StoredBlock::from_block(block, now)?;
        batch.put_cf(&blocks_cf, number_key, bincode::serialize(&stored)?);
        let index_cf = self.cf(CF_BLOCK_INDEX)?;
        batch.put_cf(&index_cf, block.block_hash, number_key);
        let tx_cf = self.cf(CF_TRANSACTIONS)?;
        for tx in &block.transactions {
            let record = TxRecord::from_transaction(tx, block.header.block_number);
            batch.put_cf(&tx_cf, tx.hash(), bincode::serialize(&record)?);
        }

        let validators_cf = self.cf(CF_VALIDATORS)?;
        let mut first_sighting = false;
        let mut validator = match self.db.get_cf(&validators_cf, block.header.validator)? {
            Some(value) => bincode::deserialize::<ValidatorRecord>(&value)?,
            None => {
                first_sighting = true;
                ValidatorRecord::new(block.header.validator, now)
            }
        };
        validator.blocks_produced += 1;
        validator.last_block_number = block.header.block_number;
        validator.last_block_timestamp = block.header.timestamp;
        validator.updated_at = now;
        batch.put_cf(
            &validators_cf,
            block.header.validator,
            bincode::serialize(&validator)?,
        );

        let mut next = head;
        if first_sighting {
            next.validator_count += 1;
        }
        if next.total_blocks == 0 {
            next.genesis_hash = block.block_hash;
            next.genesis_timestamp = block.header.timestamp;
        }
        next.head_block_number = block.header.block_number;
        next.head_block_hash = block.block_hash;
        next.total_blocks += 1;
        next.total_transactions += block.transactions.len() as u64;
        next.updated_at = now;
        let metadata_cf = self.cf(CF_METADATA)?;
        batch.put_cf(&metadata_cf, CHAIN_STATE_KEY, bincode::serialize(&next)?);
        Ok(())
    }

    /// Deterministic per-transaction apply into a working copy of the
    /// account map. Body order, first failure aborts.
    fn apply_to_cache(
        &self,
        transactions: &[Transaction],
        created_at: i64,
    ) -> ChainResult<BTreeMap<Address, Account>> {
        let mut touched: BTreeMap<Address, Account> = BTreeMap::new();
        for tx in transactions {
            // Exhaustive over the transaction kinds the chain knows; adding
            // a variant without teaching the applier about it will not
            // compile.
            match tx.tx_type {
                TxType::Transfer => {}
                TxType::Escrow => {
                    if tx.amount < MIN_ESCROW_AMOUNT {
                        return Err(ChainError::Transaction(format!(
                            "escrow amount {} below minimum {MIN_ESCROW_AMOUNT}",
                            tx.amount
                        )));
                    }
                    if tx.data.len() != 32 {
                        return Err(ChainError::Transaction(
                            "escrow requires a 32-byte problem hash payload".into(),
                        ));
                    }
                }
            }
            let sender = match touched.get(&tx.from) {
                Some(account) => account.clone(),
                None => self.read_account(&tx.from)?.ok_or_else(|| {
                    ChainError::Transaction(format!(
                        "sender account {} not found",
                        hex::encode(tx.from)
                    ))
                })?,
            };
            if sender.nonce != tx.nonce {
                return Err(ChainError::Transaction(format!(
                    "nonce mismatch: expected {}, got {}",
                    sender.nonce, tx.nonce
                )));
            }
            let cost = tx.total_cost()?;
            if sender.balance < cost {
                return Err(ChainError::Transaction(format!(
                    "insufficient balance: have {}, need {cost}",
                    sender.balance
                )));
            }

            let mut sender = sender;
            sender.balance -= cost;
            sender.nonce += 1;
            touched.insert(sender.address, sender);

            let mut recipient = match touched.get(&tx.to) {
                Some(account) => account.clone(),
                None => match self.read_account(&tx.to)? {
                    Some(account) => account,
                    None => Account::new(tx.to, 0, created_at),
                },
            };
            // The fee is burned; only the amount is credited.
            recipient.balance = recipient.balance.checked_add(tx.amount).ok_or_else(|| {
                ChainError::Transaction("recipient balance overflows".into())
            })?;
            touched.insert(recipient.address, recipient);
        }
        Ok(touched)
    }
}

impl BlockSource for StateStore {
    fn sync_range(&self, from: u64, to: u64, max: usize) -> ChainResult<Vec<BlockMessage>> {
        let max = max.min(MAX_SYNC_BLOCKS).max(1);
        let end = to.min(from.saturating_add(max as u64 - 1));
        let blocks = self.get_block_range(from, end)?;
        Ok(blocks.iter().map(BlockMessage::from).collect())
    }
}

/// Merkle root over the state leaves of the touched accounts, ascending by
/// address.
pub fn state_root_of(touched: &BTreeMap<Address, Account>) -> [u8; 32] {
    let leaves: Vec<[u8; 32]> = touched.values().map(Account::state_leaf).collect();
    merkle_root(&leaves)
}
