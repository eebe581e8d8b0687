use std::time::{SystemTime, UNIX_EPOCH};

mod account;
mod block;
mod checkpoint;
pub(crate) mod hex_serde;
mod message;
mod transaction;

pub use account::{Account, ValidatorRecord};
pub use block::{
    Block, BlockHeader, ChainState, StoredBlock, MAX_BLOCK_GAS, MAX_TIMESTAMP_DRIFT_SECS,
};
pub use checkpoint::Checkpoint;
pub use message::{
    BlockMessage, BlockSource, BlockSyncRequest, BlockSyncResponse, CidMessage, CidMetadata,
    CidType, MAX_SYNC_BLOCKS,
};
pub use transaction::{Transaction, TxRecord, TxType, MIN_ESCROW_AMOUNT, MIN_TRANSFER_GAS};

/// 32-byte public-key identifier. Compared by value.
pub type Address = [u8; 32];

pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
