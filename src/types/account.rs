use serde::{Deserialize, Serialize};

use crate::crypto::sha256;

use super::Address;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub address: Address,
    pub balance: u64,
    pub nonce: u64,
    pub created_at: i64,
}

impl Account {
    pub fn new(address: Address, balance: u64, created_at: i64) -> Self {
        Self {
            address,
            balance,
            nonce: 0,
            created_at,
        }
    }

    /// State-tree leaf: SHA-256(address ‖ balance ‖ nonce), little-endian
    /// integers.
    pub fn state_leaf(&self) -> [u8; 32] {
        let mut data = Vec::with_capacity(48);
        data.extend_from_slice(&self.address);
        data.extend_from_slice(&self.balance.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        sha256(&data)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidatorRecord {
    pub address: Address,
    pub active: bool,
    pub blocks_produced: u64,
    pub last_block_number: u64,
    pub last_block_timestamp: i64,
    pub registered_at: i64,
    pub updated_at: i64,
}

impl ValidatorRecord {
    pub fn new(address: Address, registered_at: i64) -> Self {
        Self {
            address,
            active: true,
            blocks_produced: 0,
            last_block_number: 0,
            last_block_timestamp: 0,
            registered_at,
            updated_at: registered_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_leaf_tracks_balance_and_nonce() {
        let mut account = Account::new([7u8; 32], 100, 0);
        let leaf = account.state_leaf();
        account.balance = 101;
        assert_ne!(account.state_leaf(), leaf);
        account.balance = 100;
        account.nonce = 1;
        assert_ne!(account.state_leaf(), leaf);
    }
}
