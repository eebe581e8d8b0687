use ed25519_dalek::{Keypair, Signer};
use serde::{Deserialize, Serialize};

use crate::crypto::{sha256, verify_raw};
use crate::errors::{ChainError, ChainResult};

use super::{hex_serde, Address};

/// Minimum gas a plain transfer must carry.
pub const MIN_TRANSFER_GAS: u64 = 21_000;

/// Minimum bounty amount an escrow transaction may lock.
pub const MIN_ESCROW_AMOUNT: u64 = 1_000;

pub const CODEC_VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TxType {
    Transfer,
    Escrow,
}

impl From<TxType> for u8 {
    fn from(value: TxType) -> Self {
        match value {
            TxType::Transfer => 0,
            TxType::Escrow => 1,
        }
    }
}

impl TryFrom<u8> for TxType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TxType::Transfer),
            1 => Ok(TxType::Escrow),
            other => Err(format!("unknown transaction type {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub codec_version: u8,
    pub tx_type: TxType,
    #[serde(with = "hex_serde::hash")]
    pub from: Address,
    #[serde(with = "hex_serde::hash")]
    pub to: Address,
    pub amount: u64,
    pub fee: u64,
    pub gas_limit: u64,
    pub gas_price: u64,
    pub nonce: u64,
    #[serde(with = "hex_serde::bytes")]
    pub data: Vec<u8>,
    pub timestamp: i64,
    #[serde(with = "hex_serde::signature")]
    pub signature: [u8; 64],
}

impl Transaction {
    /// Build and sign a transaction. The `from` address is the signer's
    /// public key.
    #[allow(clippy::too_many_arguments)]
    pub fn signed(
        keypair: &Keypair,
        tx_type: TxType,
        to: Address,
        amount: u64,
        fee: u64,
        gas_limit: u64,
        gas_price: u64,
        nonce: u64,
        data: Vec<u8>,
        timestamp: i64,
    ) -> Self {
        let mut tx = Self {
            codec_version: CODEC_VERSION,
            tx_type,
            from: keypair.public.to_bytes(),
            to,
            amount,
            fee,
            gas_limit,
            gas_price,
            nonce,
            data,
            timestamp,
            signature: [0u8; 64],
        };
        tx.signature = keypair.sign(&tx.canonical_bytes()).to_bytes();
        tx
    }

    /// Canonical little-endian preimage used for both hashing and signing.
    /// `fee` travels alongside the transaction but is not part of the
    /// preimage.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(98 + self.data.len() + 12);
        message.push(self.codec_version);
        message.push(u8::from(self.tx_type));
        message.extend_from_slice(&self.from);
        message.extend_from_slice(&self.to);
        message.extend_from_slice(&self.amount.to_le_bytes());
        message.extend_from_slice(&self.nonce.to_le_bytes());
        message.extend_from_slice(&self.gas_limit.to_le_bytes());
        message.extend_from_slice(&self.gas_price.to_le_bytes());
        message.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        message.extend_from_slice(&self.data);
        message.extend_from_slice(&(self.timestamp as u64).to_le_bytes());
        message
    }

    pub fn hash(&self) -> [u8; 32] {
        sha256(&self.canonical_bytes())
    }

    pub fn verify_signature(&self) -> ChainResult<()> {
        verify_raw(&self.from, &self.canonical_bytes(), &self.signature)
    }

    /// Signature plus stateless field checks. Nonce and balance are judged
    /// against account state at block-build time, not here.
    pub fn validate_basic(&self) -> ChainResult<()> {
        if self.codec_version != CODEC_VERSION {
            return Err(ChainError::Codec(format!(
                "unsupported codec version {}",
                self.codec_version
            )));
        }
        if self.amount == 0 {
            return Err(ChainError::Transaction("amount must be positive".into()));
        }
        if self.from == self.to {
            return Err(ChainError::Transaction(
                "sender and recipient must differ".into(),
            ));
        }
        match self.tx_type {
            TxType::Transfer => {
                if self.gas_limit < MIN_TRANSFER_GAS {
                    return Err(ChainError::Transaction(format!(
                        "gas limit {} below transfer minimum {}",
                        self.gas_limit, MIN_TRANSFER_GAS
                    )));
                }
            }
            TxType::Escrow => {
                if self.amount < MIN_ESCROW_AMOUNT {
                    return Err(ChainError::Transaction(format!(
                        "escrow amount {} below minimum {}",
                        self.amount, MIN_ESCROW_AMOUNT
                    )));
                }
                if self.data.len() != 32 {
                    return Err(ChainError::Transaction(
                        "escrow requires a 32-byte problem hash payload".into(),
                    ));
                }
            }
        }
        self.verify_signature()
    }

    /// Total debit the sender must cover at inclusion time.
    pub fn total_cost(&self) -> ChainResult<u64> {
        self.amount
            .checked_add(self.fee)
            .ok_or_else(|| ChainError::Transaction("amount plus fee overflows".into()))
    }
}

/// Archived transaction row, written when the containing block is applied.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxRecord {
    pub block_number: u64,
    pub from: Address,
    pub to: Address,
    pub amount: u64,
    pub fee: u64,
    pub nonce: u64,
    pub gas_used: u64,
    pub timestamp: i64,
}

impl TxRecord {
    pub fn from_transaction(tx: &Transaction, block_number: u64) -> Self {
        Self {
            block_number,
            from: tx.from,
            to: tx.to,
            amount: tx.amount,
            fee: tx.fee,
            nonce: tx.nonce,
            gas_used: tx.gas_limit,
            timestamp: tx.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    fn sample_tx(keypair: &Keypair) -> Transaction {
        Transaction::signed(
            keypair,
            TxType::Transfer,
            [2u8; 32],
            100,
            10,
            MIN_TRANSFER_GAS,
            1,
            0,
            Vec::new(),
            1_700_000_000,
        )
    }

    #[test]
    fn signed_transaction_verifies() {
        let keypair = generate_keypair();
        let tx = sample_tx(&keypair);
        tx.validate_basic().expect("valid transaction");
    }

    #[test]
    fn tampered_amount_breaks_signature() {
        let keypair = generate_keypair();
        let mut tx = sample_tx(&keypair);
        tx.amount = 9_999;
        assert!(tx.verify_signature().is_err());
    }

    #[test]
    fn fee_is_not_part_of_the_preimage() {
        let keypair = generate_keypair();
        let mut tx = sample_tx(&keypair);
        let hash = tx.hash();
        tx.fee = 999;
        assert_eq!(tx.hash(), hash);
        tx.verify_signature().expect("signature unaffected by fee");
    }

    #[test]
    fn hash_preimage_layout_is_stable() {
        let keypair = generate_keypair();
        let tx = sample_tx(&keypair);
        let bytes = tx.canonical_bytes();
        assert_eq!(bytes[0], CODEC_VERSION);
        assert_eq!(bytes[1], 0); // transfer
        assert_eq!(&bytes[2..34], &tx.from);
        assert_eq!(&bytes[34..66], &tx.to);
        assert_eq!(&bytes[66..74], &tx.amount.to_le_bytes());
        // nonce, gas_limit, gas_price, data length, data, timestamp
        assert_eq!(bytes.len(), 66 + 8 * 4 + 4 + tx.data.len() + 8);
    }

    #[test]
    fn transfer_below_gas_floor_rejected() {
        let keypair = generate_keypair();
        let tx = Transaction::signed(
            &keypair,
            TxType::Transfer,
            [2u8; 32],
            100,
            10,
            20_000,
            1,
            0,
            Vec::new(),
            1_700_000_000,
        );
        assert!(matches!(
            tx.validate_basic(),
            Err(ChainError::Transaction(_))
        ));
    }

    #[test]
    fn escrow_enforces_bounty_minimums() {
        let keypair = generate_keypair();
        let dust = Transaction::signed(
            &keypair,
            TxType::Escrow,
            [2u8; 32],
            500,
            10,
            MIN_TRANSFER_GAS,
            1,
            0,
            vec![7u8; 32],
            1_700_000_000,
        );
        assert!(dust.validate_basic().is_err());

        let missing_problem = Transaction::signed(
            &keypair,
            TxType::Escrow,
            [2u8; 32],
            MIN_ESCROW_AMOUNT,
            10,
            MIN_TRANSFER_GAS,
            1,
            0,
            Vec::new(),
            1_700_000_000,
        );
        assert!(missing_problem.validate_basic().is_err());

        let ok = Transaction::signed(
            &keypair,
            TxType::Escrow,
            [2u8; 32],
            MIN_ESCROW_AMOUNT,
            10,
            MIN_TRANSFER_GAS,
            1,
            0,
            vec![7u8; 32],
            1_700_000_000,
        );
        ok.validate_basic().expect("valid escrow");
    }

    #[test]
    fn self_transfer_rejected() {
        let keypair = generate_keypair();
        let tx = Transaction::signed(
            &keypair,
            TxType::Transfer,
            keypair.public.to_bytes(),
            100,
            10,
            MIN_TRANSFER_GAS,
            1,
            0,
            Vec::new(),
            1_700_000_000,
        );
        assert!(tx.validate_basic().is_err());
    }

    #[test]
    fn unknown_tx_type_fails_to_decode() {
        let keypair = generate_keypair();
        let tx = sample_tx(&keypair);
        let mut value = serde_json::to_value(&tx).expect("encode");
        value["tx_type"] = serde_json::json!(9);
        assert!(serde_json::from_value::<Transaction>(value).is_err());
    }

    #[test]
    fn wire_encoding_uses_snake_case_hex() {
        let keypair = generate_keypair();
        let tx = sample_tx(&keypair);
        let value = serde_json::to_value(&tx).expect("encode");
        assert_eq!(
            value["from"].as_str().map(str::len),
            Some(64),
            "addresses are hex-encoded"
        );
        assert_eq!(value["signature"].as_str().map(str::len), Some(128));
        assert!(value.get("gas_limit").is_some());

        let decoded: Transaction = serde_json::from_value(value).expect("decode");
        assert_eq!(decoded, tx);
    }
}
