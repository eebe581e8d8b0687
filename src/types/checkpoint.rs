use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};

use crate::crypto::{sign_message, verify_raw};
use crate::errors::{ChainError, ChainResult};

use super::hex_serde;

/// Signed state snapshot used as a trusted fast-sync starting point.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    pub block_number: u64,
    #[serde(with = "hex_serde::hash")]
    pub block_hash: [u8; 32],
    #[serde(with = "hex_serde::hash")]
    pub state_root: [u8; 32],
    pub timestamp: i64,
    pub tx_count: u64,
    #[serde(with = "hex_serde::hash")]
    pub validator_key: [u8; 32],
    #[serde(with = "hex_serde::signature")]
    pub validator_sig: [u8; 64],
}

impl Checkpoint {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(88);
        data.extend_from_slice(&self.block_number.to_le_bytes());
        data.extend_from_slice(&self.block_hash);
        data.extend_from_slice(&self.state_root);
        data.extend_from_slice(&(self.timestamp as u64).to_le_bytes());
        data.extend_from_slice(&self.tx_count.to_le_bytes());
        data
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        self.validator_key = keypair.public.to_bytes();
        self.validator_sig = sign_message(keypair, &self.signing_bytes()).to_bytes();
    }

    /// A checkpoint is acceptable only with non-zero height, timestamp, and
    /// block hash, and a valid validator signature. Unsigned checkpoints
    /// are rejected.
    pub fn verify(&self) -> ChainResult<()> {
        if self.block_number == 0 {
            return Err(ChainError::Consensus("checkpoint at height zero".into()));
        }
        if self.timestamp == 0 {
            return Err(ChainError::Consensus("checkpoint without timestamp".into()));
        }
        if self.block_hash == [0u8; 32] {
            return Err(ChainError::Consensus(
                "checkpoint with zero block hash".into(),
            ));
        }
        if self.validator_key == [0u8; 32] || self.validator_sig == [0u8; 64] {
            return Err(ChainError::Crypto("checkpoint is unsigned".into()));
        }
        verify_raw(
            &self.validator_key,
            &self.signing_bytes(),
            &self.validator_sig,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    fn sample_checkpoint() -> Checkpoint {
        Checkpoint {
            block_number: 100,
            block_hash: [1u8; 32],
            state_root: [2u8; 32],
            timestamp: 1_700_000_000,
            tx_count: 42,
            validator_key: [0u8; 32],
            validator_sig: [0u8; 64],
        }
    }

    #[test]
    fn signed_checkpoint_verifies() {
        let keypair = generate_keypair();
        let mut checkpoint = sample_checkpoint();
        checkpoint.sign(&keypair);
        checkpoint.verify().expect("valid checkpoint");
    }

    #[test]
    fn unsigned_checkpoint_rejected() {
        let checkpoint = sample_checkpoint();
        assert!(matches!(
            checkpoint.verify(),
            Err(ChainError::Crypto(_))
        ));
    }

    #[test]
    fn zero_fields_rejected() {
        let keypair = generate_keypair();
        let mut at_genesis = sample_checkpoint();
        at_genesis.block_number = 0;
        at_genesis.sign(&keypair);
        assert!(at_genesis.verify().is_err());

        let mut no_hash = sample_checkpoint();
        no_hash.block_hash = [0u8; 32];
        no_hash.sign(&keypair);
        assert!(no_hash.verify().is_err());
    }

    #[test]
    fn tampered_checkpoint_fails_verification() {
        let keypair = generate_keypair();
        let mut checkpoint = sample_checkpoint();
        checkpoint.sign(&keypair);
        checkpoint.tx_count += 1;
        assert!(checkpoint.verify().is_err());
    }

    #[test]
    fn json_roundtrip_preserves_signature() {
        let keypair = generate_keypair();
        let mut checkpoint = sample_checkpoint();
        checkpoint.sign(&keypair);

        let encoded = serde_json::to_vec(&checkpoint).expect("encode");
        let decoded: Checkpoint = serde_json::from_slice(&encoded).expect("decode");
        assert_eq!(decoded, checkpoint);
        decoded.verify().expect("still valid");
    }
}
