use std::collections::BTreeMap;

use ed25519_dalek::Keypair;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CheckpointConfig;
use crate::errors::{ChainError, ChainResult};
use crate::types::{unix_timestamp, Block, Checkpoint};

/// Periodic signed state snapshots enabling fast-sync for new nodes.
pub struct CheckpointManager {
    config: CheckpointConfig,
    /// Snapshot signing key. Without one, checkpoints cannot be created
    /// locally (imported ones still verify against their embedded key).
    signer: Option<Keypair>,
    checkpoints: RwLock<BTreeMap<u64, Checkpoint>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub count: usize,
    pub interval: u64,
    pub max_checkpoints: usize,
    pub min_height: Option<u64>,
    pub max_height: Option<u64>,
}

impl CheckpointManager {
    pub fn new(config: CheckpointConfig, signer: Option<Keypair>) -> Self {
        Self {
            config,
            signer,
            checkpoints: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn interval(&self) -> u64 {
        self.config.interval
    }

    /// Snapshot an applied block if its height sits on the configured
    /// interval. Returns `None` off-interval or when no signing key is
    /// configured.
    pub fn create(&self, block: &Block, tx_count: u64) -> ChainResult<Option<Checkpoint>> {
        if self.config.interval == 0 || block.header.block_number % self.config.interval != 0 {
            return Ok(None);
        }
        let signer = match &self.signer {
            Some(signer) => signer,
            None => {
                debug!(
                    block_number = block.header.block_number,
                    "no validator key configured, skipping checkpoint"
                );
                return Ok(None);
            }
        };

        let mut checkpoint = Checkpoint {
            block_number: block.header.block_number,
            block_hash: block.block_hash,
            state_root: block.header.state_root,
            timestamp: unix_timestamp(),
            tx_count,
            validator_key: [0u8; 32],
            validator_sig: [0u8; 64],
        };
        checkpoint.sign(signer);

        let mut checkpoints = self.checkpoints.write();
        checkpoints.insert(checkpoint.block_number, checkpoint.clone());
        Self::prune(&mut checkpoints, self.config.max_checkpoints);
        info!(
            block_number = checkpoint.block_number,
            block_hash = %hex::encode(&checkpoint.block_hash[..8]),
            tx_count,
            "checkpoint created"
        );
        Ok(Some(checkpoint))
    }

    fn prune(checkpoints: &mut BTreeMap<u64, Checkpoint>, max: usize) {
        while checkpoints.len() > max {
            if let Some((&oldest, _)) = checkpoints.iter().next() {
                checkpoints.remove(&oldest);
                debug!(block_number = oldest, "pruned old checkpoint");
            }
        }
    }

    pub fn get(&self, block_number: u64) -> Option<Checkpoint> {
        self.checkpoints.read().get(&block_number).cloned()
    }

    pub fn latest(&self) -> Option<Checkpoint> {
        self.checkpoints
            .read()
            .values()
            .next_back()
            .cloned()
    }

    pub fn at_or_before(&self, block_number: u64) -> Option<Checkpoint> {
        self.checkpoints
            .read()
            .range(..=block_number)
            .next_back()
            .map(|(_, checkpoint)| checkpoint.clone())
    }

    /// All retained checkpoints, ascending by height.
    pub fn list(&self) -> Vec<Checkpoint> {
        self.checkpoints.read().values().cloned().collect()
    }

    pub fn export(&self, block_number: u64) -> ChainResult<Vec<u8>> {
        let checkpoint = self.get(block_number).ok_or_else(|| {
            ChainError::Config(format!("checkpoint not found: {block_number}"))
        })?;
        Ok(serde_json::to_vec(&checkpoint)?)
    }

    /// Import a checkpoint received from an operator or a peer. Unsigned or
    /// malformed checkpoints are rejected before they enter the table.
    pub fn import(&self, data: &[u8]) -> ChainResult<Checkpoint> {
        let checkpoint: Checkpoint = serde_json::from_slice(data)?;
        checkpoint.verify()?;
        let mut checkpoints = self.checkpoints.write();
        checkpoints.insert(checkpoint.block_number, checkpoint.clone());
        Self::prune(&mut checkpoints, self.config.max_checkpoints);
        info!(
            block_number = checkpoint.block_number,
            block_hash = %hex::encode(&checkpoint.block_hash[..8]),
            "checkpoint imported"
        );
        Ok(checkpoint)
    }

    pub fn verify(&self, checkpoint: &Checkpoint) -> bool {
        checkpoint.verify().is_ok()
    }

    /// Pick the starting point for syncing toward `target_height`. Returns
    /// the chosen checkpoint (if any survives verification) and the first
    /// block number to fetch after it.
    pub fn sync_from(&self, target_height: u64) -> ChainResult<(Option<Checkpoint>, u64)> {
        let checkpoint = match self.at_or_before(target_height) {
            Some(checkpoint) => checkpoint,
            None => return Ok((None, 1)),
        };
        checkpoint.verify().map_err(|err| {
            ChainError::Consensus(format!(
                "invalid checkpoint at height {}: {err}",
                checkpoint.block_number
            ))
        })?;
        info!(
            checkpoint_height = checkpoint.block_number,
            target_height, "fast sync from checkpoint"
        );
        let next = checkpoint.block_number + 1;
        Ok((Some(checkpoint), next))
    }

    pub fn stats(&self) -> CheckpointStats {
        let checkpoints = self.checkpoints.read();
        CheckpointStats {
            count: checkpoints.len(),
            interval: self.config.interval,
            max_checkpoints: self.config.max_checkpoints,
            min_height: checkpoints.keys().next().copied(),
            max_height: checkpoints.keys().next_back().copied(),
        }
    }

    pub fn clear(&self) {
        self.checkpoints.write().clear();
        info!("all checkpoints cleared");
    }
}
