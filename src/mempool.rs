use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use crate::config::MempoolConfig;
use crate::errors::ChainError;
use crate::types::{unix_timestamp, Transaction};

/// Seconds of age that halve a transaction's effective priority.
const AGE_DAMPING_SECS: f64 = 600.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already pooled")]
    Duplicate,
    #[error("priority below admission threshold")]
    BelowThreshold,
    #[error("mempool full")]
    Full,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid transaction: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug)]
struct PoolEntry {
    tx: Transaction,
    added_at: i64,
    fee_per_gas: f64,
}

impl PoolEntry {
    fn new(tx: Transaction, added_at: i64) -> Self {
        let fee_per_gas = tx.fee as f64 / tx.gas_limit.max(1) as f64;
        Self {
            tx,
            added_at,
            fee_per_gas,
        }
    }

    /// Monotone in fee-per-gas, decaying with age.
    fn priority(&self, now: i64) -> f64 {
        let age = (now - self.added_at).max(0) as f64;
        self.fee_per_gas / (1.0 + age / AGE_DAMPING_SECS)
    }
}

fn entry_order(a: &PoolEntry, b: &PoolEntry, now: i64) -> Ordering {
    b.priority(now)
        .partial_cmp(&a.priority(now))
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.tx.from.cmp(&b.tx.from))
        .then_with(|| a.tx.nonce.cmp(&b.tx.nonce))
        .then_with(|| a.tx.hash().cmp(&b.tx.hash()))
}

/// Bounded pool of signature-verified pending transactions. State-level
/// validation (nonce, balance) waits for block-build time so that pending
/// nonces from one sender can queue up.
pub struct Mempool {
    config: MempoolConfig,
    entries: Mutex<HashMap<[u8; 32], PoolEntry>>,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, tx: Transaction) -> Result<(), MempoolError> {
        tx.validate_basic().map_err(|err| match err {
            ChainError::Crypto(_) => MempoolError::InvalidSignature,
            other => MempoolError::Invalid(other.to_string()),
        })?;

        let now = unix_timestamp();
        let entry = PoolEntry::new(tx, now);
        if entry.fee_per_gas < self.config.priority_threshold {
            return Err(MempoolError::BelowThreshold);
        }

        let hash = entry.tx.hash();
        let mut entries = self.entries.lock();
        if entries.contains_key(&hash) {
            return Err(MempoolError::Duplicate);
        }
        if entries.len() >= self.config.max_size as usize {
            // Evict the weakest entry only if the newcomer outranks it;
            // otherwise push the back-pressure onto the submitter.
            let weakest = entries
                .iter()
                .min_by(|(_, a), (_, b)| entry_order(b, a, now))
                .map(|(hash, entry)| (*hash, entry.priority(now)));
            match weakest {
                Some((weakest_hash, weakest_priority))
                    if entry.priority(now) > weakest_priority =>
                {
                    entries.remove(&weakest_hash);
                    debug!(evicted = %hex::encode(weakest_hash), "evicted lowest-priority transaction");
                }
                _ => return Err(MempoolError::Full),
            }
        }
        entries.insert(hash, entry);
        Ok(())
    }

    pub fn remove(&self, hash: &[u8; 32]) -> Option<Transaction> {
        self.entries.lock().remove(hash).map(|entry| entry.tx)
    }

    pub fn contains(&self, hash: &[u8; 32]) -> bool {
        self.entries.lock().contains_key(hash)
    }

    pub fn size(&self) -> u32 {
        self.entries.lock().len() as u32
    }

    /// Remove and return up to `n` transactions, best priority first. Ties
    /// break on ascending (sender, nonce), then hash.
    pub fn pop_best(&self, n: usize) -> Vec<Transaction> {
        let now = unix_timestamp();
        let mut entries = self.entries.lock();
        let mut ordered: Vec<PoolEntry> = entries.values().cloned().collect();
        ordered.sort_by(|a, b| entry_order(a, b, now));
        ordered.truncate(n);
        ordered
            .into_iter()
            .map(|entry| {
                entries.remove(&entry.tx.hash());
                entry.tx
            })
            .collect()
    }

    /// Put back transactions the builder popped but did not include,
    /// keeping their original age out of the admission pipeline.
    pub(crate) fn restore(&self, transactions: Vec<Transaction>) {
        let now = unix_timestamp();
        let mut entries = self.entries.lock();
        for tx in transactions {
            let added_at = now.min(tx.timestamp);
            entries
                .entry(tx.hash())
                .or_insert_with(|| PoolEntry::new(tx, added_at));
        }
    }

    /// Drop transactions older than the configured age. Returns how many
    /// were removed.
    pub fn cleanup(&self) -> usize {
        let now = unix_timestamp();
        let cutoff = self.config.max_tx_age().as_secs() as i64;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now - entry.added_at <= cutoff);
        before - entries.len()
    }

    /// Background janitor: ages out stale transactions until shutdown.
    pub fn spawn_janitor(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let interval = pool.config.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("mempool janitor stopping");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let dropped = pool.cleanup();
                        if dropped > 0 {
                            warn!(dropped, "aged out stale transactions");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;
    use crate::types::{TxType, MIN_TRANSFER_GAS};
    use ed25519_dalek::Keypair;

    fn pool(max_size: u32) -> Mempool {
        Mempool::new(MempoolConfig {
            max_size,
            max_tx_age_secs: 3_600,
            cleanup_interval_secs: 60,
            priority_threshold: 0.0,
        })
    }

    fn transfer(keypair: &Keypair, fee: u64, nonce: u64) -> Transaction {
        Transaction::signed(
            keypair,
            TxType::Transfer,
            [2u8; 32],
            100,
            fee,
            MIN_TRANSFER_GAS,
            1,
            nonce,
            Vec::new(),
            unix_timestamp(),
        )
    }

    #[test]
    fn duplicates_are_rejected() {
        let pool = pool(10);
        let keypair = generate_keypair();
        let tx = transfer(&keypair, 10, 0);
        pool.add(tx.clone()).expect("first admission");
        assert_eq!(pool.add(tx), Err(MempoolError::Duplicate));
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn bad_signature_is_rejected() {
        let pool = pool(10);
        let keypair = generate_keypair();
        let mut tx = transfer(&keypair, 10, 0);
        tx.amount += 1;
        assert_eq!(pool.add(tx), Err(MempoolError::InvalidSignature));
    }

    #[test]
    fn below_threshold_is_rejected() {
        let mut config = MempoolConfig::default();
        config.priority_threshold = 1.0;
        let pool = Mempool::new(config);
        let keypair = generate_keypair();
        // fee 10 over 21000 gas is far below a 1.0 fee-per-gas floor.
        assert_eq!(
            pool.add(transfer(&keypair, 10, 0)),
            Err(MempoolError::BelowThreshold)
        );
    }

    #[test]
    fn pop_best_orders_by_fee_per_gas() {
        let pool = pool(10);
        let keypair = generate_keypair();
        let low = transfer(&keypair, 10, 0);
        let high = transfer(&keypair, 5_000, 1);
        let mid = transfer(&keypair, 500, 2);
        pool.add(low.clone()).unwrap();
        pool.add(high.clone()).unwrap();
        pool.add(mid.clone()).unwrap();

        let best = pool.pop_best(2);
        assert_eq!(best.len(), 2);
        assert_eq!(best[0].hash(), high.hash());
        assert_eq!(best[1].hash(), mid.hash());
        // pop removes; the rest stays behind.
        assert_eq!(pool.size(), 1);
        assert!(pool.contains(&low.hash()));
    }

    #[test]
    fn equal_priority_breaks_ties_by_sender_nonce() {
        let pool = pool(10);
        let keypair = generate_keypair();
        let first = transfer(&keypair, 100, 0);
        let second = transfer(&keypair, 100, 1);
        pool.add(second.clone()).unwrap();
        pool.add(first.clone()).unwrap();

        let best = pool.pop_best(10);
        assert_eq!(best[0].nonce, 0);
        assert_eq!(best[1].nonce, 1);
    }

    #[test]
    fn full_pool_evicts_only_weaker_entries() {
        let pool = pool(2);
        let keypair = generate_keypair();
        let weak = transfer(&keypair, 10, 0);
        let mid = transfer(&keypair, 500, 1);
        pool.add(weak.clone()).unwrap();
        pool.add(mid).unwrap();

        // A stronger newcomer displaces the weakest entry.
        let strong = transfer(&keypair, 5_000, 2);
        pool.add(strong).expect("evicting admission");
        assert_eq!(pool.size(), 2);
        assert!(!pool.contains(&weak.hash()));

        // A weaker newcomer is refused outright.
        let dust = transfer(&keypair, 1, 3);
        assert_eq!(pool.add(dust), Err(MempoolError::Full));
    }

    #[test]
    fn cleanup_drops_aged_entries() {
        let config = MempoolConfig {
            max_size: 10,
            max_tx_age_secs: 100,
            cleanup_interval_secs: 60,
            priority_threshold: 0.0,
        };
        let pool = Mempool::new(config);
        let keypair = generate_keypair();
        pool.add(transfer(&keypair, 10, 0)).unwrap();

        // Backdate the entry beyond the age limit.
        {
            let mut entries = pool.entries.lock();
            for entry in entries.values_mut() {
                entry.added_at -= 1_000;
            }
        }
        assert_eq!(pool.cleanup(), 1);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn restore_requeues_popped_transactions() {
        let pool = pool(10);
        let keypair = generate_keypair();
        let tx = transfer(&keypair, 10, 0);
        pool.add(tx.clone()).unwrap();

        let popped = pool.pop_best(1);
        assert_eq!(pool.size(), 0);
        pool.restore(popped);
        assert!(pool.contains(&tx.hash()));
    }
}
