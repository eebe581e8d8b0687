//! Fast-sync behavior of the checkpoint subsystem.

use ed25519_dalek::{Keypair, PublicKey, SecretKey};

use coinjecture_node::checkpoint::CheckpointManager;
use coinjecture_node::config::CheckpointConfig;
use coinjecture_node::types::{Block, BlockHeader, Checkpoint};

fn keypair_from_seed(seed: u8) -> Keypair {
    let secret = SecretKey::from_bytes(&[seed; 32]).expect("secret");
    let public = PublicKey::from(&secret);
    Keypair { secret, public }
}

fn block_at(number: u64) -> Block {
    Block::new(
        BlockHeader {
            block_number: number,
            parent_hash: [1u8; 32],
            state_root: [2u8; 32],
            tx_root: [0u8; 32],
            timestamp: 1_700_000_000 + number as i64,
            validator: [3u8; 32],
            difficulty: 1,
            nonce: 0,
            gas_limit: 30_000_000,
            gas_used: 0,
            extra_data: [0u8; 32],
        },
        Vec::new(),
    )
}

#[test]
fn fresh_node_syncs_from_the_block_100_checkpoint() {
    let manager = CheckpointManager::new(
        CheckpointConfig {
            interval: 100,
            max_checkpoints: 10,
        },
        Some(keypair_from_seed(7)),
    );

    let block_100 = block_at(100);
    let checkpoint = manager
        .create(&block_100, 480)
        .expect("create")
        .expect("on interval");
    assert_eq!(checkpoint.block_number, 100);
    assert_eq!(checkpoint.block_hash, block_100.block_hash);
    assert_eq!(checkpoint.state_root, block_100.header.state_root);

    // A fresh node targeting height 250 starts from the checkpoint and
    // fetches block 101 next.
    let (selected, next) = manager.sync_from(250).expect("sync");
    let selected = selected.expect("checkpoint available");
    assert_eq!(selected.block_number, 100);
    assert_eq!(next, 101);
}

#[test]
fn checkpoint_travels_between_nodes_as_signed_json() {
    let producer = CheckpointManager::new(
        CheckpointConfig {
            interval: 100,
            max_checkpoints: 10,
        },
        Some(keypair_from_seed(7)),
    );
    producer.create(&block_at(100), 480).expect("create");
    let exported = producer.export(100).expect("export");

    // The consumer has no signing key of its own; it verifies against the
    // key embedded in the checkpoint.
    let consumer = CheckpointManager::new(
        CheckpointConfig {
            interval: 100,
            max_checkpoints: 10,
        },
        None,
    );
    let imported = consumer.import(&exported).expect("import");
    assert!(consumer.verify(&imported));
    assert_eq!(consumer.latest().map(|c| c.block_number), Some(100));
}

#[test]
fn tampered_or_unsigned_checkpoints_never_enter_the_table() {
    let producer = CheckpointManager::new(
        CheckpointConfig {
            interval: 100,
            max_checkpoints: 10,
        },
        Some(keypair_from_seed(7)),
    );
    producer.create(&block_at(100), 480).expect("create");
    let exported = producer.export(100).expect("export");

    let consumer = CheckpointManager::new(
        CheckpointConfig {
            interval: 100,
            max_checkpoints: 10,
        },
        None,
    );

    // Tamper with the advertised state root.
    let mut tampered: Checkpoint = serde_json::from_slice(&exported).expect("decode");
    tampered.state_root = [9u8; 32];
    let tampered_bytes = serde_json::to_vec(&tampered).expect("encode");
    assert!(consumer.import(&tampered_bytes).is_err());

    // Strip the signature entirely.
    let mut unsigned: Checkpoint = serde_json::from_slice(&exported).expect("decode");
    unsigned.validator_sig = [0u8; 64];
    let unsigned_bytes = serde_json::to_vec(&unsigned).expect("encode");
    assert!(consumer.import(&unsigned_bytes).is_err());

    assert!(consumer.latest().is_none());
}

#[test]
fn retention_is_fifo_over_heights() {
    let manager = CheckpointManager::new(
        CheckpointConfig {
            interval: 10,
            max_checkpoints: 3,
        },
        Some(keypair_from_seed(7)),
    );
    for height in [10, 20, 30, 40, 50] {
        manager.create(&block_at(height), height).expect("create");
    }

    let retained: Vec<u64> = manager.list().iter().map(|c| c.block_number).collect();
    assert_eq!(retained, vec![30, 40, 50]);

    let stats = manager.stats();
    assert_eq!(stats.count, 3);
    assert_eq!(stats.min_height, Some(30));
    assert_eq!(stats.max_height, Some(50));
}
