//! Whole-node boot, production, and shutdown over a real (listen-only)
//! network stack.

use std::time::Duration;

use ed25519_dalek::{Keypair, PublicKey, SecretKey};
use libp2p::PeerId;
use tempfile::tempdir;
use tokio::time::sleep;

use coinjecture_node::config::{GenesisAccount, NodeConfig};
use coinjecture_node::crypto::save_keypair;
use coinjecture_node::node::Node;
use coinjecture_node::types::{unix_timestamp, Transaction, TxType, MIN_TRANSFER_GAS};

fn keypair_from_seed(seed: u8) -> Keypair {
    let secret = SecretKey::from_bytes(&[seed; 32]).expect("secret");
    let public = PublicKey::from(&secret);
    Keypair { secret, public }
}

fn sample_config(base: &std::path::Path) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.data_dir = base.join("data");
    config.p2p_key_path = base.join("keys/p2p.toml");
    config.validator_key_path = Some(base.join("keys/validator.toml"));
    config.listen_port = 0;
    config.block_time_ms = 200;
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn node_produces_blocks_from_submitted_transactions() {
    let dir = tempdir().expect("temp dir");
    let mut config = sample_config(dir.path());

    // Fund the submitter at genesis.
    let alice = keypair_from_seed(7);
    config.genesis.accounts.push(GenesisAccount {
        address: hex::encode(alice.public.to_bytes()),
        balance: 10_000,
    });

    let node = Node::new(config).expect("node init");
    let running = node.start().await.expect("node start");
    let handle = running.handle();

    let tx = Transaction::signed(
        &alice,
        TxType::Transfer,
        [9u8; 32],
        100,
        10,
        MIN_TRANSFER_GAS,
        1,
        0,
        Vec::new(),
        unix_timestamp(),
    );
    let tx_hash = handle.submit_transaction(tx).expect("submit");
    assert_eq!(handle.mempool_size(), 1);

    // Give the producer a few rounds to seal the transfer.
    let mut applied = false;
    for _ in 0..50 {
        sleep(Duration::from_millis(100)).await;
        let account = handle
            .get_account(&alice.public.to_bytes())
            .expect("query")
            .expect("exists");
        if account.nonce == 1 {
            applied = true;
            break;
        }
    }
    assert!(applied, "transaction was not sealed in time");

    let alice_account = handle
        .get_account(&alice.public.to_bytes())
        .expect("query")
        .expect("exists");
    assert_eq!(alice_account.balance, 10_000 - 110);

    let chain = handle.chain_state().expect("chain state");
    assert!(chain.head_block_number >= 1);
    assert_eq!(chain.total_transactions, 1);

    // The sealed transfer is archived exactly once and gone from the pool.
    let latest = handle.get_latest_block().expect("query");
    assert!(latest.is_some());
    assert_eq!(handle.mempool_size(), 0);
    let mut seen = 0;
    for block in handle
        .get_block_range(1, chain.head_block_number)
        .expect("range")
    {
        seen += block
            .transactions
            .iter()
            .filter(|tx| tx.hash() == tx_hash)
            .count();
    }
    assert_eq!(seen, 1);

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn observer_node_boots_without_validator_key() {
    let dir = tempdir().expect("temp dir");
    let mut config = sample_config(dir.path());
    config.validator_key_path = None;

    let node = Node::new(config).expect("node init");
    let running = node.start().await.expect("node start");
    let handle = running.handle();

    sleep(Duration::from_millis(500)).await;
    // Observers never produce.
    assert_eq!(handle.chain_state().expect("chain state").total_blocks, 0);
    assert!(handle.validator_address().is_none());

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_invalid_messages_ban_until_decay() {
    let dir = tempdir().expect("temp dir");
    let mut config = sample_config(dir.path());
    config.validator_key_path = None;

    let node = Node::new(config).expect("node init");
    let running = node.start().await.expect("node start");
    let handle = running.handle();

    let rogue = PeerId::random();
    for _ in 0..10 {
        handle.scoring().record_invalid(rogue);
    }
    assert_eq!(handle.scoring().score(&rogue), 0);
    assert!(handle.scoring().is_banned(&rogue));

    // The ban lifts only once decay carries the score back over the
    // threshold.
    handle.scoring().apply_decay();
    assert_eq!(handle.scoring().score(&rogue), 1);
    assert!(!handle.scoring().is_banned(&rogue));

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chain_survives_a_restart() {
    let dir = tempdir().expect("temp dir");
    let mut config = sample_config(dir.path());
    let alice = keypair_from_seed(7);
    config.genesis.accounts.push(GenesisAccount {
        address: hex::encode(alice.public.to_bytes()),
        balance: 10_000,
    });
    // Pin the validator identity so the restart reuses it.
    save_keypair(
        config.validator_key_path.as_ref().expect("path"),
        &keypair_from_seed(8),
    )
    .expect("persist validator key");

    let head_before = {
        let node = Node::new(config.clone()).expect("node init");
        let running = node.start().await.expect("node start");
        let handle = running.handle();
        let mut head = 0;
        for _ in 0..50 {
            sleep(Duration::from_millis(100)).await;
            head = handle.chain_state().expect("chain state").head_block_number;
            if head >= 2 {
                break;
            }
        }
        running.shutdown().await;
        head
    };
    assert!(head_before >= 2, "producer made no progress");

    let node = Node::new(config).expect("node reinit");
    let running = node.start().await.expect("node restart");
    let handle = running.handle();
    let chain = handle.chain_state().expect("chain state");
    assert!(chain.head_block_number >= head_before);
    let head_block = handle
        .get_block_by_number(head_before)
        .expect("query")
        .expect("archived across restart");
    assert_eq!(head_block.header.block_number, head_before);
    running.shutdown().await;
}
