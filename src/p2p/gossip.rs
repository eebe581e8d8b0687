use std::sync::Arc;

use libp2p::PeerId;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::GossipConfig;
use crate::errors::{ChainError, ChainResult};
use crate::mempool::{Mempool, MempoolError};
use crate::state::StateStore;
use crate::types::{
    Block, BlockMessage, BlockSyncRequest, BlockSyncResponse, CidMessage, Transaction,
    MAX_SYNC_BLOCKS,
};

use super::scoring::PeerScoring;
use super::swarm::{NetworkEvent, NetworkHandle};
use super::topics::GossipTopic;

/// Outbound queue depth for transaction and content-id broadcasts.
const BROADCAST_QUEUE_CAPACITY: usize = 1_000;

/// Depth of the decoded-block channel feeding the applier.
const BLOCK_PIPELINE_CAPACITY: usize = 64;

/// Transaction gossip: outgoing sends accumulate into batches drained by a
/// single worker; incoming transactions are verified, cross-checked against
/// state, and pushed into the mempool.
pub struct TxGossip {
    queue: mpsc::Sender<Transaction>,
}

impl TxGossip {
    pub fn spawn(
        network: NetworkHandle,
        mempool: Arc<Mempool>,
        state: Arc<StateStore>,
        scoring: Arc<PeerScoring>,
        config: &GossipConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (queue_tx, queue_rx) = mpsc::channel(BROADCAST_QUEUE_CAPACITY);
        let broadcaster = spawn_batch_broadcaster(
            network.clone(),
            GossipTopic::Transactions,
            queue_rx,
            config.tx_batch_interval(),
            config.tx_batch_max,
            shutdown.clone(),
        );
        let receiver = Self::spawn_receiver(network, mempool, state, scoring, shutdown);
        (Self { queue: queue_tx }, vec![broadcaster, receiver])
    }

    /// Queue a transaction for the next batch. A full queue drops the
    /// newcomer; the submitter may retry on a later event.
    pub fn broadcast(&self, tx: Transaction) {
        if let Err(err) = self.queue.try_send(tx) {
            warn!(?err, "transaction broadcast queue full, dropping");
        }
    }

    fn spawn_receiver(
        network: NetworkHandle,
        mempool: Arc<Mempool>,
        state: Arc<StateStore>,
        scoring: Arc<PeerScoring>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut events = network.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => match event {
                        Ok(NetworkEvent::Gossip { peer, topic: GossipTopic::Transactions, data }) => {
                            handle_incoming_tx(&mempool, &state, &scoring, peer, &data);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "transaction receiver lagged on gossip events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }
}

fn handle_incoming_tx(
    mempool: &Mempool,
    state: &StateStore,
    scoring: &PeerScoring,
    peer: PeerId,
    data: &[u8],
) {
    let tx: Transaction = match serde_json::from_slice(data) {
        Ok(tx) => tx,
        Err(err) => {
            debug!(peer = %peer, ?err, "undecodable transaction gossip");
            scoring.record_malformed(peer);
            return;
        }
    };
    if let Err(err) = tx.validate_basic() {
        debug!(peer = %peer, ?err, "invalid transaction gossip");
        scoring.record_invalid(peer);
        return;
    }
    // Cross-check against current sender state. A pending nonce above the
    // account's is fine; a stale one can never be included.
    match state.get_account(&tx.from) {
        Ok(Some(account)) => {
            let cost = match tx.total_cost() {
                Ok(cost) => cost,
                Err(_) => {
                    scoring.record_invalid(peer);
                    return;
                }
            };
            if tx.nonce < account.nonce || account.balance < cost {
                debug!(peer = %peer, "transaction not coverable by sender state");
                scoring.record_invalid(peer);
                return;
            }
        }
        Ok(None) => {
            debug!(peer = %peer, "transaction from unknown sender");
            scoring.record_invalid(peer);
            return;
        }
        Err(err) => {
            warn!(?err, "state lookup failed while validating gossip");
            return;
        }
    }
    match mempool.add(tx) {
        Ok(()) => scoring.record_valid(peer),
        Err(MempoolError::Duplicate) => {
            // Already known; neither credit nor penalty.
        }
        Err(MempoolError::Full) => {
            warn!("mempool full, dropping gossiped transaction");
        }
        Err(err) => {
            debug!(peer = %peer, ?err, "mempool rejected gossiped transaction");
            scoring.record_invalid(peer);
        }
    }
}

/// Block gossip: immediate publish with a bounded timeout, plus a decoded
/// pipeline toward the applier and a pull-based range sync client.
pub struct BlockGossip {
    network: NetworkHandle,
    config: GossipConfig,
}

impl BlockGossip {
    pub fn new(network: NetworkHandle, config: GossipConfig) -> Self {
        Self { network, config }
    }

    /// Publish a block right away. Blocks are rare and consensus-critical;
    /// they skip the batching that transactions get.
    pub async fn publish_block(&self, block: &Block) -> ChainResult<()> {
        let message = BlockMessage::from(block);
        let data = serde_json::to_vec(&message)?;
        match time::timeout(
            self.config.block_publish_timeout(),
            self.network.publish(GossipTopic::Blocks, data),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ChainError::Network("block publish timed out".into())),
        }
    }

    /// Ask one peer for a contiguous block range.
    pub async fn request_blocks(
        &self,
        peer: PeerId,
        from_block: u64,
        to_block: u64,
    ) -> ChainResult<BlockSyncResponse> {
        let request = BlockSyncRequest {
            from_block,
            to_block,
            max_blocks: MAX_SYNC_BLOCKS,
        };
        self.network.request_blocks(peer, request).await
    }

    /// Decode incoming block gossip onto a bounded channel; the applier
    /// consumes the other end in arrival order.
    pub fn spawn_receiver(
        network: &NetworkHandle,
        scoring: Arc<PeerScoring>,
        mut shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<(PeerId, Block)>, JoinHandle<()>) {
        let (pipeline_tx, pipeline_rx) = mpsc::channel(BLOCK_PIPELINE_CAPACITY);
        let mut events = network.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => match event {
                        Ok(NetworkEvent::Gossip { peer, topic: GossipTopic::Blocks, data }) => {
                            match serde_json::from_slice::<BlockMessage>(&data) {
                                Ok(message) => {
                                    info!(
                                        peer = %peer,
                                        block_number = message.block_number,
                                        tx_count = message.transactions.len(),
                                        "block received"
                                    );
                                    if pipeline_tx.try_send((peer, message.into_block())).is_err() {
                                        warn!("block pipeline full, dropping received block");
                                    }
                                }
                                Err(err) => {
                                    debug!(peer = %peer, ?err, "undecodable block gossip");
                                    scoring.record_malformed(peer);
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "block receiver lagged on gossip events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
        (pipeline_rx, task)
    }
}

/// Content-id gossip: same batching model as transactions, smaller batches.
/// Payloads referenced by the ids travel out of band.
pub struct CidGossip {
    queue: mpsc::Sender<CidMessage>,
}

impl CidGossip {
    pub fn spawn(
        network: NetworkHandle,
        scoring: Arc<PeerScoring>,
        config: &GossipConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, mpsc::Receiver<(PeerId, CidMessage)>, Vec<JoinHandle<()>>) {
        let (queue_tx, queue_rx) = mpsc::channel(BROADCAST_QUEUE_CAPACITY);
        let broadcaster = spawn_batch_broadcaster(
            network.clone(),
            GossipTopic::ContentIds,
            queue_rx,
            config.cid_batch_interval(),
            config.cid_batch_max,
            shutdown.clone(),
        );
        let (handler_tx, handler_rx) = mpsc::channel(BLOCK_PIPELINE_CAPACITY);
        let receiver = Self::spawn_receiver(&network, scoring, handler_tx, shutdown);
        (
            Self { queue: queue_tx },
            handler_rx,
            vec![broadcaster, receiver],
        )
    }

    pub fn announce(&self, message: CidMessage) {
        if let Err(err) = self.queue.try_send(message) {
            warn!(?err, "cid broadcast queue full, dropping");
        }
    }

    fn spawn_receiver(
        network: &NetworkHandle,
        scoring: Arc<PeerScoring>,
        handler: mpsc::Sender<(PeerId, CidMessage)>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut events = network.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => match event {
                        Ok(NetworkEvent::Gossip { peer, topic: GossipTopic::ContentIds, data }) => {
                            match serde_json::from_slice::<CidMessage>(&data) {
                                Ok(message) => {
                                    if message.cid.is_empty() {
                                        scoring.record_invalid(peer);
                                        continue;
                                    }
                                    scoring.record_valid(peer);
                                    if handler.try_send((peer, message)).is_err() {
                                        warn!("cid handler channel full, dropping announcement");
                                    }
                                }
                                Err(err) => {
                                    debug!(peer = %peer, ?err, "undecodable cid gossip");
                                    scoring.record_malformed(peer);
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "cid receiver lagged on gossip events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }
}

/// Shared drain worker: accumulate queued items, flush when the batch is
/// full or the interval tick fires, publish each item on `topic`.
fn spawn_batch_broadcaster<T: serde::Serialize + Send + 'static>(
    network: NetworkHandle,
    topic: GossipTopic,
    mut queue: mpsc::Receiver<T>,
    interval: std::time::Duration,
    batch_max: usize,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        let mut batch: Vec<T> = Vec::with_capacity(batch_max);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        // Drain what is queued, then stop.
                        flush_batch(&network, topic, &mut batch).await;
                        break;
                    }
                }
                item = queue.recv() => {
                    match item {
                        Some(item) => {
                            batch.push(item);
                            if batch.len() >= batch_max {
                                flush_batch(&network, topic, &mut batch).await;
                            }
                        }
                        None => {
                            flush_batch(&network, topic, &mut batch).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    flush_batch(&network, topic, &mut batch).await;
                }
            }
        }
    })
}

async fn flush_batch<T: serde::Serialize>(
    network: &NetworkHandle,
    topic: GossipTopic,
    batch: &mut Vec<T>,
) {
    if batch.is_empty() {
        return;
    }
    debug!(count = batch.len(), %topic, "broadcasting batch");
    for item in batch.drain(..) {
        let data = match serde_json::to_vec(&item) {
            Ok(data) => data,
            Err(err) => {
                warn!(?err, "failed to encode gossip item");
                continue;
            }
        };
        if let Err(err) = network.publish(topic, data).await {
            debug!(?err, %topic, "publish failed");
        }
    }
}
