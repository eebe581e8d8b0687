use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::builder::BlockBuilder;
use crate::checkpoint::{CheckpointManager, CheckpointStats};
use crate::config::NodeConfig;
use crate::crypto::load_or_generate_keypair;
use crate::errors::{ChainError, ChainResult};
use crate::mempool::Mempool;
use crate::p2p::{
    BlockGossip, CidGossip, NetworkHandle, NetworkService, NodeIdentity, PeerScoring, TxGossip,
};
use crate::state::StateStore;
use crate::types::{
    Account, Address, Block, BlockSource, ChainState, Checkpoint, CidMessage, Transaction,
};

/// How many out-of-order blocks we hold while sync fills the gap.
const PENDING_BLOCK_CAPACITY: usize = 32;

/// Per-task drain allowance during shutdown.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback invoked for every content-id announcement received from the
/// network. The payload itself is retrieved out of band.
pub type CidHandler = Box<dyn Fn(PeerId, CidMessage) + Send + Sync>;

/// Boots the components in dependency order, wires their channels, and
/// tears everything down in reverse on shutdown.
pub struct Node {
    config: NodeConfig,
    state: Arc<StateStore>,
    mempool: Arc<Mempool>,
    builder: Arc<BlockBuilder>,
    checkpoints: Arc<CheckpointManager>,
    scoring: Arc<PeerScoring>,
    identity: NodeIdentity,
    validator_address: Option<Address>,
    cid_handler: Option<CidHandler>,
}

impl Node {
    pub fn new(config: NodeConfig) -> ChainResult<Self> {
        config.ensure_directories()?;

        let state = Arc::new(StateStore::open(&config.data_dir.join("db"))?);
        for entry in &config.genesis.accounts {
            let address = entry.address_bytes()?;
            if state.get_account(&address)?.is_none() {
                state.create_account(address, entry.balance)?;
                info!(address = %hex::encode(address), balance = entry.balance, "seeded genesis account");
            }
        }

        state.set_block_time(config.block_time_ms / 1_000)?;

        let mempool = Arc::new(Mempool::new(config.mempool.clone()));
        let builder = Arc::new(BlockBuilder::new(
            Arc::clone(&state),
            Arc::clone(&mempool),
            config.block.clone(),
        ));

        let (validator_address, signer) = match &config.validator_key_path {
            Some(path) => {
                let keypair = load_or_generate_keypair(path)?;
                (Some(keypair.public.to_bytes()), Some(keypair))
            }
            None => (None, None),
        };
        let checkpoints = Arc::new(CheckpointManager::new(config.checkpoint.clone(), signer));

        let scoring = Arc::new(PeerScoring::new(config.peer_scoring.clone()));
        let identity = NodeIdentity::load_or_generate(&config.p2p_key_path)?;

        Ok(Self {
            config,
            state,
            mempool,
            builder,
            checkpoints,
            scoring,
            identity,
            validator_address,
            cid_handler: None,
        })
    }

    /// Install a consumer for incoming content-id announcements. Without
    /// one, announcements are logged and dropped.
    pub fn with_cid_handler(mut self, handler: CidHandler) -> Self {
        self.cid_handler = Some(handler);
        self
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Spawn the network service and every background worker. Returns once
    /// everything is running.
    pub async fn start(self) -> ChainResult<RunningNode> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let (network, network_task) = NetworkService::spawn(
            &self.identity,
            self.config.listen_port,
            &self.config.bootstrap_peers,
            self.config.max_peers,
            Arc::clone(&self.scoring),
            Arc::clone(&self.state) as Arc<dyn BlockSource>,
            shutdown_rx.clone(),
        )?;
        // Recorded in boot order; shutdown pops in reverse, so the swarm
        // task outlives every worker that still wants to flush messages.
        tasks.push(("network-service", network_task));

        tasks.push(("mempool-janitor", self.mempool.spawn_janitor(shutdown_rx.clone())));
        tasks.push((
            "peer-score-maintenance",
            self.scoring.spawn_maintenance(shutdown_rx.clone()),
        ));
        tasks.push(("peer-score-decay", self.scoring.spawn_decay(shutdown_rx.clone())));

        let (tx_gossip, tx_tasks) = TxGossip::spawn(
            network.clone(),
            Arc::clone(&self.mempool),
            Arc::clone(&self.state),
            Arc::clone(&self.scoring),
            &self.config.gossip,
            shutdown_rx.clone(),
        );
        for task in tx_tasks {
            tasks.push(("tx-gossip", task));
        }

        let (cid_gossip, cid_rx, cid_tasks) = CidGossip::spawn(
            network.clone(),
            Arc::clone(&self.scoring),
            &self.config.gossip,
            shutdown_rx.clone(),
        );
        for task in cid_tasks {
            tasks.push(("cid-gossip", task));
        }
        tasks.push((
            "cid-consumer",
            spawn_cid_consumer(cid_rx, self.cid_handler, shutdown_rx.clone()),
        ));

        let block_gossip = Arc::new(BlockGossip::new(network.clone(), self.config.gossip.clone()));
        let (block_rx, block_receiver_task) = BlockGossip::spawn_receiver(
            &network,
            Arc::clone(&self.scoring),
            shutdown_rx.clone(),
        );
        tasks.push(("block-receiver", block_receiver_task));
        tasks.push((
            "block-applier",
            spawn_block_applier(
                Arc::clone(&self.builder),
                Arc::clone(&self.state),
                Arc::clone(&self.checkpoints),
                Arc::clone(&self.scoring),
                Arc::clone(&block_gossip),
                block_rx,
                shutdown_rx.clone(),
            ),
        ));

        if let Some(validator) = self.validator_address {
            tasks.push((
                "block-producer",
                spawn_block_producer(
                    Arc::clone(&self.builder),
                    Arc::clone(&self.state),
                    Arc::clone(&self.checkpoints),
                    Arc::clone(&block_gossip),
                    validator,
                    self.config.block_interval(),
                    shutdown_rx.clone(),
                ),
            ));
        } else {
            info!("no validator key configured, running as observer");
        }

        let handle = NodeHandle {
            inner: Arc::new(NodeShared {
                state: Arc::clone(&self.state),
                mempool: Arc::clone(&self.mempool),
                checkpoints: Arc::clone(&self.checkpoints),
                scoring: Arc::clone(&self.scoring),
                network,
                tx_gossip,
                cid_gossip,
                validator_address: self.validator_address,
            }),
        };

        info!(peer_id = %self.identity.peer_id(), "node started");
        Ok(RunningNode {
            handle,
            shutdown: shutdown_tx,
            tasks,
        })
    }
}

/// A fully wired node. Dropping it without calling [`RunningNode::shutdown`]
/// aborts the background tasks without draining.
pub struct RunningNode {
    handle: NodeHandle,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl RunningNode {
    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    /// Signal every task and wait for them in reverse boot order, bounding
    /// each drain.
    pub async fn shutdown(mut self) {
        info!("shutting down");
        let _ = self.shutdown.send(true);
        while let Some((name, task)) = self.tasks.pop() {
            match time::timeout(SHUTDOWN_DRAIN_TIMEOUT, task).await {
                Ok(Ok(())) => debug!(task = name, "task stopped"),
                Ok(Err(err)) => warn!(task = name, ?err, "task panicked during shutdown"),
                Err(_) => warn!(task = name, "task did not drain in time, abandoning"),
            }
        }
        info!("shutdown complete");
    }
}

struct NodeShared {
    state: Arc<StateStore>,
    mempool: Arc<Mempool>,
    checkpoints: Arc<CheckpointManager>,
    scoring: Arc<PeerScoring>,
    network: NetworkHandle,
    tx_gossip: TxGossip,
    cid_gossip: CidGossip,
    validator_address: Option<Address>,
}

/// Clonable front the local API surface talks to. Read paths never take
/// the state-store writer gate.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeShared>,
}

impl NodeHandle {
    /// Admit a locally submitted transaction and queue it for gossip.
    pub fn submit_transaction(&self, tx: Transaction) -> ChainResult<[u8; 32]> {
        let hash = tx.hash();
        self.inner
            .mempool
            .add(tx.clone())
            .map_err(|err| ChainError::Transaction(err.to_string()))?;
        self.inner.tx_gossip.broadcast(tx);
        Ok(hash)
    }

    /// Announce an off-chain artifact by content id.
    pub fn announce_cid(&self, message: CidMessage) {
        self.inner.cid_gossip.announce(message);
    }

    pub fn get_account(&self, address: &Address) -> ChainResult<Option<Account>> {
        self.inner.state.get_account(address)
    }

    pub fn get_block_by_number(&self, number: u64) -> ChainResult<Option<Block>> {
        self.inner.state.get_block_by_number(number)
    }

    pub fn get_block_by_hash(&self, hash: &[u8; 32]) -> ChainResult<Option<Block>> {
        self.inner.state.get_block_by_hash(hash)
    }

    pub fn get_latest_block(&self) -> ChainResult<Option<Block>> {
        self.inner.state.latest_block()
    }

    pub fn get_block_range(&self, start: u64, end: u64) -> ChainResult<Vec<Block>> {
        self.inner.state.get_block_range(start, end)
    }

    pub fn chain_state(&self) -> ChainResult<ChainState> {
        self.inner.state.chain_state()
    }

    pub fn mempool_size(&self) -> u32 {
        self.inner.mempool.size()
    }

    pub fn export_checkpoint(&self, block_number: u64) -> ChainResult<Vec<u8>> {
        self.inner.checkpoints.export(block_number)
    }

    pub fn latest_checkpoint(&self) -> Option<Checkpoint> {
        self.inner.checkpoints.latest()
    }

    pub fn checkpoint_stats(&self) -> CheckpointStats {
        self.inner.checkpoints.stats()
    }

    pub fn validator_address(&self) -> Option<Address> {
        self.inner.validator_address
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.network.local_peer_id()
    }

    pub async fn peer_count(&self) -> ChainResult<usize> {
        self.inner.network.peer_count().await
    }

    pub fn scoring(&self) -> &PeerScoring {
        &self.inner.scoring
    }
}

fn spawn_cid_consumer(
    mut cid_rx: mpsc::Receiver<(PeerId, CidMessage)>,
    handler: Option<CidHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                item = cid_rx.recv() => match item {
                    Some((peer, message)) => match &handler {
                        Some(handler) => handler(peer, message),
                        None => {
                            info!(
                                peer = %peer,
                                cid = %message.cid,
                                block_number = message.block_number,
                                "content announced"
                            );
                        }
                    },
                    None => break,
                }
            }
        }
    })
}

/// Consume decoded blocks in arrival order, applying strictly by height.
/// Blocks from the future are buffered while block-sync fills the gap.
fn spawn_block_applier(
    builder: Arc<BlockBuilder>,
    state: Arc<StateStore>,
    checkpoints: Arc<CheckpointManager>,
    scoring: Arc<PeerScoring>,
    block_gossip: Arc<BlockGossip>,
    mut blocks: mpsc::Receiver<(PeerId, Block)>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending: BTreeMap<u64, (PeerId, Block)> = BTreeMap::new();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                item = blocks.recv() => {
                    let Some((peer, block)) = item else { break };
                    handle_received_block(
                        &builder,
                        &state,
                        &checkpoints,
                        &scoring,
                        &block_gossip,
                        &mut pending,
                        peer,
                        block,
                    )
                    .await;
                }
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
async fn handle_received_block(
    builder: &BlockBuilder,
    state: &StateStore,
    checkpoints: &CheckpointManager,
    scoring: &PeerScoring,
    block_gossip: &BlockGossip,
    pending: &mut BTreeMap<u64, (PeerId, Block)>,
    peer: PeerId,
    block: Block,
) {
    let head = match state.chain_state() {
        Ok(head) => head,
        Err(err) => {
            error!(?err, "chain state unavailable");
            return;
        }
    };
    let number = block.header.block_number;
    if number <= head.head_block_number {
        debug!(number, head = head.head_block_number, "stale block ignored");
        return;
    }
    if number > head.head_block_number + 1 {
        // Out of order: hold it and pull the gap from the sender.
        if pending.len() < PENDING_BLOCK_CAPACITY {
            pending.insert(number, (peer, block));
        } else {
            warn!(number, "pending block buffer full, dropping");
        }
        match block_gossip
            .request_blocks(peer, head.head_block_number + 1, number - 1)
            .await
        {
            Ok(response) => {
                for message in response.blocks {
                    let gap_block = message.into_block();
                    apply_and_checkpoint(builder, state, checkpoints, scoring, peer, gap_block);
                }
            }
            Err(err) => {
                debug!(?err, peer = %peer, "block sync request failed");
            }
        }
        drain_pending(builder, state, checkpoints, scoring, pending);
        return;
    }

    apply_and_checkpoint(builder, state, checkpoints, scoring, peer, block);
    drain_pending(builder, state, checkpoints, scoring, pending);
}

fn apply_and_checkpoint(
    builder: &BlockBuilder,
    state: &StateStore,
    checkpoints: &CheckpointManager,
    scoring: &PeerScoring,
    peer: PeerId,
    block: Block,
) {
    match builder.apply_block(&block) {
        Ok(_) => {
            scoring.record_valid(peer);
            create_checkpoint(state, checkpoints, &block);
        }
        Err(err) => {
            warn!(
                ?err,
                peer = %peer,
                block_number = block.header.block_number,
                "rejected received block"
            );
            scoring.record_invalid(peer);
        }
    }
}

fn drain_pending(
    builder: &BlockBuilder,
    state: &StateStore,
    checkpoints: &CheckpointManager,
    scoring: &PeerScoring,
    pending: &mut BTreeMap<u64, (PeerId, Block)>,
) {
    loop {
        let head = match state.chain_state() {
            Ok(head) => head.head_block_number,
            Err(_) => return,
        };
        pending.retain(|number, _| *number > head);
        let next = head + 1;
        let Some((peer, block)) = pending.remove(&next) else {
            return;
        };
        apply_and_checkpoint(builder, state, checkpoints, scoring, peer, block);
        let new_head = state
            .chain_state()
            .map(|chain| chain.head_block_number)
            .unwrap_or(head);
        if new_head == head {
            // The buffered block was rejected; stop instead of spinning.
            return;
        }
    }
}

fn create_checkpoint(state: &StateStore, checkpoints: &CheckpointManager, block: &Block) {
    let total_transactions = state
        .chain_state()
        .map(|chain| chain.total_transactions)
        .unwrap_or(0);
    if let Err(err) = checkpoints.create(block, total_transactions) {
        warn!(?err, "checkpoint creation failed");
    }
}

/// Validator-only production loop: seal a block each interval, apply it
/// locally, then gossip it. A consistency failure on our own block is a
/// programming bug, so the producer stops.
fn spawn_block_producer(
    builder: Arc<BlockBuilder>,
    state: Arc<StateStore>,
    checkpoints: Arc<CheckpointManager>,
    block_gossip: Arc<BlockGossip>,
    validator: Address,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let head = match state.chain_state() {
                        Ok(head) => head,
                        Err(err) => {
                            error!(?err, "chain state unavailable, skipping round");
                            continue;
                        }
                    };
                    let block = match builder.build_block(
                        head.head_block_hash,
                        head.head_block_number + 1,
                        validator,
                    ) {
                        Ok(block) => block,
                        Err(err) => {
                            warn!(?err, "block building failed");
                            continue;
                        }
                    };
                    if let Err(err) = builder.apply_block(&block) {
                        error!(
                            ?err,
                            block_number = block.header.block_number,
                            "locally produced block failed to apply, stopping producer"
                        );
                        break;
                    }
                    create_checkpoint(&state, &checkpoints, &block);
                    info!(
                        block_number = block.header.block_number,
                        tx_count = block.transactions.len(),
                        "sealed block"
                    );
                    if let Err(err) = block_gossip.publish_block(&block).await {
                        debug!(?err, "block publish failed");
                    }
                }
            }
        }
    })
}
