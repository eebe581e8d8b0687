use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::connection_limits::{self, ConnectionLimits};
use libp2p::kad::store::MemoryStore;
use libp2p::request_response::{self, OutboundRequestId, ProtocolSupport};
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{gossipsub, identify, kad, noise, ping, tcp, upnp, yamux};
use libp2p::{Multiaddr, PeerId, StreamProtocol, Swarm};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::crypto::sha256;
use crate::errors::{ChainError, ChainResult};
use crate::types::{BlockSource, BlockSyncRequest, BlockSyncResponse, MAX_SYNC_BLOCKS};

use super::identity::NodeIdentity;
use super::scoring::PeerScoring;
use super::topics::{GossipTopic, BLOCK_SYNC_PROTOCOL};

const COMMAND_QUEUE_CAPACITY: usize = 256;
const EVENT_QUEUE_CAPACITY: usize = 256;
const BAN_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
const IDENTIFY_PROTOCOL: &str = "/coinjecture/id/1.0.0";
const MAX_TRANSMIT_SIZE: usize = 4 * 1024 * 1024;

#[derive(NetworkBehaviour)]
struct NodeBehaviour {
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
    kademlia: kad::Behaviour<MemoryStore>,
    block_sync: request_response::json::Behaviour<BlockSyncRequest, BlockSyncResponse>,
    limits: connection_limits::Behaviour,
    upnp: upnp::tokio::Behaviour,
}

impl NodeBehaviour {
    fn new(identity: &libp2p::identity::Keypair, max_peers: u32) -> ChainResult<Self> {
        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .validation_mode(gossipsub::ValidationMode::Strict)
            .max_transmit_size(MAX_TRANSMIT_SIZE)
            .duplicate_cache_time(Duration::from_secs(60))
            .message_id_fn(|message| {
                gossipsub::MessageId::from(hex::encode(sha256(&message.data)))
            })
            .build()
            .map_err(|err| ChainError::Network(format!("gossipsub config: {err}")))?;
        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(identity.clone()),
            gossipsub_config,
        )
        .map_err(|err| ChainError::Network(format!("gossipsub init: {err}")))?;

        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.into(),
            identity.public(),
        ));

        let ping = ping::Behaviour::new(ping::Config::new());

        let peer_id = PeerId::from(identity.public());
        // Kademlia is a peer-discovery index only; nothing is stored in it.
        let mut kademlia = kad::Behaviour::new(peer_id, MemoryStore::new(peer_id));
        kademlia.set_mode(Some(kad::Mode::Server));

        let block_sync = request_response::json::Behaviour::new(
            [(
                StreamProtocol::new(BLOCK_SYNC_PROTOCOL),
                ProtocolSupport::Full,
            )],
            request_response::Config::default(),
        );

        let limits = connection_limits::Behaviour::new(
            ConnectionLimits::default()
                .with_max_established(Some(max_peers))
                .with_max_pending_incoming(Some(max_peers / 2)),
        );

        Ok(Self {
            gossipsub,
            identify,
            ping,
            kademlia,
            block_sync,
            limits,
            upnp: upnp::tokio::Behaviour::default(),
        })
    }
}

#[derive(Debug)]
pub enum NetworkCommand {
    Publish {
        topic: GossipTopic,
        data: Vec<u8>,
        reply: oneshot::Sender<ChainResult<()>>,
    },
    Dial {
        addr: Multiaddr,
    },
    RequestBlocks {
        peer: PeerId,
        request: BlockSyncRequest,
        reply: oneshot::Sender<ChainResult<BlockSyncResponse>>,
    },
    FindPeer {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
}

#[derive(Clone, Debug)]
pub enum NetworkEvent {
    Gossip {
        peer: PeerId,
        topic: GossipTopic,
        data: Vec<u8>,
    },
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    NewListenAddr(Multiaddr),
}

/// Cheap clonable front for the swarm task.
#[derive(Clone)]
pub struct NetworkHandle {
    peer_id: PeerId,
    commands: mpsc::Sender<NetworkCommand>,
    events: broadcast::Sender<NetworkEvent>,
}

impl NetworkHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: NetworkCommand) -> ChainResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ChainError::Network("network service stopped".into()))
    }

    pub async fn publish(&self, topic: GossipTopic, data: Vec<u8>) -> ChainResult<()> {
        let (reply, response) = oneshot::channel();
        self.send(NetworkCommand::Publish { topic, data, reply })
            .await?;
        response
            .await
            .map_err(|_| ChainError::Network("publish reply dropped".into()))?
    }

    pub async fn dial(&self, addr: Multiaddr) -> ChainResult<()> {
        self.send(NetworkCommand::Dial { addr }).await
    }

    pub async fn request_blocks(
        &self,
        peer: PeerId,
        request: BlockSyncRequest,
    ) -> ChainResult<BlockSyncResponse> {
        let (reply, response) = oneshot::channel();
        self.send(NetworkCommand::RequestBlocks {
            peer,
            request,
            reply,
        })
        .await?;
        response
            .await
            .map_err(|_| ChainError::Network("block sync reply dropped".into()))?
    }

    pub async fn find_peer(&self, peer: PeerId) -> ChainResult<bool> {
        let (reply, response) = oneshot::channel();
        self.send(NetworkCommand::FindPeer { peer, reply }).await?;
        response
            .await
            .map_err(|_| ChainError::Network("find peer reply dropped".into()))
    }

    pub async fn connected_peers(&self) -> ChainResult<Vec<PeerId>> {
        let (reply, response) = oneshot::channel();
        self.send(NetworkCommand::ConnectedPeers { reply }).await?;
        response
            .await
            .map_err(|_| ChainError::Network("peer list reply dropped".into()))
    }

    pub async fn peer_count(&self) -> ChainResult<usize> {
        Ok(self.connected_peers().await?.len())
    }

    pub async fn listen_addrs(&self) -> ChainResult<Vec<Multiaddr>> {
        let (reply, response) = oneshot::channel();
        self.send(NetworkCommand::ListenAddrs { reply }).await?;
        response
            .await
            .map_err(|_| ChainError::Network("addr list reply dropped".into()))
    }
}

/// Owns the libp2p swarm: transports, gossipsub, discovery, and the
/// block-sync protocol. Commands arrive over a channel; everything the
/// upper layers care about leaves as broadcast events.
pub struct NetworkService {
    swarm: Swarm<NodeBehaviour>,
    local_peer_id: PeerId,
    scoring: Arc<PeerScoring>,
    block_source: Arc<dyn BlockSource>,
    commands: mpsc::Receiver<NetworkCommand>,
    events: broadcast::Sender<NetworkEvent>,
    pending_sync: HashMap<OutboundRequestId, oneshot::Sender<ChainResult<BlockSyncResponse>>>,
    pending_lookups: HashMap<kad::QueryId, (PeerId, oneshot::Sender<bool>)>,
}

impl NetworkService {
    pub fn spawn(
        identity: &NodeIdentity,
        listen_port: u16,
        bootstrap_peers: &[String],
        max_peers: u32,
        scoring: Arc<PeerScoring>,
        block_source: Arc<dyn BlockSource>,
        shutdown: watch::Receiver<bool>,
    ) -> ChainResult<(NetworkHandle, JoinHandle<()>)> {
        let local_peer_id = identity.peer_id();
        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(identity.clone_keypair())
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|err| ChainError::Network(format!("tcp transport: {err}")))?
            .with_quic()
            .with_dns()
            .map_err(|err| ChainError::Network(format!("dns transport: {err}")))?
            .with_behaviour(|key| {
                NodeBehaviour::new(key, max_peers)
                    .map_err(|err| Box::<dyn std::error::Error + Send + Sync>::from(err))
            })
            .map_err(|err| ChainError::Network(format!("behaviour: {err}")))?
            .with_swarm_config(|config| {
                config.with_idle_connection_timeout(Duration::from_secs(120))
            })
            .build();

        for topic in GossipTopic::all() {
            swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&topic.ident())
                .map_err(|err| ChainError::Network(format!("subscribe {topic}: {err}")))?;
        }

        let tcp_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{listen_port}")
            .parse()
            .map_err(|err| ChainError::Network(format!("listen addr: {err}")))?;
        swarm
            .listen_on(tcp_addr)
            .map_err(|err| ChainError::Network(format!("listen: {err}")))?;
        let quic_addr: Multiaddr = format!("/ip4/0.0.0.0/udp/{listen_port}/quic-v1")
            .parse()
            .map_err(|err| ChainError::Network(format!("listen addr: {err}")))?;
        if let Err(err) = swarm.listen_on(quic_addr) {
            warn!(?err, "QUIC listener unavailable, continuing with TCP only");
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (event_tx, _) = broadcast::channel(EVENT_QUEUE_CAPACITY);
        let mut service = Self {
            swarm,
            local_peer_id,
            scoring,
            block_source,
            commands: command_rx,
            events: event_tx.clone(),
            pending_sync: HashMap::new(),
            pending_lookups: HashMap::new(),
        };
        let handle = NetworkHandle {
            peer_id: local_peer_id,
            commands: command_tx,
            events: event_tx,
        };

        service.connect_bootstrap(bootstrap_peers);

        let task = tokio::spawn(service.run(shutdown));
        info!(peer_id = %local_peer_id, listen_port, "network service started");
        Ok((handle, task))
    }

    fn connect_bootstrap(&mut self, peers: &[String]) {
        for raw in peers {
            let addr: Multiaddr = match raw.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    warn!(addr = raw, ?err, "invalid bootstrap address");
                    continue;
                }
            };
            if let Some(libp2p::multiaddr::Protocol::P2p(peer_id)) = addr.iter().last() {
                self.swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer_id, addr.clone());
            }
            if let Err(err) = self.swarm.dial(addr.clone()) {
                warn!(%addr, ?err, "failed to dial bootstrap peer");
            }
        }
        if !peers.is_empty() {
            if let Err(err) = self.swarm.behaviour_mut().kademlia.bootstrap() {
                warn!(?err, "kademlia bootstrap failed");
            }
        } else {
            warn!("no bootstrap peers configured, discovery starts cold");
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut reconcile = time::interval(BAN_RECONCILE_INTERVAL);
        reconcile.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("network service stopping");
                        break;
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => break,
                    }
                }
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
                _ = reconcile.tick() => {
                    self.reconcile_bans();
                }
            }
        }
    }

    /// Drop connections to banned peers and keep the gossipsub blacklist in
    /// step with the scoring table as decay lifts bans.
    fn reconcile_bans(&mut self) {
        for entry in self.scoring.all() {
            if entry.banned {
                self.swarm
                    .behaviour_mut()
                    .gossipsub
                    .blacklist_peer(&entry.peer_id);
                if self.swarm.is_connected(&entry.peer_id) {
                    let _ = self.swarm.disconnect_peer_id(entry.peer_id);
                    info!(peer = %entry.peer_id, "dropped connection to banned peer");
                }
            } else {
                self.swarm
                    .behaviour_mut()
                    .gossipsub
                    .remove_blacklisted_peer(&entry.peer_id);
            }
        }
    }

    fn handle_command(&mut self, command: NetworkCommand) {
        match command {
            NetworkCommand::Publish { topic, data, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(topic.ident(), data)
                    .map(|_| ())
                    .map_err(|err| ChainError::Network(format!("publish {topic}: {err:?}")));
                let _ = reply.send(result);
            }
            NetworkCommand::Dial { addr } => {
                if let Err(err) = self.swarm.dial(addr.clone()) {
                    warn!(%addr, ?err, "dial failed");
                }
            }
            NetworkCommand::RequestBlocks {
                peer,
                request,
                reply,
            } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .block_sync
                    .send_request(&peer, request);
                self.pending_sync.insert(request_id, reply);
            }
            NetworkCommand::FindPeer { peer, reply } => {
                let query_id = self.swarm.behaviour_mut().kademlia.get_closest_peers(peer);
                self.pending_lookups.insert(query_id, (peer, reply));
            }
            NetworkCommand::ConnectedPeers { reply } => {
                let peers = self.swarm.connected_peers().copied().collect();
                let _ = reply.send(peers);
            }
            NetworkCommand::ListenAddrs { reply } => {
                let addrs = self.swarm.listeners().cloned().collect();
                let _ = reply.send(addrs);
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "listening");
                let _ = self.events.send(NetworkEvent::NewListenAddr(address));
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                if self.scoring.is_banned(&peer_id) {
                    info!(peer = %peer_id, "refusing connection from banned peer");
                    let _ = self.swarm.disconnect_peer_id(peer_id);
                    return;
                }
                debug!(peer = %peer_id, "peer connected");
                let _ = self.events.send(NetworkEvent::PeerConnected(peer_id));
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                debug!(peer = %peer_id, "peer disconnected");
                let _ = self.events.send(NetworkEvent::PeerDisconnected(peer_id));
            }
            SwarmEvent::Behaviour(behaviour) => self.handle_behaviour_event(behaviour),
            other => {
                trace!(?other, "swarm event ignored");
            }
        }
    }

    fn handle_behaviour_event(&mut self, event: NodeBehaviourEvent) {
        match event {
            NodeBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            }) => self.handle_gossip_message(propagation_source, message),
            NodeBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr);
                }
            }
            NodeBehaviourEvent::Ping(ping::Event { peer, result, .. }) => {
                if let Err(failure) = result {
                    debug!(peer = %peer, ?failure, "ping failure");
                    if matches!(failure, ping::Failure::Timeout) {
                        self.scoring.record_timeout(peer);
                    }
                }
            }
            NodeBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                id,
                result: kad::QueryResult::GetClosestPeers(result),
                ..
            }) => {
                if let Some((target, reply)) = self.pending_lookups.remove(&id) {
                    let found = match result {
                        Ok(ok) => ok.peers.iter().any(|peer| *peer == target),
                        Err(_) => false,
                    };
                    let _ = reply.send(found);
                }
            }
            NodeBehaviourEvent::BlockSync(event) => self.handle_block_sync_event(event),
            NodeBehaviourEvent::Upnp(event) => {
                debug!(?event, "upnp");
            }
            _ => {}
        }
    }

    fn handle_gossip_message(&mut self, source: PeerId, message: gossipsub::Message) {
        // Never process our own publishes coming back around.
        if source == self.local_peer_id || message.source == Some(self.local_peer_id) {
            return;
        }
        let Some(topic) = GossipTopic::from_hash(&message.topic) else {
            trace!(topic = %message.topic, "unknown gossip topic");
            return;
        };
        if self.scoring.is_banned(&source) {
            debug!(peer = %source, %topic, "ignoring message from banned peer");
            return;
        }
        if self.scoring.is_quarantined(&source) {
            debug!(peer = %source, %topic, "dropping message from quarantined peer");
            return;
        }
        let _ = self.events.send(NetworkEvent::Gossip {
            peer: source,
            topic,
            data: message.data,
        });
    }

    fn handle_block_sync_event(
        &mut self,
        event: request_response::Event<BlockSyncRequest, BlockSyncResponse>,
    ) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    debug!(
                        peer = %peer,
                        from = request.from_block,
                        to = request.to_block,
                        "block sync request"
                    );
                    let max = request.max_blocks.min(MAX_SYNC_BLOCKS);
                    let blocks = match self.block_source.sync_range(
                        request.from_block,
                        request.to_block,
                        max,
                    ) {
                        Ok(blocks) => blocks,
                        Err(err) => {
                            warn!(?err, "block sync lookup failed");
                            Vec::new()
                        }
                    };
                    let response = BlockSyncResponse { blocks };
                    if self
                        .swarm
                        .behaviour_mut()
                        .block_sync
                        .send_response(channel, response)
                        .is_err()
                    {
                        debug!(peer = %peer, "block sync response channel closed");
                    }
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(reply) = self.pending_sync.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                self.scoring.record_timeout(peer);
                if let Some(reply) = self.pending_sync.remove(&request_id) {
                    let _ = reply.send(Err(ChainError::Network(format!(
                        "block sync failed: {error}"
                    ))));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!(peer = %peer, ?error, "inbound block sync failure");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }
}
