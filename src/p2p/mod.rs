//! libp2p-backed networking: identity, transports, gossip, peer scoring.

mod gossip;
mod identity;
mod scoring;
mod swarm;
mod topics;

pub use gossip::{BlockGossip, CidGossip, TxGossip};
pub use identity::NodeIdentity;
pub use scoring::{PeerScore, PeerScoring, ScoringStats, INITIAL_PEER_SCORE};
pub use swarm::{NetworkCommand, NetworkEvent, NetworkHandle, NetworkService};
pub use topics::{GossipTopic, BLOCK_SYNC_PROTOCOL};
