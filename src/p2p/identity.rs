use std::fs;
use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use libp2p::identity::Keypair;
use libp2p::PeerId;
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredIdentity {
    key: String,
}

/// Persistent Ed25519 libp2p identity. Generated on first start, reloaded
/// afterwards so the peer id stays stable across restarts.
#[derive(Clone)]
pub struct NodeIdentity {
    keypair: Keypair,
    peer_id: PeerId,
}

impl NodeIdentity {
    pub fn load_or_generate(path: impl AsRef<Path>) -> ChainResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            let keypair = Keypair::generate_ed25519();
            Self::persist(path, &keypair)?;
            Ok(Self::from_keypair(keypair))
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn clone_keypair(&self) -> Keypair {
        self.keypair.clone()
    }

    fn from_keypair(keypair: Keypair) -> Self {
        let peer_id = PeerId::from(keypair.public());
        Self { keypair, peer_id }
    }

    fn load(path: &Path) -> ChainResult<Self> {
        let raw = fs::read_to_string(path)?;
        let stored: StoredIdentity =
            toml::from_str(&raw).map_err(|err| ChainError::Config(err.to_string()))?;
        let bytes = general_purpose::STANDARD
            .decode(stored.key)
            .map_err(|err| ChainError::Config(err.to_string()))?;
        let keypair = Keypair::from_protobuf_encoding(&bytes)
            .map_err(|err| ChainError::Config(err.to_string()))?;
        Ok(Self::from_keypair(keypair))
    }

    fn persist(path: &Path, keypair: &Keypair) -> ChainResult<()> {
        let bytes = keypair
            .to_protobuf_encoding()
            .map_err(|err| ChainError::Config(err.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let stored = StoredIdentity {
            key: general_purpose::STANDARD.encode(bytes),
        };
        let encoded = toml::to_string_pretty(&stored)
            .map_err(|err| ChainError::Config(err.to_string()))?;
        fs::write(path, encoded)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generates_and_reloads_identity() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("p2p.toml");

        let identity = NodeIdentity::load_or_generate(&path).expect("generate");
        let reloaded = NodeIdentity::load_or_generate(&path).expect("load");
        assert_eq!(identity.peer_id(), reloaded.peer_id());
    }
}
