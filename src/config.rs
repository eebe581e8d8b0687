use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub p2p_key_path: PathBuf,
    /// Block production and checkpoint signing key. Absent on observer nodes.
    #[serde(default)]
    pub validator_key_path: Option<PathBuf>,
    pub listen_port: u16,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default = "default_max_peers")]
    pub max_peers: u32,
    #[serde(default = "default_block_time_ms")]
    pub block_time_ms: u64,
    #[serde(default)]
    pub mempool: MempoolConfig,
    #[serde(default)]
    pub block: BlockConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub peer_scoring: PeerScoringConfig,
    #[serde(default)]
    pub gossip: GossipConfig,
    #[serde(default)]
    pub genesis: GenesisConfig,
}

fn default_max_peers() -> u32 {
    64
}

fn default_block_time_ms() -> u64 {
    10_000
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MempoolConfig {
    pub max_size: u32,
    pub max_tx_age_secs: u64,
    pub cleanup_interval_secs: u64,
    pub priority_threshold: f64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            max_tx_age_secs: 3_600,
            cleanup_interval_secs: 60,
            priority_threshold: 0.0,
        }
    }
}

impl MempoolConfig {
    pub fn max_tx_age(&self) -> Duration {
        Duration::from_secs(self.max_tx_age_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockConfig {
    pub max_tx_per_block: usize,
    /// Gas budget the builder packs against. The consensus hard cap stays at
    /// 50M regardless of this value.
    pub gas_limit: u64,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            max_tx_per_block: 1_000,
            gas_limit: 30_000_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub interval: u64,
    pub max_checkpoints: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: 100,
            max_checkpoints: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerScoringConfig {
    pub quarantine_threshold: i32,
    pub ban_threshold: i32,
    pub decay_interval_secs: u64,
    pub stale_timeout_secs: u64,
}

impl Default for PeerScoringConfig {
    fn default() -> Self {
        Self {
            quarantine_threshold: 10,
            ban_threshold: 0,
            decay_interval_secs: 300,
            stale_timeout_secs: 300,
        }
    }
}

impl PeerScoringConfig {
    pub fn decay_interval(&self) -> Duration {
        Duration::from_secs(self.decay_interval_secs)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipConfig {
    pub tx_batch_interval_ms: u64,
    pub tx_batch_max: usize,
    pub cid_batch_interval_ms: u64,
    pub cid_batch_max: usize,
    pub block_publish_timeout_secs: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            // The source derived this from a physical constant; it is just a
            // batch interval.
            tx_batch_interval_ms: 14_140,
            tx_batch_max: 100,
            cid_batch_interval_ms: 14_140,
            cid_batch_max: 50,
            block_publish_timeout_secs: 5,
        }
    }
}

impl GossipConfig {
    pub fn tx_batch_interval(&self) -> Duration {
        Duration::from_millis(self.tx_batch_interval_ms)
    }

    pub fn cid_batch_interval(&self) -> Duration {
        Duration::from_millis(self.cid_batch_interval_ms)
    }

    pub fn block_publish_timeout(&self) -> Duration {
        Duration::from_secs(self.block_publish_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct GenesisConfig {
    #[serde(default)]
    pub accounts: Vec<GenesisAccount>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisAccount {
    /// Hex-encoded 32-byte address.
    pub address: String,
    pub balance: u64,
}

impl GenesisAccount {
    pub fn address_bytes(&self) -> ChainResult<[u8; 32]> {
        let bytes = hex::decode(&self.address)
            .map_err(|err| ChainError::Config(format!("invalid genesis address: {err}")))?;
        bytes
            .try_into()
            .map_err(|_| ChainError::Config("genesis address must be 32 bytes".into()))
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.p2p_key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(path) = &self.validator_key_path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    pub fn block_interval(&self) -> Duration {
        Duration::from_millis(self.block_time_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            p2p_key_path: PathBuf::from("./keys/p2p.toml"),
            validator_key_path: Some(PathBuf::from("./keys/validator.toml")),
            listen_port: 9000,
            bootstrap_peers: Vec::new(),
            max_peers: default_max_peers(),
            block_time_ms: default_block_time_ms(),
            mempool: MempoolConfig::default(),
            block: BlockConfig::default(),
            checkpoint: CheckpointConfig::default(),
            peer_scoring: PeerScoringConfig::default(),
            gossip: GossipConfig::default(),
            genesis: GenesisConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_roundtrips_through_toml() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("node.toml");

        let mut config = NodeConfig::default();
        config.listen_port = 9999;
        config.mempool.max_size = 42;
        config.save(&path).expect("save config");

        let loaded = NodeConfig::load(&path).expect("load config");
        assert_eq!(loaded.listen_port, 9999);
        assert_eq!(loaded.mempool.max_size, 42);
        assert_eq!(loaded.gossip.tx_batch_interval_ms, 14_140);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let minimal = r#"
            data_dir = "./data"
            p2p_key_path = "./keys/p2p.toml"
            listen_port = 9000
        "#;
        let config: NodeConfig = toml::from_str(minimal).expect("parse minimal config");
        assert_eq!(config.block.max_tx_per_block, 1_000);
        assert_eq!(config.block.gas_limit, 30_000_000);
        assert_eq!(config.peer_scoring.quarantine_threshold, 10);
        assert!(config.validator_key_path.is_none());
    }
}
