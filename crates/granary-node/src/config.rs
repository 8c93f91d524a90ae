//! Node configuration file management.
//!
//! Written by `granary-node init` (including the coordinator-issued
//! credential) and read back by every other command.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{NodeError, Result};

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    #[serde(default)]
    pub p2p: P2pSection,
}

/// Local node settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Operator-chosen display name.
    #[serde(default)]
    pub name: String,
    /// Data directory holding the key file, index, and chunks.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Capacity offered to the network, in GiB.
    #[serde(default = "default_capacity_gib")]
    pub declared_capacity_gib: u64,
}

/// Coordinator connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSection {
    /// Base URL of the coordinator's control surface.
    #[serde(default = "default_coordinator_url")]
    pub url: String,
    /// This node's registered peer id (written by `init`).
    #[serde(default)]
    pub peer_id: String,
    /// Bearer credential issued at registration (written by `init`).
    #[serde(default)]
    pub credential: String,
    /// Heartbeat period in seconds.
    #[serde(default = "default_heartbeat_period")]
    pub heartbeat_period_secs: u64,
}

/// Peer transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pSection {
    /// QUIC listen address; also advertised to the coordinator.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_capacity_gib() -> u64 {
    100
}

fn default_coordinator_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_heartbeat_period() -> u64 {
    30
}

fn default_listen_addr() -> String {
    "127.0.0.1:4533".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: String::new(),
            data_dir: default_data_dir(),
            declared_capacity_gib: default_capacity_gib(),
        }
    }
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            url: default_coordinator_url(),
            peer_id: String::new(),
            credential: String::new(),
            heartbeat_period_secs: default_heartbeat_period(),
        }
    }
}

impl Default for P2pSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Persist configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| NodeError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.node.data_dir)
    }

    /// Where chunk ciphertext and the index live.
    pub fn chunk_dir(&self) -> PathBuf {
        self.data_dir().join("chunks")
    }

    /// Where the identity key lives.
    pub fn key_path(&self) -> PathBuf {
        self.data_dir().join("node.key")
    }

    pub fn declared_capacity_bytes(&self) -> u64 {
        self.node.declared_capacity_gib * (1 << 30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.node.declared_capacity_gib, 100);
        assert_eq!(config.coordinator.heartbeat_period_secs, 30);
        assert_eq!(config.p2p.listen_addr, "127.0.0.1:4533");
        assert_eq!(config.declared_capacity_bytes(), 100 << 30);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        let mut config = NodeConfig::default();
        config.node.name = "silo-1".to_string();
        config.coordinator.peer_id = "ab".repeat(32);
        config.coordinator.credential = "grn_secret".to_string();
        config.save(&path).expect("save");

        let restored = NodeConfig::load(&path).expect("load");
        assert_eq!(restored.node.name, "silo-1");
        assert_eq!(restored.coordinator.credential, "grn_secret");
    }

    #[test]
    fn test_derived_paths() {
        let config = NodeConfig::default();
        assert_eq!(config.chunk_dir(), PathBuf::from("data/chunks"));
        assert_eq!(config.key_path(), PathBuf::from("data/node.key"));
    }
}
