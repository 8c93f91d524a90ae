//! Coordinator configuration file management.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Complete coordinator configuration, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// HTTP control surface.
    #[serde(default)]
    pub server: ServerConfig,
    /// Metadata store location.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Peer transport.
    #[serde(default)]
    pub p2p: P2pConfig,
    /// Placement, repair, proof, and economics knobs.
    #[serde(default)]
    pub storage: StorageOptions,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the JSON control surface.
    #[serde(default = "default_http_bind")]
    pub bind_addr: String,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite file. Empty = `$data_dir/coordinator.db`.
    #[serde(default)]
    pub path: String,
    /// Data directory. Empty = platform default.
    #[serde(default)]
    pub data_dir: String,
}

/// Peer transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    /// QUIC bind address. Port 0 = OS-assigned.
    #[serde(default = "default_quic_bind")]
    pub bind_addr: String,
}

/// Core tunables. Every option recognized by the network has a default
/// matching the protocol documentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageOptions {
    /// Maximum ciphertext payload of a single chunk.
    #[serde(default = "default_chunk_max_bytes")]
    pub chunk_max_bytes: u64,
    /// Replica target per chunk.
    #[serde(default = "default_desired_replicas")]
    pub desired_replicas: u32,
    /// Sequential hash rounds per proof challenge.
    #[serde(default = "default_proof_difficulty")]
    pub proof_difficulty: u32,
    /// How often each chunk must re-prove, in seconds.
    #[serde(default = "default_proof_period_secs")]
    pub proof_period_secs: u64,
    /// Peer-side compute budget for a proof, in milliseconds.
    #[serde(default = "default_proof_deadline_ms")]
    pub proof_deadline_ms: u64,
    /// Repair loop period in seconds.
    #[serde(default = "default_repair_period_secs")]
    pub repair_period_secs: u64,
    /// Maximum chunks repaired per cycle.
    #[serde(default = "default_repair_batch_max")]
    pub repair_batch_max: u32,
    /// Expected heartbeat period in seconds.
    #[serde(default = "default_heartbeat_period_secs")]
    pub heartbeat_period_secs: u64,
    /// Staleness window before a peer is presumed dead, in seconds.
    /// Unset = 3x the heartbeat period.
    #[serde(default)]
    pub liveness_window_secs: Option<u64>,
    /// Credits per GiB-month of verified storage.
    #[serde(default = "default_storage_credit")]
    pub storage_credit_per_gib_month: u64,
}

// Default value functions

fn default_http_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_quic_bind() -> String {
    "0.0.0.0:4433".to_string()
}

fn default_chunk_max_bytes() -> u64 {
    262_144
}

fn default_desired_replicas() -> u32 {
    3
}

fn default_proof_difficulty() -> u32 {
    1000
}

fn default_proof_period_secs() -> u64 {
    4 * 60 * 60
}

fn default_proof_deadline_ms() -> u64 {
    2000
}

fn default_repair_period_secs() -> u64 {
    5 * 60
}

fn default_repair_batch_max() -> u32 {
    100
}

fn default_heartbeat_period_secs() -> u64 {
    30
}

fn default_storage_credit() -> u64 {
    100
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_http_bind(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            data_dir: String::new(),
        }
    }
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_quic_bind(),
        }
    }
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            chunk_max_bytes: default_chunk_max_bytes(),
            desired_replicas: default_desired_replicas(),
            proof_difficulty: default_proof_difficulty(),
            proof_period_secs: default_proof_period_secs(),
            proof_deadline_ms: default_proof_deadline_ms(),
            repair_period_secs: default_repair_period_secs(),
            repair_batch_max: default_repair_batch_max(),
            heartbeat_period_secs: default_heartbeat_period_secs(),
            liveness_window_secs: None,
            storage_credit_per_gib_month: default_storage_credit(),
        }
    }
}

impl StorageOptions {
    /// The effective liveness window: configured value or 3x the heartbeat
    /// period.
    pub fn liveness_window_secs(&self) -> u64 {
        self.liveness_window_secs
            .unwrap_or(3 * self.heartbeat_period_secs)
    }
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the data directory.
    pub fn data_dir(&self) -> PathBuf {
        if self.database.data_dir.is_empty() {
            if let Ok(dir) = std::env::var("GRANARY_DATA_DIR") {
                return PathBuf::from(dir);
            }
            std::env::var("HOME")
                .map(|h| PathBuf::from(h).join(".granary-coordinator"))
                .unwrap_or_else(|_| PathBuf::from("/tmp/granary-coordinator"))
        } else {
            PathBuf::from(&self.database.data_dir)
        }
    }

    /// Resolve the SQLite path.
    pub fn database_path(&self) -> PathBuf {
        if self.database.path.is_empty() {
            self.data_dir().join("coordinator.db")
        } else {
            PathBuf::from(&self.database.path)
        }
    }
}
