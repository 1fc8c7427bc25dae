//! Configuration schema and loader for ringstore nodes.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's listen address. Its ring id is the hash of this address.
    pub listen: SocketAddr,

    /// Identifier space settings.
    #[serde(default)]
    pub ring: RingConfig,

    /// Replication settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    /// Width of the identifier space in bits.
    #[serde(default = "default_id_bits")]
    pub id_bits: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            id_bits: default_id_bits(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Total copies of each key along the successor chain.
    #[serde(default = "default_replication_count")]
    pub replication_count: u32,

    /// Deadline for each peer RPC, in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            replication_count: default_replication_count(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for the catalog, data and index files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fsync policy: "always", "batch", "none".
    #[serde(default = "default_fsync")]
    pub fsync: String,

    /// Order (D) of the per-key time index.
    #[serde(default = "default_index_fanout")]
    pub index_fanout: usize,

    /// Number of keys whose latest offsets are kept in memory.
    #[serde(default = "default_offset_cache_capacity")]
    pub offset_cache_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fsync: default_fsync(),
            index_fanout: default_index_fanout(),
            offset_cache_capacity: default_offset_cache_capacity(),
        }
    }
}

// --- Defaults ---

fn default_id_bits() -> u32 {
    32
}
fn default_replication_count() -> u32 {
    2
}
fn default_rpc_timeout_ms() -> u64 {
    1000
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_fsync() -> String {
    "always".to_string()
}
fn default_index_fanout() -> usize {
    16
}
fn default_offset_cache_capacity() -> usize {
    1024
}

const FSYNC_POLICIES: &[&str] = &["always", "batch", "none"];

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring.id_bits == 0 || self.ring.id_bits > 160 {
            return Err(ConfigError::Invalid(format!(
                "ring.id_bits must be in 1..=160, got {}",
                self.ring.id_bits
            )));
        }
        if self.store.replication_count == 0 {
            return Err(ConfigError::Invalid(
                "store.replication_count must be > 0".into(),
            ));
        }
        if self.store.rpc_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "store.rpc_timeout_ms must be > 0".into(),
            ));
        }
        if self.storage.index_fanout < 2 {
            return Err(ConfigError::Invalid(format!(
                "storage.index_fanout must be >= 2, got {}",
                self.storage.index_fanout
            )));
        }
        if self.storage.offset_cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "storage.offset_cache_capacity must be > 0".into(),
            ));
        }
        let fsync = self.storage.fsync.to_lowercase();
        if !FSYNC_POLICIES.contains(&fsync.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "storage.fsync must be one of {:?}, got {:?}",
                FSYNC_POLICIES, self.storage.fsync
            )));
        }
        Ok(())
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
