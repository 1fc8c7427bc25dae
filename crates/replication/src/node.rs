//! Builds a node's coordinator from its configuration.

use crate::coordinator::{ReplicationConfig, ReplicationCoordinator};
use crate::peer_client::PeerClient;
use ringstore_common::{RingError, RingId, RingSpace};
use ringstore_config::{ConfigError, NodeConfig};
use ringstore_ring::RingView;
use ringstore_storage::{FsyncPolicy, LocalStore, StorageError, StoreOptions};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("ring error: {0}")]
    Ring(#[from] RingError),
}

/// The identifier space `config` describes.
pub fn ring_space(config: &NodeConfig) -> Result<RingSpace, NodeError> {
    Ok(RingSpace::new(config.ring.id_bits)?)
}

/// This node's position on the ring: the hash of its listen address.
pub fn node_id(config: &NodeConfig) -> Result<RingId, NodeError> {
    Ok(ring_space(config)?.node_id(&config.listen))
}

/// Store settings from the `storage` section.
pub fn store_options(config: &NodeConfig) -> StoreOptions {
    StoreOptions::new(&config.storage.data_dir)
        .with_fsync(FsyncPolicy::from_str_config(&config.storage.fsync))
        .with_index_fanout(config.storage.index_fanout)
        .with_offset_cache_capacity(config.storage.offset_cache_capacity)
}

/// Validate `config`, open the local store and build the coordinator.
pub fn open_node<R: RingView, P: PeerClient>(
    config: &NodeConfig,
    ring: Arc<R>,
    peers: Arc<P>,
) -> Result<Arc<ReplicationCoordinator<R, P>>, NodeError> {
    config.validate()?;
    let space = ring_space(config)?;
    let store = Arc::new(LocalStore::open(&store_options(config))?);
    let replication = ReplicationConfig::from_store_config(&config.store);
    tracing::info!(
        "node {} ({}): {} copies per key, {}-bit ring",
        ring.local_id(),
        config.listen,
        replication.replication_count,
        space.bits()
    );
    Ok(Arc::new(ReplicationCoordinator::new(
        store,
        ring,
        peers,
        space,
        replication,
    )))
}
