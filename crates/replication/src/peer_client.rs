//! Abstraction over node-to-node RPCs.
//!
//! Peers are addressed by ring id; the transport resolves the id to a live
//! endpoint on every call instead of holding handles to its neighbours.

use ringstore_common::{KeyMetadata, RingId, Timestamp};
use std::collections::HashMap;
use std::future::Future;
use tokio::time::Duration;

/// Keys with their values, as shipped by `put_objects` and `make_replicas`.
pub type ObjectBatch = HashMap<KeyMetadata, Vec<u8>>;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer {0} unreachable")]
    Unreachable(RingId),
    #[error("timeout")]
    Timeout,
    #[error("remote error: {0}")]
    Remote(String),
    #[error("RPC failed: {0}")]
    RpcFailed(String),
}

/// Transport for peer RPCs.
#[async_trait::async_trait]
pub trait PeerClient: Send + Sync + 'static {
    /// Client write on the owning node.
    async fn put_object(&self, target: &RingId, key: &str, value: &[u8]) -> Result<(), PeerError>;

    async fn get_object(&self, target: &RingId, key: &str) -> Result<Option<Vec<u8>>, PeerError>;

    async fn get_object_as_of(
        &self,
        target: &RingId,
        key: &str,
        timestamp: Timestamp,
    ) -> Result<Option<Vec<u8>>, PeerError>;

    async fn get_object_range(
        &self,
        target: &RingId,
        key: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Vec<u8>>, PeerError>;

    async fn delete(&self, target: &RingId, key: &str) -> Result<bool, PeerError>;

    async fn key_set(&self, target: &RingId) -> Result<Vec<KeyMetadata>, PeerError>;

    /// Store a migrated batch on `target` under the given ranks.
    async fn put_objects(&self, target: &RingId, batch: ObjectBatch) -> Result<(), PeerError>;

    /// Store a batch on `target` and let it extend the replica chain.
    async fn make_replicas(&self, target: &RingId, batch: ObjectBatch) -> Result<(), PeerError>;
}

/// Run a peer call under a deadline.
pub async fn with_timeout<T, F>(deadline: Duration, call: F) -> Result<T, PeerError>
where
    F: Future<Output = Result<T, PeerError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(PeerError::Timeout),
    }
}
