//! Client-side routing: every request goes to the node that owns its key.

use crate::peer_client::{with_timeout, PeerClient, PeerError};
use ringstore_common::{KeyMetadata, RingId, RingSpace, Timestamp};
use ringstore_ring::RingView;
use std::sync::Arc;
use tokio::time::Duration;

/// Routes client operations through the ring.
///
/// The owner is looked up per call, so requests follow membership changes
/// without any cached routing state. Reads get `timeout`; a put or delete
/// only answers once its replica chain has been walked, so it gets
/// `timeout` once per copy in the chain.
pub struct LookupClient<R: RingView, P: PeerClient> {
    ring: Arc<R>,
    peers: Arc<P>,
    space: RingSpace,
    timeout: Duration,
    chain_length: u32,
}

impl<R: RingView, P: PeerClient> std::fmt::Debug for LookupClient<R, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupClient")
            .field("local_id", &self.ring.local_id())
            .field("timeout", &self.timeout)
            .field("chain_length", &self.chain_length)
            .finish_non_exhaustive()
    }
}

impl<R: RingView, P: PeerClient> LookupClient<R, P> {
    pub fn new(ring: Arc<R>, peers: Arc<P>, space: RingSpace, timeout: Duration) -> Self {
        Self {
            ring,
            peers,
            space,
            timeout,
            chain_length: 1,
        }
    }

    /// Number of copies each write makes, normally the cluster's
    /// `replication_count`.
    pub fn with_chain_length(mut self, copies: u32) -> Self {
        self.chain_length = copies.max(1);
        self
    }

    fn write_timeout(&self) -> Duration {
        self.timeout * self.chain_length
    }

    /// The node currently responsible for `key`.
    pub fn owner_of(&self, key: &str) -> RingId {
        self.ring.responsible_node(&self.space.key(key).id)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PeerError> {
        let owner = self.owner_of(key);
        tracing::debug!("get {} via {}", key, owner);
        with_timeout(self.timeout, self.peers.get_object(&owner, key)).await
    }

    pub async fn get_as_of(
        &self,
        key: &str,
        timestamp: Timestamp,
    ) -> Result<Option<Vec<u8>>, PeerError> {
        let owner = self.owner_of(key);
        with_timeout(self.timeout, self.peers.get_object_as_of(&owner, key, timestamp)).await
    }

    pub async fn get_range(
        &self,
        key: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Vec<u8>>, PeerError> {
        let owner = self.owner_of(key);
        with_timeout(self.timeout, self.peers.get_object_range(&owner, key, from, to)).await
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), PeerError> {
        let owner = self.owner_of(key);
        tracing::debug!("put {} via {}", key, owner);
        with_timeout(self.write_timeout(), self.peers.put_object(&owner, key, value)).await
    }

    /// Deleting a key that never existed succeeds.
    pub async fn delete(&self, key: &str) -> Result<(), PeerError> {
        let owner = self.owner_of(key);
        with_timeout(self.write_timeout(), self.peers.delete(&owner, key))
            .await
            .map(|_| ())
    }

    /// Keys held by the node this client is attached to.
    pub async fn key_set(&self) -> Result<Vec<KeyMetadata>, PeerError> {
        self.key_set_of(&self.ring.local_id()).await
    }

    pub async fn key_set_of(&self, node: &RingId) -> Result<Vec<KeyMetadata>, PeerError> {
        with_timeout(self.timeout, self.peers.key_set(node)).await
    }
}
