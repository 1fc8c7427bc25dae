//! The node-side surface that peer RPCs land on.

use crate::coordinator::ReplicationError;
use crate::peer_client::ObjectBatch;
use ringstore_common::{KeyMetadata, RingId, Timestamp};

/// Everything one node answers for, both to clients (routed through the
/// ring) and to its neighbours.
#[async_trait::async_trait]
pub trait ObjectStoreService: Send + Sync + 'static {
    fn node_id(&self) -> RingId;

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), ReplicationError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ReplicationError>;

    async fn get_as_of(
        &self,
        key: &str,
        timestamp: Timestamp,
    ) -> Result<Option<Vec<u8>>, ReplicationError>;

    async fn get_range(
        &self,
        key: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Vec<u8>>, ReplicationError>;

    async fn delete(&self, key: &str) -> Result<bool, ReplicationError>;

    async fn key_set(&self) -> Result<Vec<KeyMetadata>, ReplicationError>;

    async fn put_objects(&self, batch: ObjectBatch) -> Result<(), ReplicationError>;

    async fn make_replicas(&self, batch: ObjectBatch) -> Result<(), ReplicationError>;
}
