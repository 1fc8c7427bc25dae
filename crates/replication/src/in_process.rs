//! [`PeerClient`] for nodes that share a process.
//!
//! Nodes register themselves by ring id. Entries are weak so a dropped node
//! simply becomes unreachable, and nodes never keep each other alive.

use crate::coordinator::ReplicationError;
use crate::peer_client::{ObjectBatch, PeerClient, PeerError};
use crate::service::ObjectStoreService;
use parking_lot::RwLock;
use ringstore_common::{KeyMetadata, RingId, Timestamp};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

#[derive(Default)]
pub struct InProcessPeers {
    nodes: RwLock<HashMap<RingId, Weak<dyn ObjectStoreService>>>,
}

impl std::fmt::Debug for InProcessPeers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessPeers")
            .field("nodes", &self.nodes.read().len())
            .finish()
    }
}

impl InProcessPeers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: &Arc<dyn ObjectStoreService>) {
        self.nodes
            .write()
            .insert(node.node_id(), Arc::downgrade(node));
    }

    /// Make `id` unreachable, as if its process had died.
    pub fn deregister(&self, id: &RingId) {
        self.nodes.write().remove(id);
    }

    fn resolve(&self, id: &RingId) -> Result<Arc<dyn ObjectStoreService>, PeerError> {
        self.nodes
            .read()
            .get(id)
            .and_then(Weak::upgrade)
            .ok_or(PeerError::Unreachable(*id))
    }
}

fn remote(e: ReplicationError) -> PeerError {
    PeerError::Remote(e.to_string())
}

#[async_trait::async_trait]
impl PeerClient for InProcessPeers {
    async fn put_object(&self, target: &RingId, key: &str, value: &[u8]) -> Result<(), PeerError> {
        let _timer = ringstore_metrics::start_rpc_timer("put_object");
        self.resolve(target)?.put(key, value).await.map_err(remote)
    }

    async fn get_object(&self, target: &RingId, key: &str) -> Result<Option<Vec<u8>>, PeerError> {
        let _timer = ringstore_metrics::start_rpc_timer("get_object");
        self.resolve(target)?.get(key).await.map_err(remote)
    }

    async fn get_object_as_of(
        &self,
        target: &RingId,
        key: &str,
        timestamp: Timestamp,
    ) -> Result<Option<Vec<u8>>, PeerError> {
        let _timer = ringstore_metrics::start_rpc_timer("get_object_as_of");
        self.resolve(target)?
            .get_as_of(key, timestamp)
            .await
            .map_err(remote)
    }

    async fn get_object_range(
        &self,
        target: &RingId,
        key: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Vec<u8>>, PeerError> {
        let _timer = ringstore_metrics::start_rpc_timer("get_object_range");
        self.resolve(target)?
            .get_range(key, from, to)
            .await
            .map_err(remote)
    }

    async fn delete(&self, target: &RingId, key: &str) -> Result<bool, PeerError> {
        let _timer = ringstore_metrics::start_rpc_timer("delete");
        self.resolve(target)?.delete(key).await.map_err(remote)
    }

    async fn key_set(&self, target: &RingId) -> Result<Vec<KeyMetadata>, PeerError> {
        let _timer = ringstore_metrics::start_rpc_timer("key_set");
        self.resolve(target)?.key_set().await.map_err(remote)
    }

    async fn put_objects(&self, target: &RingId, batch: ObjectBatch) -> Result<(), PeerError> {
        let _timer = ringstore_metrics::start_rpc_timer("put_objects");
        self.resolve(target)?.put_objects(batch).await.map_err(remote)
    }

    async fn make_replicas(&self, target: &RingId, batch: ObjectBatch) -> Result<(), PeerError> {
        let _timer = ringstore_metrics::start_rpc_timer("make_replicas");
        self.resolve(target)?
            .make_replicas(batch)
            .await
            .map_err(remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoNode {
        id: RingId,
    }

    #[async_trait::async_trait]
    impl ObjectStoreService for EchoNode {
        fn node_id(&self) -> RingId {
            self.id
        }
        async fn put(&self, _: &str, _: &[u8]) -> Result<(), ReplicationError> {
            Ok(())
        }
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ReplicationError> {
            Ok(Some(key.as_bytes().to_vec()))
        }
        async fn get_as_of(&self, _: &str, _: Timestamp) -> Result<Option<Vec<u8>>, ReplicationError> {
            Ok(None)
        }
        async fn get_range(
            &self,
            _: &str,
            _: Timestamp,
            _: Timestamp,
        ) -> Result<Vec<Vec<u8>>, ReplicationError> {
            Ok(vec![])
        }
        async fn delete(&self, _: &str) -> Result<bool, ReplicationError> {
            Ok(true)
        }
        async fn key_set(&self) -> Result<Vec<KeyMetadata>, ReplicationError> {
            Ok(vec![])
        }
        async fn put_objects(&self, _: ObjectBatch) -> Result<(), ReplicationError> {
            Ok(())
        }
        async fn make_replicas(&self, _: ObjectBatch) -> Result<(), ReplicationError> {
            Err(ReplicationError::InvalidRank {
                key: "k".into(),
                rank: 9,
                max: 2,
            })
        }
    }

    fn node(v: u64) -> Arc<dyn ObjectStoreService> {
        Arc::new(EchoNode {
            id: RingId::from_u64(v),
        })
    }

    #[tokio::test]
    async fn test_routes_by_id() {
        let peers = InProcessPeers::new();
        let a = node(1);
        peers.register(&a);

        let got = peers.get_object(&RingId::from_u64(1), "hello").await.unwrap();
        assert_eq!(got, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_unknown_and_dropped_nodes_are_unreachable() {
        let peers = InProcessPeers::new();
        let err = peers.delete(&RingId::from_u64(7), "k").await.unwrap_err();
        assert!(matches!(err, PeerError::Unreachable(_)));

        let a = node(1);
        peers.register(&a);
        drop(a);
        let err = peers.delete(&RingId::from_u64(1), "k").await.unwrap_err();
        assert!(matches!(err, PeerError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_deregister_and_remote_errors() {
        let peers = InProcessPeers::new();
        let a = node(1);
        peers.register(&a);

        let err = peers
            .make_replicas(&RingId::from_u64(1), ObjectBatch::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Remote(_)));

        peers.deregister(&RingId::from_u64(1));
        assert!(peers.key_set(&RingId::from_u64(1)).await.is_err());
    }
}
