//! Chaos injection wrapper for [`PeerClient`].
//!
//! [`ChaosPeerClient`] wraps any `P: PeerClient` and injects configurable
//! failures: random errors, per-node failures, and latency.

use crate::peer_client::{ObjectBatch, PeerClient, PeerError};
use rand::Rng;
use ringstore_common::{KeyMetadata, RingId, Timestamp};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Configuration for peer chaos injection.
#[derive(Debug, Clone)]
pub struct ChaosPeerConfig {
    /// Probability of returning an error \[0.0, 1.0\].
    pub failure_rate: f64,
    /// Fixed latency injected before forwarding.
    pub latency: Duration,
    /// Random additional latency in \[0, jitter\].
    pub jitter: Duration,
}

impl Default for ChaosPeerConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

/// A [`PeerClient`] wrapper that injects chaos (failures, latency, per-node blocks).
pub struct ChaosPeerClient<P: PeerClient> {
    inner: Arc<P>,
    config: Arc<RwLock<ChaosPeerConfig>>,
    failed_nodes: Arc<RwLock<HashSet<RingId>>>,
}

impl<P: PeerClient> std::fmt::Debug for ChaosPeerClient<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosPeerClient").finish_non_exhaustive()
    }
}

impl<P: PeerClient> ChaosPeerClient<P> {
    pub fn new(inner: Arc<P>, config: ChaosPeerConfig) -> Self {
        Self {
            inner,
            config: Arc::new(RwLock::new(config)),
            failed_nodes: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Fail every call to `node` until it is recovered.
    pub async fn fail_node(&self, node: RingId) {
        self.failed_nodes.write().await.insert(node);
    }

    pub async fn recover_node(&self, node: RingId) {
        self.failed_nodes.write().await.remove(&node);
    }

    pub async fn set_failure_rate(&self, rate: f64) {
        self.config.write().await.failure_rate = rate;
    }

    async fn maybe_fail(&self, target: &RingId) -> Result<(), PeerError> {
        if self.failed_nodes.read().await.contains(target) {
            return Err(PeerError::RpcFailed("chaos: node marked as failed".into()));
        }

        let (delay, failure_rate) = {
            let config = self.config.read().await;
            let jitter_ms = if config.jitter.is_zero() {
                0
            } else {
                rand::thread_rng().gen_range(0..=config.jitter.as_millis() as u64)
            };
            (
                config.latency + Duration::from_millis(jitter_ms),
                config.failure_rate,
            )
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if failure_rate > 0.0 && rand::thread_rng().gen_bool(failure_rate.min(1.0)) {
            return Err(PeerError::RpcFailed("chaos: random failure".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<P: PeerClient> PeerClient for ChaosPeerClient<P> {
    async fn put_object(&self, target: &RingId, key: &str, value: &[u8]) -> Result<(), PeerError> {
        self.maybe_fail(target).await?;
        self.inner.put_object(target, key, value).await
    }

    async fn get_object(&self, target: &RingId, key: &str) -> Result<Option<Vec<u8>>, PeerError> {
        self.maybe_fail(target).await?;
        self.inner.get_object(target, key).await
    }

    async fn get_object_as_of(
        &self,
        target: &RingId,
        key: &str,
        timestamp: Timestamp,
    ) -> Result<Option<Vec<u8>>, PeerError> {
        self.maybe_fail(target).await?;
        self.inner.get_object_as_of(target, key, timestamp).await
    }

    async fn get_object_range(
        &self,
        target: &RingId,
        key: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Vec<u8>>, PeerError> {
        self.maybe_fail(target).await?;
        self.inner.get_object_range(target, key, from, to).await
    }

    async fn delete(&self, target: &RingId, key: &str) -> Result<bool, PeerError> {
        self.maybe_fail(target).await?;
        self.inner.delete(target, key).await
    }

    async fn key_set(&self, target: &RingId) -> Result<Vec<KeyMetadata>, PeerError> {
        self.maybe_fail(target).await?;
        self.inner.key_set(target).await
    }

    async fn put_objects(&self, target: &RingId, batch: ObjectBatch) -> Result<(), PeerError> {
        self.maybe_fail(target).await?;
        self.inner.put_objects(target, batch).await
    }

    async fn make_replicas(&self, target: &RingId, batch: ObjectBatch) -> Result<(), PeerError> {
        self.maybe_fail(target).await?;
        self.inner.make_replicas(target, batch).await
    }
}

// ────────────────────────── Tests ──────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct OkPeers;

    #[async_trait::async_trait]
    impl PeerClient for OkPeers {
        async fn put_object(&self, _: &RingId, _: &str, _: &[u8]) -> Result<(), PeerError> {
            Ok(())
        }
        async fn get_object(&self, _: &RingId, _: &str) -> Result<Option<Vec<u8>>, PeerError> {
            Ok(None)
        }
        async fn get_object_as_of(
            &self,
            _: &RingId,
            _: &str,
            _: Timestamp,
        ) -> Result<Option<Vec<u8>>, PeerError> {
            Ok(None)
        }
        async fn get_object_range(
            &self,
            _: &RingId,
            _: &str,
            _: Timestamp,
            _: Timestamp,
        ) -> Result<Vec<Vec<u8>>, PeerError> {
            Ok(vec![])
        }
        async fn delete(&self, _: &RingId, _: &str) -> Result<bool, PeerError> {
            Ok(true)
        }
        async fn key_set(&self, _: &RingId) -> Result<Vec<KeyMetadata>, PeerError> {
            Ok(vec![])
        }
        async fn put_objects(&self, _: &RingId, _: ObjectBatch) -> Result<(), PeerError> {
            Ok(())
        }
        async fn make_replicas(&self, _: &RingId, _: ObjectBatch) -> Result<(), PeerError> {
            Ok(())
        }
    }

    fn chaos(config: ChaosPeerConfig) -> ChaosPeerClient<OkPeers> {
        ChaosPeerClient::new(Arc::new(OkPeers), config)
    }

    #[tokio::test]
    async fn test_chaos_passthrough() {
        let c = chaos(ChaosPeerConfig::default());
        let t = RingId::from_u64(1);
        assert!(c.put_object(&t, "k", b"v").await.is_ok());
        assert!(c.make_replicas(&t, ObjectBatch::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_chaos_fail_and_recover_node() {
        let c = chaos(ChaosPeerConfig::default());
        let t = RingId::from_u64(1);

        c.fail_node(t).await;
        assert!(c.make_replicas(&t, ObjectBatch::new()).await.is_err());
        assert!(c.get_object(&t, "k").await.is_err());

        // Other nodes still work
        let t2 = RingId::from_u64(2);
        assert!(c.put_objects(&t2, ObjectBatch::new()).await.is_ok());

        c.recover_node(t).await;
        assert!(c.make_replicas(&t, ObjectBatch::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_chaos_random_failure() {
        let c = chaos(ChaosPeerConfig {
            failure_rate: 1.0,
            ..Default::default()
        });
        let t = RingId::from_u64(1);
        for _ in 0..10 {
            assert!(c.delete(&t, "k").await.is_err());
        }

        c.set_failure_rate(0.0).await;
        assert!(c.delete(&t, "k").await.is_ok());
    }

    #[tokio::test]
    async fn test_chaos_latency() {
        let c = chaos(ChaosPeerConfig {
            latency: Duration::from_millis(20),
            ..Default::default()
        });
        let start = std::time::Instant::now();
        c.key_set(&RingId::from_u64(1)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
