//! Replication coordinator: keeps each key's replica chain at full length.
//!
//! The coordinator:
//! 1. Stores client writes as rank 1 and extends the chain one hop at a time
//!    (`make_replicas`), each hop raising the rank until it reaches
//!    `replication_count`
//! 2. Hands keys over to a new predecessor (`put_objects`)
//! 3. Re-replicates to a new successor
//! 4. Takes ownership of a failed predecessor's keys
//!
//! Local writes are never rolled back when a peer fails; the failure is
//! logged, counted and returned, and the next topology event repairs the
//! chain.

use crate::peer_client::{with_timeout, ObjectBatch, PeerClient, PeerError};
use crate::service::ObjectStoreService;
use ringstore_common::{KeyMetadata, RingId, RingSpace, Timestamp};
use ringstore_config::StoreConfig;
use ringstore_ring::{RingEvent, RingView};
use ringstore_storage::{LocalStore, StorageError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Replication settings.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Total copies of each key, owner included.
    pub replication_count: u32,
    /// Deadline for each peer RPC.
    pub rpc_timeout: Duration,
}

impl ReplicationConfig {
    pub fn from_store_config(store: &StoreConfig) -> Self {
        Self {
            replication_count: store.replication_count,
            rpc_timeout: Duration::from_millis(store.rpc_timeout_ms),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self::from_store_config(&StoreConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("replica rank {rank} for {key} outside 1..={max}")]
    InvalidRank { key: String, rank: u32, max: u32 },
}

/// Per-node replication logic.
///
/// Generic over the ring view and the peer transport; tests use a fixed
/// ring and a recording transport.
pub struct ReplicationCoordinator<R: RingView, P: PeerClient> {
    store: Arc<LocalStore>,
    ring: Arc<R>,
    peers: Arc<P>,
    space: RingSpace,
    config: ReplicationConfig,
}

impl<R: RingView, P: PeerClient> std::fmt::Debug for ReplicationCoordinator<R, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationCoordinator")
            .field("local_id", &self.ring.local_id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<R: RingView, P: PeerClient> ReplicationCoordinator<R, P> {
    pub fn new(
        store: Arc<LocalStore>,
        ring: Arc<R>,
        peers: Arc<P>,
        space: RingSpace,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            store,
            ring,
            peers,
            space,
            config,
        }
    }

    pub fn local_id(&self) -> RingId {
        self.ring.local_id()
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn space(&self) -> RingSpace {
        self.space
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Client write: store as rank 1 and build the rest of the chain.
    pub async fn put_object(&self, key: &str, value: &[u8]) -> Result<(), ReplicationError> {
        let meta = KeyMetadata::primary(self.space.key(key));
        tracing::debug!("node {}: put {}", self.local_id(), meta.key);
        let mut batch = ObjectBatch::new();
        batch.insert(meta, value.to_vec());
        self.make_replicas(batch).await
    }

    /// Store `batch` under its received ranks, then send the next rank of
    /// every entry that is not yet at the end of the chain to our successor.
    ///
    /// Each hop strictly raises the rank and nothing is sent once it
    /// reaches `replication_count`, so a chain is at most that many hops.
    /// Every entry is committed here before anything is forwarded.
    /// Re-delivery replaces the catalog entry rather than duplicating it.
    pub async fn make_replicas(&self, batch: ObjectBatch) -> Result<(), ReplicationError> {
        self.check_ranks(&batch)?;
        let n = self.config.replication_count;

        let mut onward = ObjectBatch::new();
        for (meta, value) in batch {
            if self.absorb_wrapped(&meta, &value)? {
                continue;
            }
            self.store.put_replica(&meta, &value)?;
            if meta.replica_number < n {
                onward.insert(meta.with_rank(meta.replica_number + 1), value);
            }
        }

        if onward.is_empty() {
            return Ok(());
        }
        self.forward_replicas(onward).await
    }

    /// Store a migrated batch as is. Never forwards.
    pub async fn put_objects(&self, batch: ObjectBatch) -> Result<(), ReplicationError> {
        self.check_ranks(&batch)?;
        for (meta, value) in &batch {
            self.store.put_replica(meta, value)?;
        }
        tracing::debug!("node {}: accepted {} objects", self.local_id(), batch.len());
        Ok(())
    }

    /// Tombstone `key` here and along its chain. Returns `false` for a key
    /// this node never held.
    pub async fn delete(&self, key: &str) -> Result<bool, ReplicationError> {
        let meta = match self.store.metadata(key) {
            Some(meta) => meta,
            None if self.store.get(key)?.is_some() => KeyMetadata::primary(self.space.key(key)),
            None => return Ok(false),
        };
        let mut batch = ObjectBatch::new();
        batch.insert(meta, Vec::new());
        self.make_replicas(batch).await?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ReplicationError> {
        Ok(self.store.get(key)?)
    }

    pub fn get_as_of(
        &self,
        key: &str,
        timestamp: Timestamp,
    ) -> Result<Option<Vec<u8>>, ReplicationError> {
        Ok(self.store.get_as_of(key, timestamp)?)
    }

    pub fn get_range(
        &self,
        key: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Vec<u8>>, ReplicationError> {
        Ok(self.store.get_range(key, from, to)?)
    }

    pub fn key_set(&self) -> Vec<KeyMetadata> {
        self.store.key_set()
    }

    // -----------------------------------------------------------------------
    // Topology
    // -----------------------------------------------------------------------

    pub async fn handle_event(&self, event: RingEvent) -> Result<(), ReplicationError> {
        ringstore_metrics::metrics()
            .topology_events
            .with_label_values(&[event.kind()])
            .inc();
        tracing::info!("node {}: {}", self.local_id(), event);

        match event {
            RingEvent::NewPredecessor { previous, current } => {
                self.migrate_to_predecessor(previous, current).await
            }
            RingEvent::NewSuccessor { current, .. } => self.replicate_to_successor(current).await,
            RingEvent::SuccessorFailed {
                replacement: Some(next),
                ..
            } => self.replicate_to_successor(next).await,
            RingEvent::SuccessorFailed {
                failed,
                replacement: None,
            } => {
                // Chains through us stay one copy short until a new
                // successor is announced.
                tracing::warn!(
                    "node {}: successor {} failed with no replacement yet",
                    self.local_id(),
                    failed
                );
                Ok(())
            }
            RingEvent::PredecessorFailed { failed, .. } => self.take_over_from(failed).await,
        }
    }

    /// Consume topology events until the sender goes away.
    pub fn spawn_event_listener(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<RingEvent>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = this.handle_event(event).await {
                    tracing::warn!("node {}: {} not handled: {}", this.local_id(), event, e);
                }
            }
            tracing::debug!("node {}: event listener stopped", this.local_id());
        })
    }

    /// Hand the owned keys in `(previous, current]` to the new predecessor.
    /// Our copies stay, demoted to the first replica rank.
    async fn migrate_to_predecessor(
        &self,
        previous: Option<RingId>,
        current: RingId,
    ) -> Result<(), ReplicationError> {
        let local = self.local_id();
        if current == local {
            return Ok(());
        }
        let lower = previous.unwrap_or(local);
        let batch = self.latest_values(self.store.key_set().into_iter().filter(|meta| {
            meta.replica_number == 1 && meta.key.id.in_range(&lower, &current, false, true)
        }))?;
        if batch.is_empty() {
            return Ok(());
        }

        let moved: Vec<KeyMetadata> = batch.keys().cloned().collect();
        let count = moved.len();
        let sent = with_timeout(self.config.rpc_timeout, self.peers.put_objects(&current, batch)).await;
        self.note_failure(&sent, "put_objects", &current);
        sent?;

        ringstore_metrics::metrics()
            .objects_migrated
            .inc_by(count as u64);
        if self.config.replication_count >= 2 {
            for meta in &moved {
                self.store.set_replica_number(meta.name(), 2)?;
            }
        }
        tracing::info!("node {}: migrated {} keys to {}", local, count, current);
        Ok(())
    }

    /// Send every copy that is not at the end of its chain one rank further,
    /// to `successor`.
    async fn replicate_to_successor(&self, successor: RingId) -> Result<(), ReplicationError> {
        if successor == self.local_id() {
            return Ok(());
        }
        let n = self.config.replication_count;
        let batch = self.latest_values(
            self.store
                .key_set()
                .into_iter()
                .filter(|meta| meta.replica_number < n)
                .map(|meta| meta.with_rank(meta.replica_number + 1)),
        )?;
        if batch.is_empty() {
            return Ok(());
        }
        let count = batch.len();
        self.send_replicas(&successor, batch).await?;
        tracing::info!(
            "node {}: re-replicated {} keys to {}",
            self.local_id(),
            count,
            successor
        );
        Ok(())
    }

    /// Promote the keys `failed` owned (our rank 2 copies) and restore their
    /// chains from here.
    async fn take_over_from(&self, failed: RingId) -> Result<(), ReplicationError> {
        let promoted: Vec<KeyMetadata> = self
            .store
            .key_set()
            .into_iter()
            .filter(|meta| meta.replica_number == 2)
            .collect();
        if promoted.is_empty() {
            return Ok(());
        }
        for meta in &promoted {
            self.store.set_replica_number(meta.name(), 1)?;
        }
        tracing::info!(
            "node {}: took over {} keys from {}",
            self.local_id(),
            promoted.len(),
            failed
        );

        let Some(successor) = self.next_hop() else {
            return Ok(());
        };
        let batch = self.latest_values(promoted.iter().map(|meta| meta.with_rank(2)))?;
        if batch.is_empty() {
            return Ok(());
        }
        self.send_replicas(&successor, batch).await
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// On a ring with fewer nodes than `replication_count` a chain comes
    /// back round to the key's owner, which already holds it at a lower
    /// rank. That rank is kept and the chain ends here. Returns whether
    /// `meta` was such a copy.
    fn absorb_wrapped(&self, meta: &KeyMetadata, value: &[u8]) -> Result<bool, ReplicationError> {
        if meta.replica_number == 1 || !self.ring.is_responsible(&meta.key.id) {
            return Ok(false);
        }
        let Some(held) = self.store.metadata(meta.name()) else {
            return Ok(false);
        };
        if held.replica_number >= meta.replica_number {
            return Ok(false);
        }
        if self.store.get(meta.name())?.as_deref() != Some(value) {
            self.store.put_replica(&held, value)?;
        }
        tracing::debug!(
            "node {}: chain for {} wrapped at rank {}, keeping rank {}",
            self.local_id(),
            meta.key,
            meta.replica_number,
            held.replica_number
        );
        Ok(true)
    }

    fn next_hop(&self) -> Option<RingId> {
        let local = self.local_id();
        self.ring.successor().filter(|s| *s != local)
    }

    async fn forward_replicas(&self, onward: ObjectBatch) -> Result<(), ReplicationError> {
        match self.next_hop() {
            Some(successor) => self.send_replicas(&successor, onward).await,
            None => {
                tracing::debug!(
                    "node {}: no successor, {} replicas not forwarded",
                    self.local_id(),
                    onward.len()
                );
                Ok(())
            }
        }
    }

    async fn send_replicas(
        &self,
        target: &RingId,
        batch: ObjectBatch,
    ) -> Result<(), ReplicationError> {
        let count = batch.len();
        let sent = with_timeout(self.config.rpc_timeout, self.peers.make_replicas(target, batch)).await;
        self.note_failure(&sent, "make_replicas", target);
        sent?;
        ringstore_metrics::metrics()
            .replicas_forwarded
            .inc_by(count as u64);
        Ok(())
    }

    fn note_failure(&self, result: &Result<(), PeerError>, rpc: &str, target: &RingId) {
        if let Err(e) = result {
            ringstore_metrics::metrics().replication_failures.inc();
            tracing::warn!(
                "node {}: {} to {} failed: {}",
                self.local_id(),
                rpc,
                target,
                e
            );
        }
    }

    /// Pair each key with its newest local value. Keys with no value yet
    /// are skipped.
    fn latest_values(
        &self,
        metas: impl Iterator<Item = KeyMetadata>,
    ) -> Result<ObjectBatch, ReplicationError> {
        let mut batch = ObjectBatch::new();
        for meta in metas {
            if let Some(value) = self.store.get(meta.name())? {
                batch.insert(meta, value);
            }
        }
        Ok(batch)
    }

    fn check_ranks(&self, batch: &ObjectBatch) -> Result<(), ReplicationError> {
        let max = self.config.replication_count;
        match batch
            .keys()
            .find(|meta| meta.replica_number == 0 || meta.replica_number > max)
        {
            Some(meta) => Err(ReplicationError::InvalidRank {
                key: meta.name().to_string(),
                rank: meta.replica_number,
                max,
            }),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl<R: RingView, P: PeerClient> ObjectStoreService for ReplicationCoordinator<R, P> {
    fn node_id(&self) -> RingId {
        self.local_id()
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), ReplicationError> {
        self.put_object(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ReplicationError> {
        ReplicationCoordinator::get(self, key)
    }

    async fn get_as_of(
        &self,
        key: &str,
        timestamp: Timestamp,
    ) -> Result<Option<Vec<u8>>, ReplicationError> {
        ReplicationCoordinator::get_as_of(self, key, timestamp)
    }

    async fn get_range(
        &self,
        key: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Vec<u8>>, ReplicationError> {
        ReplicationCoordinator::get_range(self, key, from, to)
    }

    async fn delete(&self, key: &str) -> Result<bool, ReplicationError> {
        ReplicationCoordinator::delete(self, key).await
    }

    async fn key_set(&self) -> Result<Vec<KeyMetadata>, ReplicationError> {
        Ok(ReplicationCoordinator::key_set(self))
    }

    async fn put_objects(&self, batch: ObjectBatch) -> Result<(), ReplicationError> {
        ReplicationCoordinator::put_objects(self, batch).await
    }

    async fn make_replicas(&self, batch: ObjectBatch) -> Result<(), ReplicationError> {
        ReplicationCoordinator::make_replicas(self, batch).await
    }
}

// ────────────────────────── Tests ──────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use ringstore_common::RingKey;
    use ringstore_storage::{FsyncPolicy, StoreOptions};
    use tempfile::TempDir;

    /// Fixed neighbours; owns everything.
    struct FixedRing {
        local: RingId,
        successor: Option<RingId>,
    }

    impl RingView for FixedRing {
        fn local_id(&self) -> RingId {
            self.local
        }
        fn successor(&self) -> Option<RingId> {
            self.successor
        }
        fn predecessor(&self) -> Option<RingId> {
            None
        }
        fn responsible_node(&self, _key: &RingId) -> RingId {
            self.local
        }
    }

    #[derive(Debug, Clone)]
    struct Call {
        rpc: &'static str,
        target: RingId,
        batch: ObjectBatch,
    }

    #[derive(Default)]
    struct RecordingPeers {
        calls: Mutex<Vec<Call>>,
        fail: bool,
        hang: bool,
    }

    impl RecordingPeers {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        /// `make_replicas` is recorded and then never answers.
        fn hanging() -> Self {
            Self {
                hang: true,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn record(&self, rpc: &'static str, target: &RingId, batch: ObjectBatch) -> Result<(), PeerError> {
            self.calls.lock().push(Call {
                rpc,
                target: *target,
                batch,
            });
            if self.fail {
                Err(PeerError::RpcFailed("down".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait::async_trait]
    impl PeerClient for RecordingPeers {
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
            Ok(false)
        }
        async fn key_set(&self, _: &RingId) -> Result<Vec<KeyMetadata>, PeerError> {
            Ok(vec![])
        }
        async fn put_objects(&self, target: &RingId, batch: ObjectBatch) -> Result<(), PeerError> {
            self.record("put_objects", target, batch)
        }
        async fn make_replicas(&self, target: &RingId, batch: ObjectBatch) -> Result<(), PeerError> {
            let result = self.record("make_replicas", target, batch);
            if self.hang {
                std::future::pending::<()>().await;
            }
            result
        }
    }

    const LOCAL: u64 = 100;
    const NEXT: u64 = 200;

    type TestCoordinator = ReplicationCoordinator<FixedRing, RecordingPeers>;

    fn coordinator(
        dir: &TempDir,
        successor: Option<u64>,
        replication_count: u32,
        peers: RecordingPeers,
    ) -> (TestCoordinator, Arc<RecordingPeers>) {
        let options = StoreOptions::new(dir.path()).with_fsync(FsyncPolicy::None);
        let store = Arc::new(LocalStore::open(&options).unwrap());
        let ring = Arc::new(FixedRing {
            local: RingId::from_u64(LOCAL),
            successor: successor.map(RingId::from_u64),
        });
        let peers = Arc::new(peers);
        let config = ReplicationConfig {
            replication_count,
            rpc_timeout: Duration::from_secs(1),
        };
        let space = RingSpace::new(32).unwrap();
        (
            ReplicationCoordinator::new(store, ring, peers.clone(), space, config),
            peers,
        )
    }

    /// Metadata with a hand-placed ring position.
    fn placed(name: &str, id: u64, rank: u32) -> KeyMetadata {
        KeyMetadata::new(
            RingKey {
                name: name.to_string(),
                id: RingId::from_u64(id),
            },
            rank,
        )
    }

    fn batch_of(entries: &[(KeyMetadata, &[u8])]) -> ObjectBatch {
        entries
            .iter()
            .map(|(meta, value)| (meta.clone(), value.to_vec()))
            .collect()
    }

    fn ranks(c: &TestCoordinator) -> Vec<(String, u32)> {
        c.key_set()
            .into_iter()
            .map(|m| (m.key.name, m.replica_number))
            .collect()
    }

    fn sent_ranks(call: &Call) -> Vec<(String, u32)> {
        let mut out: Vec<_> = call
            .batch
            .keys()
            .map(|m| (m.key.name.clone(), m.replica_number))
            .collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn test_put_stores_primary_and_forwards_rank_two() {
        let dir = TempDir::new().unwrap();
        let (c, peers) = coordinator(&dir, Some(NEXT), 2, RecordingPeers::default());

        c.put_object("k", b"v").await.unwrap();

        assert_eq!(ranks(&c), vec![("k".to_string(), 1)]);
        assert_eq!(c.get("k").unwrap(), Some(b"v".to_vec()));

        let calls = peers.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].rpc, "make_replicas");
        assert_eq!(calls[0].target, RingId::from_u64(NEXT));
        assert_eq!(sent_ranks(&calls[0]), vec![("k".to_string(), 2)]);
        assert_eq!(calls[0].batch.values().next().unwrap(), b"v");
    }

    #[tokio::test]
    async fn test_single_copy_never_forwards() {
        let dir = TempDir::new().unwrap();
        let (c, peers) = coordinator(&dir, Some(NEXT), 1, RecordingPeers::default());

        c.put_object("k", b"v").await.unwrap();
        assert!(peers.calls().is_empty());
        assert_eq!(ranks(&c), vec![("k".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_last_rank_stops_the_chain() {
        let dir = TempDir::new().unwrap();
        let (c, peers) = coordinator(&dir, Some(NEXT), 3, RecordingPeers::default());

        let batch = batch_of(&[(placed("mid", 1, 2), b"a"), (placed("tail", 2, 3), b"b")]);
        c.make_replicas(batch).await.unwrap();

        let calls = peers.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(sent_ranks(&calls[0]), vec![("mid".to_string(), 3)]);
        assert_eq!(
            ranks(&c),
            vec![("mid".to_string(), 2), ("tail".to_string(), 3)]
        );
    }

    #[tokio::test]
    async fn test_out_of_range_rank_rejected() {
        let dir = TempDir::new().unwrap();
        let (c, peers) = coordinator(&dir, Some(NEXT), 2, RecordingPeers::default());

        for rank in [0, 3] {
            let batch = batch_of(&[(placed("ok", 1, 1), b"a"), (placed("bad", 2, rank), b"b")]);
            let err = c.make_replicas(batch.clone()).await.unwrap_err();
            assert!(matches!(err, ReplicationError::InvalidRank { .. }));
            let err = c.put_objects(batch).await.unwrap_err();
            assert!(matches!(err, ReplicationError::InvalidRank { .. }));
        }
        assert!(c.key_set().is_empty());
        assert!(peers.calls().is_empty());
    }

    #[tokio::test]
    async fn test_chain_failure_reported_local_write_kept() {
        let dir = TempDir::new().unwrap();
        let (c, _peers) = coordinator(&dir, Some(NEXT), 2, RecordingPeers::failing());

        let err = c.put_object("k", b"v").await.unwrap_err();
        assert!(matches!(err, ReplicationError::Peer(_)));
        assert_eq!(c.get("k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(ranks(&c), vec![("k".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_local_copy_committed_before_forwarding() {
        let dir = TempDir::new().unwrap();
        let (c, peers) = coordinator(&dir, Some(NEXT), 3, RecordingPeers::hanging());

        // The caller gives up while the successor is still busy.
        let put = tokio::time::timeout(Duration::from_millis(50), c.put_object("k", b"v")).await;
        assert!(put.is_err());
        assert_eq!(c.get("k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(ranks(&c), vec![("k".to_string(), 1)]);
        assert_eq!(peers.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_wrapped_copy_keeps_owner_rank() {
        let dir = TempDir::new().unwrap();
        let (c, peers) = coordinator(&dir, Some(NEXT), 3, RecordingPeers::default());
        c.put_object("k", b"v").await.unwrap();

        // The rank 3 copy comes back round to the owner.
        let wrapped = KeyMetadata::new(c.space().key("k"), 3);
        c.make_replicas(batch_of(&[(wrapped.clone(), b"v")]))
            .await
            .unwrap();
        assert_eq!(ranks(&c), vec![("k".to_string(), 1)]);
        assert_eq!(c.get_range("k", 0, u64::MAX).unwrap(), vec![b"v".to_vec()]);
        assert_eq!(peers.calls().len(), 1);

        // A different value still lands, under the owner's rank.
        c.make_replicas(batch_of(&[(wrapped, b"w")])).await.unwrap();
        assert_eq!(ranks(&c), vec![("k".to_string(), 1)]);
        assert_eq!(c.get("k").unwrap(), Some(b"w".to_vec()));
        assert_eq!(peers.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_alone_in_ring_stores_locally() {
        let dir = TempDir::new().unwrap();
        let (c, peers) = coordinator(&dir, None, 3, RecordingPeers::default());
        c.put_object("k", b"v").await.unwrap();
        assert!(peers.calls().is_empty());

        // A successor pointing back at us counts as alone.
        let dir = TempDir::new().unwrap();
        let (c, peers) = coordinator(&dir, Some(LOCAL), 3, RecordingPeers::default());
        c.put_object("k", b"v").await.unwrap();
        assert!(peers.calls().is_empty());
    }

    #[tokio::test]
    async fn test_put_objects_never_forwards() {
        let dir = TempDir::new().unwrap();
        let (c, peers) = coordinator(&dir, Some(NEXT), 2, RecordingPeers::default());

        c.put_objects(batch_of(&[(placed("m", 5, 1), b"moved")]))
            .await
            .unwrap();
        assert!(peers.calls().is_empty());
        assert_eq!(ranks(&c), vec![("m".to_string(), 1)]);
        assert_eq!(c.get("m").unwrap(), Some(b"moved".to_vec()));
    }

    #[tokio::test]
    async fn test_redelivery_replaces_rank() {
        let dir = TempDir::new().unwrap();
        let (c, _peers) = coordinator(&dir, None, 3, RecordingPeers::default());

        c.make_replicas(batch_of(&[(placed("k", 5, 3), b"a")]))
            .await
            .unwrap();
        c.make_replicas(batch_of(&[(placed("k", 5, 2), b"b")]))
            .await
            .unwrap();
        assert_eq!(ranks(&c), vec![("k".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_delete_propagates_tombstone() {
        let dir = TempDir::new().unwrap();
        let (c, peers) = coordinator(&dir, Some(NEXT), 2, RecordingPeers::default());

        assert!(!c.delete("missing").await.unwrap());
        assert!(peers.calls().is_empty());

        c.put_object("k", b"v").await.unwrap();
        assert!(c.delete("k").await.unwrap());
        assert_eq!(c.get("k").unwrap(), Some(vec![]));

        let calls = peers.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(sent_ranks(&calls[1]), vec![("k".to_string(), 2)]);
        assert!(calls[1].batch.values().all(|v| v.is_empty()));
    }

    #[tokio::test]
    async fn test_new_predecessor_migrates_owned_keys_in_range() {
        let dir = TempDir::new().unwrap();
        let (c, peers) = coordinator(&dir, Some(NEXT), 2, RecordingPeers::default());

        // Old predecessor 10, new one 50, we are 100.
        c.put_objects(batch_of(&[
            (placed("below", 5, 1), b"x"),
            (placed("moved", 30, 1), b"m"),
            (placed("edge", 50, 1), b"e"),
            (placed("stays", 70, 1), b"s"),
            (placed("replica", 40, 2), b"r"),
        ]))
        .await
        .unwrap();

        c.handle_event(RingEvent::NewPredecessor {
            previous: Some(RingId::from_u64(10)),
            current: RingId::from_u64(50),
        })
        .await
        .unwrap();

        let calls = peers.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].rpc, "put_objects");
        assert_eq!(calls[0].target, RingId::from_u64(50));
        assert_eq!(
            sent_ranks(&calls[0]),
            vec![("edge".to_string(), 1), ("moved".to_string(), 1)]
        );

        // Copies are kept, one rank down.
        let mut after = ranks(&c);
        after.sort();
        assert_eq!(
            after,
            vec![
                ("below".to_string(), 1),
                ("edge".to_string(), 2),
                ("moved".to_string(), 2),
                ("replica".to_string(), 2),
                ("stays".to_string(), 1),
            ]
        );
        assert_eq!(c.get("moved").unwrap(), Some(b"m".to_vec()));
    }

    #[tokio::test]
    async fn test_failed_migration_keeps_ranks() {
        let dir = TempDir::new().unwrap();
        let (c, _peers) = coordinator(&dir, Some(NEXT), 2, RecordingPeers::failing());
        c.put_objects(batch_of(&[(placed("moved", 30, 1), b"m")]))
            .await
            .unwrap();

        let result = c
            .handle_event(RingEvent::NewPredecessor {
                previous: Some(RingId::from_u64(10)),
                current: RingId::from_u64(50),
            })
            .await;
        assert!(result.is_err());
        assert_eq!(ranks(&c), vec![("moved".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_new_successor_rereplicates_short_chains() {
        let dir = TempDir::new().unwrap();
        let (c, peers) = coordinator(&dir, Some(NEXT), 3, RecordingPeers::default());
        c.put_objects(batch_of(&[
            (placed("a", 1, 1), b"a"),
            (placed("b", 2, 2), b"b"),
            (placed("c", 3, 3), b"c"),
        ]))
        .await
        .unwrap();

        c.handle_event(RingEvent::NewSuccessor {
            previous: Some(RingId::from_u64(NEXT)),
            current: RingId::from_u64(150),
        })
        .await
        .unwrap();

        let calls = peers.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].rpc, "make_replicas");
        assert_eq!(calls[0].target, RingId::from_u64(150));
        assert_eq!(
            sent_ranks(&calls[0]),
            vec![("a".to_string(), 2), ("b".to_string(), 3)]
        );
        // Local ranks do not move.
        let mut after = ranks(&c);
        after.sort();
        assert_eq!(
            after,
            vec![
                ("a".to_string(), 1),
                ("b".to_string(), 2),
                ("c".to_string(), 3)
            ]
        );
    }

    #[tokio::test]
    async fn test_successor_failed_follows_replacement() {
        let dir = TempDir::new().unwrap();
        let (c, peers) = coordinator(&dir, Some(NEXT), 2, RecordingPeers::default());
        c.put_objects(batch_of(&[(placed("a", 1, 1), b"a")]))
            .await
            .unwrap();

        c.handle_event(RingEvent::SuccessorFailed {
            failed: RingId::from_u64(NEXT),
            replacement: None,
        })
        .await
        .unwrap();
        assert!(peers.calls().is_empty());

        c.handle_event(RingEvent::SuccessorFailed {
            failed: RingId::from_u64(NEXT),
            replacement: Some(RingId::from_u64(300)),
        })
        .await
        .unwrap();
        let calls = peers.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].target, RingId::from_u64(300));
    }

    #[tokio::test]
    async fn test_predecessor_failed_promotes_and_restores_chain() {
        let dir = TempDir::new().unwrap();
        let (c, peers) = coordinator(&dir, Some(NEXT), 2, RecordingPeers::default());
        c.put_objects(batch_of(&[
            (placed("mine", 90, 1), b"m"),
            (placed("orphan", 40, 2), b"o"),
        ]))
        .await
        .unwrap();

        c.handle_event(RingEvent::PredecessorFailed {
            failed: RingId::from_u64(50),
            replacement: Some(RingId::from_u64(10)),
        })
        .await
        .unwrap();

        let mut after = ranks(&c);
        after.sort();
        assert_eq!(
            after,
            vec![("mine".to_string(), 1), ("orphan".to_string(), 1)]
        );
        let calls = peers.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].target, RingId::from_u64(NEXT));
        assert_eq!(sent_ranks(&calls[0]), vec![("orphan".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_event_listener_drains_channel() {
        let dir = TempDir::new().unwrap();
        let (c, peers) = coordinator(&dir, Some(NEXT), 2, RecordingPeers::default());
        c.put_objects(batch_of(&[(placed("a", 1, 1), b"a")]))
            .await
            .unwrap();
        let c = Arc::new(c);

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = c.spawn_event_listener(rx);
        tx.send(RingEvent::NewSuccessor {
            previous: None,
            current: RingId::from_u64(NEXT),
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(peers.calls().len(), 1);
    }
}
