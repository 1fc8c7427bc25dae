//! Local store: the per-key logs plus the key catalog behind one API.

use crate::catalog::{MetadataCatalog, CATALOG_FILE};
use crate::error::StorageError;
use crate::fsio::FsyncPolicy;
use crate::keyed_log::KeyedLog;
use ringstore_common::{KeyMetadata, Timestamp};
use std::path::{Path, PathBuf};

/// Settings for [`LocalStore::open`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub data_dir: PathBuf,
    pub fsync: FsyncPolicy,
    pub index_fanout: usize,
    pub offset_cache_capacity: usize,
}

impl StoreOptions {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            fsync: FsyncPolicy::Always,
            index_fanout: 16,
            offset_cache_capacity: 1024,
        }
    }

    pub fn with_fsync(mut self, fsync: FsyncPolicy) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn with_index_fanout(mut self, fanout: usize) -> Self {
        self.index_fanout = fanout;
        self
    }

    pub fn with_offset_cache_capacity(mut self, capacity: usize) -> Self {
        self.offset_cache_capacity = capacity;
        self
    }
}

/// All operations are synchronous (blocking I/O). The async boundary is at
/// the caller.
#[derive(Debug)]
pub struct LocalStore {
    log: KeyedLog,
    catalog: MetadataCatalog,
}

impl LocalStore {
    pub fn open(options: &StoreOptions) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&options.data_dir)?;
        let log = KeyedLog::open(
            &options.data_dir,
            options.index_fanout,
            options.fsync,
            options.offset_cache_capacity,
        )?;
        let catalog = MetadataCatalog::open(&options.data_dir.join(CATALOG_FILE), options.fsync)?;
        tracing::info!(
            "local store opened: {} keys at {:?}",
            catalog.len(),
            options.data_dir
        );
        Ok(Self { log, catalog })
    }

    pub fn log(&self) -> &KeyedLog {
        &self.log
    }

    /// Newest value; `Some(empty)` after a delete, `None` if never written.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        ringstore_metrics::metrics().store_gets.inc();
        self.log.read_latest(key)
    }

    /// Value in effect at `timestamp`.
    pub fn get_as_of(&self, key: &str, timestamp: Timestamp) -> Result<Option<Vec<u8>>, StorageError> {
        ringstore_metrics::metrics().store_gets.inc();
        self.log.read_as_of(key, timestamp)
    }

    /// Every value written in `[from, to]`, oldest first.
    pub fn get_range(
        &self,
        key: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Vec<u8>>, StorageError> {
        ringstore_metrics::metrics().store_gets.inc();
        self.log.read_range(key, from, to)
    }

    /// Register the key and append `value`. An existing catalog entry keeps
    /// its rank. Returns the write timestamp.
    ///
    /// The catalog entry is written first, so a value is never readable
    /// while its key is missing from [`key_set`](Self::key_set).
    pub fn put(&self, meta: &KeyMetadata, value: &[u8]) -> Result<Timestamp, StorageError> {
        self.log.with_key_locked(meta.name(), |locked| {
            self.catalog.insert(meta.clone())?;
            let tip = locked.append_now(value)?;
            ringstore_metrics::metrics().store_puts.inc();
            Ok(tip.timestamp)
        })
    }

    /// Like [`put`](Self::put), but the key's rank becomes `meta`'s rank
    /// whether or not it was already held.
    pub fn put_replica(&self, meta: &KeyMetadata, value: &[u8]) -> Result<Timestamp, StorageError> {
        self.log.with_key_locked(meta.name(), |locked| {
            self.catalog.upsert(meta.clone())?;
            let tip = locked.append_now(value)?;
            ringstore_metrics::metrics().store_puts.inc();
            Ok(tip.timestamp)
        })
    }

    /// Record a zero-length tombstone. A key that was never written is left
    /// alone; returns whether a tombstone was written.
    pub fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.log.with_key_locked(key, |locked| {
            if locked.tip()?.is_none() {
                return Ok(false);
            }
            locked.append_now(&[])?;
            ringstore_metrics::metrics().store_deletes.inc();
            Ok(true)
        })
    }

    /// Every locally held key with its rank, ordered by key. A key whose
    /// first write failed after it was listed has no value yet.
    pub fn key_set(&self) -> Vec<KeyMetadata> {
        self.catalog.snapshot()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.catalog.contains(key)
    }

    pub fn metadata(&self, key: &str) -> Option<KeyMetadata> {
        self.catalog.get(key)
    }

    /// Move an already held key to another rank.
    pub fn set_replica_number(&self, key: &str, rank: u32) -> Result<bool, StorageError> {
        self.catalog.set_replica_number(key, rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringstore_common::{now_millis, RingSpace};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> LocalStore {
        let options = StoreOptions::new(dir.path())
            .with_fsync(FsyncPolicy::None)
            .with_index_fanout(4);
        LocalStore::open(&options).unwrap()
    }

    fn meta(name: &str, rank: u32) -> KeyMetadata {
        KeyMetadata::new(RingSpace::new(32).unwrap().key(name), rank)
    }

    #[test]
    fn test_put_get() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.put(&meta("k", 1), b"hello").unwrap();
        assert_eq!(store.get("k").unwrap().unwrap(), b"hello");
        assert_eq!(store.get("other").unwrap(), None);
        assert!(store.contains_key("k"));
    }

    #[test]
    fn test_put_delete_put_range() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let start = now_millis();
        store.put(&meta("k", 1), b"data").unwrap();
        assert!(store.delete("k").unwrap());
        let last = store.put(&meta("k", 1), b"stringdata").unwrap();

        let values = store.get_range("k", start, last).unwrap();
        assert_eq!(
            values,
            vec![b"data".to_vec(), Vec::new(), b"stringdata".to_vec()]
        );
    }

    #[test]
    fn test_delete_semantics() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert!(!store.delete("never").unwrap());
        assert_eq!(store.get("never").unwrap(), None);
        assert!(!store.log().exists("never"));

        let t1 = store.put(&meta("k", 1), b"v").unwrap();
        assert!(store.delete("k").unwrap());
        assert_eq!(store.get("k").unwrap(), Some(Vec::new()));
        assert_eq!(store.get_as_of("k", t1).unwrap().unwrap(), b"v");
        assert!(store.contains_key("k"), "deleted keys stay in the catalog");
    }

    #[test]
    fn test_as_of_before_creation_is_absent() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let t = store.put(&meta("k", 1), b"v").unwrap();
        assert_eq!(store.get_as_of("k", t - 1).unwrap(), None);
        assert_eq!(store.get_as_of("k", t).unwrap().unwrap(), b"v");
    }

    #[test]
    fn test_put_keeps_first_rank_put_replica_replaces() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.put(&meta("k", 2), b"a").unwrap();
        store.put(&meta("k", 1), b"b").unwrap();
        assert_eq!(store.metadata("k").unwrap().replica_number, 2);

        store.put_replica(&meta("k", 1), b"c").unwrap();
        assert_eq!(store.metadata("k").unwrap().replica_number, 1);
        assert_eq!(store.get("k").unwrap().unwrap(), b"c");
        assert_eq!(store.key_set().len(), 1);

        assert!(store.set_replica_number("k", 2).unwrap());
        assert_eq!(store.metadata("k").unwrap().replica_number, 2);
        assert!(store.metadata("missing").is_none());
    }

    #[test]
    fn test_failed_catalog_write_leaves_value_unwritten() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.put(&meta("listed", 1), b"a").unwrap();

        // A directory in the catalog's place makes every rewrite fail.
        let catalog = dir.path().join(CATALOG_FILE);
        fs::remove_file(&catalog).unwrap();
        fs::create_dir(&catalog).unwrap();
        fs::write(catalog.join("occupied"), b"x").unwrap();

        assert!(store.put(&meta("k", 1), b"v").is_err());
        assert!(store.put_replica(&meta("k", 2), b"v").is_err());
        assert_eq!(store.get("k").unwrap(), None);
        assert!(!store.log().exists("k"));
        assert!(!store.contains_key("k"));

        // Already listed, so no catalog write is needed.
        store.put(&meta("listed", 1), b"b").unwrap();
        assert_eq!(store.get("listed").unwrap().unwrap(), b"b");

        fs::remove_dir_all(&catalog).unwrap();
        store.put(&meta("k", 1), b"v").unwrap();
        assert_eq!(store.get("k").unwrap().unwrap(), b"v");
        let names: Vec<String> = store.key_set().into_iter().map(|m| m.key.name).collect();
        assert_eq!(names, vec!["k".to_string(), "listed".to_string()]);
    }

    #[test]
    fn test_reopen_restores_catalog_and_data() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            store.put(&meta("a", 1), b"1").unwrap();
            store.put(&meta("b", 2), b"2").unwrap();
        }
        let store = open(&dir);
        let keys: Vec<(String, u32)> = store
            .key_set()
            .into_iter()
            .map(|m| (m.key.name, m.replica_number))
            .collect();
        assert_eq!(keys, vec![("a".to_string(), 1), ("b".to_string(), 2)]);
        assert_eq!(store.get("b").unwrap().unwrap(), b"2");
    }

    #[test]
    fn test_concurrent_puts_same_key_lose_nothing() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open(&dir));
        let threads: Vec<_> = (0..6)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..10 {
                        store
                            .put(&meta("hot", 1), format!("{}:{}", t, i).as_bytes())
                            .unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(store.get_range("hot", 0, u64::MAX).unwrap().len(), 60);
        assert_eq!(store.key_set().len(), 1);
    }

    #[test]
    fn test_concurrent_distinct_keys_all_listed() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open(&dir));
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..16 {
                        store.put(&meta(&format!("k{}-{}", t, i), 1), b"x").unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(store.key_set().len(), 128);
    }
}
