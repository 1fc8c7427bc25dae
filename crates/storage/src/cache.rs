//! LRU cache of each key's newest index entry.
//!
//! Only a writer holding the key's locks publishes an entry, and only once
//! the index on disk records it. A hit is always safe to read from.

use crate::time_index::Span;
use lru::LruCache;
use parking_lot::Mutex;
use ringstore_common::Timestamp;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

/// The newest indexed write of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tip {
    pub timestamp: Timestamp,
    pub span: Span,
}

#[derive(Debug)]
pub struct OffsetCache {
    inner: Mutex<LruCache<String, Tip>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl OffsetCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<Tip> {
        let tip = self.inner.lock().get(key).copied();
        let m = ringstore_metrics::metrics();
        if tip.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            m.offset_cache_hits.inc();
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            m.offset_cache_misses.inc();
        }
        tip
    }

    /// Record `tip` as the newest durable entry for `key`. An older tip
    /// never replaces a newer one.
    pub fn publish(&self, key: &str, tip: Tip) {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.get_mut(key) {
            if existing.timestamp < tip.timestamp {
                *existing = tip;
            }
            return;
        }
        inner.put(key.to_string(), tip);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
