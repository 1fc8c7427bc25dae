//! Lazily created per-file exclusive locks.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One mutex per file path, created on first use and kept for the life of
/// the table. Distinct paths never contend.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding `path`.
    pub fn get(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
