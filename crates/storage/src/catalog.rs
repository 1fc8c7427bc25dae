//! Durable set of locally held keys and their replica ranks.
//!
//! The whole set is rewritten on every change (temp file + rename) under a
//! single mutex that is independent of the per-key file locks. The file is
//! one frame: `[4-byte CRC32][4-byte length][JSON payload]`.

use crate::error::StorageError;
use crate::fsio::{self, FsyncPolicy};
use crc32fast::Hasher;
use parking_lot::Mutex;
use ringstore_common::KeyMetadata;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const CATALOG_FILE: &str = "catalog.meta";

#[derive(Debug)]
pub struct MetadataCatalog {
    path: PathBuf,
    fsync: FsyncPolicy,
    entries: Mutex<HashMap<String, KeyMetadata>>,
}

impl MetadataCatalog {
    /// Open the catalog at `path`, loading any existing contents.
    pub fn open(path: &Path, fsync: FsyncPolicy) -> Result<Self, StorageError> {
        let entries = match fs::read(path) {
            Ok(bytes) => decode(path, &bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!("catalog opened: {} keys at {:?}", entries.len(), path);
        Ok(Self {
            path: path.to_path_buf(),
            fsync,
            entries: Mutex::new(entries),
        })
    }

    /// Add `meta` unless an entry for the same key already exists.
    /// Returns whether it was added.
    pub fn insert(&self, meta: KeyMetadata) -> Result<bool, StorageError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(meta.name()) {
            return Ok(false);
        }
        let mut next = entries.clone();
        next.insert(meta.name().to_string(), meta);
        self.persist(&next)?;
        *entries = next;
        Ok(true)
    }

    /// Insert or replace the entry for `meta`'s key. Returns the previous
    /// rank, if any.
    pub fn upsert(&self, meta: KeyMetadata) -> Result<Option<u32>, StorageError> {
        let mut entries = self.entries.lock();
        let previous = entries.get(meta.name()).map(|m| m.replica_number);
        if previous == Some(meta.replica_number) {
            return Ok(previous);
        }
        let mut next = entries.clone();
        next.insert(meta.name().to_string(), meta);
        self.persist(&next)?;
        *entries = next;
        Ok(previous)
    }

    /// Change the rank of an existing entry. Returns `false` if the key is
    /// not in the catalog.
    pub fn set_replica_number(&self, key: &str, rank: u32) -> Result<bool, StorageError> {
        let mut entries = self.entries.lock();
        let Some(current) = entries.get(key) else {
            return Ok(false);
        };
        if current.replica_number == rank {
            return Ok(true);
        }
        let mut next = entries.clone();
        if let Some(meta) = next.get_mut(key) {
            meta.replica_number = rank;
        }
        self.persist(&next)?;
        *entries = next;
        Ok(true)
    }

    pub fn get(&self, key: &str) -> Option<KeyMetadata> {
        self.entries.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Every entry, ordered by key.
    pub fn snapshot(&self) -> Vec<KeyMetadata> {
        let mut all: Vec<KeyMetadata> = self.entries.lock().values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, entries: &HashMap<String, KeyMetadata>) -> Result<(), StorageError> {
        let mut list: Vec<&KeyMetadata> = entries.values().collect();
        list.sort_by(|a, b| a.name().cmp(b.name()));
        let payload = serde_json::to_vec(&list)?;

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);

        fsio::replace_file(&self.path, &frame, self.fsync)?;
        Ok(())
    }
}

fn decode(path: &Path, bytes: &[u8]) -> Result<HashMap<String, KeyMetadata>, StorageError> {
    let corrupt = |reason: String| StorageError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    if bytes.len() < 8 {
        return Err(corrupt(format!("{} bytes is shorter than the frame header", bytes.len())));
    }
    let expected = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let payload = &bytes[8..];
    if payload.len() != len {
        return Err(corrupt(format!(
            "frame declares {} bytes, found {}",
            len,
            payload.len()
        )));
    }

    let mut hasher = Hasher::new();
    hasher.update(payload);
    let actual = hasher.finalize();
    if actual != expected {
        return Err(corrupt(format!(
            "CRC mismatch: expected {:#010x}, got {:#010x}",
            expected, actual
        )));
    }

    let list: Vec<KeyMetadata> = serde_json::from_slice(payload)?;
    Ok(list
        .into_iter()
        .map(|m| (m.name().to_string(), m))
        .collect())
}
