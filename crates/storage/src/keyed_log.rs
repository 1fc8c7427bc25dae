//! Per-key append-only log: a data file of concatenated values plus an
//! index file mapping write timestamps to end offsets.
//!
//! Writers for one key are serialized by two locks from the [`LockTable`],
//! one per file, always taken data-then-index. Readers take no locks: the
//! index only changes by atomic rename after the data bytes are flushed,
//! so a reader sees either the old or the new history, never a torn one.
//! Only a writer holding the locks publishes to the offset cache; readers
//! that miss the cache read the index tail without caching it.

use crate::cache::{OffsetCache, Tip};
use crate::error::StorageError;
use crate::fsio::{self, FsyncPolicy};
use crate::locks::LockTable;
use crate::time_index::{IndexEntry, IndexError, Span, TimeIndex, HEADER_LEN, RECORD_LEN};
use ringstore_common::{now_millis, Timestamp};
use ringstore_metrics::{phase, start_storage_timer};
use sha1::{Digest, Sha1};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const DATA_DIR: &str = "data";
pub const INDEX_DIR: &str = "index";

/// Where a key's files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPaths {
    pub data: PathBuf,
    pub index: PathBuf,
}

pub struct KeyedLog {
    root: PathBuf,
    fanout: usize,
    fsync: FsyncPolicy,
    locks: LockTable,
    cache: OffsetCache,
}

impl std::fmt::Debug for KeyedLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLog")
            .field("root", &self.root)
            .field("fanout", &self.fanout)
            .field("fsync", &self.fsync)
            .finish_non_exhaustive()
    }
}

impl KeyedLog {
    /// Open (creating if needed) the log rooted at `root`.
    pub fn open(
        root: &Path,
        fanout: usize,
        fsync: FsyncPolicy,
        cache_capacity: usize,
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(root.join(DATA_DIR))?;
        fs::create_dir_all(root.join(INDEX_DIR))?;
        Ok(Self {
            root: root.to_path_buf(),
            fanout,
            fsync,
            locks: LockTable::new(),
            cache: OffsetCache::new(cache_capacity),
        })
    }

    /// File locations for `key`. Names are the hex SHA-1 of the key, fanned
    /// out by its first two and last two characters.
    pub fn paths(&self, key: &str) -> KeyPaths {
        let stem = hex::encode(Sha1::digest(key.as_bytes()));
        let head = &stem[..2];
        let tail = &stem[stem.len() - 2..];
        KeyPaths {
            data: self
                .root
                .join(DATA_DIR)
                .join(head)
                .join(tail)
                .join(format!("{}.data", stem)),
            index: self
                .root
                .join(INDEX_DIR)
                .join(head)
                .join(tail)
                .join(format!("{}.index", stem)),
        }
    }

    pub fn cache(&self) -> &OffsetCache {
        &self.cache
    }

    /// Run `f` while holding both of `key`'s file locks.
    pub fn with_key_locked<T, E>(
        &self,
        key: &str,
        f: impl FnOnce(&mut LockedKey<'_>) -> Result<T, E>,
    ) -> Result<T, E> {
        let paths = self.paths(key);
        let data_lock = self.locks.get(&paths.data);
        let index_lock = self.locks.get(&paths.index);
        let _data = data_lock.lock();
        let _index = index_lock.lock();
        let mut locked = LockedKey {
            log: self,
            key,
            paths,
        };
        f(&mut locked)
    }

    /// Append `value` at an explicit timestamp, which must be newer than
    /// every timestamp already indexed for `key`.
    pub fn append(&self, key: &str, value: &[u8], timestamp: Timestamp) -> Result<Tip, StorageError> {
        self.with_key_locked(key, |locked| locked.append(value, timestamp))
    }

    /// Append `value` stamped with the current time (taken under the lock).
    pub fn append_now(&self, key: &str, value: &[u8]) -> Result<Tip, StorageError> {
        self.with_key_locked(key, |locked| locked.append_now(value))
    }

    /// Whether anything was ever written for `key`.
    pub fn exists(&self, key: &str) -> bool {
        self.paths(key).index.exists()
    }

    /// The newest entry for `key`.
    pub fn latest_tip(&self, key: &str) -> Result<Option<Tip>, StorageError> {
        self.tip_for(key, &self.paths(key))
    }

    /// Deserialize `key`'s full index.
    pub fn load_index(&self, key: &str) -> Result<Option<TimeIndex>, StorageError> {
        load_index_at(&self.paths(key).index)
    }

    /// Newest value. `Some(empty)` is a tombstone; `None` means never written.
    pub fn read_latest(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let paths = self.paths(key);
        match self.tip_for(key, &paths)? {
            Some(tip) => Ok(Some(read_span(&paths.data, tip.span)?)),
            None => Ok(None),
        }
    }

    /// Value in effect at `timestamp`, or `None` if the key did not exist yet.
    pub fn read_as_of(
        &self,
        key: &str,
        timestamp: Timestamp,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let paths = self.paths(key);
        if let Some(tip) = self.cache.get(key) {
            if timestamp >= tip.timestamp {
                return Ok(Some(read_span(&paths.data, tip.span)?));
            }
        }
        let Some(index) = load_index_at(&paths.index)? else {
            return Ok(None);
        };
        match index.as_of(timestamp) {
            Some(span) => Ok(Some(read_span(&paths.data, span)?)),
            None => Ok(None),
        }
    }

    /// Every value written in `[from, to]`, oldest first.
    pub fn read_range(
        &self,
        key: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Vec<u8>>, StorageError> {
        let paths = self.paths(key);
        let Some(index) = load_index_at(&paths.index)? else {
            return Ok(Vec::new());
        };
        read_spans(&paths.data, &index.range(from, to))
    }

    fn tip_for(&self, key: &str, paths: &KeyPaths) -> Result<Option<Tip>, StorageError> {
        if let Some(tip) = self.cache.get(key) {
            return Ok(Some(tip));
        }
        read_tip_at(&paths.index)
    }
}

/// A key whose data and index locks are held by the current thread.
#[derive(Debug)]
pub struct LockedKey<'a> {
    log: &'a KeyedLog,
    key: &'a str,
    paths: KeyPaths,
}

impl LockedKey<'_> {
    pub fn key(&self) -> &str {
        self.key
    }

    /// The newest entry, read from the index file rather than the cache.
    pub fn tip(&self) -> Result<Option<Tip>, StorageError> {
        let tip = read_tip_at(&self.paths.index)?;
        if let Some(tip) = tip {
            self.log.cache.publish(self.key, tip);
        }
        Ok(tip)
    }

    pub fn append(&mut self, value: &[u8], timestamp: Timestamp) -> Result<Tip, StorageError> {
        let tip = self.tip()?;
        if let Some(t) = tip {
            if timestamp <= t.timestamp {
                return Err(IndexError::NonMonotonic {
                    last: t.timestamp,
                    got: timestamp,
                }
                .into());
            }
        }
        self.write(tip, value, timestamp)
    }

    /// Stamp with the wall clock, nudged past the previous write if the
    /// clock has not advanced.
    pub fn append_now(&mut self, value: &[u8]) -> Result<Tip, StorageError> {
        let tip = self.tip()?;
        let now = now_millis();
        let timestamp = match tip {
            Some(t) if now <= t.timestamp => t.timestamp + 1,
            _ => now,
        };
        self.write(tip, value, timestamp)
    }

    fn write(
        &mut self,
        tip: Option<Tip>,
        value: &[u8],
        timestamp: Timestamp,
    ) -> Result<Tip, StorageError> {
        let start = tip.map(|t| t.span.end).unwrap_or(0);
        let end = start + value.len() as u64;

        self.write_data(start, value)?;
        self.write_index(
            IndexEntry {
                timestamp,
                end_offset: end,
            },
            tip.is_some(),
        )?;

        let tip = Tip {
            timestamp,
            span: Span { start, end },
        };
        self.log.cache.publish(self.key, tip);
        Ok(tip)
    }

    fn write_data(&self, start: u64, value: &[u8]) -> Result<(), StorageError> {
        let _timer = start_storage_timer(phase::DATA_WRITE);
        let path = &self.paths.data;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        let len = file.metadata()?.len();
        if len < start {
            return Err(StorageError::Corrupt {
                path: path.clone(),
                reason: format!("data file is {} bytes but the index ends at {}", len, start),
            });
        }
        if len > start {
            // Left behind by a write whose index never landed.
            tracing::debug!(
                "discarding {} unindexed bytes from {:?}",
                len - start,
                path
            );
            file.set_len(start)?;
        }

        file.seek(SeekFrom::Start(start))?;
        file.write_all(value)?;
        fsio::sync_file(&file, self.log.fsync)?;
        Ok(())
    }

    fn write_index(&self, entry: IndexEntry, has_previous: bool) -> Result<(), StorageError> {
        let _timer = start_storage_timer(phase::INDEX_WRITE);
        let dest = &self.paths.index;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = fsio::temp_path(dest);
        if let Err(e) = self.stage_index(&tmp, entry, has_previous) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        fsio::commit_rename(&tmp, dest, self.log.fsync)?;
        Ok(())
    }

    /// Copy the current index to `tmp` and add one record.
    fn stage_index(
        &self,
        tmp: &Path,
        entry: IndexEntry,
        has_previous: bool,
    ) -> Result<(), StorageError> {
        if has_previous {
            fs::copy(&self.paths.index, tmp)?;
        } else {
            fs::write(tmp, TimeIndex::encode_header(self.log.fanout))?;
        }
        let mut file = OpenOptions::new().append(true).open(tmp)?;
        file.write_all(&TimeIndex::encode_record(entry))?;
        fsio::sync_file(&file, self.log.fsync)?;
        Ok(())
    }
}

fn load_index_at(path: &Path) -> Result<Option<TimeIndex>, StorageError> {
    let _timer = start_storage_timer(phase::INDEX_READ);
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let index = TimeIndex::decode(&bytes).map_err(|e| corrupt_index(path, e))?;
    Ok(Some(index))
}

/// The newest entry of the index at `path`, from its last two records.
fn read_tip_at(path: &Path) -> Result<Option<Tip>, StorageError> {
    let _timer = start_storage_timer(phase::INDEX_READ);
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata()?.len();
    if len < HEADER_LEN as u64 {
        return Err(corrupt_index(
            path,
            IndexError::Corrupt(format!("{} bytes is shorter than the header", len)),
        ));
    }
    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header)?;
    TimeIndex::decode_header(&header).map_err(|e| corrupt_index(path, e))?;

    let body = len - HEADER_LEN as u64;
    let record_len = RECORD_LEN as u64;
    if body % record_len != 0 {
        return Err(corrupt_index(
            path,
            IndexError::Corrupt(format!(
                "trailing {} bytes after the last record",
                body % record_len
            )),
        ));
    }
    let count = body / record_len;
    if count == 0 {
        return Ok(None);
    }

    let tail = count.min(2);
    let mut buf = vec![0u8; (tail * record_len) as usize];
    file.seek(SeekFrom::Start(len - tail * record_len))?;
    file.read_exact(&mut buf)?;

    let last = TimeIndex::decode_record(&buf[buf.len() - RECORD_LEN..], count - 1)
        .map_err(|e| corrupt_index(path, e))?;
    let start = if tail == 2 {
        let prev = TimeIndex::decode_record(&buf[..RECORD_LEN], count - 2)
            .map_err(|e| corrupt_index(path, e))?;
        if prev.timestamp >= last.timestamp {
            return Err(corrupt_index(
                path,
                IndexError::NonMonotonic {
                    last: prev.timestamp,
                    got: last.timestamp,
                },
            ));
        }
        if prev.end_offset > last.end_offset {
            return Err(corrupt_index(
                path,
                IndexError::OffsetRegression {
                    last: prev.end_offset,
                    got: last.end_offset,
                },
            ));
        }
        prev.end_offset
    } else {
        0
    };
    Ok(Some(Tip {
        timestamp: last.timestamp,
        span: Span {
            start,
            end: last.end_offset,
        },
    }))
}

fn corrupt_index(path: &Path, e: IndexError) -> StorageError {
    StorageError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

fn read_span(path: &Path, span: Span) -> Result<Vec<u8>, StorageError> {
    Ok(read_spans(path, &[span])?.pop().unwrap_or_default())
}

fn read_spans(path: &Path, spans: &[Span]) -> Result<Vec<Vec<u8>>, StorageError> {
    if spans.iter().all(Span::is_empty) {
        return Ok(vec![Vec::new(); spans.len()]);
    }

    let _timer = start_storage_timer(phase::DATA_READ);
    let mut file = File::open(path)?;
    let mut values = Vec::with_capacity(spans.len());
    for span in spans {
        let mut buf = vec![0u8; span.len() as usize];
        if !buf.is_empty() {
            file.seek(SeekFrom::Start(span.start))?;
            file.read_exact(&mut buf)?;
        }
        values.push(buf);
    }
    Ok(values)
}
