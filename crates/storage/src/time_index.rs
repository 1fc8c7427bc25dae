//! Per-key time index: a B+ tree from write timestamp to the end offset
//! of that write's bytes in the key's data file.
//!
//! Nodes live in an arena (`Vec<Node>`) and refer to each other by index.
//! Leaves are doubly linked so latest/as-of/range lookups never re-descend
//! to find a neighbour. Every node except the root holds between D and 2D
//! entries (leaves) or keys (internal nodes).
//!
//! On-disk format: `RSIX` magic, a version byte, the fanout (u16 LE), then
//! one fixed-size record per entry: `timestamp u64 LE | end u64 LE | crc32 u32 LE`.
//! Records are self-checking so an append only has to add one to the end.

use crc32fast::Hasher;
use ringstore_common::Timestamp;

pub const INDEX_MAGIC: &[u8; 4] = b"RSIX";
pub const INDEX_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 7;
pub const RECORD_LEN: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("timestamp {got} is not after the latest indexed timestamp {last}")]
    NonMonotonic { last: Timestamp, got: Timestamp },
    #[error("end offset {got} precedes the latest indexed end offset {last}")]
    OffsetRegression { last: u64, got: u64 },
    #[error("corrupt index: {0}")]
    Corrupt(String),
}

/// Byte range `[start, end)` of one value in a data file. A zero-length
/// span is a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: u64,
    pub end: u64,
}

impl Span {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub timestamp: Timestamp,
    pub end_offset: u64,
}

#[derive(Debug)]
enum Node {
    Leaf {
        entries: Vec<IndexEntry>,
        prev: Option<usize>,
        next: Option<usize>,
    },
    Internal {
        keys: Vec<Timestamp>,
        children: Vec<usize>,
    },
}

/// B+ tree over `(timestamp -> end offset)`.
#[derive(Debug)]
pub struct TimeIndex {
    fanout: usize,
    nodes: Vec<Node>,
    root: usize,
    // Splits keep the left half in place, so the first leaf never moves.
    first_leaf: usize,
    last_leaf: usize,
    len: usize,
}

impl TimeIndex {
    /// Create an empty index of order `fanout` (clamped to at least 2).
    pub fn new(fanout: usize) -> Self {
        Self {
            fanout: fanout.max(2),
            nodes: vec![Node::Leaf {
                entries: Vec::new(),
                prev: None,
                next: None,
            }],
            root: 0,
            first_leaf: 0,
            last_leaf: 0,
            len: 0,
        }
    }

    pub fn fanout(&self) -> usize {
        self.fanout
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Height of the tree (1 for a lone leaf).
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut idx = self.root;
        while let Node::Internal { children, .. } = &self.nodes[idx] {
            idx = children[0];
            depth += 1;
        }
        depth
    }

    /// The most recently inserted entry.
    pub fn last(&self) -> Option<IndexEntry> {
        self.leaf_entries(self.last_leaf).last().copied()
    }

    /// Append an entry. Timestamps must strictly increase and end offsets
    /// must not go backwards.
    pub fn insert(&mut self, timestamp: Timestamp, end_offset: u64) -> Result<(), IndexError> {
        if let Some(last) = self.last() {
            if timestamp <= last.timestamp {
                return Err(IndexError::NonMonotonic {
                    last: last.timestamp,
                    got: timestamp,
                });
            }
            if end_offset < last.end_offset {
                return Err(IndexError::OffsetRegression {
                    last: last.end_offset,
                    got: end_offset,
                });
            }
        }

        let mut path = Vec::new();
        let mut idx = self.root;
        while let Node::Internal { keys, children } = &self.nodes[idx] {
            path.push(idx);
            idx = children[keys.partition_point(|k| *k <= timestamp)];
        }

        if let Node::Leaf { entries, .. } = &mut self.nodes[idx] {
            let pos = entries.partition_point(|e| e.timestamp < timestamp);
            entries.insert(
                pos,
                IndexEntry {
                    timestamp,
                    end_offset,
                },
            );
        }
        self.len += 1;

        let mut node = idx;
        let mut split = self.split_if_full(node);
        while let Some((separator, right)) = split {
            match path.pop() {
                Some(parent) => {
                    if let Node::Internal { keys, children } = &mut self.nodes[parent] {
                        let slot = keys.partition_point(|k| *k <= separator);
                        keys.insert(slot, separator);
                        children.insert(slot + 1, right);
                    }
                    node = parent;
                    split = self.split_if_full(node);
                }
                None => {
                    self.nodes.push(Node::Internal {
                        keys: vec![separator],
                        children: vec![node, right],
                    });
                    self.root = self.nodes.len() - 1;
                    split = None;
                }
            }
        }
        Ok(())
    }

    /// Span of the newest value.
    pub fn latest(&self) -> Option<Span> {
        let entries = self.leaf_entries(self.last_leaf);
        if entries.is_empty() {
            return None;
        }
        Some(self.span_at(self.last_leaf, entries.len() - 1))
    }

    /// Span of the value in effect at `timestamp`, or `None` if the key had
    /// no value yet.
    pub fn as_of(&self, timestamp: Timestamp) -> Option<Span> {
        let last = self.last()?;
        if timestamp >= last.timestamp {
            return self.latest();
        }

        let leaf = self.find_leaf(timestamp);
        let pos = self
            .leaf_entries(leaf)
            .partition_point(|e| e.timestamp <= timestamp);
        if pos > 0 {
            return Some(self.span_at(leaf, pos - 1));
        }
        // Everything in this leaf is newer; the answer is the previous
        // leaf's last entry, if any.
        let prev = self.leaf_prev(leaf)?;
        let n = self.leaf_entries(prev).len();
        if n == 0 {
            return None;
        }
        Some(self.span_at(prev, n - 1))
    }

    /// Spans of every value written in `[from, to]`, oldest first.
    pub fn range(&self, from: Timestamp, to: Timestamp) -> Vec<Span> {
        let mut spans = Vec::new();
        if from > to || self.is_empty() {
            return spans;
        }

        let mut leaf = self.find_leaf(from);
        let mut pos = self
            .leaf_entries(leaf)
            .partition_point(|e| e.timestamp < from);
        let mut prev_end = self.end_before(leaf, pos);

        loop {
            let entries = self.leaf_entries(leaf);
            while pos < entries.len() {
                let entry = entries[pos];
                if entry.timestamp > to {
                    return spans;
                }
                spans.push(Span {
                    start: prev_end,
                    end: entry.end_offset,
                });
                prev_end = entry.end_offset;
                pos += 1;
            }
            match self.leaf_next(leaf) {
                Some(next) => {
                    leaf = next;
                    pos = 0;
                }
                None => return spans,
            }
        }
    }

    /// All entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        let mut leaf = Some(self.first_leaf);
        let mut pos = 0usize;
        std::iter::from_fn(move || loop {
            let current = leaf?;
            let entries = self.leaf_entries(current);
            if pos < entries.len() {
                pos += 1;
                return Some(entries[pos - 1]);
            }
            leaf = self.leaf_next(current);
            pos = 0;
        })
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    /// File header for an index of the given order.
    pub fn encode_header(fanout: usize) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(INDEX_MAGIC);
        header[4] = INDEX_VERSION;
        header[5..7].copy_from_slice(&(fanout.min(u16::MAX as usize) as u16).to_le_bytes());
        header
    }

    /// One self-checking entry record.
    pub fn encode_record(entry: IndexEntry) -> [u8; RECORD_LEN] {
        let mut record = [0u8; RECORD_LEN];
        record[..8].copy_from_slice(&entry.timestamp.to_le_bytes());
        record[8..16].copy_from_slice(&entry.end_offset.to_le_bytes());
        let mut hasher = Hasher::new();
        hasher.update(&record[..16]);
        record[16..].copy_from_slice(&hasher.finalize().to_le_bytes());
        record
    }

    /// Full on-disk image of this index.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.len * RECORD_LEN);
        buf.extend_from_slice(&Self::encode_header(self.fanout));
        for entry in self.iter() {
            buf.extend_from_slice(&Self::encode_record(entry));
        }
        buf
    }

    /// Check a file header and return the fanout it records.
    pub fn decode_header(bytes: &[u8]) -> Result<usize, IndexError> {
        if bytes.len() < HEADER_LEN {
            return Err(IndexError::Corrupt(format!(
                "{} bytes is shorter than the header",
                bytes.len()
            )));
        }
        if &bytes[..4] != INDEX_MAGIC {
            return Err(IndexError::Corrupt("bad magic".into()));
        }
        if bytes[4] != INDEX_VERSION {
            return Err(IndexError::Corrupt(format!(
                "unsupported version {}",
                bytes[4]
            )));
        }
        Ok(u16::from_le_bytes([bytes[5], bytes[6]]) as usize)
    }

    /// Verify and decode record number `i`.
    pub fn decode_record(record: &[u8], i: u64) -> Result<IndexEntry, IndexError> {
        if record.len() != RECORD_LEN {
            return Err(IndexError::Corrupt(format!(
                "record {} is {} bytes",
                i,
                record.len()
            )));
        }
        let mut hasher = Hasher::new();
        hasher.update(&record[..16]);
        let expected = u32::from_le_bytes([record[16], record[17], record[18], record[19]]);
        let actual = hasher.finalize();
        if expected != actual {
            return Err(IndexError::Corrupt(format!(
                "record {} checksum mismatch: expected {:#010x}, got {:#010x}",
                i, expected, actual
            )));
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&record[..8]);
        let mut end = [0u8; 8];
        end.copy_from_slice(&record[8..16]);
        Ok(IndexEntry {
            timestamp: u64::from_le_bytes(ts),
            end_offset: u64::from_le_bytes(end),
        })
    }

    /// Rebuild an index from its on-disk image.
    pub fn decode(bytes: &[u8]) -> Result<Self, IndexError> {
        let fanout = Self::decode_header(bytes)?;

        let body = &bytes[HEADER_LEN..];
        if body.len() % RECORD_LEN != 0 {
            return Err(IndexError::Corrupt(format!(
                "trailing {} bytes after the last record",
                body.len() % RECORD_LEN
            )));
        }

        let mut index = Self::new(fanout);
        for (i, record) in body.chunks_exact(RECORD_LEN).enumerate() {
            let entry = Self::decode_record(record, i as u64)?;
            index.insert(entry.timestamp, entry.end_offset)?;
        }
        Ok(index)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn find_leaf(&self, timestamp: Timestamp) -> usize {
        let mut idx = self.root;
        while let Node::Internal { keys, children } = &self.nodes[idx] {
            idx = children[keys.partition_point(|k| *k <= timestamp)];
        }
        idx
    }

    fn leaf_entries(&self, idx: usize) -> &[IndexEntry] {
        match &self.nodes[idx] {
            Node::Leaf { entries, .. } => entries,
            Node::Internal { .. } => &[],
        }
    }

    fn leaf_prev(&self, idx: usize) -> Option<usize> {
        match &self.nodes[idx] {
            Node::Leaf { prev, .. } => *prev,
            Node::Internal { .. } => None,
        }
    }

    fn leaf_next(&self, idx: usize) -> Option<usize> {
        match &self.nodes[idx] {
            Node::Leaf { next, .. } => *next,
            Node::Internal { .. } => None,
        }
    }

    /// End offset of the entry immediately before `(leaf, pos)`, or 0.
    fn end_before(&self, leaf: usize, pos: usize) -> u64 {
        if pos > 0 {
            return self.leaf_entries(leaf)[pos - 1].end_offset;
        }
        self.leaf_prev(leaf)
            .and_then(|prev| self.leaf_entries(prev).last())
            .map(|e| e.end_offset)
            .unwrap_or(0)
    }

    fn span_at(&self, leaf: usize, pos: usize) -> Span {
        Span {
            start: self.end_before(leaf, pos),
            end: self.leaf_entries(leaf)[pos].end_offset,
        }
    }

    /// Split `idx` if it holds more than 2D entries. Returns the separator
    /// to push into the parent and the new right sibling.
    fn split_if_full(&mut self, idx: usize) -> Option<(Timestamp, usize)> {
        let d = self.fanout;
        let new_idx = self.nodes.len();
        let (separator, right) = match &mut self.nodes[idx] {
            Node::Leaf {
                entries,
                next,
                ..
            } => {
                if entries.len() <= 2 * d {
                    return None;
                }
                let moved = entries.split_off(d);
                let old_next = next.replace(new_idx);
                (
                    moved[0].timestamp,
                    Node::Leaf {
                        entries: moved,
                        prev: Some(idx),
                        next: old_next,
                    },
                )
            }
            Node::Internal { keys, children } => {
                if keys.len() <= 2 * d {
                    return None;
                }
                let mut moved_keys = keys.split_off(d);
                let separator = moved_keys.remove(0);
                let moved_children = children.split_off(d + 1);
                (
                    separator,
                    Node::Internal {
                        keys: moved_keys,
                        children: moved_children,
                    },
                )
            }
        };

        if let Node::Leaf {
            next: Some(after), ..
        } = &right
        {
            let after = *after;
            if let Node::Leaf { prev, .. } = &mut self.nodes[after] {
                *prev = Some(new_idx);
            }
        }
        if matches!(right, Node::Leaf { .. }) && self.last_leaf == idx {
            self.last_leaf = new_idx;
        }
        self.nodes.push(right);
        Some((separator, new_idx))
    }
}
