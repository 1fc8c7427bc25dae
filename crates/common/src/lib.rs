//! ringstore-common: shared types for the ringstore project.
//!
//! Provides the ring identifier (`RingId`), the configurable identifier
//! space it lives in (`RingSpace`), the circular `in_range` predicate used
//! for ownership math, and the per-key replica metadata (`KeyMetadata`)
//! shared by the storage and replication layers.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Largest supported identifier width (the SHA-1 digest size).
pub const MAX_ID_BITS: u32 = 160;

/// Number of bytes backing a `RingId`.
pub const ID_BYTES: usize = (MAX_ID_BITS / 8) as usize; // 20

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// RingId
// ---------------------------------------------------------------------------

/// A position on the identifier ring, stored big-endian.
///
/// Ids produced by a [`RingSpace`] only ever have their low `bits` bits set,
/// so plain byte ordering is numeric ordering on the ring.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RingId([u8; ID_BYTES]);

impl RingId {
    /// Build an id from a small integer (placed in the low 64 bits).
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; ID_BYTES];
        bytes[ID_BYTES - 8..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    /// Whether `self` lies on the ring arc from `lower` to `upper`.
    /// See [`in_range`].
    pub fn in_range(&self, lower: &RingId, upper: &RingId, inc_lower: bool, inc_upper: bool) -> bool {
        in_range(self, lower, upper, inc_lower, inc_upper)
    }

    fn masked(mut self, bits: u32) -> Self {
        let clear = (MAX_ID_BITS - bits) as usize;
        let full_bytes = clear / 8;
        for byte in self.0.iter_mut().take(full_bytes) {
            *byte = 0;
        }
        let rem = clear % 8;
        if rem > 0 {
            self.0[full_bytes] &= 0xFFu8 >> rem;
        }
        self
    }
}

impl fmt::Debug for RingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RingId({})", self)
    }
}

impl fmt::Display for RingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Skip leading zero bytes so narrow rings print compactly.
        let first = self
            .0
            .iter()
            .position(|b| *b != 0)
            .unwrap_or(ID_BYTES - 1);
        let significant = &self.0[first..];
        for byte in significant.iter().take(4) {
            write!(f, "{:02x}", byte)?;
        }
        if significant.len() > 4 {
            write!(f, "…")?;
        }
        Ok(())
    }
}

/// Circular interval membership.
///
/// Walks clockwise from `lower` to `upper`; when `lower > upper` the arc
/// wraps through zero. When `lower == upper` the arc covers the whole ring,
/// with the shared endpoint included only if either bound is inclusive.
pub fn in_range(id: &RingId, lower: &RingId, upper: &RingId, inc_lower: bool, inc_upper: bool) -> bool {
    if id == lower {
        return inc_lower || (lower == upper && inc_upper);
    }
    if id == upper {
        return inc_upper;
    }
    match lower.cmp(upper) {
        std::cmp::Ordering::Less => lower < id && id < upper,
        std::cmp::Ordering::Greater => id > lower || id < upper,
        std::cmp::Ordering::Equal => true,
    }
}

// ---------------------------------------------------------------------------
// RingSpace
// ---------------------------------------------------------------------------

/// The identifier space: ids are SHA-1 digests truncated to `bits` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSpace {
    bits: u32,
}

impl RingSpace {
    pub fn new(bits: u32) -> Result<Self, RingError> {
        if bits == 0 || bits > MAX_ID_BITS {
            return Err(RingError::InvalidBitWidth(bits));
        }
        Ok(Self { bits })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Hash arbitrary bytes into the ring.
    pub fn hash(&self, data: &[u8]) -> RingId {
        let digest = Sha1::digest(data);
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&digest);
        RingId(bytes).masked(self.bits)
    }

    /// Hash a string key into the ring.
    pub fn key(&self, name: &str) -> RingKey {
        RingKey {
            name: name.to_string(),
            id: self.hash(name.as_bytes()),
        }
    }

    /// Identity of the node listening on `addr`.
    pub fn node_id(&self, addr: &SocketAddr) -> RingId {
        self.hash(addr.to_string().as_bytes())
    }
}

// ---------------------------------------------------------------------------
// Keys and metadata
// ---------------------------------------------------------------------------

/// A string key together with its position on the ring.
///
/// Identity is the string; the id is derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingKey {
    pub name: String,
    pub id: RingId,
}

impl PartialEq for RingKey {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for RingKey {}

impl Hash for RingKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for RingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.id)
    }
}

/// A locally held key tagged with its position in the replica chain
/// (1 = owner).
///
/// Equality and hashing ignore `replica_number`: a node holds at most one
/// copy of a key whatever its current rank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub key: RingKey,
    pub replica_number: u32,
}

impl KeyMetadata {
    pub fn new(key: RingKey, replica_number: u32) -> Self {
        Self {
            key,
            replica_number,
        }
    }

    /// Metadata for the owner's copy.
    pub fn primary(key: RingKey) -> Self {
        Self::new(key, 1)
    }

    /// The same key at a different rank.
    pub fn with_rank(&self, replica_number: u32) -> Self {
        Self::new(self.key.clone(), replica_number)
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }
}

impl PartialEq for KeyMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for KeyMetadata {}

impl Hash for KeyMetadata {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("identifier width must be in 1..={max}, got {0}", max = MAX_ID_BITS)]
    InvalidBitWidth(u32),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
