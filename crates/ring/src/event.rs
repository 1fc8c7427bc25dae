//! Topology notifications and the ring view consumed by the store.

use ringstore_common::RingId;
use std::fmt;

/// A change in this node's immediate neighbours, as reported by the ring
/// layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingEvent {
    /// A node joined between our old predecessor and us.
    NewPredecessor {
        previous: Option<RingId>,
        current: RingId,
    },
    /// A node joined between us and our old successor.
    NewSuccessor {
        previous: Option<RingId>,
        current: RingId,
    },
    /// Our predecessor left without handing anything over.
    PredecessorFailed {
        failed: RingId,
        replacement: Option<RingId>,
    },
    /// Our successor left. `replacement` is `None` until the ring has
    /// settled on a new one.
    SuccessorFailed {
        failed: RingId,
        replacement: Option<RingId>,
    },
}

impl RingEvent {
    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RingEvent::NewPredecessor { .. } => "new_predecessor",
            RingEvent::NewSuccessor { .. } => "new_successor",
            RingEvent::PredecessorFailed { .. } => "predecessor_failed",
            RingEvent::SuccessorFailed { .. } => "successor_failed",
        }
    }
}

fn opt(id: &Option<RingId>) -> String {
    id.map(|i| i.to_string()).unwrap_or_else(|| "-".into())
}

impl fmt::Display for RingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingEvent::NewPredecessor { previous, current }
            | RingEvent::NewSuccessor { previous, current } => {
                write!(f, "{} {} -> {}", self.kind(), opt(previous), current)
            }
            RingEvent::PredecessorFailed {
                failed,
                replacement,
            }
            | RingEvent::SuccessorFailed {
                failed,
                replacement,
            } => write!(f, "{} {} -> {}", self.kind(), failed, opt(replacement)),
        }
    }
}

/// What the store needs to know about the ring, from one node's point of
/// view. `None` neighbours mean the node is alone.
pub trait RingView: Send + Sync + 'static {
    fn local_id(&self) -> RingId;

    fn successor(&self) -> Option<RingId>;

    fn predecessor(&self) -> Option<RingId>;

    /// The node that owns `key`: the first node at or after it.
    fn responsible_node(&self, key: &RingId) -> RingId;

    fn is_responsible(&self, key: &RingId) -> bool {
        self.responsible_node(key) == self.local_id()
    }
}
