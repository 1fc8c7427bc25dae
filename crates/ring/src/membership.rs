//! In-process ring membership.
//!
//! Stands in for a stabilizing ring protocol when every node lives in one
//! process: members are kept in a sorted set, and each join or failure
//! produces the neighbour-change events the affected nodes would observe.

use crate::event::{RingEvent, RingView};
use parking_lot::RwLock;
use ringstore_common::RingId;
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;
use tokio::sync::mpsc;

/// An event addressed to one member.
pub type Notification = (RingId, RingEvent);

#[derive(Debug, Default)]
struct Inner {
    members: BTreeSet<RingId>,
    listeners: HashMap<RingId, mpsc::UnboundedSender<RingEvent>>,
}

#[derive(Debug, Default)]
pub struct Membership {
    inner: RwLock<Inner>,
}

fn successor_in(members: &BTreeSet<RingId>, id: &RingId) -> Option<RingId> {
    members
        .range((Excluded(*id), Unbounded))
        .next()
        .or_else(|| members.iter().next())
        .copied()
        .filter(|s| s != id)
}

fn predecessor_in(members: &BTreeSet<RingId>, id: &RingId) -> Option<RingId> {
    members
        .range(..*id)
        .next_back()
        .or_else(|| members.iter().next_back())
        .copied()
        .filter(|p| p != id)
}

fn owner_in(members: &BTreeSet<RingId>, key: &RingId) -> Option<RingId> {
    members
        .range(*key..)
        .next()
        .or_else(|| members.iter().next())
        .copied()
}

impl Membership {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current members in ring order.
    pub fn members(&self) -> Vec<RingId> {
        self.inner.read().members.iter().copied().collect()
    }

    pub fn contains(&self, id: &RingId) -> bool {
        self.inner.read().members.contains(id)
    }

    /// The next member clockwise from `id`, other than `id` itself.
    pub fn successor_of(&self, id: &RingId) -> Option<RingId> {
        successor_in(&self.inner.read().members, id)
    }

    /// The next member counter-clockwise from `id`, other than `id` itself.
    pub fn predecessor_of(&self, id: &RingId) -> Option<RingId> {
        predecessor_in(&self.inner.read().members, id)
    }

    /// The member that owns `key`.
    pub fn responsible_for(&self, key: &RingId) -> Option<RingId> {
        owner_in(&self.inner.read().members, key)
    }

    /// A channel that receives every event addressed to `id` from now on.
    pub fn subscribe(&self, id: RingId) -> mpsc::UnboundedReceiver<RingEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().listeners.insert(id, tx);
        rx
    }

    /// `id`'s view of the ring.
    pub fn view(self: &Arc<Self>, id: RingId) -> MembershipView {
        MembershipView {
            local: id,
            membership: self.clone(),
        }
    }

    /// Add `id` to the ring. Its new successor learns of a new predecessor
    /// and its new predecessor of a new successor.
    pub fn join(&self, id: RingId) -> Vec<Notification> {
        let mut inner = self.inner.write();
        if inner.members.contains(&id) {
            return Vec::new();
        }
        let before = inner.members.clone();
        inner.members.insert(id);

        let mut out = Vec::new();
        if let Some(succ) = successor_in(&inner.members, &id) {
            out.push((
                succ,
                RingEvent::NewPredecessor {
                    previous: predecessor_in(&before, &succ),
                    current: id,
                },
            ));
        }
        if let Some(pred) = predecessor_in(&inner.members, &id) {
            out.push((
                pred,
                RingEvent::NewSuccessor {
                    previous: successor_in(&before, &pred),
                    current: id,
                },
            ));
        }
        tracing::info!("ring: {} joined, {} members", id, inner.members.len());
        dispatch(&mut inner, &out);
        out
    }

    /// Remove `id` abruptly. Its neighbours learn of the failure together
    /// with whoever replaces it.
    pub fn fail(&self, id: RingId) -> Vec<Notification> {
        let mut inner = self.inner.write();
        if !inner.members.contains(&id) {
            return Vec::new();
        }
        let succ = successor_in(&inner.members, &id);
        let pred = predecessor_in(&inner.members, &id);
        inner.members.remove(&id);
        inner.listeners.remove(&id);

        let mut out = Vec::new();
        if let Some(succ) = succ {
            out.push((
                succ,
                RingEvent::PredecessorFailed {
                    failed: id,
                    replacement: predecessor_in(&inner.members, &succ),
                },
            ));
        }
        if let Some(pred) = pred {
            out.push((
                pred,
                RingEvent::SuccessorFailed {
                    failed: id,
                    replacement: successor_in(&inner.members, &pred),
                },
            ));
        }
        tracing::info!("ring: {} failed, {} members", id, inner.members.len());
        dispatch(&mut inner, &out);
        out
    }
}

fn dispatch(inner: &mut Inner, notifications: &[Notification]) {
    for (target, event) in notifications {
        let closed = match inner.listeners.get(target) {
            Some(tx) => tx.send(*event).is_err(),
            None => false,
        };
        if closed {
            tracing::debug!("ring: listener for {} is gone", target);
            inner.listeners.remove(target);
        }
    }
}

/// One member's view of a [`Membership`].
#[derive(Debug, Clone)]
pub struct MembershipView {
    local: RingId,
    membership: Arc<Membership>,
}

impl RingView for MembershipView {
    fn local_id(&self) -> RingId {
        self.local
    }

    fn successor(&self) -> Option<RingId> {
        self.membership.successor_of(&self.local)
    }

    fn predecessor(&self) -> Option<RingId> {
        self.membership.predecessor_of(&self.local)
    }

    fn responsible_node(&self, key: &RingId) -> RingId {
        self.membership.responsible_for(key).unwrap_or(self.local)
    }
}
