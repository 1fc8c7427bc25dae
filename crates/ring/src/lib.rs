//! Ring layer interface for ringstore.
//!
//! The store does not run ring stabilization itself; it consumes a
//! [`RingView`] (who am I, who are my neighbours, who owns a key) and a
//! stream of [`RingEvent`]s. [`Membership`] provides both for nodes that
//! share a process.

pub mod event;
pub mod membership;

pub use event::{RingEvent, RingView};
pub use membership::{Membership, MembershipView, Notification};
