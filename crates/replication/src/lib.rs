//! Replication and routing for ringstore.
//!
//! [`ReplicationCoordinator`] keeps every key on `replication_count`
//! consecutive nodes of the ring and reacts to [`ringstore_ring::RingEvent`]s.
//! [`LookupClient`] sends client requests to the owning node. Peers talk
//! through the [`PeerClient`] trait; [`InProcessPeers`] implements it for
//! nodes sharing one process.

pub mod chaos;
pub mod coordinator;
pub mod in_process;
pub mod lookup;
pub mod node;
pub mod peer_client;
pub mod service;

pub use coordinator::{ReplicationConfig, ReplicationCoordinator, ReplicationError};
pub use in_process::InProcessPeers;
pub use lookup::LookupClient;
pub use node::{node_id, open_node, NodeError};
pub use peer_client::{ObjectBatch, PeerClient, PeerError};
pub use service::ObjectStoreService;
