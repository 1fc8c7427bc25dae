//! Storage engine for ringstore: append-only, time-versioned values per key.
//!
//! Each key has a data file (values back to back) and an index file (a
//! serialized [`TimeIndex`]). A separate [`MetadataCatalog`] lists every
//! locally held key with its replica rank. [`LocalStore`] ties them together.

pub mod cache;
pub mod catalog;
pub mod error;
pub mod fsio;
pub mod keyed_log;
pub mod locks;
pub mod store;
pub mod time_index;

pub use error::StorageError;
pub use fsio::FsyncPolicy;
pub use keyed_log::KeyedLog;
pub use store::{LocalStore, StoreOptions};
pub use time_index::{IndexError, Span, TimeIndex};
