//! rumkit persistent cache.
//!
//! - [`PersistentCache`]: capacity- and age-bounded durable map
//! - [`KeyValueStore`]: storage seam, with filesystem and in-memory backends

pub mod cache;
pub mod store;

pub use cache::{CacheEntry, CacheError, CachePolicy, EvictionReason, PersistentCache, PurgeReport};
pub use store::{FsKeyValueStore, KeyValueStore, MemoryKeyValueStore, StoreError};
