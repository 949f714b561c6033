//! # Cache System
//!
//! Durable storage of downloaded resources: the entry model, the on-disk
//! store, LRU eviction and the counters exposed through `stats()`.

mod entry;
mod eviction;
mod stats;
mod store;

pub use entry::{CacheEntry, CacheKey, RecencyComparator, UNKNOWN_SIZE};
pub use eviction::{EvictionManager, EvictionReport, EvictionTrigger};
pub use stats::{CacheCounters, CacheStats};
pub use store::{CachedReader, ReaderPin, ReliableResourceStore, RemoveOutcome, WriteHandle};
