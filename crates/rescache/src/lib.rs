//! # Rescache
//!
//! A reliable resource download and disk cache engine. Resources fetched
//! from an upstream source are streamed to the requester and written to a
//! crash-consistent on-disk cache at the same time.
//!
//! ## Features
//!
//! - At most one upstream fetch per resource, however many requesters
//! - Concurrent requesters share a single download pipe
//! - Atomic temp-file promotion; partial files are never served
//! - LRU eviction bounded by total bytes and/or entry count
//! - Slow or cancelled consumers never stall the others

pub mod builder;
pub mod bytes_stream;
pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handle;
pub mod pipe;
pub mod source;

pub use builder::CacheConfigBuilder;
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};

pub use cache::{
    CacheEntry, CacheKey, CacheStats, EvictionManager, EvictionReport, RecencyComparator,
    ReliableResourceStore,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::DownloadCoordinator;
pub use handle::{HandleOrigin, ResourceHandle, ResourceInfo};
pub use pipe::{DownloadPipe, PipeOutcome, PipeState};

// Re-export source utilities
pub use source::{
    ByteStream, FileSourceOpener, HttpSourceOpener, OpenedResource, SourceOpener,
    SourceRegistry, create_client,
};
