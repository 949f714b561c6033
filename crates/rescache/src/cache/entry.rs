//! # Cache Entry Types
//!
//! The record describing one committed resource, the key it is stored
//! under, and the recency ordering used for eviction.

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

/// Size recorded for an entry whose write has not been finalized.
pub const UNKNOWN_SIZE: i64 = -1;

/// Cache key for identifying resources
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    /// Identifier of the source that owns the resource
    pub source_id: String,
    /// Identifier of the resource within its source
    pub resource_id: String,
    /// Optional qualifier, e.g. a rendition name
    pub qualifier: Option<String>,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(source_id: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            resource_id: resource_id.into(),
            qualifier: None,
        }
    }

    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    /// Filename-safe digest of a rendered key.
    pub fn digest(key: &str) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let hash = hasher.finalize();
        format!("{hash:x}")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_id, self.resource_id)?;
        if let Some(q) = &self.qualifier {
            write!(f, ":{q}")?;
        }
        Ok(())
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_string()
    }
}

/// Metadata record for one cached resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Unique key of the entry within the store
    pub key: String,
    /// Absolute path of the cached bytes, owned by the store
    pub file_path: PathBuf,
    /// Declared content type
    pub mime_type: Option<String>,
    /// Suggested file name
    pub resource_name: Option<String>,
    /// Size in bytes, or [`UNKNOWN_SIZE`] while not finalized
    pub size_bytes: i64,
    /// Last time the entry was read or written
    pub last_touched_millis: u64,
    /// When the entry was published
    pub committed_millis: u64,
    /// Opaque reference to the describing metadata record
    pub metacard_ref: Option<String>,
}

impl CacheEntry {
    /// Finalized size, `None` while the write is in progress or failed.
    pub fn size(&self) -> Option<u64> {
        u64::try_from(self.size_bytes).ok()
    }

    pub fn is_complete(&self) -> bool {
        self.size_bytes >= 0
    }

    pub fn is_expired(&self, now_millis: u64, ttl_millis: Option<u64>) -> bool {
        match ttl_millis {
            Some(ttl) => now_millis.saturating_sub(self.committed_millis) > ttl,
            None => false,
        }
    }
}

/// Orders entries from least to most recently touched.
///
/// Entries touched at the same millisecond are ordered by key so that
/// eviction order is deterministic.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecencyComparator;

impl RecencyComparator {
    pub fn compare(a: &CacheEntry, b: &CacheEntry) -> Ordering {
        a.last_touched_millis
            .cmp(&b.last_touched_millis)
            .then_with(|| a.key.cmp(&b.key))
    }

    /// Sort so that eviction candidates come first.
    pub fn sort(entries: &mut [CacheEntry]) {
        entries.sort_by(Self::compare);
    }
}
