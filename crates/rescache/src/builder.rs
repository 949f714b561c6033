//! # Builder for CacheConfig
//!
//! Fluent construction of [`CacheConfig`] instances.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use rescache_engine::CacheConfig;
//!
//! let config = CacheConfig::builder()
//!     .with_cache_directory("/var/cache/products")
//!     .with_max_cache_bytes(512 * 1024 * 1024)
//!     .with_max_cache_entries(10_000)
//!     .with_chunk_size(128 * 1024)
//!     .with_slow_consumer_timeout(Duration::from_secs(10))
//!     .with_abort_fetch_if_orphaned(false)
//!     .build();
//!
//! assert_eq!(config.max_cache_entries, 10_000);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::CacheConfig;

/// Builder for creating CacheConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct CacheConfigBuilder {
    /// Internal config being built
    config: CacheConfig,
}

impl CacheConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
        }
    }

    /// Set the directory holding cached files
    pub fn with_cache_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_directory = dir.into();
        self
    }

    /// Set the maximum total cache size in bytes (0 = unbounded)
    pub fn with_max_cache_bytes(mut self, max_bytes: u64) -> Self {
        self.config.max_cache_bytes = max_bytes;
        self
    }

    /// Set the maximum number of entries (0 = unbounded)
    pub fn with_max_cache_entries(mut self, max_entries: u64) -> Self {
        self.config.max_cache_entries = max_entries;
        self
    }

    /// Set the upper bound of a fanned-out chunk
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.config.chunk_size_bytes = chunk_size;
        self
    }

    /// Set how long a slow consumer may stall delivery before being dropped
    pub fn with_slow_consumer_timeout(mut self, timeout: Duration) -> Self {
        self.config.slow_consumer_timeout_millis = timeout.as_millis() as u64;
        self
    }

    /// Abort the upstream fetch once the last consumer detaches
    pub fn with_abort_fetch_if_orphaned(mut self, abort: bool) -> Self {
        self.config.abort_fetch_if_orphaned = abort;
        self
    }

    /// Set the per-consumer buffer, in chunks
    pub fn with_consumer_buffer_chunks(mut self, chunks: usize) -> Self {
        self.config.consumer_buffer_chunks = chunks;
        self
    }

    /// Expire entries older than `ttl`
    pub fn with_entry_ttl(mut self, ttl: Duration) -> Self {
        self.config.entry_ttl_millis = Some(ttl.as_millis() as u64);
        self
    }

    /// Build the CacheConfig instance
    pub fn build(self) -> CacheConfig {
        self.config
    }
}

impl Default for CacheConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = CacheConfigBuilder::new().build();
        assert_eq!(config.chunk_size_bytes, 64 * 1024);
        assert_eq!(config.max_cache_entries, 0);
        assert!(!config.abort_fetch_if_orphaned);
        assert!(config.entry_ttl_millis.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_customization() {
        let config = CacheConfigBuilder::new()
            .with_cache_directory("/tmp/products")
            .with_max_cache_bytes(1000)
            .with_max_cache_entries(5)
            .with_chunk_size(16)
            .with_slow_consumer_timeout(Duration::from_millis(1500))
            .with_abort_fetch_if_orphaned(true)
            .with_consumer_buffer_chunks(2)
            .with_entry_ttl(Duration::from_secs(60))
            .build();

        assert_eq!(config.cache_directory, PathBuf::from("/tmp/products"));
        assert_eq!(config.max_cache_bytes, 1000);
        assert_eq!(config.max_cache_entries, 5);
        assert_eq!(config.chunk_size_bytes, 16);
        assert_eq!(config.slow_consumer_timeout_millis, 1500);
        assert!(config.abort_fetch_if_orphaned);
        assert_eq!(config.consumer_buffer_chunks, 2);
        assert_eq!(config.entry_ttl(), Some(Duration::from_secs(60)));
    }
}
