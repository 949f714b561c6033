use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

const DEFAULT_MAX_CACHE_BYTES: u64 = 10 * 1024 * 1024 * 1024; // 10 GiB
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_SLOW_CONSUMER_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CONSUMER_BUFFER_CHUNKS: usize = 8;

/// Configurable options for the cache engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Directory holding cached data files and their metadata sidecars
    pub cache_directory: PathBuf,

    /// Maximum total size of cached data in bytes (0 = unbounded)
    pub max_cache_bytes: u64,

    /// Maximum number of cached entries (0 = unbounded)
    pub max_cache_entries: u64,

    /// Upper bound for a single chunk read from upstream and fanned out
    pub chunk_size_bytes: usize,

    /// How long a consumer may block delivery of one chunk before it is dropped
    pub slow_consumer_timeout_millis: u64,

    /// Abort an upstream fetch once its last consumer detaches
    pub abort_fetch_if_orphaned: bool,

    /// Number of chunks buffered per consumer
    pub consumer_buffer_chunks: usize,

    /// Entries older than this are treated as misses (None = never expire)
    pub entry_ttl_millis: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_directory: std::env::temp_dir().join("rescache"),
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            max_cache_entries: 0,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            slow_consumer_timeout_millis: DEFAULT_SLOW_CONSUMER_TIMEOUT_MS,
            abort_fetch_if_orphaned: false,
            consumer_buffer_chunks: DEFAULT_CONSUMER_BUFFER_CHUNKS,
            entry_ttl_millis: None,
        }
    }
}

impl CacheConfig {
    pub fn builder() -> crate::builder::CacheConfigBuilder {
        crate::builder::CacheConfigBuilder::new()
    }

    pub fn slow_consumer_timeout(&self) -> Duration {
        Duration::from_millis(self.slow_consumer_timeout_millis)
    }

    pub fn entry_ttl(&self) -> Option<Duration> {
        self.entry_ttl_millis.map(Duration::from_millis)
    }

    /// Parse a JSON document using the camelCase option names.
    pub fn from_json(json: &str) -> CacheResult<Self> {
        let config: CacheConfig =
            serde_json::from_str(json).map_err(|e| CacheError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.chunk_size_bytes == 0 {
            return Err(CacheError::Config(
                "chunkSizeBytes must be greater than zero".to_string(),
            ));
        }
        if self.slow_consumer_timeout_millis == 0 {
            return Err(CacheError::Config(
                "slowConsumerTimeoutMillis must be greater than zero".to_string(),
            ));
        }
        if self.consumer_buffer_chunks == 0 {
            return Err(CacheError::Config(
                "consumerBufferChunks must be greater than zero".to_string(),
            ));
        }
        if self.cache_directory.as_os_str().is_empty() {
            return Err(CacheError::Config("cacheDirectory is empty".to_string()));
        }
        Ok(())
    }
}

impl Display for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bounded = |v: u64, unit: &str| {
            if v == 0 {
                "unbounded".to_string()
            } else {
                format!("{v}{unit}")
            }
        };
        write!(
            f,
            "CacheConfig {{ dir: {}, max_bytes: {}, max_entries: {}, chunk: {} bytes, slow_consumer_timeout: {}ms, abort_if_orphaned: {} }}",
            self.cache_directory.display(),
            bounded(self.max_cache_bytes, " bytes"),
            bounded(self.max_cache_entries, ""),
            self.chunk_size_bytes,
            self.slow_consumer_timeout_millis,
            self.abort_fetch_if_orphaned
        )
    }
}
