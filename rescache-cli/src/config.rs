use std::path::Path;

use rescache_engine::CacheConfig;
use tracing::debug;

use crate::cli::CliArgs;
use crate::error::AppError;
use crate::utils::{parse_duration, parse_size};

/// Build the cache configuration from the optional JSON file and flag overrides.
pub fn load_config(args: &CliArgs) -> Result<CacheConfig, AppError> {
    let mut config = match &args.config {
        Some(path) => read_config_file(path)?,
        None => CacheConfig::default(),
    };

    if let Some(dir) = &args.cache_dir {
        config.cache_directory = dir.clone();
    }
    if let Some(size) = &args.max_size {
        config.max_cache_bytes = parse_size(size)?;
    }
    if let Some(entries) = args.max_entries {
        config.max_cache_entries = entries;
    }
    if let Some(chunk) = &args.chunk_size {
        config.chunk_size_bytes = usize::try_from(parse_size(chunk)?)
            .map_err(|_| AppError::InvalidInput(format!("chunk size too large: {chunk}")))?;
    }
    if let Some(timeout) = &args.slow_consumer_timeout {
        config.slow_consumer_timeout_millis = parse_duration(timeout)?.as_millis() as u64;
    }
    if let Some(ttl) = &args.ttl {
        config.entry_ttl_millis = Some(parse_duration(ttl)?.as_millis() as u64);
    }
    if args.abort_orphaned {
        config.abort_fetch_if_orphaned = true;
    }

    config.validate()?;
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<CacheConfig, AppError> {
    debug!(path = %path.display(), "Loading configuration file");
    let json = std::fs::read_to_string(path)?;
    Ok(CacheConfig::from_json(&json)?)
}
