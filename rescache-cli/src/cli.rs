use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Reliable resource download cache",
    long_about = "Fetch resources from local files or HTTP(S) URLs through a durable disk cache.\n\
                  \n\
                  Concurrent requests for the same resource share one upstream download,\n\
                  completed downloads are committed atomically and the cache is kept within\n\
                  its size limits by evicting the least recently used entries."
)]
pub struct CliArgs {
    /// JSON configuration file
    #[arg(
        short,
        long,
        global = true,
        help = "JSON file with cache settings (camelCase keys, e.g. \"maxCacheBytes\"). Flags override it."
    )]
    pub config: Option<PathBuf>,

    /// Cache directory
    #[arg(
        long,
        global = true,
        help = "Directory holding cached resources (default: <temp dir>/rescache)"
    )]
    pub cache_dir: Option<PathBuf>,

    /// Maximum cache size with optional unit (B, KB, MB, GB, TB)
    #[arg(
        long,
        global = true,
        help = "Maximum total cache size with optional unit (B, KB, MB, GB, TB). Examples: \"10GB\", \"500MB\". Use 0 for unlimited."
    )]
    pub max_size: Option<String>,

    /// Maximum number of cached entries
    #[arg(
        long,
        global = true,
        help = "Maximum number of cached entries. Use 0 for unlimited."
    )]
    pub max_entries: Option<u64>,

    /// Chunk size with optional unit
    #[arg(
        long,
        global = true,
        help = "Size of the chunks handed to readers, with optional unit. Example: \"64KB\""
    )]
    pub chunk_size: Option<String>,

    /// Slow consumer timeout
    #[arg(
        long,
        global = true,
        help = "How long a reader may stall a chunk before it is dropped (ms, s, m, h). Example: \"30s\""
    )]
    pub slow_consumer_timeout: Option<String>,

    /// Entry time to live
    #[arg(
        long,
        global = true,
        help = "Treat entries older than this as missing (ms, s, m, h, d). Example: \"7d\""
    )]
    pub ttl: Option<String>,

    /// Abort downloads nobody reads any more
    #[arg(
        long,
        global = true,
        help = "Abort an upstream download once its last reader goes away"
    )]
    pub abort_orphaned: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Log file
    #[arg(
        long,
        global = true,
        help = "Also write logs to this file (truncated on start)"
    )]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch resources through the cache
    Fetch(FetchArgs),

    /// List cached entries, least recently used first
    List,

    /// Print cache statistics as JSON
    Stats,

    /// Remove entries from the cache
    Invalidate {
        #[arg(required = true, help = "Cache keys to remove (as shown by `list`)")]
        keys: Vec<String>,
    },

    /// Run an eviction pass now
    Evict,

    /// Remove every cached entry
    Clear,
}

#[derive(clap::Args, Debug)]
pub struct FetchArgs {
    /// Inputs to fetch
    #[arg(
        required = true,
        help = "HTTP(S) URLs, or paths relative to --root for local files"
    )]
    pub input: Vec<String>,

    /// Output directory
    #[arg(
        short,
        long,
        help = "Directory where fetched resources are written (omit to only warm the cache)"
    )]
    pub output_dir: Option<PathBuf>,

    /// Root directory for local inputs
    #[arg(
        long,
        default_value = ".",
        help = "Root directory local inputs are resolved against"
    )]
    pub root: PathBuf,

    /// Overall HTTP timeout in seconds
    #[arg(
        long,
        default_value = "0",
        help = "Overall timeout in seconds for HTTP requests (0 for none)"
    )]
    pub timeout: u64,

    /// Connection timeout in seconds
    #[arg(
        long,
        default_value = "30",
        help = "Connection timeout in seconds (time to establish initial connection)"
    )]
    pub connect_timeout: u64,
}
