pub mod files;
mod size;
mod time;

// Export utility functions
pub use self::size::format_bytes;
pub use self::size::parse_size;
pub use self::time::format_age;
pub use self::time::parse_duration;
