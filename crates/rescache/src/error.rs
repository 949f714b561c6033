use std::sync::Arc;

/// Errors surfaced by the cache engine.
///
/// The type is `Clone` so that a single upstream or disk failure can be
/// delivered to every consumer attached to the same download pipe.
#[derive(Debug, thiserror::Error, Clone)]
pub enum CacheError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Cache store I/O error: {source}")]
    StoreIo {
        #[from]
        source: Arc<std::io::Error>,
    },

    #[error("Consumer dropped for falling behind the download")]
    SlowConsumerDropped,

    #[error("Download cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Whether the error identifies a resource the source does not have.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::ResourceNotFound(_))
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CacheError::SourceUnavailable(_)
                | CacheError::SlowConsumerDropped
                | CacheError::Cancelled
        )
    }

    pub(crate) fn store(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        CacheError::StoreIo {
            source: Arc::new(std::io::Error::new(err.kind(), format!("{context}: {err}"))),
        }
    }
}

// Manual implementation because of the Arc wrapping.
impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::StoreIo {
            source: Arc::new(err),
        }
    }
}

/// The original error stays reachable through `get_ref()`.
impl From<CacheError> for std::io::Error {
    fn from(err: CacheError) -> Self {
        let kind = match &err {
            CacheError::StoreIo { source } => source.kind(),
            CacheError::ResourceNotFound(_) => std::io::ErrorKind::NotFound,
            CacheError::SlowConsumerDropped => std::io::ErrorKind::UnexpectedEof,
            CacheError::Cancelled => std::io::ErrorKind::Interrupted,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::NOT_FOUND) {
            CacheError::ResourceNotFound(err.to_string())
        } else {
            CacheError::SourceUnavailable(err.to_string())
        }
    }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;
