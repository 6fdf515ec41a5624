//! Error types for the cache layer.

use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur in cache operations.
///
/// Absence is never an error: `get` returns `Option`, and disk-tier
/// verification failures are demoted to misses inside the cache. The
/// variants here are the conditions that do surface to callers.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Compilation of a script failed.
    #[error("compile error: {0}")]
    Compile(String),

    /// IO error (file system).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
