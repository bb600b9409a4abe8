//! Cache error types.
//!
//! These never cross the [`LocalCache`](crate::LocalCache) API; they are
//! produced by backends and logged where they are swallowed.

use thiserror::Error;

/// Error type for cache backend operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Backend-specific failure (quota exceeded, unavailable store)
    #[error("Cache backend error: {0}")]
    Backend(String),

    /// Value could not be encoded or a stored document could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Key could not be mapped to or from backend storage
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for cache backend operations.
pub type CacheResult<T> = Result<T, CacheError>;
