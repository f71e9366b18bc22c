//! Core error types.

use thiserror::Error;

/// Errors produced by the core building blocks.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The submitted transaction payload does not match the wire format.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// A cache key that was never registered and has no fallback.
    #[error("cache key not registered: {0}")]
    CacheMissing(String),

    /// A cache refresh function failed. The underlying cause is logged,
    /// never surfaced to clients.
    #[error("Failed to update cache.")]
    CacheRefresh,
}

/// Result type for core operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;
