//! # Caching Module
//!
//! Response caching and request collapsing for the storefront proxy.
//!
//! ## Architecture
//! 1. **Key Generator**: canonical cache/dedup keys from a normalized request
//! 2. **Stores**: the key-value backend capability (in-process or Redis)
//! 3. **Response Cache**: TTL entries with integrity tags and tag invalidation
//! 4. **Deduplication**: one upstream call per key per window
//!
//! Everything here is constructed once at startup and injected; nothing is a
//! process-wide singleton, so tests build isolated instances freely.

pub mod cache_manager;
pub mod deduplication;
pub mod key_generator;
pub mod stores;

pub use cache_manager::{
    CacheEntry, CacheStats, ResponseCache, ResponseCacheConfig, CACHE_TAGS_METADATA,
};
pub use deduplication::{DedupClaim, Deduplicated, RequestDeduplicator};
pub use key_generator::{CacheKeyGenerator, RequestShape};
pub use stores::{BackendKind, InMemoryBackend, KvBackend, RedisBackend};

use crate::core::error::ProxyError;

/// Cache operation result
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache store error: {message}")]
    Store { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Cache operation timeout")]
    Timeout,
}

impl From<CacheError> for ProxyError {
    fn from(err: CacheError) -> Self {
        ProxyError::Cache {
            message: err.to_string(),
        }
    }
}
