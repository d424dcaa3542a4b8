//! # Key-Value Backends
//!
//! The response cache and the cross-instance dedup claim only ever talk to the
//! [`KvBackend`] capability. Two variants exist: an in-process map and Redis.

pub mod memory;
pub mod redis_store;

pub use memory::{InMemoryBackend, InMemoryBackendConfig};
pub use redis_store::{RedisBackend, RedisBackendConfig};

use super::CacheResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which flavour of backend is in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    InProcess,
    Distributed,
}

impl BackendKind {
    /// Shared with other proxy instances
    pub fn is_distributed(&self) -> bool {
        matches!(self, Self::Distributed)
    }
}

/// Key-value backend capability
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Get a raw value, `None` when absent or expired
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Set a value with TTL, overwriting any prior value
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()>;

    /// Set a value only when the key is absent; `true` when this call stored it
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool>;

    /// Delete a key; `true` when something was removed
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// All live keys starting with `prefix`
    async fn keys_by_prefix(&self, prefix: &str) -> CacheResult<Vec<String>>;

    /// Backend statistics
    async fn stats(&self) -> CacheResult<BackendStats>;

    /// Perform health check
    async fn health_check(&self) -> CacheResult<bool>;

    fn kind(&self) -> BackendKind;
}

/// Backend statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendStats {
    /// Number of entries, when the backend can tell cheaply
    pub entries: Option<usize>,

    /// Entries removed to stay under the size bound
    pub evictions: u64,

    /// Expired entries swept by cleanup
    pub expired_cleanups: u64,
}
