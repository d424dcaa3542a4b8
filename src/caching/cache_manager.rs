//! # Response Cache
//!
//! TTL cache of upstream bodies on top of a [`KvBackend`]. Each entry carries an
//! integrity tag derived from the body, used for conditional requests.
//!
//! Backend failures never reach the caller: reads degrade to "absent" and
//! writes or invalidations degrade to no-ops, with a warning in the log. The
//! proxy stays correct, only slower, while the cache is down.

use super::stores::{BackendKind, KvBackend};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Metadata key holding the comma-separated invalidation tags of an entry
pub const CACHE_TAGS_METADATA: &str = "cache-tags";

/// Cached upstream response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,

    /// Serialized upstream payload
    pub body: String,

    /// Content hash used as the entity tag
    pub integrity_tag: String,

    pub created_at: DateTime<Utc>,

    /// Fresh strictly before this instant
    pub expires_at: DateTime<Utc>,

    /// Auxiliary response headers and invalidation tags
    pub metadata: BTreeMap<String, String>,
}

impl CacheEntry {
    pub fn is_fresh(&self) -> bool {
        Utc::now() < self.expires_at
    }

    /// Invalidation tags recorded for this entry
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.metadata
            .get(CACHE_TAGS_METADATA)
            .map(|tags| tags.as_str())
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags().any(|candidate| candidate == tag)
    }

    /// Seconds until expiry, zero once stale
    pub fn remaining_ttl(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Integrity tag for a body: the first 32 hex characters of its SHA-256
pub fn integrity_tag(body: &str) -> String {
    let digest = hex::encode(Sha256::digest(body.as_bytes()));
    digest[..32].to_string()
}

/// Response cache configuration
#[derive(Debug, Clone)]
pub struct ResponseCacheConfig {
    /// Namespace shared by every cache key, used by `invalidate_all`
    pub key_prefix: String,

    /// Extra backend lifetime so expired entries remain available as a fallback
    pub stale_grace: Duration,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "woo:".to_string(),
            stale_grace: Duration::from_secs(3600),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub backend: BackendKind,
    pub entries: Option<usize>,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub stale_serves: u64,
    pub writes: u64,
    pub invalidations: u64,
    pub backend_errors: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_serves: AtomicU64,
    writes: AtomicU64,
    invalidations: AtomicU64,
    backend_errors: AtomicU64,
}

/// TTL response cache
pub struct ResponseCache {
    config: ResponseCacheConfig,
    backend: Arc<dyn KvBackend>,
    counters: Counters,
}

impl ResponseCache {
    pub fn new(backend: Arc<dyn KvBackend>, config: ResponseCacheConfig) -> Self {
        Self {
            config,
            backend,
            counters: Counters::default(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// Fresh entry for `key`, if any
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        match self.load(key).await {
            Some(entry) if entry.is_fresh() => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Cache hit");
                Some(entry)
            }
            _ => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Entry for `key` whether or not it has expired
    ///
    /// Only meant for serving a degraded answer when upstream is unreachable.
    pub async fn get_stale(&self, key: &str) -> Option<CacheEntry> {
        let entry = self.load(key).await?;
        self.counters.stale_serves.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Store `body` under `key`, overwriting any prior entry
    pub async fn set(
        &self,
        key: &str,
        body: String,
        ttl: Duration,
        metadata: BTreeMap<String, String>,
    ) -> CacheEntry {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));

        let entry = CacheEntry {
            key: key.to_string(),
            integrity_tag: integrity_tag(&body),
            body,
            created_at: now,
            expires_at,
            metadata,
        };

        match serde_json::to_vec(&entry) {
            Ok(serialized) => {
                let backend_ttl = ttl + self.config.stale_grace;
                match self.backend.set(key, &serialized, backend_ttl).await {
                    Ok(()) => {
                        self.counters.writes.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(key = %key, error = %e, "Cache write failed, continuing uncached");
                    }
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to serialize cache entry");
            }
        }

        entry
    }

    /// Remove every entry tagged with `tag`, returning how many were removed
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let keys = match self.backend.keys_by_prefix(&self.config.key_prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                warn!(tag = %tag, error = %e, "Cache key scan failed, nothing invalidated");
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys {
            let tagged = match self.load(&key).await {
                Some(entry) => entry.has_tag(tag),
                None => false,
            };
            if tagged && self.remove(&key).await {
                removed += 1;
            }
        }

        self.counters
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        info!(tag = %tag, removed, "Invalidated cache entries by tag");
        removed
    }

    /// Remove every entry in the cache namespace
    pub async fn invalidate_all(&self) -> usize {
        let keys = match self.backend.keys_by_prefix(&self.config.key_prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Cache key scan failed, nothing invalidated");
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys {
            if self.remove(&key).await {
                removed += 1;
            }
        }

        self.counters
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        info!(removed, "Invalidated all cache entries");
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        let backend_stats = match self.backend.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "Failed to read cache backend stats");
                None
            }
        };

        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            backend: self.backend.kind(),
            entries: backend_stats.as_ref().and_then(|s| s.entries),
            hits,
            misses,
            hit_ratio: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            stale_serves: self.counters.stale_serves.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            backend_errors: self.counters.backend_errors.load(Ordering::Relaxed),
            evictions: backend_stats.map(|s| s.evictions).unwrap_or(0),
        }
    }

    pub async fn health_check(&self) -> bool {
        match self.backend.health_check().await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!(error = %e, "Cache backend health check failed");
                false
            }
        }
    }

    async fn load(&self, key: &str) -> Option<CacheEntry> {
        let raw = match self.backend.get(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_slice::<CacheEntry>(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                self.remove(key).await;
                None
            }
        }
    }

    async fn remove(&self, key: &str) -> bool {
        match self.backend.delete(key).await {
            Ok(removed) => removed,
            Err(e) => {
                self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Cache delete failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::stores::{BackendStats, InMemoryBackend, InMemoryBackendConfig};
    use crate::caching::{CacheError, CacheResult};
    use async_trait::async_trait;
    use tokio::time::sleep;

    /// Backend that fails every operation, like an unreachable Redis
    struct UnreachableBackend;

    #[async_trait]
    impl KvBackend for UnreachableBackend {
        async fn get(&self, _key: &str) -> CacheResult<Option<Vec<u8>>> {
            Err(CacheError::Timeout)
        }
        async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> CacheResult<()> {
            Err(CacheError::Timeout)
        }
        async fn set_if_absent(
            &self,
            _key: &str,
            _value: &[u8],
            _ttl: Duration,
        ) -> CacheResult<bool> {
            Err(CacheError::Timeout)
        }
        async fn delete(&self, _key: &str) -> CacheResult<bool> {
            Err(CacheError::Timeout)
        }
        async fn keys_by_prefix(&self, _prefix: &str) -> CacheResult<Vec<String>> {
            Err(CacheError::Timeout)
        }
        async fn stats(&self) -> CacheResult<BackendStats> {
            Err(CacheError::Timeout)
        }
        async fn health_check(&self) -> CacheResult<bool> {
            Err(CacheError::Timeout)
        }
        fn kind(&self) -> BackendKind {
            BackendKind::Distributed
        }
    }

    fn memory_cache() -> ResponseCache {
        ResponseCache::new(
            Arc::new(InMemoryBackend::new(InMemoryBackendConfig::default())),
            ResponseCacheConfig::default(),
        )
    }

    fn tagged(tags: &str) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        metadata.insert(CACHE_TAGS_METADATA.to_string(), tags.to_string());
        metadata
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let cache = memory_cache();
        let body = r#"[{"id":1,"name":"Hoodie"}]"#.to_string();

        let stored = cache
            .set(
                "woo:GET:wc/v3/products?",
                body.clone(),
                Duration::from_secs(60),
                tagged("products"),
            )
            .await;

        let first = cache.get("woo:GET:wc/v3/products?").await.unwrap();
        let second = cache.get("woo:GET:wc/v3/products?").await.unwrap();
        assert_eq!(first.body, body);
        assert_eq!(first.integrity_tag, stored.integrity_tag);
        assert_eq!(first.integrity_tag, second.integrity_tag);
        assert_eq!(first.metadata.get(CACHE_TAGS_METADATA).unwrap(), "products");
    }

    #[test]
    fn test_integrity_tag_tracks_body() {
        let a = integrity_tag(r#"{"id":1}"#);
        assert_eq!(a.len(), 32);
        assert_eq!(a, integrity_tag(r#"{"id":1}"#));
        assert_ne!(a, integrity_tag(r#"{"id":2}"#));
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent_but_stale_available() {
        let cache = memory_cache();
        cache
            .set(
                "woo:GET:wc/v3/shop?",
                "{}".to_string(),
                Duration::from_millis(50),
                BTreeMap::new(),
            )
            .await;

        sleep(Duration::from_millis(80)).await;

        assert!(cache.get("woo:GET:wc/v3/shop?").await.is_none());
        let stale = cache.get_stale("woo:GET:wc/v3/shop?").await.unwrap();
        assert_eq!(stale.body, "{}");
        assert!(!stale.is_fresh());
        assert_eq!(stale.remaining_ttl(), Duration::ZERO);

        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.stale_serves, 1);
    }

    #[tokio::test]
    async fn test_overwrite_changes_tag() {
        let cache = memory_cache();
        let ttl = Duration::from_secs(60);
        let first = cache.set("k", "[1]".to_string(), ttl, BTreeMap::new()).await;
        let second = cache.set("k", "[1,2]".to_string(), ttl, BTreeMap::new()).await;

        assert_ne!(first.integrity_tag, second.integrity_tag);
        assert_eq!(cache.get("k").await.unwrap().body, "[1,2]");
    }

    #[tokio::test]
    async fn test_invalidate_by_tag() {
        let cache = memory_cache();
        let ttl = Duration::from_secs(60);
        for key in [
            "woo:GET:wc/v3/products/categories?",
            "woo:GET:wc/v3/products/categories?page=2",
        ] {
            cache.set(key, "[]".into(), ttl, tagged("categories")).await;
        }
        cache.set("woo:GET:wc/v3/products?", "[]".into(), ttl, tagged("products, catalog")).await;

        assert_eq!(cache.invalidate_by_tag("categories").await, 2);
        assert!(cache.get("woo:GET:wc/v3/products/categories?").await.is_none());
        assert!(cache.get("woo:GET:wc/v3/products?").await.is_some());

        assert_eq!(cache.invalidate_by_tag("catalog").await, 1);
        assert_eq!(cache.invalidate_by_tag("missing").await, 0);
    }

    #[tokio::test]
    async fn test_invalidate_all_keeps_other_namespaces() {
        let backend = Arc::new(InMemoryBackend::new(InMemoryBackendConfig::default()));
        let cache = ResponseCache::new(backend.clone(), ResponseCacheConfig::default());
        let ttl = Duration::from_secs(60);

        cache.set("woo:GET:a?", "1".into(), ttl, BTreeMap::new()).await;
        cache.set("woo:GET:b?", "2".into(), ttl, BTreeMap::new()).await;
        backend.set("dedup-claim:woo:GET:a?", b"1", ttl).await.unwrap();

        assert_eq!(cache.invalidate_all().await, 2);
        assert!(backend.get("dedup-claim:woo:GET:a?").await.unwrap().is_some());
        assert_eq!(cache.stats().await.invalidations, 2);
    }

    #[tokio::test]
    async fn test_unreachable_backend_degrades() {
        let cache =
            ResponseCache::new(Arc::new(UnreachableBackend), ResponseCacheConfig::default());

        let entry = cache
            .set("woo:GET:x?", "[]".to_string(), Duration::from_secs(60), BTreeMap::new())
            .await;
        assert_eq!(entry.body, "[]");
        assert!(cache.get("woo:GET:x?").await.is_none());
        assert!(cache.get_stale("woo:GET:x?").await.is_none());
        assert_eq!(cache.invalidate_by_tag("products").await, 0);
        assert_eq!(cache.invalidate_all().await, 0);
        assert!(!cache.health_check().await);

        let stats = cache.stats().await;
        assert_eq!(stats.writes, 0);
        assert!(stats.backend_errors >= 4);
        assert_eq!(stats.entries, None);
    }
}
