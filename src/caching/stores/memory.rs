//! # In-Process Backend
//!
//! `DashMap` of values with absolute expiry, a periodic sweep of expired
//! entries and a bound on the number of entries. When the bound is reached
//! expired entries are dropped, then a batch of the entries closest to expiry
//! (a tenth of the bound) is evicted so the next inserts find room.

use super::{BackendKind, BackendStats, KvBackend};
use crate::caching::CacheResult;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant};
use tracing::debug;

/// In-process backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryBackendConfig {
    /// Maximum number of entries
    pub max_entries: usize,

    /// Cleanup interval for expired entries
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for InMemoryBackendConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Instant,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process key-value backend
pub struct InMemoryBackend {
    config: InMemoryBackendConfig,
    entries: Arc<DashMap<String, StoredValue>>,
    evictions: AtomicU64,
    expired_cleanups: Arc<AtomicU64>,
    cleanup_task: tokio::task::JoinHandle<()>,
}

impl InMemoryBackend {
    /// Create the backend and start its cleanup task
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: InMemoryBackendConfig) -> Self {
        let entries = Arc::new(DashMap::new());
        let expired_cleanups = Arc::new(AtomicU64::new(0));

        let cleanup_task = {
            let entries = entries.clone();
            let expired_cleanups = expired_cleanups.clone();
            let cleanup_interval = config.cleanup_interval;

            tokio::spawn(async move {
                let mut ticker = interval(cleanup_interval);
                loop {
                    ticker.tick().await;
                    let removed = Self::sweep_expired(&entries);
                    if removed > 0 {
                        expired_cleanups.fetch_add(removed, Ordering::Relaxed);
                        debug!(removed, "Swept expired in-memory cache entries");
                    }
                }
            })
        };

        Self {
            config,
            entries,
            evictions: AtomicU64::new(0),
            expired_cleanups,
            cleanup_task,
        }
    }

    fn sweep_expired(entries: &DashMap<String, StoredValue>) -> u64 {
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, stored| !stored.is_expired(now));
        before.saturating_sub(entries.len()) as u64
    }

    /// Make room for one new key
    fn evict_if_needed(&self) {
        let max_entries = self.config.max_entries;
        if self.entries.len() < max_entries {
            return;
        }

        let swept = Self::sweep_expired(&self.entries);
        if swept > 0 {
            self.expired_cleanups.fetch_add(swept, Ordering::Relaxed);
        }

        let len = self.entries.len();
        if len < max_entries {
            return;
        }

        let batch = (len + 1 - max_entries).max(max_entries / 10).max(1);
        let mut candidates: Vec<(Instant, String)> = self
            .entries
            .iter()
            .map(|entry| (entry.value().expires_at, entry.key().clone()))
            .collect();
        if batch < candidates.len() {
            candidates.select_nth_unstable_by_key(batch - 1, |(expires_at, _)| *expires_at);
            candidates.truncate(batch);
        }

        let mut evicted = 0;
        for (_, key) in candidates {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        debug!(evicted, max_entries, "Evicted in-memory cache entries");
    }

    fn live_value(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let stored = self.entries.get(key)?;
        if stored.is_expired(now) {
            drop(stored);
            self.entries.remove_if(key, |_, v| v.is_expired(now));
            return None;
        }
        Some(stored.value.clone())
    }
}

impl Drop for InMemoryBackend {
    fn drop(&mut self) {
        self.cleanup_task.abort();
    }
}

#[async_trait]
impl KvBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        if !self.entries.contains_key(key) {
            self.evict_if_needed();
        }

        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        let now = Instant::now();
        let stored = StoredValue {
            value: value.to_vec(),
            expires_at: now + ttl,
        };

        // The entry guard holds the shard lock, so check and insert are atomic.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(stored);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(stored);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn keys_by_prefix(&self, prefix: &str) -> CacheResult<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn stats(&self) -> CacheResult<BackendStats> {
        Ok(BackendStats {
            entries: Some(self.entries.len()),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_cleanups: self.expired_cleanups.load(Ordering::Relaxed),
        })
    }

    async fn health_check(&self) -> CacheResult<bool> {
        Ok(!self.cleanup_task.is_finished())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn backend() -> InMemoryBackend {
        InMemoryBackend::new(InMemoryBackendConfig::default())
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let backend = backend();
        let ttl = Duration::from_secs(60);

        backend.set("woo:GET:products?", b"[]", ttl).await.unwrap();
        assert_eq!(
            backend.get("woo:GET:products?").await.unwrap(),
            Some(b"[]".to_vec())
        );

        assert!(backend.delete("woo:GET:products?").await.unwrap());
        assert!(!backend.delete("woo:GET:products?").await.unwrap());
        assert_eq!(backend.get("woo:GET:products?").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiration() {
        let backend = backend();
        backend
            .set("expiring", b"value", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(backend.get("expiring").await.unwrap().is_some());

        sleep(Duration::from_millis(80)).await;

        assert_eq!(backend.get("expiring").await.unwrap(), None);
        assert!(backend.keys_by_prefix("exp").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let backend = backend();
        let ttl = Duration::from_millis(50);

        assert!(backend.set_if_absent("claim", b"a", ttl).await.unwrap());
        assert!(!backend.set_if_absent("claim", b"b", ttl).await.unwrap());
        assert_eq!(backend.get("claim").await.unwrap(), Some(b"a".to_vec()));

        sleep(Duration::from_millis(80)).await;
        assert!(backend.set_if_absent("claim", b"c", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_by_prefix() {
        let backend = backend();
        let ttl = Duration::from_secs(60);
        backend.set("woo:GET:products?", b"1", ttl).await.unwrap();
        backend.set("woo:GET:orders?", b"2", ttl).await.unwrap();
        backend.set("dedup-claim:woo:GET:products?", b"3", ttl).await.unwrap();

        let mut keys = backend.keys_by_prefix("woo:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["woo:GET:orders?", "woo:GET:products?"]);
    }

    #[tokio::test]
    async fn test_eviction_prefers_soonest_expiry() {
        let backend = InMemoryBackend::new(InMemoryBackendConfig {
            max_entries: 3,
            ..Default::default()
        });

        backend.set("long", b"1", Duration::from_secs(600)).await.unwrap();
        backend.set("short", b"2", Duration::from_secs(5)).await.unwrap();
        backend.set("medium", b"3", Duration::from_secs(60)).await.unwrap();
        backend.set("new", b"4", Duration::from_secs(60)).await.unwrap();

        assert_eq!(backend.get("short").await.unwrap(), None);
        assert!(backend.get("long").await.unwrap().is_some());
        assert!(backend.get("new").await.unwrap().is_some());

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.entries, Some(3));
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn test_eviction_frees_a_batch() {
        let backend = InMemoryBackend::new(InMemoryBackendConfig {
            max_entries: 20,
            ..Default::default()
        });
        for i in 0..20u64 {
            let ttl = Duration::from_secs(60 + i);
            backend.set(&format!("k{}", i), b"v", ttl).await.unwrap();
        }

        backend.set("k20", b"v", Duration::from_secs(600)).await.unwrap();
        assert_eq!(backend.get("k0").await.unwrap(), None);
        assert_eq!(backend.get("k1").await.unwrap(), None);
        assert!(backend.get("k2").await.unwrap().is_some());

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.entries, Some(19));
        assert_eq!(stats.evictions, 2);

        // room left by the batch, no scan needed
        backend.set("k21", b"v", Duration::from_secs(600)).await.unwrap();
        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.entries, Some(20));
        assert_eq!(stats.evictions, 2);
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let backend = InMemoryBackend::new(InMemoryBackendConfig {
            max_entries: 2,
            ..Default::default()
        });
        backend.set("a", b"1", Duration::from_secs(60)).await.unwrap();
        backend.set("b", b"2", Duration::from_secs(60)).await.unwrap();
        backend.set("a", b"3", Duration::from_secs(60)).await.unwrap();

        assert_eq!(backend.get("a").await.unwrap(), Some(b"3".to_vec()));
        assert!(backend.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_task_sweeps() {
        let backend = InMemoryBackend::new(InMemoryBackendConfig {
            max_entries: 100,
            cleanup_interval: Duration::from_millis(20),
        });
        backend.set("gone", b"x", Duration::from_millis(10)).await.unwrap();

        sleep(Duration::from_millis(100)).await;

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.entries, Some(0));
        assert!(stats.expired_cleanups >= 1);
        assert!(backend.health_check().await.unwrap());
        assert_eq!(backend.kind(), BackendKind::InProcess);
    }
}
