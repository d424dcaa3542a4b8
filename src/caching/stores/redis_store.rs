//! # Redis Backend
//!
//! Distributed key-value backend over a `redis` `ConnectionManager`. Every key
//! is stored under a namespace prefix, and every operation is bounded by an
//! operation timeout so a slow Redis degrades into a cache miss upstream.

use super::{BackendKind, BackendStats, KvBackend};
use crate::caching::{CacheError, CacheResult};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Redis backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisBackendConfig {
    /// Redis connection URL
    pub url: String,

    /// Namespace prefix for every key this backend touches
    pub namespace: String,

    /// Time allowed for the initial connection
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,

    /// Bound on a single command
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,
}

impl Default for RedisBackendConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            namespace: "storefront-proxy:".to_string(),
            connection_timeout: Duration::from_secs(2),
            operation_timeout: Duration::from_millis(250),
        }
    }
}

/// Redis key-value backend
pub struct RedisBackend {
    config: RedisBackendConfig,
    connection: ConnectionManager,
}

impl RedisBackend {
    /// Connect to Redis
    pub async fn connect(config: RedisBackendConfig) -> CacheResult<Self> {
        let client = Client::open(config.url.as_str())?;

        let connection =
            tokio::time::timeout(config.connection_timeout, ConnectionManager::new(client))
                .await
                .map_err(|_| CacheError::Timeout)??;

        info!(url = %redact_url(&config.url), "Redis cache backend connected");

        Ok(Self { config, connection })
    }

    /// Get the full key with namespace
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.namespace, key)
    }

    /// Run one command against a cloned connection handle, bounded by the operation timeout
    async fn run<T, F, Fut>(&self, operation: F) -> CacheResult<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let pending = operation(self.connection.clone());
        match tokio::time::timeout(self.config.operation_timeout, pending).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::Timeout),
        }
    }

    async fn scan_full_keys(&self, pattern: String) -> CacheResult<Vec<String>> {
        self.run(|mut conn| async move {
            let mut cursor: u64 = 0;
            let mut keys = Vec::new();

            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(500)
                    .query_async(&mut conn)
                    .await?;

                keys.extend(batch);

                if next == 0 {
                    break;
                }
                cursor = next;
            }

            Ok(keys)
        })
        .await
    }
}

/// Escape glob metacharacters for `SCAN MATCH`
fn escape_pattern(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Strip credentials from a connection URL before logging it
fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let full_key = self.full_key(key);
        self.run(|mut conn| async move { conn.get::<_, Option<Vec<u8>>>(&full_key).await })
            .await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let full_key = self.full_key(key);
        let value = value.to_vec();

        self.run(|mut conn| async move {
            redis::cmd("SET")
                .arg(&full_key)
                .arg(value)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await?;

        debug!(key = %key, ttl_ms = ttl_millis(ttl), "Set Redis cache key");
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        let full_key = self.full_key(key);
        let value = value.to_vec();

        let reply: Option<String> = self
            .run(|mut conn| async move {
                redis::cmd("SET")
                    .arg(&full_key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let full_key = self.full_key(key);
        let deleted: i64 = self
            .run(|mut conn| async move { conn.del(&full_key).await })
            .await?;
        Ok(deleted > 0)
    }

    async fn keys_by_prefix(&self, prefix: &str) -> CacheResult<Vec<String>> {
        let pattern = format!("{}*", escape_pattern(&self.full_key(prefix)));
        let namespace_len = self.config.namespace.len();

        Ok(self
            .scan_full_keys(pattern)
            .await?
            .into_iter()
            .filter_map(|full| full.get(namespace_len..).map(str::to_string))
            .collect())
    }

    async fn stats(&self) -> CacheResult<BackendStats> {
        let pattern = format!("{}*", escape_pattern(&self.config.namespace));
        let entries = self.scan_full_keys(pattern).await?.len();

        // Redis handles eviction and TTL cleanup internally
        Ok(BackendStats {
            entries: Some(entries),
            evictions: 0,
            expired_cleanups: 0,
        })
    }

    async fn health_check(&self) -> CacheResult<bool> {
        let pong: String = self
            .run(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(pong == "PONG")
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Distributed
    }
}
