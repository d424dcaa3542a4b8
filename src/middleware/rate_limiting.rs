//! # Rate Limiting
//!
//! Gate in front of the cache and upstream layers, keyed by client identity and
//! logical endpoint. Algorithms and storage are pluggable:
//! - `RateLimitAlgorithm`: token bucket or fixed sub-window counter
//! - `RateLimitStorage`: in-process `DashMap` or Redis
//!
//! Storage failures fail open: the request is allowed and a warning logged,
//! because refusing shoppers over a limiter outage is worse than a short
//! period without limits.

use crate::core::error::{ProxyError, ProxyResult};
use crate::observability::metrics;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during rate limiting operations
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Redis connection error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl From<RateLimitError> for ProxyError {
    fn from(err: RateLimitError) -> Self {
        ProxyError::internal(format!("Rate limiter: {}", err))
    }
}

/// Rate limiting algorithm types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithmType {
    TokenBucket,
    SlidingWindow,
}

/// Where counters live
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStorageType {
    Memory,
    /// Shared with other instances through the cache Redis
    Redis,
}

/// Configuration for rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Algorithm to use for rate limiting
    pub algorithm: RateLimitAlgorithmType,
    /// Maximum requests allowed per window
    pub requests_per_window: u32,
    /// Duration of the rate limiting window
    #[serde(with = "humantime_serde")]
    pub window_duration: Duration,
    /// Burst size for token bucket algorithm
    pub burst_size: Option<u32>,
    pub storage: RateLimitStorageType,
    /// Key prefix for stored counters
    pub key_prefix: String,
    /// Overrides per logical endpoint
    pub endpoint_rules: HashMap<String, EndpointRateLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: RateLimitAlgorithmType::TokenBucket,
            requests_per_window: 600,
            window_duration: Duration::from_secs(60),
            burst_size: Some(100),
            storage: RateLimitStorageType::Memory,
            key_prefix: "rate_limit".to_string(),
            endpoint_rules: HashMap::new(),
        }
    }
}

/// Endpoint-specific rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRateLimit {
    pub requests_per_window: u32,
    #[serde(with = "humantime_serde")]
    pub window_duration: Duration,
    pub burst_size: Option<u32>,
}

/// Rate limit decision result
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after: Option<Duration>,
}

impl RateLimitResult {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: u32::MAX,
            retry_after: None,
        }
    }
}

/// Trait for rate limiting algorithms
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync {
    async fn is_allowed(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        burst_size: Option<u32>,
    ) -> Result<RateLimitResult, RateLimitError>;
}

/// Trait for rate limiting storage backends
///
/// Both operations are a single atomic read-modify-write on the backend.
#[async_trait]
pub trait RateLimitStorage: Send + Sync {
    /// Refill the bucket at `key` up to `now_ms` and try to take one token
    async fn take_token(
        &self,
        key: &str,
        bucket: BucketSpec,
        now_ms: u64,
        ttl: Duration,
    ) -> Result<TokenTake, RateLimitError>;

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, RateLimitError>;
}

/// Shape of one token bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    pub capacity: f64,
    pub refill_per_ms: f64,
}

impl BucketSpec {
    pub fn new(limit: u32, window: Duration, burst_size: Option<u32>) -> Self {
        Self {
            capacity: burst_size.unwrap_or(limit).max(1) as f64,
            refill_per_ms: limit as f64 / (window.as_millis().max(1) as f64),
        }
    }

    /// How long an untouched bucket must be kept before it is full again
    fn idle_ttl(&self, window: Duration) -> Duration {
        if self.refill_per_ms <= 0.0 {
            return window;
        }
        let refill_ms = (self.capacity / self.refill_per_ms).ceil() as u64;
        window.max(Duration::from_millis(refill_ms))
    }

    /// Apply one check to the stored state `"{tokens}:{last_refill_ms}"`,
    /// returning the outcome and the state to write back
    fn step(&self, state: Option<&str>, now_ms: u64) -> (TokenTake, String) {
        let (tokens, last_refill) = state
            .and_then(|state| {
                let (tokens, refill) = state.split_once(':')?;
                Some((tokens.parse::<f64>().ok()?, refill.parse::<u64>().ok()?))
            })
            .unwrap_or((self.capacity, now_ms));

        let elapsed = now_ms.saturating_sub(last_refill) as f64;
        let mut tokens = (tokens + elapsed * self.refill_per_ms).min(self.capacity);

        let allowed = tokens >= 1.0;
        if allowed {
            tokens -= 1.0;
        }

        (TokenTake { allowed, tokens }, format!("{}:{}", tokens, now_ms))
    }
}

/// Outcome of one token bucket step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenTake {
    pub allowed: bool,
    /// Tokens left after this step
    pub tokens: f64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Round a wait up to whole seconds for `Retry-After`, never below one
fn whole_seconds(wait: Duration) -> Duration {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    Duration::from_secs(secs.max(1))
}

/// Token bucket algorithm
///
/// State is one value, `"{tokens}:{last_refill_ms}"`. The bucket refills at
/// `limit / window` tokens per second up to `burst_size` (or `limit`).
pub struct TokenBucketAlgorithm {
    storage: Arc<dyn RateLimitStorage>,
}

impl TokenBucketAlgorithm {
    pub fn new(storage: Arc<dyn RateLimitStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucketAlgorithm {
    async fn is_allowed(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        burst_size: Option<u32>,
    ) -> Result<RateLimitResult, RateLimitError> {
        let bucket_key = format!("bucket:{}", key);
        let bucket = BucketSpec::new(limit, window, burst_size);

        let TokenTake { allowed, tokens } = self
            .storage
            .take_token(&bucket_key, bucket, now_millis(), bucket.idle_ttl(window))
            .await?;

        let retry_after = if allowed || bucket.refill_per_ms <= 0.0 {
            None
        } else {
            let wait_ms = ((1.0 - tokens) / bucket.refill_per_ms).ceil() as u64;
            Some(whole_seconds(Duration::from_millis(wait_ms)))
        };

        Ok(RateLimitResult {
            allowed,
            remaining: tokens.floor() as u32,
            retry_after,
        })
    }
}

/// Fixed sub-window counter ("sliding window")
pub struct SlidingWindowAlgorithm {
    storage: Arc<dyn RateLimitStorage>,
}

impl SlidingWindowAlgorithm {
    pub fn new(storage: Arc<dyn RateLimitStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl RateLimitAlgorithm for SlidingWindowAlgorithm {
    async fn is_allowed(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        _burst_size: Option<u32>,
    ) -> Result<RateLimitResult, RateLimitError> {
        let window_ms = window.as_millis().max(1) as u64;
        let now = now_millis();
        let slot = now / window_ms;
        let window_key = format!("window:{}:{}", key, slot);

        let current_count = self.storage.increment(&window_key, window).await?;

        let allowed = current_count <= limit as u64;
        let remaining = (limit as u64).saturating_sub(current_count) as u32;
        let retry_after = if allowed {
            None
        } else {
            let window_end = (slot + 1) * window_ms;
            Some(whole_seconds(Duration::from_millis(window_end.saturating_sub(now))))
        };

        Ok(RateLimitResult {
            allowed,
            remaining,
            retry_after,
        })
    }
}

/// In-memory storage implementation
///
/// Expired keys are swept at most once per `sweep_interval`, piggybacked on
/// regular calls, so the map only holds keys that are still live or expired
/// within the last interval.
pub struct InMemoryStorage {
    data: Arc<DashMap<String, (String, Instant)>>,
    created: Instant,
    sweep_interval: Duration,
    /// Milliseconds after `created` of the last sweep
    last_sweep_ms: AtomicU64,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_sweep_interval(Duration::from_secs(30))
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            data: Arc::new(DashMap::new()),
            created: Instant::now(),
            sweep_interval,
            last_sweep_ms: AtomicU64::new(0),
        }
    }

    /// Number of stored keys, live or not yet swept
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remove expired entries, returning how many were dropped
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, (_, expiry)| *expiry > now);
        before.saturating_sub(self.data.len())
    }

    fn maybe_sweep(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if elapsed.saturating_sub(last) < self.sweep_interval.as_millis() as u64 {
            return;
        }
        // one caller wins the sweep
        if self
            .last_sweep_ms
            .compare_exchange(last, elapsed, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let removed = self.cleanup_expired();
            if removed > 0 {
                debug!(removed, "Swept expired rate limit keys");
            }
        }
    }
}

#[async_trait]
impl RateLimitStorage for InMemoryStorage {
    async fn take_token(
        &self,
        key: &str,
        bucket: BucketSpec,
        now_ms: u64,
        ttl: Duration,
    ) -> Result<TokenTake, RateLimitError> {
        self.maybe_sweep();
        let now = Instant::now();

        // the entry guard holds the shard lock for the whole read-modify-write
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| (String::new(), now));
        let (value, expiry) = entry.value_mut();

        let previous = (*expiry > now && !value.is_empty()).then_some(value.as_str());
        let (take, next) = bucket.step(previous, now_ms);
        *value = next;
        *expiry = now + ttl;
        Ok(take)
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, RateLimitError> {
        self.maybe_sweep();
        let now = Instant::now();
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| ("0".to_string(), now + ttl));

        let (value, expiry) = entry.value_mut();
        let current = if *expiry > now {
            value.parse::<u64>().unwrap_or(0)
        } else {
            *expiry = now + ttl;
            0
        };
        let next = current + 1;
        *value = next.to_string();
        Ok(next)
    }
}

/// Redis storage implementation
pub struct RedisStorage {
    connection: ConnectionManager,
    take_script: redis::Script,
}

impl RedisStorage {
    pub async fn new(redis_url: &str) -> Result<Self, RateLimitError> {
        let client = RedisClient::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            connection,
            take_script: redis::Script::new(TAKE_TOKEN_SCRIPT),
        })
    }
}

/// Same step as `BucketSpec::step`, executed inside Redis
const TAKE_TOKEN_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local refill = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local tokens = capacity
local last = now
local state = redis.call('GET', KEYS[1])
if state then
  local sep = string.find(state, ':', 1, true)
  if sep then
    tokens = tonumber(string.sub(state, 1, sep - 1)) or capacity
    last = tonumber(string.sub(state, sep + 1)) or now
  end
end
tokens = math.min(capacity, tokens + math.max(0, now - last) * refill)
local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end
redis.call('SET', KEYS[1], tostring(tokens) .. ':' .. string.format('%d', now), 'PX', ARGV[4])
return {allowed, tostring(tokens)}
"#;

#[async_trait]
impl RateLimitStorage for RedisStorage {
    async fn take_token(
        &self,
        key: &str,
        bucket: BucketSpec,
        now_ms: u64,
        ttl: Duration,
    ) -> Result<TokenTake, RateLimitError> {
        let mut conn = self.connection.clone();
        let (allowed, tokens): (i64, String) = self
            .take_script
            .key(key)
            .arg(bucket.capacity)
            .arg(bucket.refill_per_ms)
            .arg(now_ms)
            .arg((ttl.as_millis() as u64).max(1))
            .invoke_async(&mut conn)
            .await?;

        let tokens = tokens
            .parse::<f64>()
            .map_err(|e| RateLimitError::Storage(format!("bad bucket state from Redis: {}", e)))?;
        Ok(TokenTake {
            allowed: allowed == 1,
            tokens,
        })
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, RateLimitError> {
        let mut conn = self.connection.clone();
        let count: u64 = conn.incr(key, 1).await?;
        if count == 1 {
            conn.pexpire::<_, ()>(key, (ttl.as_millis() as i64).max(1)).await?;
        }
        Ok(count)
    }
}

/// Rate limiting key generator
pub struct RateLimitKeyGenerator;

impl RateLimitKeyGenerator {
    pub fn generate_key(prefix: &str, client: &str, endpoint: &str) -> String {
        let client = if client.is_empty() { "anonymous" } else { client };
        format!("{}:client:{}:endpoint:{}", prefix, client, endpoint)
    }
}

/// Main rate limiter implementation
pub struct RateLimiter {
    config: RateLimitConfig,
    algorithm: Arc<dyn RateLimitAlgorithm>,
    requests_allowed: AtomicU64,
    requests_denied: AtomicU64,
    storage_failures: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, storage: Arc<dyn RateLimitStorage>) -> Self {
        let algorithm: Arc<dyn RateLimitAlgorithm> = match config.algorithm {
            RateLimitAlgorithmType::TokenBucket => Arc::new(TokenBucketAlgorithm::new(storage)),
            RateLimitAlgorithmType::SlidingWindow => Arc::new(SlidingWindowAlgorithm::new(storage)),
        };

        Self {
            config,
            algorithm,
            requests_allowed: AtomicU64::new(0),
            requests_denied: AtomicU64::new(0),
            storage_failures: AtomicU64::new(0),
        }
    }

    /// In-process limiter with the given configuration
    pub fn in_memory(config: RateLimitConfig) -> Self {
        Self::new(config, Arc::new(InMemoryStorage::new()))
    }

    /// Limiter using the configured storage, falling back to memory if Redis is unreachable
    pub async fn from_config(config: RateLimitConfig, redis_url: Option<&str>) -> Self {
        if config.storage == RateLimitStorageType::Redis {
            match redis_url {
                Some(url) => match RedisStorage::new(url).await {
                    Ok(storage) => return Self::new(config, Arc::new(storage)),
                    Err(e) => {
                        warn!(error = %e, "Rate limit Redis unavailable, using in-memory counters")
                    }
                },
                None => warn!("Rate limit Redis URL not configured, using in-memory counters"),
            }
        }
        Self::in_memory(config)
    }

    /// Check the gate for one request
    ///
    /// Returns `ProxyError::RateLimited` when the client is over its limit.
    pub async fn check(&self, client: &str, endpoint: &str) -> ProxyResult<RateLimitResult> {
        if !self.config.enabled {
            return Ok(RateLimitResult::unlimited());
        }

        let (limit, window, burst_size) = self.endpoint_limits(endpoint);
        let key = RateLimitKeyGenerator::generate_key(&self.config.key_prefix, client, endpoint);

        let result = match self.algorithm.is_allowed(&key, limit, window, burst_size).await {
            Ok(result) => result,
            Err(e) => {
                self.storage_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Rate limit storage failed, allowing request");
                return Ok(RateLimitResult::unlimited());
            }
        };

        if result.allowed {
            self.requests_allowed.fetch_add(1, Ordering::Relaxed);
            return Ok(result);
        }

        self.requests_denied.fetch_add(1, Ordering::Relaxed);
        metrics::record_rate_limited(endpoint);
        debug!(key = %key, limit, "Rate limit exceeded");

        Err(ProxyError::RateLimited {
            retry_after_secs: result.retry_after.map(|d| d.as_secs()).unwrap_or(1).max(1),
        })
    }

    fn endpoint_limits(&self, endpoint: &str) -> (u32, Duration, Option<u32>) {
        match self.config.endpoint_rules.get(endpoint) {
            Some(rule) => (rule.requests_per_window, rule.window_duration, rule.burst_size),
            None => (
                self.config.requests_per_window,
                self.config.window_duration,
                self.config.burst_size,
            ),
        }
    }

    pub fn get_metrics(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            requests_allowed: self.requests_allowed.load(Ordering::Relaxed),
            requests_denied: self.requests_denied.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

/// Snapshot of rate limiting metrics
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub requests_allowed: u64,
    pub requests_denied: u64,
    pub storage_failures: u64,
}
