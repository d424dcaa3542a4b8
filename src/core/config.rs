//! # Configuration Module
//!
//! This module holds the proxy configuration and its loading rules.
//!
//! ## Key Features
//! - YAML configuration parsing with serde, every section optional
//! - Human readable durations (`"150ms"`, `"5m"`) through `humantime_serde`
//! - Environment variable overrides applied after the file is read
//! - Validation that reports every problem at once
//!
//! Missing upstream credentials are deliberately not a validation failure: the
//! process must still start, and the affected endpoints answer with a
//! configuration error at request time.

use crate::core::error::{ProxyError, ProxyResult};
use crate::middleware::rate_limiting::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Main proxy configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration
    pub server: ServerSettings,

    /// WooCommerce upstream configuration
    pub upstream: UpstreamSettings,

    /// Response cache configuration
    pub cache: CacheSettings,

    /// Request deduplication configuration
    pub dedup: DedupSettings,

    /// Batching layer configuration
    pub batching: BatchingSettings,

    /// Rate limiting gate configuration
    pub rate_limit: RateLimitConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsSettings,
}

impl ProxyConfig {
    /// Load configuration from an optional YAML file, then apply environment overrides
    ///
    /// A path that does not exist is not an error; defaults are used instead.
    pub async fn load(path: Option<&Path>) -> ProxyResult<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                    ProxyError::config(format!("Failed to read config file: {}", e))
                })?;
                Self::from_yaml_str(&content)?
            }
            _ => Self::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml_str(content: &str) -> ProxyResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| ProxyError::config(format!("Failed to parse config: {}", e)))
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> ProxyResult<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> ProxyResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("WOOCOMMERCE_URL") {
            self.upstream.base_url = Some(url);
        }

        if let Some(key) = lookup("WOOCOMMERCE_CONSUMER_KEY") {
            self.upstream.consumer_key = Some(key);
        }

        if let Some(secret) = lookup("WOOCOMMERCE_CONSUMER_SECRET") {
            self.upstream.consumer_secret = Some(secret);
        }

        if let Some(url) = lookup("REDIS_URL") {
            self.cache.backend = CacheBackendConfig::Redis { url };
        }

        if let Some(addr) = lookup("PROXY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Some(port) = lookup("PROXY_SERVER_HTTP_PORT") {
            self.server.http_port = port
                .parse()
                .map_err(|e| ProxyError::config(format!("Invalid PROXY_SERVER_HTTP_PORT: {}", e)))?;
        }

        if let Some(port) = lookup("PROXY_SERVER_ADMIN_PORT") {
            self.server.admin_port = port.parse().map_err(|e| {
                ProxyError::config(format!("Invalid PROXY_SERVER_ADMIN_PORT: {}", e))
            })?;
        }

        if let Some(level) = lookup("PROXY_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = lookup("PROXY_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Some(ttl) = lookup("PROXY_CACHE_DEFAULT_TTL") {
            self.cache.default_ttl = humantime::parse_duration(&ttl).map_err(|e| {
                ProxyError::config(format!("Invalid PROXY_CACHE_DEFAULT_TTL: {}", e))
            })?;
        }

        if let Some(window) = lookup("PROXY_DEDUP_WINDOW") {
            self.dedup.window = humantime::parse_duration(&window)
                .map_err(|e| ProxyError::config(format!("Invalid PROXY_DEDUP_WINDOW: {}", e)))?;
        }

        if let Some(attempts) = lookup("PROXY_UPSTREAM_MAX_ATTEMPTS") {
            self.upstream.max_attempts = attempts.parse().map_err(|e| {
                ProxyError::config(format!("Invalid PROXY_UPSTREAM_MAX_ATTEMPTS: {}", e))
            })?;
        }

        Ok(())
    }

    /// Configuration validation with all errors collected
    pub fn validate(&self) -> ProxyResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.is_empty() {
            errors.push("bind_address cannot be empty".to_string());
        }

        if self.server.http_port != 0 && self.server.http_port == self.server.admin_port {
            errors.push("http_port and admin_port must differ".to_string());
        }

        if self.server.resources.is_empty() {
            errors.push("at least one proxied resource name is required".to_string());
        }

        if self.server.max_request_size == 0 {
            errors.push("max_request_size must be greater than 0".to_string());
        }

        if let Some(ref base_url) = self.upstream.base_url {
            if let Err(e) = Url::parse(base_url) {
                errors.push(format!("upstream base_url '{}' is not a valid URL: {}", base_url, e));
            }
        }

        if self.upstream.max_attempts == 0 {
            errors.push("upstream max_attempts must be at least 1".to_string());
        }

        if self.upstream.read_timeout.is_zero() || self.upstream.write_timeout.is_zero() {
            errors.push("upstream timeouts must be greater than 0".to_string());
        }

        if let CacheBackendConfig::Redis { ref url } = self.cache.backend {
            if url.is_empty() {
                errors.push("redis cache backend requires a url".to_string());
            }
        }

        if self.cache.default_ttl.is_zero() {
            errors.push("cache default_ttl must be greater than 0".to_string());
        }

        if self.cache.max_key_length < 64 {
            errors.push("cache max_key_length must be at least 64".to_string());
        }

        if self.dedup.enabled && self.dedup.window.is_zero() {
            errors.push("dedup window must be greater than 0 when enabled".to_string());
        }

        if self.batching.enabled {
            if self.batching.max_size == 0 || self.batching.max_size > 100 {
                errors.push("batching max_size must be between 1 and 100".to_string());
            }
            if self.batching.max_wait.is_zero() {
                errors.push("batching max_wait must be greater than 0".to_string());
            }
        }

        if self.rate_limit.enabled && self.rate_limit.requests_per_window == 0 {
            errors.push("rate_limit requests_per_window must be greater than 0".to_string());
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => errors.push(format!("Invalid log level: {}", self.logging.level)),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "text" => {}
            _ => errors.push(format!("Invalid log format: {}", self.logging.format)),
        }

        if !errors.is_empty() {
            return Err(ProxyError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address for both listeners
    pub bind_address: String,

    /// Public proxy port
    pub http_port: u16,

    /// Admin port (cache stats, invalidation, metrics)
    pub admin_port: u16,

    /// Resource names accepted under `/api/{resource}`
    pub resources: Vec<String>,

    /// Maximum inbound request body size in bytes
    pub max_request_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8080,
            admin_port: 9090,
            resources: vec!["woocommerce".to_string()],
            max_request_size: 1024 * 1024,
        }
    }
}

/// WooCommerce upstream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    /// WordPress site URL, e.g. `https://shop.example.com`
    pub base_url: Option<String>,

    /// REST API consumer key
    pub consumer_key: Option<String>,

    /// REST API consumer secret
    pub consumer_secret: Option<String>,

    /// Timeout for read (GET) calls
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Timeout for write calls
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,

    /// Attempts per request before fallback
    pub max_attempts: u32,

    /// Linear backoff unit; attempt `n` waits `n * backoff_base`
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Consult the public Store API when the REST API fails
    pub fallback_enabled: bool,

    /// User agent sent upstream
    pub user_agent: String,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            consumer_key: None,
            consumer_secret: None,
            read_timeout: Duration::from_secs(8),
            write_timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            fallback_enabled: true,
            user_agent: format!("storefront-proxy/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Upstream coordinates, present only when fully configured
#[derive(Debug, Clone)]
pub struct UpstreamCredentials {
    pub base_url: Url,
    pub consumer_key: String,
    pub consumer_secret: String,
}

impl UpstreamSettings {
    /// Resolve the base URL and credentials, or explain what is missing
    pub fn credentials(&self) -> ProxyResult<UpstreamCredentials> {
        let base_url = self
            .base_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ProxyError::config("WOOCOMMERCE_URL is not set"))?;
        let base_url = Url::parse(base_url)
            .map_err(|e| ProxyError::config(format!("WOOCOMMERCE_URL is invalid: {}", e)))?;

        let consumer_key = self
            .consumer_key
            .clone()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ProxyError::config("WOOCOMMERCE_CONSUMER_KEY is not set"))?;
        let consumer_secret = self
            .consumer_secret
            .clone()
            .filter(|secret| !secret.is_empty())
            .ok_or_else(|| ProxyError::config("WOOCOMMERCE_CONSUMER_SECRET is not set"))?;

        Ok(UpstreamCredentials {
            base_url,
            consumer_key,
            consumer_secret,
        })
    }
}

/// Cache backend selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheBackendConfig {
    Memory,
    Redis { url: String },
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Backend used for cache entries
    pub backend: CacheBackendConfig,

    /// TTL used when an endpoint does not define its own
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// How long an expired entry is kept as a degraded fallback
    #[serde(with = "humantime_serde")]
    pub stale_grace: Duration,

    /// TTL for bodies produced by the fallback source
    #[serde(with = "humantime_serde")]
    pub fallback_ttl: Duration,

    /// Namespace prefix for every cache key
    pub key_prefix: String,

    /// Maximum cache key length before the variable part is hashed
    pub max_key_length: usize,

    /// Maximum in-memory entries
    pub max_entries: usize,

    /// Interval of the in-memory expiry sweep
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Bound on a single distributed backend operation
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: CacheBackendConfig::Memory,
            default_ttl: Duration::from_secs(300),
            stale_grace: Duration::from_secs(3600),
            fallback_ttl: Duration::from_secs(60),
            key_prefix: "woo:".to_string(),
            max_key_length: 250,
            max_entries: 10_000,
            cleanup_interval: Duration::from_secs(60),
            operation_timeout: Duration::from_millis(250),
        }
    }
}

/// Request deduplication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    pub enabled: bool,

    /// Window during which identical requests share one upstream call
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_millis(100),
        }
    }
}

/// Batching layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingSettings {
    pub enabled: bool,

    /// Members per batch before an immediate flush
    pub max_size: usize,

    /// Longest wait after the first member arrives
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
}

impl Default for BatchingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 20,
            max_wait: Duration::from_millis(20),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,

    /// Log format (json, text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Install the Prometheus recorder and expose `/metrics` on the admin port
    pub prometheus_enabled: bool,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            prometheus_enabled: true,
        }
    }
}
