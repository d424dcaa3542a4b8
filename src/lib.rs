//! # Storefront Proxy Library
//!
//! A caching, deduplicating, batching and rate-limiting proxy in front of a
//! WooCommerce store, for headless storefronts.
//!
//! ## Module map
//! - `core`: error taxonomy and configuration
//! - `caching`: key generation, the key-value backend, the response cache and
//!   request deduplication
//! - `upstream`: WooCommerce transport, retry and fallback, endpoint catalogue
//! - `batching`: coalescing single-product lookups into one call
//! - `middleware`: rate limiting and request logging
//! - `gateway`: request orchestration and the HTTP listeners
//! - `observability`: logging setup and metrics

pub mod batching;
pub mod caching;
pub mod core;
pub mod gateway;
pub mod middleware;
pub mod observability;
pub mod upstream;

/// Main error type used throughout the proxy
pub use core::error::{ProxyError, ProxyResult};

/// Configuration root, loaded from YAML and the environment
pub use core::config::ProxyConfig;

pub use gateway::{
    ProxyOutcome, ProxyRequest, ProxyServer, ServerConfig, ServerState, StorefrontProxy,
};
