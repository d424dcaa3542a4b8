//! # Storefront Proxy - Main Entry Point
//!
//! Startup sequence:
//! 1. load configuration (`PROXY_CONFIG_PATH`, default `config/proxy.yaml`,
//!    then environment overrides)
//! 2. install logging and, when enabled, the Prometheus recorder
//! 3. build the cache backend (Redis if configured and reachable, else memory)
//! 4. build the rate limiter, upstream transport and proxy
//! 5. serve both listeners until SIGINT/SIGTERM

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use storefront_proxy::caching::stores::{
    InMemoryBackend, InMemoryBackendConfig, KvBackend, RedisBackend, RedisBackendConfig,
};
use storefront_proxy::core::config::{CacheBackendConfig, CacheSettings};
use storefront_proxy::middleware::RateLimiter;
use storefront_proxy::observability::{init_logging, metrics};
use storefront_proxy::upstream::HttpTransport;
use storefront_proxy::{ProxyConfig, ProxyServer, ServerConfig, ServerState, StorefrontProxy};
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("PROXY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/proxy.yaml"));

    let config = ProxyConfig::load(Some(&config_path))
        .await
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    init_logging(&config.logging);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting storefront proxy"
    );

    if let Err(e) = config.upstream.credentials() {
        warn!(
            error = %e,
            "WooCommerce upstream is not configured; proxied endpoints will answer 500 until it is"
        );
    }

    let metrics_handle = if config.metrics.prometheus_enabled {
        Some(metrics::install_prometheus().context("installing Prometheus recorder")?)
    } else {
        None
    };

    let backend = build_backend(&config.cache).await;
    let redis_url = match config.cache.backend {
        CacheBackendConfig::Redis { ref url } => Some(url.as_str()),
        CacheBackendConfig::Memory => None,
    };
    let rate_limiter =
        Arc::new(RateLimiter::from_config(config.rate_limit.clone(), redis_url).await);
    let transport =
        Arc::new(HttpTransport::new(&config.upstream).context("building upstream client")?);

    let proxy = StorefrontProxy::new(&config, backend, transport, rate_limiter);
    let state = ServerState::new(proxy, config.server.resources.clone(), metrics_handle);
    let server_config =
        ServerConfig::from_settings(&config.server).context("resolving listener addresses")?;

    info!(
        proxy = %server_config.bind_addr,
        admin = %server_config.admin_bind_addr,
        resources = ?config.server.resources,
        "Listeners configured"
    );

    ProxyServer::new(server_config, state)
        .start(shutdown_signal())
        .await
        .context("running listeners")?;

    info!("Storefront proxy shutdown complete");
    Ok(())
}

/// Redis when configured and reachable, otherwise the in-process store
async fn build_backend(settings: &CacheSettings) -> Arc<dyn KvBackend> {
    let memory = || -> Arc<dyn KvBackend> {
        Arc::new(InMemoryBackend::new(InMemoryBackendConfig {
            max_entries: settings.max_entries,
            cleanup_interval: settings.cleanup_interval,
        }))
    };

    match settings.backend {
        CacheBackendConfig::Memory => {
            info!(max_entries = settings.max_entries, "Using in-memory cache backend");
            memory()
        }
        CacheBackendConfig::Redis { ref url } => {
            let config = RedisBackendConfig {
                url: url.clone(),
                operation_timeout: settings.operation_timeout,
                ..RedisBackendConfig::default()
            };
            match RedisBackend::connect(config).await {
                Ok(backend) => {
                    info!("Using Redis cache backend");
                    Arc::new(backend)
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        "Redis unreachable at startup, falling back to in-memory cache"
                    );
                    memory()
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
