//! # HTTP Server Module
//!
//! Two Axum listeners, as in any gateway deployment here:
//!
//! - the public proxy: `/api/{resource}?endpoint=…` plus `/health` and `/ready`
//! - the admin interface: cache statistics, cache invalidation and the
//!   Prometheus scrape endpoint
//!
//! Both run until the shutdown future resolves, then drain in-flight
//! requests.

use super::proxy::{ProxyRequest, StorefrontProxy};
use crate::core::config::ServerSettings;
use crate::core::error::{ProxyError, ProxyResult};
use crate::middleware::RequestLog;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, Path, RawQuery, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router as AxumRouter,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public proxy bind address
    pub bind_addr: SocketAddr,

    /// Admin bind address (separate from the proxy)
    pub admin_bind_addr: SocketAddr,

    /// Maximum request body size in bytes
    pub max_body_size: usize,
}

impl ServerConfig {
    pub fn from_settings(settings: &ServerSettings) -> ProxyResult<Self> {
        let parse = |port: u16| -> ProxyResult<SocketAddr> {
            format!("{}:{}", settings.bind_address, port)
                .parse()
                .map_err(|e| {
                    ProxyError::config(format!(
                        "Invalid bind address {}:{}: {}",
                        settings.bind_address, port, e
                    ))
                })
        };

        Ok(Self {
            bind_addr: parse(settings.http_port)?,
            admin_bind_addr: parse(settings.admin_port)?,
            max_body_size: settings.max_request_size,
        })
    }
}

/// Shared handler state
#[derive(Clone)]
pub struct ServerState {
    pub proxy: StorefrontProxy,

    /// Accepted `/api/{resource}` names
    pub resources: Arc<Vec<String>>,

    /// Present when the Prometheus recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

impl ServerState {
    pub fn new(
        proxy: StorefrontProxy,
        resources: Vec<String>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            proxy,
            resources: Arc::new(resources),
            metrics,
        }
    }
}

/// Public proxy router
pub fn gateway_router(state: ServerState, max_body_size: usize) -> AxumRouter {
    AxumRouter::new()
        .route("/api/:resource", any(handle_proxy))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}

/// Admin router
pub fn admin_router(state: ServerState) -> AxumRouter {
    AxumRouter::new()
        .route("/cache/stats", get(cache_stats))
        .route("/cache/invalidate", post(invalidate_cache))
        .route("/metrics", get(render_metrics))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Both listeners
pub struct ProxyServer {
    config: ServerConfig,
    gateway_app: AxumRouter,
    admin_app: AxumRouter,
}

impl ProxyServer {
    pub fn new(config: ServerConfig, state: ServerState) -> Self {
        let gateway_app = gateway_router(state.clone(), config.max_body_size);
        let admin_app = admin_router(state);
        Self {
            config,
            gateway_app,
            admin_app,
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    pub fn admin_bind_addr(&self) -> SocketAddr {
        self.config.admin_bind_addr
    }

    /// Serve both listeners until `shutdown` resolves
    #[instrument(skip(self, shutdown))]
    pub async fn start<F>(self, shutdown: F) -> ProxyResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_addr;
        let admin_bind_addr = self.config.admin_bind_addr;
        let gateway_listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            ProxyError::internal(format!("Failed to bind proxy to {}: {}", bind_addr, e))
        })?;
        let admin_listener = TcpListener::bind(admin_bind_addr).await.map_err(|e| {
            ProxyError::internal(format!("Failed to bind admin to {}: {}", admin_bind_addr, e))
        })?;

        info!(addr = %self.config.bind_addr, "Proxy listening");
        info!(addr = %self.config.admin_bind_addr, "Admin interface listening");

        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown.await;
            let _ = stop_tx.send(true);
        });

        let gateway = axum::serve(
            gateway_listener,
            self.gateway_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(stopped(stop_rx.clone()))
        .into_future();
        let admin = axum::serve(admin_listener, self.admin_app)
            .with_graceful_shutdown(stopped(stop_rx))
            .into_future();

        let (gateway_result, admin_result) = tokio::join!(gateway, admin);
        gateway_result.map_err(|e| ProxyError::internal(format!("Proxy server error: {}", e)))?;
        admin_result.map_err(|e| ProxyError::internal(format!("Admin server error: {}", e)))?;

        info!("Listeners drained");
        Ok(())
    }
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Proxy handler for `/api/{resource}`
async fn handle_proxy(
    State(state): State<ServerState>,
    Path(resource): Path<String>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Response {
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    if !state.resources.iter().any(|name| *name == resource) {
        return ProxyError::not_found("resource", resource).into_response();
    }

    let (endpoint, params, bypass_cache) = match split_query(query.as_deref().unwrap_or("")) {
        Ok(parts) => parts,
        Err(e) => return e.into_response(),
    };

    let log = RequestLog::start(method.as_str(), &endpoint, &request_id);

    let request = ProxyRequest {
        method: method.clone(),
        endpoint: endpoint.clone(),
        params,
        body: (!body.is_empty()).then_some(body),
        client_id: client_identity(&headers, connect_info.map(|ConnectInfo(addr)| addr)),
        if_none_match: headers
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        bypass_cache,
    };

    let outcome = state.proxy.handle(request).await;
    let cache = outcome.cache_label();
    let response = outcome.into_response();
    log.finish(response.status().as_u16(), cache);
    response
}

/// Split the query into the logical endpoint, forwarded parameters and the
/// cache bypass flag
pub fn split_query(query: &str) -> ProxyResult<(String, Vec<(String, String)>, bool)> {
    let mut endpoint = None;
    let mut bypass_cache = false;
    let mut params = Vec::new();

    for (name, value) in url::form_urlencoded::parse(query.as_bytes()).into_owned() {
        match name.as_str() {
            "endpoint" if endpoint.is_none() => endpoint = Some(value),
            "endpoint" => {}
            "cache" => bypass_cache = value.eq_ignore_ascii_case("off"),
            _ => params.push((name, value)),
        }
    }

    let endpoint = endpoint
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| ProxyError::invalid("endpoint", "query parameter is required"))?;
    Ok((endpoint, params, bypass_cache))
}

/// First `X-Forwarded-For` hop, then the peer address, then `anonymous`
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "anonymous".to_string())
}

/// Liveness
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness, including the cache backend
async fn readiness_check(State(state): State<ServerState>) -> impl IntoResponse {
    let cache_ok = state.proxy.cache().health_check().await;
    let status = if cache_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if cache_ok { "ready" } else { "degraded" },
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "checks": {
                "cache": if cache_ok { "ok" } else { "unreachable" },
            }
        })),
    )
}

async fn cache_stats(State(state): State<ServerState>) -> impl IntoResponse {
    let stats = state.proxy.cache().stats().await;
    let (fetches, joins) = state.proxy.dedup_counts();
    let rate_limit = state.proxy.rate_limiter().get_metrics();

    Json(serde_json::json!({
        "cache": stats,
        "dedup": { "fetches": fetches, "joins": joins },
        "rate_limit": rate_limit,
    }))
}

#[derive(Debug, Deserialize)]
struct InvalidateRequest {
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    all: bool,
}

async fn invalidate_cache(
    State(state): State<ServerState>,
    Json(request): Json<InvalidateRequest>,
) -> Response {
    let cache = state.proxy.cache();

    let removed = if request.all {
        cache.invalidate_all().await
    } else if !request.tags.is_empty() {
        let mut removed = 0;
        for tag in &request.tags {
            removed += cache.invalidate_by_tag(tag).await;
        }
        removed
    } else {
        return ProxyError::invalid("tags", "provide tags or set all to true").into_response();
    };

    info!(removed, all = request.all, tags = ?request.tags, "Cache invalidated via admin");
    Json(serde_json::json!({ "removed": removed })).into_response()
}

async fn render_metrics(State(state): State<ServerState>) -> Response {
    match state.metrics {
        Some(ref handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_split_query() {
        let (endpoint, params, bypass) =
            split_query("endpoint=products&per_page=10&cache=off&category=15").unwrap();
        assert_eq!(endpoint, "products");
        assert!(bypass);
        assert_eq!(
            params,
            vec![
                ("per_page".to_string(), "10".to_string()),
                ("category".to_string(), "15".to_string())
            ]
        );

        let (endpoint, _, bypass) = split_query("endpoint=products%2F42").unwrap();
        assert_eq!(endpoint, "products/42");
        assert!(!bypass);
    }

    #[test]
    fn test_split_query_requires_endpoint() {
        let err = split_query("per_page=10").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(split_query("endpoint=").is_err());
    }

    #[test]
    fn test_client_identity() {
        let peer: SocketAddr = "10.0.0.9:51234".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_identity(&headers, Some(peer)), "10.0.0.9");
        assert_eq!(client_identity(&headers, None), "anonymous");

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        assert_eq!(client_identity(&headers, Some(peer)), "203.0.113.7");
    }

    #[test]
    fn test_server_config_from_settings() {
        let config = ServerConfig::from_settings(&ServerSettings {
            bind_address: "127.0.0.1".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.admin_bind_addr.port(), 9090);

        let bad = ServerConfig::from_settings(&ServerSettings {
            bind_address: "not an address".to_string(),
            ..Default::default()
        });
        assert!(bad.is_err());
    }
}
