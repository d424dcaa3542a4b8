//! # Proxy Orchestration
//!
//! One request flows through the layers in a fixed order:
//!
//! 1. configuration check and endpoint resolution
//! 2. rate-limit gate
//! 3. writes go straight upstream (single attempt) and invalidate their tags
//! 4. `cache=off` reads skip the cache but still use the retrying fetcher
//! 5. fresh cache hit, or `304` on a matching `If-None-Match`
//! 6. deduplicated fetch; the leader batches or calls the fetcher and writes
//!    the cache
//! 7. if upstream and fallback both failed, a stale entry is served
//!
//! Every component is injected through [`StorefrontProxy::new`]; nothing here
//! is global.

use super::outcome::{if_none_match_matches, CacheStatus, FallbackSource, Payload, ProxyOutcome};
use crate::batching::{plan_batch, RequestBatcher, UpstreamBatchExecutor};
use crate::caching::cache_manager::integrity_tag;
use crate::caching::{
    CacheEntry, CacheKeyGenerator, DedupClaim, KvBackend, RequestDeduplicator, RequestShape,
    ResponseCache, ResponseCacheConfig, CACHE_TAGS_METADATA,
};
use crate::core::config::{DedupSettings, ProxyConfig, UpstreamSettings};
use crate::core::error::{ProxyError, ProxyResult};
use crate::middleware::RateLimiter;
use crate::observability::metrics;
use crate::upstream::{
    EndpointCatalogue, FetchSource, FetchedBody, ResolvedEndpoint, RetryPolicy, UpstreamFetcher,
    UpstreamRequest, UpstreamTransport,
};
use axum::http::Method;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const NO_STORE: &str = "no-store";

/// A request as the proxy sees it, control parameters already stripped
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Logical endpoint, e.g. `products/42`
    pub endpoint: String,
    pub params: Vec<(String, String)>,
    pub body: Option<Bytes>,
    /// Identity used for rate limiting and private cache scoping
    pub client_id: String,
    pub if_none_match: Option<String>,
    /// `cache=off`
    pub bypass_cache: bool,
}

impl ProxyRequest {
    pub fn get(endpoint: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            endpoint: endpoint.into(),
            params: Vec::new(),
            body: None,
            client_id: client_id.into(),
            if_none_match: None,
            bypass_cache: false,
        }
    }

    pub fn with_params(mut self, params: Vec<(String, String)>) -> Self {
        self.params = params;
        self
    }

    fn is_read(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD)
    }
}

struct ProxyInner {
    upstream: UpstreamSettings,
    policy: RetryPolicy,
    fallback_ttl: Duration,
    dedup: DedupSettings,
    catalogue: EndpointCatalogue,
    keys: CacheKeyGenerator,
    cache: Arc<ResponseCache>,
    deduplicator: RequestDeduplicator<FetchedBody>,
    claim: DedupClaim,
    fetcher: Arc<UpstreamFetcher>,
    batcher: Option<RequestBatcher>,
    rate_limiter: Arc<RateLimiter>,
}

/// The caching, deduplicating, batching WooCommerce proxy
#[derive(Clone)]
pub struct StorefrontProxy {
    inner: Arc<ProxyInner>,
}

impl StorefrontProxy {
    pub fn new(
        config: &ProxyConfig,
        backend: Arc<dyn KvBackend>,
        transport: Arc<dyn UpstreamTransport>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        let policy = RetryPolicy {
            max_attempts: config.upstream.max_attempts,
            backoff_base: config.upstream.backoff_base,
        };
        let fetcher = Arc::new(UpstreamFetcher::new(transport));

        let batcher = config.batching.enabled.then(|| {
            let executor = UpstreamBatchExecutor::new(
                fetcher.clone(),
                policy.clone(),
                config.upstream.read_timeout,
                config.upstream.fallback_enabled,
            );
            RequestBatcher::new(Arc::new(executor), &config.batching)
        });

        let cache = Arc::new(ResponseCache::new(
            backend.clone(),
            ResponseCacheConfig {
                key_prefix: config.cache.key_prefix.clone(),
                stale_grace: config.cache.stale_grace,
            },
        ));

        Self {
            inner: Arc::new(ProxyInner {
                upstream: config.upstream.clone(),
                policy,
                fallback_ttl: config.cache.fallback_ttl,
                dedup: config.dedup.clone(),
                catalogue: EndpointCatalogue::new(config.cache.default_ttl),
                keys: CacheKeyGenerator::new(
                    config.cache.key_prefix.clone(),
                    config.cache.max_key_length,
                ),
                cache,
                deduplicator: RequestDeduplicator::new(),
                claim: DedupClaim::new(backend),
                fetcher,
                batcher,
                rate_limiter,
            }),
        }
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.inner.cache
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.rate_limiter
    }

    /// `(fetches, joins)` seen by the deduplicator
    pub fn dedup_counts(&self) -> (u64, u64) {
        self.inner.deduplicator.counts()
    }

    /// Serve one request
    #[instrument(
        skip(self, request),
        fields(method = %request.method, endpoint = %request.endpoint, client = %request.client_id)
    )]
    pub async fn handle(&self, request: ProxyRequest) -> ProxyOutcome {
        if let Err(e) = self.inner.upstream.credentials() {
            warn!(error = %e, "Upstream is not configured");
            return finish("unconfigured", ProxyOutcome::Failed(e));
        }

        let endpoint = match self.inner.catalogue.resolve(&request.endpoint) {
            Ok(endpoint) => endpoint,
            Err(e) => return finish("unknown", ProxyOutcome::Failed(e)),
        };

        let outcome = self
            .serve(&endpoint, request)
            .await
            .unwrap_or_else(ProxyOutcome::Failed);
        finish(endpoint.route, outcome)
    }

    async fn serve(
        &self,
        endpoint: &ResolvedEndpoint,
        request: ProxyRequest,
    ) -> ProxyResult<ProxyOutcome> {
        self.inner
            .rate_limiter
            .check(&request.client_id, endpoint.route)
            .await?;

        if !request.is_read() {
            return self.write(endpoint, &request).await;
        }

        if request.bypass_cache {
            let fetched = self.fetch_direct(endpoint, &request.params).await?;
            return Ok(self.render(&fetched, CacheStatus::Bypass, Some(NO_STORE.to_string())));
        }

        let scope = endpoint.is_private().then(|| request.client_id.clone());
        let key = self.inner.keys.generate(
            &RequestShape::new("GET", endpoint.name.clone())
                .with_params(request.params.clone())
                .with_scope(scope),
        );

        if let Some(entry) = self.inner.cache.get(&key).await {
            if let Some(ref candidate) = request.if_none_match {
                if if_none_match_matches(candidate, &entry.integrity_tag) {
                    return Ok(ProxyOutcome::NotModified {
                        integrity_tag: entry.integrity_tag,
                        cache: CacheStatus::Hit,
                    });
                }
            }
            return Ok(ProxyOutcome::Fresh {
                payload: Payload::from_entry(&entry, Some(endpoint.cache_control())),
                cache: CacheStatus::Hit,
            });
        }

        let (result, shared) = if self.inner.dedup.enabled {
            let leader = self.clone();
            let lead_key = key.clone();
            let lead_endpoint = endpoint.clone();
            let params = request.params.clone();
            let deduplicated = self
                .inner
                .deduplicator
                .deduplicate(&key, self.inner.dedup.window, move || async move {
                    leader.lead(&lead_key, &lead_endpoint, &params).await
                })
                .await;
            (deduplicated.result, deduplicated.shared)
        } else {
            (self.lead(&key, endpoint, &request.params).await, false)
        };

        match result {
            Ok(fetched) => {
                let cache = if shared { CacheStatus::Dedup } else { CacheStatus::Miss };
                let cache_control = fetched.is_success().then(|| endpoint.cache_control());
                Ok(self.render(&fetched, cache, cache_control))
            }
            Err(err @ ProxyError::UpstreamUnavailable { .. }) => {
                match self.inner.cache.get_stale(&key).await {
                    Some(entry) => {
                        info!(key = %key, "Serving stale entry while upstream is unavailable");
                        Ok(ProxyOutcome::Fallback {
                            payload: Payload::from_entry(&entry, None),
                            source: FallbackSource::StaleCache,
                        })
                    }
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Leader side of a deduplicated read: fetch and populate the cache
    async fn lead(
        &self,
        key: &str,
        endpoint: &ResolvedEndpoint,
        params: &[(String, String)],
    ) -> ProxyResult<FetchedBody> {
        let window = self.inner.dedup.window;
        if !self.inner.claim.try_claim(key, window).await {
            tokio::time::sleep(window).await;
            if let Some(entry) = self.inner.cache.get(key).await {
                debug!(key = %key, "Another instance populated the cache");
                return Ok(fetched_from_entry(&entry));
            }
        }

        let fetched = self.fetch_read(endpoint, params).await?;
        self.store(key, endpoint, &fetched).await;
        Ok(fetched)
    }

    async fn fetch_read(
        &self,
        endpoint: &ResolvedEndpoint,
        params: &[(String, String)],
    ) -> ProxyResult<FetchedBody> {
        if let Some(ref batcher) = self.inner.batcher {
            if let Some(plan) = plan_batch(endpoint, params, batcher.max_size()) {
                return batcher.submit(plan).await;
            }
        }
        self.fetch_direct(endpoint, params).await
    }

    async fn fetch_direct(
        &self,
        endpoint: &ResolvedEndpoint,
        params: &[(String, String)],
    ) -> ProxyResult<FetchedBody> {
        let request = UpstreamRequest::get(
            endpoint.route,
            endpoint.upstream_path.clone(),
            self.inner.upstream.read_timeout,
        )
        .with_query(params.to_vec())
        .expecting(endpoint.shape);
        let fallback = if self.inner.upstream.fallback_enabled {
            endpoint.fallback_with_query(params)
        } else {
            None
        };

        self.inner
            .fetcher
            .fetch_with_retry(&request, &self.inner.policy, fallback.as_ref())
            .await
    }

    async fn write(
        &self,
        endpoint: &ResolvedEndpoint,
        request: &ProxyRequest,
    ) -> ProxyResult<ProxyOutcome> {
        let upstream = UpstreamRequest {
            endpoint: endpoint.route.to_string(),
            method: request.method.clone(),
            path: endpoint.upstream_path.clone(),
            query: request.params.clone(),
            body: request.body.clone(),
            timeout: self.inner.upstream.write_timeout,
            authenticated: true,
            expect: endpoint.shape,
        };

        let fetched = self
            .inner
            .fetcher
            .fetch_with_retry(&upstream, &RetryPolicy::single_attempt(), None)
            .await?;

        if fetched.is_success() {
            for tag in &endpoint.tags {
                let removed = self.inner.cache.invalidate_by_tag(tag).await;
                debug!(tag, removed, "Invalidated after write");
            }
        }

        Ok(self.render(&fetched, CacheStatus::Bypass, Some(NO_STORE.to_string())))
    }

    /// Cache a successful primary or fallback body
    async fn store(&self, key: &str, endpoint: &ResolvedEndpoint, fetched: &FetchedBody) {
        if !fetched.is_success() || fetched.degraded {
            return;
        }
        let body = match std::str::from_utf8(&fetched.body) {
            Ok(body) => body.to_string(),
            Err(_) => {
                warn!(key = %key, "Upstream body is not UTF-8, not caching");
                return;
            }
        };

        let ttl = match fetched.source {
            FetchSource::Primary => endpoint.ttl,
            FetchSource::Fallback => self.inner.fallback_ttl,
        };

        let mut metadata = BTreeMap::new();
        metadata.insert(CACHE_TAGS_METADATA.to_string(), endpoint.tag_list());
        if let Some(total) = fetched.total {
            metadata.insert("x-wp-total".to_string(), total.to_string());
        }
        if let Some(pages) = fetched.total_pages {
            metadata.insert("x-wp-totalpages".to_string(), pages.to_string());
        }
        if fetched.source == FetchSource::Fallback {
            metadata.insert("source".to_string(), FallbackSource::StoreApi.as_str().to_string());
        }

        self.inner.cache.set(key, body, ttl, metadata).await;
    }

    fn render(
        &self,
        fetched: &FetchedBody,
        cache: CacheStatus,
        cache_control: Option<String>,
    ) -> ProxyOutcome {
        let tag = integrity_tag(&String::from_utf8_lossy(&fetched.body));
        match fetched.source {
            FetchSource::Fallback => ProxyOutcome::Fallback {
                payload: Payload::from_fetched(fetched, tag, None),
                source: FallbackSource::StoreApi,
            },
            FetchSource::Primary => ProxyOutcome::Fresh {
                payload: Payload::from_fetched(fetched, tag, cache_control),
                cache,
            },
        }
    }
}

fn finish(route: &str, outcome: ProxyOutcome) -> ProxyOutcome {
    metrics::record_request(route, outcome.cache_label());
    outcome
}

fn fetched_from_entry(entry: &CacheEntry) -> FetchedBody {
    FetchedBody {
        status: 200,
        body: Bytes::from(entry.body.clone()),
        source: FetchSource::Primary,
        attempts: 0,
        degraded: false,
        total: entry.metadata.get("x-wp-total").and_then(|v| v.parse().ok()),
        total_pages: entry.metadata.get("x-wp-totalpages").and_then(|v| v.parse().ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::stores::{InMemoryBackend, InMemoryBackendConfig};
    use crate::middleware::RateLimitConfig;
    use crate::upstream::{RawResponse, TransportError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays a script; once it runs out, every call gets the fallback answer
    struct StubTransport {
        script: Mutex<VecDeque<Result<RawResponse, TransportError>>>,
        otherwise: Result<RawResponse, TransportError>,
        delay: Duration,
        calls: Mutex<Vec<UpstreamRequest>>,
    }

    impl StubTransport {
        fn answering(body: &str) -> Arc<Self> {
            Self::scripted(Vec::new(), ok(body), Duration::ZERO)
        }

        fn scripted(
            script: Vec<Result<RawResponse, TransportError>>,
            otherwise: Result<RawResponse, TransportError>,
            delay: Duration,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                otherwise,
                delay,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl UpstreamTransport for StubTransport {
        async fn send(&self, request: &UpstreamRequest) -> Result<RawResponse, TransportError> {
            self.calls.lock().push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(|| self.otherwise.clone())
        }
    }

    fn ok(body: &str) -> Result<RawResponse, TransportError> {
        Ok(RawResponse {
            status: 200,
            content_type: Some("application/json".to_string()),
            headers: BTreeMap::new(),
            body: Bytes::from(body.to_string()),
        })
    }

    fn config() -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.upstream.base_url = Some("https://shop.example.com".to_string());
        config.upstream.consumer_key = Some("ck_test".to_string());
        config.upstream.consumer_secret = Some("cs_test".to_string());
        config.upstream.backoff_base = Duration::from_millis(1);
        config.batching.enabled = false;
        config.rate_limit.enabled = false;
        config
    }

    fn proxy(config: &ProxyConfig, transport: Arc<StubTransport>) -> StorefrontProxy {
        let backend = Arc::new(InMemoryBackend::new(InMemoryBackendConfig::default()));
        let limiter = Arc::new(RateLimiter::in_memory(config.rate_limit.clone()));
        StorefrontProxy::new(config, backend, transport, limiter)
    }

    fn cache_status(outcome: &ProxyOutcome) -> &'static str {
        outcome.cache_label()
    }

    #[tokio::test]
    async fn test_second_read_is_a_hit() {
        let transport = StubTransport::answering(r#"[{"id":1,"name":"Music"}]"#);
        let proxy = proxy(&config(), transport.clone());

        let first = proxy.handle(ProxyRequest::get("categories", "1.2.3.4")).await;
        assert_eq!(cache_status(&first), "MISS");

        tokio::time::sleep(Duration::from_millis(150)).await;
        let second = proxy.handle(ProxyRequest::get("categories", "5.6.7.8")).await;
        assert_eq!(cache_status(&second), "HIT");
        assert_eq!(transport.call_count(), 1);

        match (first, second) {
            (ProxyOutcome::Fresh { payload: a, .. }, ProxyOutcome::Fresh { payload: b, .. }) => {
                assert_eq!(a.body, b.body);
                assert_eq!(a.integrity_tag, b.integrity_tag);
                assert_eq!(
                    b.cache_control.as_deref(),
                    Some("public, max-age=3600, stale-while-revalidate=3600")
                );
            }
            other => panic!("unexpected outcomes: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_matching_etag_is_not_modified() {
        let body = r#"[{"id":1}]"#;
        let transport = StubTransport::answering(body);
        let proxy = proxy(&config(), transport);

        proxy.handle(ProxyRequest::get("shop", "c")).await;

        let mut conditional = ProxyRequest::get("shop", "c");
        conditional.if_none_match = Some(format!("W/\"{}\"", integrity_tag(body)));
        match proxy.handle(conditional).await {
            ProxyOutcome::NotModified { integrity_tag: tag, cache } => {
                assert_eq!(tag, integrity_tag(body));
                assert_eq!(cache, CacheStatus::Hit);
            }
            other => panic!("expected not modified, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_reads_share_one_call() {
        let transport = StubTransport::scripted(Vec::new(), ok("[]"), Duration::from_millis(50));
        let proxy = proxy(&config(), transport.clone());

        let outcomes = futures::future::join_all((0..5).map(|i| {
            proxy.handle(ProxyRequest::get("shipping_methods", format!("client-{}", i)))
        }))
        .await;

        assert_eq!(transport.call_count(), 1);
        let labels: Vec<&str> = outcomes.iter().map(cache_status).collect();
        assert_eq!(labels.iter().filter(|l| **l == "MISS").count(), 1);
        assert_eq!(labels.iter().filter(|l| **l == "DEDUP").count(), 4);
    }

    #[tokio::test]
    async fn test_private_reads_are_scoped_per_client() {
        let transport = StubTransport::answering(r#"[{"id":100}]"#);
        let proxy = proxy(&config(), transport.clone());

        proxy.handle(ProxyRequest::get("orders", "alice")).await;
        proxy.handle(ProxyRequest::get("orders", "bob")).await;
        assert_eq!(transport.call_count(), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let again = proxy.handle(ProxyRequest::get("orders", "alice")).await;
        assert_eq!(cache_status(&again), "HIT");
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_write_bypasses_and_invalidates() {
        let transport = StubTransport::answering(r#"[{"id":100}]"#);
        let proxy = proxy(&config(), transport.clone());

        proxy.handle(ProxyRequest::get("orders", "alice")).await;

        let mut create = ProxyRequest::get("orders", "alice");
        create.method = Method::POST;
        create.body = Some(Bytes::from_static(br#"{"status":"pending"}"#));
        let created = proxy.handle(create).await;
        assert_eq!(cache_status(&created), "BYPASS");

        let writes: Vec<Method> = transport.calls.lock().iter().map(|r| r.method.clone()).collect();
        assert_eq!(writes, vec![Method::GET, Method::POST]);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let reread = proxy.handle(ProxyRequest::get("orders", "alice")).await;
        assert_eq!(cache_status(&reread), "MISS");
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_cache_off_bypasses() {
        let transport = StubTransport::answering("[]");
        let proxy = proxy(&config(), transport.clone());

        for _ in 0..2 {
            let mut request = ProxyRequest::get("payment_gateways", "c");
            request.bypass_cache = true;
            assert_eq!(cache_status(&proxy.handle(request).await), "BYPASS");
        }
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_entry_served_when_upstream_is_down() {
        let mut config = config();
        config.cache.default_ttl = Duration::ZERO;
        config.dedup.enabled = false;
        let transport = StubTransport::scripted(
            vec![ok(r#"[{"id":1,"name":"Beanie"}]"#)],
            Err(TransportError::Connect("refused".to_string())),
            Duration::ZERO,
        );
        let proxy = proxy(&config, transport.clone());

        let first = proxy.handle(ProxyRequest::get("products", "c")).await;
        assert_eq!(cache_status(&first), "MISS");

        match proxy.handle(ProxyRequest::get("products", "c")).await {
            ProxyOutcome::Fallback { payload, source } => {
                assert_eq!(source, FallbackSource::StaleCache);
                assert_eq!(payload.body, Bytes::from_static(br#"[{"id":1,"name":"Beanie"}]"#));
            }
            other => panic!("expected stale fallback, got {:?}", other),
        }
        // first read, three attempts, one Store API call
        assert_eq!(transport.call_count(), 5);
    }

    #[tokio::test]
    async fn test_store_api_fallback_is_cached_briefly() {
        let transport = StubTransport::scripted(
            vec![
                Err(TransportError::Timeout),
                Err(TransportError::Timeout),
                Err(TransportError::Timeout),
                ok(r#"[{"id":3,"name":"Tee","prices":{"price":"999","currency_minor_unit":2}}]"#),
            ],
            Err(TransportError::Timeout),
            Duration::ZERO,
        );
        let proxy = proxy(&config(), transport.clone());

        match proxy.handle(ProxyRequest::get("products", "c")).await {
            ProxyOutcome::Fallback { payload, source } => {
                assert_eq!(source, FallbackSource::StoreApi);
                let body: serde_json::Value = serde_json::from_slice(&payload.body).unwrap();
                assert_eq!(body[0]["price"], "9.99");
            }
            other => panic!("expected store api fallback, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        let cached = proxy.handle(ProxyRequest::get("products", "c")).await;
        assert_eq!(cache_status(&cached), "HIT");
        assert_eq!(transport.call_count(), 4);
    }

    #[tokio::test]
    async fn test_unavailable_without_stale_fails() {
        let transport =
            StubTransport::scripted(Vec::new(), Err(TransportError::Timeout), Duration::ZERO);
        let proxy = proxy(&config(), transport);

        match proxy.handle(ProxyRequest::get("shop", "c")).await {
            ProxyOutcome::Failed(ProxyError::UpstreamUnavailable { attempts, .. }) => {
                assert_eq!(attempts, 3)
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_degraded_payload_is_not_cached() {
        let transport = StubTransport::answering("<html>maintenance</html>");
        let proxy = proxy(&config(), transport.clone());

        match proxy.handle(ProxyRequest::get("categories", "c")).await {
            ProxyOutcome::Fresh { payload, .. } => {
                assert!(payload.degraded);
                assert_eq!(payload.body, Bytes::from_static(b"[]"));
            }
            other => panic!("expected degraded payload, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        let again = proxy.handle(ProxyRequest::get("categories", "c")).await;
        assert_eq!(cache_status(&again), "MISS");
    }

    #[tokio::test]
    async fn test_missing_configuration() {
        let mut config = config();
        config.upstream.consumer_secret = None;
        let transport = StubTransport::answering("[]");
        let proxy = proxy(&config, transport.clone());

        match proxy.handle(ProxyRequest::get("products", "c")).await {
            ProxyOutcome::Failed(e) => assert_eq!(e.status_code().as_u16(), 500),
            other => panic!("expected configuration error, got {:?}", other),
        }
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_client() {
        let mut config = config();
        config.rate_limit = RateLimitConfig {
            enabled: true,
            requests_per_window: 1,
            burst_size: Some(1),
            window_duration: Duration::from_secs(60),
            ..RateLimitConfig::default()
        };
        let proxy = proxy(&config, StubTransport::answering("[]"));

        assert_eq!(cache_status(&proxy.handle(ProxyRequest::get("shop", "greedy")).await), "MISS");
        match proxy.handle(ProxyRequest::get("shop", "greedy")).await {
            ProxyOutcome::Failed(ProxyError::RateLimited { retry_after_secs }) => {
                assert!(retry_after_secs >= 1)
            }
            other => panic!("expected rate limit, got {:?}", other),
        }
        assert_eq!(cache_status(&proxy.handle(ProxyRequest::get("shop", "patient")).await), "MISS");
    }

    #[tokio::test]
    async fn test_single_products_are_batched() {
        let mut config = config();
        config.batching.enabled = true;
        let transport = StubTransport::answering(r#"[{"id":1},{"id":2},{"id":3}]"#);
        let proxy = proxy(&config, transport.clone());

        let outcomes = futures::future::join_all(
            (1..=3).map(|id| proxy.handle(ProxyRequest::get(format!("products/{}", id), "c"))),
        )
        .await;

        assert_eq!(transport.call_count(), 1);
        let call = transport.calls.lock()[0].clone();
        assert_eq!(call.path, "wc/v3/products");
        let include = call
            .query
            .iter()
            .find(|(name, _)| name == "include")
            .map(|(_, value)| value.clone())
            .unwrap();
        let mut ids: Vec<&str> = include.split(',').collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "2", "3"]);

        for (i, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                ProxyOutcome::Fresh { payload, cache } => {
                    assert_eq!(cache, CacheStatus::Miss);
                    let body: serde_json::Value = serde_json::from_slice(&payload.body).unwrap();
                    assert_eq!(body["id"], (i + 1) as u64);
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_client_error() {
        let proxy = proxy(&config(), StubTransport::answering("[]"));
        match proxy.handle(ProxyRequest::get("coupons", "c")).await {
            ProxyOutcome::Failed(e) => assert_eq!(e.status_code().as_u16(), 400),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
