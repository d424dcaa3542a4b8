//! # Upstream Fetcher with Retry
//!
//! Wraps an [`UpstreamTransport`] with the proxy's failure policy:
//!
//! - transport failures and 5xx responses retry with linear backoff
//!   (`backoff_base * attempt`) up to `max_attempts`;
//! - other non-2xx responses are terminal and passed through verbatim;
//! - a 2xx body that is not JSON earns one extra retry, then a well-formed
//!   empty payload flagged `degraded`;
//! - once attempts are exhausted, one call to the fallback source, if the
//!   endpoint has one, normalized into the primary schema;
//! - otherwise `ProxyError::UpstreamUnavailable`.
//!
//! Non-idempotent requests get exactly one attempt and no fallback.

use super::client::{RawResponse, ResponseShape, TransportError, UpstreamRequest, UpstreamTransport};
use super::normalize::{normalize, NormalizeKind};
use crate::core::error::{ProxyError, ProxyResult};
use crate::observability::metrics;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Retry policy for one call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Exactly one attempt
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            backoff_base: Duration::ZERO,
        }
    }
}

/// Alternate read source consulted after the primary is exhausted
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackRoute {
    /// Path below `/wp-json/`, e.g. `wc/store/v1/products`
    pub path: String,
    pub query: Vec<(String, String)>,
    pub kind: NormalizeKind,
}

/// Where a body came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Primary,
    Fallback,
}

/// Buffered result of a fetch
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBody {
    pub status: u16,
    pub body: Bytes,
    pub source: FetchSource,
    /// Primary attempts made
    pub attempts: u32,
    /// Soft-fail placeholder standing in for a malformed upstream body
    pub degraded: bool,
    /// `X-WP-Total`
    pub total: Option<u64>,
    /// `X-WP-TotalPages`
    pub total_pages: Option<u64>,
}

impl FetchedBody {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn from_raw(raw: RawResponse, source: FetchSource, attempts: u32) -> Self {
        Self {
            status: raw.status,
            total: raw.header_u64("x-wp-total"),
            total_pages: raw.header_u64("x-wp-totalpages"),
            body: raw.body,
            source,
            attempts,
            degraded: false,
        }
    }

    fn soft_fail(shape: ResponseShape, attempts: u32) -> Self {
        Self {
            status: 200,
            body: Bytes::from_static(shape.empty_payload().as_bytes()),
            source: FetchSource::Primary,
            attempts,
            degraded: true,
            total: None,
            total_pages: None,
        }
    }
}

enum AttemptOutcome {
    Success(RawResponse),
    Terminal(RawResponse),
    Malformed,
    Retryable(String),
}

/// Upstream fetcher
pub struct UpstreamFetcher {
    transport: Arc<dyn UpstreamTransport>,
}

impl UpstreamFetcher {
    pub fn new(transport: Arc<dyn UpstreamTransport>) -> Self {
        Self { transport }
    }

    /// Fetch with retries, soft-fail and an optional fallback
    pub async fn fetch_with_retry(
        &self,
        request: &UpstreamRequest,
        policy: &RetryPolicy,
        fallback: Option<&FallbackRoute>,
    ) -> ProxyResult<FetchedBody> {
        let idempotent = request.is_idempotent();
        let mut limit = if idempotent { policy.max_attempts.max(1) } else { 1 };
        let mut malformed_retry_used = false;
        let mut attempts = 0;
        let mut last_reason = String::from("no attempt made");

        while attempts < limit {
            attempts += 1;

            match self.attempt(request, attempts).await? {
                AttemptOutcome::Success(raw) => {
                    debug!(endpoint = %request.endpoint, attempts, "Upstream call succeeded");
                    return Ok(FetchedBody::from_raw(raw, FetchSource::Primary, attempts));
                }
                AttemptOutcome::Terminal(raw) => {
                    debug!(
                        endpoint = %request.endpoint,
                        status = raw.status,
                        "Terminal upstream status, not retrying"
                    );
                    return Ok(FetchedBody::from_raw(raw, FetchSource::Primary, attempts));
                }
                AttemptOutcome::Malformed => {
                    if !idempotent || malformed_retry_used {
                        warn!(
                            endpoint = %request.endpoint,
                            attempts,
                            "Upstream keeps returning malformed bodies, serving empty payload"
                        );
                        return Ok(FetchedBody::soft_fail(request.expect, attempts));
                    }
                    malformed_retry_used = true;
                    limit = limit.max(attempts + 1);
                    last_reason = "malformed response body".to_string();
                }
                AttemptOutcome::Retryable(reason) => {
                    last_reason = reason;
                }
            }

            if attempts < limit {
                let delay = policy.backoff_base * attempts;
                debug!(
                    endpoint = %request.endpoint,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying upstream call"
                );
                tokio::time::sleep(delay).await;
            }
        }

        warn!(
            endpoint = %request.endpoint,
            attempts,
            reason = %last_reason,
            "Upstream attempts exhausted"
        );

        if idempotent {
            if let Some(route) = fallback {
                if let Some(body) = self.fetch_fallback(request, route, attempts).await {
                    return Ok(body);
                }
            }
        }

        Err(ProxyError::upstream_unavailable(
            request.endpoint.clone(),
            attempts,
            last_reason,
        ))
    }

    async fn attempt(
        &self,
        request: &UpstreamRequest,
        attempt: u32,
    ) -> ProxyResult<AttemptOutcome> {
        let started = Instant::now();
        let result = self.transport.send(request).await;
        let latency = started.elapsed();

        let outcome = match result {
            Ok(raw) if (200..300).contains(&raw.status) => {
                if body_is_well_formed(request, &raw) {
                    metrics::record_upstream_attempt(&request.endpoint, "ok", latency);
                    AttemptOutcome::Success(raw)
                } else {
                    metrics::record_upstream_attempt(&request.endpoint, "malformed", latency);
                    warn!(
                        endpoint = %request.endpoint,
                        attempt,
                        content_type = raw.content_type.as_deref().unwrap_or("none"),
                        latency_ms = latency.as_millis() as u64,
                        "Upstream returned a malformed body"
                    );
                    AttemptOutcome::Malformed
                }
            }
            Ok(raw) if raw.status >= 500 => {
                metrics::record_upstream_attempt(&request.endpoint, "server_error", latency);
                warn!(
                    endpoint = %request.endpoint,
                    attempt,
                    status = raw.status,
                    latency_ms = latency.as_millis() as u64,
                    "Upstream server error"
                );
                AttemptOutcome::Retryable(format!("HTTP {}", raw.status))
            }
            Ok(raw) => {
                metrics::record_upstream_attempt(&request.endpoint, "client_error", latency);
                AttemptOutcome::Terminal(raw)
            }
            Err(TransportError::NotConfigured(detail)) => {
                return Err(ProxyError::config(format!(
                    "Upstream for '{}' is not configured: {}",
                    request.endpoint, detail
                )));
            }
            Err(e) => {
                metrics::record_upstream_attempt(&request.endpoint, e.kind(), latency);
                warn!(
                    endpoint = %request.endpoint,
                    attempt,
                    error = %e,
                    latency_ms = latency.as_millis() as u64,
                    "Upstream transport failure"
                );
                AttemptOutcome::Retryable(e.to_string())
            }
        };

        Ok(outcome)
    }

    async fn fetch_fallback(
        &self,
        primary: &UpstreamRequest,
        route: &FallbackRoute,
        attempts: u32,
    ) -> Option<FetchedBody> {
        let request = UpstreamRequest {
            endpoint: format!("{}:fallback", primary.endpoint),
            method: primary.method.clone(),
            path: route.path.clone(),
            query: route.query.clone(),
            body: None,
            timeout: primary.timeout,
            authenticated: false,
            expect: primary.expect,
        };

        let started = Instant::now();
        let raw = match self.transport.send(&request).await {
            Ok(raw) if (200..300).contains(&raw.status) => raw,
            Ok(raw) => {
                let latency = started.elapsed();
                metrics::record_upstream_attempt(&request.endpoint, "server_error", latency);
                warn!(endpoint = %primary.endpoint, status = raw.status, "Fallback source failed");
                return None;
            }
            Err(e) => {
                metrics::record_upstream_attempt(&request.endpoint, e.kind(), started.elapsed());
                warn!(endpoint = %primary.endpoint, error = %e, "Fallback source unreachable");
                return None;
            }
        };

        let payload = match serde_json::from_slice::<serde_json::Value>(&raw.body) {
            Ok(payload) => payload,
            Err(e) => {
                metrics::record_upstream_attempt(&request.endpoint, "malformed", started.elapsed());
                warn!(
                    endpoint = %primary.endpoint,
                    error = %e,
                    "Fallback source returned a malformed body"
                );
                return None;
            }
        };
        metrics::record_upstream_attempt(&request.endpoint, "ok", started.elapsed());

        let normalized = normalize(route.kind, payload);
        let body = match serde_json::to_vec(&normalized) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                warn!(
                    endpoint = %primary.endpoint,
                    error = %e,
                    "Failed to encode normalized fallback body"
                );
                return None;
            }
        };

        info!(endpoint = %primary.endpoint, attempts, "Served from fallback source");

        Some(FetchedBody {
            status: 200,
            total: raw.header_u64("x-wp-total"),
            total_pages: raw.header_u64("x-wp-totalpages"),
            body,
            source: FetchSource::Fallback,
            attempts,
            degraded: false,
        })
    }
}

/// Whether a 2xx body is the structured data the caller expects
fn body_is_well_formed(request: &UpstreamRequest, raw: &RawResponse) -> bool {
    if raw.status == 204 || request.method == axum::http::Method::HEAD {
        return true;
    }
    if raw.body.is_empty() {
        return !request.is_idempotent();
    }
    serde_json::from_slice::<serde::de::IgnoredAny>(&raw.body).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::Method;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, VecDeque};

    /// Transport replaying a script of responses, recording every request
    pub(crate) struct ScriptedTransport {
        script: Mutex<VecDeque<Result<RawResponse, TransportError>>>,
        pub(crate) seen: Mutex<Vec<UpstreamRequest>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<RawResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn paths(&self) -> Vec<String> {
            self.seen.lock().iter().map(|r| r.path.clone()).collect()
        }
    }

    #[async_trait]
    impl UpstreamTransport for ScriptedTransport {
        async fn send(&self, request: &UpstreamRequest) -> Result<RawResponse, TransportError> {
            self.seen.lock().push(request.clone());
            self.script
                .lock()
                .pop_front()
                .unwrap_or(Err(TransportError::Other("script exhausted".to_string())))
        }
    }

    fn response(status: u16, body: &str) -> Result<RawResponse, TransportError> {
        Ok(RawResponse {
            status,
            content_type: Some("application/json".to_string()),
            headers: BTreeMap::new(),
            body: Bytes::from(body.to_string()),
        })
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
        }
    }

    fn products_request() -> UpstreamRequest {
        UpstreamRequest::get("products", "wc/v3/products", Duration::from_secs(8))
    }

    fn store_fallback() -> FallbackRoute {
        FallbackRoute {
            path: "wc/store/v1/products".to_string(),
            query: Vec::new(),
            kind: NormalizeKind::Product,
        }
    }

    #[tokio::test]
    async fn test_fails_twice_then_succeeds() {
        let transport = ScriptedTransport::new(vec![
            response(503, "unavailable"),
            Err(TransportError::Timeout),
            response(200, r#"[{"id":1}]"#),
        ]);
        let fetcher = UpstreamFetcher::new(transport.clone());

        let fetched = fetcher
            .fetch_with_retry(&products_request(), &fast_policy(), None)
            .await
            .unwrap();

        assert_eq!(fetched.attempts, 3);
        assert_eq!(fetched.body, Bytes::from(r#"[{"id":1}]"#));
        assert_eq!(fetched.source, FetchSource::Primary);
        assert_eq!(transport.seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_terminal() {
        let transport = ScriptedTransport::new(vec![response(
            404,
            r#"{"code":"woocommerce_rest_product_invalid_id"}"#,
        )]);
        let fetcher = UpstreamFetcher::new(transport.clone());

        let fetched = fetcher
            .fetch_with_retry(&products_request(), &fast_policy(), Some(&store_fallback()))
            .await
            .unwrap();

        assert_eq!(fetched.status, 404);
        assert_eq!(fetched.attempts, 1);
        assert!(fetched.body.starts_with(b"{\"code\""));
        assert_eq!(transport.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_without_fallback() {
        let transport = ScriptedTransport::new(vec![
            response(500, ""),
            response(502, ""),
            response(504, ""),
        ]);
        let fetcher = UpstreamFetcher::new(transport);

        let err = fetcher
            .fetch_with_retry(&products_request(), &fast_policy(), None)
            .await
            .unwrap_err();

        match err {
            ProxyError::UpstreamUnavailable { endpoint, attempts, reason } => {
                assert_eq!(endpoint, "products");
                assert_eq!(attempts, 3);
                assert_eq!(reason, "HTTP 504");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fallback_is_normalized() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Connect("refused".to_string())),
            Err(TransportError::Connect("refused".to_string())),
            Err(TransportError::Connect("refused".to_string())),
            response(
                200,
                r#"[{"id":9,"name":"Cap","prices":{"price":"1250","regular_price":"1250","sale_price":"1250","currency_minor_unit":2},"is_in_stock":true}]"#,
            ),
        ]);
        let fetcher = UpstreamFetcher::new(transport.clone());

        let fetched = fetcher
            .fetch_with_retry(&products_request(), &fast_policy(), Some(&store_fallback()))
            .await
            .unwrap();

        assert_eq!(fetched.source, FetchSource::Fallback);
        assert_eq!(fetched.attempts, 3);
        let body: serde_json::Value = serde_json::from_slice(&fetched.body).unwrap();
        assert_eq!(body[0]["price"], "12.50");
        assert_eq!(body[0]["stock_status"], "instock");

        let seen = transport.seen.lock();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[3].path, "wc/store/v1/products");
        assert!(!seen[3].authenticated);
    }

    #[tokio::test]
    async fn test_failed_fallback_surfaces_unavailable() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
            response(500, "oops"),
        ]);
        let fetcher = UpstreamFetcher::new(transport.clone());

        let err = fetcher
            .fetch_with_retry(&products_request(), &fast_policy(), Some(&store_fallback()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamUnavailable { attempts: 3, .. }));
        assert_eq!(transport.seen.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_malformed_body_soft_fails() {
        let transport = ScriptedTransport::new(vec![
            response(200, "<html><body>Fatal error</body></html>"),
            response(200, "<html><body>Fatal error</body></html>"),
        ]);
        let fetcher = UpstreamFetcher::new(transport.clone());

        let list = fetcher
            .fetch_with_retry(&products_request(), &fast_policy(), Some(&store_fallback()))
            .await
            .unwrap();
        assert_eq!(list.status, 200);
        assert!(list.degraded);
        assert_eq!(list.body, Bytes::from_static(b"[]"));
        assert_eq!(list.attempts, 2);
        assert_eq!(transport.paths(), vec!["wc/v3/products", "wc/v3/products"]);
    }

    #[tokio::test]
    async fn test_malformed_then_valid() {
        let transport = ScriptedTransport::new(vec![
            response(200, "<!DOCTYPE html>"),
            response(200, r#"{"id":5}"#),
        ]);
        let fetcher = UpstreamFetcher::new(transport);
        let request =
            UpstreamRequest::get("products/{id}", "wc/v3/products/5", Duration::from_secs(8))
                .expecting(ResponseShape::Object);

        let fetched = fetcher.fetch_with_retry(&request, &fast_policy(), None).await.unwrap();
        assert!(!fetched.degraded);
        assert_eq!(fetched.attempts, 2);
    }

    #[tokio::test]
    async fn test_malformed_on_last_attempt_gets_one_more() {
        let transport = ScriptedTransport::new(vec![
            response(500, ""),
            response(500, ""),
            response(200, "<html>"),
            response(200, "<html>"),
        ]);
        let fetcher = UpstreamFetcher::new(transport.clone());
        let request = products_request().expecting(ResponseShape::Object);

        let fetched = fetcher.fetch_with_retry(&request, &fast_policy(), None).await.unwrap();
        assert!(fetched.degraded);
        assert_eq!(fetched.body, Bytes::from_static(b"{}"));
        assert_eq!(transport.seen.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_writes_get_one_attempt_and_no_fallback() {
        let transport = ScriptedTransport::new(vec![response(503, ""), response(201, "{}")]);
        let fetcher = UpstreamFetcher::new(transport.clone());
        let mut request = UpstreamRequest::get("orders", "wc/v3/orders", Duration::from_secs(30));
        request.method = Method::POST;
        request.body = Some(Bytes::from_static(b"{}"));

        let err = fetcher
            .fetch_with_retry(&request, &fast_policy(), Some(&store_fallback()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamUnavailable { attempts: 1, .. }));
        assert_eq!(transport.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_not_configured_is_a_configuration_error() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::NotConfigured(
            "base URL missing".to_string(),
        ))]);
        let fetcher = UpstreamFetcher::new(transport.clone());

        let err = fetcher
            .fetch_with_retry(&products_request(), &fast_policy(), Some(&store_fallback()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Configuration { .. }));
        assert_eq!(transport.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_pagination_headers_are_kept() {
        let mut headers = BTreeMap::new();
        headers.insert("x-wp-total".to_string(), "57".to_string());
        headers.insert("x-wp-totalpages".to_string(), "6".to_string());
        let transport = ScriptedTransport::new(vec![Ok(RawResponse {
            status: 200,
            content_type: Some("application/json".to_string()),
            headers,
            body: Bytes::from_static(b"[]"),
        })]);
        let fetcher = UpstreamFetcher::new(transport);

        let fetched = fetcher
            .fetch_with_retry(&products_request(), &fast_policy(), None)
            .await
            .unwrap();
        assert_eq!(fetched.total, Some(57));
        assert_eq!(fetched.total_pages, Some(6));
    }
}
