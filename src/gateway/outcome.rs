//! Result variants of one proxied request and their HTTP rendering.

use crate::caching::CacheEntry;
use crate::core::error::ProxyError;
use crate::upstream::FetchedBody;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub const X_FALLBACK_SOURCE: HeaderName = HeaderName::from_static("x-fallback-source");
pub const X_UPSTREAM_DEGRADED: HeaderName = HeaderName::from_static("x-upstream-degraded");
pub const X_WP_TOTAL: HeaderName = HeaderName::from_static("x-wp-total");
pub const X_WP_TOTAL_PAGES: HeaderName = HeaderName::from_static("x-wp-totalpages");

/// How a successful response was served, reported in `X-Cache`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Dedup,
    Bypass,
    MissFallback,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Dedup => "DEDUP",
            Self::Bypass => "BYPASS",
            Self::MissFallback => "MISS-FALLBACK",
        }
    }
}

/// Where a degraded response came from, reported in `X-Fallback-Source`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackSource {
    StoreApi,
    StaleCache,
}

impl FallbackSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StoreApi => "store-api",
            Self::StaleCache => "stale-cache",
        }
    }
}

/// Body and representation headers of a response
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub status: u16,
    pub body: Bytes,
    pub integrity_tag: String,
    pub cache_control: Option<String>,
    pub total: Option<u64>,
    pub total_pages: Option<u64>,
    /// Placeholder standing in for a malformed upstream body
    pub degraded: bool,
}

impl Payload {
    pub fn from_entry(entry: &CacheEntry, cache_control: Option<String>) -> Self {
        Self {
            status: 200,
            body: Bytes::from(entry.body.clone()),
            integrity_tag: entry.integrity_tag.clone(),
            cache_control,
            total: entry.metadata.get("x-wp-total").and_then(|v| v.parse().ok()),
            total_pages: entry.metadata.get("x-wp-totalpages").and_then(|v| v.parse().ok()),
            degraded: false,
        }
    }

    pub fn from_fetched(
        fetched: &FetchedBody,
        integrity_tag: String,
        cache_control: Option<String>,
    ) -> Self {
        Self {
            status: fetched.status,
            body: fetched.body.clone(),
            integrity_tag,
            cache_control,
            total: fetched.total,
            total_pages: fetched.total_pages,
            degraded: fetched.degraded,
        }
    }

    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn write_headers(&self, headers: &mut HeaderMap) {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let cacheable = self.is_success() && !self.degraded;
        if cacheable {
            insert(headers, header::ETAG, &quoted(&self.integrity_tag));
        }
        match self.cache_control {
            Some(ref cache_control) if cacheable => {
                insert(headers, header::CACHE_CONTROL, cache_control)
            }
            _ => {
                headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
            }
        }

        if self.degraded {
            headers.insert(X_UPSTREAM_DEGRADED, HeaderValue::from_static("malformed-response"));
        }
        if let Some(total) = self.total {
            headers.insert(X_WP_TOTAL, HeaderValue::from(total));
        }
        if let Some(pages) = self.total_pages {
            headers.insert(X_WP_TOTAL_PAGES, HeaderValue::from(pages));
        }
    }
}

/// Outcome of one proxied request
#[derive(Debug, Clone)]
pub enum ProxyOutcome {
    Fresh { payload: Payload, cache: CacheStatus },
    Fallback { payload: Payload, source: FallbackSource },
    NotModified { integrity_tag: String, cache: CacheStatus },
    Failed(ProxyError),
}

impl ProxyOutcome {
    /// `X-Cache` label, or `ERROR` for failures
    pub fn cache_label(&self) -> &'static str {
        match self {
            Self::Fresh { cache, .. } | Self::NotModified { cache, .. } => cache.as_str(),
            Self::Fallback { .. } => CacheStatus::MissFallback.as_str(),
            Self::Failed(_) => "ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Fresh { payload, .. } | Self::Fallback { payload, .. } => {
                StatusCode::from_u16(payload.status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::NotModified { .. } => StatusCode::NOT_MODIFIED,
            Self::Failed(e) => e.status_code(),
        }
    }
}

impl IntoResponse for ProxyOutcome {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::Fresh { payload, cache } => {
                let mut headers = HeaderMap::new();
                payload.write_headers(&mut headers);
                headers.insert(X_CACHE, HeaderValue::from_static(cache.as_str()));
                (status, headers, payload.body).into_response()
            }
            Self::Fallback { payload, source } => {
                let mut headers = HeaderMap::new();
                payload.write_headers(&mut headers);
                headers.insert(
                    X_CACHE,
                    HeaderValue::from_static(CacheStatus::MissFallback.as_str()),
                );
                headers.insert(X_FALLBACK_SOURCE, HeaderValue::from_static(source.as_str()));
                (status, headers, payload.body).into_response()
            }
            Self::NotModified { integrity_tag, cache } => {
                let mut headers = HeaderMap::new();
                insert(&mut headers, header::ETAG, &quoted(&integrity_tag));
                headers.insert(X_CACHE, HeaderValue::from_static(cache.as_str()));
                (status, headers).into_response()
            }
            Self::Failed(error) => error.into_response(),
        }
    }
}

fn quoted(tag: &str) -> String {
    format!("\"{}\"", tag)
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Whether an `If-None-Match` header matches the entity tag
///
/// Weak validators and quotes are ignored; `*` matches anything.
pub fn if_none_match_matches(header_value: &str, integrity_tag: &str) -> bool {
    header_value.split(',').map(str::trim).any(|candidate| {
        if candidate == "*" {
            return true;
        }
        let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
        candidate.trim_matches('"') == integrity_tag
    })
}
