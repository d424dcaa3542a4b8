//! # Upstream Transport
//!
//! The fetcher talks to WooCommerce only through [`UpstreamTransport`], so tests
//! can substitute scripted responses. [`HttpTransport`] is the `reqwest`
//! implementation: it resolves `{base}/wp-json/{path}`, sends the consumer
//! key and secret with HTTP basic auth on authenticated requests, and buffers
//! the whole body before returning.

use crate::core::config::UpstreamSettings;
use crate::core::error::{ProxyError, ProxyResult};
use async_trait::async_trait;
use axum::http::Method;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Response headers kept from upstream (lower-case names)
pub const FORWARDED_HEADERS: &[&str] = &["x-wp-total", "x-wp-totalpages"];

/// What the caller expects a successful body to look like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    List,
    Object,
}

impl ResponseShape {
    /// Well-formed empty payload of this shape
    pub fn empty_payload(&self) -> &'static str {
        match self {
            Self::List => "[]",
            Self::Object => "{}",
        }
    }
}

/// One outbound call
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    /// Logical endpoint name, for logs and metrics
    pub endpoint: String,
    pub method: Method,
    /// Path below `/wp-json/`, e.g. `wc/v3/products`
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub timeout: Duration,
    /// Send consumer credentials
    pub authenticated: bool,
    pub expect: ResponseShape,
}

impl UpstreamRequest {
    pub fn get(endpoint: impl Into<String>, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            body: None,
            timeout,
            authenticated: true,
            expect: ResponseShape::List,
        }
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn expecting(mut self, shape: ResponseShape) -> Self {
        self.expect = shape;
        self
    }

    /// Safe to repeat without side effects
    pub fn is_idempotent(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }
}

/// Fully buffered upstream response
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl RawResponse {
    pub fn header_u64(&self, name: &str) -> Option<u64> {
        self.headers.get(name).and_then(|v| v.trim().parse().ok())
    }
}

/// Transport-level failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("upstream not configured: {0}")]
    NotConfigured(String),

    #[error("request failed: {0}")]
    Other(String),
}

impl TransportError {
    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connect(_) => "connect_error",
            Self::NotConfigured(_) => "not_configured",
            Self::Other(_) => "transport_error",
        }
    }
}

#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn send(&self, request: &UpstreamRequest) -> Result<RawResponse, TransportError>;
}

/// `reqwest` transport against a WordPress site
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Option<Url>,
    credentials: Option<(String, String)>,
}

impl HttpTransport {
    /// Build the transport; missing URL or credentials are tolerated here and
    /// reported per request
    pub fn new(settings: &UpstreamSettings) -> ProxyResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ProxyError::internal(format!("Failed to build HTTP client: {}", e)))?;

        let base_url = settings
            .base_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .and_then(|url| Url::parse(url).ok());

        let credentials = match (&settings.consumer_key, &settings.consumer_secret) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Some((key.clone(), secret.clone()))
            }
            _ => None,
        };

        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    /// Resolve the absolute URL for a request
    pub fn url_for(&self, request: &UpstreamRequest) -> Result<Url, TransportError> {
        let base = self
            .base_url
            .as_ref()
            .ok_or_else(|| TransportError::NotConfigured("base URL missing".to_string()))?;

        let joined = format!(
            "{}/wp-json/{}",
            base.as_str().trim_end_matches('/'),
            request.path.trim_start_matches('/')
        );
        let mut url = Url::parse(&joined).map_err(|e| TransportError::Other(e.to_string()))?;

        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        Ok(url)
    }
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn send(&self, request: &UpstreamRequest) -> Result<RawResponse, TransportError> {
        let url = self.url_for(request)?;

        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let mut builder = self
            .client
            .request(method, url)
            .timeout(request.timeout)
            .header(reqwest::header::ACCEPT, "application/json");

        if request.authenticated {
            let (key, secret) = self
                .credentials
                .as_ref()
                .ok_or_else(|| {
                    TransportError::NotConfigured("consumer credentials missing".to_string())
                })?;
            builder = builder.basic_auth(key, Some(secret));
        }

        if let Some(ref body) = request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        let response = builder.send().await.map_err(classify)?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let headers = FORWARDED_HEADERS
            .iter()
            .filter_map(|name| {
                response
                    .headers()
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();

        let body = response.bytes().await.map_err(classify)?;

        Ok(RawResponse {
            status,
            content_type,
            headers,
            body,
        })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        // reqwest errors embed the URL; drop it so query credentials never reach logs
        TransportError::Other(err.without_url().to_string())
    }
}
