//! # Error Handling Module
//!
//! This module defines every error the proxy can surface to a client, using the
//! `thiserror` crate, and maps each one onto an HTTP status code.
//!
//! ## Error Taxonomy
//! - **Configuration**: upstream URL or credentials missing. Never retried.
//! - **Invalid request**: malformed or missing request parameters (400).
//! - **Not found**: a batched lookup whose identifier was absent upstream (404).
//! - **Rate limited**: the gate rejected the client (429 with retry guidance).
//! - **Upstream unavailable**: retries and fallback were exhausted (502).
//! - **Cache / internal**: unexpected faults inside the proxy (500).
//!
//! ## Why `Clone`?
//! A single upstream outcome is fanned out to every caller that joined a
//! deduplicated request, so the error half of that outcome must be cloneable.
//! All variants therefore carry owned strings rather than source errors.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::convert::Infallible;
use thiserror::Error;

/// Main result type used throughout the proxy
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Error types for the storefront proxy
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProxyError {
    /// Required configuration (upstream URL, credentials) is missing or invalid
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Request parameters are malformed or missing
    #[error("Invalid request: {field} - {reason}")]
    InvalidRequest { field: String, reason: String },

    /// The requested entity does not exist upstream
    #[error("Not found: {endpoint} id {id}")]
    NotFound { endpoint: String, id: String },

    /// Rate limit exceeded for this client and endpoint
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Upstream and fallback both failed after all attempts
    #[error("Upstream unavailable for '{endpoint}' after {attempts} attempt(s): {reason}")]
    UpstreamUnavailable {
        endpoint: String,
        attempts: u32,
        reason: String,
    },

    /// Cache layer fault that could not be degraded
    #[error("Cache error: {message}")]
    Cache { message: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl ProxyError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid request error for a specific field
    pub fn invalid<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::InvalidRequest {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a not found error for an entity id
    pub fn not_found<E: Into<String>, I: Into<String>>(endpoint: E, id: I) -> Self {
        Self::NotFound {
            endpoint: endpoint.into(),
            id: id.into(),
        }
    }

    /// Create an upstream unavailable error
    pub fn upstream_unavailable<E: Into<String>, R: Into<String>>(
        endpoint: E,
        attempts: u32,
        reason: R,
    ) -> Self {
        Self::UpstreamUnavailable {
            endpoint: endpoint.into(),
            attempts,
            reason: reason.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::Cache { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if the client may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::UpstreamUnavailable { .. }
        )
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::NotFound { .. } => "not_found",
            Self::RateLimited { .. } => "rate_limit_exceeded",
            Self::UpstreamUnavailable { .. } => "service_unavailable",
            Self::Cache { .. } => "internal_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Message safe to show to a storefront visitor
    ///
    /// Client-caused errors keep their detail; everything that could leak
    /// upstream hosts, credentials or internals is replaced by a generic text.
    pub fn public_message(&self) -> String {
        match self {
            Self::Configuration { .. } => {
                "The store is not configured correctly. Please try again later.".to_string()
            }
            Self::InvalidRequest { .. } | Self::NotFound { .. } => self.to_string(),
            Self::RateLimited { retry_after_secs } => format!(
                "Too many requests. Please retry in {} second(s).",
                retry_after_secs
            ),
            Self::UpstreamUnavailable { .. } => {
                "The store service is temporarily unavailable. Please try again shortly."
                    .to_string()
            }
            Self::Cache { .. } | Self::Internal { .. } => {
                "An unexpected error occurred.".to_string()
            }
        }
    }
}

impl From<Infallible> for ProxyError {
    fn from(infallible: Infallible) -> Self {
        match infallible {}
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("JSON error: {}", err),
        }
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration {
            message: format!("YAML error: {}", err),
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal {
            message: format!("I/O error: {}", err),
        }
    }
}

/// Converts errors into the JSON error envelope returned to clients
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.public_message(),
                "type": self.error_type(),
                "retryable": self.is_retryable(),
            }
        });

        let mut response = (status, Json(error_response)).into_response();
        if let Self::RateLimited { retry_after_secs } = &self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}
