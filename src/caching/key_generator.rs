//! # Cache Key Generator
//!
//! Derives the cache and deduplication key for a normalized request. Two
//! requests that differ only in query parameter order share a key; everything
//! else that changes the upstream answer (method, path, parameters, body,
//! caller scope for private resources) changes it.
//!
//! Layout: `{prefix}{METHOD}:{path}?{sorted query}[#b={body sha256}][@{scope}]`.
//! Keys longer than the configured maximum keep the readable
//! `{prefix}{METHOD}:{path}?` namespace and replace the rest with `~{sha256}`.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use url::form_urlencoded;

/// A request reduced to what determines its upstream answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestShape {
    /// HTTP method (normalized to upper case in the key)
    pub method: String,

    /// Upstream path, e.g. `wc/v3/products`
    pub path: String,

    /// Query parameters in arrival order
    pub params: Vec<(String, String)>,

    /// Request body, hashed into the key
    pub body: Option<Bytes>,

    /// Caller identity for user-scoped resources
    pub scope: Option<String>,
}

impl RequestShape {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            params: Vec::new(),
            body: None,
            scope: None,
        }
    }

    pub fn with_params(mut self, params: Vec<(String, String)>) -> Self {
        self.params = params;
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = if body.is_empty() { None } else { Some(body) };
        self
    }

    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }
}

/// Deterministic key generator
#[derive(Debug, Clone)]
pub struct CacheKeyGenerator {
    prefix: String,
    max_length: usize,
}

impl Default for CacheKeyGenerator {
    fn default() -> Self {
        Self::new("woo:", 250)
    }
}

impl CacheKeyGenerator {
    pub fn new(prefix: impl Into<String>, max_length: usize) -> Self {
        Self {
            prefix: prefix.into(),
            max_length,
        }
    }

    /// Namespace prefix shared by every key this generator produces
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Generate the key for a request shape
    pub fn generate(&self, shape: &RequestShape) -> String {
        let namespace = format!(
            "{}{}:{}?",
            self.prefix,
            shape.method.to_ascii_uppercase(),
            shape.path.trim_matches('/')
        );

        let mut suffix = canonical_query(&shape.params);
        if let Some(ref body) = shape.body {
            suffix.push_str("#b=");
            suffix.push_str(&sha256_hex(body));
        }
        if let Some(ref scope) = shape.scope {
            suffix.push('@');
            suffix.push_str(scope);
        }

        if namespace.len() + suffix.len() <= self.max_length {
            return namespace + &suffix;
        }

        format!("{}~{}", namespace, sha256_hex(suffix.as_bytes()))
    }
}

/// Sort parameters by name, then value, and form-encode them
pub fn canonical_query(params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (name, value) in sorted {
        serializer.append_pair(name, value);
    }
    serializer.finish()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
