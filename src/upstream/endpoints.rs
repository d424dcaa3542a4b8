//! Logical endpoint catalogue.
//!
//! Clients address WooCommerce through short logical names (`products`,
//! `products/42`, `orders`). Each one resolves to an upstream path, a cache
//! policy and, for catalogue reads, a Store API fallback.

use super::client::ResponseShape;
use super::fetcher::FallbackRoute;
use super::normalize::NormalizeKind;
use crate::core::error::{ProxyError, ProxyResult};
use std::time::Duration;

const REST_PREFIX: &str = "wc/v3";
const STORE_PREFIX: &str = "wc/store/v1";

const HOUR: Duration = Duration::from_secs(3600);
const TEN_MINUTES: Duration = Duration::from_secs(600);
const PRIVATE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Shared across all clients
    Public,
    /// Scoped to one client identity
    Private,
}

/// A logical endpoint resolved against the catalogue
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEndpoint {
    /// Normalized logical name, e.g. `products/42`
    pub name: String,
    /// Route template used as a low-cardinality label, e.g. `products/{id}`
    pub route: &'static str,
    pub upstream_path: String,
    pub visibility: Visibility,
    pub ttl: Duration,
    pub tags: Vec<&'static str>,
    pub fallback: Option<FallbackRoute>,
    pub shape: ResponseShape,
    /// Numeric identifier addressed by the route, if any
    pub entity_id: Option<u64>,
    pub batchable: bool,
}

impl ResolvedEndpoint {
    pub fn is_private(&self) -> bool {
        self.visibility == Visibility::Private
    }

    pub fn cache_control(&self) -> String {
        let secs = self.ttl.as_secs();
        match self.visibility {
            Visibility::Public => format!("public, max-age={secs}, stale-while-revalidate={secs}"),
            Visibility::Private => format!("private, max-age={secs}"),
        }
    }

    /// Comma-separated tag list stored in cache metadata
    pub fn tag_list(&self) -> String {
        self.tags.join(",")
    }

    /// Fallback route carrying the client's query parameters
    pub fn fallback_with_query(&self, query: &[(String, String)]) -> Option<FallbackRoute> {
        self.fallback.as_ref().map(|route| FallbackRoute {
            query: query.to_vec(),
            ..route.clone()
        })
    }
}

/// Resolves logical endpoint names
#[derive(Debug, Clone)]
pub struct EndpointCatalogue {
    product_ttl: Duration,
}

impl Default for EndpointCatalogue {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl EndpointCatalogue {
    /// `product_ttl` applies to product reads; other routes have fixed TTLs
    pub fn new(product_ttl: Duration) -> Self {
        Self { product_ttl }
    }

    pub fn resolve(&self, endpoint: &str) -> ProxyResult<ResolvedEndpoint> {
        let name = endpoint.trim().trim_matches('/');
        if name.is_empty() {
            return Err(ProxyError::invalid("endpoint", "must not be empty"));
        }

        let segments: Vec<&str> = name.split('/').collect();
        if segments.iter().any(|s| s.is_empty() || *s == "." || *s == "..") {
            return Err(ProxyError::invalid("endpoint", format!("'{}' is not a valid path", name)));
        }

        let resolved = match segments.as_slice() {
            ["products"] => self.products(name, None),
            ["products", "categories"] | ["categories"] => {
                taxonomy(name, "categories", NormalizeKind::Category, None)
            }
            ["products", "categories", id] | ["categories", id] => {
                taxonomy(name, "categories", NormalizeKind::Category, Some(parse_id(id)?))
            }
            ["products", "attributes"] | ["attributes"] => {
                taxonomy(name, "attributes", NormalizeKind::Attribute, None)
            }
            ["products", "attributes", id] | ["attributes", id] => {
                taxonomy(name, "attributes", NormalizeKind::Attribute, Some(parse_id(id)?))
            }
            ["products", id] => self.products(name, Some(parse_id(id)?)),
            ["shop"] => public(name, "shop", "settings/general", TEN_MINUTES, "shop"),
            ["shipping_methods"] => {
                public(name, "shipping_methods", "shipping_methods", HOUR, "shipping")
            }
            ["payment_gateways"] => {
                public(name, "payment_gateways", "payment_gateways", TEN_MINUTES, "payments")
            }
            ["orders"] => private(
                name,
                "orders",
                "orders".to_string(),
                "orders",
                ResponseShape::List,
                None,
            ),
            ["orders", id] => {
                let id = parse_id(id)?;
                private(
                    name,
                    "orders/{id}",
                    format!("orders/{id}"),
                    "orders",
                    ResponseShape::Object,
                    Some(id),
                )
            }
            ["customers", id] => {
                let id = parse_id(id)?;
                private(
                    name,
                    "customers/{id}",
                    format!("customers/{id}"),
                    "customers",
                    ResponseShape::Object,
                    Some(id),
                )
            }
            ["customers", id, rest @ ..] => {
                let id = parse_id(id)?;
                private(
                    name,
                    "customers/{id}/*",
                    format!("customers/{}/{}", id, rest.join("/")),
                    "customers",
                    ResponseShape::List,
                    Some(id),
                )
            }
            _ => {
                return Err(ProxyError::invalid(
                    "endpoint",
                    format!("unknown endpoint '{}'", name),
                ))
            }
        };

        Ok(resolved)
    }

    fn products(&self, name: &str, id: Option<u64>) -> ResolvedEndpoint {
        let (route, suffix, shape) = match id {
            Some(id) => ("products/{id}", format!("products/{id}"), ResponseShape::Object),
            None => ("products", "products".to_string(), ResponseShape::List),
        };

        ResolvedEndpoint {
            name: name.to_string(),
            route,
            upstream_path: format!("{REST_PREFIX}/{suffix}"),
            visibility: Visibility::Public,
            ttl: self.product_ttl,
            tags: vec!["products"],
            fallback: Some(FallbackRoute {
                path: format!("{STORE_PREFIX}/{suffix}"),
                query: Vec::new(),
                kind: NormalizeKind::Product,
            }),
            shape,
            entity_id: id,
            batchable: true,
        }
    }
}

fn taxonomy(
    name: &str,
    tag: &'static str,
    kind: NormalizeKind,
    id: Option<u64>,
) -> ResolvedEndpoint {
    let (route, suffix, shape) = match (tag, id) {
        ("categories", Some(id)) => (
            "categories/{id}",
            format!("products/categories/{id}"),
            ResponseShape::Object,
        ),
        ("categories", None) => {
            ("categories", "products/categories".to_string(), ResponseShape::List)
        }
        (_, Some(id)) => (
            "attributes/{id}",
            format!("products/attributes/{id}"),
            ResponseShape::Object,
        ),
        (_, None) => ("attributes", "products/attributes".to_string(), ResponseShape::List),
    };

    ResolvedEndpoint {
        name: name.to_string(),
        route,
        upstream_path: format!("{REST_PREFIX}/{suffix}"),
        visibility: Visibility::Public,
        ttl: HOUR,
        tags: vec![tag],
        fallback: Some(FallbackRoute {
            path: format!("{STORE_PREFIX}/{suffix}"),
            query: Vec::new(),
            kind,
        }),
        shape,
        entity_id: id,
        batchable: false,
    }
}

fn public(
    name: &str,
    route: &'static str,
    suffix: &str,
    ttl: Duration,
    tag: &'static str,
) -> ResolvedEndpoint {
    ResolvedEndpoint {
        name: name.to_string(),
        route,
        upstream_path: format!("{REST_PREFIX}/{suffix}"),
        visibility: Visibility::Public,
        ttl,
        tags: vec![tag],
        fallback: None,
        shape: ResponseShape::List,
        entity_id: None,
        batchable: false,
    }
}

fn private(
    name: &str,
    route: &'static str,
    suffix: String,
    tag: &'static str,
    shape: ResponseShape,
    id: Option<u64>,
) -> ResolvedEndpoint {
    ResolvedEndpoint {
        name: name.to_string(),
        route,
        upstream_path: format!("{REST_PREFIX}/{suffix}"),
        visibility: Visibility::Private,
        ttl: PRIVATE_TTL,
        tags: vec![tag],
        fallback: None,
        shape,
        entity_id: id,
        batchable: false,
    }
}

fn parse_id(raw: &str) -> ProxyResult<u64> {
    raw.parse::<u64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| {
            ProxyError::invalid("endpoint", format!("'{}' is not a valid identifier", raw))
        })
}
