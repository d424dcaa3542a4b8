//! WooCommerce upstream access: transport, retry policy, fallback
//! normalization and the logical endpoint catalogue.

pub mod client;
pub mod endpoints;
pub mod fetcher;
pub mod normalize;

pub use client::{
    HttpTransport, RawResponse, ResponseShape, TransportError, UpstreamRequest, UpstreamTransport,
};
pub use endpoints::{EndpointCatalogue, ResolvedEndpoint, Visibility};
pub use fetcher::{FallbackRoute, FetchSource, FetchedBody, RetryPolicy, UpstreamFetcher};
pub use normalize::{normalize, NormalizeKind};
