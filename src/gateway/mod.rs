//! Request orchestration and the HTTP surface.

pub mod outcome;
pub mod proxy;
pub mod server;

pub use outcome::{CacheStatus, FallbackSource, Payload, ProxyOutcome};
pub use proxy::{ProxyRequest, StorefrontProxy};
pub use server::{admin_router, gateway_router, ProxyServer, ServerConfig, ServerState};
