//! # Observability
//!
//! Structured logging setup and the metric catalogue.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat};
