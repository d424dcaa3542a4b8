//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. The filter comes from `RUST_LOG`
//! when set, otherwise from the configured level for this crate plus
//! `tower_http`. Output is JSON (one object per line) or human readable text.

use crate::core::config::LoggingConfig;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Supported log output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Self::Text,
            _ => Self::Json,
        }
    }
}

/// Default directives when `RUST_LOG` is not set
pub fn default_directives(level: &str) -> String {
    let level = level.to_ascii_lowercase();
    format!("storefront_proxy={level},tower_http={level}")
}

/// Initialize the global subscriber
///
/// Calling this twice (tests, embedded use) logs a warning instead of failing.
pub fn init_logging(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.level)));

    let result = match LogFormat::parse(&config.format) {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .try_init(),
    };

    if result.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
        return;
    }

    info!(level = %config.level, format = %config.format, "Structured logging initialized");
}
