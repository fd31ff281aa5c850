//! Tracing infrastructure.
//!
//! Structured, async-aware logging for the server using the `tracing` and
//! `tracing-subscriber` crates:
//! - structured events with fields (session id, instrument id, item name)
//! - environment-based filtering via `RUST_LOG`
//! - pretty output for development, compact for production
//!
//! The subscriber is initialised once at startup from [`Settings`]; the
//! configured level acts as the default when `RUST_LOG` is unset.

use crate::config::Settings;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Compact format without colors (for production)
    Compact,
    /// JSON format for log aggregation
    Json,
}

/// Initialise the global subscriber from settings.
///
/// `RUST_LOG` takes precedence over the configured level so operators can
/// raise verbosity per-target without editing the config file.
pub fn init_from_settings(settings: &Settings) -> Result<(), String> {
    init_with(settings.application.log_level.as_str(), OutputFormat::Compact)
}

/// Initialise with an explicit level and format.
pub fn init_with(default_level: &str, format: OutputFormat) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| format!("Invalid log filter: {e}"))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        OutputFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        OutputFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
        OutputFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };

    result.map_err(|e| format!("Failed to initialise tracing: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_enough_for_tests() {
        // A second init fails because a global subscriber is already set;
        // both outcomes are acceptable here.
        let _ = init_with("info", OutputFormat::Compact);
        let second = init_with("debug", OutputFormat::Pretty);
        let _ = second;
    }
}
