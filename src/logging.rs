//! Logging setup.
//!
//! The loaders log through `tracing`: batch dispatch and bulk reads at
//! `debug`, retries and unexpected records at `warn`, broken batch contracts
//! at `error`. Nothing is printed unless a subscriber is installed, either
//! by the application or by [`init`] (with the `tracing-subscriber` feature).
//!
//! # Environment Variables
//!
//! - `LOADER_DEBUG=true` - Enable debug logging
//! - `LOADER_LOG_LEVEL=debug|info|warn|error|trace` - Set a specific level
//! - `LOADER_LOG_FORMAT=json|pretty|compact` - Output format (default: json)

use std::env;
use std::sync::Once;

static INIT: Once = Once::new();

/// Check if debug logging is enabled via `LOADER_DEBUG`.
pub fn is_debug_enabled() -> bool {
    env::var("LOADER_DEBUG")
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// The configured log level. Defaults to "debug" if `LOADER_DEBUG` is
/// enabled, otherwise "warn".
pub fn log_level() -> &'static str {
    level_from(
        env::var("LOADER_LOG_LEVEL").ok().as_deref(),
        is_debug_enabled(),
    )
}

/// The configured output format. Defaults to "json".
pub fn log_format() -> &'static str {
    format_from(env::var("LOADER_LOG_FORMAT").ok().as_deref())
}

fn level_from(level: Option<&str>, debug: bool) -> &'static str {
    match level.map(str::to_lowercase).as_deref() {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("info") => "info",
        Some("warn") => "warn",
        Some("error") => "error",
        _ if debug => "debug",
        _ => "warn",
    }
}

fn format_from(format: Option<&str>) -> &'static str {
    match format.map(str::to_lowercase).as_deref() {
        Some("pretty") => "pretty",
        Some("compact") => "compact",
        _ => "json",
    }
}

/// Install a global subscriber for this crate's events. Only the first call
/// does anything, and only if `LOADER_DEBUG` or `LOADER_LOG_LEVEL` is set.
pub fn init() {
    INIT.call_once(|| {
        if !is_debug_enabled() && env::var("LOADER_LOG_LEVEL").is_err() {
            return;
        }

        #[cfg(feature = "tracing-subscriber")]
        {
            use tracing_subscriber::{fmt, prelude::*, EnvFilter};

            let level = log_level();
            let filter = EnvFilter::try_new(format!("entityloader={}", level))
                .unwrap_or_else(|_| EnvFilter::new("warn"));

            // try_init: the application may already have a subscriber.
            let installed = match log_format() {
                "json" => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json())
                    .try_init(),
                "compact" => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().compact())
                    .try_init(),
                _ => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().pretty())
                    .try_init(),
            };

            if installed.is_ok() {
                tracing::info!(level, format = log_format(), "entityloader logging initialized");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels() {
        assert_eq!(level_from(None, false), "warn");
        assert_eq!(level_from(None, true), "debug");
        assert_eq!(level_from(Some("TRACE"), false), "trace");
        assert_eq!(level_from(Some("loud"), false), "warn");
    }

    #[test]
    fn formats() {
        assert_eq!(format_from(None), "json");
        assert_eq!(format_from(Some("Pretty")), "pretty");
        assert_eq!(format_from(Some("compact")), "compact");
        assert_eq!(format_from(Some("xml")), "json");
    }
}
