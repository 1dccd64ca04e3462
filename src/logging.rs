//! Structured logging setup.
//!
//! stdout belongs to the child process and to command listings, so every
//! log line goes to stderr. The default level is `warn` to keep diagnostics
//! out of the way of live command output; raise it with `REDTERM_LOG=debug`.

use std::io::IsTerminal;
use std::sync::Once;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Build the filter from `REDTERM_LOG`, then `RUST_LOG`, then the configured level.
pub fn build_filter(config_level: &str) -> EnvFilter {
    if let Ok(spec) = std::env::var("REDTERM_LOG") {
        if let Ok(filter) = EnvFilter::try_new(&spec) {
            return filter;
        }
    }
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("redterm={}", config_level)))
}

/// Initialize the global subscriber. Safe to call more than once.
pub fn init_logging(config_level: &str) {
    INIT.call_once(|| {
        let use_ansi = std::io::stderr().is_terminal();
        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_ansi(use_ansi);

        let _ = tracing_subscriber::registry()
            .with(build_filter(config_level))
            .with(fmt_layer)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        init_logging("debug");
        init_logging("warn");
        tracing::debug!("logging initialised");
    }

    #[test]
    fn config_level_is_used_for_crate_target() {
        // Only meaningful when the environment does not override the filter
        if std::env::var("REDTERM_LOG").is_err() && std::env::var("RUST_LOG").is_err() {
            let filter = build_filter("info");
            assert!(filter.to_string().contains("redterm=info"));
        }
    }
}
