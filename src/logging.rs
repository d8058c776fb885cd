//! # Structured Logging
//!
//! Environment-aware tracing setup. Initialization is idempotent so tests
//! and embedders can call it freely.

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Initialize structured logging with an environment-derived filter.
///
/// `BERTH_LOG` takes precedence, then `RUST_LOG`; the default level is
/// `info` in production-like environments and `debug` otherwise.
pub fn init_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = std::env::var("BERTH_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| default_log_level().to_string());

        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_filter(EnvFilter::new(filter)),
        );

        // A global subscriber may already be set by an embedder; that is fine.
        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already initialized");
        }
    });
}

fn default_log_level() -> &'static str {
    match std::env::var("BERTH_ENV").as_deref() {
        Ok("production") => "info",
        _ => "debug",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_logging();
        init_logging();
    }
}
