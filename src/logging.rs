//! # Structured Logging
//!
//! Tracing subscriber bootstrap for binaries and tests. Library code only
//! emits `tracing` events; initialization is the host's choice.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// The filter comes from `RUST_LOG`, defaulting to `info`. Set
/// `BATCHMQ_LOG_JSON=1` for JSON output (one event per line) instead of
/// the human-readable format. Safe to call repeatedly; a subscriber
/// installed elsewhere wins.
pub fn init_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let json = std::env::var("BATCHMQ_LOG_JSON").is_ok_and(|v| v == "1");

        let result = if json {
            tracing_subscriber::registry()
                .with(fmt::layer().json().with_target(true))
                .with(filter)
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true))
                .with(filter)
                .try_init()
        };

        if result.is_err() {
            tracing::debug!("global tracing subscriber already initialized");
        }
    });
}
