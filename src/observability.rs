//! Logging initialization.
//!
//! The library emits structured `tracing` events and lightweight
//! `metrics` counters; hosts that want an exporter install their own
//! recorder. [`init_tracing`] wires a subscriber for processes that do
//! not bring one.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Output format for the default subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, for interactive use.
    #[default]
    Pretty,
    /// Newline-delimited JSON, for log shippers.
    Json,
}

/// Installs a global `tracing` subscriber once per process.
///
/// The filter comes from `MEMOIR_LOG_LEVEL` (or `RUST_LOG`), defaulting
/// to `info`; `MEMOIR_LOG_FORMAT=json` switches to JSON output. Repeated
/// calls are no-ops, so library consumers that already installed a
/// subscriber are left alone.
pub fn init_tracing() {
    INIT.get_or_init(|| {
        let level = std::env::var("MEMOIR_LOG_LEVEL")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| "info".to_string());
        let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));

        let format = std::env::var("MEMOIR_LOG_FORMAT")
            .map(|f| {
                if f.eq_ignore_ascii_case("json") {
                    LogFormat::Json
                } else {
                    LogFormat::Pretty
                }
            })
            .unwrap_or_default();

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true);

        let result = match format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Pretty => builder.try_init(),
        };
        if result.is_err() {
            // A subscriber was already installed by the host process.
            tracing::debug!("tracing subscriber already installed, keeping it");
        }
    });
}
