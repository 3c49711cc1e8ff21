//! Logging setup for molt generations.
//!
//! Every generation writes to the same inherited stderr; the controller logs
//! its generation id on each phase change so interleaved lines can be told
//! apart.
//!
//! # Configuration
//!
//! - `RUST_LOG`: Log filter (default: `info,molt_server=debug,molt_ecdysis=debug`)
//! - `MOLT_LOG_FORMAT`: `json` for JSON lines, anything else for text

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "info,molt_server=debug,molt_ecdysis=debug";

/// Initialize the global tracing subscriber.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let json = std::env::var("MOLT_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_thread_ids(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    tracing::info!(json, "Telemetry initialized");

    Ok(())
}

/// Flush before exit.
pub fn shutdown() {
    tracing::info!("Telemetry shutdown complete");
}
