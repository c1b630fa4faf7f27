//! Tracing bootstrap for the binary.
//!
//! Diagnostics go to stderr and are controlled by `RUST_LOG`; the web UI's
//! SSE stream is the product output and is unaffected by the filter.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber. Reads `RUST_LOG`, defaults to
/// `pagepilot=info` when unset.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pagepilot=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
