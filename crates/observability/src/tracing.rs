//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
pub fn default_directive(debug: bool) -> &'static str {
    if debug { "debug" } else { "info" }
}

/// Initialize JSON logging for the process, filtered by `RUST_LOG`.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .with_current_span(true)
        .try_init();
}
