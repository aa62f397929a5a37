//! Logging infrastructure for Medtrack.
//!
//! Centralized tracing setup shared by the CLI and any other binary.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging with sensible defaults.
///
/// Default level is INFO, overridable with the RUST_LOG env var; output is
/// the compact fmt layer.
pub fn init() {
    init_with_level("info")
}

/// Initialize logging with a specific default level (debug, info, warn,
/// error). RUST_LOG still takes precedence.
pub fn init_with_level(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

/// Initialize logging for testing (captures logs for test output)
#[cfg(test)]
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::new("debug"))
        .try_init();
}
