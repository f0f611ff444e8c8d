//! Logging infrastructure for glyco.
//!
//! The library only emits `tracing` events; binaries decide where they go.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging at WARN so command output stays clean.
///
/// `RUST_LOG` overrides the default, e.g. `RUST_LOG=glyco_core=debug`
/// to trace every profile lookup and kinetics source decision.
pub fn init() {
    init_with_level("warn")
}

/// Initialize logging with a specific default level
///
/// Log lines go to stderr so JSON written to stdout can be piped.
pub fn init_with_level(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();
}

/// Map a `-v` repetition count onto a level name.
pub fn level_for_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Initialize logging for testing (captures logs for test output)
#[cfg(test)]
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::new("debug"))
        .try_init();
}
