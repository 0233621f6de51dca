//! Test-only logging setup, modeled on
//! `librqbit/src/tests/test_util.rs::setup_test_logging`: a single
//! `tracing_subscriber::fmt` layer with `RUST_LOG`-driven filtering,
//! installed once regardless of how many tests in the same binary call it.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a process-wide `tracing` subscriber for test binaries. Safe to
/// call from every test; only the first call takes effect.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("capbus=debug"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}
