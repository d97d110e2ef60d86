//! Test fixtures and helpers for the tessera runtime.
//!
//! Hosts the base64 cookie fixture, barrier-synchronized thread helpers,
//! and the cross-crate scenario tests under `tests/`.

pub mod base64;
pub mod thread;

use std::sync::Once;

/// Install a `tracing` subscriber for test output. Safe to call from
/// every test; only the first call wins.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::level_filters::LevelFilter::WARN)
            .with_test_writer()
            .try_init();
    });
}
