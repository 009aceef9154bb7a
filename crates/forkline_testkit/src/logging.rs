//! Tracing setup for tests.

use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

/// Installs a test subscriber once per process.
///
/// The filter is read from `RUST_LOG` and defaults to `warn`. Output goes
/// through the test harness so that it is only shown for failing tests.
pub fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}
