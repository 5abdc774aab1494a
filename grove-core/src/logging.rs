//! Logging setup.
//!
//! The core emits `tracing` events; binaries and tests that want to see them
//! call [`init`] once. `RUST_LOG` takes precedence over the configured filter.

use tracing_subscriber::EnvFilter;

/// Installs a formatted `tracing` subscriber.
///
/// Safe to call more than once; only the first call installs a subscriber.
/// Returns `true` if this call installed it.
pub fn init(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(filter = default_filter, "logging initialized");
    }
    installed
}
