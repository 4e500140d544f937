//! Tracing setup for hosts and tests.

use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber on stderr, filtered by `RUST_LOG` (default `info`).
/// Calling it again, or after another subscriber was set, does nothing.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
