//! Logging setup for binaries.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_FILTER: &str = "warn";

/// Install a fmt subscriber filtered by `RUST_LOG` (default `warn`).
///
/// Safe to call more than once; only the first call installs anything.
/// Libraries embedding procpipe should configure tracing themselves.
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
