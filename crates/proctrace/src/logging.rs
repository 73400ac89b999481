//! Tracing subscriber setup.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Level used when `RUST_LOG` is not set.
pub fn default_level(debug: bool) -> &'static str {
    if debug { "debug" } else { "info" }
}

/// Installs the global subscriber.
///
/// `RUST_LOG` takes precedence; otherwise everything at `debug` (when `debug`
/// is set) or `info` is logged.
pub fn init_logging(debug: bool) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(debug)));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .try_init()
}
