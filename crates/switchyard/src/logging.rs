//! Tracing subscriber setup.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs a global `tracing` subscriber that writes formatted events to
/// stdout.
///
/// `RUST_LOG` controls filtering when set (e.g. `switchyard=debug`);
/// otherwise `default_level` applies to everything.
///
/// # Errors
/// Fails if a global subscriber is already installed.
pub fn init(default_level: &str) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
}
