//! Logging setup for the binaries.
//!
//! The library only emits `tracing` events; installing a subscriber is left to
//! whoever owns the process.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

/// Installs a console subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_level` (e.g. `"info"` or
/// `"wisn=debug"`) is used.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(default_level: &str) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_thread_names(true))
        .try_init()
}
