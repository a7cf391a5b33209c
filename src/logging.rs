//! Subscriber setup for binaries.
//!
//! Library code logs through the `log` facade; the fmt subscriber picks those
//! records up through its `tracing-log` bridge.

use crate::error::{AppResult, HarnessError};
use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber.
///
/// `RUST_LOG` wins over `level` when it is set.
pub fn init(level: &str) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .map_err(|e| HarnessError::Configuration(format!("logging already initialised: {}", e)))
}
