//! Logging bootstrap for applications embedding the query engine.
//!
//! Library crates only emit through the `log` and `tracing` facades; installing
//! a subscriber is left to whoever owns the process.

use anyhow::{Context, Result, anyhow};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. `log` records are
/// forwarded to the same subscriber. Fails if a global subscriber is already set.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("invalid log level {:?}", config.level))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow!(e))
        .context("install tracing subscriber")?;

    log::debug!("Logging initialized with level {}", config.level);
    Ok(())
}
