//! Structured logging setup.
//!
//! The library itself only emits `tracing` events; applications call
//! [`init_logging`] once at startup to install a subscriber. `RUST_LOG`
//! overrides the configured level when set.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Build the filter for a logging configuration, honouring `RUST_LOG`
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_ascii_lowercase()))
}

/// Install the global subscriber described by `config`
///
/// Fails with [`ProtocolError::ConfigError`] if a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(true);

    let result = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))?;
    info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}
