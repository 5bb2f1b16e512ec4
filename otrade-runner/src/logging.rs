//! Structured logging setup.
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies. Output
//! is human-readable by default, or one JSON object per event.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter {directive:?}: {reason}")]
    Filter { directive: String, reason: String },

    #[error("failed to install subscriber: {0}")]
    Install(String),
}

/// Filter from `RUST_LOG`, falling back to `config.level`.
pub fn filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    // Quiet the HTTP stack unless asked for explicitly
    EnvFilter::try_new(format!("hyper=warn,reqwest=warn,{}", config.level))
        .map_err(|e| LoggingError::Filter {
            directive: config.level.clone(),
            reason: e.to_string(),
        })
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = filter(config)?;
    let result = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_target(true)
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_target(true)
            .with_env_filter(filter)
            .try_init()
    };
    result.map_err(|e| LoggingError::Install(e.to_string()))?;
    tracing::debug!(level = %config.level, json = config.json, "logging initialized");
    Ok(())
}
