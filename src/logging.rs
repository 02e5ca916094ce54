//! Structured logging setup.
//!
//! Every component logs through `tracing`; this module installs the
//! subscriber for applications embedding the decoder.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Registry};

/// Configuration for log output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter, overridden by `RUST_LOG`.
    pub log_level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
    pub with_target: bool,
    pub with_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
            with_target: true,
            with_thread_ids: false,
        }
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed, which is not
/// treated as an error so that tests and embedding applications can call
/// this repeatedly.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = Registry::default().with(env_filter);
    let installed = if config.json {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_target(config.with_target)
                    .with_thread_ids(config.with_thread_ids),
            )
            .try_init()
            .is_ok()
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(config.with_target)
                    .with_thread_ids(config.with_thread_ids)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        info!(level = %config.log_level, json = config.json, "logging initialized");
    } else {
        debug!("logging subscriber already installed");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig {
            log_level: "debug".to_string(),
            ..LoggingConfig::default()
        };
        init_logging(&config);
        assert!(!init_logging(&config));
    }
}
