//! Logging Infrastructure
//!
//! The runtime logs through `tracing`. This module installs a
//! `tracing_subscriber` formatter configured from [`LogConfig`].
//!
//! `RUST_LOG` takes precedence over the configured level when set.
//!
//! # Example
//!
//! ```rust,ignore
//! use tasuki_runtime::{config::MonitorConfig, log};
//!
//! let config = MonitorConfig::from_env();
//! log::init(&config.log);
//! ```

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogFormat, LogLevel};

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// Build the filter for a configured level.
pub fn filter_for(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the global subscriber.
///
/// Only the first call has an effect. Returns whether this process ended up
/// with our subscriber installed (false if another one was already set).
pub fn init(config: &LogConfig) -> bool {
    *INSTALLED.get_or_init(|| {
        let filter = filter_for(config.level);
        let result = match config.format {
            LogFormat::Plain => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .try_init(),
            LogFormat::Json => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .try_init(),
        };
        result.is_ok()
    })
}

/// Whether [`init`] has run.
pub fn is_initialized() -> bool {
    INSTALLED.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig {
            level: LogLevel::Warn,
            format: LogFormat::Plain,
        };
        let first = init(&config);
        let second = init(&LogConfig {
            level: LogLevel::Trace,
            format: LogFormat::Json,
        });
        assert_eq!(first, second);
        assert!(is_initialized());
    }

    #[test]
    fn test_filter_for_every_level() {
        for level in [
            LogLevel::Off,
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ] {
            let _ = filter_for(level);
        }
    }
}
