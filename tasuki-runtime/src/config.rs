//! Monitor Configuration
//!
//! This module provides configuration for the monitor subsystem.
//! Configuration can be set programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `TASUKI_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `TASUKI_LOCK_RESERVATION` | Enable reservation (biased) locking ("true"/"false") | true |
//! | `TASUKI_ATOMIC_CAS` | Platform provides the atomic primitives reservation needs | true |
//! | `TASUKI_INLINE_MONITORS` | Emit inline fast paths at all ("false" calls out everywhere) | true |
//! | `TASUKI_MONITOR_CACHE_SIZE` | Entries in each thread's monitor cache (power of two) | 32 |
//! | `TASUKI_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `TASUKI_LOG_FORMAT` | Log output format (plain/json) | plain |
//!
//! # Example
//!
//! ```rust,ignore
//! use tasuki_runtime::config::MonitorConfig;
//!
//! // Load from environment with defaults
//! let config = MonitorConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = MonitorConfig::builder()
//!     .lock_reservation(false)
//!     .cache_size(64)
//!     .build()?;
//! ```

use std::env;

pub use crate::error::ConfigError;

/// Largest accepted monitor cache size.
pub const MAX_CACHE_SIZE: usize = 1024;

/// Default monitor cache size.
pub const DEFAULT_CACHE_SIZE: usize = 32;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Output format for log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Plain text format (human readable).
    #[default]
    Plain,
    /// JSON format (machine readable).
    Json,
}

impl LogFormat {
    /// Parse a format from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "plain" | "text" => Some(LogFormat::Plain),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Lock reservation configuration.
#[derive(Debug, Clone)]
pub struct ReservationConfig {
    /// Use the reservation protocol where a site is eligible.
    /// Default: true.
    pub enabled: bool,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Platform capabilities.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// The target offers an atomic compare-and-swap on a machine word.
    /// Without it reservation is never selected.
    /// Default: true.
    pub compare_and_swap: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self { compare_and_swap: true }
    }
}

/// Monitor cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entries per thread. Must be a power of two.
    /// Default: 32.
    pub size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_CACHE_SIZE,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Output format.
    /// Default: Plain.
    pub format: LogFormat,
}

/// Complete monitor configuration.
///
/// Use `MonitorConfig::default()` for sensible defaults, or
/// `MonitorConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Reservation configuration.
    pub reservation: ReservationConfig,

    /// Platform capabilities.
    pub platform: PlatformConfig,

    /// Emit inline fast paths. When false every site calls the helper.
    pub inline_monitors: bool,

    /// Monitor cache configuration.
    pub cache: CacheConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            reservation: ReservationConfig::default(),
            platform: PlatformConfig::default(),
            inline_monitors: true,
            cache: CacheConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Create a new builder for MonitorConfig.
    pub fn builder() -> MonitorConfigBuilder {
        MonitorConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set, or that fail to parse, keep their
    /// default values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_bool("TASUKI_LOCK_RESERVATION") {
            config.reservation.enabled = val;
        }

        if let Some(val) = parse_env_bool("TASUKI_ATOMIC_CAS") {
            config.platform.compare_and_swap = val;
        }

        if let Some(val) = parse_env_bool("TASUKI_INLINE_MONITORS") {
            config.inline_monitors = val;
        }

        if let Some(val) = parse_env_usize("TASUKI_MONITOR_CACHE_SIZE") {
            if is_valid_cache_size(val) {
                config.cache.size = val;
            }
        }

        if let Ok(val) = env::var("TASUKI_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log.level = level;
            }
        }

        if let Ok(val) = env::var("TASUKI_LOG_FORMAT") {
            if let Some(format) = LogFormat::parse(&val) {
                config.log.format = format;
            }
        }

        config
    }

    /// Load configuration from environment variables, rejecting any
    /// variable that is set but cannot be parsed.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(val) = require_env("TASUKI_LOCK_RESERVATION", parse_bool)? {
            config.reservation.enabled = val;
        }
        if let Some(val) = require_env("TASUKI_ATOMIC_CAS", parse_bool)? {
            config.platform.compare_and_swap = val;
        }
        if let Some(val) = require_env("TASUKI_INLINE_MONITORS", parse_bool)? {
            config.inline_monitors = val;
        }
        if let Some(val) = require_env("TASUKI_MONITOR_CACHE_SIZE", |s| s.parse().ok())? {
            config.cache.size = val;
        }
        if let Some(val) = require_env("TASUKI_LOG_LEVEL", LogLevel::parse)? {
            config.log.level = val;
        }
        if let Some(val) = require_env("TASUKI_LOG_FORMAT", LogFormat::parse)? {
            config.log.format = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Whether the reservation protocol may be selected at all.
    pub fn reservation_available(&self) -> bool {
        self.reservation.enabled && self.platform.compare_and_swap
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_cache_size(self.cache.size) {
            return Err(ConfigError::InvalidValue {
                field: "cache.size".into(),
                message: format!("must be a power of two between 1 and {}", MAX_CACHE_SIZE),
            });
        }

        Ok(())
    }
}

/// Builder for MonitorConfig.
#[derive(Debug, Clone, Default)]
pub struct MonitorConfigBuilder {
    config: MonitorConfig,
}

impl MonitorConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable lock reservation.
    pub fn lock_reservation(mut self, enabled: bool) -> Self {
        self.config.reservation.enabled = enabled;
        self
    }

    /// Declare whether the platform has an atomic compare-and-swap.
    pub fn compare_and_swap(mut self, available: bool) -> Self {
        self.config.platform.compare_and_swap = available;
        self
    }

    /// Enable or disable inline monitor fast paths.
    pub fn inline_monitors(mut self, enabled: bool) -> Self {
        self.config.inline_monitors = enabled;
        self
    }

    /// Set the per-thread monitor cache size.
    pub fn cache_size(mut self, size: usize) -> Self {
        self.config.cache.size = size;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Set the log format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log.format = format;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<MonitorConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn is_valid_cache_size(size: usize) -> bool {
    size.is_power_of_two() && size <= MAX_CACHE_SIZE
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| parse_bool(&s))
}

/// Read a variable that must parse when present.
fn require_env<T>(name: &str, parse: impl Fn(&str) -> Option<T>) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => parse(raw.trim()).map(Some).ok_or_else(|| ConfigError::EnvParseError {
            var: name.into(),
            message: format!("unrecognized value '{}'", raw),
        }),
        Err(_) => Ok(None),
    }
}
