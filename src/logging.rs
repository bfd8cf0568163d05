//! Logging & tracing initialization.

use std::fmt::{self, Display, Formatter};

use tracing::{info, Level};
use tracing_subscriber::{fmt as tfmt, layer::SubscriberExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{PerfwatchError, PerfwatchResult};

/// Log target for batcher events
pub const TARGET_BATCHER: &str = "perfwatch::batcher";
/// Log target for baseline events
pub const TARGET_BASELINE: &str = "perfwatch::baseline";
/// Log target for the request monitor
pub const TARGET_MONITOR: &str = "perfwatch::monitor";
/// Log target for startup
pub const TARGET_INIT: &str = "perfwatch::init";

// ----------------------------------------------------------------------------
// Log Level Management
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    /// Parse from string, falling back to info
    pub fn parse_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

// ----------------------------------------------------------------------------
// Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the global subscriber based on configuration.
/// `RUST_LOG` directives take precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> PerfwatchResult<()> {
    let level = LogLevel::parse_lossy(&config.level).to_tracing_level();
    let level_filter = tracing::level_filters::LevelFilter::from_level(level);

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let result = match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tfmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tfmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tfmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };

    result.map_err(|e| PerfwatchError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: TARGET_INIT,
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}
