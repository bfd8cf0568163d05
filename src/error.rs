//! Error types for every subsystem in the engine.

use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum PerfwatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Explainer error: {0}")]
    Explain(#[from] ExplainError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No tokio runtime available to drive {component}")]
    NoRuntime { component: &'static str },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PerfwatchError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            PerfwatchError::Config(_) => false,
            PerfwatchError::Sink(e) => e.is_recoverable(),
            PerfwatchError::Explain(_) => true,
            PerfwatchError::Publish(_) => true,
            PerfwatchError::Io(_) => true,
            PerfwatchError::NoRuntime { .. } => false,
            PerfwatchError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            PerfwatchError::Config(_) => "config",
            PerfwatchError::Sink(_) => "sink",
            PerfwatchError::Explain(_) => "explain",
            PerfwatchError::Publish(_) => "publish",
            PerfwatchError::Io(_) => "io",
            PerfwatchError::NoRuntime { .. } => "runtime",
            PerfwatchError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Failed to render configuration: {message}")]
    RenderError { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Sink Errors
// ----------------------------------------------------------------------------

/// Errors returned by a metric sink for a whole operation.
/// Per-record rejections inside a bulk insert are reported in the
/// insert report instead.
#[derive(Error, Debug, Clone)]
pub enum SinkError {
    #[error("Sink '{sink}' unavailable: {message}")]
    Unavailable { sink: String, message: String },

    #[error("Write to '{sink}' timed out after {timeout_ms}ms")]
    Timeout { sink: String, timeout_ms: u64 },

    #[error("Write to '{sink}' rejected: {message}")]
    Rejected { sink: String, message: String },
}

impl SinkError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            SinkError::Unavailable { .. } => true,
            SinkError::Timeout { .. } => true,
            SinkError::Rejected { .. } => false,
        }
    }
}

// ----------------------------------------------------------------------------
// Explainer Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone)]
pub enum ExplainError {
    #[error("Explainer '{explainer}' failed: {message}")]
    Failed { explainer: String, message: String },
}

// ----------------------------------------------------------------------------
// Publish Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("No subscribers for '{event}'")]
    NoSubscribers { event: &'static str },
}

// ----------------------------------------------------------------------------
// Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for engine operations
pub type PerfwatchResult<T> = Result<T, PerfwatchError>;

/// Result type for sink operations
pub type SinkResult<T> = Result<T, SinkError>;
