//! Configuration management.
//!
//! Configuration is read from a TOML file with environment overrides
//! (`PERFWATCH_<SECTION>__<FIELD>`), falls back to defaults for every
//! missing field, and is validated before any component is built.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::ConfigError;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "PERFWATCH_";

// ----------------------------------------------------------------------------
// Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration for the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Adaptive baseline settings
    #[serde(default)]
    pub baseline: BaselineConfig,

    /// Metric batching settings
    #[serde(default)]
    pub batcher: BatcherConfig,

    /// Per-request analysis settings
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Host sampling settings
    #[serde(default)]
    pub host: HostConfig,

    /// Event fan-out settings
    #[serde(default)]
    pub events: EventsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MonitorConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        Self::from_figment(Figment::new().merge(Toml::file(path)))
    }

    /// Load defaults with environment overrides only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_figment(Figment::new())
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.baseline.validate()?;
        self.batcher.validate()?;
        self.analysis.validate()?;
        self.host.validate()?;
        self.events.validate()?;
        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::default()).map_err(|e| ConfigError::RenderError {
            message: e.to_string(),
        })
    }
}

// ----------------------------------------------------------------------------
// Baseline Configuration
// ----------------------------------------------------------------------------

/// Which baseline a sample is compared against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    /// Compare against the baseline that already contains the sample
    #[default]
    IncludeSample,
    /// Compare against the baseline as it was before the sample arrived
    PriorBaseline,
}

/// Adaptive baseline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineConfig {
    /// Samples kept per key
    #[serde(default = "default_window_size", alias = "windowSize")]
    pub window_size: usize,

    /// Z-score threshold for anomalies
    #[serde(default = "default_zscore", alias = "anomalyZScoreThreshold")]
    pub anomaly_zscore_threshold: f64,

    /// Minimum samples before detection
    #[serde(default = "default_warmup", alias = "warmupMinSamples")]
    pub warmup_min_samples: usize,

    /// Baseline used when checking a sample
    #[serde(default)]
    pub evaluation: EvaluationMode,

    /// Host CPU percentage that marks host saturation
    #[serde(default = "default_host_saturation")]
    pub host_saturation_percent: f64,

    /// Key correlated against host pressure
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            anomaly_zscore_threshold: default_zscore(),
            warmup_min_samples: default_warmup(),
            evaluation: EvaluationMode::default(),
            host_saturation_percent: default_host_saturation(),
            primary_key: default_primary_key(),
        }
    }
}

impl BaselineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 || self.window_size > MAX_WINDOW_SIZE {
            return Err(ConfigError::invalid_value(
                "baseline.window_size",
                format!("must be between 1 and {}", MAX_WINDOW_SIZE),
            ));
        }

        if !self.anomaly_zscore_threshold.is_finite() || self.anomaly_zscore_threshold <= 0.0 {
            return Err(ConfigError::invalid_value(
                "baseline.anomaly_zscore_threshold",
                "must be a positive finite number",
            ));
        }

        if self.warmup_min_samples == 0 || self.warmup_min_samples > self.window_size {
            return Err(ConfigError::invalid_value(
                "baseline.warmup_min_samples",
                format!("must be between 1 and window_size ({})", self.window_size),
            ));
        }

        if !(0.0..=100.0).contains(&self.host_saturation_percent) {
            return Err(ConfigError::invalid_value(
                "baseline.host_saturation_percent",
                "must be a percentage between 0 and 100",
            ));
        }

        if self.primary_key.trim().is_empty() {
            return Err(ConfigError::invalid_value("baseline.primary_key", "cannot be empty"));
        }

        Ok(())
    }
}

fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}

fn default_zscore() -> f64 {
    DEFAULT_ZSCORE_THRESHOLD
}

fn default_warmup() -> usize {
    DEFAULT_WARMUP_MIN_SAMPLES
}

fn default_host_saturation() -> f64 {
    DEFAULT_HOST_SATURATION_PERCENT
}

fn default_primary_key() -> String {
    API_LATENCY_KEY.into()
}

// ----------------------------------------------------------------------------
// Batcher Configuration
// ----------------------------------------------------------------------------

/// Metric batching configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Queue length that triggers an immediate flush
    #[serde(default = "default_max_batch_size", alias = "maxBatchSize")]
    pub max_batch_size: usize,

    /// Timer delay for partial batches
    #[serde(default = "default_flush_interval", alias = "batchFlushIntervalMs")]
    pub batch_flush_interval_ms: u64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            batch_flush_interval_ms: default_flush_interval(),
        }
    }
}

impl BatcherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::invalid_value(
                "batcher.max_batch_size",
                format!("must be between 1 and {}", MAX_BATCH_SIZE),
            ));
        }

        if self.batch_flush_interval_ms == 0 {
            return Err(ConfigError::invalid_value(
                "batcher.batch_flush_interval_ms",
                "must be at least 1ms",
            ));
        }

        Ok(())
    }

    #[inline]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.batch_flush_interval_ms)
    }
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

fn default_flush_interval() -> u64 {
    DEFAULT_BATCH_FLUSH_INTERVAL_MS
}

// ----------------------------------------------------------------------------
// Analysis Configuration
// ----------------------------------------------------------------------------

/// Per-request analysis configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Service name stamped on request metrics and bottlenecks
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Database label for query analyses
    #[serde(default = "default_query_database")]
    pub query_database: String,

    /// Requests slower than this are reported even without pattern hits
    #[serde(default = "default_slow_request_ms")]
    pub slow_request_ms: f64,

    /// Scan request lines for query anti-patterns
    #[serde(default = "default_true")]
    pub query_scanning: bool,

    /// Only requests whose path starts with this prefix are tracked
    #[serde(default = "default_tracked_prefix")]
    pub tracked_prefix: String,

    /// Build a segmented profile for slow requests
    #[serde(default = "default_true")]
    pub profiling: bool,

    /// Requests slower than this are profiled
    #[serde(default = "default_profile_threshold_ms")]
    pub profile_threshold_ms: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            query_database: default_query_database(),
            slow_request_ms: default_slow_request_ms(),
            query_scanning: true,
            tracked_prefix: default_tracked_prefix(),
            profiling: true,
            profile_threshold_ms: default_profile_threshold_ms(),
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::invalid_value("analysis.service_name", "cannot be empty"));
        }

        if !self.slow_request_ms.is_finite() || self.slow_request_ms < 0.0 {
            return Err(ConfigError::invalid_value(
                "analysis.slow_request_ms",
                "must be a non-negative finite number",
            ));
        }

        if !self.profile_threshold_ms.is_finite() || self.profile_threshold_ms < 0.0 {
            return Err(ConfigError::invalid_value(
                "analysis.profile_threshold_ms",
                "must be a non-negative finite number",
            ));
        }

        Ok(())
    }
}

fn default_service_name() -> String {
    DEFAULT_SERVICE_NAME.into()
}

fn default_query_database() -> String {
    DEFAULT_QUERY_DATABASE.into()
}

fn default_slow_request_ms() -> f64 {
    DEFAULT_SLOW_REQUEST_MS
}

fn default_tracked_prefix() -> String {
    TRACKED_PATH_PREFIX.into()
}

fn default_profile_threshold_ms() -> f64 {
    DEFAULT_PROFILE_THRESHOLD_MS
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// Host Configuration
// ----------------------------------------------------------------------------

/// Host sampling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Delay between two samples
    #[serde(default = "default_host_sample_interval")]
    pub sample_interval_ms: u64,

    /// CPU percentage that raises a cpu bottleneck (strict)
    #[serde(default = "default_host_cpu_alert")]
    pub cpu_alert_percent: f64,

    /// Memory percentage that raises a memory bottleneck (strict)
    #[serde(default = "default_host_memory_alert")]
    pub memory_alert_percent: f64,

    /// Disk usage percentage that raises an io bottleneck (strict)
    #[serde(default = "default_host_disk_alert")]
    pub disk_alert_percent: f64,

    /// Service name on batched host metrics
    #[serde(default = "default_host_service_name")]
    pub service_name: String,

    /// Endpoint label on batched host metrics
    #[serde(default = "default_host_endpoint")]
    pub endpoint: String,

    /// Service name on host bottlenecks
    #[serde(default = "default_host_bottleneck_service")]
    pub bottleneck_service: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_host_sample_interval(),
            cpu_alert_percent: default_host_cpu_alert(),
            memory_alert_percent: default_host_memory_alert(),
            disk_alert_percent: default_host_disk_alert(),
            service_name: default_host_service_name(),
            endpoint: default_host_endpoint(),
            bottleneck_service: default_host_bottleneck_service(),
        }
    }
}

impl HostConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_interval_ms == 0 {
            return Err(ConfigError::invalid_value("host.sample_interval_ms", "must be at least 1ms"));
        }

        for (field, value) in [
            ("host.cpu_alert_percent", self.cpu_alert_percent),
            ("host.memory_alert_percent", self.memory_alert_percent),
            ("host.disk_alert_percent", self.disk_alert_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::invalid_value(field, "must be a percentage between 0 and 100"));
            }
        }

        if self.service_name.trim().is_empty() || self.endpoint.trim().is_empty() {
            return Err(ConfigError::invalid_value("host.service_name", "service and endpoint cannot be empty"));
        }

        if self.bottleneck_service.trim().is_empty() {
            return Err(ConfigError::invalid_value("host.bottleneck_service", "cannot be empty"));
        }

        Ok(())
    }

    #[inline]
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

fn default_host_sample_interval() -> u64 {
    DEFAULT_HOST_SAMPLE_INTERVAL_MS
}

fn default_host_cpu_alert() -> f64 {
    DEFAULT_HOST_CPU_ALERT_PERCENT
}

fn default_host_memory_alert() -> f64 {
    DEFAULT_HOST_MEMORY_ALERT_PERCENT
}

fn default_host_disk_alert() -> f64 {
    DEFAULT_HOST_DISK_ALERT_PERCENT
}

fn default_host_service_name() -> String {
    DEFAULT_HOST_SERVICE_NAME.into()
}

fn default_host_endpoint() -> String {
    DEFAULT_HOST_ENDPOINT.into()
}

fn default_host_bottleneck_service() -> String {
    DEFAULT_HOST_BOTTLENECK_SERVICE.into()
}

// ----------------------------------------------------------------------------
// Events Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Broadcast buffer size
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

impl EventsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid_value("events.capacity", "must be at least 1"));
        }
        Ok(())
    }
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}
