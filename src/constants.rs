//! Engine-wide defaults and limits.

// ============================================================================
// VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "perfwatch-engine";
pub const ENGINE_FULL_NAME: &str = "Perfwatch Analysis Engine";

// ----------------------------------------------------------------------------
// Adaptive Baseline
// ----------------------------------------------------------------------------

/// Samples kept in each key's rolling window
pub const DEFAULT_WINDOW_SIZE: usize = 20;

/// Z-score above which a sample is anomalous (strict comparison)
pub const DEFAULT_ZSCORE_THRESHOLD: f64 = 2.0;

/// Samples required before anomaly checks are enabled for a key
pub const DEFAULT_WARMUP_MIN_SAMPLES: usize = 3;

/// Host CPU percentage above which a latency anomaly is blamed on the host
pub const DEFAULT_HOST_SATURATION_PERCENT: f64 = 80.0;

/// Baseline key used for request latency
pub const API_LATENCY_KEY: &str = "api_latency";

/// Largest window the tracker accepts
pub const MAX_WINDOW_SIZE: usize = 100_000;

// ----------------------------------------------------------------------------
// Metric Batching
// ----------------------------------------------------------------------------

/// Queue length that forces an immediate flush
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Delay between the first queued sample and its timer flush (milliseconds)
pub const DEFAULT_BATCH_FLUSH_INTERVAL_MS: u64 = 5_000;

/// Largest batch the batcher accepts
pub const MAX_BATCH_SIZE: usize = 100_000;

// ----------------------------------------------------------------------------
// Request Analysis
// ----------------------------------------------------------------------------

/// Service name stamped on request metrics
pub const DEFAULT_SERVICE_NAME: &str = "api-gateway";

/// Database label attached to request query analyses
pub const DEFAULT_QUERY_DATABASE: &str = "app-main-db";

/// Requests slower than this are always reported to the query analyzer (ms)
pub const DEFAULT_SLOW_REQUEST_MS: f64 = 200.0;

/// Requests faster than this with no pattern hits count as optimized (ms)
pub const OPTIMIZED_REQUEST_MS: f64 = 100.0;

/// Estimated gain attached to every query suggestion (percent)
pub const QUERY_SUGGESTION_IMPROVEMENT: f64 = 40.0;

/// Path prefix of requests the monitor tracks
pub const TRACKED_PATH_PREFIX: &str = "/api";

/// Status code from which a request counts as an error
pub const ERROR_STATUS_FLOOR: u16 = 400;

/// Requests slower than this get a segmented profile (ms)
pub const DEFAULT_PROFILE_THRESHOLD_MS: f64 = 50.0;

// ----------------------------------------------------------------------------
// Host Sampling
// ----------------------------------------------------------------------------

/// Delay between two host samples (milliseconds)
pub const DEFAULT_HOST_SAMPLE_INTERVAL_MS: u64 = 10_000;

/// Host CPU percentage above which a cpu bottleneck is raised
pub const DEFAULT_HOST_CPU_ALERT_PERCENT: f64 = 80.0;

/// Host memory percentage above which a memory bottleneck is raised
pub const DEFAULT_HOST_MEMORY_ALERT_PERCENT: f64 = 90.0;

/// Primary disk usage percentage above which an io bottleneck is raised
pub const DEFAULT_HOST_DISK_ALERT_PERCENT: f64 = 90.0;

/// Service name of batched host metrics
pub const DEFAULT_HOST_SERVICE_NAME: &str = "local-laptop";

/// Endpoint label of batched host metrics
pub const DEFAULT_HOST_ENDPOINT: &str = "system-monitor";

/// Service name of host bottlenecks
pub const DEFAULT_HOST_BOTTLENECK_SERVICE: &str = "host-system";

/// Location reported for host bottlenecks
pub const HOST_LOCATION: &str = "Host Machine";

/// Processes listed in a host sample
pub const HOST_TOP_PROCESSES: usize = 10;

// ----------------------------------------------------------------------------
// Event Fan-out
// ----------------------------------------------------------------------------

/// Broadcast buffer per subscriber before lagging receivers lose events
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;
