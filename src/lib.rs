//! # Perfwatch Engine
//!
//! Analysis core of an API performance monitor. Every finished request is
//! reported to a [`PerformanceMonitor`], which batches the metric sample,
//! checks its latency against an adaptive per-key baseline and turns
//! outliers into explained bottleneck records. Host readings and metric
//! regressions go through the same monitor.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        PERFORMANCE MONITOR                           │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  REQUEST → BATCHER → SINK                                            │
//! │         → BASELINE TRACKER → CORRELATION → EXPLAINER → PUBLISHER     │
//! │         → QUERY SCANNER → PUBLISHER                                  │
//! │         → PROFILER → SINK, PUBLISHER                                 │
//! │  HOST SAMPLER → BATCHER, HOST CPU, HOST THRESHOLDS → EXPLAINER       │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! - **Baseline**: rolling window, moving average and population standard
//!   deviation per key, z-score anomaly check, host/code correlation
//! - **Batcher**: size-or-timer coalescing of metric writes
//! - **Query scanner**: regex rules for common query anti-patterns
//! - **Host**: sysinfo-backed sampling loop with cpu/memory/disk alerts
//! - **Events**: `metric:update`, `bottleneck:detected`, `query:analyzed`,
//!   `system:metrics`, `profile:created`, `regression:detected`

pub mod baseline;
pub mod batcher;
pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod explain;
pub mod host;
pub mod logging;
pub mod monitor;
pub mod query;
pub mod sink;
pub mod types;

pub use baseline::{BaselineEntry, BaselineStage, BaselineStats, BaselineTracker, Correlation, CorrelationKind, Observation};
pub use batcher::{BatchObserver, FlushOutcome, FlushTrigger, MetricBatcher, TracingObserver};
pub use config::{BaselineConfig, BatcherConfig, EvaluationMode, HostConfig, MonitorConfig};
pub use error::{ConfigError, PerfwatchError, PerfwatchResult, SinkError};
pub use events::{BroadcastPublisher, EventPublisher, MonitorEvent};
pub use explain::{Explainer, Explanation, RuleBasedExplainer};
pub use host::{run_host_sampler, HostSample, HostSource, SystemHostSource};
pub use monitor::{HostReport, PerformanceMonitor, RequestReport};
pub use query::{QueryAnalysis, QueryPattern, QueryPatternScanner};
pub use sink::{BulkInsertReport, MemorySink, MetricSink};
pub use types::{
    Bottleneck, BottleneckKind, BufferedMetric, MetricPoint, Profile, Regression, RequestObservation, Severity,
};
