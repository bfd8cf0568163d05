//! Core record types flowing through the engine.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use smallvec::SmallVec;
use uuid::Uuid;

use crate::constants::ERROR_STATUS_FLOOR;

/// Tags carried by a metric, usually two or three
pub type Tags = SmallVec<[CompactString; 4]>;

// ----------------------------------------------------------------------------
// Buffered Metric
// ----------------------------------------------------------------------------

/// Measured values of a single metric sample
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricFields {
    pub response_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<f64>,
}

/// A metric record waiting to be persisted.
/// Treated as immutable once handed to the batcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferedMetric {
    pub recorded_at: DateTime<Utc>,
    pub service: CompactString,
    pub endpoint: CompactString,
    pub metrics: MetricFields,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, JsonValue>,
}

impl BufferedMetric {
    pub fn new<S, E>(service: S, endpoint: E, response_time: f64) -> Self
    where
        S: Into<CompactString>,
        E: Into<CompactString>,
    {
        Self {
            recorded_at: Utc::now(),
            service: service.into(),
            endpoint: endpoint.into(),
            metrics: MetricFields {
                response_time,
                ..MetricFields::default()
            },
            tags: SmallVec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Builder: set timestamp
    #[inline]
    pub fn with_recorded_at(mut self, at: DateTime<Utc>) -> Self {
        self.recorded_at = at;
        self
    }

    /// Builder: set all metric fields
    #[inline]
    pub fn with_metrics(mut self, metrics: MetricFields) -> Self {
        self.metrics = metrics;
        self
    }

    /// Builder: add a tag
    pub fn with_tag<T: Into<CompactString>>(mut self, tag: T) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Builder: add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.as_str() == tag)
    }

    /// Record-level defects a store rejects individually
    pub fn validate(&self) -> Result<(), RecordDefect> {
        if self.service.trim().is_empty() {
            return Err(RecordDefect::MissingField("service"));
        }
        if self.endpoint.trim().is_empty() {
            return Err(RecordDefect::MissingField("endpoint"));
        }
        if !self.metrics.response_time.is_finite() {
            return Err(RecordDefect::NonFinite("metrics.responseTime"));
        }
        Ok(())
    }
}

/// Why a single record cannot be stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordDefect {
    MissingField(&'static str),
    NonFinite(&'static str),
}

impl Display for RecordDefect {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RecordDefect::MissingField(field) => write!(f, "missing required field '{}'", field),
            RecordDefect::NonFinite(field) => write!(f, "field '{}' is not a finite number", field),
        }
    }
}

// ----------------------------------------------------------------------------
// Request Observation
// ----------------------------------------------------------------------------

/// A finished request as seen by the tracking middleware
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestObservation {
    pub method: CompactString,
    pub path: CompactString,
    pub status: u16,
    pub duration_ms: f64,
}

impl RequestObservation {
    pub fn new(method: impl Into<CompactString>, path: impl Into<CompactString>, status: u16, duration_ms: f64) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            status,
            duration_ms,
        }
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.status >= ERROR_STATUS_FLOOR
    }

    /// Request line handed to the query scanner
    pub fn request_line(&self) -> String {
        format!("REST API: {} {}", self.method, self.path)
    }
}

// ----------------------------------------------------------------------------
// Severity
// ----------------------------------------------------------------------------

/// Severity level for bottlenecks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Bottleneck
// ----------------------------------------------------------------------------

/// Resource a bottleneck is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BottleneckKind {
    Cpu,
    Memory,
    Io,
    Network,
    Database,
    Code,
}

impl BottleneckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BottleneckKind::Cpu => "cpu",
            BottleneckKind::Memory => "memory",
            BottleneckKind::Io => "io",
            BottleneckKind::Network => "network",
            BottleneckKind::Database => "database",
            BottleneckKind::Code => "code",
        }
    }
}

impl Display for BottleneckKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BottleneckStatus {
    #[default]
    Open,
    Investigating,
    Resolved,
    Ignored,
}

/// Where in the code a bottleneck was observed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl Location {
    pub fn function(function: impl Into<String>) -> Self {
        Self {
            function: Some(function.into()),
            ..Self::default()
        }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (&self.file, &self.function, self.line) {
            (Some(file), Some(func), Some(line)) => write!(f, "{}:{} ({})", file, line, func),
            (Some(file), Some(func), None) => write!(f, "{} ({})", file, func),
            (Some(file), None, Some(line)) => write!(f, "{}:{}", file, line),
            (Some(file), None, None) => write!(f, "{}", file),
            (None, Some(func), _) => write!(f, "{}", func),
            (None, None, _) => write!(f, "unknown location"),
        }
    }
}

/// An advisory remediation attached to a bottleneck
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub recommendation: String,
    pub confidence: f64,
}

/// Bottleneck data known before an explanation is attached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottleneckDraft {
    pub kind: BottleneckKind,
    pub severity: Severity,
    pub location: Location,
    pub description: String,
}

/// A detected bottleneck, ready to be stored and broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bottleneck {
    pub id: Uuid,
    pub detected_at: DateTime<Utc>,
    pub service: CompactString,
    #[serde(rename = "type")]
    pub kind: BottleneckKind,
    pub severity: Severity,
    pub location: Location,
    pub description: String,
    pub why: String,
    pub ai_suggestions: Vec<Suggestion>,
    pub status: BottleneckStatus,
}

impl Bottleneck {
    pub fn from_draft(service: impl Into<CompactString>, draft: BottleneckDraft, why: String, suggestions: Vec<Suggestion>) -> Self {
        Self {
            id: Uuid::new_v4(),
            detected_at: Utc::now(),
            service: service.into(),
            kind: draft.kind,
            severity: draft.severity,
            location: draft.location,
            description: draft.description,
            why,
            ai_suggestions: suggestions,
            status: BottleneckStatus::Open,
        }
    }
}

// ----------------------------------------------------------------------------
// Profile
// ----------------------------------------------------------------------------

/// Share of a request's duration attributed to each profile segment
const HANDLER_SHARE: f64 = 0.8;
const MIDDLEWARE_SHARE: f64 = 0.1;
const DRIVER_SHARE: f64 = 0.1;

/// Samples counted per millisecond of profiled time
const SAMPLES_PER_MS: f64 = 10.0;

/// Tags stamped on every segmented profile
pub const PROFILE_TAGS: [&str; 2] = ["auto-profile", "trace-segment"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileFunction {
    pub name: String,
    pub file: String,
    pub self_time: f64,
    pub total_time: f64,
    pub calls: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileData {
    pub functions: Vec<ProfileFunction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSummary {
    pub total_functions: usize,
    pub hottest_function: String,
    pub total_samples: f64,
}

/// Coarse time breakdown of one slow request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub service: CompactString,
    pub duration: f64,
    pub profile_data: ProfileData,
    pub summary: ProfileSummary,
    #[serde(default)]
    pub tags: Tags,
}

impl Profile {
    /// Split `request`'s duration into handler, middleware and driver
    /// segments. Self times are rounded to whole milliseconds.
    pub fn segmented(service: impl Into<CompactString>, request: &RequestObservation) -> Self {
        let duration = request.duration_ms;
        let segment = |name: String, file: &str, share: f64| ProfileFunction {
            name,
            file: file.to_string(),
            self_time: (duration * share).round(),
            total_time: duration,
            calls: 1,
        };

        let functions = vec![
            segment(format!("Handler: {}", request.path), "handler", HANDLER_SHARE),
            segment("Middleware: PerfTracker".into(), "middleware", MIDDLEWARE_SHARE),
            segment("DB: DriverInternal".into(), "db-driver", DRIVER_SHARE),
        ];
        let hottest_function = functions
            .iter()
            .max_by(|a, b| a.self_time.total_cmp(&b.self_time))
            .map(|f| f.name.clone())
            .unwrap_or_default();

        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            service: service.into(),
            duration,
            summary: ProfileSummary {
                total_functions: functions.len(),
                hottest_function,
                total_samples: duration * SAMPLES_PER_MS,
            },
            profile_data: ProfileData { functions },
            tags: PROFILE_TAGS.iter().map(|t| CompactString::from(*t)).collect(),
        }
    }

    #[inline]
    pub fn functions(&self) -> &[ProfileFunction] {
        &self.profile_data.functions
    }
}

// ----------------------------------------------------------------------------
// Regression
// ----------------------------------------------------------------------------

/// Label on regression causes produced by an explainer
pub const EXPLAINED_CAUSE_KIND: &str = "AI-Suggestion";

/// A metric value at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl MetricPoint {
    pub fn new(value: f64, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }

    pub fn now(value: f64) -> Self {
        Self::new(value, Utc::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Degradation {
    /// Growth over the baseline in whole percent; 0 for a non-positive baseline
    pub percentage: f64,
    pub absolute: f64,
}

impl Degradation {
    pub fn between(baseline: f64, current: f64) -> Self {
        let absolute = current - baseline;
        let percentage = if baseline > 0.0 {
            (absolute / baseline * 100.0).round()
        } else {
            0.0
        };
        Self { percentage, absolute }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PossibleCause {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressionStatus {
    #[default]
    New,
    Acknowledged,
    Investigating,
    Resolved,
    FalsePositive,
}

/// A metric that got worse between a baseline and a current reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Regression {
    pub id: Uuid,
    pub detected_at: DateTime<Utc>,
    pub service: CompactString,
    pub metric: String,
    pub baseline: MetricPoint,
    pub current: MetricPoint,
    pub degradation: Degradation,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub analysis: String,
    #[serde(default)]
    pub possible_causes: Vec<PossibleCause>,
    #[serde(default)]
    pub status: RegressionStatus,
}

impl Regression {
    pub fn new(
        service: impl Into<CompactString>,
        metric: impl Into<String>,
        baseline: MetricPoint,
        current: MetricPoint,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            detected_at: Utc::now(),
            service: service.into(),
            metric: metric.into(),
            degradation: Degradation::between(baseline.value, current.value),
            baseline,
            current,
            analysis: String::new(),
            possible_causes: Vec::new(),
            status: RegressionStatus::New,
        }
    }

    /// True when the current reading is worse than the baseline
    #[inline]
    pub fn is_degraded(&self) -> bool {
        self.degradation.absolute > 0.0
    }
}
