//! Adaptive baselines and anomaly correlation.
//!
//! Every metric key owns a fixed-capacity rolling window. Each insert
//! recomputes the window's moving average and population standard
//! deviation, and a sample is anomalous when its z-score against that
//! baseline is strictly above the configured threshold.
//!
//! ```text
//!   absent ──first sample──▶ warming up ──warmup_min_samples──▶ active
//! ```
//!
//! In the default [`EvaluationMode::IncludeSample`] mode the baseline a
//! sample is checked against already contains that sample, so a single large
//! outlier pulls its own baseline upward. [`EvaluationMode::PriorBaseline`]
//! checks the sample against the baseline as it stood before the insert.

use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};

use compact_str::CompactString;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::{BaselineConfig, EvaluationMode};
use crate::error::ConfigError;
use crate::logging::TARGET_BASELINE;
use crate::types::BottleneckKind;

// ----------------------------------------------------------------------------
// Baseline Statistics
// ----------------------------------------------------------------------------

/// Mean and spread of a window at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BaselineStats {
    pub samples: usize,
    pub moving_average: f64,
    pub standard_deviation: f64,
}

impl BaselineStats {
    /// Population statistics of `window` (N divisor).
    pub fn from_window(window: &VecDeque<f64>) -> Self {
        if window.is_empty() {
            return Self::default();
        }

        let n = window.len() as f64;
        let mean = window.iter().sum::<f64>() / n;
        let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        Self {
            samples: window.len(),
            moving_average: mean,
            standard_deviation: variance.sqrt(),
        }
    }

    /// Standard deviations `value` lies above the mean; zero when the
    /// window has no spread.
    #[inline]
    pub fn z_score(&self, value: f64) -> f64 {
        if self.standard_deviation == 0.0 {
            0.0
        } else {
            (value - self.moving_average) / self.standard_deviation
        }
    }
}

// ----------------------------------------------------------------------------
// Baseline Entry
// ----------------------------------------------------------------------------

/// Detection stage of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineStage {
    WarmingUp,
    Active,
}

/// Rolling window and derived baseline for one metric key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaselineEntry {
    key: CompactString,
    window: VecDeque<f64>,
    capacity: usize,
    moving_average: f64,
    standard_deviation: f64,
    previous: Option<BaselineStats>,
    observations: u64,
}

impl BaselineEntry {
    fn new(key: &str, capacity: usize) -> Self {
        Self {
            key: key.into(),
            window: VecDeque::with_capacity(capacity),
            capacity,
            moving_average: 0.0,
            standard_deviation: 0.0,
            previous: None,
            observations: 0,
        }
    }

    fn push(&mut self, value: f64) {
        self.previous = (!self.window.is_empty()).then(|| self.stats());

        self.window.push_back(value);
        if self.window.len() > self.capacity {
            self.window.pop_front();
        }
        debug_assert!(self.window.len() <= self.capacity);

        let stats = BaselineStats::from_window(&self.window);
        self.moving_average = stats.moving_average;
        self.standard_deviation = stats.standard_deviation;
        self.observations += 1;
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Samples currently in the window, oldest first
    #[inline]
    pub fn window(&self) -> &VecDeque<f64> {
        &self.window
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.window.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn moving_average(&self) -> f64 {
        self.moving_average
    }

    #[inline]
    pub fn standard_deviation(&self) -> f64 {
        self.standard_deviation
    }

    /// Samples ever applied, including evicted ones
    #[inline]
    pub fn observations(&self) -> u64 {
        self.observations
    }

    pub fn stats(&self) -> BaselineStats {
        BaselineStats {
            samples: self.window.len(),
            moving_average: self.moving_average,
            standard_deviation: self.standard_deviation,
        }
    }

    /// Baseline before the most recent insert
    #[inline]
    pub fn previous(&self) -> Option<BaselineStats> {
        self.previous
    }

    pub fn stage(&self, warmup_min_samples: usize) -> BaselineStage {
        if self.window.len() < warmup_min_samples {
            BaselineStage::WarmingUp
        } else {
            BaselineStage::Active
        }
    }
}

// ----------------------------------------------------------------------------
// Correlation
// ----------------------------------------------------------------------------

/// Probable cause of a primary-signal anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorrelationKind {
    HostSaturation,
    CodeInefficiency,
}

impl CorrelationKind {
    /// Two-factor decision table: an anomalous primary signal is blamed on
    /// the host when the auxiliary percentage is strictly above `threshold`.
    pub fn classify(primary_anomalous: bool, aux_value: f64, threshold: f64) -> Option<Self> {
        match (primary_anomalous, aux_value > threshold) {
            (true, true) => Some(CorrelationKind::HostSaturation),
            (true, false) => Some(CorrelationKind::CodeInefficiency),
            (false, _) => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CorrelationKind::HostSaturation => "HOST_SATURATION",
            CorrelationKind::CodeInefficiency => "CODE_INEFFICIENCY",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CorrelationKind::HostSaturation => "Host CPU saturation is impacting API response times.",
            CorrelationKind::CodeInefficiency => {
                "High API latency detected without host pressure. Potentially a code-level bottleneck."
            }
        }
    }

    /// Bottleneck classification used when reporting this cause
    pub fn bottleneck_kind(&self) -> BottleneckKind {
        match self {
            CorrelationKind::HostSaturation => BottleneckKind::Cpu,
            CorrelationKind::CodeInefficiency => BottleneckKind::Code,
        }
    }
}

impl Display for CorrelationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    #[serde(rename = "type")]
    pub kind: CorrelationKind,
    pub description: String,
}

impl From<CorrelationKind> for Correlation {
    fn from(kind: CorrelationKind) -> Self {
        Self {
            kind,
            description: kind.description().into(),
        }
    }
}

/// Result of an update followed by an anomaly check
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Observation {
    /// Baseline after the sample was applied
    pub baseline: BaselineStats,
    /// Z-score the verdict was based on, absent while warming up
    pub z_score: Option<f64>,
    pub anomalous: bool,
}

// ----------------------------------------------------------------------------
// Baseline Tracker
// ----------------------------------------------------------------------------

/// Per-key adaptive baselines.
///
/// Updates to one key are serialized by the map's shard lock, so they apply
/// in call order even when callers run on different worker threads.
#[derive(Debug)]
pub struct BaselineTracker {
    config: BaselineConfig,
    baselines: DashMap<CompactString, BaselineEntry>,
}

impl BaselineTracker {
    pub fn new(config: BaselineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            baselines: DashMap::new(),
        })
    }

    #[inline]
    pub fn config(&self) -> &BaselineConfig {
        &self.config
    }

    /// Append `value` to the key's window and recompute its baseline.
    ///
    /// Non-finite samples are discarded so they cannot poison the window;
    /// the entry is still created and returned unchanged.
    pub fn update_baseline(&self, key: &str, value: f64) -> BaselineEntry {
        let mut entry = self.entry_mut(key);
        Self::apply(&mut entry, value);
        entry.clone()
    }

    /// Whether `value` is an upward anomaly for `key`. Pure query.
    pub fn is_anomaly(&self, key: &str, value: f64) -> bool {
        self.baselines
            .get(key)
            .map(|entry| self.evaluate(&entry, value).1)
            .unwrap_or(false)
    }

    /// Z-score of `value` against the key's evaluation baseline, or `None`
    /// while the key is absent or warming up.
    pub fn z_score(&self, key: &str, value: f64) -> Option<f64> {
        self.baselines.get(key).and_then(|entry| self.evaluate(&entry, value).0)
    }

    /// Update then check in one locked step.
    pub fn observe(&self, key: &str, value: f64) -> Observation {
        let mut entry = self.entry_mut(key);
        Self::apply(&mut entry, value);
        let (z_score, anomalous) = self.evaluate(&entry, value);

        if anomalous {
            debug!(
                target: TARGET_BASELINE,
                key,
                value,
                z_score = z_score.unwrap_or_default(),
                moving_average = entry.moving_average(),
                standard_deviation = entry.standard_deviation(),
                "Anomaly detected"
            );
        }

        Observation {
            baseline: entry.stats(),
            z_score,
            anomalous,
        }
    }

    /// Classify a primary-key sample against an auxiliary host percentage.
    pub fn correlate(&self, signal_value: f64, aux_value: f64) -> Option<Correlation> {
        self.correlate_key(&self.config.primary_key, signal_value, aux_value)
    }

    pub fn correlate_key(&self, key: &str, signal_value: f64, aux_value: f64) -> Option<Correlation> {
        let anomalous = self.is_anomaly(key, signal_value);
        CorrelationKind::classify(anomalous, aux_value, self.config.host_saturation_percent).map(Correlation::from)
    }

    /// Snapshot of a key's entry
    pub fn get(&self, key: &str) -> Option<BaselineEntry> {
        self.baselines.get(key).map(|entry| entry.clone())
    }

    pub fn stage(&self, key: &str) -> Option<BaselineStage> {
        self.baselines
            .get(key)
            .map(|entry| entry.stage(self.config.warmup_min_samples))
    }

    pub fn keys(&self) -> Vec<CompactString> {
        self.baselines.iter().map(|entry| entry.value().key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }

    fn entry_mut(&self, key: &str) -> dashmap::mapref::one::RefMut<'_, CompactString, BaselineEntry> {
        let capacity = self.config.window_size;
        self.baselines.entry(CompactString::from(key)).or_insert_with(|| {
            debug!(target: TARGET_BASELINE, key, window_size = capacity, "Tracking new baseline key");
            BaselineEntry::new(key, capacity)
        })
    }

    fn apply(entry: &mut BaselineEntry, value: f64) {
        if !value.is_finite() {
            warn!(target: TARGET_BASELINE, key = entry.key(), value, "Discarding non-finite sample");
            return;
        }
        entry.push(value);
        trace!(
            target: TARGET_BASELINE,
            key = entry.key(),
            value,
            samples = entry.len(),
            moving_average = entry.moving_average(),
            standard_deviation = entry.standard_deviation(),
            "Baseline updated"
        );
    }

    fn evaluate(&self, entry: &BaselineEntry, value: f64) -> (Option<f64>, bool) {
        let stats = match self.config.evaluation {
            EvaluationMode::IncludeSample => Some(entry.stats()),
            EvaluationMode::PriorBaseline => entry.previous(),
        };

        match stats {
            Some(stats) if stats.samples >= self.config.warmup_min_samples => {
                let z = stats.z_score(value);
                (Some(z), z > self.config.anomaly_zscore_threshold)
            }
            _ => (None, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    fn tracker() -> BaselineTracker {
        BaselineTracker::new(BaselineConfig::default()).unwrap()
    }

    fn tracker_with(config: BaselineConfig) -> BaselineTracker {
        BaselineTracker::new(config).unwrap()
    }

    #[test]
    fn test_update_computes_population_stats() {
        let tracker = tracker();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            tracker.update_baseline("latency", v);
        }

        let entry = tracker.get("latency").unwrap();
        assert_eq!(entry.len(), 8);
        assert!((entry.moving_average() - 5.0).abs() < 1e-12);
        // population sd of this classic series is exactly 2
        assert!((entry.standard_deviation() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let tracker = tracker_with(BaselineConfig {
            window_size: 3,
            ..BaselineConfig::default()
        });

        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            tracker.update_baseline("k", v);
        }

        let entry = tracker.get("k").unwrap();
        assert_eq!(entry.window().iter().copied().collect::<Vec<_>>(), vec![3.0, 4.0, 5.0]);
        assert_eq!(entry.observations(), 5);
        assert!((entry.moving_average() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_update_returns_current_entry() {
        let tracker = tracker();
        let entry = tracker.update_baseline("k", 7.0);
        assert_eq!(entry.key(), "k");
        assert_eq!(entry.len(), 1);
        assert_eq!(entry.moving_average(), 7.0);
        assert_eq!(entry.standard_deviation(), 0.0);
        assert_eq!(entry.previous(), None);
    }

    #[test]
    fn test_warmup_suppresses_anomalies() {
        let tracker = tracker();
        tracker.update_baseline("k", 1.0);
        tracker.update_baseline("k", 1000.0);

        assert!(!tracker.is_anomaly("k", 1_000_000.0));
        assert!(!tracker.is_anomaly("missing", 1_000_000.0));
        assert_eq!(tracker.z_score("k", 5.0), None);
    }

    #[test]
    fn test_zero_spread_is_never_anomalous() {
        let tracker = tracker();
        for _ in 0..4 {
            tracker.update_baseline("k", 10.0);
        }
        tracker.update_baseline("k", 10.0);

        assert!(!tracker.is_anomaly("k", 10.0));
        assert_eq!(tracker.z_score("k", 10.0), Some(0.0));
    }

    #[test]
    fn test_spike_after_tight_cluster_is_anomalous() {
        let tracker = tracker();
        for i in 0..19 {
            let v = if i % 2 == 0 { 98.0 } else { 102.0 };
            tracker.update_baseline("api_latency", v);
        }

        tracker.update_baseline("api_latency", 200.0);
        assert!(tracker.is_anomaly("api_latency", 200.0));
    }

    #[test]
    fn test_threshold_tie_is_not_anomalous() {
        // [0, 0, 0, 0, 5]: mean 1, sd 2, so z(5) is exactly 2
        let tracker = tracker();
        for v in [0.0, 0.0, 0.0, 0.0, 5.0] {
            tracker.update_baseline("k", v);
        }
        assert_eq!(tracker.z_score("k", 5.0), Some(2.0));
        assert!(!tracker.is_anomaly("k", 5.0));

        let strict = tracker_with(BaselineConfig {
            anomaly_zscore_threshold: 1.9,
            ..BaselineConfig::default()
        });
        for v in [0.0, 0.0, 0.0, 0.0, 5.0] {
            strict.update_baseline("k", v);
        }
        assert!(strict.is_anomaly("k", 5.0));
    }

    #[test]
    fn test_only_upward_deviations_flagged() {
        let tracker = tracker();
        for v in [100.0, 102.0, 98.0, 100.0, 101.0, 99.0] {
            tracker.update_baseline("k", v);
        }
        assert!(!tracker.is_anomaly("k", 0.0));
    }

    #[test]
    fn test_is_anomaly_does_not_mutate() {
        let tracker = tracker();
        for v in [1.0, 2.0, 3.0] {
            tracker.update_baseline("k", v);
        }
        let before = tracker.get("k").unwrap();
        tracker.is_anomaly("k", 50.0);
        assert_eq!(tracker.get("k").unwrap(), before);
    }

    #[test]
    fn test_prior_baseline_mode() {
        let series = [9.0, 11.0, 9.0, 11.0, 13.0];

        let including = tracker();
        for v in series {
            including.update_baseline("k", v);
        }
        // the sample drags its own baseline to z ~= 1.6
        assert!(!including.is_anomaly("k", 13.0));

        let prior = tracker_with(BaselineConfig {
            evaluation: EvaluationMode::PriorBaseline,
            ..BaselineConfig::default()
        });
        for v in series {
            prior.update_baseline("k", v);
        }
        // against [9, 11, 9, 11] the sample sits 3 sd above the mean
        assert_eq!(prior.z_score("k", 13.0), Some(3.0));
        assert!(prior.is_anomaly("k", 13.0));
    }

    #[test]
    fn test_prior_baseline_warmup_counts_prior_samples() {
        let prior = tracker_with(BaselineConfig {
            evaluation: EvaluationMode::PriorBaseline,
            ..BaselineConfig::default()
        });
        for v in [1.0, 3.0, 500.0] {
            prior.update_baseline("k", v);
        }
        // only two samples preceded the spike
        assert!(!prior.is_anomaly("k", 500.0));
    }

    #[test]
    fn test_observe_matches_update_then_check() {
        let tracker = tracker();
        for i in 0..19 {
            tracker.observe("k", 100.0 + (i % 3) as f64);
        }
        let observation = tracker.observe("k", 300.0);

        assert!(observation.anomalous);
        assert_eq!(observation.baseline.samples, 20);
        assert!(observation.z_score.unwrap() > 2.0);
        assert!(tracker.is_anomaly("k", 300.0));
    }

    #[test]
    fn test_non_finite_samples_discarded() {
        let tracker = tracker();
        tracker.update_baseline("k", 4.0);
        let entry = tracker.update_baseline("k", f64::NAN);

        assert_eq!(entry.len(), 1);
        assert_eq!(entry.moving_average(), 4.0);
        assert_eq!(entry.observations(), 1);
    }

    #[test]
    fn test_stage_progression() {
        let tracker = tracker();
        assert_eq!(tracker.stage("k"), None);

        tracker.update_baseline("k", 1.0);
        tracker.update_baseline("k", 1.0);
        assert_eq!(tracker.stage("k"), Some(BaselineStage::WarmingUp));

        tracker.update_baseline("k", 1.0);
        assert_eq!(tracker.stage("k"), Some(BaselineStage::Active));
        assert_eq!(tracker.len(), 1);
    }

    #[test_case(true, 85.0 => Some(CorrelationKind::HostSaturation); "anomaly with busy host")]
    #[test_case(true, 40.0 => Some(CorrelationKind::CodeInefficiency); "anomaly with idle host")]
    #[test_case(true, 80.0 => Some(CorrelationKind::CodeInefficiency); "threshold is strict")]
    #[test_case(false, 95.0 => None; "no anomaly with busy host")]
    #[test_case(false, 10.0 => None; "no anomaly with idle host")]
    fn test_classify(primary_anomalous: bool, aux: f64) -> Option<CorrelationKind> {
        CorrelationKind::classify(primary_anomalous, aux, 80.0)
    }

    fn spiked_tracker() -> BaselineTracker {
        let tracker = tracker();
        for i in 0..19 {
            let v = if i % 2 == 0 { 98.0 } else { 102.0 };
            tracker.update_baseline(API_LATENCY, v);
        }
        tracker.update_baseline(API_LATENCY, 200.0);
        tracker
    }

    const API_LATENCY: &str = crate::constants::API_LATENCY_KEY;

    #[test]
    fn test_correlate() {
        let tracker = spiked_tracker();

        let host = tracker.correlate(200.0, 85.0).unwrap();
        assert_eq!(host.kind, CorrelationKind::HostSaturation);
        assert_eq!(host.description, "Host CPU saturation is impacting API response times.");

        let code = tracker.correlate(200.0, 40.0).unwrap();
        assert_eq!(code.kind, CorrelationKind::CodeInefficiency);

        assert_eq!(tracker.correlate(100.0, 85.0), None);
        assert_eq!(tracker.correlate(100.0, 40.0), None);
    }

    #[test]
    fn test_correlation_serializes_type() {
        let json = serde_json::to_value(Correlation::from(CorrelationKind::HostSaturation)).unwrap();
        assert_eq!(json["type"], "HOST_SATURATION");
    }

    #[test]
    fn test_concurrent_updates_respect_capacity() {
        let tracker = tracker();
        std::thread::scope(|scope| {
            for t in 0..8 {
                let tracker = &tracker;
                scope.spawn(move || {
                    for i in 0..250 {
                        tracker.update_baseline("shared", (t * 1000 + i) as f64);
                    }
                });
            }
        });

        let entry = tracker.get("shared").unwrap();
        assert_eq!(entry.observations(), 2000);
        assert_eq!(entry.len(), 20);
        let mean = entry.window().iter().sum::<f64>() / entry.len() as f64;
        assert!((entry.moving_average() - mean).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn prop_window_bounded_and_stats_consistent(
            window_size in 1usize..32,
            values in proptest::collection::vec(-1.0e6f64..1.0e6, 1..200),
        ) {
            let tracker = tracker_with(BaselineConfig {
                window_size,
                warmup_min_samples: 1,
                ..BaselineConfig::default()
            });

            for v in values {
                let entry = tracker.update_baseline("k", v);
                prop_assert!(entry.len() <= window_size);

                let n = entry.len() as f64;
                let mean = entry.window().iter().sum::<f64>() / n;
                let variance = entry.window().iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
                let tolerance = 1e-9 * (1.0 + mean.abs());
                prop_assert!((entry.moving_average() - mean).abs() <= tolerance);
                prop_assert!((entry.standard_deviation() - variance.sqrt()).abs() <= 1e-6 * (1.0 + variance.sqrt()));
            }
        }

        #[test]
        fn prop_warming_keys_never_anomalous(
            values in proptest::collection::vec(-1.0e6f64..1.0e6, 0..3),
            reading in -1.0e9f64..1.0e9,
        ) {
            let tracker = tracker();
            for v in &values {
                tracker.update_baseline("k", *v);
            }
            prop_assert!(!tracker.is_anomaly("k", reading));
        }
    }
}
