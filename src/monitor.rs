//! Per-request performance tracking.
//!
//! [`PerformanceMonitor::track_request`] is called once for every finished
//! request. It batches the metric sample, feeds the latency baseline,
//! turns anomalies into explained bottleneck records, scans the request
//! line for query anti-patterns and profiles slow requests.
//! [`PerformanceMonitor::record_host_sample`] does the same bookkeeping for
//! host readings. Nothing in here fails the caller: sink, explainer and
//! publisher errors are logged and swallowed.

use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::baseline::{BaselineTracker, Correlation, CorrelationKind};
use crate::batcher::{FlushOutcome, MetricBatcher};
use crate::config::MonitorConfig;
use crate::error::PerfwatchResult;
use crate::events::{EventPublisher, MonitorEvent};
use crate::explain::Explainer;
use crate::host::HostSample;
use crate::logging::TARGET_MONITOR;
use crate::query::{QueryAnalysis, QueryPatternScanner};
use crate::sink::MetricSink;
use crate::types::{
    Bottleneck, BottleneckDraft, BottleneckKind, BufferedMetric, Location, MetricFields, MetricPoint, PossibleCause,
    Profile, Regression, RequestObservation, Severity, EXPLAINED_CAUSE_KIND,
};

/// Tag stamped on every metric captured by the monitor
pub const AUTO_CAPTURED_TAG: &str = "auto-captured";

/// What the monitor did with one request
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestReport {
    /// False when the path is outside the tracked prefix
    pub tracked: bool,
    pub anomaly: bool,
    pub correlation: Option<Correlation>,
    pub bottleneck: Option<Bottleneck>,
    pub query: Option<QueryAnalysis>,
    pub profile: Option<Profile>,
}

/// What the monitor did with one host sample
#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub metric: BufferedMetric,
    pub bottlenecks: Vec<Bottleneck>,
}

pub struct PerformanceMonitor {
    config: MonitorConfig,
    batcher: MetricBatcher,
    tracker: BaselineTracker,
    scanner: QueryPatternScanner,
    sink: Arc<dyn MetricSink>,
    explainer: Arc<dyn Explainer>,
    publisher: Arc<dyn EventPublisher>,
    host_cpu: AtomicCell<Option<f64>>,
}

impl PerformanceMonitor {
    /// Build the monitor and its batcher. Must be called from within a
    /// tokio runtime.
    pub fn new(
        config: MonitorConfig,
        sink: Arc<dyn MetricSink>,
        explainer: Arc<dyn Explainer>,
        publisher: Arc<dyn EventPublisher>,
    ) -> PerfwatchResult<Self> {
        config.validate()?;
        let tracker = BaselineTracker::new(config.baseline.clone())?;
        let batcher = MetricBatcher::new(config.batcher.clone(), Arc::clone(&sink))?;

        info!(
            target: TARGET_MONITOR,
            service = %config.analysis.service_name,
            sink = sink.name(),
            explainer = explainer.name(),
            window_size = config.baseline.window_size,
            max_batch_size = config.batcher.max_batch_size,
            "Performance monitor ready"
        );

        Ok(Self {
            config,
            batcher,
            tracker,
            scanner: QueryPatternScanner::new(),
            sink,
            explainer,
            publisher,
            host_cpu: AtomicCell::new(None),
        })
    }

    #[inline]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    #[inline]
    pub fn batcher(&self) -> &MetricBatcher {
        &self.batcher
    }

    #[inline]
    pub fn tracker(&self) -> &BaselineTracker {
        &self.tracker
    }

    /// Record the latest host CPU reading (percent) used for correlation.
    /// Non-finite readings are ignored.
    pub fn record_host_cpu(&self, percent: f64) {
        if percent.is_finite() {
            self.host_cpu.store(Some(percent));
        }
    }

    pub fn last_host_cpu(&self) -> Option<f64> {
        self.host_cpu.load()
    }

    pub async fn track_request(&self, request: &RequestObservation) -> RequestReport {
        if !request.path.starts_with(self.config.analysis.tracked_prefix.as_str()) {
            return RequestReport::default();
        }

        let mut report = RequestReport {
            tracked: true,
            ..RequestReport::default()
        };
        let duration = request.duration_ms;

        let metric = self.build_metric(request);
        self.batcher.add(metric.clone());
        self.emit(MonitorEvent::MetricUpdate(metric));

        let key = self.tracker.config().primary_key.as_str();
        self.tracker.update_baseline(key, duration);
        report.anomaly = self.tracker.is_anomaly(key, duration);

        if report.anomaly {
            let host_cpu = self.host_cpu.load().unwrap_or(0.0);
            report.correlation = self.tracker.correlate(duration, host_cpu);
            report.bottleneck = self.capture_bottleneck(request, report.correlation.as_ref()).await;
        }

        if self.config.analysis.query_scanning {
            report.query = self.analyze_request_line(request);
        }

        if self.config.analysis.profiling && duration > self.config.analysis.profile_threshold_ms {
            report.profile = Some(self.capture_profile(request).await);
        }

        report
    }

    /// Batch a host reading, refresh the CPU value used for correlation
    /// and raise a bottleneck for every host threshold it crosses.
    pub async fn record_host_sample(&self, sample: &HostSample) -> HostReport {
        self.record_host_cpu(sample.cpu_usage);
        self.emit(MonitorEvent::SystemMetrics(sample.clone()));

        let host = &self.config.host;
        let metric = sample.to_metric(host);
        self.batcher.add(metric.clone());
        self.emit(MonitorEvent::MetricUpdate(metric.clone()));

        let mut bottlenecks = Vec::new();
        for draft in sample.bottleneck_drafts(host) {
            if let Some(bottleneck) = self.raise_bottleneck(host.bottleneck_service.as_str(), draft).await {
                bottlenecks.push(bottleneck);
            }
        }

        HostReport { metric, bottlenecks }
    }

    /// Record that `metric` went from `baseline` to `current`.
    ///
    /// Returns `None` when the current reading is not worse, or when the
    /// explainer fails; otherwise the explained regression is stored and
    /// published.
    pub async fn report_regression(
        &self,
        metric: &str,
        baseline: MetricPoint,
        current: MetricPoint,
    ) -> Option<Regression> {
        let mut regression = Regression::new(self.config.analysis.service_name.as_str(), metric, baseline, current);
        if !regression.is_degraded() {
            debug!(target: TARGET_MONITOR, metric, "No degradation, regression not reported");
            return None;
        }

        let explanation = match self.explainer.analyze_regression(&regression).await {
            Ok(explanation) => explanation,
            Err(e) => {
                warn!(target: TARGET_MONITOR, metric, error = %e, "Regression analysis failed");
                return None;
            }
        };
        regression.analysis = explanation.why;
        regression.possible_causes = explanation
            .suggestions
            .into_iter()
            .map(|s| PossibleCause {
                kind: EXPLAINED_CAUSE_KIND.into(),
                description: s.recommendation,
                confidence: s.confidence,
            })
            .collect();

        info!(
            target: TARGET_MONITOR,
            id = %regression.id,
            metric,
            percentage = regression.degradation.percentage,
            "Regression detected"
        );

        if let Err(e) = self.sink.save_regression(&regression).await {
            warn!(target: TARGET_MONITOR, id = %regression.id, error = %e, "Regression save skipped");
        }
        self.emit(MonitorEvent::RegressionDetected(regression.clone()));

        Some(regression)
    }

    /// Flush pending metrics
    pub async fn shutdown(&self) -> FlushOutcome {
        self.batcher.shutdown().await
    }

    fn build_metric(&self, request: &RequestObservation) -> BufferedMetric {
        let metrics = MetricFields {
            response_time: request.duration_ms,
            cpu_usage: Some(0.0),
            memory_usage: Some(0.0),
            request_count: None,
            error_rate: Some(if request.is_error() { 100.0 } else { 0.0 }),
        };

        BufferedMetric::new(self.config.analysis.service_name.as_str(), request.path.clone(), request.duration_ms)
            .with_metrics(metrics)
            .with_tag(AUTO_CAPTURED_TAG)
            .with_tag(request.method.clone())
    }

    async fn capture_bottleneck(
        &self,
        request: &RequestObservation,
        correlation: Option<&Correlation>,
    ) -> Option<Bottleneck> {
        let kind = match correlation.map(|c| c.kind) {
            Some(CorrelationKind::HostSaturation) => BottleneckKind::Cpu,
            _ => BottleneckKind::Code,
        };
        let description = match correlation {
            Some(c) => c.description.clone(),
            None => format!("Significant API latency spike detected: {}ms", request.duration_ms),
        };
        let draft = BottleneckDraft {
            kind,
            severity: Severity::High,
            location: Location::function(request.path.as_str()),
            description,
        };

        debug!(target: TARGET_MONITOR, path = %request.path, duration_ms = request.duration_ms, "Latency anomaly");
        self.raise_bottleneck(self.config.analysis.service_name.as_str(), draft).await
    }

    /// Explain `draft`, then store and publish the bottleneck.
    /// An explainer failure drops the bottleneck.
    async fn raise_bottleneck(&self, service: &str, draft: BottleneckDraft) -> Option<Bottleneck> {
        let explanation = match self.explainer.explain_bottleneck(&draft).await {
            Ok(explanation) => explanation,
            Err(e) => {
                warn!(target: TARGET_MONITOR, location = %draft.location, error = %e, "Bottleneck capture failed");
                return None;
            }
        };

        let bottleneck = Bottleneck::from_draft(service, draft, explanation.why, explanation.suggestions);

        info!(
            target: TARGET_MONITOR,
            id = %bottleneck.id,
            kind = %bottleneck.kind,
            severity = %bottleneck.severity,
            location = %bottleneck.location,
            "Bottleneck detected"
        );

        if let Err(e) = self.sink.save_bottleneck(&bottleneck).await {
            warn!(target: TARGET_MONITOR, id = %bottleneck.id, error = %e, "Bottleneck save skipped");
        }
        self.emit(MonitorEvent::BottleneckDetected(bottleneck.clone()));

        Some(bottleneck)
    }

    async fn capture_profile(&self, request: &RequestObservation) -> Profile {
        let profile = Profile::segmented(self.config.analysis.service_name.as_str(), request);

        if let Err(e) = self.sink.save_profile(&profile).await {
            warn!(target: TARGET_MONITOR, id = %profile.id, error = %e, "Profile save skipped");
        }
        self.emit(MonitorEvent::ProfileCreated(profile.clone()));

        profile
    }

    fn analyze_request_line(&self, request: &RequestObservation) -> Option<QueryAnalysis> {
        let analysis = self.scanner.analyze(
            &request.request_line(),
            &self.config.analysis.query_database,
            request.duration_ms,
        );

        if analysis.suggestions.is_empty() && request.duration_ms <= self.config.analysis.slow_request_ms {
            return None;
        }

        self.emit(MonitorEvent::QueryAnalyzed(analysis.clone()));
        Some(analysis)
    }

    fn emit(&self, event: MonitorEvent) {
        let name = event.name();
        if let Err(e) = self.publisher.publish(event) {
            debug!(target: TARGET_MONITOR, event = name, error = %e, "Event not delivered");
        }
    }
}

impl std::fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("service", &self.config.analysis.service_name)
            .field("batcher", &self.batcher)
            .field("baselines", &self.tracker.len())
            .field("host_cpu", &self.last_host_cpu())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExplainError;
    use crate::events::BroadcastPublisher;
    use crate::explain::{Explanation, RuleBasedExplainer};
    use crate::sink::MemorySink;
    use async_trait::async_trait;

    struct FailingExplainer;

    #[async_trait]
    impl Explainer for FailingExplainer {
        fn name(&self) -> &str {
            "failing"
        }

        async fn explain_bottleneck(&self, _draft: &BottleneckDraft) -> Result<Explanation, ExplainError> {
            Err(ExplainError::Failed {
                explainer: "failing".into(),
                message: "model offline".into(),
            })
        }

        async fn analyze_regression(&self, _regression: &Regression) -> Result<Explanation, ExplainError> {
            Err(ExplainError::Failed {
                explainer: "failing".into(),
                message: "model offline".into(),
            })
        }
    }

    struct Harness {
        monitor: PerformanceMonitor,
        sink: Arc<MemorySink>,
        publisher: Arc<BroadcastPublisher>,
    }

    fn harness_with(explainer: Arc<dyn Explainer>) -> Harness {
        let sink = Arc::new(MemorySink::new());
        let publisher = Arc::new(BroadcastPublisher::new(256));
        let monitor = PerformanceMonitor::new(
            MonitorConfig::default(),
            sink.clone(),
            explainer,
            publisher.clone(),
        )
        .unwrap();
        Harness {
            monitor,
            sink,
            publisher,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(RuleBasedExplainer::new()))
    }

    async fn steady_run(monitor: &PerformanceMonitor) {
        for i in 0..10 {
            let duration = if i % 2 == 0 { 98.0 } else { 102.0 };
            let report = monitor
                .track_request(&RequestObservation::new("GET", "/api/orders", 200, duration))
                .await;
            assert!(!report.anomaly);
        }
    }

    fn bottleneck_events(subscriber: &mut crate::events::EventSubscriber) -> Vec<Bottleneck> {
        let mut found = Vec::new();
        while let Some(event) = subscriber.try_recv() {
            if let MonitorEvent::BottleneckDetected(b) = event.as_ref() {
                found.push(b.clone());
            }
        }
        found
    }

    #[tokio::test]
    async fn test_spike_under_host_saturation_is_cpu() {
        let h = harness();
        let mut subscriber = h.publisher.subscribe();
        h.monitor.record_host_cpu(90.0);

        steady_run(&h.monitor).await;
        let report = h
            .monitor
            .track_request(&RequestObservation::new("GET", "/api/orders", 200, 900.0))
            .await;

        assert!(report.anomaly);
        assert_eq!(report.correlation.as_ref().map(|c| c.kind), Some(CorrelationKind::HostSaturation));

        let events = bottleneck_events(&mut subscriber);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, BottleneckKind::Cpu);
        assert_eq!(events[0].severity, Severity::High);
        assert_eq!(events[0].description, "Host CPU saturation is impacting API response times.");
        assert_eq!(events[0].location.function.as_deref(), Some("/api/orders"));
        assert_eq!(h.sink.bottlenecks().len(), 1);
    }

    #[tokio::test]
    async fn test_spike_without_host_pressure_is_code() {
        let h = harness();
        let mut subscriber = h.publisher.subscribe();
        h.monitor.record_host_cpu(20.0);

        steady_run(&h.monitor).await;
        h.monitor
            .track_request(&RequestObservation::new("GET", "/api/orders", 200, 900.0))
            .await;

        let events = bottleneck_events(&mut subscriber);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, BottleneckKind::Code);
        assert!(events[0].why.starts_with("Performance anomaly detected: High API latency"));
        assert_eq!(events[0].ai_suggestions.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_host_reading_counts_as_idle() {
        let h = harness();
        steady_run(&h.monitor).await;
        let report = h
            .monitor
            .track_request(&RequestObservation::new("GET", "/api/orders", 200, 900.0))
            .await;

        assert_eq!(report.bottleneck.map(|b| b.kind), Some(BottleneckKind::Code));
    }

    #[tokio::test]
    async fn test_metric_sample_shape() {
        let h = harness();
        let mut subscriber = h.publisher.subscribe();

        h.monitor
            .track_request(&RequestObservation::new("POST", "/api/orders", 503, 40.0))
            .await;

        match subscriber.try_recv().as_deref() {
            Some(MonitorEvent::MetricUpdate(metric)) => {
                assert_eq!(metric.service, "api-gateway");
                assert_eq!(metric.endpoint, "/api/orders");
                assert_eq!(metric.metrics.error_rate, Some(100.0));
                assert!(metric.has_tag(AUTO_CAPTURED_TAG));
                assert!(metric.has_tag("POST"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(h.monitor.batcher().pending(), 1);
    }

    #[tokio::test]
    async fn test_untracked_path_is_ignored() {
        let h = harness();
        let report = h
            .monitor
            .track_request(&RequestObservation::new("GET", "/health", 200, 5_000.0))
            .await;

        assert!(!report.tracked);
        assert_eq!(h.monitor.batcher().pending(), 0);
        assert!(h.monitor.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_slow_request_is_analyzed() {
        let h = harness();

        let fast = h
            .monitor
            .track_request(&RequestObservation::new("GET", "/api/users", 200, 50.0))
            .await;
        assert!(fast.query.is_none());

        let slow = h
            .monitor
            .track_request(&RequestObservation::new("GET", "/api/users", 200, 250.0))
            .await;
        let analysis = slow.query.unwrap();
        assert_eq!(analysis.query_text, "REST API: GET /api/users");
        assert_eq!(analysis.database, "app-main-db");
        assert!(!analysis.is_optimized);
        assert!(analysis.suggestions.is_empty());
    }

    #[tokio::test]
    async fn test_explainer_failure_skips_bottleneck() {
        let h = harness_with(Arc::new(FailingExplainer));
        steady_run(&h.monitor).await;

        let report = h
            .monitor
            .track_request(&RequestObservation::new("GET", "/api/orders", 200, 900.0))
            .await;

        assert!(report.anomaly);
        assert!(report.bottleneck.is_none());
        assert!(h.sink.bottlenecks().is_empty());
    }

    #[tokio::test]
    async fn test_works_without_subscribers() {
        let h = harness();
        assert_eq!(h.publisher.subscriber_count(), 0);

        steady_run(&h.monitor).await;
        assert_eq!(h.monitor.batcher().pending(), 10);
        assert!(h.publisher.stats().undelivered >= 10);
    }

    #[tokio::test]
    async fn test_shutdown_persists_pending_metrics() {
        let h = harness();
        steady_run(&h.monitor).await;

        assert_eq!(h.monitor.shutdown().await.records(), 10);
        assert_eq!(h.sink.metric_count(), 10);
    }

    #[tokio::test]
    async fn test_host_cpu_ignores_non_finite() {
        let h = harness();
        h.monitor.record_host_cpu(42.0);
        h.monitor.record_host_cpu(f64::NAN);
        assert_eq!(h.monitor.last_host_cpu(), Some(42.0));
    }

    fn event_names(subscriber: &mut crate::events::EventSubscriber) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Some(event) = subscriber.try_recv() {
            names.push(event.name());
        }
        names
    }

    #[tokio::test]
    async fn test_slow_request_is_profiled() {
        let h = harness();
        let mut subscriber = h.publisher.subscribe();

        let fast = h
            .monitor
            .track_request(&RequestObservation::new("GET", "/api/users", 200, 50.0))
            .await;
        assert!(fast.profile.is_none());

        let slow = h
            .monitor
            .track_request(&RequestObservation::new("GET", "/api/users", 200, 60.0))
            .await;
        let profile = slow.profile.unwrap();
        assert_eq!(profile.service, "api-gateway");
        assert_eq!(profile.duration, 60.0);
        assert_eq!(profile.summary.hottest_function, "Handler: /api/users");

        assert_eq!(event_names(&mut subscriber).iter().filter(|n| **n == "profile:created").count(), 1);
        assert_eq!(h.sink.profiles().len(), 1);
    }

    #[tokio::test]
    async fn test_profiling_can_be_disabled() {
        let mut config = MonitorConfig::default();
        config.analysis.profiling = false;
        let sink = Arc::new(MemorySink::new());
        let monitor = PerformanceMonitor::new(
            config,
            sink.clone(),
            Arc::new(RuleBasedExplainer::new()),
            Arc::new(BroadcastPublisher::new(16)),
        )
        .unwrap();

        let report = monitor
            .track_request(&RequestObservation::new("GET", "/api/users", 200, 500.0))
            .await;
        assert!(report.profile.is_none());
        assert!(sink.profiles().is_empty());
    }

    #[tokio::test]
    async fn test_host_sample_raises_host_bottlenecks() {
        let h = harness();
        let mut subscriber = h.publisher.subscribe();

        let report = h.monitor.record_host_sample(&HostSample::new(85.0, 95.0, 97.0)).await;

        let kinds: Vec<BottleneckKind> = report.bottlenecks.iter().map(|b| b.kind).collect();
        assert_eq!(kinds, vec![BottleneckKind::Cpu, BottleneckKind::Memory, BottleneckKind::Io]);
        assert_eq!(report.bottlenecks[1].severity, Severity::Critical);
        assert!(report.bottlenecks.iter().all(|b| b.service == "host-system"));
        assert!(report.bottlenecks[0].why.starts_with("High CPU usage detected at Host Machine."));
        assert!(report.bottlenecks[2].why.contains("data layer"));
        assert_eq!(h.sink.bottlenecks().len(), 3);

        assert_eq!(h.monitor.last_host_cpu(), Some(85.0));
        assert_eq!(report.metric.service, "local-laptop");
        assert_eq!(h.monitor.batcher().pending(), 1);

        assert_eq!(
            event_names(&mut subscriber),
            vec![
                "system:metrics",
                "metric:update",
                "bottleneck:detected",
                "bottleneck:detected",
                "bottleneck:detected"
            ]
        );
    }

    #[tokio::test]
    async fn test_quiet_host_sample_only_batches() {
        let h = harness();
        let report = h.monitor.record_host_sample(&HostSample::new(30.0, 40.0, 50.0)).await;

        assert!(report.bottlenecks.is_empty());
        assert!(h.sink.bottlenecks().is_empty());
        assert_eq!(h.monitor.batcher().pending(), 1);
    }

    #[tokio::test]
    async fn test_host_sample_feeds_request_correlation() {
        let h = harness();
        h.monitor.record_host_sample(&HostSample::new(92.0, 40.0, 50.0)).await;

        steady_run(&h.monitor).await;
        let report = h
            .monitor
            .track_request(&RequestObservation::new("GET", "/api/orders", 200, 900.0))
            .await;
        assert_eq!(report.bottleneck.map(|b| b.kind), Some(BottleneckKind::Cpu));
    }

    #[tokio::test]
    async fn test_regression_is_explained_and_published() {
        let h = harness();
        let mut subscriber = h.publisher.subscribe();

        let regression = h
            .monitor
            .report_regression("responseTime", MetricPoint::now(120.0), MetricPoint::now(650.0))
            .await
            .unwrap();

        assert_eq!(regression.service, "api-gateway");
        assert_eq!(regression.degradation.percentage, 442.0);
        assert!(regression.analysis.starts_with("The responseTime has degraded by 442%"));
        assert_eq!(regression.possible_causes.len(), 3);
        assert!(regression.possible_causes.iter().all(|c| c.kind == "AI-Suggestion"));
        assert_eq!(h.sink.regressions().len(), 1);
        assert_eq!(event_names(&mut subscriber), vec!["regression:detected"]);
    }

    #[tokio::test]
    async fn test_improvement_is_not_a_regression() {
        let h = harness();
        let regression = h
            .monitor
            .report_regression("responseTime", MetricPoint::now(300.0), MetricPoint::now(250.0))
            .await;

        assert!(regression.is_none());
        assert!(h.sink.regressions().is_empty());
    }

    #[tokio::test]
    async fn test_regression_dropped_when_explainer_fails() {
        let h = harness_with(Arc::new(FailingExplainer));
        let regression = h
            .monitor
            .report_regression("responseTime", MetricPoint::now(100.0), MetricPoint::now(200.0))
            .await;

        assert!(regression.is_none());
        assert!(h.sink.regressions().is_empty());
    }
}
