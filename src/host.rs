//! Host sampling.
//!
//! A [`HostSource`] produces one [`HostSample`] per tick; [`run_host_sampler`]
//! feeds every sample to [`PerformanceMonitor::record_host_sample`], which
//! batches it, refreshes the CPU reading used for latency correlation and
//! raises host bottlenecks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, Networks, System};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::HostConfig;
use crate::constants::{HOST_LOCATION, HOST_TOP_PROCESSES};
use crate::logging::TARGET_MONITOR;
use crate::monitor::PerformanceMonitor;
use crate::types::{BottleneckDraft, BottleneckKind, BufferedMetric, Location, MetricFields, Severity};

/// Shortest interval the sampler accepts
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(1);

/// Tags stamped on every batched host metric
pub const HOST_METRIC_TAGS: [&str; 2] = ["real-time", "host-metrics"];

// ----------------------------------------------------------------------------
// Host Sample
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    /// CPU percent, one decimal
    pub cpu: f64,
    /// Share of total memory in percent, one decimal
    pub mem: f64,
}

/// One reading of the host's resource usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub memory_total: u64,
    pub memory_used: u64,
    pub total_processes: usize,
    pub load_average: f64,
    /// Usage of the primary disk in percent
    pub disk_usage: f64,
    pub disk_total: u64,
    pub disk_used: u64,
    /// Bytes per second across all interfaces
    pub network_rx: f64,
    pub network_tx: f64,
    /// Seconds since boot
    pub uptime: u64,
    #[serde(default)]
    pub top_processes: Vec<ProcessSample>,
}

impl HostSample {
    /// Sample carrying only the three percentages alerts are raised on
    pub fn new(cpu_usage: f64, memory_usage: f64, disk_usage: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_usage,
            memory_usage,
            memory_total: 0,
            memory_used: 0,
            total_processes: 0,
            load_average: 0.0,
            disk_usage,
            disk_total: 0,
            disk_used: 0,
            network_rx: 0.0,
            network_tx: 0.0,
            uptime: 0,
            top_processes: Vec::new(),
        }
    }

    /// Builder: set the one-minute load average
    #[inline]
    pub fn with_load_average(mut self, load_average: f64) -> Self {
        self.load_average = load_average;
        self
    }

    /// Bottlenecks this sample crosses, in cpu, memory, disk order.
    /// Every threshold is strict.
    pub fn bottleneck_drafts(&self, config: &HostConfig) -> Vec<BottleneckDraft> {
        let mut drafts = Vec::new();

        if self.cpu_usage > config.cpu_alert_percent {
            drafts.push(host_draft(
                BottleneckKind::Cpu,
                Severity::High,
                format!("CPU usage critical at {:.0}%", self.cpu_usage),
            ));
        }
        if self.memory_usage > config.memory_alert_percent {
            drafts.push(host_draft(
                BottleneckKind::Memory,
                Severity::Critical,
                format!("Memory exhaustion imminent at {:.0}%", self.memory_usage),
            ));
        }
        if self.disk_usage > config.disk_alert_percent {
            drafts.push(host_draft(
                BottleneckKind::Io,
                Severity::High,
                format!("Disk space critical at {:.0}%", self.disk_usage),
            ));
        }

        drafts
    }

    /// Metric record batched for this sample. The load average stands in
    /// for the response time.
    pub fn to_metric(&self, config: &HostConfig) -> BufferedMetric {
        let metrics = MetricFields {
            response_time: self.load_average,
            cpu_usage: Some(self.cpu_usage),
            memory_usage: Some(self.memory_usage),
            request_count: None,
            error_rate: Some(0.0),
        };

        let mut metric = BufferedMetric::new(config.service_name.as_str(), config.endpoint.as_str(), self.load_average)
            .with_recorded_at(self.timestamp)
            .with_metrics(metrics);
        for tag in HOST_METRIC_TAGS {
            metric = metric.with_tag(tag);
        }
        metric
    }
}

fn host_draft(kind: BottleneckKind, severity: Severity, description: String) -> BottleneckDraft {
    BottleneckDraft {
        kind,
        severity,
        location: Location::function(HOST_LOCATION),
        description,
    }
}

fn percent(part: f64, total: f64) -> f64 {
    if total > 0.0 {
        (part / total * 100.0).round()
    } else {
        0.0
    }
}

fn one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

// ----------------------------------------------------------------------------
// Sources
// ----------------------------------------------------------------------------

/// Something that can read the host's current state
pub trait HostSource: Send {
    fn name(&self) -> &str;

    fn sample(&mut self) -> HostSample;
}

/// Reads the local machine through `sysinfo`.
///
/// CPU usage and network rates are deltas against the previous refresh,
/// so the first sample after construction reads low.
pub struct SystemHostSource {
    system: System,
    disks: Disks,
    networks: Networks,
    last_refresh: Instant,
}

impl SystemHostSource {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();

        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            last_refresh: Instant::now(),
        }
    }

    fn top_processes(&self, memory_total: u64) -> Vec<ProcessSample> {
        let mut processes: Vec<ProcessSample> = self
            .system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessSample {
                pid: pid.as_u32(),
                name: process.name().to_string(),
                cpu: one_decimal(f64::from(process.cpu_usage())),
                mem: if memory_total > 0 {
                    one_decimal(process.memory() as f64 / memory_total as f64 * 100.0)
                } else {
                    0.0
                },
            })
            .collect();

        processes.sort_by(|a, b| b.cpu.total_cmp(&a.cpu));
        processes.truncate(HOST_TOP_PROCESSES);
        processes
    }
}

impl Default for SystemHostSource {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSource for SystemHostSource {
    fn name(&self) -> &str {
        "sysinfo"
    }

    fn sample(&mut self) -> HostSample {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.system.refresh_processes();
        self.disks.refresh();
        self.networks.refresh();

        let elapsed = self.last_refresh.elapsed().as_secs_f64().max(f64::EPSILON);
        self.last_refresh = Instant::now();

        let memory_total = self.system.total_memory();
        let memory_used = self.system.used_memory();
        let (disk_total, disk_used) = self
            .disks
            .list()
            .first()
            .map(|disk| {
                let total = disk.total_space();
                (total, total.saturating_sub(disk.available_space()))
            })
            .unwrap_or((0, 0));
        let (rx, tx) = self
            .networks
            .iter()
            .fold((0u64, 0u64), |(rx, tx), (_, data)| (rx + data.received(), tx + data.transmitted()));

        HostSample {
            timestamp: Utc::now(),
            cpu_usage: f64::from(self.system.global_cpu_info().cpu_usage()).round(),
            memory_usage: percent(memory_used as f64, memory_total as f64),
            memory_total,
            memory_used,
            total_processes: self.system.processes().len(),
            load_average: (System::load_average().one * 100.0).round() / 100.0,
            disk_usage: percent(disk_used as f64, disk_total as f64),
            disk_total,
            disk_used,
            network_rx: (rx as f64 / elapsed).round(),
            network_tx: (tx as f64 / elapsed).round(),
            uptime: System::uptime(),
            top_processes: self.top_processes(memory_total),
        }
    }
}

// ----------------------------------------------------------------------------
// Sampler Loop
// ----------------------------------------------------------------------------

/// Sample `source` every `every` until `cancel` fires or `limit` samples
/// were recorded. The first tick is skipped so delta-based readings have
/// a full interval behind them. Returns the number of samples recorded.
pub async fn run_host_sampler<S: HostSource>(
    monitor: Arc<PerformanceMonitor>,
    mut source: S,
    every: Duration,
    limit: Option<u64>,
    cancel: CancellationToken,
) -> u64 {
    let every = every.max(MIN_SAMPLE_INTERVAL);
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await;

    info!(
        target: TARGET_MONITOR,
        source = source.name(),
        interval_ms = every.as_millis() as u64,
        "Host sampler started"
    );

    let mut recorded = 0u64;
    while limit.map_or(true, |limit| recorded < limit) {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let sample = source.sample();
                let report = monitor.record_host_sample(&sample).await;
                recorded += 1;
                debug!(
                    target: TARGET_MONITOR,
                    cpu = sample.cpu_usage,
                    memory = sample.memory_usage,
                    disk = sample.disk_usage,
                    bottlenecks = report.bottlenecks.len(),
                    "Host sample recorded"
                );
            }
        }
    }

    info!(target: TARGET_MONITOR, recorded, "Host sampler stopped");
    recorded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::events::{BroadcastPublisher, MonitorEvent};
    use crate::explain::RuleBasedExplainer;
    use crate::sink::MemorySink;
    use std::collections::VecDeque;
    use test_case::test_case;

    /// Replays fixed samples, then repeats the last one
    struct ScriptedSource {
        samples: VecDeque<HostSample>,
        last: HostSample,
    }

    impl ScriptedSource {
        fn new(samples: Vec<HostSample>) -> Self {
            Self {
                last: HostSample::new(0.0, 0.0, 0.0),
                samples: samples.into(),
            }
        }
    }

    impl HostSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        fn sample(&mut self) -> HostSample {
            if let Some(next) = self.samples.pop_front() {
                self.last = next;
            }
            self.last.clone()
        }
    }

    fn kinds(sample: &HostSample) -> Vec<(BottleneckKind, Severity)> {
        sample
            .bottleneck_drafts(&HostConfig::default())
            .into_iter()
            .map(|d| (d.kind, d.severity))
            .collect()
    }

    #[test_case(50.0, 50.0, 50.0 => 0; "idle host")]
    #[test_case(80.0, 90.0, 90.0 => 0; "thresholds are strict")]
    #[test_case(81.0, 50.0, 50.0 => 1; "cpu only")]
    #[test_case(95.0, 95.0, 95.0 => 3; "everything saturated")]
    fn test_draft_count(cpu: f64, memory: f64, disk: f64) -> usize {
        kinds(&HostSample::new(cpu, memory, disk)).len()
    }

    #[test]
    fn test_draft_kinds_and_severities() {
        assert_eq!(
            kinds(&HostSample::new(95.0, 95.0, 95.0)),
            vec![
                (BottleneckKind::Cpu, Severity::High),
                (BottleneckKind::Memory, Severity::Critical),
                (BottleneckKind::Io, Severity::High),
            ]
        );

        let drafts = HostSample::new(20.0, 93.4, 10.0).bottleneck_drafts(&HostConfig::default());
        assert_eq!(drafts[0].description, "Memory exhaustion imminent at 93%");
        assert_eq!(drafts[0].location.function.as_deref(), Some("Host Machine"));
    }

    #[test]
    fn test_host_metric_shape() {
        let sample = HostSample::new(42.0, 61.0, 10.0).with_load_average(1.25);
        let metric = sample.to_metric(&HostConfig::default());

        assert_eq!(metric.service, "local-laptop");
        assert_eq!(metric.endpoint, "system-monitor");
        assert_eq!(metric.metrics.response_time, 1.25);
        assert_eq!(metric.metrics.cpu_usage, Some(42.0));
        assert_eq!(metric.metrics.memory_usage, Some(61.0));
        assert_eq!(metric.metrics.error_rate, Some(0.0));
        assert!(metric.has_tag("real-time"));
        assert!(metric.has_tag("host-metrics"));
        assert_eq!(metric.recorded_at, sample.timestamp);
    }

    #[test]
    fn test_sample_serializes_camel_case() {
        let json = serde_json::to_value(HostSample::new(1.0, 2.0, 3.0)).unwrap();
        assert_eq!(json["cpuUsage"], 1.0);
        assert_eq!(json["memoryUsage"], 2.0);
        assert_eq!(json["diskUsage"], 3.0);
        assert!(json["topProcesses"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_system_source_reads_plausible_values() {
        let mut source = SystemHostSource::new();
        let sample = source.sample();

        assert!((0.0..=100.0).contains(&sample.memory_usage));
        assert!((0.0..=100.0).contains(&sample.disk_usage));
        assert!(sample.top_processes.len() <= HOST_TOP_PROCESSES);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_records_until_limit() {
        let sink = Arc::new(MemorySink::new());
        let publisher = Arc::new(BroadcastPublisher::new(64));
        let mut subscriber = publisher.subscribe();
        let monitor = Arc::new(
            PerformanceMonitor::new(
                MonitorConfig::default(),
                sink.clone(),
                Arc::new(RuleBasedExplainer::new()),
                publisher.clone(),
            )
            .unwrap(),
        );

        let source = ScriptedSource::new(vec![HostSample::new(30.0, 40.0, 50.0), HostSample::new(85.0, 40.0, 50.0)]);
        let recorded = run_host_sampler(
            Arc::clone(&monitor),
            source,
            Duration::from_secs(10),
            Some(3),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(recorded, 3);
        assert_eq!(monitor.last_host_cpu(), Some(85.0));
        assert_eq!(sink.bottlenecks().len(), 2);
        assert!(sink.bottlenecks().iter().all(|b| b.service == "host-system"));

        monitor.shutdown().await;
        assert_eq!(sink.metric_count(), 3);

        let mut system_events = 0;
        while let Some(event) = subscriber.try_recv() {
            if matches!(event.as_ref(), MonitorEvent::SystemMetrics(_)) {
                system_events += 1;
            }
        }
        assert_eq!(system_events, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_stops_on_cancel() {
        let monitor = Arc::new(
            PerformanceMonitor::new(
                MonitorConfig::default(),
                Arc::new(MemorySink::new()),
                Arc::new(RuleBasedExplainer::new()),
                Arc::new(BroadcastPublisher::new(8)),
            )
            .unwrap(),
        );
        let cancel = CancellationToken::new();

        let sampler = tokio::spawn(run_host_sampler(
            Arc::clone(&monitor),
            ScriptedSource::new(Vec::new()),
            Duration::from_secs(10),
            None,
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(35)).await;
        cancel.cancel();
        assert_eq!(sampler.await.unwrap(), 3);
    }
}
