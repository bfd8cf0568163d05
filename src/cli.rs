//! Command-line interface.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::batcher::BatcherStatsSnapshot;
use crate::config::MonitorConfig;
use crate::constants::*;
use crate::error::{PerfwatchError, PerfwatchResult};
use crate::events::{BroadcastPublisher, MonitorEvent};
use crate::explain::RuleBasedExplainer;
use crate::host::{run_host_sampler, HostSource};
use crate::logging::TARGET_INIT;
use crate::monitor::PerformanceMonitor;
use crate::query::QueryPatternScanner;
use crate::sink::MemorySink;
use crate::types::RequestObservation;

// ----------------------------------------------------------------------------
// Argument Parser
// ----------------------------------------------------------------------------

/// Perfwatch analysis engine CLI
#[derive(Parser, Debug)]
#[command(
    name = "perfwatch",
    version,
    about = "Adaptive latency baselines and metric batching for API monitoring",
    long_about = "Perfwatch tracks request latency against rolling per-key baselines, \
                  flags statistical outliers, attributes them to host or code, and \
                  batches metric samples into bulk writes."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "perfwatch.toml", env = "PERFWATCH_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "PERFWATCH_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Push synthetic traffic through the monitor and print a summary
    Simulate {
        /// Number of requests to generate
        #[arg(short = 'n', long, default_value_t = 200)]
        requests: usize,

        /// Inject a latency spike every N requests (0 disables spikes)
        #[arg(short, long, default_value_t = 25)]
        spike_every: usize,

        /// Host CPU percentage reported to the monitor
        #[arg(long, default_value_t = 35.0)]
        host_cpu: f64,

        /// Requests tracked concurrently
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Sample this host and feed the readings through the monitor
    Watch {
        /// Stop after N samples (default: until Ctrl-C)
        #[arg(short = 'n', long)]
        samples: Option<u64>,

        /// Sampling interval in milliseconds (default: host.sample_interval_ms)
        #[arg(short, long)]
        interval_ms: Option<u64>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Scan a query for anti-patterns
    ScanQuery {
        /// Query text
        query: String,

        /// Database label
        #[arg(long, default_value = DEFAULT_QUERY_DATABASE)]
        database: String,

        /// Observed execution time in milliseconds
        #[arg(short = 't', long, default_value_t = 0.0)]
        execution_time_ms: f64,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

pub fn handle_validate(config_path: &Path, verbose: bool) -> PerfwatchResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match MonitorConfig::load(config_path) {
        Ok(config) => {
            println!("Configuration is valid");

            if verbose {
                println!();
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!();
            println!("Summary:");
            println!("  window size:         {}", config.baseline.window_size);
            println!("  z-score threshold:   {}", config.baseline.anomaly_zscore_threshold);
            println!("  warm-up samples:     {}", config.baseline.warmup_min_samples);
            println!("  evaluation:          {:?}", config.baseline.evaluation);
            println!("  max batch size:      {}", config.batcher.max_batch_size);
            println!("  flush interval:      {}ms", config.batcher.batch_flush_interval_ms);
            println!("  service:             {}", config.analysis.service_name);
            Ok(())
        }
        Err(e) => {
            println!("Configuration validation failed: {}", e);
            Err(PerfwatchError::Config(e))
        }
    }
}

pub fn handle_generate_config(output: Option<&Path>) -> PerfwatchResult<()> {
    let config_str = MonitorConfig::generate_default_config()?;

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }

    Ok(())
}

pub fn handle_scan_query(query: &str, database: &str, execution_time_ms: f64) -> PerfwatchResult<()> {
    let analysis = QueryPatternScanner::new().analyze(query, database, execution_time_ms);
    let rendered =
        serde_json::to_string_pretty(&analysis).map_err(|e| PerfwatchError::Internal(e.to_string()))?;
    println!("{}", rendered);
    Ok(())
}

pub fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  target: {}", std::env::consts::ARCH);
    println!("  os:     {}", std::env::consts::OS);
}

// ----------------------------------------------------------------------------
// Simulation
// ----------------------------------------------------------------------------

const SIMULATED_PATHS: [&str; 3] = ["/api/users", "/api/orders", "/api/products"];
const SIMULATED_BASE_MS: f64 = 100.0;
const SIMULATED_SPIKE_MS: f64 = 900.0;

#[derive(Debug, Clone, Copy)]
pub struct SimulationPlan {
    pub requests: usize,
    pub spike_every: usize,
    pub host_cpu: f64,
    pub concurrency: usize,
}

impl SimulationPlan {
    /// Deterministic request `index` of the run
    pub fn request(&self, index: usize) -> RequestObservation {
        let path = SIMULATED_PATHS[index % SIMULATED_PATHS.len()];
        let spike = self.spike_every > 0 && index > 0 && index % self.spike_every == 0;
        let duration = if spike {
            SIMULATED_SPIKE_MS
        } else {
            SIMULATED_BASE_MS + (index % 7) as f64 * 2.0
        };
        let status = if index % 50 == 49 { 500 } else { 200 };
        RequestObservation::new("GET", path, status, duration)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationSummary {
    pub requests: usize,
    pub anomalies: usize,
    pub bottlenecks: BTreeMap<String, usize>,
    pub query_analyses: usize,
    pub events: BTreeMap<String, usize>,
    pub metrics_persisted: usize,
    pub batcher: Option<BatcherStatsSnapshot>,
}

/// Drive `plan` through a monitor backed by an in-memory sink.
pub async fn run_simulation(config: MonitorConfig, plan: SimulationPlan) -> PerfwatchResult<SimulationSummary> {
    let sink = Arc::new(MemorySink::new());
    let publisher = Arc::new(BroadcastPublisher::new(config.events.capacity));
    let mut subscriber = publisher.subscribe();

    let counter = tokio::spawn(async move {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        while let Some(event) = subscriber.recv().await {
            *counts.entry(event.name().to_string()).or_default() += 1;
            if let MonitorEvent::BottleneckDetected(bottleneck) = event.as_ref() {
                info!(target: TARGET_INIT, kind = %bottleneck.kind, "Simulated bottleneck");
            }
        }
        counts
    });

    let monitor = PerformanceMonitor::new(
        config,
        sink.clone(),
        Arc::new(RuleBasedExplainer::new()),
        publisher.clone(),
    )?;
    monitor.record_host_cpu(plan.host_cpu);

    let mut summary = SimulationSummary {
        requests: plan.requests,
        ..SimulationSummary::default()
    };

    let indices: Vec<usize> = (0..plan.requests).collect();
    for chunk in indices.chunks(plan.concurrency.max(1)) {
        let requests: Vec<RequestObservation> = chunk.iter().map(|&i| plan.request(i)).collect();
        let reports = join_all(requests.iter().map(|request| monitor.track_request(request))).await;

        for report in reports {
            summary.anomalies += usize::from(report.anomaly);
            summary.query_analyses += usize::from(report.query.is_some());
            if let Some(bottleneck) = report.bottleneck {
                *summary.bottlenecks.entry(bottleneck.kind.to_string()).or_default() += 1;
            }
        }
    }

    monitor.shutdown().await;
    summary.metrics_persisted = sink.metric_count();
    summary.batcher = Some(monitor.batcher().stats());

    drop(monitor);
    drop(publisher);
    summary.events = counter
        .await
        .map_err(|e| PerfwatchError::Internal(format!("event counter failed: {}", e)))?;

    Ok(summary)
}

// ----------------------------------------------------------------------------
// Host Watch
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct WatchSummary {
    pub samples: u64,
    pub bottlenecks: BTreeMap<String, usize>,
    pub metrics_persisted: usize,
    pub last_cpu: Option<f64>,
}

/// Sample `source` through a monitor backed by an in-memory sink until
/// `samples` readings were taken or Ctrl-C is pressed.
pub async fn run_watch<S: HostSource + 'static>(
    config: MonitorConfig,
    source: S,
    samples: Option<u64>,
    every: Duration,
) -> PerfwatchResult<WatchSummary> {
    let sink = Arc::new(MemorySink::new());
    let publisher = Arc::new(BroadcastPublisher::new(config.events.capacity));
    let monitor = Arc::new(PerformanceMonitor::new(
        config,
        sink.clone(),
        Arc::new(RuleBasedExplainer::new()),
        publisher,
    )?);

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => stop.cancel(),
            Err(e) => warn!(target: TARGET_INIT, error = %e, "Ctrl-C handler unavailable"),
        }
    });

    let recorded = run_host_sampler(Arc::clone(&monitor), source, every, samples, cancel.clone()).await;
    cancel.cancel();
    monitor.shutdown().await;

    let mut summary = WatchSummary {
        samples: recorded,
        metrics_persisted: sink.metric_count(),
        last_cpu: monitor.last_host_cpu(),
        ..WatchSummary::default()
    };
    for bottleneck in sink.bottlenecks() {
        *summary.bottlenecks.entry(bottleneck.kind.to_string()).or_default() += 1;
    }

    Ok(summary)
}

pub fn print_watch_summary(summary: &WatchSummary, json: bool) -> PerfwatchResult<()> {
    if json {
        let rendered =
            serde_json::to_string_pretty(summary).map_err(|e| PerfwatchError::Internal(e.to_string()))?;
        println!("{}", rendered);
        return Ok(());
    }

    println!("Host watch summary");
    println!("  samples:           {}", summary.samples);
    if let Some(cpu) = summary.last_cpu {
        println!("  last cpu:          {}%", cpu);
    }
    for (kind, count) in &summary.bottlenecks {
        println!("  bottlenecks[{}]: {}", kind, count);
    }
    println!("  metrics persisted: {}", summary.metrics_persisted);
    Ok(())
}

pub fn print_summary(summary: &SimulationSummary, json: bool) -> PerfwatchResult<()> {
    if json {
        let rendered =
            serde_json::to_string_pretty(summary).map_err(|e| PerfwatchError::Internal(e.to_string()))?;
        println!("{}", rendered);
        return Ok(());
    }

    println!("Simulation summary");
    println!("  requests:          {}", summary.requests);
    println!("  anomalies:         {}", summary.anomalies);
    for (kind, count) in &summary.bottlenecks {
        println!("  bottlenecks[{}]: {}", kind, count);
    }
    println!("  query analyses:    {}", summary.query_analyses);
    println!("  metrics persisted: {}", summary.metrics_persisted);
    for (event, count) in &summary.events {
        println!("  events[{}]: {}", event, count);
    }
    Ok(())
}
