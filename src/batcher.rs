//! Metric batching.
//!
//! Producers hand samples to [`MetricBatcher::add`]; the batcher coalesces
//! them into bulk inserts against a [`MetricSink`]. A batch is written when
//! the queue reaches `max_batch_size` or when the flush timer armed by the
//! first sample of a batch elapses, whichever happens first.
//!
//! The queue is swapped out under its lock before the sink is awaited, so
//! samples added while a write is in flight land in the next batch and no
//! sample is ever written twice. Failed writes are reported to the
//! [`BatchObserver`] and dropped: telemetry here is lossy by policy.
//!
//! Size-triggered writes and timer tasks are spawned on a [`TaskTracker`],
//! so [`MetricBatcher::shutdown`] returns only once every write that left
//! the queue has reached the sink.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::BatcherConfig;
use crate::error::{PerfwatchError, PerfwatchResult, SinkError};
use crate::logging::TARGET_BATCHER;
use crate::sink::{BulkInsertReport, MetricSink};
use crate::types::BufferedMetric;

// ----------------------------------------------------------------------------
// Flush Outcomes
// ----------------------------------------------------------------------------

/// What started a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    Size,
    Timer,
    Manual,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Manual => "manual",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// Result of a flush attempt. Never an error: a failed write is
/// reported as `Dropped` after the batch has left the queue.
#[derive(Debug, Clone)]
pub enum FlushOutcome {
    /// Nothing was queued; the sink was not called
    Empty,
    /// The sink accepted the batch, possibly rejecting some records
    Persisted(BulkInsertReport),
    /// The whole write failed and the batch was discarded
    Dropped { records: usize, error: SinkError },
}

impl FlushOutcome {
    /// Records that left the queue in this flush
    pub fn records(&self) -> usize {
        match self {
            FlushOutcome::Empty => 0,
            FlushOutcome::Persisted(report) => report.submitted(),
            FlushOutcome::Dropped { records, .. } => *records,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, FlushOutcome::Empty)
    }
}

// ----------------------------------------------------------------------------
// Observer
// ----------------------------------------------------------------------------

/// Receives the outcome of every non-empty flush.
pub trait BatchObserver: Send + Sync {
    fn on_persisted(&self, trigger: FlushTrigger, report: &BulkInsertReport);

    fn on_dropped(&self, trigger: FlushTrigger, records: usize, error: &SinkError);
}

/// Default observer: structured log lines
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl BatchObserver for TracingObserver {
    fn on_persisted(&self, trigger: FlushTrigger, report: &BulkInsertReport) {
        if report.is_partial() {
            warn!(
                target: TARGET_BATCHER,
                trigger = trigger.as_str(),
                inserted = report.inserted,
                rejected = report.failures.len(),
                "Batch partially saved"
            );
        } else {
            debug!(
                target: TARGET_BATCHER,
                trigger = trigger.as_str(),
                inserted = report.inserted,
                "Batch saved"
            );
        }
    }

    fn on_dropped(&self, trigger: FlushTrigger, records: usize, error: &SinkError) {
        error!(
            target: TARGET_BATCHER,
            trigger = trigger.as_str(),
            records,
            error = %error,
            "Failed to save batch, dropping records"
        );
    }
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BatcherStats {
    enqueued: AtomicU64,
    batches: AtomicU64,
    persisted: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    size_flushes: AtomicU64,
    timer_flushes: AtomicU64,
}

impl BatcherStats {
    fn record_flush(&self, trigger: FlushTrigger) {
        self.batches.fetch_add(1, AtomicOrdering::Relaxed);
        match trigger {
            FlushTrigger::Size => self.size_flushes.fetch_add(1, AtomicOrdering::Relaxed),
            FlushTrigger::Timer => self.timer_flushes.fetch_add(1, AtomicOrdering::Relaxed),
            FlushTrigger::Manual | FlushTrigger::Shutdown => 0,
        };
    }

    fn snapshot(&self, pending: usize) -> BatcherStatsSnapshot {
        BatcherStatsSnapshot {
            enqueued: self.enqueued.load(AtomicOrdering::Relaxed),
            batches: self.batches.load(AtomicOrdering::Relaxed),
            persisted: self.persisted.load(AtomicOrdering::Relaxed),
            rejected: self.rejected.load(AtomicOrdering::Relaxed),
            dropped: self.dropped.load(AtomicOrdering::Relaxed),
            size_flushes: self.size_flushes.load(AtomicOrdering::Relaxed),
            timer_flushes: self.timer_flushes.load(AtomicOrdering::Relaxed),
            pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatcherStatsSnapshot {
    pub enqueued: u64,
    /// Non-empty flushes handed to the sink
    pub batches: u64,
    pub persisted: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub size_flushes: u64,
    pub timer_flushes: u64,
    pub pending: usize,
}

// ----------------------------------------------------------------------------
// Metric Batcher
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct ArmedTimer {
    generation: u64,
    cancel: CancellationToken,
}

struct BatcherInner {
    config: BatcherConfig,
    queue: Mutex<Vec<BufferedMetric>>,
    timer: Mutex<Option<ArmedTimer>>,
    generation: AtomicU64,
    sink: Arc<dyn MetricSink>,
    observer: Arc<dyn BatchObserver>,
    stats: BatcherStats,
    tasks: TaskTracker,
    runtime: Handle,
}

/// Coalesces metric samples into bulk writes.
///
/// Cloning is cheap and every clone feeds the same queue.
#[derive(Clone)]
pub struct MetricBatcher {
    inner: Arc<BatcherInner>,
}

impl MetricBatcher {
    /// Create a batcher that logs flush outcomes through `tracing`.
    /// Must be called from within a tokio runtime.
    pub fn new(config: BatcherConfig, sink: Arc<dyn MetricSink>) -> PerfwatchResult<Self> {
        Self::with_observer(config, sink, Arc::new(TracingObserver))
    }

    pub fn with_observer(
        config: BatcherConfig,
        sink: Arc<dyn MetricSink>,
        observer: Arc<dyn BatchObserver>,
    ) -> PerfwatchResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| PerfwatchError::NoRuntime {
            component: "metric batcher",
        })?;

        Ok(Self {
            inner: Arc::new(BatcherInner {
                queue: Mutex::new(Vec::with_capacity(config.max_batch_size)),
                config,
                timer: Mutex::new(None),
                generation: AtomicU64::new(0),
                sink,
                observer,
                stats: BatcherStats::default(),
                tasks: TaskTracker::new(),
                runtime,
            }),
        })
    }

    #[inline]
    pub fn config(&self) -> &BatcherConfig {
        &self.inner.config
    }

    /// Queue a sample. Never blocks on the sink.
    ///
    /// Reaching `max_batch_size` cancels the armed timer and writes the full
    /// batch on a background task; otherwise a flush timer is armed if none
    /// is pending.
    pub fn add(&self, sample: BufferedMetric) {
        let inner = &self.inner;
        inner.stats.enqueued.fetch_add(1, AtomicOrdering::Relaxed);

        let full_batch = {
            let mut queue = inner.queue.lock();
            queue.push(sample);
            if queue.len() >= inner.config.max_batch_size {
                inner.disarm_timer();
                Some(mem::replace(&mut *queue, Vec::with_capacity(inner.config.max_batch_size)))
            } else {
                inner.arm_timer_if_idle();
                None
            }
        };

        if let Some(batch) = full_batch {
            let task_inner = Arc::clone(inner);
            inner.tasks.spawn_on(
                async move {
                    task_inner.persist(batch, FlushTrigger::Size).await;
                },
                &inner.runtime,
            );
        }
    }

    /// Write everything queued so far.
    pub async fn flush(&self) -> FlushOutcome {
        self.inner.flush(FlushTrigger::Manual).await
    }

    /// Cancel the timer, write whatever is left and wait for writes
    /// already in flight. The returned outcome covers the final flush only.
    pub async fn shutdown(&self) -> FlushOutcome {
        let outcome = self.inner.flush(FlushTrigger::Shutdown).await;

        let tasks = &self.inner.tasks;
        let in_flight = tasks.len();
        tasks.close();
        tasks.wait().await;
        // later adds still spawn onto the tracker
        tasks.reopen();

        info!(
            target: TARGET_BATCHER,
            records = outcome.records(),
            in_flight,
            "Metric batcher drained"
        );
        outcome
    }

    /// Size-triggered writes and timers not finished yet
    pub fn in_flight(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Samples waiting for the next flush
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn has_armed_timer(&self) -> bool {
        self.inner.timer.lock().is_some()
    }

    pub fn stats(&self) -> BatcherStatsSnapshot {
        self.inner.stats.snapshot(self.pending())
    }
}

impl std::fmt::Debug for MetricBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricBatcher")
            .field("config", &self.inner.config)
            .field("sink", &self.inner.sink.name())
            .field("pending", &self.pending())
            .field("timer_armed", &self.has_armed_timer())
            .finish()
    }
}

// Lock order: `queue` may be held while taking `timer`, never the reverse.
impl BatcherInner {
    fn arm_timer_if_idle(self: &Arc<Self>) {
        let mut slot = self.timer.lock();
        if slot.is_some() {
            return;
        }

        let generation = self.generation.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        *slot = Some(ArmedTimer {
            generation,
            cancel: cancel.clone(),
        });
        drop(slot);

        let inner = Arc::clone(self);
        let interval = self.config.flush_interval();
        self.tasks.spawn_on(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(interval) => inner.fire_timer(generation).await,
                }
            },
            &self.runtime,
        );
    }

    /// Cancel the armed timer, if any. Idempotent.
    fn disarm_timer(&self) -> bool {
        match self.timer.lock().take() {
            Some(timer) => {
                timer.cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn fire_timer(&self, generation: u64) {
        let batch = {
            let mut queue = self.queue.lock();
            let mut slot = self.timer.lock();
            match slot.as_ref() {
                Some(timer) if timer.generation == generation => *slot = None,
                // cancelled or replaced after the sleep elapsed
                _ => return,
            }
            mem::take(&mut *queue)
        };

        if !batch.is_empty() {
            self.persist(batch, FlushTrigger::Timer).await;
        }
    }

    async fn flush(&self, trigger: FlushTrigger) -> FlushOutcome {
        let batch = {
            let mut queue = self.queue.lock();
            self.disarm_timer();
            mem::take(&mut *queue)
        };

        if batch.is_empty() {
            return FlushOutcome::Empty;
        }
        self.persist(batch, trigger).await
    }

    async fn persist(&self, batch: Vec<BufferedMetric>, trigger: FlushTrigger) -> FlushOutcome {
        let records = batch.len();
        self.stats.record_flush(trigger);

        match self.sink.bulk_insert(batch).await {
            Ok(report) => {
                self.stats.persisted.fetch_add(report.inserted as u64, AtomicOrdering::Relaxed);
                self.stats.rejected.fetch_add(report.failures.len() as u64, AtomicOrdering::Relaxed);
                self.observer.on_persisted(trigger, &report);
                FlushOutcome::Persisted(report)
            }
            Err(error) => {
                self.stats.dropped.fetch_add(records as u64, AtomicOrdering::Relaxed);
                self.observer.on_dropped(trigger, records, &error);
                FlushOutcome::Dropped { records, error }
            }
        }
    }
}
