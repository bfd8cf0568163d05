//! Persistence seam for metric batches and bottleneck records.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{SinkError, SinkResult};
use crate::types::{Bottleneck, BufferedMetric, Profile, Regression};

// ----------------------------------------------------------------------------
// Bulk Insert Report
// ----------------------------------------------------------------------------

/// A record the sink refused while storing the rest of its batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    /// Position of the record inside the submitted batch
    pub index: usize,
    pub message: String,
}

/// Outcome of an unordered bulk insert
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkInsertReport {
    pub inserted: usize,
    pub failures: Vec<RecordFailure>,
}

impl BulkInsertReport {
    pub fn all_inserted(count: usize) -> Self {
        Self {
            inserted: count,
            failures: Vec::new(),
        }
    }

    #[inline]
    pub fn submitted(&self) -> usize {
        self.inserted + self.failures.len()
    }

    #[inline]
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Sink Trait
// ----------------------------------------------------------------------------

/// Destination for persisted metrics.
///
/// `bulk_insert` must be unordered: a record-level failure is reported in
/// the returned [`BulkInsertReport`] and must not stop the remaining records
/// from being stored. An `Err` means the whole operation failed.
#[async_trait]
pub trait MetricSink: Send + Sync {
    /// Sink name (for logging)
    fn name(&self) -> &str;

    async fn bulk_insert(&self, records: Vec<BufferedMetric>) -> SinkResult<BulkInsertReport>;

    async fn save_bottleneck(&self, bottleneck: &Bottleneck) -> SinkResult<()>;

    /// Sinks without profile storage accept and discard profiles
    async fn save_profile(&self, _profile: &Profile) -> SinkResult<()> {
        Ok(())
    }

    async fn save_regression(&self, _regression: &Regression) -> SinkResult<()> {
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// In-Memory Sink
// ----------------------------------------------------------------------------

/// Sink that keeps everything in memory.
///
/// Records failing [`BufferedMetric::validate`] are rejected individually,
/// mirroring a document store's schema check under unordered inserts.
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<BufferedMetric>>>,
    bottlenecks: Mutex<Vec<Bottleneck>>,
    profiles: Mutex<Vec<Profile>>,
    regressions: Mutex<Vec<Regression>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored batches, in flush order
    pub fn batches(&self) -> Vec<Vec<BufferedMetric>> {
        self.batches.lock().clone()
    }

    pub fn metric_count(&self) -> usize {
        self.batches.lock().iter().map(Vec::len).sum()
    }

    pub fn bottlenecks(&self) -> Vec<Bottleneck> {
        self.bottlenecks.lock().clone()
    }

    pub fn profiles(&self) -> Vec<Profile> {
        self.profiles.lock().clone()
    }

    pub fn regressions(&self) -> Vec<Regression> {
        self.regressions.lock().clone()
    }
}

#[async_trait]
impl MetricSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn bulk_insert(&self, records: Vec<BufferedMetric>) -> SinkResult<BulkInsertReport> {
        let mut report = BulkInsertReport::default();
        let mut accepted = Vec::with_capacity(records.len());

        for (index, record) in records.into_iter().enumerate() {
            match record.validate() {
                Ok(()) => accepted.push(record),
                Err(defect) => report.failures.push(RecordFailure {
                    index,
                    message: defect.to_string(),
                }),
            }
        }

        report.inserted = accepted.len();
        trace!(sink = self.name(), inserted = report.inserted, rejected = report.failures.len(), "Bulk insert");
        if !accepted.is_empty() {
            self.batches.lock().push(accepted);
        }
        Ok(report)
    }

    async fn save_bottleneck(&self, bottleneck: &Bottleneck) -> SinkResult<()> {
        if bottleneck.service.is_empty() {
            return Err(SinkError::Rejected {
                sink: self.name().into(),
                message: "bottleneck service is required".into(),
            });
        }
        self.bottlenecks.lock().push(bottleneck.clone());
        Ok(())
    }

    async fn save_profile(&self, profile: &Profile) -> SinkResult<()> {
        self.profiles.lock().push(profile.clone());
        Ok(())
    }

    async fn save_regression(&self, regression: &Regression) -> SinkResult<()> {
        if regression.metric.trim().is_empty() {
            return Err(SinkError::Rejected {
                sink: self.name().into(),
                message: "regression metric is required".into(),
            });
        }
        self.regressions.lock().push(regression.clone());
        Ok(())
    }
}
