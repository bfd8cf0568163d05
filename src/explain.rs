//! Bottleneck explanations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExplainError;
use crate::types::{BottleneckDraft, BottleneckKind, Regression, Suggestion};

/// Confidence of the first suggestion; later ones step down
const TOP_CONFIDENCE: f64 = 0.95;
const CONFIDENCE_STEP: f64 = 0.02;
const MIN_CONFIDENCE: f64 = 0.85;

/// Why a bottleneck happened and what to do about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub why: String,
    pub suggestions: Vec<Suggestion>,
}

#[async_trait]
pub trait Explainer: Send + Sync {
    fn name(&self) -> &str;

    async fn explain_bottleneck(&self, draft: &BottleneckDraft) -> Result<Explanation, ExplainError>;

    async fn analyze_regression(&self, regression: &Regression) -> Result<Explanation, ExplainError>;
}

// ----------------------------------------------------------------------------
// Rule-Based Explainer
// ----------------------------------------------------------------------------

const CPU_SUGGESTIONS: &[&str] = &[
    "Identify the hottest functions using the Profiling tool.",
    "Check for synchronous blocks in asynchronous paths.",
    "Consider horizontal scaling if the load is legitimate traffic.",
    "Optimize algorithms with high time complexity (e.g., O(n^2)).",
];

const MEMORY_SUGGESTIONS: &[&str] = &[
    "Perform a heap snapshot to identify large objects.",
    "Check for event listeners that are never removed.",
    "Verify that cache sizes have a maximum limit (eviction policy).",
    "Stream large data sets instead of loading them entirely into memory.",
];

const DATA_LAYER_SUGGESTIONS: &[&str] = &[
    "Analyze slow queries using the Query Optimizer.",
    "Ensure proper indexing on frequently queried columns.",
    "Reduce the number of database roundtrips (e.g., use joins or batching).",
    "Check for disk I/O wait times on the host machine.",
];

const FALLBACK_SUGGESTIONS: &[&str] = &[
    "Review application logs around the detection time.",
    "Verify recent code changes for potential side effects.",
];

const REGRESSION_SUGGESTIONS: &[&str] = &[
    "Compare recent deployment logs with the regression timestamp.",
    "Check if there was an unusual spike in concurrent users.",
    "Monitor upstream dependencies for similar performance drops.",
];

/// Explains bottlenecks from fixed per-kind rules. Never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleBasedExplainer;

impl RuleBasedExplainer {
    pub fn new() -> Self {
        Self
    }

    pub fn explain(&self, draft: &BottleneckDraft) -> Explanation {
        let (why, suggestions) = match draft.kind {
            BottleneckKind::Cpu => (
                format!(
                    "High CPU usage detected at {}. This is often caused by intensive computational tasks, \
                     inefficient loops, or high concurrency without proper resource management.",
                    draft.location
                ),
                CPU_SUGGESTIONS,
            ),
            BottleneckKind::Memory => (
                "High memory usage detected. This could indicate a memory leak, excessive data caching, \
                 or large object allocations that aren't being garbage collected."
                    .to_string(),
                MEMORY_SUGGESTIONS,
            ),
            BottleneckKind::Io | BottleneckKind::Database => (
                "Performance bottleneck in the data layer. Slow I/O or database queries are delaying \
                 the overall response time."
                    .to_string(),
                DATA_LAYER_SUGGESTIONS,
            ),
            BottleneckKind::Network | BottleneckKind::Code => (
                format!("Performance anomaly detected: {}.", draft.description),
                FALLBACK_SUGGESTIONS,
            ),
        };

        Explanation {
            why,
            suggestions: ranked(suggestions),
        }
    }

    pub fn analyze(&self, regression: &Regression) -> Explanation {
        Explanation {
            why: format!(
                "The {} has degraded by {}% compared to the baseline. This regression was detected \
                 during the latest real-time monitoring cycle.",
                regression.metric, regression.degradation.percentage
            ),
            suggestions: ranked(REGRESSION_SUGGESTIONS),
        }
    }
}

fn ranked(recommendations: &[&str]) -> Vec<Suggestion> {
    recommendations
        .iter()
        .enumerate()
        .map(|(rank, recommendation)| Suggestion {
            recommendation: (*recommendation).to_string(),
            confidence: (TOP_CONFIDENCE - CONFIDENCE_STEP * rank as f64).max(MIN_CONFIDENCE),
        })
        .collect()
}

#[async_trait]
impl Explainer for RuleBasedExplainer {
    fn name(&self) -> &str {
        "rule-based"
    }

    async fn explain_bottleneck(&self, draft: &BottleneckDraft) -> Result<Explanation, ExplainError> {
        Ok(self.explain(draft))
    }

    async fn analyze_regression(&self, regression: &Regression) -> Result<Explanation, ExplainError> {
        Ok(self.analyze(regression))
    }
}
