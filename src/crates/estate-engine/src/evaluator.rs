//! Result evaluation and the retry decision.
//!
//! After every scheduling round the evaluator scores the aggregated results
//! and decides whether a retry round is warranted. The policy is rule-based
//! and deterministic:
//! - `quality_score` is the priority-weighted mean confidence of successful
//!   workers;
//! - a retry is warranted while budget remains and either something failed
//!   or quality is below threshold with at least one low-confidence worker;
//! - the retry set is failed workers plus low-confidence successes. Skipped
//!   steps are never retried in isolation; their ancestor is.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::types::{ExecutionPlan, WorkerResult};

/// Outcome of one evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub quality_score: f64,
    pub needs_retry: bool,
    pub retry_workers: BTreeSet<String>,
    pub notes: Vec<String>,
}

/// Scores aggregated results and decides retry or completion.
pub struct Evaluator {
    config: Arc<EngineConfig>,
}

impl Evaluator {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    pub fn evaluate(
        &self,
        plan: &ExecutionPlan,
        results: &BTreeMap<String, WorkerResult>,
        failed: &BTreeSet<String>,
        retry_count: u32,
        max_retries: u32,
    ) -> Evaluation {
        let weight_of = |worker: &str| -> f64 {
            plan.steps
                .iter()
                .find(|s| s.worker_name == worker)
                .map(|s| s.priority as f64)
                .unwrap_or(1.0)
        };

        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        let mut low_confidence: BTreeSet<String> = BTreeSet::new();

        for result in results.values() {
            if !result.is_success() {
                continue;
            }
            let weight = weight_of(&result.worker_name);
            weighted_sum += result.confidence * weight;
            weight_total += weight;
            if result.confidence < self.config.evaluator.low_confidence_threshold {
                low_confidence.insert(result.worker_name.clone());
            }
        }

        let quality_score = if weight_total > 0.0 {
            weighted_sum / weight_total
        } else {
            0.0
        };

        let mut notes = Vec::new();
        let budget_left = retry_count < max_retries;

        let retry_for_failures = !failed.is_empty() && budget_left;
        if retry_for_failures {
            notes.push(format!("{} worker(s) failed", failed.len()));
        }

        let retry_for_quality = quality_score < self.config.evaluator.min_quality_threshold
            && !low_confidence.is_empty()
            && budget_left;
        if retry_for_quality {
            notes.push(format!(
                "quality {:.2} below threshold {:.2}",
                quality_score, self.config.evaluator.min_quality_threshold
            ));
        }

        let needs_retry = retry_for_failures || retry_for_quality;

        let mut retry_workers = BTreeSet::new();
        if needs_retry {
            retry_workers.extend(failed.iter().cloned());
            retry_workers.extend(low_confidence);
        }

        if !needs_retry && !failed.is_empty() {
            notes.push("retry budget exhausted".to_string());
        }

        tracing::debug!(
            quality = quality_score,
            needs_retry,
            retry_workers = ?retry_workers,
            retry_count,
            "evaluation complete"
        );

        Evaluation {
            quality_score,
            needs_retry,
            retry_workers,
            notes,
        }
    }
}
