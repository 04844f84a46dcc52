//! The worker contract.
//!
//! Workers are the specialist units the scheduler invokes. They are
//! stateless across invocations, never touch run state directly, and report
//! everything through their returned output. Cancellation and deadlines
//! arrive through [`WorkerContext`]; a worker must honor them promptly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

use crate::context::ContextCarrier;
use crate::types::StepRetryPolicy;

/// Structured input handed to a worker: the plan step's parameters merged
/// with shared run context.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerInput {
    /// The query as the engine currently understands it.
    pub query: String,
    /// The user's verbatim query.
    pub original_query: String,
    /// Parameters from the plan step, opaque to the scheduler.
    #[serde(default)]
    pub parameters: Value,
    /// Payloads of prior workers this step may read (dependency outputs for
    /// DAG consumers, prior successes for sequential tails).
    #[serde(default)]
    pub collected_data: Map<String, Value>,
    /// Optional progress-tracking items.
    #[serde(default)]
    pub todos: Vec<Value>,
}

/// What a worker returns on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOutput {
    /// Opaque structured output; `sources` and `summary` fields, when
    /// present, are consumed by the synthesizer.
    pub payload: Value,
    /// Self-reported confidence in [0, 1].
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl WorkerOutput {
    pub fn new(payload: Value, confidence: f64) -> Self {
        Self {
            payload,
            confidence: confidence.clamp(0.0, 1.0),
            metadata: None,
        }
    }
}

/// Failure reported by a worker itself (as opposed to timeouts and panics,
/// which the scheduler detects).
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{0}")]
    Failed(String),

    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error("upstream data unusable: {0}")]
    BadUpstreamData(String),
}

impl WorkerError {
    pub fn failed(detail: impl Into<String>) -> Self {
        WorkerError::Failed(detail.into())
    }
}

/// Cancellation, deadline and run metadata for one worker invocation.
#[derive(Clone)]
pub struct WorkerContext {
    pub carrier: Arc<ContextCarrier>,
    cancelled: watch::Receiver<bool>,
    deadline: Instant,
}

impl WorkerContext {
    pub fn new(
        carrier: Arc<ContextCarrier>,
        cancelled: watch::Receiver<bool>,
        deadline: Instant,
    ) -> Self {
        Self {
            carrier,
            cancelled,
            deadline,
        }
    }

    /// Whether the run has been cancelled. Workers should check this at
    /// loop boundaries and before expensive calls.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves when the run is cancelled; usable inside `tokio::select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.clone();
        // An error means the sender is gone, which only happens when the
        // run is over; treat it the same as cancellation.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Time left before this step's deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Uniform contract for specialist units.
///
/// Implementations must not hold per-run state and must not reach back into
/// the engine; everything they produce travels through the returned
/// [`WorkerOutput`].
#[async_trait]
pub trait Worker: Send + Sync {
    /// Registry name, unique per engine.
    fn name(&self) -> &str;

    /// Static priority: higher runs earlier and weighs more in evaluation.
    fn priority(&self) -> u32 {
        50
    }

    /// Default per-step timeout, before planner scaling.
    fn default_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    /// Per-step retry policy recorded in the plan.
    fn retry_policy(&self) -> StepRetryPolicy {
        StepRetryPolicy::default()
    }

    async fn execute(
        &self,
        ctx: &WorkerContext,
        input: WorkerInput,
    ) -> Result<WorkerOutput, WorkerError>;
}
