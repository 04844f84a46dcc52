//! Core data model: queries, intents, plans, worker results and run state.
//!
//! Everything here is plain serde data. The run-state document committed to
//! the state store is the JSON projection of [`RunState`]; nodes exchange
//! typed values and the engine serializes them into patches at commit time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// The immutable user input for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub request_id: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            text: text.into(),
            received_at: Utc::now(),
        }
    }
}

/// Classified intent of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Search,
    Calculation,
    Recommendation,
    Consultation,
    Unclear,
    Irrelevant,
    Error,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Search => "search",
            IntentKind::Calculation => "calculation",
            IntentKind::Recommendation => "recommendation",
            IntentKind::Consultation => "consultation",
            IntentKind::Unclear => "unclear",
            IntentKind::Irrelevant => "irrelevant",
            IntentKind::Error => "error",
        }
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Price range in ten-thousand-won units (만원).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PriceRange {
    pub min: Option<u64>,
    pub max: Option<u64>,
}

impl PriceRange {
    pub fn at_most(max: u64) -> Self {
        Self {
            min: None,
            max: Some(max),
        }
    }

    pub fn at_least(min: u64) -> Self {
        Self {
            min: Some(min),
            max: None,
        }
    }

    pub fn around(amount: u64) -> Self {
        Self {
            min: Some(amount),
            max: Some(amount),
        }
    }

    pub fn contains(&self, amount: u64) -> bool {
        self.min.map_or(true, |m| amount >= m) && self.max.map_or(true, |m| amount <= m)
    }
}

/// Floor-area range in square meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SizeRange {
    pub min_m2: Option<f64>,
    pub max_m2: Option<f64>,
}

/// Entities extracted from a query.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Entities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_range: Option<PriceRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_range: Option<SizeRange>,
    /// "sale" | "jeonse" | "monthly_rent"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_type: Option<String>,
    /// "apartment" | "officetel" | "villa" | "studio"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_type: Option<String>,
    /// Entities outside the fixed set, keyed by name.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl Entities {
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn count(&self) -> usize {
        [
            self.location.is_some(),
            self.price_range.is_some(),
            self.size_range.is_some(),
            self.transaction_type.is_some(),
            self.property_type.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count()
            + self.extra.len()
    }
}

/// Query complexity, used by the planner's strategy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    #[default]
    Simple,
    Moderate,
    Complex,
}

/// Output of the analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRecord {
    pub kind: IntentKind,
    #[serde(default)]
    pub entities: Entities,
    /// In [0, 1].
    pub confidence: f64,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Free text for logs only.
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub complexity: Complexity,
}

impl IntentRecord {
    pub fn unclear() -> Self {
        Self {
            kind: IntentKind::Unclear,
            entities: Entities::default(),
            confidence: 0.0,
            keywords: Vec::new(),
            reasoning: String::new(),
            complexity: Complexity::Simple,
        }
    }
}

/// Execution strategy tag for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Sequential,
    Parallel,
    Dag,
}

/// Backoff progression between retries of the same worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Constant,
    Linear,
    #[default]
    Exponential,
}

/// Retry policy attached to a plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffKind,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for StepRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: BackoffKind::Exponential,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl StepRetryPolicy {
    /// Delay before relaunching after `retry_count` completed attempts.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let delay = match self.backoff {
            BackoffKind::Constant => self.initial_delay,
            BackoffKind::Linear => self.initial_delay.saturating_mul(retry_count + 1),
            BackoffKind::Exponential => self
                .initial_delay
                .saturating_mul(2u32.saturating_pow(retry_count)),
        };
        delay.min(self.max_delay)
    }
}

/// One worker invocation within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_id: String,
    pub worker_name: String,
    /// Opaque structured input for the worker.
    pub parameters: Value,
    /// Step ids that must succeed before this step may start.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    pub timeout: Duration,
    #[serde(default)]
    pub retry: StepRetryPolicy,
    /// Static worker priority; higher runs earlier and weighs more in
    /// evaluation.
    pub priority: u32,
    /// Position in program order for sequential execution.
    pub order: u32,
}

/// Structural plan validation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanValidationError {
    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },
    #[error("dependency graph contains a cycle")]
    Cycle,
}

/// The frozen plan for a run. Retries reuse it, restricted to a subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub strategy: Strategy,
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, step_id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn worker_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.worker_name.as_str()).collect()
    }

    /// Check ids, dependency references and acyclicity.
    pub fn validate(&self) -> Result<(), PlanValidationError> {
        let mut seen = BTreeSet::new();
        for step in &self.steps {
            if !seen.insert(step.step_id.as_str()) {
                return Err(PlanValidationError::DuplicateStepId(step.step_id.clone()));
            }
        }
        for step in &self.steps {
            for dep in &step.dependencies {
                if !seen.contains(dep.as_str()) {
                    return Err(PlanValidationError::UnknownDependency {
                        step: step.step_id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Kahn's algorithm. Ready steps are taken in (order, step_id) order so
    /// the result is deterministic.
    pub fn topological_order(&self) -> Result<Vec<String>, PlanValidationError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();

        for step in &self.steps {
            in_degree.entry(step.step_id.as_str()).or_insert(0);
            for dep in &step.dependencies {
                *in_degree.entry(step.step_id.as_str()).or_insert(0) += 1;
                successors
                    .entry(dep.as_str())
                    .or_default()
                    .push(step.step_id.as_str());
            }
        }

        let mut ready: Vec<&PlanStep> = self
            .steps
            .iter()
            .filter(|s| in_degree.get(s.step_id.as_str()) == Some(&0))
            .collect();
        ready.sort_by(|a, b| (a.order, &a.step_id).cmp(&(b.order, &b.step_id)));
        let mut queue: VecDeque<&str> = ready.iter().map(|s| s.step_id.as_str()).collect();

        let mut ordered = Vec::with_capacity(self.steps.len());
        while let Some(id) = queue.pop_front() {
            ordered.push(id.to_string());
            if let Some(next) = successors.get(id) {
                for succ in next {
                    if let Some(degree) = in_degree.get_mut(succ) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(succ);
                        }
                    }
                }
            }
        }

        if ordered.len() != self.steps.len() {
            return Err(PlanValidationError::Cycle);
        }
        Ok(ordered)
    }

    /// The same plan restricted to the given worker names. Dependencies on
    /// removed steps are dropped; the retried worker's ancestors already
    /// succeeded or are being retried themselves.
    pub fn subset(&self, workers: &BTreeSet<String>) -> ExecutionPlan {
        let kept_ids: BTreeSet<&str> = self
            .steps
            .iter()
            .filter(|s| workers.contains(&s.worker_name))
            .map(|s| s.step_id.as_str())
            .collect();

        let steps = self
            .steps
            .iter()
            .filter(|s| workers.contains(&s.worker_name))
            .map(|s| {
                let mut step = s.clone();
                step.dependencies = step
                    .dependencies
                    .iter()
                    .filter(|d| kept_ids.contains(d.as_str()))
                    .cloned()
                    .collect();
                step
            })
            .collect();

        ExecutionPlan {
            strategy: self.strategy,
            steps,
        }
    }
}

/// Terminal status of one worker attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Success,
    Failed,
    Skipped,
    Timeout,
}

/// Why a step was skipped without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UpstreamFailure,
    DependencyFailed,
}

/// Per-step lifecycle status kept in run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Timeout,
}

impl From<WorkerStatus> for StepStatus {
    fn from(status: WorkerStatus) -> Self {
        match status {
            WorkerStatus::Success => StepStatus::Success,
            WorkerStatus::Failed => StepStatus::Failed,
            WorkerStatus::Skipped => StepStatus::Skipped,
            WorkerStatus::Timeout => StepStatus::Timeout,
        }
    }
}

/// The authoritative record of one worker attempt. Retries overwrite the
/// entry and bump `attempt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub worker_name: String,
    pub status: WorkerStatus,
    #[serde(default)]
    pub payload: Value,
    pub confidence: f64,
    pub elapsed: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// 1-based attempt counter across the run.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

impl WorkerResult {
    pub fn is_success(&self) -> bool {
        self.status == WorkerStatus::Success
    }

    pub fn skipped(
        worker_name: impl Into<String>,
        reason: SkipReason,
        attempt: u32,
    ) -> Self {
        Self {
            worker_name: worker_name.into(),
            status: WorkerStatus::Skipped,
            payload: Value::Null,
            confidence: 0.0,
            elapsed: Duration::ZERO,
            error: None,
            skip_reason: Some(reason),
            attempt,
            started_at: Utc::now(),
        }
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Initialized,
    Running,
    AwaitingRetry,
    Completed,
    Failed,
    Cancelled,
}

/// Classification of the final user-visible payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Answer,
    Guidance,
    Error,
    Processed,
}

/// A citation-like reference carried from worker payloads to the answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl SourceRef {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: None,
        }
    }
}

/// Wall-clock spent in one node, recorded in run state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTiming {
    pub node: String,
    pub elapsed_ms: u64,
}

/// The checkpointable document for one thread.
///
/// The state store keeps the JSON projection of this struct; accumulating
/// fields (`worker_results`, `errors`, `error_counts`, `per_node_timings`,
/// `agent_path`, `insights`) are merged by the store's reducers rather than
/// overwritten.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RunState {
    // identifiers
    pub thread_id: String,
    pub session_id: String,
    pub request_id: String,

    // inputs
    pub query: String,
    pub intent: Option<IntentRecord>,

    // plan
    pub execution_plan: Option<ExecutionPlan>,
    pub strategy: Option<Strategy>,
    pub step_cursor: u32,

    // execution
    pub worker_results: BTreeMap<String, WorkerResult>,
    pub failed_workers: BTreeSet<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub step_states: BTreeMap<String, StepStatus>,

    // evaluation
    pub quality_score: f64,
    pub needs_retry: bool,
    pub retry_workers: BTreeSet<String>,
    pub evaluation_notes: Vec<String>,

    // output
    pub final_answer: Option<String>,
    pub sources: Vec<SourceRef>,
    pub response_type: Option<ResponseType>,

    // lifecycle
    pub status: RunStatus,
    pub current_node: String,
    pub errors: BTreeMap<String, String>,
    pub error_counts: BTreeMap<String, i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub per_node_timings: Vec<NodeTiming>,
    pub agent_path: Vec<String>,
    pub insights: Vec<String>,
}

impl RunState {
    pub fn to_doc(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    pub fn from_doc(doc: &Value) -> serde_json::Result<Self> {
        serde_json::from_value(doc.clone())
    }

    /// Names of workers whose latest attempt succeeded.
    pub fn successful_workers(&self) -> BTreeSet<String> {
        self.worker_results
            .values()
            .filter(|r| r.is_success())
            .map(|r| r.worker_name.clone())
            .collect()
    }
}

/// The object every run terminates with, success or not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalPayload {
    pub response_type: ResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<crate::error::ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub thread_id: String,
    pub request_id: String,
    pub retry_count: u32,
    pub quality_score: f64,
}
