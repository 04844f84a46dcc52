//! Step scheduling: Sequential, Parallel and DAG execution of plan steps.
//!
//! The scheduler owns all concurrency discipline of a run:
//! - workers never touch run state; their results land in a run-local
//!   buffer ([`ScheduleOutcome`]) that the engine commits as one checkpoint;
//! - per-step deadline = min(step timeout, remaining run budget);
//! - panics inside workers are caught at the task join and recorded as
//!   failures, siblings keep running;
//! - a process-wide semaphore caps total in-flight worker invocations
//!   across runs, on top of the per-schedule `max_concurrent` bound;
//! - cancellation stops new launches and propagates to in-flight worker
//!   contexts; results that arrive before the cancel deadline are kept.
//!
//! Ordering: sequential tails preserve program order; DAG edges establish
//! happens-before from producer commit to consumer launch; nothing is
//! guaranteed among concurrent steps of one wave.

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::config::EngineConfig;
use crate::context::ContextCarrier;
use crate::metrics::MetricsRegistry;
use crate::registry::WorkerRegistry;
use crate::stream::{EngineEvent, EventSink};
use crate::types::{
    ExecutionPlan, PlanStep, SkipReason, StepStatus, Strategy, WorkerResult, WorkerStatus,
};
use crate::worker::{WorkerContext, WorkerInput};

/// Run-local result buffer for one scheduling round.
#[derive(Debug, Default)]
pub struct ScheduleOutcome {
    /// Latest attempt per worker name.
    pub results: BTreeMap<String, WorkerResult>,
    /// Workers whose attempt failed or timed out. Skipped steps are not
    /// failures; their ancestor is.
    pub failed: BTreeSet<String>,
    /// Per-step status by step id.
    pub step_states: BTreeMap<String, StepStatus>,
    /// True when the round stopped because the run was cancelled.
    pub cancelled: bool,
}

impl ScheduleOutcome {
    fn record(&mut self, step: &PlanStep, result: WorkerResult) {
        self.step_states
            .insert(step.step_id.clone(), result.status.into());
        if matches!(result.status, WorkerStatus::Failed | WorkerStatus::Timeout) {
            self.failed.insert(step.worker_name.clone());
        }
        self.results.insert(step.worker_name.clone(), result);
    }

    fn record_skipped(&mut self, step: &PlanStep, reason: SkipReason, attempt: u32) {
        self.record(step, WorkerResult::skipped(&step.worker_name, reason, attempt));
    }
}

/// Runs plan steps under the plan's strategy.
#[derive(Clone)]
pub struct Scheduler {
    config: Arc<EngineConfig>,
    registry: Arc<WorkerRegistry>,
    metrics: Arc<MetricsRegistry>,
    /// Process-wide in-flight cap, shared by every run on this engine.
    permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(
        config: Arc<EngineConfig>,
        registry: Arc<WorkerRegistry>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        // Cross-run parallelism is unbounded at the runtime level; the
        // global cap keeps total worker concurrency proportional to the
        // per-run bound.
        let global_cap = config.run.max_concurrent.saturating_mul(4).max(1);
        Self {
            config,
            registry,
            metrics,
            permits: Arc::new(Semaphore::new(global_cap)),
        }
    }

    /// Execute one scheduling round for `plan`.
    ///
    /// `initial_context` carries payloads from earlier rounds (retries see
    /// prior successes); `attempt` stamps result metadata.
    pub async fn run(
        &self,
        plan: &ExecutionPlan,
        initial_context: &Map<String, Value>,
        carrier: Arc<ContextCarrier>,
        cancel: watch::Receiver<bool>,
        run_deadline: Instant,
        attempt: u32,
        events: &EventSink,
    ) -> ScheduleOutcome {
        match plan.strategy {
            Strategy::Sequential => {
                self.run_sequential(plan, initial_context, carrier, cancel, run_deadline, attempt, events)
                    .await
            }
            Strategy::Parallel => {
                self.run_parallel(plan, initial_context, carrier, cancel, run_deadline, attempt, events)
                    .await
            }
            Strategy::Dag => {
                self.run_dag(plan, initial_context, carrier, cancel, run_deadline, attempt, events)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_sequential(
        &self,
        plan: &ExecutionPlan,
        initial_context: &Map<String, Value>,
        carrier: Arc<ContextCarrier>,
        cancel: watch::Receiver<bool>,
        run_deadline: Instant,
        attempt: u32,
        events: &EventSink,
    ) -> ScheduleOutcome {
        let mut outcome = ScheduleOutcome::default();
        let mut steps: Vec<&PlanStep> = plan.steps.iter().collect();
        steps.sort_by(|a, b| (a.order, &a.step_id).cmp(&(b.order, &b.step_id)));

        let mut collected = initial_context.clone();
        let mut iter = steps.into_iter();

        while let Some(step) = iter.next() {
            if *cancel.borrow() {
                outcome.cancelled = true;
                break;
            }

            let result = self
                .execute_step(
                    step.clone(),
                    collected.clone(),
                    Arc::clone(&carrier),
                    cancel.clone(),
                    run_deadline,
                    attempt,
                    events.clone(),
                )
                .await;

            let succeeded = result.is_success();
            if succeeded {
                collected.insert(step.worker_name.clone(), result.payload.clone());
            }
            outcome.record(step, result);

            if !succeeded {
                if *cancel.borrow() {
                    outcome.cancelled = true;
                    break;
                }
                if self.config.run.strict_sequential {
                    tracing::warn!(
                        step = %step.step_id,
                        "sequential step failed in strict mode, aborting tail"
                    );
                } else {
                    for rest in iter.by_ref() {
                        outcome.record_skipped(rest, SkipReason::UpstreamFailure, attempt);
                    }
                }
                break;
            }
        }

        outcome.cancelled = outcome.cancelled || *cancel.borrow();
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_parallel(
        &self,
        plan: &ExecutionPlan,
        initial_context: &Map<String, Value>,
        carrier: Arc<ContextCarrier>,
        cancel: watch::Receiver<bool>,
        run_deadline: Instant,
        attempt: u32,
        events: &EventSink,
    ) -> ScheduleOutcome {
        let mut outcome = ScheduleOutcome::default();
        let mut pending: VecDeque<PlanStep> = VecDeque::new();
        let step_index: HashMap<String, PlanStep> = plan
            .steps
            .iter()
            .map(|s| (s.step_id.clone(), s.clone()))
            .collect();

        let mut runnable: Vec<&PlanStep> = Vec::new();
        for step in &plan.steps {
            if step.dependencies.is_empty() {
                runnable.push(step);
            } else {
                // The planner never emits dependent steps under Parallel.
                tracing::warn!(step = %step.step_id, "dependent step under parallel strategy, skipping");
                outcome.record_skipped(step, SkipReason::DependencyFailed, attempt);
            }
        }
        runnable.sort_by(|a, b| (a.order, &a.step_id).cmp(&(b.order, &b.step_id)));
        pending.extend(runnable.into_iter().cloned());

        let mut running: JoinSet<(String, WorkerResult)> = JoinSet::new();

        loop {
            while running.len() < self.config.run.max_concurrent && !*cancel.borrow() {
                let Some(step) = pending.pop_front() else { break };
                // Parallel siblings read the initial context only.
                let this = self.clone();
                let collected = initial_context.clone();
                let carrier = Arc::clone(&carrier);
                let cancel = cancel.clone();
                let events = events.clone();
                let step_id = step.step_id.clone();
                running.spawn(async move {
                    let result = this
                        .execute_step(step, collected, carrier, cancel, run_deadline, attempt, events)
                        .await;
                    (step_id, result)
                });
            }

            let Some(joined) = running.join_next().await else { break };
            match joined {
                Ok((step_id, result)) => {
                    if let Some(step) = step_index.get(&step_id) {
                        outcome.record(step, result);
                    }
                }
                Err(join_err) => {
                    // Worker panics are caught inside execute_step; the
                    // wrapper task itself never panics.
                    tracing::error!(error = %join_err, "scheduler task join failed");
                }
            }
        }

        if *cancel.borrow() {
            outcome.cancelled = true;
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_dag(
        &self,
        plan: &ExecutionPlan,
        initial_context: &Map<String, Value>,
        carrier: Arc<ContextCarrier>,
        cancel: watch::Receiver<bool>,
        run_deadline: Instant,
        attempt: u32,
        events: &EventSink,
    ) -> ScheduleOutcome {
        let mut outcome = ScheduleOutcome::default();

        let step_index: HashMap<String, PlanStep> = plan
            .steps
            .iter()
            .map(|s| (s.step_id.clone(), s.clone()))
            .collect();

        let mut in_degree: HashMap<String, usize> = HashMap::new();
        let mut successors: HashMap<String, Vec<String>> = HashMap::new();
        for step in &plan.steps {
            in_degree.insert(step.step_id.clone(), step.dependencies.len());
            for dep in &step.dependencies {
                successors
                    .entry(dep.clone())
                    .or_default()
                    .push(step.step_id.clone());
            }
        }

        // Transitive dependency closure per step, for shared-context
        // assembly. Plans are validated acyclic before they get here.
        let ancestors = transitive_ancestors(plan);

        let mut ready: VecDeque<String> = {
            let mut zero: Vec<&PlanStep> = plan
                .steps
                .iter()
                .filter(|s| s.dependencies.is_empty())
                .collect();
            zero.sort_by(|a, b| (a.order, &a.step_id).cmp(&(b.order, &b.step_id)));
            zero.into_iter().map(|s| s.step_id.clone()).collect()
        };

        let mut payload_by_step: HashMap<String, (String, Value)> = HashMap::new();
        let mut dead: BTreeSet<String> = BTreeSet::new();
        let mut launched: BTreeSet<String> = BTreeSet::new();
        let mut running: JoinSet<(String, WorkerResult)> = JoinSet::new();

        loop {
            while running.len() < self.config.run.max_concurrent && !*cancel.borrow() {
                let Some(step_id) = ready.pop_front() else { break };
                if dead.contains(&step_id) {
                    continue;
                }
                let Some(step) = step_index.get(&step_id).cloned() else { continue };

                // Union of payloads from completed direct and transitive
                // dependencies; all of them succeeded or this step would be
                // dead.
                let mut collected = initial_context.clone();
                if let Some(deps) = ancestors.get(&step_id) {
                    for dep in deps {
                        if let Some((worker, payload)) = payload_by_step.get(dep) {
                            collected.insert(worker.clone(), payload.clone());
                        }
                    }
                }

                launched.insert(step_id.clone());
                let this = self.clone();
                let carrier = Arc::clone(&carrier);
                let cancel = cancel.clone();
                let events = events.clone();
                running.spawn(async move {
                    let id = step.step_id.clone();
                    let result = this
                        .execute_step(step, collected, carrier, cancel, run_deadline, attempt, events)
                        .await;
                    (id, result)
                });
            }

            let Some(joined) = running.join_next().await else { break };
            let (step_id, result) = match joined {
                Ok(pair) => pair,
                Err(join_err) => {
                    tracing::error!(error = %join_err, "scheduler task join failed");
                    continue;
                }
            };

            let Some(step) = step_index.get(&step_id) else { continue };
            let succeeded = result.is_success();
            if succeeded {
                payload_by_step.insert(
                    step_id.clone(),
                    (step.worker_name.clone(), result.payload.clone()),
                );
            }
            outcome.record(step, result);

            if succeeded {
                if let Some(next) = successors.get(&step_id) {
                    for succ in next {
                        if let Some(degree) = in_degree.get_mut(succ) {
                            *degree = degree.saturating_sub(1);
                            if *degree == 0 && !dead.contains(succ) {
                                ready.push_back(succ.clone());
                            }
                        }
                    }
                }
            } else {
                // A failed ancestor dooms every transitive successor.
                let mut frontier: VecDeque<String> = successors
                    .get(&step_id)
                    .cloned()
                    .unwrap_or_default()
                    .into();
                while let Some(succ_id) = frontier.pop_front() {
                    if !dead.insert(succ_id.clone()) {
                        continue;
                    }
                    if let Some(succ) = step_index.get(&succ_id) {
                        outcome.record_skipped(succ, SkipReason::DependencyFailed, attempt);
                    }
                    if let Some(next) = successors.get(&succ_id) {
                        frontier.extend(next.iter().cloned());
                    }
                }
            }
        }

        if *cancel.borrow() {
            outcome.cancelled = true;
        } else {
            // Planner validation makes leftovers impossible; anything here
            // is a cycle that slipped through and is fatal for those steps.
            for step in &plan.steps {
                if !outcome.step_states.contains_key(&step.step_id) && !launched.contains(&step.step_id)
                {
                    tracing::error!(step = %step.step_id, "step unreachable after DAG execution");
                    outcome.record(
                        step,
                        WorkerResult {
                            worker_name: step.worker_name.clone(),
                            status: WorkerStatus::Failed,
                            payload: Value::Null,
                            confidence: 0.0,
                            elapsed: Duration::ZERO,
                            error: Some("unreachable step: dependency cycle".to_string()),
                            skip_reason: None,
                            attempt,
                            started_at: Utc::now(),
                        },
                    );
                }
            }
        }

        outcome
    }

    /// Execute one step end to end: registry lookup, deadline, panic
    /// capture, cancellation, metrics and tool events.
    #[allow(clippy::too_many_arguments)]
    async fn execute_step(
        &self,
        step: PlanStep,
        collected: Map<String, Value>,
        carrier: Arc<ContextCarrier>,
        cancel: watch::Receiver<bool>,
        run_deadline: Instant,
        attempt: u32,
        events: EventSink,
    ) -> WorkerResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let name = step.worker_name.clone();

        let failure = |status: WorkerStatus, error: String, elapsed: Duration| WorkerResult {
            worker_name: name.clone(),
            status,
            payload: Value::Null,
            confidence: 0.0,
            elapsed,
            error: Some(error),
            skip_reason: None,
            attempt,
            started_at,
        };

        let worker = match self.registry.get(&name) {
            Ok(worker) => worker,
            Err(err) => {
                // Unknown or disabled worker: recorded, never retried.
                tracing::warn!(worker = %name, error = %err, "worker lookup failed");
                return failure(WorkerStatus::Failed, err.to_string(), Duration::ZERO);
            }
        };

        let budget = run_deadline.saturating_duration_since(Instant::now());
        let deadline = step.timeout.min(budget);
        if deadline.is_zero() {
            return failure(
                WorkerStatus::Timeout,
                "run budget exhausted before launch".to_string(),
                Duration::ZERO,
            );
        }

        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return failure(
                    WorkerStatus::Failed,
                    "scheduler shutting down".to_string(),
                    start.elapsed(),
                )
            }
        };

        events.emit(EngineEvent::tool_start(&name));
        tracing::debug!(
            worker = %name,
            step = %step.step_id,
            attempt,
            timeout_ms = deadline.as_millis() as u64,
            "launching worker"
        );

        let input = WorkerInput {
            query: carrier.query.clone(),
            original_query: carrier.query.clone(),
            parameters: step.parameters.clone(),
            collected_data: collected,
            todos: Vec::new(),
        };
        let ctx = WorkerContext::new(Arc::clone(&carrier), cancel.clone(), Instant::now() + deadline);

        let mut handle = tokio::spawn(async move {
            let _permit = permit;
            worker.execute(&ctx, input).await
        });

        let mut cancel_rx = cancel.clone();
        let result = tokio::select! {
            joined = tokio::time::timeout(deadline, &mut handle) => {
                let elapsed = start.elapsed();
                match joined {
                    Ok(Ok(Ok(output))) => WorkerResult {
                        worker_name: name.clone(),
                        status: WorkerStatus::Success,
                        payload: output.payload,
                        confidence: output.confidence,
                        elapsed,
                        error: None,
                        skip_reason: None,
                        attempt,
                        started_at,
                    },
                    Ok(Ok(Err(worker_err))) => {
                        tracing::warn!(worker = %name, error = %worker_err, "worker failed");
                        failure(WorkerStatus::Failed, worker_err.to_string(), elapsed)
                    }
                    Ok(Err(join_err)) => {
                        let detail = if join_err.is_panic() {
                            format!("worker panicked: {join_err}")
                        } else {
                            format!("worker task aborted: {join_err}")
                        };
                        tracing::error!(worker = %name, detail, "worker did not return");
                        failure(WorkerStatus::Failed, detail, elapsed)
                    }
                    Err(_expired) => {
                        handle.abort();
                        tracing::warn!(
                            worker = %name,
                            timeout_ms = deadline.as_millis() as u64,
                            "worker deadline expired"
                        );
                        failure(
                            WorkerStatus::Timeout,
                            format!("deadline of {}ms expired", deadline.as_millis()),
                            elapsed,
                        )
                    }
                }
            }
            _ = wait_cancelled(&mut cancel_rx) => {
                handle.abort();
                failure(
                    WorkerStatus::Failed,
                    "cancelled before completion".to_string(),
                    start.elapsed(),
                )
            }
        };

        self.metrics
            .record(&name, result.elapsed, result.is_success());
        events.emit(EngineEvent::tool_end(
            &name,
            serde_json::json!({
                "status": result.status,
                "elapsed_ms": result.elapsed.as_millis() as u64,
            }),
        ));

        result
    }
}

/// Resolves only when the run is cancelled. A dropped sender means the run
/// is over normally and must not look like a cancellation.
async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        let already_cancelled = *rx.borrow();
        if already_cancelled {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Transitive dependency closure per step id.
fn transitive_ancestors(plan: &ExecutionPlan) -> HashMap<String, BTreeSet<String>> {
    let mut ancestors: HashMap<String, BTreeSet<String>> = HashMap::new();
    let order = plan
        .topological_order()
        .unwrap_or_else(|_| plan.steps.iter().map(|s| s.step_id.clone()).collect());

    for step_id in order {
        let Some(step) = plan.step(&step_id) else { continue };
        let mut set = BTreeSet::new();
        for dep in &step.dependencies {
            set.insert(dep.clone());
            if let Some(upstream) = ancestors.get(dep) {
                set.extend(upstream.iter().cloned());
            }
        }
        ancestors.insert(step_id, set);
    }
    ancestors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StepRetryPolicy;
    use crate::worker::{Worker, WorkerError, WorkerOutput};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Configurable test worker: may fail, sleep, panic, or record inputs.
    struct TestWorker {
        name: String,
        fail_times: AtomicUsize,
        sleep: Duration,
        panics: bool,
        calls: AtomicUsize,
        seen_collected: Mutex<Vec<Vec<String>>>,
        concurrent: Arc<AtomicUsize>,
        max_concurrent_seen: Arc<AtomicUsize>,
        honor_cancel: bool,
    }

    impl TestWorker {
        fn named(name: &str) -> Self {
            Self {
                name: name.to_string(),
                fail_times: AtomicUsize::new(0),
                sleep: Duration::ZERO,
                panics: false,
                calls: AtomicUsize::new(0),
                seen_collected: Mutex::new(Vec::new()),
                concurrent: Arc::new(AtomicUsize::new(0)),
                max_concurrent_seen: Arc::new(AtomicUsize::new(0)),
                honor_cancel: false,
            }
        }

        fn failing(name: &str, times: usize) -> Self {
            let worker = Self::named(name);
            worker.fail_times.store(times, Ordering::SeqCst);
            worker
        }

        fn sleeping(name: &str, sleep: Duration) -> Self {
            Self {
                sleep,
                ..Self::named(name)
            }
        }
    }

    #[async_trait]
    impl Worker for TestWorker {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(
            &self,
            ctx: &WorkerContext,
            input: WorkerInput,
        ) -> Result<WorkerOutput, WorkerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent_seen.fetch_max(now, Ordering::SeqCst);

            let mut keys: Vec<String> = input.collected_data.keys().cloned().collect();
            keys.sort();
            self.seen_collected.lock().unwrap().push(keys);

            if self.panics {
                self.concurrent.fetch_sub(1, Ordering::SeqCst);
                panic!("intentional test panic");
            }

            if !self.sleep.is_zero() {
                if self.honor_cancel {
                    tokio::select! {
                        _ = tokio::time::sleep(self.sleep) => {}
                        _ = ctx.cancelled() => {
                            self.concurrent.fetch_sub(1, Ordering::SeqCst);
                            return Err(WorkerError::failed("cancelled"));
                        }
                    }
                } else {
                    tokio::time::sleep(self.sleep).await;
                }
            }

            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            let remaining = self.fail_times.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_times.store(remaining - 1, Ordering::SeqCst);
                return Err(WorkerError::failed("injected failure"));
            }

            Ok(WorkerOutput::new(
                json!({"from": self.name, "summary": format!("{} done", self.name)}),
                0.9,
            ))
        }
    }

    fn step(id: &str, worker: &str, order: u32, deps: &[&str]) -> PlanStep {
        PlanStep {
            step_id: id.to_string(),
            worker_name: worker.to_string(),
            parameters: json!({}),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            timeout: Duration::from_secs(5),
            retry: StepRetryPolicy::default(),
            priority: 50,
            order,
        }
    }

    struct Fixture {
        scheduler: Scheduler,
        registry: Arc<WorkerRegistry>,
        cancel_tx: Arc<watch::Sender<bool>>,
        cancel_rx: watch::Receiver<bool>,
        carrier: Arc<ContextCarrier>,
    }

    fn fixture(config: EngineConfig) -> Fixture {
        let config = Arc::new(config);
        let registry = Arc::new(WorkerRegistry::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let scheduler = Scheduler::new(Arc::clone(&config), Arc::clone(&registry), metrics);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Fixture {
            scheduler,
            registry,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            carrier: ContextCarrier::for_testing("sched").bind_run("t", "r", "강남구 시세"),
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    async fn run(fix: &Fixture, plan: &ExecutionPlan) -> ScheduleOutcome {
        fix.scheduler
            .run(
                plan,
                &Map::new(),
                Arc::clone(&fix.carrier),
                fix.cancel_rx.clone(),
                deadline(),
                1,
                &EventSink::disabled(),
            )
            .await
    }

    #[tokio::test]
    async fn sequential_passes_prior_successes_downstream() {
        let fix = fixture(EngineConfig::default());
        let first = Arc::new(TestWorker::named("price_search"));
        let second = Arc::new(TestWorker::named("finance"));
        fix.registry.register(Arc::clone(&first) as Arc<dyn Worker>);
        fix.registry.register(Arc::clone(&second) as Arc<dyn Worker>);

        let plan = ExecutionPlan {
            strategy: Strategy::Sequential,
            steps: vec![step("s1", "price_search", 1, &[]), step("s2", "finance", 2, &[])],
        };

        let outcome = run(&fix, &plan).await;
        assert!(outcome.results["price_search"].is_success());
        assert!(outcome.results["finance"].is_success());
        assert!(outcome.failed.is_empty());

        let seen = second.seen_collected.lock().unwrap();
        assert_eq!(seen[0], vec!["price_search".to_string()]);
    }

    #[tokio::test]
    async fn sequential_failure_skips_tail_with_upstream_reason() {
        let fix = fixture(EngineConfig::default());
        fix.registry
            .register(Arc::new(TestWorker::failing("price_search", 99)) as Arc<dyn Worker>);
        fix.registry
            .register(Arc::new(TestWorker::named("finance")) as Arc<dyn Worker>);

        let plan = ExecutionPlan {
            strategy: Strategy::Sequential,
            steps: vec![step("s1", "price_search", 1, &[]), step("s2", "finance", 2, &[])],
        };

        let outcome = run(&fix, &plan).await;
        assert_eq!(outcome.results["price_search"].status, WorkerStatus::Failed);
        assert_eq!(outcome.results["finance"].status, WorkerStatus::Skipped);
        assert_eq!(
            outcome.results["finance"].skip_reason,
            Some(SkipReason::UpstreamFailure)
        );
        assert_eq!(outcome.failed, BTreeSet::from(["price_search".to_string()]));
        assert_eq!(outcome.step_states["s2"], StepStatus::Skipped);
    }

    #[tokio::test]
    async fn strict_sequential_aborts_without_recording_tail() {
        let mut config = EngineConfig::default();
        config.run.strict_sequential = true;
        let fix = fixture(config);
        fix.registry
            .register(Arc::new(TestWorker::failing("price_search", 99)) as Arc<dyn Worker>);
        fix.registry
            .register(Arc::new(TestWorker::named("finance")) as Arc<dyn Worker>);

        let plan = ExecutionPlan {
            strategy: Strategy::Sequential,
            steps: vec![step("s1", "price_search", 1, &[]), step("s2", "finance", 2, &[])],
        };

        let outcome = run(&fix, &plan).await;
        assert!(!outcome.results.contains_key("finance"));
        assert!(!outcome.step_states.contains_key("s2"));
    }

    #[tokio::test]
    async fn parallel_siblings_continue_past_failures() {
        let fix = fixture(EngineConfig::default());
        fix.registry
            .register(Arc::new(TestWorker::named("price_search")) as Arc<dyn Worker>);
        fix.registry
            .register(Arc::new(TestWorker::failing("finance", 99)) as Arc<dyn Worker>);

        let plan = ExecutionPlan {
            strategy: Strategy::Parallel,
            steps: vec![step("s1", "price_search", 1, &[]), step("s2", "finance", 2, &[])],
        };

        let outcome = run(&fix, &plan).await;
        assert!(outcome.results["price_search"].is_success());
        assert_eq!(outcome.results["finance"].status, WorkerStatus::Failed);
        assert_eq!(outcome.failed, BTreeSet::from(["finance".to_string()]));
    }

    #[tokio::test]
    async fn parallel_respects_max_concurrent() {
        let mut config = EngineConfig::default();
        config.run.max_concurrent = 1;
        let fix = fixture(config);

        let gauge = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let mut steps = Vec::new();
        for i in 0..3 {
            let name = format!("w{i}");
            let mut worker = TestWorker::sleeping(&name, Duration::from_millis(30));
            worker.concurrent = Arc::clone(&gauge);
            worker.max_concurrent_seen = Arc::clone(&max_seen);
            fix.registry.register(Arc::new(worker) as Arc<dyn Worker>);
            steps.push(step(&format!("s{i}"), &name, i as u32, &[]));
        }

        let plan = ExecutionPlan {
            strategy: Strategy::Parallel,
            steps,
        };
        let outcome = run(&fix, &plan).await;
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dag_consumers_see_dependency_payloads() {
        let fix = fixture(EngineConfig::default());
        let price = Arc::new(TestWorker::named("price_search"));
        let finance = Arc::new(TestWorker::named("finance"));
        let legal = Arc::new(TestWorker::named("legal"));
        fix.registry.register(Arc::clone(&price) as Arc<dyn Worker>);
        fix.registry.register(Arc::clone(&finance) as Arc<dyn Worker>);
        fix.registry.register(Arc::clone(&legal) as Arc<dyn Worker>);

        let plan = ExecutionPlan {
            strategy: Strategy::Dag,
            steps: vec![
                step("s1", "price_search", 1, &[]),
                step("s2", "finance", 2, &["s1"]),
                step("s3", "legal", 3, &["s1", "s2"]),
            ],
        };

        let outcome = run(&fix, &plan).await;
        assert_eq!(outcome.failed.len(), 0);
        assert_eq!(outcome.results.len(), 3);

        // finance saw price; legal saw both (direct and transitive).
        assert_eq!(
            finance.seen_collected.lock().unwrap()[0],
            vec!["price_search".to_string()]
        );
        assert_eq!(
            legal.seen_collected.lock().unwrap()[0],
            vec!["finance".to_string(), "price_search".to_string()]
        );
    }

    #[tokio::test]
    async fn dag_failure_skips_transitive_successors() {
        let fix = fixture(EngineConfig::default());
        fix.registry
            .register(Arc::new(TestWorker::failing("price_search", 99)) as Arc<dyn Worker>);
        let finance = Arc::new(TestWorker::named("finance"));
        let legal = Arc::new(TestWorker::named("legal"));
        fix.registry.register(Arc::clone(&finance) as Arc<dyn Worker>);
        fix.registry.register(Arc::clone(&legal) as Arc<dyn Worker>);

        let plan = ExecutionPlan {
            strategy: Strategy::Dag,
            steps: vec![
                step("s1", "price_search", 1, &[]),
                step("s2", "finance", 2, &["s1"]),
                step("s3", "legal", 3, &["s1", "s2"]),
            ],
        };

        let outcome = run(&fix, &plan).await;
        assert_eq!(outcome.results["price_search"].status, WorkerStatus::Failed);
        assert_eq!(outcome.results["finance"].status, WorkerStatus::Skipped);
        assert_eq!(
            outcome.results["finance"].skip_reason,
            Some(SkipReason::DependencyFailed)
        );
        assert_eq!(outcome.results["legal"].status, WorkerStatus::Skipped);
        // skipped steps are not failures
        assert_eq!(outcome.failed, BTreeSet::from(["price_search".to_string()]));
        // the skipped workers never ran
        assert_eq!(finance.calls.load(Ordering::SeqCst), 0);
        assert_eq!(legal.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn step_timeout_is_recorded_as_timeout() {
        let fix = fixture(EngineConfig::default());
        fix.registry.register(
            Arc::new(TestWorker::sleeping("price_search", Duration::from_secs(30))) as Arc<dyn Worker>,
        );

        let mut slow_step = step("s1", "price_search", 1, &[]);
        slow_step.timeout = Duration::from_millis(50);
        let plan = ExecutionPlan {
            strategy: Strategy::Sequential,
            steps: vec![slow_step],
        };

        let outcome = run(&fix, &plan).await;
        assert_eq!(outcome.results["price_search"].status, WorkerStatus::Timeout);
        assert!(outcome.failed.contains("price_search"));
    }

    #[tokio::test]
    async fn worker_panic_is_contained() {
        let fix = fixture(EngineConfig::default());
        let mut panicking = TestWorker::named("price_search");
        panicking.panics = true;
        fix.registry.register(Arc::new(panicking) as Arc<dyn Worker>);
        fix.registry
            .register(Arc::new(TestWorker::named("finance")) as Arc<dyn Worker>);

        let plan = ExecutionPlan {
            strategy: Strategy::Parallel,
            steps: vec![step("s1", "price_search", 1, &[]), step("s2", "finance", 2, &[])],
        };

        let outcome = run(&fix, &plan).await;
        let result = &outcome.results["price_search"];
        assert_eq!(result.status, WorkerStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("panicked"));
        assert!(outcome.results["finance"].is_success());
    }

    #[tokio::test]
    async fn unknown_worker_records_failure_without_running() {
        let fix = fixture(EngineConfig::default());
        let plan = ExecutionPlan {
            strategy: Strategy::Sequential,
            steps: vec![step("s1", "ghost", 1, &[])],
        };

        let outcome = run(&fix, &plan).await;
        let result = &outcome.results["ghost"];
        assert_eq!(result.status, WorkerStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("not available"));
    }

    #[tokio::test]
    async fn cancellation_stops_new_launches_and_reaches_workers() {
        let fix = fixture(EngineConfig::default());
        let mut slow = TestWorker::sleeping("price_search", Duration::from_secs(10));
        slow.honor_cancel = true;
        fix.registry.register(Arc::new(slow) as Arc<dyn Worker>);
        let second = Arc::new(TestWorker::named("finance"));
        fix.registry.register(Arc::clone(&second) as Arc<dyn Worker>);

        let plan = ExecutionPlan {
            strategy: Strategy::Sequential,
            steps: vec![step("s1", "price_search", 1, &[]), step("s2", "finance", 2, &[])],
        };

        let cancel_tx = Arc::clone(&fix.cancel_tx);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = cancel_tx.send(true);
        });

        let outcome = run(&fix, &plan).await;
        assert!(outcome.cancelled);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_run_budget_times_out_without_launch() {
        let fix = fixture(EngineConfig::default());
        let worker = Arc::new(TestWorker::named("price_search"));
        fix.registry.register(Arc::clone(&worker) as Arc<dyn Worker>);

        let plan = ExecutionPlan {
            strategy: Strategy::Sequential,
            steps: vec![step("s1", "price_search", 1, &[])],
        };

        let outcome = fix
            .scheduler
            .run(
                &plan,
                &Map::new(),
                Arc::clone(&fix.carrier),
                fix.cancel_rx.clone(),
                Instant::now(), // budget already spent
                1,
                &EventSink::disabled(),
            )
            .await;

        assert_eq!(outcome.results["price_search"].status, WorkerStatus::Timeout);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 0);
    }
}
