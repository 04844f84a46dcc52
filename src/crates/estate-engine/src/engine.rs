//! The top-level workflow engine.
//!
//! One engine is constructed per process with its collaborators injected
//! (registry, state store, optional LLM client); each `execute` call drives
//! one run through the state machine
//!
//! ```text
//! initialized → analyzing → planning → scheduling → evaluating
//!                  │                       ▲            │
//!                  │                       └── retry ────┘
//!                  └→ (guidance)                     → synthesizing
//!                                 → completed | failed | cancelled
//! ```
//!
//! State updates from every node are checkpointed before the next edge is
//! taken, so a run whose process died mid-flight is inspectable and
//! resumable from its last committed state. The engine always returns a
//! result object; terminal failures carry an error kind instead of raising.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;
use uuid::Uuid;

use crate::analyzer::Analyzer;
use crate::cache::ResultCache;
use crate::config::EngineConfig;
use crate::context::ContextCarrier;
use crate::error::{EngineError, ErrorKind, Result};
use crate::evaluator::Evaluator;
use crate::metrics::MetricsRegistry;
use crate::planner::Planner;
use crate::registry::WorkerRegistry;
use crate::scheduler::Scheduler;
use crate::stream::{EngineEvent, EventSink};
use crate::synthesizer::Synthesizer;
use crate::types::{
    ExecutionPlan, FinalPayload, IntentKind, IntentRecord, Query, ResponseType, RunState,
    RunStatus, StepStatus, WorkerStatus,
};
use estate_llm::LlmClient;
use estate_state::{InMemoryStateStore, StatePatch, StateStore, StateStoreError, ThreadSummary};

/// Per-call options for [`WorkflowEngine::execute`].
#[derive(Default)]
pub struct RunOptions {
    /// Continue an existing conversation thread, or start a fresh one.
    pub thread_id: Option<String>,
    /// Caller-side cancellation signal; flip to `true` to cancel the run.
    pub cancel: Option<watch::Receiver<bool>>,
}

/// Builder for [`WorkflowEngine`]. Everything is injected; there are no
/// process-wide singletons, so tests construct a fresh engine per case.
pub struct WorkflowEngineBuilder {
    config: EngineConfig,
    registry: Option<Arc<WorkerRegistry>>,
    store: Option<Arc<dyn StateStore>>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl WorkflowEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            registry: None,
            store: None,
            llm: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: Arc<WorkerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn build(self) -> Result<WorkflowEngine> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let registry = self.registry.unwrap_or_else(|| Arc::new(WorkerRegistry::new()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStateStore::new()) as Arc<dyn StateStore>);
        let metrics = Arc::new(MetricsRegistry::new());

        Ok(WorkflowEngine {
            scheduler: Scheduler::new(Arc::clone(&config), Arc::clone(&registry), Arc::clone(&metrics)),
            analyzer: Analyzer::new(Arc::clone(&config), self.llm.clone()),
            planner: Planner::new(Arc::clone(&config), self.llm.clone()),
            evaluator: Evaluator::new(Arc::clone(&config)),
            synthesizer: Synthesizer::new(Arc::clone(&config), self.llm.clone()),
            cache: ResultCache::new(config.cache.clone()),
            config,
            registry,
            store,
            metrics,
            closed: AtomicBool::new(false),
        })
    }
}

impl Default for WorkflowEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives queries from ingestion through answer synthesis.
pub struct WorkflowEngine {
    config: Arc<EngineConfig>,
    registry: Arc<WorkerRegistry>,
    store: Arc<dyn StateStore>,
    scheduler: Scheduler,
    analyzer: Analyzer,
    planner: Planner,
    evaluator: Evaluator,
    synthesizer: Synthesizer,
    cache: ResultCache,
    metrics: Arc<MetricsRegistry>,
    closed: AtomicBool,
}

impl WorkflowEngine {
    pub fn builder() -> WorkflowEngineBuilder {
        WorkflowEngineBuilder::new()
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Blocking run returning the full final payload.
    pub async fn execute(
        &self,
        principal: &ContextCarrier,
        query: &str,
        options: RunOptions,
    ) -> FinalPayload {
        self.run(principal, query, options, EventSink::disabled())
            .await
    }

    /// Lazy event sequence for one run: node boundaries, tool invocations,
    /// answer tokens and errors. Finite; not restartable.
    pub fn stream_events(
        self: &Arc<Self>,
        principal: ContextCarrier,
        query: String,
        options: RunOptions,
    ) -> impl Stream<Item = EngineEvent> + Send + Unpin {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let sink = EventSink::attached(tx);
            let _ = engine.run(&principal, &query, options, sink).await;
        });
        UnboundedReceiverStream::new(rx)
    }

    /// Latest committed state for a thread, if any.
    pub async fn get_state(&self, thread_id: &str) -> Result<Option<RunState>> {
        match self.store.load(thread_id).await {
            Ok(versioned) => Ok(Some(RunState::from_doc(&versioned.doc).map_err(
                |err| EngineError::StateStore(StateStoreError::Corrupted {
                    thread_id: thread_id.to_string(),
                    detail: err.to_string(),
                }),
            )?)),
            Err(StateStoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list_threads(&self, session_id: &str, limit: usize) -> Result<Vec<ThreadSummary>> {
        Ok(self.store.list_threads(session_id, limit).await?)
    }

    pub async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        Ok(self.store.delete(thread_id).await?)
    }

    /// Stop accepting new runs. In-flight runs finish normally.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn run(
        &self,
        principal: &ContextCarrier,
        query: &str,
        options: RunOptions,
        events: EventSink,
    ) -> FinalPayload {
        let query = Query::new(query);
        let request_id = query.request_id.clone();
        let thread_id = options
            .thread_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", principal.session_id, Uuid::new_v4()));

        if self.closed.load(Ordering::SeqCst) {
            return error_payload(
                &thread_id,
                &request_id,
                ErrorKind::InvalidInput,
                "engine is closed".to_string(),
                0,
            );
        }

        let trimmed = query.text.trim();
        if trimmed.is_empty() {
            events.emit(EngineEvent::error("empty query"));
            return error_payload(
                &thread_id,
                &request_id,
                ErrorKind::InvalidInput,
                "query is empty".to_string(),
                0,
            );
        }
        if trimmed.chars().count() > self.config.run.max_query_length {
            events.emit(EngineEvent::error("query too long"));
            return error_payload(
                &thread_id,
                &request_id,
                ErrorKind::InvalidInput,
                format!(
                    "query exceeds {} characters",
                    self.config.run.max_query_length
                ),
                0,
            );
        }

        let fingerprint = ResultCache::fingerprint(
            trimmed,
            &principal.user_id,
            &principal.session_id,
            &principal.language,
        );
        if let Some(cached) = self.cache.get(&fingerprint) {
            tracing::info!(thread_id = %cached.thread_id, "cache hit, returning stored payload");
            return cached;
        }

        let carrier = principal.bind_run(&thread_id, &request_id, trimmed);

        // The engine owns the cancellation channel; a caller-provided signal
        // is forwarded into it.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        if let Some(mut external) = options.cancel {
            let forward = Arc::clone(&cancel_tx);
            tokio::spawn(async move {
                if external.wait_for(|cancelled| *cancelled).await.is_ok() {
                    let _ = forward.send(true);
                }
            });
        }

        let run_start = Instant::now();
        let run_deadline = run_start + self.config.run.total_run_timeout;

        let mut run = Run {
            engine: self,
            carrier,
            events,
            cancel_rx,
            run_deadline,
            version: 0,
            state: RunState {
                thread_id: thread_id.clone(),
                session_id: principal.session_id.clone(),
                request_id: request_id.clone(),
                query: trimmed.to_string(),
                status: RunStatus::Initialized,
                max_retries: self.config.run.max_retries,
                started_at: Some(query.received_at),
                current_node: "ingest".to_string(),
                agent_path: vec!["ingest".to_string()],
                ..RunState::default()
            },
        };

        let payload = match run.drive().await {
            Ok(payload) => payload,
            Err(err) => run.fail(err).await,
        };

        self.metrics.record(
            "run",
            run_start.elapsed(),
            payload.response_type != ResponseType::Error,
        );

        if payload.response_type == ResponseType::Answer {
            self.cache.put(fingerprint, payload.clone());
        }
        payload
    }
}

/// One in-flight run: local state plus checkpoint bookkeeping.
struct Run<'a> {
    engine: &'a WorkflowEngine,
    carrier: Arc<ContextCarrier>,
    events: EventSink,
    cancel_rx: watch::Receiver<bool>,
    run_deadline: Instant,
    version: u64,
    state: RunState,
}

impl Run<'_> {
    async fn drive(&mut self) -> Result<FinalPayload> {
        self.checkpoint_initial().await?;

        // ---- analyze ----------------------------------------------------
        let intent = self.node_analyze().await?;
        if *self.cancel_rx.borrow() {
            return Ok(self.cancel_run().await);
        }

        if intent.kind == IntentKind::Error {
            return Err(EngineError::Intent(intent.reasoning.clone()));
        }
        if matches!(intent.kind, IntentKind::Irrelevant | IntentKind::Unclear) {
            // Planner never runs for out-of-domain or vague queries.
            return self.complete_with_guidance(&intent).await;
        }

        // ---- plan -------------------------------------------------------
        let plan = self.node_plan(&intent).await?;
        if *self.cancel_rx.borrow() {
            return Ok(self.cancel_run().await);
        }
        if plan.is_empty() {
            return self.complete_with_guidance(&intent).await;
        }

        // ---- schedule / evaluate loop ----------------------------------
        let mut retry_set: BTreeSet<String> = BTreeSet::new();
        loop {
            let slice = if retry_set.is_empty() {
                plan.clone()
            } else {
                plan.subset(&retry_set)
            };

            self.node_schedule(&slice).await?;

            if *self.cancel_rx.borrow() {
                return Ok(self.cancel_run().await);
            }
            if Instant::now() >= self.run_deadline {
                return Err(EngineError::RunTimeout {
                    budget_ms: self.engine.config.run.total_run_timeout.as_millis() as u64,
                });
            }

            let evaluation = self.node_evaluate(&plan).await?;

            // Unknown or disabled workers never trigger retry; a retry
            // round only makes sense for workers that can actually run.
            let mut retryable = evaluation.retry_workers.clone();
            retryable.retain(|worker| self.engine.registry.is_available(worker));

            let retry_count = self.state.retry_count;
            if evaluation.needs_retry && !retryable.is_empty() && retry_count < self.state.max_retries
            {
                self.state.retry_count = retry_count + 1;
                self.state.status = RunStatus::AwaitingRetry;
                self.commit(
                    StatePatch::new()
                        .set("retry_count", json!(self.state.retry_count))
                        .set("status", val(&RunStatus::AwaitingRetry)),
                )
                .await?;

                retry_set = retryable;
                let remaining = self
                    .run_deadline
                    .saturating_duration_since(Instant::now());
                let delay = self
                    .engine
                    .config
                    .retry
                    .backoff
                    .delay_for(self.state.retry_count - 1)
                    .min(remaining);
                tracing::info!(
                    retry_count = self.state.retry_count,
                    workers = ?retry_set,
                    delay_ms = delay.as_millis() as u64,
                    "retrying failed subset"
                );
                tokio::time::sleep(delay).await;
                continue;
            }
            break;
        }

        // ---- terminal decision -----------------------------------------
        let successes = self.state.successful_workers();
        if successes.is_empty() {
            let all_timeouts = self
                .state
                .worker_results
                .values()
                .filter(|r| !r.is_success() && r.status != WorkerStatus::Skipped)
                .all(|r| r.status == WorkerStatus::Timeout);
            let worker = self
                .state
                .failed_workers
                .iter()
                .next()
                .cloned()
                .unwrap_or_default();
            return Err(if all_timeouts && !self.state.failed_workers.is_empty() {
                EngineError::WorkerTimeout {
                    worker,
                    elapsed_ms: 0,
                }
            } else {
                EngineError::WorkerFailed {
                    worker,
                    detail: "no worker produced a usable result".to_string(),
                }
            });
        }

        // ---- synthesize -------------------------------------------------
        self.node_synthesize(&intent, &plan).await
    }

    async fn checkpoint_initial(&mut self) -> Result<()> {
        if !self.engine.config.run.checkpoint_enabled {
            return Ok(());
        }

        self.version = match self.engine.store.load(&self.state.thread_id).await {
            Ok(versioned) => versioned.version,
            Err(StateStoreError::NotFound(_)) => 0,
            Err(err) => return Err(err.into()),
        };

        let doc = self
            .state
            .to_doc()
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        self.version = self
            .engine
            .store
            .commit(&self.state.thread_id, self.version, StatePatch::replace_with(doc))
            .await?;
        Ok(())
    }

    async fn commit(&mut self, patch: StatePatch) -> Result<()> {
        if !self.engine.config.run.checkpoint_enabled {
            return Ok(());
        }
        self.version = self
            .engine
            .store
            .commit(&self.state.thread_id, self.version, patch)
            .await?;
        Ok(())
    }

    async fn node_analyze(&mut self) -> Result<IntentRecord> {
        self.events.emit(EngineEvent::node_start("analyze"));
        let node_start = Instant::now();

        self.state.status = RunStatus::Running;
        self.state.current_node = "analyze".to_string();

        let intent = self
            .engine
            .analyzer
            .analyze(&self.state.query, &self.carrier)
            .await;

        let elapsed_ms = node_start.elapsed().as_millis() as u64;
        self.state.intent = Some(intent.clone());
        self.state.agent_path.push("analyze".to_string());
        self.state
            .per_node_timings
            .push(crate::types::NodeTiming {
                node: "analyze".to_string(),
                elapsed_ms,
            });

        self.commit(
            StatePatch::new()
                .set("status", val(&RunStatus::Running))
                .set("current_node", json!("analyze"))
                .set("intent", val(&intent))
                .set("agent_path", json!(["analyze"]))
                .set(
                    "per_node_timings",
                    json!([{"node": "analyze", "elapsed_ms": elapsed_ms}]),
                ),
        )
        .await?;

        self.events.emit(EngineEvent::node_end(
            "analyze",
            json!({"kind": intent.kind, "confidence": intent.confidence}),
        ));
        tracing::info!(
            thread_id = %self.state.thread_id,
            kind = %intent.kind,
            confidence = intent.confidence,
            "intent analyzed"
        );
        Ok(intent)
    }

    async fn node_plan(&mut self, intent: &IntentRecord) -> Result<ExecutionPlan> {
        self.events.emit(EngineEvent::node_start("plan"));
        let node_start = Instant::now();

        self.state.current_node = "plan".to_string();
        let plan = self
            .engine
            .planner
            .plan(intent, &self.engine.registry)
            .await?;

        let elapsed_ms = node_start.elapsed().as_millis() as u64;
        self.state.execution_plan = Some(plan.clone());
        self.state.strategy = Some(plan.strategy);
        for step in &plan.steps {
            self.state
                .step_states
                .insert(step.step_id.clone(), StepStatus::Pending);
        }
        self.state.agent_path.push("plan".to_string());

        self.commit(
            StatePatch::new()
                .set("current_node", json!("plan"))
                .set("execution_plan", val(&plan))
                .set("strategy", val(&plan.strategy))
                .set("step_states", val(&self.state.step_states))
                .set("agent_path", json!(["plan"]))
                .set(
                    "per_node_timings",
                    json!([{"node": "plan", "elapsed_ms": elapsed_ms}]),
                ),
        )
        .await?;

        self.events.emit(EngineEvent::node_end(
            "plan",
            json!({"workers": plan.worker_names(), "strategy": plan.strategy}),
        ));
        Ok(plan)
    }

    async fn node_schedule(&mut self, slice: &ExecutionPlan) -> Result<()> {
        self.events.emit(EngineEvent::node_start("schedule"));
        let node_start = Instant::now();
        self.state.current_node = "schedule".to_string();
        self.state.status = RunStatus::Running;

        // Retry rounds see payloads of earlier successes.
        let mut shared = Map::new();
        for result in self.state.worker_results.values() {
            if result.is_success() {
                shared.insert(result.worker_name.clone(), result.payload.clone());
            }
        }

        let outcome = self
            .engine
            .scheduler
            .run(
                slice,
                &shared,
                Arc::clone(&self.carrier),
                self.cancel_rx.clone(),
                self.run_deadline,
                self.state.retry_count + 1,
                &self.events,
            )
            .await;

        // Fold the round buffer into local state; the store merges the same
        // data through its reducers.
        let mut round_results = Map::new();
        let mut round_errors = Map::new();
        let mut round_counts: Map<String, Value> = Map::new();
        for (name, result) in &outcome.results {
            round_results.insert(name.clone(), val(result));
            if let Some(error) = &result.error {
                round_errors.insert(name.clone(), json!(error));
            }
            let kind = match result.status {
                WorkerStatus::Failed => Some(ErrorKind::WorkerFailed),
                WorkerStatus::Timeout => Some(ErrorKind::WorkerTimeout),
                WorkerStatus::Skipped
                    if result.skip_reason
                        == Some(crate::types::SkipReason::DependencyFailed) =>
                {
                    Some(ErrorKind::DependencyFailed)
                }
                _ => None,
            };
            if let Some(kind) = kind {
                let count = round_counts
                    .get(kind.as_str())
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                round_counts.insert(kind.as_str().to_string(), json!(count + 1));
            }

            self.state.worker_results.insert(name.clone(), result.clone());
            if let Some(error) = &result.error {
                self.state.errors.insert(name.clone(), error.clone());
            }
        }
        for (id, status) in &outcome.step_states {
            self.state.step_states.insert(id.clone(), *status);
        }
        self.state.failed_workers = self
            .state
            .worker_results
            .values()
            .filter(|r| matches!(r.status, WorkerStatus::Failed | WorkerStatus::Timeout))
            .map(|r| r.worker_name.clone())
            .collect();
        for (kind, count) in &round_counts {
            let entry = self.state.error_counts.entry(kind.clone()).or_insert(0);
            *entry += count.as_i64().unwrap_or(0);
        }
        self.state.step_cursor = self
            .state
            .step_states
            .values()
            .filter(|s| !matches!(s, StepStatus::Pending | StepStatus::Running))
            .count() as u32;
        self.state.agent_path.push("schedule".to_string());

        let elapsed_ms = node_start.elapsed().as_millis() as u64;
        self.commit(
            StatePatch::new()
                .set("status", val(&RunStatus::Running))
                .set("current_node", json!("schedule"))
                .set("worker_results", Value::Object(round_results))
                .set("errors", Value::Object(round_errors))
                .set("error_counts", Value::Object(round_counts))
                .set("failed_workers", val(&self.state.failed_workers))
                .set("step_states", val(&self.state.step_states))
                .set("step_cursor", json!(self.state.step_cursor))
                .set("agent_path", json!(["schedule"]))
                .set(
                    "per_node_timings",
                    json!([{"node": "schedule", "elapsed_ms": elapsed_ms}]),
                ),
        )
        .await?;

        if outcome.cancelled {
            // Reflected by the caller checking the cancel flag.
            tracing::info!(thread_id = %self.state.thread_id, "schedule round cancelled");
        }
        self.events.emit(EngineEvent::node_end(
            "schedule",
            json!({
                "completed": outcome.results.len(),
                "failed": outcome.failed.len(),
            }),
        ));
        Ok(())
    }

    async fn node_evaluate(&mut self, plan: &ExecutionPlan) -> Result<crate::evaluator::Evaluation> {
        self.events.emit(EngineEvent::node_start("evaluate"));
        self.state.current_node = "evaluate".to_string();

        // Safety against runaway loops across resumption: the retry counter
        // is re-read from the checkpointed state before every decision.
        if self.engine.config.run.checkpoint_enabled {
            if let Ok(versioned) = self.engine.store.load(&self.state.thread_id).await {
                if let Ok(persisted) = RunState::from_doc(&versioned.doc) {
                    self.state.retry_count = persisted.retry_count;
                }
            }
        }

        let evaluation = self.engine.evaluator.evaluate(
            plan,
            &self.state.worker_results,
            &self.state.failed_workers,
            self.state.retry_count,
            self.state.max_retries,
        );

        self.state.quality_score = evaluation.quality_score;
        self.state.needs_retry = evaluation.needs_retry;
        self.state.retry_workers = evaluation.retry_workers.clone();
        self.state
            .evaluation_notes
            .extend(evaluation.notes.iter().cloned());
        self.state.agent_path.push("evaluate".to_string());

        self.commit(
            StatePatch::new()
                .set("current_node", json!("evaluate"))
                .set("quality_score", json!(evaluation.quality_score))
                .set("needs_retry", json!(evaluation.needs_retry))
                .set("retry_workers", val(&evaluation.retry_workers))
                .set("evaluation_notes", val(&self.state.evaluation_notes))
                .set("insights", val(&evaluation.notes))
                .set("agent_path", json!(["evaluate"])),
        )
        .await?;

        self.events.emit(EngineEvent::node_end(
            "evaluate",
            json!({
                "quality_score": evaluation.quality_score,
                "needs_retry": evaluation.needs_retry,
            }),
        ));
        Ok(evaluation)
    }

    async fn node_synthesize(
        &mut self,
        intent: &IntentRecord,
        plan: &ExecutionPlan,
    ) -> Result<FinalPayload> {
        self.events.emit(EngineEvent::node_start("synthesize"));
        self.state.current_node = "synthesize".to_string();

        let synthesis = self
            .engine
            .synthesizer
            .synthesize(intent, plan, &self.state.worker_results, &self.state.query)
            .await;

        for token in synthesis.answer.split_whitespace() {
            self.events.emit(EngineEvent::token(token));
        }

        self.finish(
            synthesis.response_type,
            Some(synthesis.answer.clone()),
            synthesis.sources.clone(),
            RunStatus::Completed,
        )
        .await?;

        self.events.emit(EngineEvent::node_end(
            "synthesize",
            json!({"response_type": synthesis.response_type}),
        ));

        Ok(FinalPayload {
            response_type: synthesis.response_type,
            answer: Some(synthesis.answer),
            sources: synthesis.sources,
            error_kind: None,
            message: None,
            thread_id: self.state.thread_id.clone(),
            request_id: self.state.request_id.clone(),
            retry_count: self.state.retry_count,
            quality_score: self.state.quality_score,
        })
    }

    async fn complete_with_guidance(&mut self, intent: &IntentRecord) -> Result<FinalPayload> {
        self.events.emit(EngineEvent::node_start("synthesize"));
        let synthesis = if intent.kind == IntentKind::Irrelevant {
            self.engine.synthesizer.guidance_for_irrelevant()
        } else {
            self.engine.synthesizer.guidance_for_unclear()
        };

        self.finish(
            ResponseType::Guidance,
            Some(synthesis.answer.clone()),
            Vec::new(),
            RunStatus::Completed,
        )
        .await?;
        self.events.emit(EngineEvent::node_end(
            "synthesize",
            json!({"response_type": "guidance"}),
        ));

        Ok(FinalPayload {
            response_type: ResponseType::Guidance,
            answer: Some(synthesis.answer),
            sources: Vec::new(),
            error_kind: None,
            message: None,
            thread_id: self.state.thread_id.clone(),
            request_id: self.state.request_id.clone(),
            retry_count: self.state.retry_count,
            quality_score: self.state.quality_score,
        })
    }

    async fn finish(
        &mut self,
        response_type: ResponseType,
        answer: Option<String>,
        sources: Vec<crate::types::SourceRef>,
        status: RunStatus,
    ) -> Result<()> {
        self.state.response_type = Some(response_type);
        self.state.final_answer = answer.clone();
        self.state.sources = sources.clone();
        self.state.status = status;
        self.state.ended_at = Some(Utc::now());
        self.state.current_node = "synthesize".to_string();
        self.state.agent_path.push("synthesize".to_string());

        self.commit(
            StatePatch::new()
                .set("response_type", val(&response_type))
                .set("final_answer", val(&answer))
                .set("sources", val(&sources))
                .set("status", val(&status))
                .set("current_node", json!("synthesize"))
                .set("agent_path", json!(["synthesize"]))
                .set("ended_at", val(&self.state.ended_at)),
        )
        .await
    }

    /// Terminal failure: checkpoint the failed state (best effort) and build
    /// the error payload.
    async fn fail(&mut self, err: EngineError) -> FinalPayload {
        let kind = err.kind();
        let message = err.user_message();
        tracing::error!(
            thread_id = %self.state.thread_id,
            kind = %kind,
            error = %err,
            "run failed"
        );
        self.events.emit(EngineEvent::error(&message));

        let status = if kind == ErrorKind::Cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed
        };
        self.state.errors.insert("engine".to_string(), err.to_string());
        *self
            .state
            .error_counts
            .entry(kind.as_str().to_string())
            .or_insert(0) += 1;

        let mut kind_count = Map::new();
        kind_count.insert(kind.as_str().to_string(), json!(1));

        let commit = self
            .commit(
                StatePatch::new()
                    .set("status", val(&status))
                    .set("response_type", val(&ResponseType::Error))
                    .set("errors", json!({"engine": err.to_string()}))
                    .set("error_counts", Value::Object(kind_count))
                    .set("ended_at", val(&Some(Utc::now()))),
            )
            .await;
        if let Err(commit_err) = commit {
            tracing::error!(error = %commit_err, "failed to checkpoint terminal state");
        }

        error_payload(
            &self.state.thread_id,
            &self.state.request_id,
            kind,
            message,
            self.state.retry_count,
        )
    }

    /// Caller-initiated cancel: partial results stay in state, the
    /// synthesizer never runs.
    async fn cancel_run(&mut self) -> FinalPayload {
        self.fail(EngineError::Cancelled).await
    }
}

fn val<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn error_payload(
    thread_id: &str,
    request_id: &str,
    kind: ErrorKind,
    message: String,
    retry_count: u32,
) -> FinalPayload {
    FinalPayload {
        response_type: ResponseType::Error,
        answer: None,
        sources: Vec::new(),
        error_kind: Some(kind),
        message: Some(message),
        thread_id: thread_id.to_string(),
        request_id: request_id.to_string(),
        retry_count,
        quality_score: 0.0,
    }
}
