//! Multi-agent workflow engine for a domain-specialized question-answering
//! assistant.
//!
//! A user query flows through a checkpointed state machine: the
//! [`Analyzer`] classifies intent and extracts entities, the [`Planner`]
//! turns the intent into an [`ExecutionPlan`](types::ExecutionPlan) over
//! registered [`Worker`]s, the [`Scheduler`] runs the plan steps under a
//! Sequential, Parallel or DAG strategy with retries and deadlines, the
//! [`Evaluator`] decides retry or completion, and the [`Synthesizer`]
//! composes the final user-visible answer. Every node boundary commits a
//! checkpoint to the [`StateStore`](estate_state::StateStore), so runs are
//! resumable and queryable per conversation thread.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use estate_engine::{ContextCarrier, RunOptions, WorkflowEngine, WorkerRegistry};
//! use std::sync::Arc;
//!
//! # #[tokio::main] async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(WorkerRegistry::new());
//! // registry.register(Arc::new(MyWorker::new()));
//!
//! let engine = WorkflowEngine::builder()
//!     .with_registry(registry)
//!     .build()?;
//!
//! let principal = ContextCarrier::for_user("u-1", "s-1");
//! let payload = engine
//!     .execute(&principal, "강남구 아파트 전세 시세 알려줘", RunOptions::default())
//!     .await;
//! println!("{:?}", payload.answer);
//! # Ok(()) }
//! ```

pub mod analyzer;
pub mod cache;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod metrics;
pub mod planner;
pub mod registry;
pub mod scheduler;
pub mod stream;
pub mod synthesizer;
pub mod types;
pub mod worker;

pub use analyzer::Analyzer;
pub use cache::{CacheConfig, CacheStats, EvictionStrategy, ResultCache};
pub use config::{
    BackoffConfig, EngineConfig, EvaluatorConfig, GuidanceConfig, IntentConfig, RetryConfig,
    RunConfig,
};
pub use context::ContextCarrier;
pub use engine::{RunOptions, WorkflowEngine, WorkflowEngineBuilder};
pub use error::{EngineError, ErrorKind, Result};
pub use evaluator::{Evaluation, Evaluator};
pub use metrics::{MetricsRegistry, NodeStats};
pub use planner::Planner;
pub use registry::WorkerRegistry;
pub use scheduler::{ScheduleOutcome, Scheduler};
pub use stream::{EngineEvent, EventKind, EventSink};
pub use synthesizer::{Synthesis, Synthesizer};
pub use types::{
    BackoffKind, Complexity, Entities, ExecutionPlan, FinalPayload, IntentKind, IntentRecord,
    NodeTiming, PlanStep, PlanValidationError, PriceRange, Query, ResponseType, RunState,
    RunStatus, SizeRange, SkipReason, SourceRef, StepRetryPolicy, StepStatus, Strategy,
    WorkerResult, WorkerStatus,
};
pub use worker::{Worker, WorkerContext, WorkerError, WorkerInput, WorkerOutput};
