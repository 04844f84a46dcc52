//! Engine error types and the user-facing error taxonomy.
//!
//! [`EngineError`] is the internal error enum; [`ErrorKind`] is the stable
//! taxonomy surfaced in final payloads and error counters. The scheduler
//! pattern-matches on kinds to decide retry vs. surface, so every variant
//! maps to exactly one kind.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::PlanValidationError;
use estate_llm::LlmError;
use estate_state::StateStoreError;

/// Convenience result type using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Stable error classification exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    IntentError,
    PlanError,
    WorkerFailed,
    WorkerTimeout,
    DependencyFailed,
    RunTimeout,
    Cancelled,
    StateStoreUnavailable,
    LlmUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::IntentError => "intent_error",
            ErrorKind::PlanError => "plan_error",
            ErrorKind::WorkerFailed => "worker_failed",
            ErrorKind::WorkerTimeout => "worker_timeout",
            ErrorKind::DependencyFailed => "dependency_failed",
            ErrorKind::RunTimeout => "run_timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::StateStoreUnavailable => "state_store_unavailable",
            ErrorKind::LlmUnavailable => "llm_unavailable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All failures the engine can produce or propagate.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Query empty, too long, or malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Analyzer failed and no fallback produced a usable record.
    #[error("intent analysis failed: {0}")]
    Intent(String),

    /// Planner could not produce a usable plan.
    #[error("planning failed: {0}")]
    Plan(String),

    /// Plan failed structural validation.
    #[error("plan validation failed: {0}")]
    PlanValidation(#[from] PlanValidationError),

    /// A worker returned an error.
    #[error("worker '{worker}' failed: {detail}")]
    WorkerFailed { worker: String, detail: String },

    /// A step deadline expired.
    #[error("worker '{worker}' timed out after {elapsed_ms}ms")]
    WorkerTimeout { worker: String, elapsed_ms: u64 },

    /// Lookup of an unknown or disabled worker. Never retried.
    #[error("worker not available: {0}")]
    WorkerNotAvailable(String),

    /// An upstream worker failed; the dependent step was skipped.
    #[error("step '{step}' skipped: dependency '{dependency}' failed")]
    DependencyFailed { step: String, dependency: String },

    /// Total run budget expired.
    #[error("run exceeded its total budget of {budget_ms}ms")]
    RunTimeout { budget_ms: u64 },

    /// Caller-requested cancellation.
    #[error("run cancelled by caller")]
    Cancelled,

    /// Checkpointing failed; the run is aborted.
    #[error("state store error: {0}")]
    StateStore(#[from] StateStoreError),

    /// LLM call failed and no fallback applied.
    #[error("llm unavailable: {0}")]
    Llm(#[from] LlmError),

    /// Invalid engine configuration, rejected at construction time.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl EngineError {
    /// The taxonomy kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidInput(_) | EngineError::Configuration(_) => ErrorKind::InvalidInput,
            EngineError::Intent(_) => ErrorKind::IntentError,
            EngineError::Plan(_) | EngineError::PlanValidation(_) => ErrorKind::PlanError,
            EngineError::WorkerFailed { .. } | EngineError::WorkerNotAvailable(_) => {
                ErrorKind::WorkerFailed
            }
            EngineError::WorkerTimeout { .. } => ErrorKind::WorkerTimeout,
            EngineError::DependencyFailed { .. } => ErrorKind::DependencyFailed,
            EngineError::RunTimeout { .. } => ErrorKind::RunTimeout,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::StateStore(_) => ErrorKind::StateStoreUnavailable,
            EngineError::Llm(_) => ErrorKind::LlmUnavailable,
        }
    }

    /// Whether the scheduler may retry the operation that produced this.
    ///
    /// Worker failures and timeouts are retried through the evaluator loop;
    /// unavailable workers, dependency skips and terminal run errors are
    /// never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::WorkerFailed { .. } | EngineError::WorkerTimeout { .. } => true,
            EngineError::StateStore(err) => err.is_retryable(),
            EngineError::Llm(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Short human-readable message for final error payloads.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::InvalidInput(detail) => format!("The query could not be accepted: {detail}"),
            EngineError::Intent(_) => "The query could not be understood.".to_string(),
            EngineError::Plan(_) | EngineError::PlanValidation(_) => {
                "No execution plan could be built for the query.".to_string()
            }
            EngineError::WorkerFailed { worker, .. } => {
                format!("The '{worker}' specialist could not complete its task.")
            }
            EngineError::WorkerTimeout { worker, .. } => {
                format!("The '{worker}' specialist did not respond in time.")
            }
            EngineError::WorkerNotAvailable(worker) => {
                format!("The '{worker}' specialist is not available.")
            }
            EngineError::DependencyFailed { step, .. } => {
                format!("A prerequisite for '{step}' failed.")
            }
            EngineError::RunTimeout { .. } => "Processing took too long and was stopped.".to_string(),
            EngineError::Cancelled => "The request was cancelled.".to_string(),
            EngineError::StateStore(_) => "Conversation state is temporarily unavailable.".to_string(),
            EngineError::Llm(_) => "The language model is temporarily unavailable.".to_string(),
            EngineError::Configuration(detail) => format!("Configuration problem: {detail}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_one_to_one() {
        assert_eq!(
            EngineError::InvalidInput("empty".into()).kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            EngineError::WorkerTimeout {
                worker: "finance".into(),
                elapsed_ms: 500
            }
            .kind(),
            ErrorKind::WorkerTimeout
        );
        assert_eq!(
            EngineError::WorkerNotAvailable("ghost".into()).kind(),
            ErrorKind::WorkerFailed
        );
        assert_eq!(EngineError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn retry_classification() {
        assert!(EngineError::WorkerFailed {
            worker: "finance".into(),
            detail: "boom".into()
        }
        .is_retryable());
        assert!(!EngineError::WorkerNotAvailable("ghost".into()).is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(!EngineError::DependencyFailed {
            step: "s2".into(),
            dependency: "s1".into()
        }
        .is_retryable());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let kind = ErrorKind::StateStoreUnavailable;
        assert_eq!(
            serde_json::to_value(kind).unwrap(),
            serde_json::json!("state_store_unavailable")
        );
        assert_eq!(kind.as_str(), "state_store_unavailable");
    }
}
