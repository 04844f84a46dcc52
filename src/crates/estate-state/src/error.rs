//! Error types for state store operations.

use thiserror::Error;

/// Convenience result type using [`StateStoreError`].
pub type Result<T> = std::result::Result<T, StateStoreError>;

/// Errors that can occur while loading, committing or listing run state.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// No state document exists for the requested thread.
    #[error("thread not found: {0}")]
    NotFound(String),

    /// Optimistic version check failed: another commit landed first.
    ///
    /// The store is single-writer per thread; a conflict means the caller
    /// committed against a stale base version and must reload.
    #[error("version conflict on thread '{thread_id}': expected base {expected}, store at {actual}")]
    Conflict {
        thread_id: String,
        expected: u64,
        actual: u64,
    },

    /// The backing storage is unreachable. Retryable at the engine level and
    /// distinct from worker errors.
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    /// The stored document for one thread cannot be decoded. Fatal for that
    /// thread only; other threads are unaffected.
    #[error("state corrupted for thread '{thread_id}': {detail}")]
    Corrupted { thread_id: String, detail: String },

    /// A document carried an unknown schema version or a migration step
    /// failed.
    #[error("cannot migrate state document from schema version {version}: {detail}")]
    Migration { version: u32, detail: String },

    /// Applying a patch to the current document failed.
    #[error("patch error: {0}")]
    Patch(#[from] PatchError),

    /// JSON serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed request (empty thread id, zero limit, ...).
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl StateStoreError {
    /// Whether the engine may retry the operation.
    ///
    /// Conflicts are retryable after a reload; unavailability is transient.
    /// Corruption and migration failures are terminal for the thread.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StateStoreError::Unavailable(_) | StateStoreError::Conflict { .. }
        )
    }
}

/// Errors raised while merging a patch into a state document.
#[derive(Debug, Error)]
pub enum PatchError {
    /// The target document is not a JSON object.
    #[error("state document must be an object")]
    NotAnObject,

    /// A reducer received values it cannot merge.
    #[error("reducer '{reducer}' failed on field '{field}': {detail}")]
    Reduce {
        reducer: &'static str,
        field: String,
        detail: String,
    },
}
