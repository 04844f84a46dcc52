//! The `StateStore` trait: checkpointed run state indexed by thread.
//!
//! Every node in a run reads a consistent snapshot of the thread's state and
//! commits its partial update atomically. The store enforces single-writer
//! semantics per thread through an optimistic version check: a commit carries
//! the version it was based on and fails with
//! [`StateStoreError::Conflict`](crate::StateStoreError::Conflict) if a newer
//! version has landed. Threads are independent; there is no cross-thread
//! consistency.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::patch::StatePatch;

/// A state document together with its commit version.
#[derive(Debug, Clone)]
pub struct VersionedState {
    /// Monotonically increasing per-thread commit counter. Version 1 is the
    /// initial commit of a freshly ingested run.
    pub version: u64,
    /// The run-state document. Always a JSON object.
    pub doc: Value,
}

/// One row of a session-scoped thread listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub session_id: String,
    /// Lifecycle status copied from the document at last commit.
    pub status: String,
    /// The query that started the thread's most recent run, if any.
    pub query: Option<String>,
    pub last_update: DateTime<Utc>,
    pub version: u64,
}

/// Thread-scoped checkpointed state storage.
///
/// Implementations must guarantee:
/// - commits are atomic per transition: a reader observing a new version sees
///   the complete document that produced it;
/// - versions per thread are totally ordered and never reused;
/// - operations on different threads never block one another.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the latest committed state for a thread.
    async fn load(&self, thread_id: &str) -> Result<VersionedState>;

    /// Atomically apply `patch` on top of `base_version` and commit.
    ///
    /// Returns the new version. Fails with `Conflict` when the stored
    /// version no longer equals `base_version`, and with `NotFound` when the
    /// thread does not exist and `base_version != 0`. Committing with
    /// `base_version == 0` creates the thread.
    async fn commit(&self, thread_id: &str, base_version: u64, patch: StatePatch) -> Result<u64>;

    /// List threads belonging to a session, most recently updated first.
    async fn list_threads(&self, session_id: &str, limit: usize) -> Result<Vec<ThreadSummary>>;

    /// Delete a thread and all its state. Deleting an unknown thread is not
    /// an error.
    async fn delete(&self, thread_id: &str) -> Result<()>;
}
