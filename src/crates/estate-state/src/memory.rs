//! In-memory state store for development and testing.
//!
//! Reference implementation of [`StateStore`] over `Arc<RwLock<HashMap>>`,
//! mirroring the contract a durable backend must provide: atomic commits,
//! optimistic per-thread versioning and a `(session_id, last_update)`
//! secondary index for thread listings. Records are held in the same
//! self-describing encoded form a durable backend would persist, so loading
//! runs the schema-version migration path. Data does not survive a restart;
//! production deployments implement the same trait over a durable store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{Result, StateStoreError};
use crate::patch::{run_state_schema, PatchSchema, StatePatch};
use crate::serializer::StateSerializer;
use crate::store::{StateStore, ThreadSummary, VersionedState};

#[derive(Debug, Clone)]
struct ThreadRecord {
    version: u64,
    /// Envelope-encoded state document (schema version tag included).
    encoded: Vec<u8>,
    session_id: String,
    last_update: DateTime<Utc>,
}

type ThreadStorage = Arc<RwLock<HashMap<String, ThreadRecord>>>;

/// Thread-safe in-memory implementation of [`StateStore`].
pub struct InMemoryStateStore {
    storage: ThreadStorage,
    schema: PatchSchema,
    serializer: StateSerializer,
}

impl InMemoryStateStore {
    /// Create a store using the engine's run-state merge policies.
    pub fn new() -> Self {
        Self::with_schema(run_state_schema())
    }

    /// Create a store with a custom patch schema.
    pub fn with_schema(schema: PatchSchema) -> Self {
        Self {
            storage: Arc::new(RwLock::new(HashMap::new())),
            schema,
            serializer: StateSerializer::new(),
        }
    }

    /// Number of threads currently stored.
    pub async fn thread_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Drop all threads. Useful between tests.
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }

    /// Insert a pre-encoded record, as a durable backend would find on disk.
    /// Intended for migration tests.
    pub async fn insert_encoded(&self, thread_id: &str, version: u64, encoded: Vec<u8>) {
        let session_id = self
            .serializer
            .decode(&encoded)
            .ok()
            .and_then(|doc| doc.get("session_id").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();
        self.storage.write().await.insert(
            thread_id.to_string(),
            ThreadRecord {
                version,
                encoded,
                session_id,
                last_update: Utc::now(),
            },
        );
    }

    fn decode(&self, thread_id: &str, record: &ThreadRecord) -> Result<Value> {
        self.serializer
            .decode(&record.encoded)
            .map_err(|err| match err {
                migration @ StateStoreError::Migration { .. } => migration,
                other => StateStoreError::Corrupted {
                    thread_id: thread_id.to_string(),
                    detail: other.to_string(),
                },
            })
    }

    fn summary_of(thread_id: &str, doc: &Value, record: &ThreadRecord) -> ThreadSummary {
        ThreadSummary {
            thread_id: thread_id.to_string(),
            session_id: record.session_id.clone(),
            status: doc
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            query: doc.get("query").and_then(Value::as_str).map(str::to_string),
            last_update: record.last_update,
            version: record.version,
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, thread_id: &str) -> Result<VersionedState> {
        let storage = self.storage.read().await;
        let record = storage
            .get(thread_id)
            .ok_or_else(|| StateStoreError::NotFound(thread_id.to_string()))?;
        Ok(VersionedState {
            version: record.version,
            doc: self.decode(thread_id, record)?,
        })
    }

    async fn commit(&self, thread_id: &str, base_version: u64, patch: StatePatch) -> Result<u64> {
        if thread_id.is_empty() {
            return Err(StateStoreError::Invalid("thread_id is required".into()));
        }

        let mut storage = self.storage.write().await;

        match storage.get_mut(thread_id) {
            Some(record) => {
                if record.version != base_version {
                    tracing::warn!(
                        thread_id = %thread_id,
                        expected = base_version,
                        actual = record.version,
                        "commit rejected: stale base version"
                    );
                    return Err(StateStoreError::Conflict {
                        thread_id: thread_id.to_string(),
                        expected: base_version,
                        actual: record.version,
                    });
                }

                // Merge into a scratch copy so a failed patch leaves the
                // committed record untouched.
                let mut doc = self.decode(thread_id, record)?;
                self.schema.apply(&mut doc, &patch)?;
                let encoded = self.serializer.encode(&doc)?;

                record.encoded = encoded;
                record.version += 1;
                record.last_update = Utc::now();
                if let Some(session) = doc.get("session_id").and_then(Value::as_str) {
                    record.session_id = session.to_string();
                }
                tracing::debug!(
                    thread_id = %thread_id,
                    version = record.version,
                    "state committed"
                );
                Ok(record.version)
            }
            None if base_version == 0 => {
                let mut doc = json!({});
                self.schema.apply(&mut doc, &patch)?;
                let encoded = self.serializer.encode(&doc)?;
                let session_id = doc
                    .get("session_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();

                storage.insert(
                    thread_id.to_string(),
                    ThreadRecord {
                        version: 1,
                        encoded,
                        session_id,
                        last_update: Utc::now(),
                    },
                );
                tracing::debug!(thread_id = %thread_id, version = 1, "thread created");
                Ok(1)
            }
            None => Err(StateStoreError::NotFound(thread_id.to_string())),
        }
    }

    async fn list_threads(&self, session_id: &str, limit: usize) -> Result<Vec<ThreadSummary>> {
        let storage = self.storage.read().await;
        let mut summaries: Vec<ThreadSummary> = Vec::new();
        for (thread_id, record) in storage.iter() {
            if record.session_id != session_id {
                continue;
            }
            let doc = self.decode(thread_id, record)?;
            summaries.push(Self::summary_of(thread_id, &doc, record));
        }

        summaries.sort_by(|a, b| b.last_update.cmp(&a.last_update));
        summaries.truncate(limit);
        Ok(summaries)
    }

    async fn delete(&self, thread_id: &str) -> Result<()> {
        if self.storage.write().await.remove(thread_id).is_some() {
            tracing::debug!(thread_id = %thread_id, "thread deleted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initial_patch(session: &str, query: &str) -> StatePatch {
        StatePatch::new()
            .set("session_id", json!(session))
            .set("query", json!(query))
            .set("status", json!("initialized"))
    }

    #[tokio::test]
    async fn commit_creates_and_loads_thread() {
        let store = InMemoryStateStore::new();
        let version = store
            .commit("t-1", 0, initial_patch("s-1", "전세 시세"))
            .await
            .unwrap();
        assert_eq!(version, 1);

        let state = store.load("t-1").await.unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.doc["status"], "initialized");
    }

    #[tokio::test]
    async fn stale_base_version_conflicts() {
        let store = InMemoryStateStore::new();
        store
            .commit("t-1", 0, initial_patch("s-1", "q"))
            .await
            .unwrap();
        store
            .commit("t-1", 1, StatePatch::new().set("status", json!("running")))
            .await
            .unwrap();

        let err = store
            .commit("t-1", 1, StatePatch::new().set("status", json!("completed")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StateStoreError::Conflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn commit_against_missing_thread_requires_base_zero() {
        let store = InMemoryStateStore::new();
        let err = store
            .commit("ghost", 3, StatePatch::new().set("status", json!("running")))
            .await
            .unwrap_err();
        assert!(matches!(err, StateStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn accumulating_fields_merge_across_commits() {
        let store = InMemoryStateStore::new();
        store
            .commit("t-1", 0, initial_patch("s-1", "q"))
            .await
            .unwrap();

        store
            .commit(
                "t-1",
                1,
                StatePatch::new()
                    .set("worker_results", json!({"price_search": {"status": "failed"}}))
                    .set("error_counts", json!({"worker_failed": 1})),
            )
            .await
            .unwrap();
        store
            .commit(
                "t-1",
                2,
                StatePatch::new()
                    .set("worker_results", json!({"price_search": {"status": "success"}}))
                    .set("error_counts", json!({"worker_failed": 1})),
            )
            .await
            .unwrap();

        let doc = store.load("t-1").await.unwrap().doc;
        assert_eq!(doc["worker_results"]["price_search"]["status"], "success");
        assert_eq!(doc["error_counts"]["worker_failed"], 2);
    }

    #[tokio::test]
    async fn failed_patch_leaves_document_intact() {
        let store = InMemoryStateStore::new();
        store
            .commit("t-1", 0, initial_patch("s-1", "q"))
            .await
            .unwrap();

        // error_counts uses the counter reducer; a string value is rejected.
        let err = store
            .commit(
                "t-1",
                1,
                StatePatch::new()
                    .set("status", json!("running"))
                    .set("error_counts", json!({"worker_failed": "oops"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StateStoreError::Patch(_)));

        let state = store.load("t-1").await.unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.doc["status"], "initialized");
    }

    #[tokio::test]
    async fn list_threads_filters_session_and_orders_by_recency() {
        let store = InMemoryStateStore::new();
        store
            .commit("t-old", 0, initial_patch("s-1", "first"))
            .await
            .unwrap();
        store
            .commit("t-other", 0, initial_patch("s-2", "elsewhere"))
            .await
            .unwrap();
        store
            .commit("t-new", 0, initial_patch("s-1", "second"))
            .await
            .unwrap();
        store
            .commit(
                "t-new",
                1,
                StatePatch::new().set("status", json!("completed")),
            )
            .await
            .unwrap();

        let threads = store.list_threads("s-1", 10).await.unwrap();
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].thread_id, "t-new");
        assert_eq!(threads[0].status, "completed");
        assert_eq!(threads[1].thread_id, "t-old");

        let limited = store.list_threads("s-1", 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn delete_then_load_is_not_found() {
        let store = InMemoryStateStore::new();
        store
            .commit("t-1", 0, initial_patch("s-1", "q"))
            .await
            .unwrap();

        store.delete("t-1").await.unwrap();
        assert!(matches!(
            store.load("t-1").await,
            Err(StateStoreError::NotFound(_))
        ));

        // Deleting again is a no-op.
        store.delete("t-1").await.unwrap();
    }

    #[tokio::test]
    async fn threads_are_isolated() {
        let store = InMemoryStateStore::new();
        store
            .commit("t-1", 0, initial_patch("s-1", "q1"))
            .await
            .unwrap();
        store
            .commit("t-2", 0, initial_patch("s-1", "q2"))
            .await
            .unwrap();

        store
            .commit("t-1", 1, StatePatch::new().set("status", json!("failed")))
            .await
            .unwrap();

        let other = store.load("t-2").await.unwrap();
        assert_eq!(other.doc["status"], "initialized");
        assert_eq!(other.version, 1);
    }

    #[tokio::test]
    async fn legacy_records_migrate_on_load() {
        let store = InMemoryStateStore::new();
        let legacy = serde_json::to_vec(&json!({
            "schema_version": 1,
            "state": {
                "session_id": "s-1",
                "status": "completed",
                "final_response": "migrated answer"
            }
        }))
        .unwrap();

        store.insert_encoded("t-legacy", 4, legacy).await;

        let state = store.load("t-legacy").await.unwrap();
        assert_eq!(state.version, 4);
        assert_eq!(state.doc["final_answer"], "migrated answer");
        assert!(state.doc.get("final_response").is_none());

        // committing on top of a migrated record keeps working
        let version = store
            .commit(
                "t-legacy",
                4,
                StatePatch::new().set("status", json!("completed")),
            )
            .await
            .unwrap();
        assert_eq!(version, 5);
    }

    #[tokio::test]
    async fn corrupted_record_is_fatal_for_that_thread_only() {
        let store = InMemoryStateStore::new();
        store
            .commit("t-good", 0, initial_patch("s-1", "q"))
            .await
            .unwrap();
        store
            .insert_encoded("t-bad", 1, b"not json at all".to_vec())
            .await;

        assert!(matches!(
            store.load("t-bad").await,
            Err(StateStoreError::Corrupted { .. })
        ));
        assert!(store.load("t-good").await.is_ok());
    }
}
