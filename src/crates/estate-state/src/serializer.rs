//! Versioned serialization of state documents.
//!
//! Persisted records are self-describing: the payload is wrapped in an
//! envelope carrying a `schema_version` tag. Loading an older version runs a
//! forward migration chain before the document is handed to the engine.

use serde_json::{json, Value};

use crate::error::{Result, StateStoreError};

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 2;

/// JSON serializer for state documents with schema-version envelopes.
#[derive(Debug, Clone, Default)]
pub struct StateSerializer;

impl StateSerializer {
    pub fn new() -> Self {
        Self
    }

    /// Wrap and encode a document at the current schema version.
    pub fn encode(&self, doc: &Value) -> Result<Vec<u8>> {
        let envelope = json!({
            "schema_version": SCHEMA_VERSION,
            "state": doc,
        });
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Decode an envelope, migrating older schema versions forward.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let envelope: Value = serde_json::from_slice(bytes)?;
        let version = envelope
            .get("schema_version")
            .and_then(Value::as_u64)
            .ok_or_else(|| StateStoreError::Migration {
                version: 0,
                detail: "missing schema_version tag".to_string(),
            })? as u32;

        let mut doc = envelope
            .get("state")
            .cloned()
            .ok_or_else(|| StateStoreError::Migration {
                version,
                detail: "missing state payload".to_string(),
            })?;

        let mut current = version;
        while current < SCHEMA_VERSION {
            doc = migrate_step(current, doc)?;
            current += 1;
        }

        if current > SCHEMA_VERSION {
            return Err(StateStoreError::Migration {
                version,
                detail: format!("document is newer than supported version {}", SCHEMA_VERSION),
            });
        }

        Ok(doc)
    }
}

/// Migrate a document from `version` to `version + 1`.
fn migrate_step(version: u32, mut doc: Value) -> Result<Value> {
    match version {
        // v1 named the answer field `final_response` and kept no response
        // type; v2 renamed it and defaults the type from presence.
        1 => {
            if let Some(obj) = doc.as_object_mut() {
                if let Some(answer) = obj.remove("final_response") {
                    let has_answer = answer.as_str().map(|s| !s.is_empty()).unwrap_or(false);
                    obj.insert("final_answer".to_string(), answer);
                    obj.entry("response_type".to_string())
                        .or_insert_with(|| json!(if has_answer { "answer" } else { "error" }));
                }
            }
            Ok(doc)
        }
        other => Err(StateStoreError::Migration {
            version: other,
            detail: "no migration path".to_string(),
        }),
    }
}
