//! Immutable per-run metadata threaded to every node.
//!
//! The carrier holds only data that is fixed for the lifetime of a run:
//! who is asking, which session and thread the run belongs to, language and
//! debug flags, and the names of credential handles (never values). Dynamic
//! data lives in run state; the carrier is never merged into it.

use std::sync::Arc;
use uuid::Uuid;

/// Read-only run metadata.
///
/// Constructed from a principal (user and session scope) and bound to a
/// thread, request and query at ingest. After `bind_run` the carrier is
/// shared as `Arc` and never mutated.
#[derive(Debug, Clone)]
pub struct ContextCarrier {
    pub user_id: String,
    pub user_name: Option<String>,
    pub session_id: String,
    pub thread_id: String,
    pub request_id: String,
    /// BCP-47-ish language tag, e.g. "ko" or "en".
    pub language: String,
    pub debug: bool,
    /// Names of credential handles available to this run. Values are
    /// resolved outside the engine.
    pub credential_names: Vec<String>,
    /// The initial query text, verbatim.
    pub query: String,
}

impl ContextCarrier {
    /// Principal for a regular user session. Thread, request and query are
    /// bound later.
    pub fn for_user(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: None,
            session_id: session_id.into(),
            thread_id: String::new(),
            request_id: String::new(),
            language: "ko".to_string(),
            debug: false,
            credential_names: Vec::new(),
            query: String::new(),
        }
    }

    /// Principal for an anonymous guest session.
    pub fn for_guest() -> Self {
        let guest = Uuid::new_v4().to_string();
        Self::for_user(format!("guest-{guest}"), format!("guest-session-{guest}"))
    }

    /// Principal for tests: fixed ids, debug on.
    pub fn for_testing(test_id: &str) -> Self {
        let mut carrier = Self::for_user(test_id, format!("test-session-{test_id}"));
        carrier.debug = true;
        carrier
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    pub fn with_credentials(mut self, names: Vec<String>) -> Self {
        self.credential_names = names;
        self
    }

    /// Whether a credential handle is present by name.
    pub fn has_credential(&self, name: &str) -> bool {
        self.credential_names.iter().any(|n| n == name)
    }

    /// Bind the principal to one run. The result is immutable for the whole
    /// run and shared by reference.
    pub fn bind_run(
        &self,
        thread_id: impl Into<String>,
        request_id: impl Into<String>,
        query: impl Into<String>,
    ) -> Arc<ContextCarrier> {
        let mut bound = self.clone();
        bound.thread_id = thread_id.into();
        bound.request_id = request_id.into();
        bound.query = query.into();
        Arc::new(bound)
    }
}
