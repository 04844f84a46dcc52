//! Deterministic LLM clients for tests and fallback exercises.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use crate::error::{LlmError, Result};
use crate::{LlmClient, LlmRequest};

/// Replays a queue of canned responses in order.
///
/// Each call pops the front of the queue; when the queue is empty the client
/// reports `ServiceUnavailable`, which exercises the same path as a dead
/// provider. [`ScriptedLlmClient::always`] builds a client that repeats one
/// response forever instead.
pub struct ScriptedLlmClient {
    responses: Mutex<VecDeque<Result<Value>>>,
    repeat_last: bool,
    calls: AtomicUsize,
}

impl ScriptedLlmClient {
    pub fn new(responses: Vec<Result<Value>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            repeat_last: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// A client that answers every call with the same value.
    pub fn always(value: Value) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from([Ok(value)])),
            repeat_last: true,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of calls observed so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn call(&self, _request: LlmRequest) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.responses.lock().await;
        if self.repeat_last {
            return match queue.front() {
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err(_)) | None => {
                    Err(LlmError::ServiceUnavailable("script exhausted".into()))
                }
            };
        }
        queue
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::ServiceUnavailable("script exhausted".into())))
    }

    fn provider(&self) -> &str {
        "scripted"
    }
}

/// A client that always fails, for driving deterministic fallbacks.
#[derive(Debug, Default)]
pub struct UnavailableLlmClient;

#[async_trait]
impl LlmClient for UnavailableLlmClient {
    async fn call(&self, _request: LlmRequest) -> Result<Value> {
        Err(LlmError::ServiceUnavailable(
            "no LLM provider configured".into(),
        ))
    }

    fn provider(&self) -> &str {
        "unavailable"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LlmConfig, LlmParams};
    use serde_json::json;

    fn request() -> LlmRequest {
        let config = LlmConfig::default();
        LlmRequest::new("system", "user", LlmParams::for_purpose(&config, "intent"))
    }

    #[tokio::test]
    async fn scripted_client_replays_in_order_then_fails() {
        let client = ScriptedLlmClient::new(vec![
            Ok(json!({"n": 1})),
            Err(LlmError::Timeout("slow".into())),
        ]);

        assert_eq!(client.call(request()).await.unwrap(), json!({"n": 1}));
        assert!(matches!(
            client.call(request()).await,
            Err(LlmError::Timeout(_))
        ));
        assert!(matches!(
            client.call(request()).await,
            Err(LlmError::ServiceUnavailable(_))
        ));
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn always_client_repeats() {
        let client = ScriptedLlmClient::always(json!({"kind": "search"}));
        for _ in 0..3 {
            assert_eq!(
                client.call(request()).await.unwrap(),
                json!({"kind": "search"})
            );
        }
    }

    #[tokio::test]
    async fn unavailable_client_is_not_retryable_into_success() {
        let client = UnavailableLlmClient;
        let err = client.call(request()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
