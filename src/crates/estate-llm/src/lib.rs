//! Structured LLM call abstraction for the estate workflow engine.
//!
//! The engine talks to language models through exactly one seam: the
//! [`LlmClient`] trait, a prompt-plus-schema in, parsed-JSON out contract.
//! Provider transports (HTTP clients, local runners) live outside this
//! workspace; what ships here is the interface, its configuration, and two
//! deterministic clients used by tests and fallback exercises:
//! [`ScriptedLlmClient`] replays canned responses, [`UnavailableLlmClient`]
//! always fails so the engine's deterministic fallbacks can be driven.

pub mod config;
pub mod error;
pub mod scripted;

pub use config::LlmConfig;
pub use error::{LlmError, Result};
pub use scripted::{ScriptedLlmClient, UnavailableLlmClient};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Expected shape of the model's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    /// Reply must parse as a JSON object.
    #[default]
    Json,
    /// Free text, returned as a JSON string value.
    Text,
}

/// Per-call parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmParams {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    #[serde(default)]
    pub response_format: ResponseFormat,
    /// Per-call deadline. `None` inherits the client's configured timeout.
    #[serde(default, skip)]
    pub timeout: Option<Duration>,
}

impl LlmParams {
    /// Parameters for a purpose, resolved against a config.
    pub fn for_purpose(config: &LlmConfig, purpose: &str) -> Self {
        Self {
            model: config.model_for(purpose).to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            response_format: ResponseFormat::Json,
            timeout: Some(config.timeout()),
        }
    }

    pub fn with_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = format;
        self
    }
}

/// One structured model call.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    /// JSON schema the reply must satisfy, when `response_format` is JSON.
    /// Advisory for providers without native schema support; the caller
    /// validates the parsed value either way.
    pub response_schema: Option<Value>,
    pub params: LlmParams,
}

impl LlmRequest {
    pub fn new(
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
        params: LlmParams,
    ) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            response_schema: None,
            params,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

/// Structured call abstraction: prompt + schema in, parsed value out.
///
/// Implementations must honor `params.timeout` and return
/// [`LlmError::InvalidResponse`] rather than raw text when the reply does
/// not parse under the requested format.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(&self, request: LlmRequest) -> Result<Value>;

    /// Short provider label for logs and metrics.
    fn provider(&self) -> &str;
}
