//! Configuration for LLM clients.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

fn default_temperature() -> f64 {
    0.3
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_model() -> String {
    "estate-chat-small".to_string()
}

/// Provider-independent client configuration.
///
/// Models are resolved per purpose (`intent`, `planning`, `response`, ...);
/// unknown purposes fall back to `default_model`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider identifier ("openai", "anthropic", "scripted", ...).
    pub provider: String,

    /// Model name per call purpose.
    #[serde(default)]
    pub models: HashMap<String, String>,

    /// Fallback model for purposes without an explicit mapping.
    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Name of the credential handle to resolve at call time. The value is
    /// never stored here.
    #[serde(default)]
    pub credential: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "scripted".to_string(),
            models: HashMap::new(),
            default_model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            credential: None,
        }
    }
}

impl LlmConfig {
    /// Resolve the model for a call purpose.
    pub fn model_for(&self, purpose: &str) -> &str {
        self.models
            .get(purpose)
            .map(String::as_str)
            .unwrap_or(&self.default_model)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Map a purpose to a model name, builder style.
    pub fn with_model(mut self, purpose: impl Into<String>, model: impl Into<String>) -> Self {
        self.models.insert(purpose.into(), model.into());
        self
    }
}
