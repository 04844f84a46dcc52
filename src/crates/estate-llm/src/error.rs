//! Error types for LLM client implementations.

use thiserror::Error;

/// Result type for LLM operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Errors that can occur when calling a language model.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Provider service unreachable or not configured.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Credential handle missing or rejected.
    #[error("credential not available: {0}")]
    CredentialMissing(String),

    /// The requested model is unknown to the provider.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Request exceeded its timeout.
    #[error("request timeout: {0}")]
    Timeout(String),

    /// The provider returned something that does not parse against the
    /// requested schema or format.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Malformed request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Serialization of request or response failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl LlmError {
    /// Whether a caller may transparently retry the call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::ServiceUnavailable(_)
                | LlmError::Timeout(_)
                | LlmError::RateLimitExceeded(_)
        )
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::Serialization(err.to_string())
    }
}
