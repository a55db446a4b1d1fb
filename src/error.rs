//! Error types for spelunk-core.

use thiserror::Error;

/// Result type alias using spelunk-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while answering a code-analysis query.
#[derive(Error, Debug)]
pub enum Error {
    /// Storage (index, cache, session, event log) error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Workspace I/O error
    #[error("Workspace error: {0}")]
    Workspace(String),

    /// LLM API error
    #[error("LLM API error: {provider} - {message}")]
    LlmApi { provider: String, message: String },

    /// LLM call exceeded its time budget
    #[error("LLM call timed out after {duration_ms}ms")]
    LlmTimeout { duration_ms: u64 },

    /// A stage produced output the post-hook could not parse
    #[error("Malformed output from {stage} stage: {message}")]
    MalformedOutput { stage: String, message: String },

    /// Tool arguments rejected by the registry schema
    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    /// Tool name not present in the registry
    #[error("Tool not available: {0}")]
    ToolUnavailable(String),

    /// A resource quota or context bound was exhausted
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Request cancelled by external signal
    #[error("Request cancelled")]
    Cancelled,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a workspace error.
    pub fn workspace(message: impl Into<String>) -> Self {
        Self::Workspace(message.into())
    }

    /// Create an LLM API error.
    pub fn llm_api(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmApi {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a malformed-output error.
    pub fn malformed(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedOutput {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Create an invalid-arguments error.
    pub fn invalid_arguments(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create a quota-exceeded error.
    pub fn quota(reason: impl Into<String>) -> Self {
        Self::QuotaExceeded(reason.into())
    }

    /// Whether this error should terminate the request as `quota_exceeded`.
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_))
    }

    /// Whether this error is a cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
