//! Request and response types for the LLM provider interface.

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::error::Result;

/// Options accepted by a completion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionOptions {
    /// Model override; the provider picks its default when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Maximum tokens to generate
    pub max_tokens: u32,
    /// Sampling temperature (0.0 - 1.0)
    pub temperature: f64,
    /// Ask the provider for a JSON-only response
    pub json_only: bool,
    /// Soft timeout for the call in milliseconds
    pub timeout_ms: u64,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 2048,
            temperature: 0.0,
            json_only: false,
            timeout_ms: 60_000,
        }
    }
}

impl CompletionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature.clamp(0.0, 1.0);
        self
    }

    pub fn with_json_only(mut self, json_only: bool) -> Self {
        self.json_only = json_only;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// A finished completion with token accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// One streamed chunk of a completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDelta {
    pub delta: String,
    /// Set on the last chunk, carrying the full token accounting
    #[serde(rename = "final", skip_serializing_if = "Option::is_none")]
    pub final_usage: Option<Completion>,
}

/// A boxed stream of completion deltas.
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<StreamDelta>> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options = CompletionOptions::default();
        assert_eq!(options.max_tokens, 2048);
        assert_eq!(options.temperature, 0.0);
        assert!(!options.json_only);
    }

    #[test]
    fn test_temperature_is_clamped() {
        let options = CompletionOptions::new().with_temperature(3.0);
        assert_eq!(options.temperature, 1.0);
    }

    #[test]
    fn test_stream_delta_serde_field_name() {
        let delta = StreamDelta {
            delta: "hi".into(),
            final_usage: Some(Completion {
                text: "hi".into(),
                tokens_in: 3,
                tokens_out: 1,
            }),
        };
        let value = serde_json::to_value(&delta).unwrap();
        assert!(value.get("final").is_some());
    }
}
