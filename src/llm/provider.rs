//! LLM provider trait and the Anthropic HTTP adapter.

use async_trait::async_trait;
use futures::stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::llm::types::{Completion, CompletionOptions, CompletionStream, StreamDelta};

/// The two operations the pipeline consumes, plus embeddings for the
/// semantic-search primitive. Implementations own transport entirely.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Complete a prompt.
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<Completion>;

    /// Stream a completion.
    ///
    /// The default adapter behaviour performs a blocking completion and
    /// yields it as a single final delta.
    async fn stream(&self, prompt: &str, options: &CompletionOptions) -> Result<CompletionStream> {
        let completion = self.complete(prompt, options).await?;
        let delta = StreamDelta {
            delta: completion.text.clone(),
            final_usage: Some(completion),
        };
        Ok(Box::pin(stream::iter(vec![Ok(delta)])))
    }

    /// Embed texts into 384-dimensional vectors.
    ///
    /// Providers without an embedding endpoint return an error; callers in
    /// fallback chains record the failure and move on.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Provider name, for logging and error messages.
    fn name(&self) -> &str;
}

/// Configuration for the Anthropic adapter.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// API key
    pub api_key: String,
    /// Default model
    pub model: String,
    /// Base URL override
    pub base_url: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Max retries on transport failure
    pub max_retries: u32,
}

impl ProviderConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            base_url: None,
            timeout_secs: 120,
            max_retries: 3,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Anthropic messages-API adapter.
pub struct AnthropicProvider {
    config: ProviderConfig,
    http: Client,
}

impl AnthropicProvider {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(config: ProviderConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }

    async fn post_messages(&self, request: &AnthropicRequest) -> Result<AnthropicResponse> {
        let url = format!("{}/v1/messages", self.base_url());
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(250 * 2u64.pow(attempt - 1))).await;
            }
            let response = self
                .http
                .post(&url)
                .header("x-api-key", &self.config.api_key)
                .header("anthropic-version", Self::API_VERSION)
                .header("content-type", "application/json")
                .json(request)
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    return Err(Error::LlmTimeout {
                        duration_ms: self.config.timeout_secs * 1000,
                    })
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "anthropic transport failure");
                    last_error = Some(Error::llm_api("anthropic", e.to_string()));
                    continue;
                }
            };

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| Error::llm_api("anthropic", format!("failed to read body: {e}")))?;

            if status.is_server_error() {
                last_error = Some(Error::llm_api("anthropic", format!("{status}: {body}")));
                continue;
            }
            if !status.is_success() {
                if let Ok(error) = serde_json::from_str::<AnthropicError>(&body) {
                    return Err(Error::llm_api(
                        "anthropic",
                        format!("{}: {}", error.error.error_type, error.error.message),
                    ));
                }
                return Err(Error::llm_api("anthropic", format!("{status}: {body}")));
            }

            return serde_json::from_str(&body)
                .map_err(|e| Error::llm_api("anthropic", format!("failed to parse body: {e}")));
        }

        Err(last_error
            .unwrap_or_else(|| Error::llm_api("anthropic", "retries exhausted".to_string())))
    }
}

// Anthropic API wire types

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<Completion> {
        let system = options
            .json_only
            .then(|| "Respond with a single JSON value and nothing else.".to_string());

        let request = AnthropicRequest {
            model: options
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: options.max_tokens,
            system,
            temperature: options.temperature,
        };

        let response = tokio::time::timeout(
            Duration::from_millis(options.timeout_ms),
            self.post_messages(&request),
        )
        .await
        .map_err(|_| Error::LlmTimeout {
            duration_ms: options.timeout_ms,
        })??;

        let text = response
            .content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(Completion {
            text,
            tokens_in: response.usage.input_tokens,
            tokens_out: response.usage.output_tokens,
        })
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::llm_api(
            "anthropic",
            "embeddings are not supported by this provider",
        ))
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct EchoProvider;

    #[async_trait]
    impl LlmProvider for EchoProvider {
        async fn complete(
            &self,
            prompt: &str,
            _options: &CompletionOptions,
        ) -> Result<Completion> {
            Ok(Completion {
                text: prompt.to_string(),
                tokens_in: prompt.len() as u64 / 4,
                tokens_out: prompt.len() as u64 / 4,
            })
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0; 384]).collect())
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    #[tokio::test]
    async fn test_default_stream_yields_single_final_delta() {
        let provider = EchoProvider;
        let mut stream = provider
            .stream("hello", &CompletionOptions::default())
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.delta, "hello");
        assert!(first.final_usage.is_some());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_anthropic_embed_unsupported() {
        let provider = AnthropicProvider::new(ProviderConfig::new("test-key"));
        let result = provider.embed(&["text".to_string()]).await;
        assert!(matches!(result, Err(Error::LlmApi { .. })));
    }

    #[test]
    fn test_provider_config_builder() {
        let config = ProviderConfig::new("key")
            .with_model("claude-3-5-haiku-20241022")
            .with_base_url("http://localhost:8080")
            .with_timeout(30);
        assert_eq!(config.model, "claude-3-5-haiku-20241022");
        assert_eq!(config.base_url.as_deref(), Some("http://localhost:8080"));
        assert_eq!(config.timeout_secs, 30);
    }
}
