//! LLM provider interface and the default HTTP adapter.

pub mod provider;
pub mod types;

pub use provider::{AnthropicProvider, LlmProvider, ProviderConfig};
pub use types::{Completion, CompletionOptions, CompletionStream, StreamDelta};
