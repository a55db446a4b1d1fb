//! # spelunk-core
//!
//! The core of a read-only code-analysis agent: a bounded, seven-stage
//! pipeline that takes a natural-language question about a source repository
//! and produces an answer whose every factual claim carries a `file:line`
//! citation extracted from the repository itself.
//!
//! ## Core Components
//!
//! - **Envelope**: per-request working memory (query, stage outputs,
//!   citations, usage)
//! - **Pipeline**: the stage machine with a bounded critic-driven re-entry
//!   loop
//! - **Tools**: a frozen registry of read-only exploration operations;
//!   `search_code` and `read_code` are deterministic fallback chains
//! - **Evidence**: citation extraction and claim-support validation
//! - **Service**: the façade that admits queries and streams stage events
//!
//! ## Example
//!
//! ```rust,ignore
//! use spelunk_core::{AnalysisService, QueryRequest};
//!
//! let service = AnalysisService::builder()
//!     .workspace(workspace)
//!     .store(store)
//!     .provider(provider)
//!     .build()?;
//!
//! let report = service.query(QueryRequest::new("Where is login defined?")).await?;
//! println!("{}", report.final_response.unwrap_or_default());
//! ```

pub mod accountant;
pub mod envelope;
pub mod error;
pub mod event;
pub mod evidence;
pub mod llm;
pub mod pipeline;
pub mod service;
pub mod storage;
pub mod tools;
pub mod workspace;

// Re-exports for convenience
pub use accountant::{InMemoryTracker, QuotaDecision, QuotaLimits, ResourceTracker, UnboundedTracker};
pub use envelope::{Envelope, RequestId, ResourceUsage, TerminationReason};
pub use error::{Error, Result};
pub use event::{AnalysisEvent, EventStream, StageEvent, StageStatus, TerminalReport};
pub use evidence::{Citation, CitationSet, SupportReport};
pub use llm::{AnthropicProvider, Completion, CompletionOptions, LlmProvider, ProviderConfig};
pub use pipeline::{
    CriticVerdict, PipelineConfig, PipelineRuntime, Stage, StageMocks, StageOutput,
    MAX_REINTENT_CYCLES,
};
pub use service::{AnalysisService, AnalysisServiceBuilder, QueryOptions, QueryRequest};
pub use storage::{ScoredSymbol, SqliteStore, SymbolRecord, EMBEDDING_DIM};
pub use tools::{
    builtin_registry, AttemptOutcome, AttemptRecord, CodeMatch, ContextBounds, FileSlice,
    RiskLevel, ToolCategory, ToolContext, ToolData, ToolRegistry, ToolResult, ToolSpec,
    ToolStatus,
};
pub use workspace::Workspace;
