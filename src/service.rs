//! Service façade: accepts queries, runs the pipeline, yields events.

use futures::stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::accountant::{InMemoryTracker, QuotaLimits, ResourceTracker};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::event::{AnalysisEvent, EventStream, TerminalReport};
use crate::llm::LlmProvider;
use crate::pipeline::runtime::answer_fingerprint;
use crate::pipeline::{PipelineConfig, PipelineRuntime, StageMocks};
use crate::storage::SqliteStore;
use crate::tools::{builtin_registry, ContextBounds, ToolContext};
use crate::workspace::Workspace;

/// Per-request options.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct QueryOptions {
    /// Lower the re-entry budget for this request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reintent: Option<u32>,
    /// Wall-clock deadline; the request is cancelled when it passes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

/// An inbound question about the repository.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<QueryOptions>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            session_id: None,
            options: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Builder for [`AnalysisService`].
pub struct AnalysisServiceBuilder {
    workspace: Option<Arc<Workspace>>,
    store: Option<Arc<SqliteStore>>,
    provider: Option<Arc<dyn LlmProvider>>,
    tracker: Option<Arc<dyn ResourceTracker>>,
    bounds: ContextBounds,
    config: PipelineConfig,
    mocks: StageMocks,
}

impl AnalysisServiceBuilder {
    pub fn new() -> Self {
        Self {
            workspace: None,
            store: None,
            provider: None,
            tracker: None,
            bounds: ContextBounds::default(),
            config: PipelineConfig::default(),
            mocks: StageMocks::new(),
        }
    }

    pub fn workspace(mut self, workspace: Arc<Workspace>) -> Self {
        self.workspace = Some(workspace);
        self
    }

    pub fn store(mut self, store: Arc<SqliteStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn tracker(mut self, tracker: Arc<dyn ResourceTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn bounds(mut self, bounds: ContextBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn mocks(mut self, mocks: StageMocks) -> Self {
        self.mocks = mocks;
        self
    }

    /// Wire everything together. The tool registry is built and frozen here,
    /// before any request can be admitted.
    pub fn build(self) -> Result<AnalysisService> {
        let workspace = self
            .workspace
            .ok_or_else(|| Error::Config("a workspace is required".to_string()))?;
        let provider = self
            .provider
            .ok_or_else(|| Error::Config("an LLM provider is required".to_string()))?;
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(SqliteStore::in_memory()?),
        };
        let tracker: Arc<dyn ResourceTracker> = match self.tracker {
            Some(tracker) => tracker,
            None => Arc::new(InMemoryTracker::new(QuotaLimits {
                max_llm_calls: self.bounds.max_llm_calls_per_query,
                ..Default::default()
            })),
        };

        let registry = Arc::new(builtin_registry()?);
        let ctx = Arc::new(
            ToolContext::new(
                workspace,
                Arc::clone(&store),
                Arc::clone(&provider),
                self.bounds,
            )
            .with_catalog(registry.specs()),
        );

        let runtime = PipelineRuntime::new(provider, registry, ctx, tracker, self.config)
            .with_mocks(self.mocks);

        Ok(AnalysisService {
            runtime: Arc::new(runtime),
            store,
        })
    }
}

impl Default for AnalysisServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point for questions about the repository.
pub struct AnalysisService {
    runtime: Arc<PipelineRuntime>,
    store: Arc<SqliteStore>,
}

impl std::fmt::Debug for AnalysisService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisService").finish_non_exhaustive()
    }
}

impl AnalysisService {
    pub fn builder() -> AnalysisServiceBuilder {
        AnalysisServiceBuilder::new()
    }

    /// Run a query to completion and return the terminal payload.
    pub async fn query(&self, request: QueryRequest) -> Result<TerminalReport> {
        use futures::StreamExt;

        let mut stream = self.query_stream(request);
        let mut terminal = None;
        while let Some(event) = stream.next().await {
            if let AnalysisEvent::Terminal(report) = event {
                terminal = Some(report);
            }
        }
        terminal.ok_or_else(|| Error::Internal("stream ended without a terminal event".to_string()))
    }

    /// Run a query, yielding stage events and ending with the terminal event.
    pub fn query_stream(&self, request: QueryRequest) -> EventStream {
        self.query_stream_with_cancel(request, CancellationToken::new())
    }

    /// Like [`query_stream`](Self::query_stream), with an external
    /// cancellation token. Cancellation is cooperative: the current stage
    /// finishes before the request terminates.
    pub fn query_stream_with_cancel(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> EventStream {
        let options = request.options.clone().unwrap_or_default();

        // A cached answer short-circuits the pipeline entirely.
        if let Some(report) = self.cached_report(&request) {
            return Box::pin(stream::iter(vec![AnalysisEvent::Terminal(report)]));
        }

        let mut env = Envelope::new(request.query, request.session_id);
        if let Some(max) = options.max_reintent {
            env = env.with_max_reintent(max);
        }

        if let Some(deadline_ms) = options.deadline_ms {
            let deadline_cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(deadline_ms)).await;
                deadline_cancel.cancel();
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = Arc::clone(&self.runtime);
        tokio::spawn(async move {
            runtime.run(env, &tx, cancel).await;
        });

        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        }))
    }

    fn cached_report(&self, request: &QueryRequest) -> Option<TerminalReport> {
        let key = answer_fingerprint(&request.query);
        let serialized = self.store.get_understanding(&key).ok().flatten()?;
        let mut report: TerminalReport = serde_json::from_str(&serialized).ok()?;
        report.request_id = crate::envelope::RequestId::new();
        report.timestamp = chrono::Utc::now();
        Some(report)
    }
}
