//! Read-only codebase-exploration tools.
//!
//! Primitives talk to the workspace, index, and git directly; the two
//! composed tools (`search_code`, `read_code`) are deterministic fallback
//! chains over them and are the only tools the planner may name.

pub mod composed;
pub mod primitives;
pub mod registry;
pub mod types;

pub use registry::{builtin_registry, Tool, ToolRegistry};
pub use types::{
    AttemptOutcome, AttemptRecord, CodeMatch, FileSlice, ParamKind, ParamSpec, RiskLevel,
    ToolCategory, ToolData, ToolResult, ToolSpec, ToolStatus,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::llm::LlmProvider;
use crate::storage::SqliteStore;
use crate::workspace::Workspace;

/// Tools the planner is allowed to emit.
pub const EXPOSED_TOOLS: &[&str] = &["search_code", "read_code"];

/// Context-window protection limits, enforced by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBounds {
    pub max_tree_depth: usize,
    pub max_file_slice_tokens: usize,
    pub max_grep_results: usize,
    pub max_symbol_results: usize,
    pub max_files_per_query: usize,
    pub max_total_code_tokens: usize,
    pub max_llm_calls_per_query: u64,
    pub max_agent_hops_per_query: u64,
}

impl Default for ContextBounds {
    fn default() -> Self {
        Self {
            max_tree_depth: 10,
            max_file_slice_tokens: 4_000,
            max_grep_results: 50,
            max_symbol_results: 100,
            max_files_per_query: 10,
            max_total_code_tokens: 25_000,
            max_llm_calls_per_query: 10,
            max_agent_hops_per_query: 21,
        }
    }
}

/// Shared handles every tool invocation receives.
#[derive(Clone)]
pub struct ToolContext {
    pub workspace: Arc<Workspace>,
    pub store: Arc<SqliteStore>,
    pub provider: Arc<dyn LlmProvider>,
    pub bounds: ContextBounds,
    /// Frozen registry catalog, for the `list_tools` primitive
    pub catalog: Vec<ToolSpec>,
}

impl ToolContext {
    pub fn new(
        workspace: Arc<Workspace>,
        store: Arc<SqliteStore>,
        provider: Arc<dyn LlmProvider>,
        bounds: ContextBounds,
    ) -> Self {
        Self {
            workspace,
            store,
            provider,
            bounds,
            catalog: Vec::new(),
        }
    }

    pub fn with_catalog(mut self, catalog: Vec<ToolSpec>) -> Self {
        self.catalog = catalog;
        self
    }
}
