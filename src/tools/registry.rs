//! Tool registry: name → implementation plus frozen metadata.
//!
//! The registry is built at startup and frozen before any request is served.
//! Registration after freezing, and registration of anything that is not
//! read-only, are startup-time errors.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::tools::composed::{ReadCodeTool, SearchCodeTool};
use crate::tools::primitives;
use crate::tools::types::{RiskLevel, ToolResult, ToolSpec};
use crate::tools::ToolContext;

/// A registered tool implementation.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult>;
}

/// Name → tool lookup with freeze semantics.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    frozen: bool,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            frozen: false,
        }
    }

    /// Register a tool. Rejects write-capable tools and post-freeze
    /// registration.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let spec = tool.spec();
        if self.frozen {
            return Err(Error::Config(format!(
                "registry is frozen; cannot register {:?}",
                spec.name
            )));
        }
        if spec.risk != RiskLevel::ReadOnly {
            return Err(Error::Config(format!(
                "tool {:?} is not read-only and cannot be registered",
                spec.name
            )));
        }
        if self.tools.contains_key(&spec.name) {
            return Err(Error::Config(format!(
                "tool {:?} is already registered",
                spec.name
            )));
        }
        self.tools.insert(spec.name.clone(), tool);
        Ok(())
    }

    /// Freeze the registry; registrations made so far become the catalog.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Catalog of registered tools, sorted by name.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Validate arguments against the tool's schema and invoke it.
    ///
    /// An unknown tool name is an [`Error::ToolUnavailable`]; the executor
    /// turns that into a `tool_unavailable` step result and continues.
    pub async fn invoke(&self, name: &str, ctx: &ToolContext, args: &Value) -> Result<ToolResult> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| Error::ToolUnavailable(name.to_string()))?;
        tool.spec().validate_args(args)?;
        tool.invoke(ctx, args).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build and freeze the standard registry: fifteen primitives plus the two
/// composed tools.
pub fn builtin_registry() -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(primitives::ReadFileTool))?;
    registry.register(Arc::new(primitives::GlobFilesTool))?;
    registry.register(Arc::new(primitives::GrepSearchTool))?;
    registry.register(Arc::new(primitives::TreeTool))?;
    registry.register(Arc::new(primitives::FindSymbolTool))?;
    registry.register(Arc::new(primitives::GetFileSymbolsTool))?;
    registry.register(Arc::new(primitives::GetImportsTool))?;
    registry.register(Arc::new(primitives::GetImportersTool))?;
    registry.register(Arc::new(primitives::SemanticSearchTool))?;
    registry.register(Arc::new(primitives::FindSimilarFilesTool))?;
    registry.register(Arc::new(primitives::GitLogTool))?;
    registry.register(Arc::new(primitives::GitBlameTool))?;
    registry.register(Arc::new(primitives::GitDiffTool))?;
    registry.register(Arc::new(primitives::GitStatusTool))?;
    registry.register(Arc::new(primitives::ListToolsTool))?;
    registry.register(Arc::new(SearchCodeTool))?;
    registry.register(Arc::new(ReadCodeTool))?;

    registry.freeze();
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::types::{ToolCategory, ToolData};

    struct FakeWriteTool;

    #[async_trait]
    impl Tool for FakeWriteTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("file_write", "Write a file", ToolCategory::Primitive)
                .with_risk(RiskLevel::Mutating)
        }

        async fn invoke(&self, _ctx: &ToolContext, _args: &Value) -> Result<ToolResult> {
            Ok(ToolResult::success("file_write", "direct", ToolData::None))
        }
    }

    struct HarmlessTool;

    #[async_trait]
    impl Tool for HarmlessTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("noop", "Do nothing", ToolCategory::Primitive)
        }

        async fn invoke(&self, _ctx: &ToolContext, _args: &Value) -> Result<ToolResult> {
            Ok(ToolResult::success("noop", "direct", ToolData::None))
        }
    }

    #[test]
    fn test_write_capable_tool_rejected_at_registration() {
        let mut registry = ToolRegistry::new();
        let err = registry.register(Arc::new(FakeWriteTool)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!registry.contains("file_write"));
    }

    #[test]
    fn test_post_freeze_registration_rejected() {
        let mut registry = ToolRegistry::new();
        registry.freeze();
        let err = registry.register(Arc::new(HarmlessTool)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(HarmlessTool)).unwrap();
        assert!(registry.register(Arc::new(HarmlessTool)).is_err());
    }

    #[test]
    fn test_builtin_registry_is_frozen_and_complete() {
        let registry = builtin_registry().unwrap();
        assert!(registry.is_frozen());
        for name in [
            "read_file",
            "glob_files",
            "grep_search",
            "tree",
            "find_symbol",
            "get_file_symbols",
            "get_imports",
            "get_importers",
            "semantic_search",
            "find_similar_files",
            "git_log",
            "git_blame",
            "git_diff",
            "git_status",
            "list_tools",
            "search_code",
            "read_code",
        ] {
            assert!(registry.contains(name), "missing {name}");
        }
        assert_eq!(registry.specs().len(), 17);
    }

    #[test]
    fn test_every_builtin_is_read_only() {
        let registry = builtin_registry().unwrap();
        assert!(registry
            .specs()
            .iter()
            .all(|spec| spec.risk == RiskLevel::ReadOnly));
    }
}
