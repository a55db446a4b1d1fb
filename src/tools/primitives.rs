//! Primitive tools: direct filesystem, index, git, and vector operations.
//!
//! Primitives are not callable by the planner; they back the composed
//! fallback chains and are registered for transparency (`list_tools`).

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::storage::SymbolRecord;
use crate::tools::registry::Tool;
use crate::tools::types::{
    AttemptRecord, CodeMatch, ParamSpec, ToolCategory, ToolData, ToolResult,
};
use crate::tools::ToolContext;

// ==================== argument helpers ====================

pub(crate) fn str_arg(args: &Value, name: &str) -> Option<String> {
    args.get(name)?.as_str().map(|s| s.to_string())
}

pub(crate) fn u32_arg(args: &Value, name: &str) -> Option<u32> {
    args.get(name)?.as_u64().map(|n| n as u32)
}

pub(crate) fn usize_arg(args: &Value, name: &str) -> Option<usize> {
    args.get(name)?.as_u64().map(|n| n as usize)
}

pub(crate) fn bool_arg(args: &Value, name: &str) -> Option<bool> {
    args.get(name)?.as_bool()
}

/// Turn an index record into a match, preferring the real source line.
pub(crate) fn symbol_match(ctx: &ToolContext, record: &SymbolRecord) -> CodeMatch {
    let text = ctx
        .workspace
        .read_slice(
            &record.path,
            Some(record.line_start),
            Some(record.line_start),
            64,
        )
        .map(|slice| slice.content)
        .ok()
        .filter(|line| !line.is_empty())
        .unwrap_or_else(|| format!("{} {}", record.kind, record.symbol));
    CodeMatch::new(record.path.clone(), record.line_start, text)
        .with_symbol(record.symbol.clone(), record.kind.clone())
}

fn matches_result(
    tool: &str,
    strategy: &str,
    matches: Vec<CodeMatch>,
) -> ToolResult {
    if matches.is_empty() {
        ToolResult::not_found(tool)
            .with_attempts(vec![AttemptRecord::miss(tool, strategy)])
    } else {
        let count = matches.len();
        ToolResult::success(tool, strategy, ToolData::Matches(matches))
            .with_attempts(vec![AttemptRecord::hit(tool, strategy, count)])
    }
}

// ==================== filesystem primitives ====================

pub async fn read_file(
    ctx: &ToolContext,
    path: &str,
    start_line: Option<u32>,
    end_line: Option<u32>,
) -> ToolResult {
    const TOOL: &str = "read_file";
    if !ctx.workspace.is_file(path) {
        return ToolResult::not_found(TOOL)
            .with_attempts(vec![AttemptRecord::miss(TOOL, "exact_path")]);
    }
    match ctx
        .workspace
        .read_slice(path, start_line, end_line, ctx.bounds.max_file_slice_tokens)
    {
        Ok(slice) => ToolResult::success(TOOL, "exact_path", ToolData::Slice(slice))
            .with_attempts(vec![AttemptRecord::hit(TOOL, "exact_path", 1)]),
        Err(e) => ToolResult::error(TOOL, e.to_string())
            .with_attempts(vec![AttemptRecord::failed(TOOL, "exact_path", e.to_string())]),
    }
}

pub async fn glob_files(ctx: &ToolContext, pattern: &str) -> ToolResult {
    const TOOL: &str = "glob_files";
    match ctx.workspace.glob(pattern, ctx.bounds.max_grep_results) {
        Ok(paths) if paths.is_empty() => {
            ToolResult::not_found(TOOL).with_attempts(vec![AttemptRecord::miss(TOOL, "glob")])
        }
        Ok(paths) => {
            let count = paths.len();
            ToolResult::success(TOOL, "glob", ToolData::Entries(paths))
                .with_attempts(vec![AttemptRecord::hit(TOOL, "glob", count)])
        }
        Err(e) => ToolResult::error(TOOL, e.to_string())
            .with_attempts(vec![AttemptRecord::failed(TOOL, "glob", e.to_string())]),
    }
}

pub async fn grep_search(
    ctx: &ToolContext,
    pattern: &str,
    scope: Option<&str>,
    case_insensitive: bool,
) -> ToolResult {
    const TOOL: &str = "grep_search";
    let strategy = if case_insensitive {
        "grep_insensitive"
    } else {
        "grep"
    };
    match ctx
        .workspace
        .grep(pattern, scope, case_insensitive, ctx.bounds.max_grep_results)
    {
        Ok(matches) => matches_result(TOOL, strategy, matches),
        Err(e) => ToolResult::error(TOOL, e.to_string())
            .with_attempts(vec![AttemptRecord::failed(TOOL, strategy, e.to_string())]),
    }
}

pub async fn tree(ctx: &ToolContext, depth: Option<usize>) -> ToolResult {
    const TOOL: &str = "tree";
    let depth = depth
        .unwrap_or(ctx.bounds.max_tree_depth)
        .min(ctx.bounds.max_tree_depth);
    let entries = ctx.workspace.list_tree(depth);
    if entries.is_empty() {
        ToolResult::not_found(TOOL).with_attempts(vec![AttemptRecord::miss(TOOL, "walk")])
    } else {
        let count = entries.len();
        ToolResult::success(TOOL, "walk", ToolData::Entries(entries))
            .with_attempts(vec![AttemptRecord::hit(TOOL, "walk", count)])
    }
}

pub async fn find_similar_files(ctx: &ToolContext, path: &str) -> ToolResult {
    const TOOL: &str = "find_similar_files";
    let similar = ctx
        .workspace
        .similar_files(path, ctx.bounds.max_files_per_query);
    if similar.is_empty() {
        ToolResult::not_found(TOOL).with_attempts(vec![AttemptRecord::miss(TOOL, "stem_match")])
    } else {
        let count = similar.len();
        ToolResult::success(TOOL, "stem_match", ToolData::Candidates(similar))
            .with_attempts(vec![AttemptRecord::hit(TOOL, "stem_match", count)])
    }
}

// ==================== index primitives ====================

pub async fn find_symbol(
    ctx: &ToolContext,
    name: &str,
    scope: Option<&str>,
    kind: Option<&str>,
    prefix: bool,
) -> ToolResult {
    const TOOL: &str = "find_symbol";
    let strategy = if prefix { "partial_symbol" } else { "exact_symbol" };
    let lookup = if prefix {
        ctx.store
            .symbols_prefix(name, scope, kind, ctx.bounds.max_symbol_results)
    } else {
        ctx.store
            .symbols_exact(name, scope, kind, ctx.bounds.max_symbol_results)
    };
    match lookup {
        Ok(records) => {
            let matches = records.iter().map(|r| symbol_match(ctx, r)).collect();
            matches_result(TOOL, strategy, matches)
        }
        Err(e) => ToolResult::error(TOOL, e.to_string())
            .with_attempts(vec![AttemptRecord::failed(TOOL, strategy, e.to_string())]),
    }
}

pub async fn get_file_symbols(ctx: &ToolContext, path: &str) -> ToolResult {
    const TOOL: &str = "get_file_symbols";
    match ctx.store.file_symbols(path, ctx.bounds.max_symbol_results) {
        Ok(records) => {
            let matches = records.iter().map(|r| symbol_match(ctx, r)).collect();
            matches_result(TOOL, "file_symbols", matches)
        }
        Err(e) => ToolResult::error(TOOL, e.to_string()).with_attempts(vec![
            AttemptRecord::failed(TOOL, "file_symbols", e.to_string()),
        ]),
    }
}

pub async fn get_imports(ctx: &ToolContext, path: &str) -> ToolResult {
    const TOOL: &str = "get_imports";
    match ctx.store.imports_of(path, ctx.bounds.max_symbol_results) {
        Ok(records) => {
            let matches = records.iter().map(|r| symbol_match(ctx, r)).collect();
            matches_result(TOOL, "imports", matches)
        }
        Err(e) => ToolResult::error(TOOL, e.to_string())
            .with_attempts(vec![AttemptRecord::failed(TOOL, "imports", e.to_string())]),
    }
}

pub async fn get_importers(ctx: &ToolContext, module: &str) -> ToolResult {
    const TOOL: &str = "get_importers";
    match ctx.store.importers_of(module, ctx.bounds.max_symbol_results) {
        Ok(records) => {
            let matches = records.iter().map(|r| symbol_match(ctx, r)).collect();
            matches_result(TOOL, "importers", matches)
        }
        Err(e) => ToolResult::error(TOOL, e.to_string())
            .with_attempts(vec![AttemptRecord::failed(TOOL, "importers", e.to_string())]),
    }
}

pub async fn semantic_search(
    ctx: &ToolContext,
    query: &str,
    scope: Option<&str>,
    k: Option<usize>,
) -> ToolResult {
    const TOOL: &str = "semantic_search";
    let k = k.unwrap_or(10).min(ctx.bounds.max_symbol_results);

    let embedding = match ctx.provider.embed(&[query.to_string()]).await {
        Ok(mut vectors) if !vectors.is_empty() => vectors.remove(0),
        Ok(_) => {
            return ToolResult::error(TOOL, "embedding provider returned nothing")
                .with_attempts(vec![AttemptRecord::failed(TOOL, "semantic", "empty embedding")]);
        }
        Err(e) => {
            return ToolResult::error(TOOL, e.to_string())
                .with_attempts(vec![AttemptRecord::failed(TOOL, "semantic", e.to_string())]);
        }
    };

    match ctx.store.vector_search(&embedding, k, scope) {
        Ok(scored) => {
            let matches = scored
                .iter()
                .map(|s| symbol_match(ctx, &s.record).with_score(s.score))
                .collect();
            matches_result(TOOL, "semantic", matches)
        }
        Err(e) => ToolResult::error(TOOL, e.to_string())
            .with_attempts(vec![AttemptRecord::failed(TOOL, "semantic", e.to_string())]),
    }
}

// ==================== git primitives ====================

fn git_result(tool: &str, output: crate::error::Result<String>) -> ToolResult {
    match output {
        Ok(text) if text.trim().is_empty() => {
            ToolResult::not_found(tool).with_attempts(vec![AttemptRecord::miss(tool, "git")])
        }
        Ok(text) => ToolResult::success(tool, "git", ToolData::Text(text))
            .with_attempts(vec![AttemptRecord::hit(tool, "git", 1)]),
        Err(e) => ToolResult::error(tool, e.to_string())
            .with_attempts(vec![AttemptRecord::failed(tool, "git", e.to_string())]),
    }
}

pub async fn git_log(ctx: &ToolContext, path: Option<&str>, limit: Option<usize>) -> ToolResult {
    git_result("git_log", ctx.workspace.git_log(path, limit.unwrap_or(20)))
}

pub async fn git_blame(
    ctx: &ToolContext,
    path: &str,
    start_line: Option<u32>,
    end_line: Option<u32>,
) -> ToolResult {
    git_result("git_blame", ctx.workspace.git_blame(path, start_line, end_line))
}

pub async fn git_diff(ctx: &ToolContext, target: Option<&str>) -> ToolResult {
    git_result("git_diff", ctx.workspace.git_diff(target))
}

pub async fn git_status(ctx: &ToolContext) -> ToolResult {
    git_result("git_status", ctx.workspace.git_status())
}

// ==================== catalog primitive ====================

pub async fn list_tools(ctx: &ToolContext) -> ToolResult {
    const TOOL: &str = "list_tools";
    let count = ctx.catalog.len();
    ToolResult::success(TOOL, "catalog", ToolData::Tools(ctx.catalog.clone()))
        .with_attempts(vec![AttemptRecord::hit(TOOL, "catalog", count)])
}

// ==================== registry wrappers ====================

macro_rules! primitive_spec {
    ($name:expr, $description:expr, $params:expr) => {
        ToolSpec::new($name, $description, ToolCategory::Primitive).with_params($params)
    };
}

use crate::tools::types::ToolSpec;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn spec(&self) -> ToolSpec {
        primitive_spec!(
            "read_file",
            "Read a line range of a file",
            vec![
                ParamSpec::required_string("path", "File path relative to the repository root"),
                ParamSpec::optional_integer("start_line", "First line (1-indexed)"),
                ParamSpec::optional_integer("end_line", "Last line (inclusive)"),
            ]
        )
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult> {
        let path = str_arg(args, "path").unwrap_or_default();
        Ok(read_file(ctx, &path, u32_arg(args, "start_line"), u32_arg(args, "end_line")).await)
    }
}

pub struct GlobFilesTool;

#[async_trait]
impl Tool for GlobFilesTool {
    fn spec(&self) -> ToolSpec {
        primitive_spec!(
            "glob_files",
            "List files matching a glob pattern",
            vec![ParamSpec::required_string("pattern", "Glob pattern, e.g. src/**/*.py")]
        )
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult> {
        let pattern = str_arg(args, "pattern").unwrap_or_default();
        Ok(glob_files(ctx, &pattern).await)
    }
}

pub struct GrepSearchTool;

#[async_trait]
impl Tool for GrepSearchTool {
    fn spec(&self) -> ToolSpec {
        primitive_spec!(
            "grep_search",
            "Regex search over file contents",
            vec![
                ParamSpec::required_string("pattern", "Regex pattern"),
                ParamSpec::optional_string("scope", "Restrict to a path prefix"),
                ParamSpec::new(
                    "case_insensitive",
                    crate::tools::types::ParamKind::Boolean,
                    false,
                    "Ignore case",
                ),
            ]
        )
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult> {
        let pattern = str_arg(args, "pattern").unwrap_or_default();
        Ok(grep_search(
            ctx,
            &pattern,
            str_arg(args, "scope").as_deref(),
            bool_arg(args, "case_insensitive").unwrap_or(false),
        )
        .await)
    }
}

pub struct TreeTool;

#[async_trait]
impl Tool for TreeTool {
    fn spec(&self) -> ToolSpec {
        primitive_spec!(
            "tree",
            "Depth-bounded listing of the repository layout",
            vec![ParamSpec::optional_integer("depth", "Maximum depth")]
        )
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult> {
        Ok(tree(ctx, usize_arg(args, "depth")).await)
    }
}

pub struct FindSymbolTool;

#[async_trait]
impl Tool for FindSymbolTool {
    fn spec(&self) -> ToolSpec {
        primitive_spec!(
            "find_symbol",
            "Look up a symbol in the code index",
            vec![
                ParamSpec::required_string("name", "Symbol name"),
                ParamSpec::optional_string("scope", "Restrict to a path prefix"),
                ParamSpec::optional_string("kind", "Symbol kind filter"),
                ParamSpec::new(
                    "prefix",
                    crate::tools::types::ParamKind::Boolean,
                    false,
                    "Prefix match instead of exact",
                ),
            ]
        )
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult> {
        let name = str_arg(args, "name").unwrap_or_default();
        Ok(find_symbol(
            ctx,
            &name,
            str_arg(args, "scope").as_deref(),
            str_arg(args, "kind").as_deref(),
            bool_arg(args, "prefix").unwrap_or(false),
        )
        .await)
    }
}

pub struct GetFileSymbolsTool;

#[async_trait]
impl Tool for GetFileSymbolsTool {
    fn spec(&self) -> ToolSpec {
        primitive_spec!(
            "get_file_symbols",
            "Symbols defined in a file",
            vec![ParamSpec::required_string("path", "File path")]
        )
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult> {
        let path = str_arg(args, "path").unwrap_or_default();
        Ok(get_file_symbols(ctx, &path).await)
    }
}

pub struct GetImportsTool;

#[async_trait]
impl Tool for GetImportsTool {
    fn spec(&self) -> ToolSpec {
        primitive_spec!(
            "get_imports",
            "Modules imported by a file",
            vec![ParamSpec::required_string("path", "File path")]
        )
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult> {
        let path = str_arg(args, "path").unwrap_or_default();
        Ok(get_imports(ctx, &path).await)
    }
}

pub struct GetImportersTool;

#[async_trait]
impl Tool for GetImportersTool {
    fn spec(&self) -> ToolSpec {
        primitive_spec!(
            "get_importers",
            "Files importing a module",
            vec![ParamSpec::required_string("module", "Module name")]
        )
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult> {
        let module = str_arg(args, "module").unwrap_or_default();
        Ok(get_importers(ctx, &module).await)
    }
}

pub struct SemanticSearchTool;

#[async_trait]
impl Tool for SemanticSearchTool {
    fn spec(&self) -> ToolSpec {
        primitive_spec!(
            "semantic_search",
            "Vector-similarity search over indexed code",
            vec![
                ParamSpec::required_string("query", "Natural-language query"),
                ParamSpec::optional_string("scope", "Restrict to a path prefix"),
                ParamSpec::optional_integer("k", "Number of results"),
            ]
        )
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult> {
        let query = str_arg(args, "query").unwrap_or_default();
        Ok(semantic_search(
            ctx,
            &query,
            str_arg(args, "scope").as_deref(),
            usize_arg(args, "k"),
        )
        .await)
    }
}

pub struct FindSimilarFilesTool;

#[async_trait]
impl Tool for FindSimilarFilesTool {
    fn spec(&self) -> ToolSpec {
        primitive_spec!(
            "find_similar_files",
            "Files with names similar to the given path",
            vec![ParamSpec::required_string("path", "Reference path")]
        )
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult> {
        let path = str_arg(args, "path").unwrap_or_default();
        Ok(find_similar_files(ctx, &path).await)
    }
}

pub struct GitLogTool;

#[async_trait]
impl Tool for GitLogTool {
    fn spec(&self) -> ToolSpec {
        primitive_spec!(
            "git_log",
            "Recent commit history",
            vec![
                ParamSpec::optional_string("path", "Restrict to a path"),
                ParamSpec::optional_integer("limit", "Number of commits"),
            ]
        )
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult> {
        Ok(git_log(ctx, str_arg(args, "path").as_deref(), usize_arg(args, "limit")).await)
    }
}

pub struct GitBlameTool;

#[async_trait]
impl Tool for GitBlameTool {
    fn spec(&self) -> ToolSpec {
        primitive_spec!(
            "git_blame",
            "Line-by-line authorship of a file",
            vec![
                ParamSpec::required_string("path", "File path"),
                ParamSpec::optional_integer("start_line", "First line"),
                ParamSpec::optional_integer("end_line", "Last line"),
            ]
        )
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult> {
        let path = str_arg(args, "path").unwrap_or_default();
        Ok(git_blame(
            ctx,
            &path,
            u32_arg(args, "start_line"),
            u32_arg(args, "end_line"),
        )
        .await)
    }
}

pub struct GitDiffTool;

#[async_trait]
impl Tool for GitDiffTool {
    fn spec(&self) -> ToolSpec {
        primitive_spec!(
            "git_diff",
            "Working-tree diff summary",
            vec![ParamSpec::optional_string("target", "Commit or range to diff against")]
        )
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult> {
        Ok(git_diff(ctx, str_arg(args, "target").as_deref()).await)
    }
}

pub struct GitStatusTool;

#[async_trait]
impl Tool for GitStatusTool {
    fn spec(&self) -> ToolSpec {
        primitive_spec!("git_status", "Working-tree status", vec![])
    }

    async fn invoke(&self, ctx: &ToolContext, _args: &Value) -> Result<ToolResult> {
        Ok(git_status(ctx).await)
    }
}

pub struct ListToolsTool;

#[async_trait]
impl Tool for ListToolsTool {
    fn spec(&self) -> ToolSpec {
        primitive_spec!("list_tools", "The registered tool catalog", vec![])
    }

    async fn invoke(&self, ctx: &ToolContext, _args: &Value) -> Result<ToolResult> {
        Ok(list_tools(ctx).await)
    }
}
