//! The two composed tools the planner may invoke.
//!
//! Each is a deterministic fallback chain over primitives: strategies run in
//! a fixed order, every attempt is recorded, and the chain returns on the
//! first strategy that produces anything. `not_found` means the whole chain
//! came up empty, which is a normal signal rather than an error.

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;

use crate::error::Result;
use crate::tools::primitives::{str_arg, symbol_match, u32_arg};
use crate::tools::registry::Tool;
use crate::tools::types::{
    AttemptRecord, ParamSpec, ToolCategory, ToolData, ToolResult, ToolSpec,
};
use crate::tools::ToolContext;

const SEARCH_CODE: &str = "search_code";
const READ_CODE: &str = "read_code";

/// Search the codebase for a query.
///
/// Strategy order: exact symbol → partial symbol → case-sensitive grep →
/// case-insensitive grep → vector similarity.
pub async fn search_code(
    ctx: &ToolContext,
    query: &str,
    scope: Option<&str>,
    kind: Option<&str>,
) -> ToolResult {
    let mut attempts = Vec::new();

    // 1. exact symbol match
    match ctx
        .store
        .symbols_exact(query, scope, kind, ctx.bounds.max_symbol_results)
    {
        Ok(records) if !records.is_empty() => {
            attempts.push(AttemptRecord::hit(SEARCH_CODE, "exact_symbol", records.len()));
            let matches = records.iter().map(|r| symbol_match(ctx, r)).collect();
            return ToolResult::success(SEARCH_CODE, "exact_symbol", ToolData::Matches(matches))
                .with_attempts(attempts);
        }
        Ok(_) => attempts.push(AttemptRecord::miss(SEARCH_CODE, "exact_symbol")),
        Err(e) => attempts.push(AttemptRecord::failed(SEARCH_CODE, "exact_symbol", e.to_string())),
    }

    // 2. partial symbol match
    match ctx
        .store
        .symbols_prefix(query, scope, kind, ctx.bounds.max_symbol_results)
    {
        Ok(records) if !records.is_empty() => {
            attempts.push(AttemptRecord::hit(SEARCH_CODE, "partial_symbol", records.len()));
            let matches = records.iter().map(|r| symbol_match(ctx, r)).collect();
            return ToolResult::success(SEARCH_CODE, "partial_symbol", ToolData::Matches(matches))
                .with_attempts(attempts);
        }
        Ok(_) => attempts.push(AttemptRecord::miss(SEARCH_CODE, "partial_symbol")),
        Err(e) => {
            attempts.push(AttemptRecord::failed(SEARCH_CODE, "partial_symbol", e.to_string()))
        }
    }

    // 3/4. grep, case-sensitive then case-insensitive
    for (strategy, case_insensitive) in [("grep", false), ("grep_insensitive", true)] {
        match ctx
            .workspace
            .grep(query, scope, case_insensitive, ctx.bounds.max_grep_results)
        {
            Ok(matches) if !matches.is_empty() => {
                attempts.push(AttemptRecord::hit(SEARCH_CODE, strategy, matches.len()));
                return ToolResult::success(SEARCH_CODE, strategy, ToolData::Matches(matches))
                    .with_attempts(attempts);
            }
            Ok(_) => attempts.push(AttemptRecord::miss(SEARCH_CODE, strategy)),
            Err(e) => attempts.push(AttemptRecord::failed(SEARCH_CODE, strategy, e.to_string())),
        }
    }

    // 5. vector similarity
    match ctx.provider.embed(&[query.to_string()]).await {
        Ok(mut vectors) if !vectors.is_empty() => {
            match ctx.store.vector_search(&vectors.remove(0), 10, scope) {
                Ok(scored) if !scored.is_empty() => {
                    attempts.push(AttemptRecord::hit(SEARCH_CODE, "semantic", scored.len()));
                    let matches = scored
                        .iter()
                        .map(|s| symbol_match(ctx, &s.record).with_score(s.score))
                        .collect();
                    return ToolResult::success(SEARCH_CODE, "semantic", ToolData::Matches(matches))
                        .with_attempts(attempts);
                }
                Ok(_) => attempts.push(AttemptRecord::miss(SEARCH_CODE, "semantic")),
                Err(e) => {
                    attempts.push(AttemptRecord::failed(SEARCH_CODE, "semantic", e.to_string()))
                }
            }
        }
        Ok(_) => attempts.push(AttemptRecord::failed(
            SEARCH_CODE,
            "semantic",
            "embedding provider returned nothing",
        )),
        Err(e) => attempts.push(AttemptRecord::failed(SEARCH_CODE, "semantic", e.to_string())),
    }

    ToolResult::not_found(SEARCH_CODE).with_attempts(attempts)
}

/// Read file content by path, with fallbacks for imprecise paths.
///
/// Strategy order: exact path → extension swap → glob by filename → glob by
/// stem (candidate list only, no content).
pub async fn read_code(
    ctx: &ToolContext,
    path: &str,
    start_line: Option<u32>,
    end_line: Option<u32>,
) -> ToolResult {
    let mut attempts = Vec::new();
    let max_tokens = ctx.bounds.max_file_slice_tokens;

    // 1. exact path
    if ctx.workspace.is_file(path) {
        match ctx.workspace.read_slice(path, start_line, end_line, max_tokens) {
            Ok(slice) => {
                attempts.push(AttemptRecord::hit(READ_CODE, "exact_path", 1));
                return ToolResult::success(READ_CODE, "exact_path", ToolData::Slice(slice))
                    .with_attempts(attempts);
            }
            Err(e) => attempts.push(AttemptRecord::failed(READ_CODE, "exact_path", e.to_string())),
        }
    } else {
        attempts.push(AttemptRecord::miss(READ_CODE, "exact_path"));
    }

    // 2. extension swap
    let swaps = ctx.workspace.extension_swap_candidates(path);
    if swaps.is_empty() {
        attempts.push(AttemptRecord::skipped(
            READ_CODE,
            "extension_swap",
            "no known swap for this extension",
        ));
    } else {
        match swaps.iter().find(|candidate| ctx.workspace.is_file(candidate)) {
            Some(candidate) => {
                match ctx
                    .workspace
                    .read_slice(candidate, start_line, end_line, max_tokens)
                {
                    Ok(slice) => {
                        attempts.push(AttemptRecord::hit(READ_CODE, "extension_swap", 1));
                        return ToolResult::success(
                            READ_CODE,
                            "extension_swap",
                            ToolData::Slice(slice),
                        )
                        .with_attempts(attempts);
                    }
                    Err(e) => attempts.push(AttemptRecord::failed(
                        READ_CODE,
                        "extension_swap",
                        e.to_string(),
                    )),
                }
            }
            None => attempts.push(AttemptRecord::miss(READ_CODE, "extension_swap")),
        }
    }

    // 3. glob by filename anywhere in scope
    let filename = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let by_name = if filename.is_empty() {
        Vec::new()
    } else {
        ctx.workspace
            .find_by_name(&filename, ctx.bounds.max_files_per_query)
    };
    if let Some(found) = by_name.first() {
        match ctx.workspace.read_slice(found, start_line, end_line, max_tokens) {
            Ok(slice) => {
                attempts.push(AttemptRecord::hit(READ_CODE, "glob_filename", by_name.len()));
                return ToolResult::success(READ_CODE, "glob_filename", ToolData::Slice(slice))
                    .with_attempts(attempts);
            }
            Err(e) => {
                attempts.push(AttemptRecord::failed(READ_CODE, "glob_filename", e.to_string()))
            }
        }
    } else {
        attempts.push(AttemptRecord::miss(READ_CODE, "glob_filename"));
    }

    // 4. glob by stem: candidate list only
    let stem = Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let candidates = if stem.is_empty() {
        Vec::new()
    } else {
        ctx.workspace
            .find_by_stem(&stem, ctx.bounds.max_files_per_query)
    };
    if candidates.is_empty() {
        attempts.push(AttemptRecord::miss(READ_CODE, "glob_stem"));
        ToolResult::not_found(READ_CODE).with_attempts(attempts)
    } else {
        attempts.push(AttemptRecord::hit(READ_CODE, "glob_stem", candidates.len()));
        ToolResult::success(READ_CODE, "glob_stem", ToolData::Candidates(candidates))
            .with_attempts(attempts)
    }
}

pub struct SearchCodeTool;

#[async_trait]
impl Tool for SearchCodeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            SEARCH_CODE,
            "Search the codebase: symbol index, grep, then semantic fallback",
            ToolCategory::Composed,
        )
        .with_params(vec![
            ParamSpec::required_string("query", "Symbol name, pattern, or phrase"),
            ParamSpec::optional_string("scope", "Restrict to a path prefix"),
            ParamSpec::optional_string("kind", "Symbol kind filter"),
        ])
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult> {
        let query = str_arg(args, "query").unwrap_or_default();
        Ok(search_code(
            ctx,
            &query,
            str_arg(args, "scope").as_deref(),
            str_arg(args, "kind").as_deref(),
        )
        .await)
    }
}

pub struct ReadCodeTool;

#[async_trait]
impl Tool for ReadCodeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            READ_CODE,
            "Read file content with path-recovery fallbacks",
            ToolCategory::Composed,
        )
        .with_params(vec![
            ParamSpec::required_string("path", "File path, exact or approximate"),
            ParamSpec::optional_integer("start_line", "First line (1-indexed)"),
            ParamSpec::optional_integer("end_line", "Last line (inclusive)"),
        ])
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult> {
        let path = str_arg(args, "path").unwrap_or_default();
        Ok(read_code(
            ctx,
            &path,
            u32_arg(args, "start_line"),
            u32_arg(args, "end_line"),
        )
        .await)
    }
}
