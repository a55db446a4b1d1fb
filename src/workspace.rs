//! Read-only access to the repository under analysis.
//!
//! All tool-facing paths are relative to the workspace root. The workspace
//! never writes; git access goes through the `git` binary in read-only
//! subcommands.

use regex::RegexBuilder;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::tools::types::{approx_tokens, CodeMatch, FileSlice};

/// Extensions that commonly shadow each other; tried when an exact path
/// lookup misses.
pub const EXTENSION_SWAPS: &[(&str, &str)] = &[
    ("py", "pyi"),
    ("pyi", "py"),
    ("ts", "tsx"),
    ("tsx", "ts"),
    ("js", "jsx"),
    ("jsx", "js"),
    ("h", "c"),
    ("c", "h"),
];

/// Files larger than this are skipped by grep strategies.
const MAX_GREP_FILE_BYTES: u64 = 512 * 1024;

/// Hard cap on entries returned by tree/name walks.
const MAX_WALK_ENTRIES: usize = 1_000;

/// A repository root plus the read operations the tool layer needs.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open a workspace rooted at an existing directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root: PathBuf = root.into();
        let root = root
            .canonicalize()
            .map_err(|e| Error::workspace(format!("cannot open workspace root: {e}")))?;
        if !root.is_dir() {
            return Err(Error::workspace(format!(
                "workspace root is not a directory: {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path inside the root, rejecting escapes.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let rel_path = Path::new(rel);
        if rel_path.is_absolute() {
            return Err(Error::workspace(format!("absolute path not allowed: {rel}")));
        }
        let mut depth: i32 = 0;
        let mut normalized = PathBuf::new();
        for component in rel_path.components() {
            match component {
                Component::Normal(part) => {
                    depth += 1;
                    normalized.push(part);
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(Error::workspace(format!(
                            "path escapes the workspace: {rel}"
                        )));
                    }
                    normalized.pop();
                }
                _ => {
                    return Err(Error::workspace(format!("unsupported path: {rel}")));
                }
            }
        }
        Ok(self.root.join(normalized))
    }

    /// Whether a relative path names an existing file.
    pub fn is_file(&self, rel: &str) -> bool {
        self.resolve(rel).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Read a 1-indexed, inclusive line range, bounded by a token cap.
    ///
    /// Line numbers are clamped into the file; a range starting past the end
    /// of the file yields an empty slice at the last line.
    pub fn read_slice(
        &self,
        rel: &str,
        start_line: Option<u32>,
        end_line: Option<u32>,
        max_tokens: usize,
    ) -> Result<FileSlice> {
        let path = self.resolve(rel)?;
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::workspace(format!("cannot read {rel}: {e}")))?;
        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len() as u32;

        let start = start_line.unwrap_or(1).max(1).min(total.max(1));
        let end = end_line.unwrap_or(total).min(total).max(start.saturating_sub(1));

        let mut kept = Vec::new();
        let mut tokens = 0usize;
        let mut truncated = false;
        let mut last = start.saturating_sub(1);
        for (idx, line) in lines
            .iter()
            .enumerate()
            .skip(start.saturating_sub(1) as usize)
            .take(end.saturating_sub(start.saturating_sub(1)) as usize)
        {
            let line_tokens = approx_tokens(line) + 1;
            if tokens + line_tokens > max_tokens && !kept.is_empty() {
                truncated = true;
                break;
            }
            tokens += line_tokens;
            kept.push(*line);
            last = idx as u32 + 1;
        }

        Ok(FileSlice {
            path: rel.to_string(),
            start_line: start,
            end_line: last.max(start),
            content: kept.join("\n"),
            truncated,
        })
    }

    /// Candidate sibling paths produced by swapping the file extension.
    pub fn extension_swap_candidates(&self, rel: &str) -> Vec<String> {
        let path = Path::new(rel);
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return Vec::new();
        };
        EXTENSION_SWAPS
            .iter()
            .filter(|(from, _)| *from == ext)
            .map(|(_, to)| path.with_extension(to).to_string_lossy().into_owned())
            .collect()
    }

    fn walk<F>(&self, max_depth: usize, visit: &mut F)
    where
        F: FnMut(&Path, bool) -> bool,
    {
        fn recurse<F>(root: &Path, dir: &Path, depth: usize, budget: &mut usize, visit: &mut F)
        where
            F: FnMut(&Path, bool) -> bool,
        {
            if depth == 0 || *budget == 0 {
                return;
            }
            let Ok(entries) = fs::read_dir(dir) else {
                return;
            };
            let mut entries: Vec<_> = entries.flatten().collect();
            entries.sort_by_key(|e| e.file_name());
            for entry in entries {
                if *budget == 0 {
                    return;
                }
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') {
                    continue;
                }
                let path = entry.path();
                let is_dir = path.is_dir();
                let rel = path.strip_prefix(root).unwrap_or(&path);
                *budget -= 1;
                if !visit(rel, is_dir) {
                    return;
                }
                if is_dir {
                    recurse(root, &path, depth - 1, budget, visit);
                }
            }
        }
        let mut budget = MAX_WALK_ENTRIES;
        recurse(&self.root, &self.root.clone(), max_depth, &mut budget, visit);
    }

    /// Depth-bounded tree listing; directories carry a trailing slash.
    pub fn list_tree(&self, max_depth: usize) -> Vec<String> {
        let mut entries = Vec::new();
        self.walk(max_depth, &mut |rel, is_dir| {
            let mut s = rel.to_string_lossy().into_owned();
            if is_dir {
                s.push('/');
            }
            entries.push(s);
            true
        });
        entries
    }

    /// Relative paths matching a glob pattern, capped.
    pub fn glob(&self, pattern: &str, cap: usize) -> Result<Vec<String>> {
        let full = self.root.join(pattern);
        let full = full
            .to_str()
            .ok_or_else(|| Error::workspace("glob pattern is not valid UTF-8"))?;
        let options = glob::MatchOptions {
            require_literal_leading_dot: true,
            ..Default::default()
        };
        let paths = glob::glob_with(full, options)
            .map_err(|e| Error::workspace(format!("invalid glob pattern: {e}")))?;

        let mut out = Vec::new();
        for entry in paths.flatten() {
            if !entry.is_file() {
                continue;
            }
            if let Ok(rel) = entry.strip_prefix(&self.root) {
                out.push(rel.to_string_lossy().into_owned());
            }
            if out.len() >= cap {
                break;
            }
        }
        out.sort();
        Ok(out)
    }

    /// Files whose name equals `filename`, anywhere under the root.
    pub fn find_by_name(&self, filename: &str, cap: usize) -> Vec<String> {
        let mut out = Vec::new();
        self.walk(usize::MAX, &mut |rel, is_dir| {
            if !is_dir && rel.file_name().map(|n| n == filename).unwrap_or(false) {
                out.push(rel.to_string_lossy().into_owned());
            }
            out.len() < cap
        });
        out.sort();
        out
    }

    /// Files whose stem matches `stem` (any extension), anywhere under the
    /// root.
    pub fn find_by_stem(&self, stem: &str, cap: usize) -> Vec<String> {
        let mut out = Vec::new();
        self.walk(usize::MAX, &mut |rel, is_dir| {
            if !is_dir
                && rel
                    .file_stem()
                    .map(|s| s.to_string_lossy() == stem)
                    .unwrap_or(false)
            {
                out.push(rel.to_string_lossy().into_owned());
            }
            out.len() < cap
        });
        out.sort();
        out
    }

    /// Files whose stem contains (or is contained by) the given file's stem.
    pub fn similar_files(&self, rel: &str, cap: usize) -> Vec<String> {
        let stem = Path::new(rel)
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if stem.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.walk(usize::MAX, &mut |entry, is_dir| {
            if !is_dir {
                let candidate = entry
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_lowercase())
                    .unwrap_or_default();
                let entry_str = entry.to_string_lossy();
                if entry_str != rel
                    && !candidate.is_empty()
                    && (candidate.contains(&stem) || stem.contains(&candidate))
                {
                    out.push(entry_str.into_owned());
                }
            }
            out.len() < cap
        });
        out.sort();
        out
    }

    /// Regex grep over text files under the root, capped at `max_results`.
    pub fn grep(
        &self,
        pattern: &str,
        scope: Option<&str>,
        case_insensitive: bool,
        max_results: usize,
    ) -> Result<Vec<CodeMatch>> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| Error::workspace(format!("invalid regex {pattern:?}: {e}")))?;

        let scope_prefix = scope.map(Path::new);
        let mut matches = Vec::new();
        self.walk(usize::MAX, &mut |rel, is_dir| {
            if is_dir {
                return true;
            }
            if let Some(prefix) = scope_prefix {
                if !rel.starts_with(prefix) {
                    return true;
                }
            }
            let full = self.root.join(rel);
            if fs::metadata(&full)
                .map(|m| m.len() > MAX_GREP_FILE_BYTES)
                .unwrap_or(true)
            {
                return true;
            }
            let Ok(content) = fs::read_to_string(&full) else {
                return true;
            };
            for (idx, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(CodeMatch::new(
                        rel.to_string_lossy().into_owned(),
                        idx as u32 + 1,
                        line.trim_end(),
                    ));
                    if matches.len() >= max_results {
                        return false;
                    }
                }
            }
            true
        });
        Ok(matches)
    }

    // ==================== Git read operations ====================

    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(|e| Error::workspace(format!("failed to spawn git: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::workspace(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub fn git_log(&self, rel: Option<&str>, limit: usize) -> Result<String> {
        let limit = limit.to_string();
        let mut args = vec!["log", "--oneline", "-n", &limit];
        if let Some(rel) = rel {
            args.push("--");
            args.push(rel);
        }
        self.git(&args)
    }

    pub fn git_blame(&self, rel: &str, start: Option<u32>, end: Option<u32>) -> Result<String> {
        let range;
        let mut args = vec!["blame", "--date=short"];
        if let (Some(start), Some(end)) = (start, end) {
            range = format!("-L{start},{end}");
            args.push(&range);
        }
        args.push("--");
        args.push(rel);
        self.git(&args)
    }

    pub fn git_diff(&self, target: Option<&str>) -> Result<String> {
        let mut args = vec!["diff", "--stat"];
        if let Some(target) = target {
            args.push(target);
        }
        self.git(&args)
    }

    pub fn git_status(&self) -> Result<String> {
        self.git(&["status", "--porcelain"])
    }
}
