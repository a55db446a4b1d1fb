//! Tool result, attempt-history, and registry-metadata types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::evidence::Citation;

/// Outcome classification for a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// A strategy produced results
    Success,
    /// Every fallback strategy came up empty
    NotFound,
    /// The tool is not in the registry
    ToolUnavailable,
    /// The tool itself failed
    Error,
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::NotFound => write!(f, "not_found"),
            Self::ToolUnavailable => write!(f, "tool_unavailable"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Whether a tool is a primitive operation or a composed fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Primitive,
    Composed,
}

/// Risk classification. The registry only accepts `ReadOnly` tools; the
/// `Mutating` variant exists so that registration attempts can be expressed
/// and rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    ReadOnly,
    Mutating,
}

/// Parameter value type accepted by a tool argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Boolean,
}

impl ParamKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
        }
    }
}

/// Specification for a single tool parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub description: String,
}

impl ParamSpec {
    pub fn new(
        name: impl Into<String>,
        kind: ParamKind,
        required: bool,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            required,
            description: description.into(),
        }
    }

    pub fn required_string(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, ParamKind::String, true, description)
    }

    pub fn optional_string(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, ParamKind::String, false, description)
    }

    pub fn optional_integer(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Integer, false, description)
    }
}

/// Registry metadata for a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
    pub risk: RiskLevel,
    pub params: Vec<ParamSpec>,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: ToolCategory,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            category,
            risk: RiskLevel::ReadOnly,
            params: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Vec<ParamSpec>) -> Self {
        self.params = params;
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    /// Validate an argument object against this spec.
    ///
    /// Unknown keys, missing required keys, and type mismatches are all
    /// rejected.
    pub fn validate_args(&self, args: &Value) -> Result<()> {
        let empty = Map::new();
        let map: &Map<String, Value> = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(Error::invalid_arguments(
                    &self.name,
                    format!("expected an argument object, got {other}"),
                ))
            }
        };

        for key in map.keys() {
            if !self.params.iter().any(|p| &p.name == key) {
                return Err(Error::invalid_arguments(
                    &self.name,
                    format!("unknown argument {key:?}"),
                ));
            }
        }

        for param in &self.params {
            match map.get(&param.name) {
                Some(Value::Null) | None if param.required => {
                    return Err(Error::invalid_arguments(
                        &self.name,
                        format!("missing required argument {:?}", param.name),
                    ));
                }
                Some(value) if !value.is_null() && !param.kind.matches(value) => {
                    return Err(Error::invalid_arguments(
                        &self.name,
                        format!("argument {:?} has wrong type", param.name),
                    ));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Outcome of one fallback strategy attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The strategy produced `count` results
    Hit { count: usize },
    /// The strategy ran and found nothing
    Miss,
    /// The strategy was not applicable
    Skipped { reason: String },
    /// The strategy itself errored; the chain continues
    Failed { error: String },
}

/// One entry in a tool's attempt history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub tool: String,
    pub strategy: String,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

impl AttemptRecord {
    pub fn hit(tool: impl Into<String>, strategy: impl Into<String>, count: usize) -> Self {
        Self {
            tool: tool.into(),
            strategy: strategy.into(),
            outcome: AttemptOutcome::Hit { count },
        }
    }

    pub fn miss(tool: impl Into<String>, strategy: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            strategy: strategy.into(),
            outcome: AttemptOutcome::Miss,
        }
    }

    pub fn skipped(
        tool: impl Into<String>,
        strategy: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            tool: tool.into(),
            strategy: strategy.into(),
            outcome: AttemptOutcome::Skipped {
                reason: reason.into(),
            },
        }
    }

    pub fn failed(
        tool: impl Into<String>,
        strategy: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            tool: tool.into(),
            strategy: strategy.into(),
            outcome: AttemptOutcome::Failed {
                error: error.into(),
            },
        }
    }
}

/// A single code location produced by a search strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeMatch {
    pub path: String,
    pub line: u32,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl CodeMatch {
    pub fn new(path: impl Into<String>, line: u32, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            line,
            text: text.into(),
            symbol: None,
            kind: None,
            score: None,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>, kind: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self.kind = Some(kind.into());
        self
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.score = Some(score);
        self
    }
}

/// A bounded slice of file content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSlice {
    pub path: String,
    /// 1-indexed first line of the slice
    pub start_line: u32,
    /// 1-indexed last line of the slice (inclusive)
    pub end_line: u32,
    pub content: String,
    /// True if the slice was cut short by the token cap
    pub truncated: bool,
}

/// Structured payload of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolData {
    Matches(Vec<CodeMatch>),
    Slice(FileSlice),
    /// Path candidates without content (stem-glob fallback)
    Candidates(Vec<String>),
    /// Directory or glob listing
    Entries(Vec<String>),
    /// Raw text output (git operations)
    Text(String),
    /// Registry catalog listing
    Tools(Vec<ToolSpec>),
    None,
}

/// Uniform result shape returned by every tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    pub status: ToolStatus,
    /// Name of the strategy that produced the data, when successful
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found_via: Option<String>,
    pub data: ToolData,
    pub attempt_history: Vec<AttemptRecord>,
    pub citations: Vec<Citation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(tool: impl Into<String>, found_via: impl Into<String>, data: ToolData) -> Self {
        let mut result = Self {
            tool: tool.into(),
            status: ToolStatus::Success,
            found_via: Some(found_via.into()),
            data,
            attempt_history: Vec::new(),
            citations: Vec::new(),
            error: None,
        };
        result.citations = crate::evidence::extract_citations(&result);
        result
    }

    pub fn not_found(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            status: ToolStatus::NotFound,
            found_via: None,
            data: ToolData::None,
            attempt_history: Vec::new(),
            citations: Vec::new(),
            error: None,
        }
    }

    pub fn unavailable(tool: impl Into<String>) -> Self {
        let tool = tool.into();
        Self {
            tool: tool.clone(),
            status: ToolStatus::ToolUnavailable,
            found_via: None,
            data: ToolData::None,
            attempt_history: Vec::new(),
            citations: Vec::new(),
            error: Some(format!("no tool named {tool:?} is registered")),
        }
    }

    pub fn error(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            status: ToolStatus::Error,
            found_via: None,
            data: ToolData::None,
            attempt_history: Vec::new(),
            citations: Vec::new(),
            error: Some(message.into()),
        }
    }

    pub fn with_attempts(mut self, attempts: Vec<AttemptRecord>) -> Self {
        self.attempt_history = attempts;
        self
    }

    pub fn with_data(mut self, data: ToolData) -> Self {
        self.data = data;
        self
    }

    /// Rough token footprint of the data payload, for context-bound
    /// accounting.
    pub fn token_estimate(&self) -> usize {
        match &self.data {
            ToolData::Matches(matches) => matches
                .iter()
                .map(|m| approx_tokens(&m.text) + approx_tokens(&m.path))
                .sum(),
            ToolData::Slice(slice) => approx_tokens(&slice.content),
            ToolData::Candidates(items) | ToolData::Entries(items) => {
                items.iter().map(|s| approx_tokens(s)).sum()
            }
            ToolData::Text(text) => approx_tokens(text),
            ToolData::Tools(_) | ToolData::None => 0,
        }
    }
}

/// Crude token estimate: roughly one token per four characters.
pub fn approx_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn spec() -> ToolSpec {
        ToolSpec::new("read_code", "Read a file slice", ToolCategory::Composed).with_params(vec![
            ParamSpec::required_string("path", "File path"),
            ParamSpec::optional_integer("start_line", "First line"),
            ParamSpec::optional_integer("end_line", "Last line"),
        ])
    }

    #[test]
    fn test_validate_args_accepts_valid() {
        let args = json!({"path": "src/main.rs", "start_line": 1});
        assert!(spec().validate_args(&args).is_ok());
    }

    #[test]
    fn test_validate_args_rejects_unknown_key() {
        let args = json!({"path": "src/main.rs", "mode": "write"});
        let err = spec().validate_args(&args).unwrap_err();
        assert!(matches!(err, Error::InvalidArguments { .. }));
    }

    #[test]
    fn test_validate_args_rejects_missing_required() {
        let args = json!({"start_line": 1});
        assert!(spec().validate_args(&args).is_err());
    }

    #[test]
    fn test_validate_args_rejects_wrong_type() {
        let args = json!({"path": 42});
        assert!(spec().validate_args(&args).is_err());
    }

    #[test]
    fn test_validate_args_allows_null_optional() {
        let args = json!({"path": "a.rs", "start_line": null});
        assert!(spec().validate_args(&args).is_ok());
    }

    #[test]
    fn test_success_extracts_citations() {
        let result = ToolResult::success(
            "search_code",
            "grep",
            ToolData::Matches(vec![CodeMatch::new("src/x.rs", 3, "let x = 1;")]),
        );
        assert_eq!(result.citations.len(), 1);
        assert_eq!(result.citations[0].to_string(), "src/x.rs:3");
    }

    #[test]
    fn test_attempt_record_serde_flattens_outcome() {
        let record = AttemptRecord::hit("search_code", "exact_symbol", 2);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["outcome"], "hit");
        assert_eq!(value["count"], 2);
        assert_eq!(value["strategy"], "exact_symbol");
    }

    #[test]
    fn test_token_estimate() {
        assert_eq!(approx_tokens(""), 0);
        assert_eq!(approx_tokens("abcd"), 1);
        assert_eq!(approx_tokens("abcde"), 2);

        let result = ToolResult::success(
            "read_code",
            "exact_path",
            ToolData::Slice(FileSlice {
                path: "a.rs".into(),
                start_line: 1,
                end_line: 1,
                content: "12345678".into(),
                truncated: false,
            }),
        );
        assert_eq!(result.token_estimate(), 2);
    }

    #[test]
    fn test_tool_result_round_trip() {
        let result = ToolResult::not_found("read_code").with_attempts(vec![
            AttemptRecord::miss("read_code", "exact_path"),
            AttemptRecord::skipped("read_code", "extension_swap", "no known swap for .md"),
        ]);
        let json = serde_json::to_string(&result).unwrap();
        let back: ToolResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, ToolStatus::NotFound);
        assert_eq!(back.attempt_history, result.attempt_history);
    }
}
