//! The seven stage implementations: pre/core/post hooks.
//!
//! LLM stages build a bounded prompt (pre), call the provider or the stage's
//! mock handler (core), and parse/validate the raw text (post). Deterministic
//! stages run entirely in Rust. Mock handlers are the only supported test
//! substitution point for the LLM.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tokio_util::sync::CancellationToken;

use crate::accountant::ResourceTracker;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::evidence::validate_claims;
use crate::pipeline::context;
use crate::pipeline::outputs::{
    Claim, CriticOutput, CriticVerdict, ExecutorOutput, IntegrationOutput, IntentOutput,
    PerceptionOutput, PlanStep, PlannedTool, PlannerOutput, SynthesizerOutput,
};
use crate::pipeline::Stage;
use crate::storage::SqliteStore;
use crate::tools::registry::ToolRegistry;
use crate::tools::types::{ToolData, ToolResult, ToolStatus};
use crate::tools::{ToolContext, EXPOSED_TOOLS};

/// Deterministic stand-in for one LLM stage's core hook.
pub type MockHandler = Arc<dyn Fn(&Envelope) -> Result<String> + Send + Sync>;

/// Per-stage mock handlers for deterministic testing.
#[derive(Clone, Default)]
pub struct StageMocks {
    handlers: HashMap<Stage, MockHandler>,
}

impl StageMocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a mock for an LLM stage. Deterministic stages cannot be
    /// substituted.
    pub fn set<F>(&mut self, stage: Stage, handler: F) -> Result<()>
    where
        F: Fn(&Envelope) -> Result<String> + Send + Sync + 'static,
    {
        if !stage.is_llm() {
            return Err(Error::Config(format!(
                "stage {stage} does not call the LLM and cannot be mocked"
            )));
        }
        self.handlers.insert(stage, Arc::new(handler));
        Ok(())
    }

    pub fn get(&self, stage: Stage) -> Option<&MockHandler> {
        self.handlers.get(&stage)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ==================== raw-output parsing ====================

/// Pull the first JSON value out of raw model text.
///
/// Accepts bare JSON, fenced blocks, or JSON embedded in prose.
pub(crate) fn extract_json(stage: Stage, raw: &str) -> Result<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    static FENCE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"```(?:json)?\s*([\s\S]*?)```").expect("invalid fence pattern")
    });
    if let Some(captures) = FENCE.captures(trimmed) {
        if let Ok(value) = serde_json::from_str(captures[1].trim()) {
            return Ok(value);
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                    return Ok(value);
                }
            }
        }
    }

    Err(Error::malformed(
        stage.name(),
        format!("no parsable JSON in output: {}", context::snippet(raw)),
    ))
}

// ==================== perception ====================

static HINT_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"(?i)\b(where|defined?|definition|declared?|location)\b")
                .expect("invalid hint pattern"),
            "find_symbol",
        ),
        (
            Regex::new(r"(?i)\b(flow|trace|call(s|ed|er)?|invoke[sd]?|path through)\b")
                .expect("invalid hint pattern"),
            "trace_flow",
        ),
        (
            Regex::new(r"(?i)\b(explain|why|how does|what does|understand)\b")
                .expect("invalid hint pattern"),
            "explain",
        ),
        (
            Regex::new(r"(?i)\b(history|changed?|commit|blame|recent|who wrote)\b")
                .expect("invalid hint pattern"),
            "history",
        ),
    ]
});

/// Perception: pure function of (query, session state). No LLM.
pub fn run_perception(env: &Envelope, store: Option<&SqliteStore>) -> PerceptionOutput {
    let normalized_query = env.query.split_whitespace().collect::<Vec<_>>().join(" ");

    let intent_hints: Vec<String> = HINT_PATTERNS
        .iter()
        .filter(|(pattern, _)| pattern.is_match(&normalized_query))
        .map(|(_, hint)| hint.to_string())
        .collect();

    let session_context_digest = env.session_id.as_deref().and_then(|session_id| {
        let state = store?.load_session(session_id).ok().flatten()?;
        let recent = state.get("recent_query")?.as_str()?;
        let citations = state
            .get("citation_count")
            .and_then(|c| c.as_u64())
            .unwrap_or(0);
        Some(format!(
            "previous question: {recent:?}; {citations} citations on record"
        ))
    });

    PerceptionOutput {
        normalized_query,
        intent_hints,
        session_context_digest,
    }
}

// ==================== intent ====================

const INTENT_INSTRUCTIONS: &str = "\
Classify the question about a source repository. Respond with JSON:
{\"classified_intent\": \"find_symbol\"|\"trace_flow\"|\"explain\"|\"search\"|\"history\",
 \"goals\": [ordered, concrete exploration goals],
 \"ambiguities\": [unclear aspects, if any],
 \"clarification_required\": bool,
 \"clarification_question\": \"...\" (only when clarification_required)}
Set clarification_required only for empty or incomprehensible input; prefer
exploring over asking.";

pub fn intent_prompt(env: &Envelope) -> String {
    format!("{INTENT_INSTRUCTIONS}\n\n{}", context::intent_input(env))
}

/// Parse and police the intent output. The exploration-first policy is
/// enforced here, not trusted to the model.
pub fn parse_intent(env: &Envelope, raw: &str) -> Result<IntentOutput> {
    let value = extract_json(Stage::Intent, raw)?;
    let mut output: IntentOutput = serde_json::from_value(value)
        .map_err(|e| Error::malformed(Stage::Intent.name(), e.to_string()))?;

    let query_is_empty = !env.query.chars().any(|c| c.is_alphanumeric());
    if query_is_empty {
        output.clarification_required = true;
        if output.clarification_question.is_none() {
            output.clarification_question =
                Some("What would you like to know about this repository?".to_string());
        }
    } else {
        output.clarification_required = false;
        output.clarification_question = None;
    }
    if output.goals.is_empty() && !output.clarification_required {
        output.goals.push(env.query.trim().to_string());
    }
    Ok(output)
}

// ==================== planner ====================

const PLANNER_INSTRUCTIONS: &str = "\
Plan tool calls to gather evidence. Only two tools exist:
- search_code(query, scope?, kind?): find symbols or text in the repository
- read_code(path, start_line?, end_line?): read file content
Always search before reading a path you have not seen in evidence. Respond
with JSON: {\"steps\": [{\"tool_name\": \"search_code\"|\"read_code\",
\"arguments\": {...}, \"rationale\": \"...\", \"goal\": \"...\"}]}";

pub fn planner_prompt(env: &Envelope) -> String {
    format!("{PLANNER_INSTRUCTIONS}\n\n{}", context::planner_input(env))
}

#[derive(serde::Deserialize)]
struct RawPlan {
    steps: Vec<PlanStep>,
}

/// Parse the plan, cap its length, and enforce search-before-read.
///
/// A `read_code` step naming a path that no prior evidence and no earlier
/// in-plan `search_code` establishes gets a locating `search_code` step
/// inserted in front of it.
pub fn parse_planner(
    env: &Envelope,
    raw: &str,
    max_steps: usize,
    code_token_budget: u64,
) -> Result<PlannerOutput> {
    let value = extract_json(Stage::Planner, raw)?;
    let plan: RawPlan = serde_json::from_value(value)
        .map_err(|e| Error::malformed(Stage::Planner.name(), e.to_string()))?;

    let mut steps = plan.steps;
    steps.truncate(max_steps);
    let steps = enforce_search_first(env, steps);

    Ok(PlannerOutput {
        context_budget_remaining: code_token_budget.saturating_sub(env.resource_usage.code_tokens),
        steps,
    })
}

fn enforce_search_first(env: &Envelope, steps: Vec<PlanStep>) -> Vec<PlanStep> {
    let known: Vec<String> = env.known_paths().iter().map(|p| p.to_string()).collect();
    let mut search_seen = false;
    let mut out = Vec::with_capacity(steps.len());

    for step in steps {
        match step.tool_name {
            PlannedTool::SearchCode => {
                search_seen = true;
                out.push(step);
            }
            PlannedTool::ReadCode => {
                let path = step
                    .arguments
                    .get("path")
                    .and_then(|p| p.as_str())
                    .unwrap_or_default()
                    .to_string();
                if !search_seen && !known.iter().any(|k| k == &path) {
                    tracing::debug!(%path, "inserting locating search before read_code");
                    out.push(PlanStep::new(
                        PlannedTool::SearchCode,
                        serde_json::json!({ "query": file_query(&path) }),
                        format!("locate {path} before reading it"),
                    ));
                    search_seen = true;
                }
                out.push(step);
            }
        }
    }
    out
}

fn file_query(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

// ==================== executor ====================

/// Executor: run planned steps in order through the registry. No LLM.
///
/// `not_found` is a normal signal and never stops the plan. A missing tool
/// or a tool-level error marks the step and stops early; the pipeline itself
/// continues. Cancellation is polled between steps so the current tool call
/// always finishes.
pub async fn run_executor(
    env: &mut Envelope,
    registry: &ToolRegistry,
    ctx: &ToolContext,
    tracker: &dyn ResourceTracker,
    cancel: &CancellationToken,
) -> Result<ExecutorOutput> {
    let steps = env
        .output_for(Stage::Planner)
        .and_then(|o| o.as_planner())
        .map(|p| p.steps.clone())
        .unwrap_or_default();

    let mut output = ExecutorOutput {
        results: Vec::new(),
        stopped_early: false,
    };
    let mut files_read = 0usize;

    for (index, step) in steps.iter().enumerate() {
        if index > 0 && cancel.is_cancelled() {
            output.stopped_early = true;
            break;
        }

        let name = step.tool_name.as_str();
        if !EXPOSED_TOOLS.contains(&name) {
            output.results.push(ToolResult::unavailable(name));
            output.stopped_early = true;
            break;
        }

        if files_read >= ctx.bounds.max_files_per_query
            && step.tool_name == PlannedTool::ReadCode
        {
            return Err(Error::quota(format!(
                "file budget exhausted ({files_read} of {})",
                ctx.bounds.max_files_per_query
            )));
        }

        tracker.record_tool_call(&env.request_id, name);
        env.resource_usage.record_tool();

        let result = match registry.invoke(name, ctx, &step.arguments).await {
            Ok(result) => result,
            Err(Error::ToolUnavailable(tool)) => {
                output.results.push(ToolResult::unavailable(&tool));
                output.stopped_early = true;
                break;
            }
            Err(e @ Error::InvalidArguments { .. }) => return Err(e),
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "tool invocation failed");
                output.results.push(ToolResult::error(name, e.to_string()));
                output.stopped_early = true;
                break;
            }
        };

        if matches!(result.data, ToolData::Slice(_)) {
            files_read += 1;
        }
        env.resource_usage.code_tokens += result.token_estimate() as u64;
        env.record_attempts(result.attempt_history.iter().cloned());
        env.record_citations(result.citations.iter().cloned());

        if result.status == ToolStatus::Error {
            output.results.push(result);
            output.stopped_early = true;
            break;
        }
        output.results.push(result);
    }

    Ok(output)
}

// ==================== synthesizer ====================

const SYNTHESIZER_INSTRUCTIONS: &str = "\
State what the evidence shows about the question. Every claim must cite at
least one of the listed path:line citations; make no claim you cannot cite.
If the evidence shows nothing relevant, return no claims. Respond with JSON:
{\"claims\": [{\"text\": \"...\", \"supporting_citations\": [\"path:line\"]}]}";

pub fn synthesizer_prompt(env: &Envelope) -> String {
    format!(
        "{SYNTHESIZER_INSTRUCTIONS}\n\n{}",
        context::synthesizer_input(env)
    )
}

pub fn parse_synthesizer(raw: &str) -> Result<SynthesizerOutput> {
    let value = extract_json(Stage::Synthesizer, raw)?;
    serde_json::from_value(value)
        .map_err(|e| Error::malformed(Stage::Synthesizer.name(), e.to_string()))
}

// ==================== critic ====================

const CRITIC_INSTRUCTIONS: &str = "\
Review the claims against the listed citations. A claim is supported only if
every citation it names appears in the observed list. Respond with JSON:
{\"verdict\": \"approve\"|\"reject\"|\"clarify\", \"reason\": \"...\",
 \"suggested_reintent_focus\": \"...\" (when rejecting, what to search next)}";

pub fn critic_prompt(env: &Envelope) -> String {
    format!("{CRITIC_INSTRUCTIONS}\n\n{}", context::critic_input(env))
}

#[derive(serde::Deserialize)]
struct RawCritique {
    verdict: CriticVerdict,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    suggested_reintent_focus: Option<String>,
}

/// Parse the critique, then re-derive supportedness from the envelope.
///
/// The accumulated citation set is the source of truth: a model `approve`
/// cannot bless unsupported claims, and the unsupported/missing lists always
/// come from the deterministic check.
pub fn parse_critic(env: &Envelope, raw: &str) -> Result<CriticOutput> {
    let value = extract_json(Stage::Critic, raw)?;
    let critique: RawCritique = serde_json::from_value(value)
        .map_err(|e| Error::malformed(Stage::Critic.name(), e.to_string()))?;

    let claims: Vec<Claim> = env
        .output_for(Stage::Synthesizer)
        .and_then(|o| o.as_synthesizer())
        .map(|s| s.claims.clone())
        .unwrap_or_default();
    let report = validate_claims(&claims, &env.citations);

    let verdict = match critique.verdict {
        CriticVerdict::Clarify => CriticVerdict::Clarify,
        _ if !report.all_supported() => CriticVerdict::Reject,
        other => other,
    };

    let reason = if verdict == CriticVerdict::Reject && report.all_supported() {
        critique.reason
    } else if !report.all_supported() {
        format!(
            "{} claim(s) lack support from observed citations{}",
            report.unsupported.len(),
            if critique.reason.is_empty() {
                String::new()
            } else {
                format!("; {}", critique.reason)
            }
        )
    } else {
        critique.reason
    };

    Ok(CriticOutput {
        verdict,
        unsupported_claims: report.unsupported.iter().map(|c| c.text.clone()).collect(),
        missing_evidence: report
            .missing_evidence
            .iter()
            .map(|c| c.to_string())
            .collect(),
        reason,
        suggested_reintent_focus: critique.suggested_reintent_focus,
    })
}

// ==================== integration ====================

/// Render the final answer. Deterministic template; every factual statement
/// carries its inline citation, and sources are listed at the end.
pub fn render_integration(env: &Envelope) -> IntegrationOutput {
    use crate::envelope::TerminationReason;

    // A clarify verdict short-circuits into the clarification question.
    if let Some(critic) = env.output_for(Stage::Critic).and_then(|o| o.as_critic()) {
        if critic.verdict == CriticVerdict::Clarify {
            return IntegrationOutput {
                final_response: critic.reason.clone(),
                cited_sources: Vec::new(),
            };
        }
    }

    let claims: Vec<Claim> = env
        .output_for(Stage::Synthesizer)
        .and_then(|o| o.as_synthesizer())
        .map(|s| s.claims.clone())
        .unwrap_or_default();
    let report = validate_claims(&claims, &env.citations);

    let mut lines = Vec::new();
    let mut cited_sources = crate::evidence::CitationSet::new();

    for claim in &report.supported {
        let cites: Vec<String> = claim
            .supporting_citations
            .iter()
            .map(|c| format!("[{c}]"))
            .collect();
        cited_sources.extend(claim.supporting_citations.iter().cloned());
        lines.push(format!("{} {}", claim.text, cites.join(" ")));
    }
    for claim in &report.unsupported {
        lines.push(format!("Unverified: {}", claim.text));
    }

    match env.termination_reason {
        Some(TerminationReason::QuotaExceeded) => {
            lines.push(
                "The analysis stopped early: its resource budget was exhausted. The findings above reflect the evidence gathered so far."
                    .to_string(),
            );
        }
        Some(TerminationReason::CriticRejected) => {
            lines.push(
                "Some statements could not be verified against the repository and are marked as unverified."
                    .to_string(),
            );
        }
        _ => {}
    }

    if lines.is_empty() {
        lines.push(render_empty_answer(env));
    }

    if !cited_sources.is_empty() {
        lines.push(String::new());
        lines.push("Sources:".to_string());
        for citation in cited_sources.iter() {
            lines.push(format!("- {citation}"));
        }
    }

    IntegrationOutput {
        final_response: lines.join("\n"),
        cited_sources: cited_sources.iter().cloned().collect(),
    }
}

/// Answer for the no-claims case, surfacing not-found details and candidate
/// suggestions without fabricating citations.
fn render_empty_answer(env: &Envelope) -> String {
    let results = env
        .output_for(Stage::Executor)
        .and_then(|o| o.as_executor())
        .map(|e| e.results.as_slice())
        .unwrap_or_default();

    for result in results {
        if result.tool == "read_code" && result.status == ToolStatus::NotFound {
            let requested = requested_path(env).unwrap_or_else(|| "the file".to_string());
            return format!("No file named {requested} was found in the repository.");
        }
        if result.tool == "read_code" && result.status == ToolStatus::Success {
            if let ToolData::Candidates(candidates) = &result.data {
                let requested =
                    requested_path(env).unwrap_or_else(|| "that name".to_string());
                return format!(
                    "No exact file named {requested} was found; closest candidates: {}",
                    candidates.join(", ")
                );
            }
        }
    }

    "No supporting evidence for an answer was found in the repository.".to_string()
}

fn requested_path(env: &Envelope) -> Option<String> {
    env.output_for(Stage::Planner)
        .and_then(|o| o.as_planner())
        .and_then(|p| {
            p.steps.iter().find_map(|s| {
                (s.tool_name == PlannedTool::ReadCode)
                    .then(|| s.arguments.get("path")?.as_str().map(|s| s.to_string()))
                    .flatten()
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::Citation;
    use crate::pipeline::outputs::StageOutput;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_extract_json_variants() {
        let bare = extract_json(Stage::Intent, r#"{"a": 1}"#).unwrap();
        assert_eq!(bare["a"], 1);

        let fenced = extract_json(Stage::Intent, "Sure!\n```json\n{\"a\": 2}\n```").unwrap();
        assert_eq!(fenced["a"], 2);

        let embedded = extract_json(Stage::Intent, "Here: {\"a\": 3} hope that helps").unwrap();
        assert_eq!(embedded["a"], 3);

        assert!(extract_json(Stage::Intent, "no json at all").is_err());
    }

    #[test]
    fn test_perception_normalizes_and_hints() {
        let env = Envelope::new("  Where   is\tlogin defined? ", None);
        let output = run_perception(&env, None);
        assert_eq!(output.normalized_query, "Where is login defined?");
        assert!(output.intent_hints.contains(&"find_symbol".to_string()));
        assert!(output.session_context_digest.is_none());
    }

    #[test]
    fn test_perception_loads_session_digest() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .save_session(
                "s1",
                &json!({"recent_query": "where is login?", "citation_count": 3}),
            )
            .unwrap();
        let env = Envelope::new("and logout?", Some("s1".to_string()));
        let output = run_perception(&env, Some(&store));
        let digest = output.session_context_digest.unwrap();
        assert!(digest.contains("where is login?"));
        assert!(digest.contains("3 citations"));
    }

    #[test]
    fn test_parse_intent_enforces_exploration_first() {
        let env = Envelope::new("where is login defined?", None);
        let raw = r#"{"classified_intent": "find_symbol", "goals": ["find login"],
                      "clarification_required": true, "clarification_question": "which login?"}"#;
        let output = parse_intent(&env, raw).unwrap();
        assert!(!output.clarification_required);
        assert!(output.clarification_question.is_none());
    }

    #[test]
    fn test_parse_intent_forces_clarification_for_empty_query() {
        let env = Envelope::new("???", None);
        let raw = r#"{"classified_intent": "search", "goals": [],
                      "clarification_required": false}"#;
        let output = parse_intent(&env, raw).unwrap();
        assert!(output.clarification_required);
        assert!(output.clarification_question.is_some());
    }

    #[test]
    fn test_parse_planner_rejects_unknown_tool() {
        let env = Envelope::new("q", None);
        let raw = r#"{"steps": [{"tool_name": "delete_file", "arguments": {}, "rationale": "x"}]}"#;
        assert!(matches!(
            parse_planner(&env, raw, 8, 25_000),
            Err(Error::MalformedOutput { .. })
        ));
    }

    #[test]
    fn test_plan_discipline_inserts_locating_search() {
        let env = Envelope::new("show me nonexistent.py", None);
        let raw = r#"{"steps": [{"tool_name": "read_code",
                      "arguments": {"path": "nonexistent.py"}, "rationale": "user asked"}]}"#;
        let output = parse_planner(&env, raw, 8, 25_000).unwrap();

        assert_eq!(output.steps.len(), 2);
        assert_eq!(output.steps[0].tool_name, PlannedTool::SearchCode);
        assert_eq!(output.steps[0].arguments["query"], "nonexistent.py");
        assert_eq!(output.steps[1].tool_name, PlannedTool::ReadCode);
    }

    #[test]
    fn test_plan_discipline_respects_established_paths() {
        let mut env = Envelope::new("q", None);
        env.record_citations([Citation::new("src/auth/login.py", 42)]);
        let raw = r#"{"steps": [{"tool_name": "read_code",
                      "arguments": {"path": "src/auth/login.py"}, "rationale": "seen in search"}]}"#;
        let output = parse_planner(&env, raw, 8, 25_000).unwrap();
        assert_eq!(output.steps.len(), 1);
    }

    #[test]
    fn test_plan_discipline_in_plan_search_suffices() {
        let env = Envelope::new("q", None);
        let raw = r#"{"steps": [
            {"tool_name": "search_code", "arguments": {"query": "login"}, "rationale": "locate"},
            {"tool_name": "read_code", "arguments": {"path": "src/auth/login.py"}, "rationale": "read"}
        ]}"#;
        let output = parse_planner(&env, raw, 8, 25_000).unwrap();
        assert_eq!(output.steps.len(), 2);
    }

    #[test]
    fn test_parse_planner_caps_steps() {
        let env = Envelope::new("q", None);
        let steps: Vec<Value> = (0..20)
            .map(|i| {
                json!({"tool_name": "search_code",
                       "arguments": {"query": format!("q{i}")}, "rationale": "r"})
            })
            .collect();
        let raw = json!({ "steps": steps }).to_string();
        let output = parse_planner(&env, &raw, 8, 25_000).unwrap();
        assert_eq!(output.steps.len(), 8);
    }

    #[test]
    fn test_parse_synthesizer() {
        let raw = r#"{"claims": [{"text": "login lives in src/auth/login.py",
                      "supporting_citations": ["src/auth/login.py:42"]}]}"#;
        let output = parse_synthesizer(raw).unwrap();
        assert_eq!(output.claims.len(), 1);
        assert_eq!(
            output.claims[0].supporting_citations[0],
            Citation::new("src/auth/login.py", 42)
        );
    }

    #[test]
    fn test_parse_critic_overrides_blind_approval() {
        let mut env = Envelope::new("q", None);
        env.push_output(StageOutput::Synthesizer(SynthesizerOutput {
            claims: vec![Claim::new("made up claim", vec![])],
        }));
        let raw = r#"{"verdict": "approve", "reason": "looks fine"}"#;
        let output = parse_critic(&env, raw).unwrap();
        assert_eq!(output.verdict, CriticVerdict::Reject);
        assert_eq!(output.unsupported_claims, vec!["made up claim".to_string()]);
    }

    #[test]
    fn test_parse_critic_honors_approval_when_supported() {
        let mut env = Envelope::new("q", None);
        env.record_citations([Citation::new("src/a.py", 1)]);
        env.push_output(StageOutput::Synthesizer(SynthesizerOutput {
            claims: vec![Claim::new("real claim", vec![Citation::new("src/a.py", 1)])],
        }));
        let raw = r#"{"verdict": "approve", "reason": "all cited"}"#;
        let output = parse_critic(&env, raw).unwrap();
        assert_eq!(output.verdict, CriticVerdict::Approve);
        assert!(output.unsupported_claims.is_empty());
    }

    #[test]
    fn test_render_integration_cites_inline() {
        let mut env = Envelope::new("where is login?", None);
        env.record_citations([Citation::new("src/auth/login.py", 42)]);
        env.push_output(StageOutput::Synthesizer(SynthesizerOutput {
            claims: vec![Claim::new(
                "`login` is defined in `src/auth/login.py`.",
                vec![Citation::new("src/auth/login.py", 42)],
            )],
        }));
        let output = render_integration(&env);
        assert!(output.final_response.contains("[src/auth/login.py:42]"));
        assert!(output.final_response.contains("Sources:"));
        assert_eq!(output.cited_sources.len(), 1);
    }

    #[test]
    fn test_render_integration_flags_unverified() {
        let mut env = Envelope::new("q", None);
        env.terminate(crate::envelope::TerminationReason::CriticRejected);
        env.push_output(StageOutput::Synthesizer(SynthesizerOutput {
            claims: vec![Claim::new("unsupported thing", vec![])],
        }));
        let output = render_integration(&env);
        assert!(output.final_response.contains("Unverified: unsupported thing"));
        assert!(output.cited_sources.is_empty());
    }

    #[test]
    fn test_render_integration_not_found_file() {
        let mut env = Envelope::new("Show contents of nonexistent.py", None);
        env.push_output(StageOutput::Planner(PlannerOutput {
            steps: vec![PlanStep::new(
                PlannedTool::ReadCode,
                json!({"path": "nonexistent.py"}),
                "user asked",
            )],
            context_budget_remaining: 25_000,
        }));
        env.push_output(StageOutput::Executor(ExecutorOutput {
            results: vec![ToolResult::not_found("read_code")],
            stopped_early: false,
        }));
        let output = render_integration(&env);
        assert!(output
            .final_response
            .contains("No file named nonexistent.py was found"));
        assert!(output.cited_sources.is_empty());
    }
}
