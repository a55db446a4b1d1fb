//! Bounded prompt inputs for the LLM stages.
//!
//! Each builder selects only the prior-stage outputs its stage needs and
//! compacts tool results down to short snippets. The caps here keep every
//! prompt comfortably inside the context window regardless of how much the
//! executor saw.

use serde::Serialize;

use crate::envelope::Envelope;
use crate::pipeline::Stage;
use crate::tools::types::{ToolData, ToolResult};

/// Longest snippet taken from any single tool-result item.
pub const MAX_SNIPPET_CHARS: usize = 512;

/// Most items kept per tool call when summarising.
pub const MAX_ITEMS_PER_TOOL: usize = 10;

/// Truncate on a char boundary, marking the cut.
pub fn snippet(text: &str) -> String {
    if text.chars().count() <= MAX_SNIPPET_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_SNIPPET_CHARS).collect();
    format!("{cut}…")
}

/// Compact form of one tool result, bounded for prompting.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResultSummary {
    pub tool: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found_via: Option<String>,
    pub items: Vec<String>,
    /// Items dropped by the per-tool cap
    pub omitted: usize,
}

/// Summarise a tool result down to at most [`MAX_ITEMS_PER_TOOL`] snippets.
pub fn summarize_result(result: &ToolResult) -> ToolResultSummary {
    let raw_items: Vec<String> = match &result.data {
        ToolData::Matches(matches) => matches
            .iter()
            .map(|m| format!("{}:{}: {}", m.path, m.line, snippet(&m.text)))
            .collect(),
        ToolData::Slice(slice) => vec![format!(
            "{}:{}-{}\n{}",
            slice.path,
            slice.start_line,
            slice.end_line,
            snippet(&slice.content)
        )],
        ToolData::Candidates(items) | ToolData::Entries(items) => items.clone(),
        ToolData::Text(text) => vec![snippet(text)],
        ToolData::Tools(specs) => specs.iter().map(|s| s.name.clone()).collect(),
        ToolData::None => Vec::new(),
    };

    let omitted = raw_items.len().saturating_sub(MAX_ITEMS_PER_TOOL);
    ToolResultSummary {
        tool: result.tool.clone(),
        status: result.status.to_string(),
        found_via: result.found_via.clone(),
        items: raw_items.into_iter().take(MAX_ITEMS_PER_TOOL).collect(),
        omitted,
    }
}

fn render_summaries(summaries: &[ToolResultSummary]) -> String {
    let mut out = String::new();
    for summary in summaries {
        out.push_str(&format!(
            "- {} [{}{}]\n",
            summary.tool,
            summary.status,
            summary
                .found_via
                .as_deref()
                .map(|v| format!(" via {v}"))
                .unwrap_or_default()
        ));
        for item in &summary.items {
            out.push_str("  ");
            out.push_str(&item.replace('\n', "\n  "));
            out.push('\n');
        }
        if summary.omitted > 0 {
            out.push_str(&format!("  ({} more omitted)\n", summary.omitted));
        }
    }
    out
}

fn executor_summaries(env: &Envelope) -> Vec<ToolResultSummary> {
    env.output_for(Stage::Executor)
        .and_then(|o| o.as_executor())
        .map(|e| e.results.iter().map(summarize_result).collect())
        .unwrap_or_default()
}

/// Intent sees the normalized query, hints, session digest, and any critic
/// refocus guidance from the previous cycle.
pub fn intent_input(env: &Envelope) -> String {
    let perception = env.output_for(Stage::Perception).and_then(|o| o.as_perception());

    let mut out = String::new();
    if let Some(p) = perception {
        out.push_str(&format!("Question: {}\n", p.normalized_query));
        if !p.intent_hints.is_empty() {
            out.push_str(&format!("Hints: {}\n", p.intent_hints.join(", ")));
        }
        if let Some(digest) = &p.session_context_digest {
            out.push_str(&format!("Session context: {digest}\n"));
        }
    } else {
        out.push_str(&format!("Question: {}\n", env.query));
    }
    if let Some(focus) = &env.reintent_focus {
        out.push_str(&format!(
            "A previous pass failed verification; refocus on: {focus}\n"
        ));
    }
    out
}

/// The planner sees the classified intent and goals, the paths evidence has
/// established so far, and the tail of the attempt history.
pub fn planner_input(env: &Envelope) -> String {
    let mut out = intent_input(env);

    if let Some(intent) = env.output_for(Stage::Intent).and_then(|o| o.as_intent()) {
        out.push_str(&format!("Intent: {}\n", intent.classified_intent));
        out.push_str("Goals:\n");
        for goal in &intent.goals {
            out.push_str(&format!("- {goal}\n"));
        }
    }

    let paths = env.known_paths();
    if !paths.is_empty() {
        out.push_str("Paths already established by evidence:\n");
        for path in paths {
            out.push_str(&format!("- {path}\n"));
        }
    }

    let recent: Vec<String> = env
        .attempt_history
        .iter()
        .rev()
        .take(MAX_ITEMS_PER_TOOL)
        .map(|a| format!("{}/{}", a.tool, a.strategy))
        .collect();
    if !recent.is_empty() {
        out.push_str(&format!(
            "Recently tried strategies: {}\n",
            recent.join(", ")
        ));
    }
    out
}

/// The synthesizer sees the plan rationale, compacted executor results, and
/// the citations it is allowed to draw from.
pub fn synthesizer_input(env: &Envelope) -> String {
    let mut out = String::new();
    out.push_str(&format!("Question: {}\n", env.query));

    if let Some(plan) = env.output_for(Stage::Planner).and_then(|o| o.as_planner()) {
        out.push_str("Plan rationale:\n");
        for step in &plan.steps {
            out.push_str(&format!("- {}: {}\n", step.tool_name, step.rationale));
        }
    }

    out.push_str("Tool results:\n");
    out.push_str(&render_summaries(&executor_summaries(env)));

    out.push_str("Citable evidence (path:line):\n");
    out.push_str(&env.citations.as_listing());
    out.push('\n');
    out
}

/// The critic sees the claims and a literal listing of every citation the
/// envelope accumulated, so validation needs nothing outside its prompt.
pub fn critic_input(env: &Envelope) -> String {
    let mut out = String::new();

    let claims = env
        .output_for(Stage::Synthesizer)
        .and_then(|o| o.as_synthesizer())
        .map(|s| serde_json::to_string_pretty(&s.claims).unwrap_or_default())
        .unwrap_or_else(|| "[]".to_string());
    out.push_str("Claims under review:\n");
    out.push_str(&claims);
    out.push('\n');

    out.push_str("Citations actually observed this request:\n");
    out.push_str(&env.citations.as_listing());
    out.push('\n');

    let summaries = executor_summaries(env);
    if !summaries.is_empty() {
        out.push_str("Executor outcomes:\n");
        for summary in &summaries {
            out.push_str(&format!("- {} [{}]\n", summary.tool, summary.status));
        }
    }
    out
}

/// Integration sees everything, summarised.
pub fn integration_input(env: &Envelope) -> String {
    let mut out = String::new();
    out.push_str(&format!("Question: {}\n", env.query));

    if let Some(claims) = env
        .output_for(Stage::Synthesizer)
        .and_then(|o| o.as_synthesizer())
    {
        out.push_str("Verified claims:\n");
        for claim in &claims.claims {
            let cites: Vec<String> = claim
                .supporting_citations
                .iter()
                .map(|c| c.to_string())
                .collect();
            out.push_str(&format!("- {} [{}]\n", claim.text, cites.join(", ")));
        }
    }

    out.push_str("Cited sources:\n");
    out.push_str(&env.citations.as_listing());
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::outputs::{ExecutorOutput, StageOutput};
    use crate::tools::types::{CodeMatch, ToolResult};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_snippet_truncates_on_char_boundary() {
        let short = "hello";
        assert_eq!(snippet(short), "hello");

        let long = "é".repeat(MAX_SNIPPET_CHARS + 10);
        let cut = snippet(&long);
        assert_eq!(cut.chars().count(), MAX_SNIPPET_CHARS + 1);
        assert!(cut.ends_with('…'));
    }

    #[test]
    fn test_summarize_caps_items() {
        let matches: Vec<CodeMatch> = (0..25)
            .map(|i| CodeMatch::new(format!("src/f{i}.rs"), i + 1, "line"))
            .collect();
        let result = ToolResult::success("search_code", "grep", ToolData::Matches(matches));
        let summary = summarize_result(&result);
        assert_eq!(summary.items.len(), MAX_ITEMS_PER_TOOL);
        assert_eq!(summary.omitted, 15);
    }

    #[test]
    fn test_critic_input_inlines_citations() {
        let mut env = Envelope::new("how do errors work?", None);
        env.record_citations([crate::evidence::Citation::new("src/errors.py", 12)]);
        let input = critic_input(&env);
        assert!(input.contains("src/errors.py:12"));
        assert!(input.contains("Citations actually observed"));
    }

    #[test]
    fn test_planner_input_lists_known_paths() {
        let mut env = Envelope::new("q", None);
        env.record_citations([crate::evidence::Citation::new("src/auth/login.py", 42)]);
        let input = planner_input(&env);
        assert!(input.contains("Paths already established"));
        assert!(input.contains("src/auth/login.py"));
    }

    #[test]
    fn test_synthesizer_input_includes_executor_snippets() {
        let mut env = Envelope::new("q", None);
        let result = ToolResult::success(
            "search_code",
            "grep",
            ToolData::Matches(vec![CodeMatch::new("src/a.py", 3, "def handle():")]),
        );
        env.push_output(StageOutput::Executor(ExecutorOutput {
            results: vec![result],
            stopped_early: false,
        }));
        let input = synthesizer_input(&env);
        assert!(input.contains("src/a.py:3: def handle():"));
    }

    #[test]
    fn test_intent_input_carries_reintent_focus() {
        let mut env = Envelope::new("explain errors", None);
        env.begin_reintent(Some("error_handler".to_string()));
        let input = intent_input(&env);
        assert!(input.contains("refocus on: error_handler"));
    }
}
