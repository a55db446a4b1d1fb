//! Structured outputs of each pipeline stage.
//!
//! Every output is JSON-round-trippable; the envelope stores them in a
//! tagged sum so consumers match exhaustively.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::evidence::Citation;
use crate::pipeline::Stage;
use crate::tools::types::ToolResult;

/// Output of the Perception stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceptionOutput {
    pub normalized_query: String,
    pub intent_hints: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_context_digest: Option<String>,
}

/// Question archetypes the Intent stage classifies into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    FindSymbol,
    TraceFlow,
    Explain,
    Search,
    History,
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FindSymbol => write!(f, "find_symbol"),
            Self::TraceFlow => write!(f, "trace_flow"),
            Self::Explain => write!(f, "explain"),
            Self::Search => write!(f, "search"),
            Self::History => write!(f, "history"),
        }
    }
}

/// Output of the Intent stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentOutput {
    pub classified_intent: IntentKind,
    pub goals: Vec<String>,
    #[serde(default)]
    pub ambiguities: Vec<String>,
    #[serde(default)]
    pub clarification_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_question: Option<String>,
}

/// Tools the planner is allowed to name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedTool {
    SearchCode,
    ReadCode,
}

impl PlannedTool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SearchCode => "search_code",
            Self::ReadCode => "read_code",
        }
    }
}

impl std::fmt::Display for PlannedTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of an execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub tool_name: PlannedTool,
    pub arguments: Value,
    pub rationale: String,
    /// Which intent goal this step serves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
}

impl PlanStep {
    pub fn new(tool_name: PlannedTool, arguments: Value, rationale: impl Into<String>) -> Self {
        Self {
            tool_name,
            arguments,
            rationale: rationale.into(),
            goal: None,
        }
    }
}

/// Output of the Planner stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerOutput {
    pub steps: Vec<PlanStep>,
    pub context_budget_remaining: u64,
}

/// Output of the Executor stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorOutput {
    pub results: Vec<ToolResult>,
    /// True when a cancellation or hard error stopped the plan early
    #[serde(default)]
    pub stopped_early: bool,
}

/// A factual claim with its supporting evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub text: String,
    pub supporting_citations: Vec<Citation>,
}

impl Claim {
    pub fn new(text: impl Into<String>, supporting_citations: Vec<Citation>) -> Self {
        Self {
            text: text.into(),
            supporting_citations,
        }
    }
}

/// Output of the Synthesizer stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizerOutput {
    pub claims: Vec<Claim>,
}

/// The critic's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticVerdict {
    Approve,
    Reject,
    Clarify,
}

impl std::fmt::Display for CriticVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::Reject => write!(f, "reject"),
            Self::Clarify => write!(f, "clarify"),
        }
    }
}

/// Output of the Critic stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticOutput {
    pub verdict: CriticVerdict,
    #[serde(default)]
    pub unsupported_claims: Vec<String>,
    #[serde(default)]
    pub missing_evidence: Vec<String>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_reintent_focus: Option<String>,
}

/// Output of the Integration stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationOutput {
    pub final_response: String,
    pub cited_sources: Vec<Citation>,
}

/// Tagged union of every stage's output, as stored in the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", content = "output", rename_all = "snake_case")]
pub enum StageOutput {
    Perception(PerceptionOutput),
    Intent(IntentOutput),
    Planner(PlannerOutput),
    Executor(ExecutorOutput),
    Synthesizer(SynthesizerOutput),
    Critic(CriticOutput),
    Integration(IntegrationOutput),
}

impl StageOutput {
    /// Which stage produced this output.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Perception(_) => Stage::Perception,
            Self::Intent(_) => Stage::Intent,
            Self::Planner(_) => Stage::Planner,
            Self::Executor(_) => Stage::Executor,
            Self::Synthesizer(_) => Stage::Synthesizer,
            Self::Critic(_) => Stage::Critic,
            Self::Integration(_) => Stage::Integration,
        }
    }

    pub fn as_perception(&self) -> Option<&PerceptionOutput> {
        match self {
            Self::Perception(output) => Some(output),
            _ => None,
        }
    }

    pub fn as_intent(&self) -> Option<&IntentOutput> {
        match self {
            Self::Intent(output) => Some(output),
            _ => None,
        }
    }

    pub fn as_planner(&self) -> Option<&PlannerOutput> {
        match self {
            Self::Planner(output) => Some(output),
            _ => None,
        }
    }

    pub fn as_executor(&self) -> Option<&ExecutorOutput> {
        match self {
            Self::Executor(output) => Some(output),
            _ => None,
        }
    }

    pub fn as_synthesizer(&self) -> Option<&SynthesizerOutput> {
        match self {
            Self::Synthesizer(output) => Some(output),
            _ => None,
        }
    }

    pub fn as_critic(&self) -> Option<&CriticOutput> {
        match self {
            Self::Critic(output) => Some(output),
            _ => None,
        }
    }

    pub fn as_integration(&self) -> Option<&IntegrationOutput> {
        match self {
            Self::Integration(output) => Some(output),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_stage_output_tagging() {
        let output = StageOutput::Intent(IntentOutput {
            classified_intent: IntentKind::FindSymbol,
            goals: vec!["locate login".to_string()],
            ambiguities: vec![],
            clarification_required: false,
            clarification_question: None,
        });
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["stage"], "intent");
        assert_eq!(value["output"]["classified_intent"], "find_symbol");

        let back: StageOutput = serde_json::from_value(value).unwrap();
        assert_eq!(back.stage(), Stage::Intent);
    }

    #[test]
    fn test_plan_step_serde() {
        let step = PlanStep::new(
            PlannedTool::SearchCode,
            json!({"query": "login"}),
            "find the symbol first",
        );
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["tool_name"], "search_code");

        let back: PlanStep = serde_json::from_value(value).unwrap();
        assert_eq!(back, step);
    }

    #[test]
    fn test_intent_output_defaults_on_missing_fields() {
        let parsed: IntentOutput = serde_json::from_value(json!({
            "classified_intent": "explain",
            "goals": ["explain error handling"]
        }))
        .unwrap();
        assert!(!parsed.clarification_required);
        assert!(parsed.ambiguities.is_empty());
    }

    #[test]
    fn test_claim_citations_round_trip() {
        let claim = Claim::new(
            "login is defined in src/auth/login.py",
            vec![Citation::new("src/auth/login.py", 42)],
        );
        let json = serde_json::to_string(&claim).unwrap();
        assert!(json.contains("\"src/auth/login.py:42\""));
        let back: Claim = serde_json::from_str(&json).unwrap();
        assert_eq!(back, claim);
    }
}
