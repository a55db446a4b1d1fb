//! Per-request working memory.
//!
//! The envelope is the single in-flight object for one request. Only the
//! runtime task for that request mutates it; observers see read-only event
//! copies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evidence::{Citation, CitationSet};
use crate::pipeline::{Stage, StageOutput, MAX_REINTENT_CYCLES};
use crate::tools::types::AttemptRecord;

/// Stable request identifier, assigned at admission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a request stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Completed,
    CriticRejected,
    CycleLimit,
    QuotaExceeded,
    Cancelled,
    InternalError,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::CriticRejected => write!(f, "critic_rejected"),
            Self::CycleLimit => write!(f, "cycle_limit"),
            Self::QuotaExceeded => write!(f, "quota_exceeded"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::InternalError => write!(f, "internal_error"),
        }
    }
}

/// Cumulative usage counters for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub llm_calls: u64,
    pub tool_calls: u64,
    /// Stage executions, across all cycles
    pub agent_hops: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Tokens of tool-derived code content fed toward the context window
    pub code_tokens: u64,
}

impl ResourceUsage {
    pub fn record_llm(&mut self, tokens_in: u64, tokens_out: u64) {
        self.llm_calls += 1;
        self.tokens_in += tokens_in;
        self.tokens_out += tokens_out;
    }

    pub fn record_tool(&mut self) {
        self.tool_calls += 1;
    }

    pub fn record_hop(&mut self) {
        self.agent_hops += 1;
    }
}

/// Working memory for one in-flight request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub query: String,
    /// The next stage to run; ignored once `terminated` is set
    pub current_stage: Stage,
    /// Stage results in insertion order, at most one per stage per cycle
    pub stage_outputs: Vec<StageOutput>,
    /// Every fallback strategy tried by every tool call, in order
    pub attempt_history: Vec<AttemptRecord>,
    /// Monotonically growing across cycles; never cleared mid-request
    pub citations: CitationSet,
    pub reintent_cycles: u32,
    /// Re-entry budget for this request (≤ [`MAX_REINTENT_CYCLES`])
    pub max_reintent_cycles: u32,
    pub resource_usage: ResourceUsage,
    pub terminated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
    /// Critic guidance carried into the next cycle's Intent input
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reintent_focus: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Envelope {
    /// Admit a new request.
    pub fn new(query: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            request_id: RequestId::new(),
            session_id,
            query: query.into(),
            current_stage: Stage::Perception,
            stage_outputs: Vec::new(),
            attempt_history: Vec::new(),
            citations: CitationSet::new(),
            reintent_cycles: 0,
            max_reintent_cycles: MAX_REINTENT_CYCLES,
            resource_usage: ResourceUsage::default(),
            terminated: false,
            termination_reason: None,
            reintent_focus: None,
            created_at: Utc::now(),
        }
    }

    /// Lower the re-entry budget (it can never exceed the global bound).
    pub fn with_max_reintent(mut self, max: u32) -> Self {
        self.max_reintent_cycles = max.min(MAX_REINTENT_CYCLES);
        self
    }

    /// Store a stage output, replacing any output the same stage produced in
    /// the current cycle.
    pub fn push_output(&mut self, output: StageOutput) {
        let stage = output.stage();
        if let Some(existing) = self.stage_outputs.iter_mut().find(|o| o.stage() == stage) {
            *existing = output;
        } else {
            self.stage_outputs.push(output);
        }
    }

    /// Current-cycle output of a stage, if it has run.
    pub fn output_for(&self, stage: Stage) -> Option<&StageOutput> {
        self.stage_outputs.iter().find(|o| o.stage() == stage)
    }

    /// Append tool attempt records to the request-wide history.
    pub fn record_attempts(&mut self, attempts: impl IntoIterator<Item = AttemptRecord>) {
        self.attempt_history.extend(attempts);
    }

    /// Merge citations into the accumulated set, returning how many were new.
    pub fn record_citations(&mut self, citations: impl IntoIterator<Item = Citation>) -> usize {
        self.citations.extend(citations)
    }

    /// Paths established so far by tool evidence.
    pub fn known_paths(&self) -> Vec<&str> {
        self.citations.paths()
    }

    /// Whether this request can still re-enter from the critic.
    pub fn can_reintent(&self) -> bool {
        self.reintent_cycles < self.max_reintent_cycles
    }

    /// Begin a critic-driven re-entry: clear Intent..Critic outputs, keep
    /// citations and attempt history, and aim the pipeline back at Intent.
    ///
    /// Fails the invariant check (and terminates with `cycle_limit`) if the
    /// budget is already spent.
    pub fn begin_reintent(&mut self, focus: Option<String>) {
        if !self.can_reintent() {
            self.terminate(TerminationReason::CycleLimit);
            return;
        }
        self.reintent_cycles += 1;
        self.stage_outputs.retain(|o| !o.stage().cleared_on_reintent());
        self.reintent_focus = focus;
        self.current_stage = Stage::Intent;
    }

    /// Mark the request terminated. The first reason wins.
    pub fn terminate(&mut self, reason: TerminationReason) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.termination_reason = Some(reason);
    }
}
