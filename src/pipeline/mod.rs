//! The seven-stage analysis pipeline.
//!
//! A stage is a value; the pipeline is the fixed stage order plus an explicit
//! transition function. All request state flows through the envelope, and the
//! transition function is the only legal way `current_stage` changes.

pub mod context;
pub mod outputs;
pub mod runtime;
pub mod stages;

pub use outputs::{CriticOutput, CriticVerdict, StageOutput};
pub use runtime::PipelineRuntime;
pub use stages::{MockHandler, StageMocks};

use serde::{Deserialize, Serialize};

use crate::envelope::TerminationReason;

/// Upper bound on critic-driven re-entries. The initial run is cycle 0.
pub const MAX_REINTENT_CYCLES: u32 = 2;

/// The seven pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Perception,
    Intent,
    Planner,
    Executor,
    Synthesizer,
    Critic,
    Integration,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 7] = [
        Stage::Perception,
        Stage::Intent,
        Stage::Planner,
        Stage::Executor,
        Stage::Synthesizer,
        Stage::Critic,
        Stage::Integration,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Perception => "perception",
            Self::Intent => "intent",
            Self::Planner => "planner",
            Self::Executor => "executor",
            Self::Synthesizer => "synthesizer",
            Self::Critic => "critic",
            Self::Integration => "integration",
        }
    }

    /// Whether the stage's core hook calls the LLM.
    pub fn is_llm(&self) -> bool {
        matches!(
            self,
            Self::Intent | Self::Planner | Self::Synthesizer | Self::Critic | Self::Integration
        )
    }

    /// Stages whose outputs a re-entry clears (Intent through Critic).
    pub fn cleared_on_reintent(&self) -> bool {
        matches!(
            self,
            Self::Intent | Self::Planner | Self::Executor | Self::Synthesizer | Self::Critic
        )
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the pipeline goes after a stage completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Advance to the next stage
    Next(Stage),
    /// Critic rejected with budget remaining: clear and return to Intent
    Reintent,
    /// Stop with the given reason
    Terminal(TerminationReason),
}

/// The explicit transition function.
///
/// `critic` must be present exactly when `stage` is the critic; `cycles` is
/// the envelope's current re-entry count.
pub fn transition(
    stage: Stage,
    critic: Option<&CriticOutput>,
    cycles: u32,
    max_cycles: u32,
) -> Transition {
    match stage {
        Stage::Perception => Transition::Next(Stage::Intent),
        Stage::Intent => Transition::Next(Stage::Planner),
        Stage::Planner => Transition::Next(Stage::Executor),
        Stage::Executor => Transition::Next(Stage::Synthesizer),
        Stage::Synthesizer => Transition::Next(Stage::Critic),
        Stage::Critic => match critic.map(|c| c.verdict) {
            Some(CriticVerdict::Approve) => Transition::Next(Stage::Integration),
            Some(CriticVerdict::Clarify) => Transition::Terminal(TerminationReason::Completed),
            Some(CriticVerdict::Reject) if cycles < max_cycles => Transition::Reintent,
            Some(CriticVerdict::Reject) => {
                Transition::Terminal(TerminationReason::CriticRejected)
            }
            None => Transition::Terminal(TerminationReason::InternalError),
        },
        Stage::Integration => Transition::Terminal(TerminationReason::Completed),
    }
}

/// Static pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Re-entry budget (clamped to [`MAX_REINTENT_CYCLES`])
    pub max_reintent_cycles: u32,
    /// Run a short LLM pass to word the final answer instead of the template
    pub llm_wording_pass: bool,
    /// TTL for cached explanations, in seconds
    pub understanding_ttl_seconds: i64,
    /// Hard cap on planner steps per cycle
    pub max_plan_steps: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_reintent_cycles: MAX_REINTENT_CYCLES,
            llm_wording_pass: false,
            understanding_ttl_seconds: 24 * 3600,
            max_plan_steps: 8,
        }
    }
}

impl PipelineConfig {
    pub fn with_max_reintent(mut self, max: u32) -> Self {
        self.max_reintent_cycles = max.min(MAX_REINTENT_CYCLES);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn critic(verdict: CriticVerdict) -> CriticOutput {
        CriticOutput {
            verdict,
            unsupported_claims: vec![],
            missing_evidence: vec![],
            reason: "test".to_string(),
            suggested_reintent_focus: None,
        }
    }

    #[test]
    fn test_stage_order_is_fixed() {
        let names: Vec<&str> = Stage::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "perception",
                "intent",
                "planner",
                "executor",
                "synthesizer",
                "critic",
                "integration"
            ]
        );
    }

    #[test]
    fn test_llm_stages() {
        assert!(!Stage::Perception.is_llm());
        assert!(!Stage::Executor.is_llm());
        assert!(Stage::Intent.is_llm());
        assert!(Stage::Critic.is_llm());
    }

    #[test]
    fn test_linear_transitions() {
        assert_eq!(
            transition(Stage::Perception, None, 0, 2),
            Transition::Next(Stage::Intent)
        );
        assert_eq!(
            transition(Stage::Synthesizer, None, 0, 2),
            Transition::Next(Stage::Critic)
        );
        assert_eq!(
            transition(Stage::Integration, None, 0, 2),
            Transition::Terminal(TerminationReason::Completed)
        );
    }

    #[test]
    fn test_critic_approve_advances() {
        assert_eq!(
            transition(Stage::Critic, Some(&critic(CriticVerdict::Approve)), 0, 2),
            Transition::Next(Stage::Integration)
        );
    }

    #[test]
    fn test_critic_reject_reenters_until_limit() {
        let reject = critic(CriticVerdict::Reject);
        assert_eq!(
            transition(Stage::Critic, Some(&reject), 0, 2),
            Transition::Reintent
        );
        assert_eq!(
            transition(Stage::Critic, Some(&reject), 1, 2),
            Transition::Reintent
        );
        assert_eq!(
            transition(Stage::Critic, Some(&reject), 2, 2),
            Transition::Terminal(TerminationReason::CriticRejected)
        );
    }

    #[test]
    fn test_critic_clarify_completes() {
        assert_eq!(
            transition(Stage::Critic, Some(&critic(CriticVerdict::Clarify)), 0, 2),
            Transition::Terminal(TerminationReason::Completed)
        );
    }

    #[test]
    fn test_config_clamps_reintent_budget() {
        let config = PipelineConfig::default().with_max_reintent(99);
        assert_eq!(config.max_reintent_cycles, MAX_REINTENT_CYCLES);
    }
}
