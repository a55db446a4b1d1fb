//! The pipeline runtime: drives one envelope through the stages.
//!
//! The runtime owns the envelope for the duration of the request, is the sole
//! producer of its event stream, and mutates `current_stage` only through the
//! transition function. Cancellation is polled at every stage boundary and
//! inside the executor and LLM call paths.

use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::accountant::{QuotaDecision, ResourceTracker};
use crate::envelope::{Envelope, TerminationReason};
use crate::error::{Error, Result};
use crate::event::{AnalysisEvent, StageStatus, TerminalReport};
use crate::llm::{CompletionOptions, LlmProvider};
use crate::pipeline::outputs::{IntegrationOutput, StageOutput};
use crate::pipeline::stages::{self, StageMocks};
use crate::pipeline::{transition, PipelineConfig, Stage, Transition};
use crate::storage::fingerprint;
use crate::tools::registry::ToolRegistry;
use crate::tools::ToolContext;

/// Executes envelopes. Stateless across requests; safe to share.
pub struct PipelineRuntime {
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    ctx: Arc<ToolContext>,
    tracker: Arc<dyn ResourceTracker>,
    config: PipelineConfig,
    mocks: StageMocks,
}

impl PipelineRuntime {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        ctx: Arc<ToolContext>,
        tracker: Arc<dyn ResourceTracker>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            ctx,
            tracker,
            config,
            mocks: StageMocks::new(),
        }
    }

    /// Install stage mocks (the only supported LLM substitution point).
    pub fn with_mocks(mut self, mocks: StageMocks) -> Self {
        self.mocks = mocks;
        self
    }

    /// Drive the envelope to termination, emitting events along the way.
    ///
    /// Re-running a terminated envelope replays its terminal event and makes
    /// no external calls.
    pub async fn run(
        &self,
        mut env: Envelope,
        events: &UnboundedSender<AnalysisEvent>,
        cancel: CancellationToken,
    ) -> Envelope {
        if env.terminated {
            let final_response = integration_response(&env);
            let report = TerminalReport::from_envelope(&env, final_response);
            let _ = events.send(AnalysisEvent::Terminal(report));
            return env;
        }

        while !env.terminated {
            if cancel.is_cancelled() {
                env.terminate(TerminationReason::Cancelled);
                break;
            }
            let stage = env.current_stage;

            if env.resource_usage.agent_hops >= self.ctx.bounds.max_agent_hops_per_query {
                tracing::warn!(request_id = %env.request_id, "agent hop budget exhausted");
                env.terminate(TerminationReason::QuotaExceeded);
                break;
            }
            if stage.is_llm() {
                if let QuotaDecision::Exceeded { reason } =
                    self.tracker.check_quota(&env.request_id)
                {
                    tracing::warn!(request_id = %env.request_id, %reason, "quota rejected");
                    env.terminate(TerminationReason::QuotaExceeded);
                    break;
                }
                if env.resource_usage.code_tokens
                    > self.ctx.bounds.max_total_code_tokens as u64
                {
                    tracing::warn!(request_id = %env.request_id, "code token budget exhausted");
                    env.terminate(TerminationReason::QuotaExceeded);
                    break;
                }
            }

            env.resource_usage.record_hop();
            self.emit(
                events,
                AnalysisEvent::stage(
                    env.request_id.clone(),
                    stage,
                    StageStatus::Started,
                    stage.name(),
                ),
            );

            match self.run_stage(stage, &mut env, &cancel).await {
                Ok(summary) => {
                    self.emit(
                        events,
                        AnalysisEvent::stage(
                            env.request_id.clone(),
                            stage,
                            StageStatus::Completed,
                            summary,
                        ),
                    );

                    // Intent-level clarification short-circuits the request.
                    if stage == Stage::Intent {
                        if let Some(question) = clarification_question(&env) {
                            env.push_output(StageOutput::Integration(IntegrationOutput {
                                final_response: question,
                                cited_sources: Vec::new(),
                            }));
                            env.terminate(TerminationReason::Completed);
                            break;
                        }
                    }

                    if cancel.is_cancelled() {
                        env.terminate(TerminationReason::Cancelled);
                        break;
                    }

                    let critic = env
                        .output_for(Stage::Critic)
                        .and_then(|o| o.as_critic())
                        .cloned();
                    match transition(
                        stage,
                        critic.as_ref(),
                        env.reintent_cycles,
                        env.max_reintent_cycles.min(self.config.max_reintent_cycles),
                    ) {
                        Transition::Next(next) => env.current_stage = next,
                        Transition::Reintent => {
                            let focus =
                                critic.and_then(|c| c.suggested_reintent_focus.clone());
                            env.begin_reintent(focus);
                        }
                        Transition::Terminal(reason) => env.terminate(reason),
                    }
                }
                Err(e) => {
                    tracing::warn!(request_id = %env.request_id, stage = %stage, error = %e, "stage failed");
                    self.emit(
                        events,
                        AnalysisEvent::stage(
                            env.request_id.clone(),
                            stage,
                            StageStatus::Failed,
                            e.to_string(),
                        ),
                    );
                    let reason = match e {
                        Error::QuotaExceeded(_) => TerminationReason::QuotaExceeded,
                        Error::Cancelled => TerminationReason::Cancelled,
                        _ => TerminationReason::InternalError,
                    };
                    env.terminate(reason);
                }
            }
        }

        // Best-effort closing answer for terminations that still owe the
        // caller a response. Covers the critic's clarify verdict (completed
        // without reaching Integration) and the rejected/exhausted paths.
        let owes_answer = matches!(
            env.termination_reason,
            Some(
                TerminationReason::Completed
                    | TerminationReason::CriticRejected
                    | TerminationReason::QuotaExceeded
                    | TerminationReason::CycleLimit
            )
        );
        if owes_answer && env.output_for(Stage::Integration).is_none() {
            let output = stages::render_integration(&env);
            env.push_output(StageOutput::Integration(output));
            self.emit(
                events,
                AnalysisEvent::stage(
                    env.request_id.clone(),
                    Stage::Integration,
                    StageStatus::Completed,
                    "closing response rendered",
                ),
            );
        }

        let final_response = integration_response(&env);
        let report = TerminalReport::from_envelope(&env, final_response);
        self.persist_terminal(&env, &report);
        self.emit(events, AnalysisEvent::Terminal(report));
        env
    }

    async fn run_stage(
        &self,
        stage: Stage,
        env: &mut Envelope,
        cancel: &CancellationToken,
    ) -> Result<String> {
        match stage {
            Stage::Perception => {
                let output = stages::run_perception(env, Some(self.ctx.store.as_ref()));
                let summary = format!(
                    "query normalized; {} hint(s)",
                    output.intent_hints.len()
                );
                env.push_output(StageOutput::Perception(output));
                Ok(summary)
            }
            Stage::Executor => {
                let output = stages::run_executor(
                    env,
                    &self.registry,
                    &self.ctx,
                    self.tracker.as_ref(),
                    cancel,
                )
                .await?;
                let summary = format!(
                    "{} result(s); {} citation(s) on record{}",
                    output.results.len(),
                    env.citations.len(),
                    if output.stopped_early { "; stopped early" } else { "" }
                );
                env.push_output(StageOutput::Executor(output));
                Ok(summary)
            }
            Stage::Integration => {
                let mut output = stages::render_integration(env);
                if self.config.llm_wording_pass {
                    let prompt = wording_prompt(env, &output);
                    if let Ok(worded) = self.call_llm(stage, env, &prompt, cancel).await {
                        let worded = worded.trim();
                        if !worded.is_empty() {
                            output.final_response = worded.to_string();
                        }
                    }
                }
                env.push_output(StageOutput::Integration(output));
                Ok("response rendered".to_string())
            }
            Stage::Intent | Stage::Planner | Stage::Synthesizer | Stage::Critic => {
                self.run_llm_stage(stage, env, cancel).await
            }
        }
    }

    /// Prompt → LLM (or mock) → parse, with one retry on malformed output
    /// and, for the critic only, one retry on timeout.
    async fn run_llm_stage(
        &self,
        stage: Stage,
        env: &mut Envelope,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut retried = false;
        loop {
            let prompt = match stage {
                Stage::Intent => stages::intent_prompt(env),
                Stage::Planner => stages::planner_prompt(env),
                Stage::Synthesizer => stages::synthesizer_prompt(env),
                Stage::Critic => stages::critic_prompt(env),
                _ => unreachable!("not an LLM stage: {stage}"),
            };

            let raw = match self.call_llm(stage, env, &prompt, cancel).await {
                Ok(raw) => raw,
                Err(Error::LlmTimeout { .. }) if stage == Stage::Critic && !retried => {
                    tracing::warn!(stage = %stage, "LLM timeout; retrying once");
                    retried = true;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let parsed = self.parse_stage(stage, env, &raw);
            match parsed {
                Ok((output, summary)) => {
                    env.push_output(output);
                    return Ok(summary);
                }
                Err(e @ Error::MalformedOutput { .. }) if !retried => {
                    tracing::warn!(stage = %stage, error = %e, "malformed output; retrying once");
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn parse_stage(
        &self,
        stage: Stage,
        env: &Envelope,
        raw: &str,
    ) -> Result<(StageOutput, String)> {
        match stage {
            Stage::Intent => {
                let output = stages::parse_intent(env, raw)?;
                let summary = format!(
                    "intent: {}; {} goal(s)",
                    output.classified_intent,
                    output.goals.len()
                );
                Ok((StageOutput::Intent(output), summary))
            }
            Stage::Planner => {
                let output = stages::parse_planner(
                    env,
                    raw,
                    self.config.max_plan_steps,
                    self.ctx.bounds.max_total_code_tokens as u64,
                )?;
                let summary = format!("planned {} step(s)", output.steps.len());
                Ok((StageOutput::Planner(output), summary))
            }
            Stage::Synthesizer => {
                let output = stages::parse_synthesizer(raw)?;
                let summary = format!("{} claim(s)", output.claims.len());
                Ok((StageOutput::Synthesizer(output), summary))
            }
            Stage::Critic => {
                let output = stages::parse_critic(env, raw)?;
                let summary = format!("verdict: {}; {}", output.verdict, output.reason);
                Ok((StageOutput::Critic(output), summary))
            }
            _ => Err(Error::Internal(format!("{stage} has no LLM output"))),
        }
    }

    /// Core LLM call: mock handler when installed, provider otherwise.
    /// Cancellation aborts an in-flight provider call.
    async fn call_llm(
        &self,
        stage: Stage,
        env: &mut Envelope,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if let Some(mock) = self.mocks.get(stage) {
            let raw = mock(&*env)?;
            self.tracker.record_llm_call(&env.request_id, 0, 0);
            env.resource_usage.record_llm(0, 0);
            return Ok(raw);
        }

        let options = CompletionOptions::new().with_json_only(stage != Stage::Integration);
        let completion = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.provider.complete(prompt, &options) => result?,
        };

        self.tracker.record_llm_call(
            &env.request_id,
            completion.tokens_in,
            completion.tokens_out,
        );
        env.resource_usage
            .record_llm(completion.tokens_in, completion.tokens_out);
        Ok(completion.text)
    }

    fn emit(&self, events: &UnboundedSender<AnalysisEvent>, event: AnalysisEvent) {
        let request_id = match &event {
            AnalysisEvent::Stage(e) => e.request_id.to_string(),
            AnalysisEvent::Terminal(e) => e.request_id.to_string(),
        };
        if let Ok(payload) = serde_json::to_value(&event) {
            if let Err(e) = self
                .ctx
                .store
                .append_event(&request_id, event.type_name(), &payload)
            {
                tracing::warn!(%request_id, error = %e, "failed to persist event");
            }
        }
        let _ = events.send(event);
    }

    /// Persist session state and cache a completed answer.
    fn persist_terminal(&self, env: &Envelope, report: &TerminalReport) {
        if let Some(session_id) = &env.session_id {
            let state = json!({
                "recent_query": env.query,
                "citation_count": env.citations.len(),
                "last_reason": env.termination_reason,
            });
            if let Err(e) = self.ctx.store.save_session(session_id, &state) {
                tracing::warn!(%session_id, error = %e, "failed to persist session state");
            }
        }

        if report.termination_reason == TerminationReason::Completed
            && report.final_response.is_some()
        {
            let key = answer_fingerprint(&env.query);
            if let Ok(serialized) = serde_json::to_string(report) {
                if let Err(e) = self.ctx.store.put_understanding(
                    &key,
                    &serialized,
                    self.config.understanding_ttl_seconds,
                ) {
                    tracing::warn!(error = %e, "failed to cache explanation");
                }
            }
        }
    }
}

/// Cache key for a completed answer.
pub fn answer_fingerprint(query: &str) -> String {
    let normalized = query.split_whitespace().collect::<Vec<_>>().join(" ");
    fingerprint(["answer", normalized.as_str()])
}

fn integration_response(env: &Envelope) -> Option<String> {
    env.output_for(Stage::Integration)
        .and_then(|o| o.as_integration())
        .map(|i| i.final_response.clone())
}

fn clarification_question(env: &Envelope) -> Option<String> {
    let intent = env.output_for(Stage::Intent).and_then(|o| o.as_intent())?;
    if intent.clarification_required {
        Some(
            intent
                .clarification_question
                .clone()
                .unwrap_or_else(|| "Could you say more about what you want to know?".to_string()),
        )
    } else {
        None
    }
}

fn wording_prompt(env: &Envelope, draft: &IntegrationOutput) -> String {
    format!(
        "Reword the answer below for clarity. Keep every [path:line] citation \
         exactly where it is; do not add or remove citations.\n\n{}\n\nContext:\n{}",
        draft.final_response,
        crate::pipeline::context::integration_input(env)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accountant::UnboundedTracker;
    use crate::envelope::RequestId;
    use crate::event::StageStatus;
    use crate::llm::{Completion, CompletionOptions};
    use crate::pipeline::outputs::{PlanStep, PlannedTool, PlannerOutput};
    use crate::storage::{SqliteStore, SymbolRecord};
    use crate::tools::registry::builtin_registry;
    use crate::tools::ContextBounds;
    use crate::workspace::Workspace;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct NoLlm;

    #[async_trait]
    impl LlmProvider for NoLlm {
        async fn complete(
            &self,
            _prompt: &str,
            _options: &CompletionOptions,
        ) -> Result<Completion> {
            Err(Error::Internal("completion requested without a mock".to_string()))
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(Error::llm_api("stub", "no embeddings"))
        }

        fn name(&self) -> &str {
            "none"
        }
    }

    /// check_quota starts rejecting at the given call count.
    struct CountdownTracker {
        reject_at: usize,
        checks: AtomicUsize,
    }

    impl CountdownTracker {
        fn new(reject_at: usize) -> Self {
            Self {
                reject_at,
                checks: AtomicUsize::new(0),
            }
        }
    }

    impl ResourceTracker for CountdownTracker {
        fn record_llm_call(&self, _request_id: &RequestId, _tokens_in: u64, _tokens_out: u64) {}
        fn record_tool_call(&self, _request_id: &RequestId, _tool: &str) {}
        fn check_quota(&self, _request_id: &RequestId) -> QuotaDecision {
            let seen = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
            if seen >= self.reject_at {
                QuotaDecision::exceeded("llm budget exhausted for this request")
            } else {
                QuotaDecision::Ok
            }
        }
    }

    fn fixture() -> (TempDir, Arc<ToolContext>) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src/auth")).unwrap();

        let mut login = String::new();
        for i in 1..=41 {
            login.push_str(&format!("# placeholder line {i}\n"));
        }
        login.push_str("def login(user):\n    return session.open(user)\n");
        fs::write(dir.path().join("src/auth/login.py"), login).unwrap();

        let mut errors = String::new();
        for i in 1..=9 {
            errors.push_str(&format!("# error notes {i}\n"));
        }
        errors.push_str("def error_handler(exc):\n    raise exc\n");
        fs::write(dir.path().join("src/errors.py"), errors).unwrap();

        let store = SqliteStore::in_memory().unwrap();
        store
            .insert_symbols(&[
                SymbolRecord::new("src/auth/login.py", "login", "function", 42, 43)
                    .with_language("python"),
                SymbolRecord::new("src/errors.py", "error_handler", "function", 10, 11)
                    .with_language("python"),
            ])
            .unwrap();

        let ctx = ToolContext::new(
            Arc::new(Workspace::open(dir.path()).unwrap()),
            Arc::new(store),
            Arc::new(NoLlm),
            ContextBounds::default(),
        );
        (dir, Arc::new(ctx))
    }

    fn runtime_with(
        ctx: Arc<ToolContext>,
        tracker: Arc<dyn ResourceTracker>,
        mocks: StageMocks,
    ) -> PipelineRuntime {
        let registry = Arc::new(builtin_registry().unwrap());
        let ctx = Arc::new(
            ToolContext::new(
                Arc::clone(&ctx.workspace),
                Arc::clone(&ctx.store),
                Arc::clone(&ctx.provider),
                ctx.bounds.clone(),
            )
            .with_catalog(registry.specs()),
        );
        PipelineRuntime::new(
            Arc::new(NoLlm),
            registry,
            ctx,
            tracker,
            PipelineConfig::default(),
        )
        .with_mocks(mocks)
    }

    async fn drive(
        runtime: &PipelineRuntime,
        env: Envelope,
        cancel: CancellationToken,
    ) -> (Envelope, Vec<AnalysisEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let env = runtime.run(env, &tx, cancel).await;
        drop(tx);
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (env, events)
    }

    fn approve_mocks() -> StageMocks {
        let mut mocks = StageMocks::new();
        mocks
            .set(Stage::Intent, |_| {
                Ok(r#"{"classified_intent": "find_symbol", "goals": ["locate login"]}"#.into())
            })
            .unwrap();
        mocks
            .set(Stage::Planner, |_| {
                Ok(r#"{"steps": [{"tool_name": "search_code",
                     "arguments": {"query": "login"}, "rationale": "find the definition"}]}"#
                    .into())
            })
            .unwrap();
        mocks
            .set(Stage::Synthesizer, |_| {
                Ok(r#"{"claims": [{"text": "`login` is defined in `src/auth/login.py`.",
                     "supporting_citations": ["src/auth/login.py:42"]}]}"#
                    .into())
            })
            .unwrap();
        mocks
            .set(Stage::Critic, |_| {
                Ok(r#"{"verdict": "approve", "reason": "all cited"}"#.into())
            })
            .unwrap();
        mocks
    }

    // Scenario: find a symbol in a single cycle.
    #[tokio::test]
    async fn test_find_symbol_single_cycle() {
        let (_dir, ctx) = fixture();
        let runtime = runtime_with(ctx, Arc::new(UnboundedTracker), approve_mocks());
        let env = Envelope::new("Where is login defined?", None);
        let (env, events) = drive(&runtime, env, CancellationToken::new()).await;

        assert_eq!(env.termination_reason, Some(TerminationReason::Completed));
        assert_eq!(env.reintent_cycles, 0);

        let plan = env.output_for(Stage::Planner).unwrap().as_planner().unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].tool_name, PlannedTool::SearchCode);

        let executor = env.output_for(Stage::Executor).unwrap().as_executor().unwrap();
        assert_eq!(executor.results[0].found_via.as_deref(), Some("exact_symbol"));

        let integration = env
            .output_for(Stage::Integration)
            .unwrap()
            .as_integration()
            .unwrap();
        assert!(integration.final_response.contains("[src/auth/login.py:42]"));

        let terminal = events.last().unwrap().as_terminal().unwrap();
        assert_eq!(terminal.termination_reason, TerminationReason::Completed);
        assert!(terminal
            .citations
            .iter()
            .any(|c| c.to_string() == "src/auth/login.py:42"));
    }

    // Scenario: critic rejection, refocused re-entry, then approval.
    #[tokio::test]
    async fn test_reentry_then_approval() {
        let (_dir, ctx) = fixture();
        let mut mocks = StageMocks::new();
        mocks
            .set(Stage::Intent, |_| {
                Ok(r#"{"classified_intent": "explain", "goals": ["explain error handling"]}"#
                    .into())
            })
            .unwrap();
        mocks
            .set(Stage::Planner, |env| {
                let query = match env.reintent_focus.as_deref() {
                    Some(focus) => focus.to_string(),
                    None => "error".to_string(),
                };
                Ok(json!({"steps": [{"tool_name": "search_code",
                    "arguments": {"query": query},
                    "rationale": "gather evidence"}]})
                .to_string())
            })
            .unwrap();
        let synth_calls = Arc::new(AtomicUsize::new(0));
        let synth_count = Arc::clone(&synth_calls);
        mocks
            .set(Stage::Synthesizer, move |_| {
                if synth_count.fetch_add(1, Ordering::SeqCst) == 0 {
                    // Invented claim with no citation
                    Ok(r#"{"claims": [{"text": "Errors are retried three times.",
                         "supporting_citations": []}]}"#
                        .into())
                } else {
                    Ok(r#"{"claims": [{"text": "Errors funnel through error_handler.",
                         "supporting_citations": ["src/errors.py:10"]}]}"#
                        .into())
                }
            })
            .unwrap();
        mocks
            .set(Stage::Critic, |env| {
                if env.reintent_cycles == 0 {
                    Ok(r#"{"verdict": "reject", "reason": "claim lacks a citation",
                         "suggested_reintent_focus": "error_handler"}"#
                        .into())
                } else {
                    Ok(r#"{"verdict": "approve", "reason": "claim is cited"}"#.into())
                }
            })
            .unwrap();

        let runtime = runtime_with(ctx, Arc::new(UnboundedTracker), mocks);
        let env = Envelope::new("Explain how errors are handled", None);
        let (env, _events) = drive(&runtime, env, CancellationToken::new()).await;

        assert_eq!(env.termination_reason, Some(TerminationReason::Completed));
        assert_eq!(env.reintent_cycles, 1);
        assert_eq!(env.reintent_focus.as_deref(), Some("error_handler"));

        // Citation closure: every cited source was actually observed.
        let integration = env
            .output_for(Stage::Integration)
            .unwrap()
            .as_integration()
            .unwrap();
        assert!(!integration.cited_sources.is_empty());
        assert!(integration
            .cited_sources
            .iter()
            .all(|c| env.citations.contains(c)));
    }

    // Scenario: three rejections exhaust the cycle budget.
    #[tokio::test]
    async fn test_cycle_limit_after_third_rejection() {
        let (_dir, ctx) = fixture();
        let mut mocks = approve_mocks();
        mocks
            .set(Stage::Synthesizer, |_| {
                Ok(r#"{"claims": [{"text": "Unfounded statement.",
                     "supporting_citations": []}]}"#
                    .into())
            })
            .unwrap();
        mocks
            .set(Stage::Critic, |_| {
                Ok(r#"{"verdict": "reject", "reason": "no citations"}"#.into())
            })
            .unwrap();

        let runtime = runtime_with(ctx, Arc::new(UnboundedTracker), mocks);
        let env = Envelope::new("Where is login defined?", None);
        let (env, events) = drive(&runtime, env, CancellationToken::new()).await;

        assert_eq!(
            env.termination_reason,
            Some(TerminationReason::CriticRejected)
        );
        assert_eq!(env.reintent_cycles, 2);

        let integration = env
            .output_for(Stage::Integration)
            .unwrap()
            .as_integration()
            .unwrap();
        assert!(integration.final_response.contains("Unverified:"));

        let terminal = events.last().unwrap().as_terminal().unwrap();
        assert_eq!(terminal.termination_reason, TerminationReason::CriticRejected);
        assert!(terminal.explanation.is_some());
    }

    // Scenario: a file that does not exist anywhere.
    #[tokio::test]
    async fn test_not_found_path_yields_honest_answer() {
        let (_dir, ctx) = fixture();
        let mut mocks = approve_mocks();
        mocks
            .set(Stage::Intent, |_| {
                Ok(r#"{"classified_intent": "search", "goals": ["show nonexistent.py"]}"#.into())
            })
            .unwrap();
        mocks
            .set(Stage::Planner, |_| {
                Ok(r#"{"steps": [{"tool_name": "read_code",
                     "arguments": {"path": "nonexistent.py"}, "rationale": "user asked"}]}"#
                    .into())
            })
            .unwrap();
        mocks
            .set(Stage::Synthesizer, |_| Ok(r#"{"claims": []}"#.into()))
            .unwrap();

        let runtime = runtime_with(ctx, Arc::new(UnboundedTracker), mocks);
        let env = Envelope::new("Show contents of nonexistent.py", None);
        let (env, _events) = drive(&runtime, env, CancellationToken::new()).await;

        assert_eq!(env.termination_reason, Some(TerminationReason::Completed));

        // Search-first discipline inserted a locating search before the read.
        let plan = env.output_for(Stage::Planner).unwrap().as_planner().unwrap();
        assert_eq!(plan.steps[0].tool_name, PlannedTool::SearchCode);
        assert_eq!(plan.steps[1].tool_name, PlannedTool::ReadCode);

        let executor = env.output_for(Stage::Executor).unwrap().as_executor().unwrap();
        let read_result = &executor.results[1];
        assert_eq!(read_result.tool, "read_code");
        assert_eq!(read_result.status, crate::tools::types::ToolStatus::NotFound);
        assert_eq!(read_result.attempt_history.len(), 4);

        // Attempt-history monotonicity: the envelope holds every attempt.
        let total_attempts: usize = executor
            .results
            .iter()
            .map(|r| r.attempt_history.len())
            .sum();
        assert_eq!(env.attempt_history.len(), total_attempts);

        let integration = env
            .output_for(Stage::Integration)
            .unwrap()
            .as_integration()
            .unwrap();
        assert!(integration
            .final_response
            .contains("No file named nonexistent.py was found"));
        assert!(integration.cited_sources.is_empty());
        assert!(env.citations.is_empty());
    }

    // Scenario: cancellation between stages terminates cooperatively.
    #[tokio::test]
    async fn test_cancellation_after_planner_skips_executor() {
        let (_dir, ctx) = fixture();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let mut mocks = approve_mocks();
        mocks
            .set(Stage::Planner, move |_| {
                trigger.cancel();
                Ok(r#"{"steps": [{"tool_name": "search_code",
                     "arguments": {"query": "login"}, "rationale": "find it"}]}"#
                    .into())
            })
            .unwrap();

        let runtime = runtime_with(ctx, Arc::new(UnboundedTracker), mocks);
        let env = Envelope::new("Where is login defined?", None);
        let (env, events) = drive(&runtime, env, cancel).await;

        assert_eq!(env.termination_reason, Some(TerminationReason::Cancelled));
        // The planner finished; the executor never started.
        assert!(env.output_for(Stage::Planner).is_some());
        assert!(env.output_for(Stage::Executor).is_none());
        let started: Vec<Stage> = events
            .iter()
            .filter_map(|e| match e {
                AnalysisEvent::Stage(s) if s.status == StageStatus::Started => Some(s.stage),
                _ => None,
            })
            .collect();
        assert!(!started.contains(&Stage::Executor));
        assert!(events.last().unwrap().is_terminal());
    }

    // Scenario: cancellation mid-executor retains partial output.
    #[tokio::test]
    async fn test_cancellation_mid_executor_keeps_partial_results() {
        let (_dir, ctx) = fixture();
        let registry = builtin_registry().unwrap();
        let ctx = ToolContext::new(
            Arc::clone(&ctx.workspace),
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.provider),
            ctx.bounds.clone(),
        )
        .with_catalog(registry.specs());

        let mut env = Envelope::new("read the auth module", None);
        env.push_output(StageOutput::Planner(PlannerOutput {
            steps: vec![
                PlanStep::new(
                    PlannedTool::ReadCode,
                    json!({"path": "src/auth/login.py", "start_line": 42, "end_line": 43}),
                    "read the definition",
                ),
                PlanStep::new(
                    PlannedTool::ReadCode,
                    json!({"path": "src/errors.py"}),
                    "read error handling",
                ),
            ],
            context_budget_remaining: 25_000,
        }));

        // The signal arrives while the first call is in flight: that call
        // finishes, the second never starts.
        let cancel = CancellationToken::new();
        cancel.cancel();
        let output = stages::run_executor(
            &mut env,
            &registry,
            &ctx,
            &UnboundedTracker,
            &cancel,
        )
        .await
        .unwrap();

        assert!(output.stopped_early);
        assert_eq!(output.results.len(), 1);
        assert_eq!(output.results[0].status, crate::tools::types::ToolStatus::Success);

        env.push_output(StageOutput::Executor(output));
        env.terminate(TerminationReason::Cancelled);
        let report = TerminalReport::from_envelope(&env, None);
        assert_eq!(report.termination_reason, TerminationReason::Cancelled);
        assert!(report
            .citations
            .iter()
            .any(|c| c.to_string() == "src/auth/login.py:42"));
    }

    // Scenario: the accountant rejects before the planner of the last cycle.
    #[tokio::test]
    async fn test_quota_exceeded_mid_reentry_still_answers() {
        let (_dir, ctx) = fixture();
        let mut mocks = approve_mocks();
        mocks
            .set(Stage::Synthesizer, |_| {
                Ok(r#"{"claims": [{"text": "Unfounded statement.",
                     "supporting_citations": []}]}"#
                    .into())
            })
            .unwrap();
        mocks
            .set(Stage::Critic, |_| {
                Ok(r#"{"verdict": "reject", "reason": "no citations"}"#.into())
            })
            .unwrap();

        // Quota checks run before each LLM stage: 4 per full cycle, so the
        // 10th check lands right before the planner of the second re-entry.
        let runtime = runtime_with(ctx, Arc::new(CountdownTracker::new(10)), mocks);
        let env = Envelope::new("Where is login defined?", None);
        let (env, _events) = drive(&runtime, env, CancellationToken::new()).await;

        assert_eq!(
            env.termination_reason,
            Some(TerminationReason::QuotaExceeded)
        );
        assert_eq!(env.reintent_cycles, 2);
        // The planner of the final cycle never ran.
        assert!(env.output_for(Stage::Planner).is_none());

        let integration = env
            .output_for(Stage::Integration)
            .unwrap()
            .as_integration()
            .unwrap();
        assert!(integration
            .final_response
            .contains("resource budget was exhausted"));
        // Citations gathered in earlier cycles are still reported.
        assert!(!env.citations.is_empty());
    }

    // Replaying a terminated envelope emits the same terminal event and
    // performs no external calls.
    #[tokio::test]
    async fn test_idempotent_replay_of_terminated_envelope() {
        let (_dir, ctx) = fixture();
        let store = Arc::clone(&ctx.store);
        let runtime = runtime_with(ctx, Arc::new(UnboundedTracker), approve_mocks());
        let env = Envelope::new("Where is login defined?", None);
        let (env, first_events) = drive(&runtime, env, CancellationToken::new()).await;
        let first_terminal = first_events.last().unwrap().as_terminal().unwrap().clone();

        let logged_before = store.events_for(&env.request_id.to_string()).unwrap().len();
        let (env, replay_events) = drive(&runtime, env, CancellationToken::new()).await;
        let logged_after = store.events_for(&env.request_id.to_string()).unwrap().len();

        assert_eq!(replay_events.len(), 1);
        let replayed = replay_events[0].as_terminal().unwrap();
        assert_eq!(replayed.termination_reason, first_terminal.termination_reason);
        assert_eq!(replayed.final_response, first_terminal.final_response);
        assert_eq!(replayed.citations, first_terminal.citations);
        assert_eq!(logged_before, logged_after);
    }

    // Tool-derived tokens beyond the budget stop the pipeline before the
    // next LLM call.
    #[tokio::test]
    async fn test_code_token_bound_enforced_before_next_llm_call() {
        let (_dir, ctx) = fixture();
        let ctx = Arc::new(
            ToolContext::new(
                Arc::clone(&ctx.workspace),
                Arc::clone(&ctx.store),
                Arc::clone(&ctx.provider),
                ContextBounds {
                    max_total_code_tokens: 1,
                    ..ContextBounds::default()
                },
            ),
        );
        let runtime = runtime_with(ctx, Arc::new(UnboundedTracker), approve_mocks());
        let env = Envelope::new("Where is login defined?", None);
        let (env, events) = drive(&runtime, env, CancellationToken::new()).await;

        assert_eq!(
            env.termination_reason,
            Some(TerminationReason::QuotaExceeded)
        );
        // The executor ran, the synthesizer never did.
        assert!(env.output_for(Stage::Executor).is_some());
        assert!(env.output_for(Stage::Synthesizer).is_none());
        let started: Vec<Stage> = events
            .iter()
            .filter_map(|e| match e {
                AnalysisEvent::Stage(s) if s.status == StageStatus::Started => Some(s.stage),
                _ => None,
            })
            .collect();
        assert!(!started.contains(&Stage::Synthesizer));
        // Evidence gathered before the stop is still reported.
        let terminal = events.last().unwrap().as_terminal().unwrap();
        assert!(!terminal.citations.is_empty());
    }

    // An incomprehensible query short-circuits into a clarification.
    #[tokio::test]
    async fn test_empty_query_asks_for_clarification() {
        let (_dir, ctx) = fixture();
        let runtime = runtime_with(ctx, Arc::new(UnboundedTracker), approve_mocks());
        let env = Envelope::new("???", None);
        let (env, events) = drive(&runtime, env, CancellationToken::new()).await;

        assert_eq!(env.termination_reason, Some(TerminationReason::Completed));
        assert!(env.output_for(Stage::Planner).is_none());
        let terminal = events.last().unwrap().as_terminal().unwrap();
        assert!(terminal
            .final_response
            .as_deref()
            .unwrap()
            .contains("What would you like to know"));
    }

    // A critic clarify verdict completes with the question as the response.
    #[tokio::test]
    async fn test_critic_clarify_completes_with_question() {
        let (_dir, ctx) = fixture();
        let mut mocks = approve_mocks();
        mocks
            .set(Stage::Critic, |_| {
                Ok(r#"{"verdict": "clarify",
                     "reason": "Which login do you mean, web or cli?"}"#
                    .into())
            })
            .unwrap();

        let runtime = runtime_with(ctx, Arc::new(UnboundedTracker), mocks);
        let env = Envelope::new("Where is login defined?", None);
        let (env, events) = drive(&runtime, env, CancellationToken::new()).await;

        assert_eq!(env.termination_reason, Some(TerminationReason::Completed));
        let terminal = events.last().unwrap().as_terminal().unwrap();
        assert!(terminal
            .final_response
            .as_deref()
            .unwrap()
            .contains("Which login do you mean"));
    }

    // Malformed model output is retried once, then fails the request.
    #[tokio::test]
    async fn test_malformed_output_retry_then_internal_error() {
        let (_dir, ctx) = fixture();
        let mut mocks = approve_mocks();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        mocks
            .set(Stage::Intent, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("this is not json".into())
            })
            .unwrap();

        let runtime = runtime_with(ctx, Arc::new(UnboundedTracker), mocks);
        let env = Envelope::new("Where is login defined?", None);
        let (env, events) = drive(&runtime, env, CancellationToken::new()).await;

        assert_eq!(
            env.termination_reason,
            Some(TerminationReason::InternalError)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let failed = events.iter().any(|e| {
            matches!(e, AnalysisEvent::Stage(s)
                if s.stage == Stage::Intent && s.status == StageStatus::Failed)
        });
        assert!(failed);
    }

    // A recovered second attempt keeps the request alive.
    #[tokio::test]
    async fn test_malformed_output_recovers_on_retry() {
        let (_dir, ctx) = fixture();
        let mut mocks = approve_mocks();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        mocks
            .set(Stage::Intent, move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok("garbled".into())
                } else {
                    Ok(r#"{"classified_intent": "find_symbol", "goals": ["locate login"]}"#.into())
                }
            })
            .unwrap();

        let runtime = runtime_with(ctx, Arc::new(UnboundedTracker), mocks);
        let env = Envelope::new("Where is login defined?", None);
        let (env, _events) = drive(&runtime, env, CancellationToken::new()).await;

        assert_eq!(env.termination_reason, Some(TerminationReason::Completed));
    }
}
