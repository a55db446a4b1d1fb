//! Resource accounting interface and the built-in trackers.
//!
//! The runtime records usage and honours quota decisions; it never decides
//! quotas itself. Production deployments plug their own tracker in through
//! the `ResourceTracker` trait.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::envelope::RequestId;

/// Answer from a quota check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum QuotaDecision {
    Ok,
    Exceeded { reason: String },
}

impl QuotaDecision {
    pub fn exceeded(reason: impl Into<String>) -> Self {
        Self::Exceeded {
            reason: reason.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Per-request resource tracker.
///
/// `record_*` are called from the LLM adapter path and the tool executor;
/// `check_quota` is called by the runtime at stage boundaries.
pub trait ResourceTracker: Send + Sync {
    fn record_llm_call(&self, request_id: &RequestId, tokens_in: u64, tokens_out: u64);
    fn record_tool_call(&self, request_id: &RequestId, tool: &str);
    fn check_quota(&self, request_id: &RequestId) -> QuotaDecision;
}

/// Limits enforced by the in-memory tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub max_llm_calls: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_total_tokens: Option<u64>,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_llm_calls: 10,
            max_tool_calls: None,
            max_total_tokens: None,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct RequestCounters {
    llm_calls: u64,
    tool_calls: u64,
    total_tokens: u64,
}

/// In-memory tracker enforcing [`QuotaLimits`] per request.
pub struct InMemoryTracker {
    limits: QuotaLimits,
    counters: Mutex<HashMap<String, RequestCounters>>,
}

impl InMemoryTracker {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Forget a finished request's counters.
    pub fn forget(&self, request_id: &RequestId) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.remove(&request_id.to_string());
        }
    }

    fn with_counters<T>(
        &self,
        request_id: &RequestId,
        f: impl FnOnce(&mut RequestCounters) -> T,
    ) -> Option<T> {
        let mut counters = self.counters.lock().ok()?;
        Some(f(counters.entry(request_id.to_string()).or_default()))
    }
}

impl Default for InMemoryTracker {
    fn default() -> Self {
        Self::new(QuotaLimits::default())
    }
}

impl ResourceTracker for InMemoryTracker {
    fn record_llm_call(&self, request_id: &RequestId, tokens_in: u64, tokens_out: u64) {
        self.with_counters(request_id, |c| {
            c.llm_calls += 1;
            c.total_tokens += tokens_in + tokens_out;
        });
    }

    fn record_tool_call(&self, request_id: &RequestId, _tool: &str) {
        self.with_counters(request_id, |c| c.tool_calls += 1);
    }

    fn check_quota(&self, request_id: &RequestId) -> QuotaDecision {
        let counters = self
            .with_counters(request_id, |c| c.clone())
            .unwrap_or_default();

        if counters.llm_calls >= self.limits.max_llm_calls {
            return QuotaDecision::exceeded(format!(
                "LLM call budget exhausted ({} of {})",
                counters.llm_calls, self.limits.max_llm_calls
            ));
        }
        if let Some(max) = self.limits.max_tool_calls {
            if counters.tool_calls >= max {
                return QuotaDecision::exceeded(format!(
                    "tool call budget exhausted ({} of {max})",
                    counters.tool_calls
                ));
            }
        }
        if let Some(max) = self.limits.max_total_tokens {
            if counters.total_tokens >= max {
                return QuotaDecision::exceeded(format!(
                    "token budget exhausted ({} of {max})",
                    counters.total_tokens
                ));
            }
        }
        QuotaDecision::Ok
    }
}

/// Tracker that records nothing and never rejects.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnboundedTracker;

impl ResourceTracker for UnboundedTracker {
    fn record_llm_call(&self, _request_id: &RequestId, _tokens_in: u64, _tokens_out: u64) {}
    fn record_tool_call(&self, _request_id: &RequestId, _tool: &str) {}
    fn check_quota(&self, _request_id: &RequestId) -> QuotaDecision {
        QuotaDecision::Ok
    }
}
