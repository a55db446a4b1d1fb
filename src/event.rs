//! Observable events emitted while a request moves through the pipeline.
//!
//! The runtime is the sole producer for a request; the service façade is the
//! sole consumer. The stream always ends with exactly one terminal event.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::envelope::{Envelope, RequestId, ResourceUsage, TerminationReason};
use crate::evidence::Citation;
use crate::pipeline::Stage;

/// Lifecycle state reported for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Started,
    Completed,
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One stage boundary crossing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub request_id: RequestId,
    pub stage: Stage,
    pub status: StageStatus,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

/// Final payload carried by the last event of every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalReport {
    pub request_id: RequestId,
    pub termination_reason: TerminationReason,
    /// Plain-language explanation when the reason is not `completed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_response: Option<String>,
    /// Citations observed before termination, in observation order
    pub citations: Vec<Citation>,
    pub usage: ResourceUsage,
    pub reintent_cycles: u32,
    pub timestamp: DateTime<Utc>,
}

impl TerminalReport {
    /// Build the terminal payload from a terminated envelope.
    pub fn from_envelope(env: &Envelope, final_response: Option<String>) -> Self {
        let reason = env
            .termination_reason
            .unwrap_or(TerminationReason::InternalError);
        let explanation = match reason {
            TerminationReason::Completed => None,
            TerminationReason::CriticRejected => Some(
                "The answer could not be fully verified against the repository; unverified claims are flagged in the response.".to_string(),
            ),
            TerminationReason::CycleLimit => {
                Some("The re-entry budget was exhausted before verification succeeded.".to_string())
            }
            TerminationReason::QuotaExceeded => {
                Some("A resource budget was exhausted before the analysis finished.".to_string())
            }
            TerminationReason::Cancelled => {
                Some("The request was cancelled before the analysis finished.".to_string())
            }
            TerminationReason::InternalError => {
                Some("An internal error stopped the analysis.".to_string())
            }
        };
        Self {
            request_id: env.request_id.clone(),
            termination_reason: reason,
            explanation,
            final_response,
            citations: env.citations.iter().cloned().collect(),
            usage: env.resource_usage.clone(),
            reintent_cycles: env.reintent_cycles,
            timestamp: Utc::now(),
        }
    }
}

/// Every event a request can emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalysisEvent {
    Stage(StageEvent),
    Terminal(TerminalReport),
}

impl AnalysisEvent {
    pub fn stage(
        request_id: RequestId,
        stage: Stage,
        status: StageStatus,
        summary: impl Into<String>,
    ) -> Self {
        Self::Stage(StageEvent {
            request_id,
            stage,
            status,
            summary: summary.into(),
            timestamp: Utc::now(),
        })
    }

    /// Event-type label used for the persistent log.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Stage(_) => "stage",
            Self::Terminal(_) => "terminal",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    pub fn as_terminal(&self) -> Option<&TerminalReport> {
        match self {
            Self::Terminal(report) => Some(report),
            _ => None,
        }
    }
}

/// A boxed stream of analysis events, ending with the terminal event.
pub type EventStream = Pin<Box<dyn Stream<Item = AnalysisEvent> + Send>>;
