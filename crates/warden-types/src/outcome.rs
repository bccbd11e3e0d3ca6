//! Per-step outcome records.

use serde::{Deserialize, Serialize};

use crate::step::WebStep;

/// Terminal status of one executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The primitive completed and the after-evidence was captured.
    Ok,
    /// The primitive hit its interactive/wait deadline.
    Timeout,
    /// Target missing after the retry ladder ran dry.
    TargetNotFound,
    /// Applicability precheck failed; no retry budget consumed.
    Skipped,
    /// Watchdog declared no useful progress within the stuck window.
    Stuck,
    /// Focus could not be returned to the main frame.
    StuckIframe,
    /// A guardrail rejected the candidate action.
    BlockedGuardrail,
}

impl StepStatus {
    /// Whether this outcome contributes an `actions[]` entry. Only `ok`
    /// interactive outcomes do (P5).
    pub fn records_action(&self) -> bool {
        matches!(self, StepStatus::Ok)
    }
}

/// What happened to one step of the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    /// 1-based index in the frozen plan.
    pub index: usize,
    pub step: WebStep,
    pub status: StepStatus,
    /// Selector that actually resolved the target, when a fallback or a
    /// learned selector was used instead of the literal one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector_used: Option<String>,
    /// Retries consumed before the status settled.
    #[serde(default)]
    pub retries: u32,
    /// Human-readable reason for skip/blocked statuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StepOutcome {
    pub fn new(index: usize, step: WebStep, status: StepStatus) -> Self {
        Self {
            index,
            step,
            status,
            selector_used: None,
            retries: 0,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
