//! Guardrail layer: static policies over candidate action strings and
//! evidence paths.
//!
//! Everything here is a pure function of the action text plus the run mode;
//! no I/O except the final canonical-path resolution for evidence
//! containment. Rejections are fatal for the step that produced them, never
//! silently dropped: callers turn them into `blocked_guardrail` outcomes and
//! `ui_findings` entries naming the rule.

pub mod actions;
pub mod command;
pub mod evidence;
pub mod rules;

pub use actions::{validate_report_actions, ActionAudit};
pub use command::{
    evaluate_command, require_sensitive_confirmation, task_has_sensitive_intent,
    task_violates_code_edit_rule, GuardrailDecision,
};
pub use evidence::validate_evidence_paths;
pub use rules::{mode_allowlist, RunMode};
