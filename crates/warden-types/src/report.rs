//! Canonical run report schema.
//!
//! Every run, regardless of backend, emits exactly one [`RunReport`]. The
//! schema is fixed: nine keys, string lists everywhere, and a three-valued
//! [`RunResult`]. Backends that produce anything else go through the
//! normaliser in `warden-report` before a report is accepted.

use serde::{Deserialize, Serialize};

/// The exact key set of `report.json`. Payloads with missing or extra keys
/// are rejected by strict parsing; the normaliser drops unknown keys first.
pub const REPORT_KEYS: [&str; 9] = [
    "task_id",
    "goal",
    "actions",
    "observations",
    "console_errors",
    "network_findings",
    "ui_findings",
    "result",
    "evidence_paths",
];

/// Terminal classification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunResult {
    /// All interactive steps succeeded and verify findings were positive.
    Success,
    /// At least one step succeeded but something failed, timed out, was
    /// blocked, or the run was handed off.
    Partial,
    /// No interactive step succeeded, or the run never bootstrapped.
    Failed,
}

impl RunResult {
    /// Parse the canonical lowercase form. Anything else is rejected; the
    /// lossy coercion for narrative output lives in the normaliser.
    pub fn parse_strict(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The canonical machine-readable evidence report for one run.
///
/// `actions` entries are authored by the engine and always match
/// `^cmd: .+`. `evidence_paths` entries resolve inside the run directory;
/// both invariants are enforced at finalisation, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub task_id: String,
    pub goal: String,
    pub actions: Vec<String>,
    pub observations: Vec<String>,
    pub console_errors: Vec<String>,
    pub network_findings: Vec<String>,
    pub ui_findings: Vec<String>,
    pub result: RunResult,
    pub evidence_paths: Vec<String>,
}

impl RunReport {
    /// A failed report carrying a single reason, used when a run dies before
    /// any backend produced output. Keeps I5 intact: even a crashed run
    /// leaves a well-formed report behind.
    pub fn failed(task_id: impl Into<String>, goal: impl Into<String>, reason: &str) -> Self {
        Self {
            task_id: task_id.into(),
            goal: goal.into(),
            actions: Vec::new(),
            observations: Vec::new(),
            console_errors: vec![reason.to_string()],
            network_findings: Vec::new(),
            ui_findings: Vec::new(),
            result: RunResult::Failed,
            evidence_paths: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_roundtrip() {
        for (raw, expected) in [
            ("success", RunResult::Success),
            ("partial", RunResult::Partial),
            ("failed", RunResult::Failed),
        ] {
            assert_eq!(RunResult::parse_strict(raw), Some(expected));
            assert_eq!(expected.as_str(), raw);
        }
        assert_eq!(RunResult::parse_strict("Success"), None);
        assert_eq!(RunResult::parse_strict("done"), None);
    }

    #[test]
    fn report_serializes_with_lowercase_result() {
        let report = RunReport::failed("t-1", "goal", "boom");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["result"], "failed");
        assert_eq!(json["console_errors"][0], "boom");
        let keys: Vec<&str> = json.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        for key in REPORT_KEYS {
            assert!(keys.contains(&key), "missing key {key}");
        }
    }

    #[test]
    fn report_deserialization_rejects_bad_result() {
        let raw = r#"{
            "task_id": "t", "goal": "g", "actions": [], "observations": [],
            "console_errors": [], "network_findings": [], "ui_findings": [],
            "result": "almost", "evidence_paths": []
        }"#;
        assert!(serde_json::from_str::<RunReport>(raw).is_err());
    }
}
