//! Result classification and structured-findings backfill at finalisation.
//!
//! The finaliser always runs: whatever happened to the run, the report it
//! leaves behind carries a complete `what_failed=`/`where=`/... block and a
//! `final_state=` marker so downstream consumers never have to guess.

use warden_types::RunResult;

const STRUCTURED_KEYS: [&str; 5] = [
    "what_failed=",
    "where=",
    "why_likely=",
    "attempted=",
    "next_best_action=",
];

/// Ensure the structured failure-analysis block is present in `ui_findings`.
pub fn ensure_structured_ui_findings(
    ui_findings: &mut Vec<String>,
    result: RunResult,
    where_default: &str,
) {
    for key in STRUCTURED_KEYS {
        if ui_findings.iter().any(|item| item.starts_with(key)) {
            continue;
        }
        let default = match (result, key) {
            (RunResult::Success, "what_failed=") => "none".into(),
            (RunResult::Success, "where=") => "n/a".into(),
            (RunResult::Success, "why_likely=") => "n/a".into(),
            (RunResult::Success, "attempted=") => "normal execution".into(),
            (RunResult::Success, "next_best_action=") => "none".into(),
            (_, "what_failed=") => "unknown".into(),
            (_, "where=") => {
                if where_default.is_empty() {
                    "web-run".to_string()
                } else {
                    where_default.to_string()
                }
            }
            (_, "why_likely=") => "run ended without explicit failure classification".into(),
            (_, "attempted=") => "executor run".into(),
            (_, "next_best_action=") => "inspect report/logs and retry".into(),
            _ => unreachable!("key set is fixed"),
        };
        ui_findings.push(format!("{key}{default}"));
    }
    if !ui_findings.iter().any(|item| item.starts_with("final_state=")) {
        ui_findings.push(format!("final_state={result}"));
    }
}

/// Final result classification (§4.8).
///
/// Downgrades a non-failed run to `partial` when console or network findings
/// exist, fails a verified run that produced no findings at all, and
/// backfills the structured block.
#[allow(clippy::too_many_arguments)]
pub fn finalize_result(
    result: RunResult,
    force_keep_open: bool,
    console_errors: &[String],
    network_findings: &[String],
    verified: bool,
    steps_count: usize,
    ui_findings: &mut Vec<String>,
    where_default: &str,
) -> RunResult {
    let mut out = result;
    if force_keep_open {
        ui_findings.push("teaching handoff: browser kept open for manual control".into());
    }
    if out != RunResult::Failed && (!console_errors.is_empty() || !network_findings.is_empty()) {
        out = RunResult::Partial;
    }
    if verified && steps_count > 0 && ui_findings.is_empty() {
        out = RunResult::Failed;
        ui_findings.push("what_failed=verified_mode_missing_findings".into());
        ui_findings.push("where=post-run".into());
        ui_findings.push(
            "why_likely=verified mode requires explicit visible verification findings".into(),
        );
        ui_findings.push("attempted=verified post-check".into());
        ui_findings.push("next_best_action=add verify visible result findings".into());
    }
    ensure_structured_ui_findings(ui_findings, out, where_default);
    out
}
