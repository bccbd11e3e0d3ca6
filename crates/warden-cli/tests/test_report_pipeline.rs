//! End-to-end report pipeline: normaliser -> action guardrails -> evidence
//! containment, on a real temp run directory. Exercises the same path the
//! shell/gui runner takes after the operator agent returns.

use warden_policy::{validate_evidence_paths, validate_report_actions, RunMode};
use warden_report::parse_executor_report;
use warden_types::RunResult;

fn noisy_stdout(evidence: &str) -> String {
    format!(
        r#"Let me look around first.
Some chatter that is not JSON.
{{"task_id": "20250101-000000", "goal": "observe the app",
  "actions": ["cmd: ls -la", "cmd: cat runs/status.json"],
  "observations": ["listed run directory"],
  "console_errors": [], "network_findings": [],
  "ui_findings": ["status file present"],
  "result": "success",
  "evidence_paths": ["{evidence}"],
  "debug_notes": "should be dropped"}}
Goodbye."#
    )
}

#[test]
fn normalised_report_passes_guardrails_with_contained_evidence() {
    let base = tempfile::tempdir().unwrap();
    let run_dir = base.path().join("runs/20250101-000000");
    std::fs::create_dir_all(run_dir.join("evidence")).unwrap();
    std::fs::write(run_dir.join("evidence/listing.txt"), "ls output").unwrap();

    let stdout = noisy_stdout("runs/20250101-000000/evidence/listing.txt");
    let report = parse_executor_report(&stdout).expect("normaliser should find the report");
    assert_eq!(report.result, RunResult::Success);
    // Unknown field dropped by projection.
    let as_value = serde_json::to_value(&report).unwrap();
    assert!(as_value.get("debug_notes").is_none());

    let audit = validate_report_actions(&report, RunMode::Shell, &[]).expect("actions allowed");
    assert_eq!(audit.click_steps, 0);

    let safe = validate_evidence_paths(&report, &run_dir, base.path(), RunMode::Shell, 0)
        .expect("contained evidence accepted");
    assert_eq!(safe.len(), 1);
    assert!(safe[0].ends_with("listing.txt"));
}

#[test]
fn traversal_evidence_is_rejected_after_normalisation() {
    let base = tempfile::tempdir().unwrap();
    let run_dir = base.path().join("runs/20250101-000000");
    std::fs::create_dir_all(&run_dir).unwrap();

    let stdout = noisy_stdout("../../etc/passwd");
    let report = parse_executor_report(&stdout).unwrap();
    let err = validate_evidence_paths(&report, &run_dir, base.path(), RunMode::Shell, 0)
        .expect_err("traversal must be rejected");
    assert_eq!(err.exit_code(), 2);
    assert!(err.to_string().contains("outside run directory"));
}

#[test]
fn destructive_actions_are_rejected_even_with_valid_schema() {
    let stdout = r#"{"task_id": "t", "goal": "g",
        "actions": ["cmd: rm -rf /tmp/x"],
        "observations": [], "console_errors": [], "network_findings": [],
        "ui_findings": [], "result": "success", "evidence_paths": []}"#;
    let report = parse_executor_report(stdout).unwrap();
    let err = validate_report_actions(&report, RunMode::Shell, &[]).unwrap_err();
    assert!(err.to_string().contains("rm"));
}

#[test]
fn normalisation_is_idempotent_across_the_pipeline() {
    let base = tempfile::tempdir().unwrap();
    let run_dir = base.path().join("runs/r");
    std::fs::create_dir_all(run_dir.join("evidence")).unwrap();
    std::fs::write(run_dir.join("evidence/listing.txt"), "x").unwrap();

    let stdout = noisy_stdout("runs/r/evidence/listing.txt");
    let once = parse_executor_report(&stdout).unwrap();
    let twice = parse_executor_report(&serde_json::to_string(&once).unwrap()).unwrap();
    assert_eq!(once, twice);
}
