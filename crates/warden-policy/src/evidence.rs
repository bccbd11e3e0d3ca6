//! Evidence path containment and per-step evidence requirements.
//!
//! Every path a report references must resolve, after following symlinks,
//! inside the run directory (I1). Click steps in gui/web mode additionally
//! require non-empty before/after screenshots (I3/P4).

use std::path::{Path, PathBuf};

use warden_types::{RunReport, WardenError};

use crate::rules::RunMode;

/// Validate and canonicalise `report.evidence_paths`.
///
/// Returns the accepted paths rewritten relative to `base_dir` (the process
/// working directory for relative inputs). Any path escaping `run_dir`, or a
/// missing/non-file entry, is a hard guardrail error.
pub fn validate_evidence_paths(
    report: &RunReport,
    run_dir: &Path,
    base_dir: &Path,
    mode: RunMode,
    click_steps: usize,
) -> Result<Vec<String>, WardenError> {
    let run_root = canonicalize_lenient(run_dir);
    let mut safe_paths: Vec<String> = Vec::new();
    let mut run_rel: Vec<String> = Vec::new();

    for raw in &report.evidence_paths {
        let candidate = Path::new(raw);
        let resolved = if candidate.is_absolute() {
            canonicalize_lenient(candidate)
        } else {
            canonicalize_lenient(&base_dir.join(candidate))
        };

        if !resolved.starts_with(&run_root) {
            return Err(WardenError::Guardrail(format!(
                "evidence path outside run directory: {raw}"
            )));
        }
        if !resolved.is_file() {
            return Err(WardenError::Guardrail(format!(
                "evidence path missing or not a file: {raw}"
            )));
        }
        let display = resolved
            .strip_prefix(base_dir)
            .unwrap_or(&resolved)
            .to_string_lossy()
            .into_owned();
        safe_paths.push(display);
        if let Ok(rel) = resolved.strip_prefix(&run_root) {
            run_rel.push(rel.to_string_lossy().into_owned());
        }
    }

    if matches!(mode, RunMode::Gui | RunMode::Web) && click_steps > 0 {
        require_click_evidence(&run_rel, run_dir, mode, click_steps)?;
    }
    Ok(safe_paths)
}

/// Per-click-step screenshots (and window dumps for GUI) must exist and be
/// non-empty on disk, not just listed in the report.
fn require_click_evidence(
    run_rel: &[String],
    run_dir: &Path,
    mode: RunMode,
    click_steps: usize,
) -> Result<(), WardenError> {
    for step in 1..=click_steps {
        let mut required = vec![
            format!("evidence/step_{step}_before.png"),
            format!("evidence/step_{step}_after.png"),
        ];
        if mode == RunMode::Gui {
            required.push(format!("evidence/step_{step}_window.txt"));
        }
        for rel in required {
            if !run_rel.iter().any(|r| r == &rel) {
                return Err(WardenError::Guardrail(format!(
                    "missing required evidence for click step {step}: {rel}"
                )));
            }
            let full = run_dir.join(&rel);
            let missing = !full.is_file();
            let empty_shot = rel.ends_with(".png")
                && full.metadata().map(|m| m.len() == 0).unwrap_or(true);
            if missing || empty_shot {
                return Err(WardenError::Evidence(format!(
                    "screenshot evidence missing or empty for step {step}: {rel}"
                )));
            }
        }
    }
    Ok(())
}

/// Canonicalise as far as the existing prefix allows. Evidence files always
/// exist when accepted, but the target of a traversal attack may not; the
/// containment check still has to resolve `..` and symlinks in that case.
fn canonicalize_lenient(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut out = existing.canonicalize().unwrap_or(existing);
    for part in tail.iter().rev() {
        out.push(part);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_types::RunResult;

    fn report_with_paths(paths: Vec<String>) -> RunReport {
        RunReport {
            task_id: "t".into(),
            goal: "g".into(),
            actions: vec![],
            observations: vec![],
            console_errors: vec![],
            network_findings: vec![],
            ui_findings: vec![],
            result: RunResult::Success,
            evidence_paths: paths,
        }
    }

    #[test]
    fn traversal_outside_run_dir_rejected() {
        let base = tempfile::tempdir().unwrap();
        let run_dir = base.path().join("runs/20250101-000000");
        std::fs::create_dir_all(&run_dir).unwrap();

        let report = report_with_paths(vec!["../../etc/passwd".into()]);
        let err = validate_evidence_paths(&report, &run_dir, base.path(), RunMode::Shell, 0)
            .unwrap_err();
        assert!(err.to_string().contains("outside run directory"));
    }

    #[test]
    fn absolute_path_outside_rejected() {
        let base = tempfile::tempdir().unwrap();
        let run_dir = base.path().join("run");
        std::fs::create_dir_all(&run_dir).unwrap();
        let report = report_with_paths(vec!["/etc/hostname".into()]);
        assert!(
            validate_evidence_paths(&report, &run_dir, base.path(), RunMode::Shell, 0).is_err()
        );
    }

    #[test]
    fn contained_existing_file_accepted() {
        let base = tempfile::tempdir().unwrap();
        let run_dir = base.path().join("run");
        let evidence = run_dir.join("evidence");
        std::fs::create_dir_all(&evidence).unwrap();
        std::fs::write(evidence.join("step_1_before.png"), b"png").unwrap();

        let report = report_with_paths(vec!["run/evidence/step_1_before.png".into()]);
        let out =
            validate_evidence_paths(&report, &run_dir, base.path(), RunMode::Shell, 0).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].ends_with("step_1_before.png"));
    }

    #[test]
    fn missing_file_inside_run_dir_rejected() {
        let base = tempfile::tempdir().unwrap();
        let run_dir = base.path().join("run");
        std::fs::create_dir_all(&run_dir).unwrap();
        let report = report_with_paths(vec!["run/evidence/none.png".into()]);
        let err = validate_evidence_paths(&report, &run_dir, base.path(), RunMode::Shell, 0)
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn web_click_steps_require_before_and_after() {
        let base = tempfile::tempdir().unwrap();
        let run_dir = base.path().join("run");
        let evidence = run_dir.join("evidence");
        std::fs::create_dir_all(&evidence).unwrap();
        std::fs::write(evidence.join("step_1_before.png"), b"png").unwrap();

        let report = report_with_paths(vec!["run/evidence/step_1_before.png".into()]);
        let err = validate_evidence_paths(&report, &run_dir, base.path(), RunMode::Web, 1)
            .unwrap_err();
        assert!(err.to_string().contains("step_1_after.png"));

        std::fs::write(evidence.join("step_1_after.png"), b"png").unwrap();
        let report = report_with_paths(vec![
            "run/evidence/step_1_before.png".into(),
            "run/evidence/step_1_after.png".into(),
        ]);
        assert!(
            validate_evidence_paths(&report, &run_dir, base.path(), RunMode::Web, 1).is_ok()
        );
    }

    #[test]
    fn empty_screenshot_rejected() {
        let base = tempfile::tempdir().unwrap();
        let run_dir = base.path().join("run");
        let evidence = run_dir.join("evidence");
        std::fs::create_dir_all(&evidence).unwrap();
        std::fs::write(evidence.join("step_1_before.png"), b"").unwrap();
        std::fs::write(evidence.join("step_1_after.png"), b"png").unwrap();

        let report = report_with_paths(vec![
            "run/evidence/step_1_before.png".into(),
            "run/evidence/step_1_after.png".into(),
        ]);
        let err = validate_evidence_paths(&report, &run_dir, base.path(), RunMode::Web, 1)
            .unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
