//! The `run` / `gui-run` / `web-run` pipeline.
//!
//! Order of operations: task-level guardrails, flag validation, runtime
//! preflight, sensitive-intent confirmation, run-context allocation, backend
//! execution, report validation (actions, evidence, gui post-conditions,
//! verified mode), then atomic report + status persistence. A run that dies
//! anywhere in the pipeline still finalises a failed report (I5).

use std::io::IsTerminal;
use std::time::Duration;

use warden_engine::{build_operator_prompt, run_operator_agent, run_web_task, WebRunOptions};
use warden_policy::{
    evidence::validate_evidence_paths, mode_allowlist, require_sensitive_confirmation,
    task_has_sensitive_intent, task_violates_code_edit_rule, validate_report_actions, RunMode,
};
use warden_report::{
    append_log, parse_executor_report, write_json_atomic, write_status, RunPaths, RunStore,
    StatusUpdate,
};
use warden_session::SessionRegistry;
use warden_types::{BridgeConfig, RunReport, WardenError};

use crate::commands::doctor::preflight_runtime;
use crate::commands::gui::{
    extract_button_targets, extract_expected_origins, synthesize_gui_window_evidence,
    validate_gui_post_conditions,
};

/// Flags resolved from the CLI for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub confirm_sensitive: bool,
    pub verified: bool,
    pub visual: bool,
    pub teaching: bool,
    pub attach: Option<String>,
    pub keep_open: bool,
    pub visual_cursor: bool,
    pub visual_click_pulse: bool,
    pub visual_scale: f64,
    pub visual_color: String,
    pub visual_human_mouse: bool,
    pub visual_mouse_speed: f64,
    pub visual_click_hold: Duration,
}

pub async fn run_command(task: &str, mode: &str, opts: RunOptions) -> anyhow::Result<()> {
    let mode: RunMode = mode
        .parse()
        .map_err(|e: String| WardenError::InvalidArgs(e))?;
    validate_flags(task, mode, &opts)?;
    preflight_runtime(mode).await?;

    let sensitive = task_has_sensitive_intent(task);
    let sensitive: Vec<String> = sensitive.into_iter().map(String::from).collect();
    require_sensitive_confirmation(
        &sensitive,
        opts.confirm_sensitive,
        std::io::stdin().is_terminal(),
        confirm_on_terminal,
    )?;

    let store = RunStore::default_location();
    let paths = store.create_run()?;
    store.prepare_run_dirs(&paths, mode != RunMode::Shell)?;
    append_log(&paths.bridge_log, &format!("run_id={}", paths.run_id))?;
    append_log(&paths.bridge_log, &format!("goal={task}"))?;
    append_log(&paths.bridge_log, &format!("mode={}", mode.as_str()))?;
    write_status(
        &store.status_path(),
        &StatusUpdate::running(&paths.run_id, &paths.run_dir, task, &paths.report_path, "run started"),
    )?;

    let outcome = match mode {
        RunMode::Web => execute_web(task, &opts, &store, &paths).await,
        _ => execute_operator(task, mode, &opts, &store, &paths).await,
    };

    match outcome {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(err) => {
            finalize_failed_run(&store, &paths, task, &err.to_string());
            Err(err.into())
        }
    }
}

fn validate_flags(task: &str, mode: RunMode, opts: &RunOptions) -> Result<(), WardenError> {
    if task_violates_code_edit_rule(task) {
        return Err(WardenError::Guardrail(
            "task requests source-code modification (forbidden by guardrails)".into(),
        ));
    }
    if mode == RunMode::Gui && !opts.confirm_sensitive {
        return Err(WardenError::Guardrail(
            "GUI mode requires explicit --confirm-sensitive".into(),
        ));
    }
    if mode != RunMode::Web {
        if opts.visual {
            return Err(WardenError::InvalidArgs(
                "--visual is only supported with --mode web / web-run".into(),
            ));
        }
        if opts.attach.is_some() || opts.keep_open {
            return Err(WardenError::InvalidArgs(
                "--attach/--keep-open are only supported in web mode".into(),
            ));
        }
        if opts.teaching {
            return Err(WardenError::InvalidArgs(
                "--teaching is only supported in web mode".into(),
            ));
        }
    }
    if opts.visual_scale <= 0.0 {
        return Err(WardenError::InvalidArgs("--visual-scale must be > 0".into()));
    }
    if opts.visual_mouse_speed <= 0.0 {
        return Err(WardenError::InvalidArgs(
            "--visual-mouse-speed must be > 0".into(),
        ));
    }
    let color_ok = opts.visual_color.len() == 7
        && opts.visual_color.starts_with('#')
        && opts.visual_color[1..].chars().all(|c| c.is_ascii_hexdigit());
    if !color_ok {
        return Err(WardenError::InvalidArgs(
            "--visual-color must be a hex color like #3BA7FF".into(),
        ));
    }
    Ok(())
}

fn confirm_on_terminal(items: &[String]) -> bool {
    eprintln!("Sensitive actions detected:");
    for item in items {
        eprintln!("- {item}");
    }
    eprintln!("Type YES to continue:");
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    answer.trim() == "YES"
}

// ---------------------------------------------------------------------------
// Web backend
// ---------------------------------------------------------------------------

async fn execute_web(
    task: &str,
    opts: &RunOptions,
    store: &RunStore,
    paths: &RunPaths,
) -> Result<RunReport, WardenError> {
    let cfg = BridgeConfig::from_env();
    let registry = SessionRegistry::new(store.sessions_dir());

    let (session, created_here) = match &opts.attach {
        Some(session_ref) => {
            let session_id = registry.resolve_session_ref(session_ref)?;
            let session = registry.load_and_refresh(&session_id).await?;
            if !registry.browser_alive(&session).await {
                return Err(WardenError::Bootstrap(format!(
                    "attached session is not alive; run web-open again. session_id={session_id}"
                )));
            }
            (session, false)
        }
        None => (registry.create_session(None).await?, true),
    };
    registry.set_current_run(&session.session_id, Some(&paths.run_id))?;
    append_log(
        &paths.bridge_log,
        &format!(
            "{}session_id={}",
            if created_here { "created_" } else { "attached_" },
            session.session_id
        ),
    )?;

    write_json_atomic(
        &paths.run_dir.join("prompt.json"),
        &serde_json::json!({
            "mode": "web",
            "task": task,
            "verified": opts.verified,
            "teaching": opts.teaching,
            "visual": opts.visual,
            "visual_cursor": opts.visual_cursor,
            "visual_click_pulse": opts.visual_click_pulse,
            "visual_scale": opts.visual_scale,
            "visual_color": opts.visual_color,
            "visual_human_mouse": opts.visual_human_mouse,
            "visual_mouse_speed": opts.visual_mouse_speed,
            "visual_click_hold_ms": opts.visual_click_hold.as_millis() as u64,
            "attach_session_id": opts.attach,
            "keep_open": opts.keep_open,
        }),
    )?;

    let web_opts = WebRunOptions {
        task: task.to_string(),
        verified: opts.verified,
        teaching: opts.teaching,
        keep_open: opts.keep_open,
        visual: opts.visual,
        visual_cursor: opts.visual_cursor,
        visual_click_pulse: opts.visual_click_pulse,
        visual_human_mouse: opts.visual_human_mouse,
        visual_mouse_speed: opts.visual_mouse_speed,
        visual_scale: opts.visual_scale,
        visual_color: opts.visual_color.clone(),
        visual_click_hold: opts.visual_click_hold,
        session_created_here: created_here,
    };

    let status_path = store.status_path();
    let progress_status_path = status_path.clone();
    let run_id = paths.run_id.clone();
    let run_dir = paths.run_dir.clone();
    let report_path = paths.report_path.clone();
    let task_owned = task.to_string();
    let report = run_web_task(
        web_opts,
        session,
        &registry,
        paths,
        &status_path,
        &cfg,
        move |current, total, detail| {
            let update =
                StatusUpdate::running(&run_id, &run_dir, &task_owned, &report_path, detail)
                    .with_steps(current, total);
            let _ = write_status(&progress_status_path, &update);
        },
    )
    .await?;

    append_log(&paths.bridge_log, "runner=web-backend")?;
    // The engine already validated and persisted; mirror the stdout log for
    // the diagnostics surfaces.
    std::fs::write(
        &paths.stdout_log,
        serde_json::to_string(&report).unwrap_or_default() + "\n",
    )?;
    std::fs::write(&paths.stderr_log, "")?;
    Ok(report)
}

// ---------------------------------------------------------------------------
// Operator-agent backend (shell / gui)
// ---------------------------------------------------------------------------

async fn execute_operator(
    task: &str,
    mode: RunMode,
    opts: &RunOptions,
    store: &RunStore,
    paths: &RunPaths,
) -> Result<RunReport, WardenError> {
    warden_engine::operator::validate_operator_config()?;
    let cfg = BridgeConfig::from_env();
    let allowlist = mode_allowlist(mode);
    let prompt = build_operator_prompt(&paths.run_id, task, &paths.run_dir, &allowlist, mode);
    write_json_atomic(
        &paths.run_dir.join("prompt.json"),
        &serde_json::json!({ "prompt": prompt }),
    )?;
    write_status(
        &store.status_path(),
        &StatusUpdate::running(
            &paths.run_id,
            &paths.run_dir,
            task,
            &paths.report_path,
            "executing operator agent",
        ),
    )?;

    let outcome = run_operator_agent(&prompt, &paths.run_dir, cfg.operator_timeout).await?;
    std::fs::write(&paths.stdout_log, &outcome.stdout)?;
    std::fs::write(&paths.stderr_log, &outcome.stderr)?;
    append_log(&paths.bridge_log, &format!("oi_returncode={}", outcome.exit_code))?;
    append_log(&paths.bridge_log, &format!("oi_timed_out={}", outcome.timed_out))?;

    let report = parse_executor_report(&outcome.stdout).map_err(|err| {
        if outcome.timed_out {
            WardenError::Timeout(format!(
                "operator agent timed out after {}s without producing a valid report JSON",
                cfg.operator_timeout.as_secs()
            ))
        } else if outcome.stdout.contains("OpenAI API key not found") {
            WardenError::InvalidArgs(
                "operator agent requires API key/model configuration; set OPENAI_API_KEY and retry"
                    .into(),
            )
        } else {
            WardenError::Report(format!(
                "operator output is not a valid report: {err}. Inspect {} and {}",
                paths.stdout_log.display(),
                paths.stderr_log.display()
            ))
        }
    })?;
    if outcome.exit_code != 0 {
        append_log(
            &paths.bridge_log,
            "warning=non-zero-returncode-but-valid-report-parsed",
        )?;
    }

    write_status(
        &store.status_path(),
        &StatusUpdate::running(
            &paths.run_id,
            &paths.run_dir,
            task,
            &paths.report_path,
            "validating report and evidence",
        ),
    )?;

    // Guardrail validation of everything the narrative executor claims.
    let expected_origins = extract_expected_origins(task);
    let audit = validate_report_actions(&report, mode, &expected_origins)?;
    require_sensitive_confirmation(
        &audit.sensitive,
        opts.confirm_sensitive,
        std::io::stdin().is_terminal(),
        confirm_on_terminal,
    )?;

    let mut report = report;
    if mode == RunMode::Gui && audit.click_steps > 0 {
        report = synthesize_gui_window_evidence(report, &paths.run_dir, audit.click_steps, &paths.run_id)?;
    }
    let base_dir = std::env::current_dir()?;
    let safe_paths =
        validate_evidence_paths(&report, &paths.run_dir, &base_dir, mode, audit.click_steps)?;
    report.evidence_paths = safe_paths;
    validate_gui_post_conditions(&report, mode, audit.click_steps, &extract_button_targets(task))?;
    validate_verified_mode(&report, mode, opts.verified, &outcome.stdout)?;

    write_json_atomic(&paths.report_path, &report)?;
    write_status(
        &store.status_path(),
        &StatusUpdate::completed(
            &paths.run_id,
            &paths.run_dir,
            task,
            &paths.report_path,
            report.result.as_str(),
        ),
    )?;
    Ok(report)
}

/// Shell/API verified mode: a run claiming actions must carry observable
/// output.
fn validate_verified_mode(
    report: &RunReport,
    mode: RunMode,
    verified: bool,
    stdout_text: &str,
) -> Result<(), WardenError> {
    if !verified || mode == RunMode::Gui {
        return Ok(());
    }
    let has_observable = !report.observations.is_empty()
        || !report.console_errors.is_empty()
        || !report.network_findings.is_empty()
        || !report.ui_findings.is_empty();
    if !report.actions.is_empty() && (stdout_text.trim().is_empty() || !has_observable) {
        return Err(WardenError::Guardrail(
            "verified mode failed: shell/api run lacks observable non-empty output".into(),
        ));
    }
    Ok(())
}

/// Leave a well-formed failed report and a completed status behind (I5).
pub fn finalize_failed_run(store: &RunStore, paths: &RunPaths, task: &str, reason: &str) {
    let report = RunReport::failed(&paths.run_id, task, reason);
    let _ = write_json_atomic(&paths.report_path, &report);
    let _ = write_status(
        &store.status_path(),
        &StatusUpdate::completed(&paths.run_id, &paths.run_dir, task, &paths.report_path, "failed"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> RunOptions {
        RunOptions {
            confirm_sensitive: false,
            verified: false,
            visual: false,
            teaching: false,
            attach: None,
            keep_open: false,
            visual_cursor: true,
            visual_click_pulse: true,
            visual_scale: 1.0,
            visual_color: "#3BA7FF".into(),
            visual_human_mouse: true,
            visual_mouse_speed: 1.0,
            visual_click_hold: Duration::from_millis(180),
        }
    }

    #[test]
    fn code_edit_tasks_blocked_upfront() {
        let err = validate_flags("modify src/main.rs", RunMode::Shell, &opts()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn gui_requires_confirm_sensitive() {
        let err = validate_flags("click the button", RunMode::Gui, &opts()).unwrap_err();
        assert!(err.to_string().contains("--confirm-sensitive"));
    }

    #[test]
    fn web_only_flags_rejected_elsewhere() {
        let mut o = opts();
        o.visual = true;
        assert_eq!(
            validate_flags("t", RunMode::Shell, &o).unwrap_err().exit_code(),
            5
        );
        let mut o = opts();
        o.attach = Some("s".into());
        assert!(validate_flags("t", RunMode::Shell, &o).is_err());
        let mut o = opts();
        o.teaching = true;
        assert!(validate_flags("t", RunMode::Gui, &o).is_err());
    }

    #[test]
    fn visual_flag_bounds() {
        let mut o = opts();
        o.visual_scale = 0.0;
        assert!(validate_flags("t", RunMode::Web, &o).is_err());
        let mut o = opts();
        o.visual_color = "blue".into();
        assert!(validate_flags("t", RunMode::Web, &o).is_err());
        let mut o = opts();
        o.visual_mouse_speed = -1.0;
        assert!(validate_flags("t", RunMode::Web, &o).is_err());
        assert!(validate_flags("t", RunMode::Web, &opts()).is_ok());
    }

    #[test]
    fn verified_mode_needs_observables() {
        let mut report = RunReport::failed("t", "g", "x");
        report.actions = vec!["cmd: ls".into()];
        report.console_errors.clear();
        let err = validate_verified_mode(&report, RunMode::Shell, true, "  ").unwrap_err();
        assert!(err.to_string().contains("verified mode failed"));

        report.observations = vec!["saw output".into()];
        assert!(validate_verified_mode(&report, RunMode::Shell, true, "output").is_ok());
        // GUI mode is validated by its own post-conditions instead.
        assert!(validate_verified_mode(&report, RunMode::Gui, true, "").is_ok());
    }

    #[test]
    fn failed_run_finalisation_leaves_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        let paths = store.create_run().unwrap();
        finalize_failed_run(&store, &paths, "task", "boom");

        let report: RunReport =
            serde_json::from_str(&std::fs::read_to_string(&paths.report_path).unwrap()).unwrap();
        assert_eq!(report.result.as_str(), "failed");
        assert_eq!(report.console_errors, vec!["boom"]);

        let status = warden_report::read_status(&store.status_path()).unwrap().unwrap();
        assert_eq!(status.state, "completed");
        assert_eq!(status.result, "failed");
    }
}
