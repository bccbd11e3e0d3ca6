//! Narrative operator-agent subprocess (shell and gui modes).
//!
//! The operator agent is an opaque executor: we hand it a deterministic
//! observation prompt on stdin, capture whatever it prints, and let the
//! report normaliser fish the JSON out. Nothing it says is trusted for
//! `actions[]` or `evidence_paths[]` beyond guardrail validation.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use warden_policy::RunMode;
use warden_types::WardenError;

/// Captured subprocess result.
#[derive(Debug, Clone)]
pub struct OperatorOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Build the observation prompt for the operator agent.
///
/// The prompt pins the allowlist, the evidence directory, and the strict
/// JSON contract; mode-specific blocks add the GUI evidence discipline.
pub fn build_operator_prompt(
    task_id: &str,
    task: &str,
    run_dir: &Path,
    allowlist: &[&str],
    mode: RunMode,
) -> String {
    let allowed = allowlist.join(", ");
    let mode_block = match mode {
        RunMode::Gui => format!(
            "In gui mode: no asumir, verificar. Un paso, una evidencia. \
             The evidence directory already exists: {evidence}. \
             Before any click, identify explicit target window/title. \
             After each click, run a verify step describing what changed. \
             For every click step N, save before/after screenshots in \
             {evidence} as step_N_before.png and step_N_after.png. \
             The bridge auto-finalizes step_N_window.txt if missing. \
             If button/target is not found, report blocked state and safe alternatives.",
            evidence = run_dir.join("evidence").display(),
        ),
        _ => "In shell mode, focus on command output and direct observations. \
              Do not simulate GUI interactions."
            .to_string(),
    };

    format!(
        "You are an operator agent used only as a screen/operation observer.\n\
         Never edit source code or architecture. Never execute destructive commands.\n\
         Allowed shell command prefixes only: {allowed}\n\
         Use shell commands only; do not use interactive setup flows.\n\
         Every shell action must be represented in actions[] as: \"cmd: <exact command>\".\n\
         If the goal includes explicit URLs, hosts, or ports, use them exactly and do not rewrite them.\n\
         Execution mode: {mode}\n\
         {mode_block}\n\
         If a requested step needs an action outside guardrails, do not execute it and report it.\n\
         Save evidence (logs/screenshots/reports) only inside: {run_dir}\n\
         Always return a single strict JSON object with keys exactly:\n\
         task_id, goal, actions, observations, console_errors, network_findings,\n\
         ui_findings, result, evidence_paths\n\
         No markdown, no explanations outside JSON.\n\
         \n\
         task_id: {task_id}\n\
         goal: {task}",
        mode = mode.as_str(),
        run_dir = run_dir.display(),
    )
}

/// Spawn the operator agent and feed it the prompt on stdin.
///
/// The command comes from `OI_BRIDGE_COMMAND` (default `interpreter`);
/// `OI_BRIDGE_ARGS` adds extra arguments with `--yes` normalised to `-y`
/// and `--stdin --plain` forced for non-interactive use. The subprocess
/// gets the per-run `.oi_home` as `HOME` so caches never leak outside the
/// run directory. A timeout kills the process and reports exit code 124.
pub async fn run_operator_agent(
    prompt: &str,
    run_dir: &Path,
    timeout: Duration,
) -> Result<OperatorOutcome, WardenError> {
    let command = std::env::var("OI_BRIDGE_COMMAND")
        .unwrap_or_else(|_| "interpreter".into())
        .trim()
        .to_string();
    let extra = std::env::var("OI_BRIDGE_ARGS").unwrap_or_default();
    let args = normalize_args(shlex::split(&extra).unwrap_or_default());

    let mut child = tokio::process::Command::new(&command)
        .args(&args)
        .env("HOME", run_dir.join(".oi_home"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| WardenError::Bootstrap(format!("operator agent spawn failed ({command}): {e}")))?;

    // Stdin mode consumes a single line; collapse the prompt.
    let collapsed: String = prompt
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        + "\n";
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(collapsed.as_bytes()).await?;
        drop(stdin);
    }

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(OperatorOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
            timed_out: false,
        }),
        Ok(Err(err)) => Err(WardenError::Io(err)),
        Err(_) => Ok(OperatorOutcome {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 124,
            timed_out: true,
        }),
    }
}

/// `--yes` → `-y`, and force `--stdin --plain` for non-interactive runs.
fn normalize_args(args: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = args
        .into_iter()
        .map(|token| if token == "--yes" { "-y".to_string() } else { token })
        .collect();
    if !out.iter().any(|t| t == "--stdin" || t == "-s") {
        out.push("--stdin".into());
    }
    if !out.iter().any(|t| t == "--plain" || t == "-pl") {
        out.push("--plain".into());
    }
    out
}

/// Reject configurations the non-interactive bridge cannot drive.
pub fn validate_operator_config() -> Result<(), WardenError> {
    let args = shlex::split(&std::env::var("OI_BRIDGE_ARGS").unwrap_or_default())
        .unwrap_or_default();
    if args.iter().any(|t| t == "--local" || t == "--offline") {
        return Err(WardenError::InvalidArgs(
            "local/offline operator mode is interactive and not supported; \
             use OPENAI_API_KEY with cloud mode"
                .into(),
        ));
    }
    if std::env::var("OPENAI_API_KEY").unwrap_or_default().is_empty() {
        return Err(WardenError::InvalidArgs(
            "missing OPENAI_API_KEY; export it and rerun".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn prompt_pins_contract_and_run_dir() {
        let prompt = build_operator_prompt(
            "20250101-000000",
            "observe the dashboard",
            &PathBuf::from("runs/20250101-000000"),
            &["ls", "cat"],
            RunMode::Shell,
        );
        assert!(prompt.contains("Allowed shell command prefixes only: ls, cat"));
        assert!(prompt.contains("task_id: 20250101-000000"));
        assert!(prompt.contains("runs/20250101-000000"));
        assert!(prompt.contains("Execution mode: shell"));
        assert!(prompt.contains("cmd: <exact command>"));
    }

    #[test]
    fn gui_prompt_requires_evidence_discipline() {
        let prompt = build_operator_prompt(
            "t",
            "click the button",
            &PathBuf::from("runs/t"),
            &["xdotool"],
            RunMode::Gui,
        );
        assert!(prompt.contains("step_N_before.png"));
        assert!(prompt.contains("target window"));
    }

    #[test]
    fn args_normalised_for_stdin_mode() {
        let out = normalize_args(vec!["--yes".into(), "--model".into(), "gpt-4o".into()]);
        assert_eq!(out[0], "-y");
        assert!(out.contains(&"--stdin".to_string()));
        assert!(out.contains(&"--plain".to_string()));

        // Already non-interactive: nothing duplicated.
        let out = normalize_args(vec!["-s".into(), "-pl".into()]);
        assert_eq!(out.iter().filter(|t| *t == "--stdin").count(), 0);
        assert_eq!(out.iter().filter(|t| *t == "--plain").count(), 0);
    }

    #[tokio::test]
    async fn timeout_reports_code_124() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".oi_home")).unwrap();
        // A shell that sleeps past the 50ms budget; the forced --stdin and
        // --plain land as ignored positional args after the -c script.
        std::env::set_var("OI_BRIDGE_COMMAND", "sh");
        std::env::set_var("OI_BRIDGE_ARGS", "-c 'sleep 5'");
        let outcome = run_operator_agent("prompt", dir.path(), Duration::from_millis(50))
            .await
            .unwrap();
        std::env::remove_var("OI_BRIDGE_COMMAND");
        std::env::remove_var("OI_BRIDGE_ARGS");
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, 124);
    }
}
