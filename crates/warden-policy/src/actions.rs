//! Report-level action auditing.
//!
//! Walks `actions[]` in plan order and enforces the action-shape contract
//! (`cmd: <single line>`), the per-mode allowlist, the GUI window-target and
//! coordinate-click rules, and URL target drift for network commands.

use warden_types::{RunReport, WardenError};

use crate::command::evaluate_command;
use crate::rules::{mode_allowlist, RunMode, GUI_STATE_CHANGING_TOKENS};

/// Summary of an accepted action list.
#[derive(Debug, Default, Clone)]
pub struct ActionAudit {
    /// Number of click-like steps (drives evidence requirements).
    pub click_steps: usize,
    /// Commands that need sensitive confirmation, deduplicated and sorted.
    pub sensitive: Vec<String>,
}

/// Validate every entry of `report.actions` for the given mode.
///
/// `expected_origins` are the `scheme://host[:port]` origins extracted from
/// the task; `curl`/`wget` commands must stay inside them.
pub fn validate_report_actions(
    report: &RunReport,
    mode: RunMode,
    expected_origins: &[String],
) -> Result<ActionAudit, WardenError> {
    let allowlist = mode_allowlist(mode);
    let mut audit = ActionAudit::default();
    let mut sensitive: Vec<String> = Vec::new();
    let mut window_target_seen = false;
    let mut mousemove_since_target = false;

    for action in &report.actions {
        let command = action
            .strip_prefix("cmd:")
            .map(str::trim)
            .ok_or_else(|| {
                WardenError::Guardrail(
                    "every action must follow format 'cmd: <command>'".into(),
                )
            })?;
        if command.is_empty() {
            return Err(WardenError::Guardrail("empty command after 'cmd:'".into()));
        }
        if command.contains('\n') || command.contains('\r') {
            return Err(WardenError::Guardrail(
                "multiline commands are not allowed".into(),
            ));
        }

        let decision = evaluate_command(command, &allowlist);
        if !decision.allowed {
            return Err(WardenError::Guardrail(format!(
                "action '{command}': {}",
                decision.reason
            )));
        }
        validate_command_shape(command)?;
        validate_command_targets(command, expected_origins)?;

        match mode {
            RunMode::Gui => {
                let low = command.to_lowercase();
                if is_window_target_command(&low) {
                    window_target_seen = true;
                    mousemove_since_target = false;
                }
                if low.contains("xdotool mousemove") {
                    mousemove_since_target = true;
                }
                if low.contains("mousemove") && low.contains("click") {
                    return Err(WardenError::Guardrail(
                        "coordinate-based click without safe fallback".into(),
                    ));
                }
                if low.contains("xdotool click") {
                    audit.click_steps += 1;
                    if mousemove_since_target {
                        return Err(WardenError::Guardrail(
                            "coordinate-based sequence detected (mousemove + click)".into(),
                        ));
                    }
                    if !window_target_seen {
                        return Err(WardenError::Guardrail(
                            "click without explicit target window step".into(),
                        ));
                    }
                    sensitive.push(command.to_string());
                    mousemove_since_target = false;
                }
                if GUI_STATE_CHANGING_TOKENS.iter().any(|t| low.contains(t)) {
                    sensitive.push(command.to_string());
                }
            }
            RunMode::Web => {
                if is_web_click_command(command) {
                    audit.click_steps += 1;
                }
            }
            RunMode::Shell => {}
        }

        if decision.sensitive {
            sensitive.push(command.to_string());
        }
    }

    sensitive.sort();
    sensitive.dedup();
    audit.sensitive = sensitive;
    Ok(audit)
}

/// Reject commands whose first token is an option or that fail to parse.
fn validate_command_shape(command: &str) -> Result<(), WardenError> {
    let parts = shlex::split(command)
        .ok_or_else(|| WardenError::Guardrail("shell parsing failed".into()))?;
    match parts.first() {
        None => Err(WardenError::Guardrail("empty command payload".into())),
        Some(first) if first.starts_with('-') => Err(WardenError::Guardrail(
            "missing executable prefix".into(),
        )),
        Some(_) => Ok(()),
    }
}

/// `curl`/`wget` must carry explicit URLs whose origins match the task.
fn validate_command_targets(command: &str, expected: &[String]) -> Result<(), WardenError> {
    if expected.is_empty() {
        return Ok(());
    }
    let Some(parts) = shlex::split(command) else {
        return Ok(());
    };
    match parts.first().map(String::as_str) {
        Some("curl") | Some("wget") => {}
        _ => return Ok(()),
    }

    let urls: Vec<&str> = command
        .split_whitespace()
        .filter(|token| token.starts_with("http://") || token.starts_with("https://"))
        .collect();
    if urls.is_empty() {
        return Err(WardenError::Guardrail(
            "network action without explicit URL while task requires specific target(s)".into(),
        ));
    }
    for raw in urls {
        let origin = url_origin(raw).ok_or_else(|| {
            WardenError::Guardrail(format!("malformed URL in action: {raw}"))
        })?;
        if !expected.iter().any(|o| o == &origin) {
            return Err(WardenError::Guardrail(format!(
                "URL target drift. Observed: {origin}. Expected one of: {}",
                expected.join(", ")
            )));
        }
    }
    Ok(())
}

/// `scheme://host[:port]` for http(s) URLs, `None` otherwise.
pub fn url_origin(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    })
}

fn is_window_target_command(low: &str) -> bool {
    [
        "xdotool search --name",
        "xdotool search --class",
        "xdotool search --classname",
        "xdotool windowactivate",
        "xdotool windowfocus",
        "xwininfo -name",
        "xwininfo -id",
    ]
    .iter()
    .any(|token| low.contains(token))
}

fn is_web_click_command(command: &str) -> bool {
    let Some(parts) = shlex::split(command) else {
        return false;
    };
    parts.len() >= 2
        && parts[0].eq_ignore_ascii_case("playwright")
        && matches!(parts[1].to_lowercase().as_str(), "click" | "select" | "fill")
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_types::RunResult;

    fn report_with(actions: Vec<&str>) -> RunReport {
        RunReport {
            task_id: "t".into(),
            goal: "g".into(),
            actions: actions.into_iter().map(String::from).collect(),
            observations: vec![],
            console_errors: vec![],
            network_findings: vec![],
            ui_findings: vec![],
            result: RunResult::Success,
            evidence_paths: vec![],
        }
    }

    #[test]
    fn action_shape_enforced() {
        let report = report_with(vec!["ls -la"]);
        let err = validate_report_actions(&report, RunMode::Shell, &[]).unwrap_err();
        assert!(err.to_string().contains("cmd:"));

        let report = report_with(vec!["cmd: "]);
        assert!(validate_report_actions(&report, RunMode::Shell, &[]).is_err());

        let report = report_with(vec!["cmd: ls -la\nrm -rf /"]);
        assert!(validate_report_actions(&report, RunMode::Shell, &[]).is_err());
    }

    #[test]
    fn web_click_counting() {
        let report = report_with(vec![
            "cmd: playwright goto http://localhost:5173",
            "cmd: playwright click text:Entrar demo",
            "cmd: playwright wait selector:.track-card",
            "cmd: playwright select selector:#speed label:Fast",
        ]);
        let audit = validate_report_actions(&report, RunMode::Web, &[]).unwrap();
        assert_eq!(audit.click_steps, 2);
    }

    #[test]
    fn gui_click_requires_window_target() {
        let report = report_with(vec!["cmd: xdotool click 1"]);
        let err = validate_report_actions(&report, RunMode::Gui, &[]).unwrap_err();
        assert!(err.to_string().contains("target window"));

        let report = report_with(vec![
            "cmd: xdotool search --name Calculator windowactivate",
            "cmd: xdotool click 1",
        ]);
        let audit = validate_report_actions(&report, RunMode::Gui, &[]).unwrap();
        assert_eq!(audit.click_steps, 1);
        assert!(!audit.sensitive.is_empty());
    }

    #[test]
    fn gui_coordinate_click_blocked() {
        let report = report_with(vec![
            "cmd: xdotool search --name App windowactivate",
            "cmd: xdotool mousemove 100 200 click 1",
        ]);
        let err = validate_report_actions(&report, RunMode::Gui, &[]).unwrap_err();
        assert!(err.to_string().contains("coordinate"));

        // Split across two actions is still a coordinate sequence.
        let report = report_with(vec![
            "cmd: xdotool search --name App windowactivate",
            "cmd: xdotool mousemove 100 200",
            "cmd: xdotool click 1",
        ]);
        assert!(validate_report_actions(&report, RunMode::Gui, &[]).is_err());
    }

    #[test]
    fn url_target_drift_blocked() {
        let expected = vec!["http://localhost:5173".to_string()];
        let report = report_with(vec!["cmd: curl http://localhost:5173/health"]);
        assert!(validate_report_actions(&report, RunMode::Shell, &expected).is_ok());

        let report = report_with(vec!["cmd: curl http://evil.example.com/"]);
        let err = validate_report_actions(&report, RunMode::Shell, &expected).unwrap_err();
        assert!(err.to_string().contains("drift"));

        let report = report_with(vec!["cmd: curl -s -o /dev/null example.com"]);
        assert!(validate_report_actions(&report, RunMode::Shell, &expected).is_err());
    }

    #[test]
    fn origin_extraction() {
        assert_eq!(
            url_origin("http://localhost:5173/path?q=1").as_deref(),
            Some("http://localhost:5173")
        );
        assert_eq!(
            url_origin("https://example.com/a").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(url_origin("ftp://example.com"), None);
        assert_eq!(url_origin("not a url"), None);
    }
}
