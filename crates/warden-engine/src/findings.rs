//! Structured finding appenders shared by the step loop and the handoff
//! path. Keeping the exact strings in one place keeps the report contract
//! stable across the places that emit them.

use warden_types::WebStep;

/// `step <i>/<n> <kind>:<target>` — the watchdog's step signature.
pub fn step_signature(index: usize, total: usize, step: &WebStep) -> String {
    format!("step {index}/{total} {step}")
}

pub fn append_run_crash_findings(ui_findings: &mut Vec<String>) {
    ui_findings.push("what_failed=run_crash".into());
    ui_findings.push("where=web-run".into());
    ui_findings.push("why_likely=page_or_context_closed".into());
    ui_findings.push("attempted=executor run".into());
    ui_findings.push("next_best_action=reopen session and retry".into());
}

pub fn append_iframe_focus_findings(
    ui_findings: &mut Vec<String>,
    where_: &str,
    attempted: &str,
    why_likely: &str,
) {
    ui_findings.push("Me he quedado dentro de YouTube iframe. Te cedo el control.".into());
    ui_findings.push("what_failed=stuck_iframe_focus".into());
    ui_findings.push(format!("where={where_}"));
    ui_findings.push(format!("why_likely={why_likely}"));
    ui_findings.push(format!("attempted={attempted}"));
    ui_findings.push("next_best_action=human_assist".into());
}

pub fn append_interactive_timeout_findings(
    ui_findings: &mut Vec<String>,
    step_num: usize,
    step: &WebStep,
    timeout_ms: u128,
) {
    ui_findings.push(format!(
        "step {step_num} timeout on {step} (timeout_ms={timeout_ms})"
    ));
    ui_findings.push("what_failed=interactive_timeout".into());
    ui_findings.push(format!("where=step {step_num}:{step}"));
    ui_findings.push(
        "why_likely=target unavailable/occluded or app did not become interactive in time".into(),
    );
    ui_findings.push("attempted=interactive timeout path".into());
    ui_findings.push("next_best_action=inspect target visibility or use teaching handoff".into());
}

pub fn append_wait_timeout_findings(
    ui_findings: &mut Vec<String>,
    step_num: usize,
    step: &WebStep,
    timeout_ms: u128,
) {
    ui_findings.push(format!(
        "step {step_num} timeout waiting for {step} (timeout_ms={timeout_ms})"
    ));
    ui_findings.push("what_failed=wait_timeout".into());
    ui_findings.push(format!("where=step {step_num}:{step}"));
    ui_findings
        .push("why_likely=expected selector/text did not appear within timeout window".into());
    ui_findings.push("attempted=wait timeout path".into());
    ui_findings.push("next_best_action=verify app state or retry with stable selector".into());
}

pub fn append_target_not_found_findings(
    ui_findings: &mut Vec<String>,
    step_num: usize,
    step: &WebStep,
) {
    ui_findings.push(format!(
        "No encuentro el botón: {}. Te cedo el control.",
        step.target
    ));
    ui_findings.push("what_failed=target_not_found".into());
    ui_findings.push(format!("where=step {step_num}:{step}"));
    ui_findings
        .push("why_likely=target text/selector changed, hidden, or not yet rendered".into());
    ui_findings
        .push("attempted=stable selector candidates + container/page scroll retries".into());
    ui_findings.push("next_best_action=human_assist".into());
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_types::StepKind;

    #[test]
    fn signature_format() {
        let step = WebStep::new(StepKind::ClickText, "Entrar demo");
        assert_eq!(
            step_signature(2, 5, &step),
            "step 2/5 click_text:Entrar demo"
        );
    }

    #[test]
    fn timeout_findings_carry_structured_keys() {
        let mut findings = Vec::new();
        let step = WebStep::new(StepKind::ClickSelector, "#never");
        append_interactive_timeout_findings(&mut findings, 1, &step, 8000);
        assert!(findings.iter().any(|f| f == "what_failed=interactive_timeout"));
        assert!(findings
            .iter()
            .any(|f| f == "where=step 1:click_selector:#never"));
        assert!(findings.iter().any(|f| f.contains("timeout_ms=8000")));
    }

    #[test]
    fn target_not_found_uses_handoff_voice() {
        let mut findings = Vec::new();
        let step = WebStep::new(StepKind::ClickText, "Stop");
        append_target_not_found_findings(&mut findings, 3, &step);
        assert!(findings[0].contains("No encuentro el botón: Stop"));
        assert!(findings.iter().any(|f| f == "next_best_action=human_assist"));
    }
}
