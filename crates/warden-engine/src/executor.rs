//! The web execution engine.
//!
//! Drives one frozen plan through an attached browser session, producing
//! evidence and findings for every step, classifying outcomes, watching for
//! stuck conditions, and — in teaching mode — handing control to the user
//! with a learning window when it cannot make progress. Finalisation always
//! runs: whatever happens mid-loop, the run leaves a well-formed
//! `report.json` and an updated `status.json` behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use warden_browser::{frame, overlay, BrowserError, PageDriver};
use warden_learning::{
    teaching::is_relevant_manual_click, write_teaching_artifacts, LearningContext, LearningStore,
    TeachingCapture,
};
use warden_report::{finalize_result, write_json_atomic, RunPaths, StatusUpdate};
use warden_session::{SessionRecord, SessionRegistry};
use warden_types::{
    derive_control_color, BridgeConfig, ControlColor, ControlFlags, RunReport, RunResult,
    StepKind, StepOutcome, StepStatus, WebStep,
};

use crate::deadline::Deadline;
use crate::findings::{
    append_interactive_timeout_findings, append_run_crash_findings,
    append_target_not_found_findings, append_wait_timeout_findings, step_signature,
};
use crate::steps::{
    extract_task_url, is_generic_play_label, is_login_target, parse_plan,
    plan_requests_login_click, semantic_hints_for_selector, stable_selectors_for_target,
};
use crate::watchdog::{useful_event_count, StuckReason, WatchdogConfig, WatchdogState};

/// Pause after a successful interaction before the after-shot, letting the
/// app settle.
const POST_ACTION_PAUSE: Duration = Duration::from_millis(1000);
/// Retry budget for interactive steps in teaching mode.
const MAX_RETRIES: u32 = 2;

/// Options resolved by the CLI for one web run.
#[derive(Debug, Clone)]
pub struct WebRunOptions {
    pub task: String,
    pub verified: bool,
    pub teaching: bool,
    pub keep_open: bool,
    pub visual: bool,
    pub visual_cursor: bool,
    pub visual_click_pulse: bool,
    pub visual_human_mouse: bool,
    pub visual_mouse_speed: f64,
    pub visual_scale: f64,
    pub visual_color: String,
    pub visual_click_hold: Duration,
    /// The session was created for this run (close it unless keep-open or a
    /// handoff forces it to stay).
    pub session_created_here: bool,
}

impl Default for WebRunOptions {
    fn default() -> Self {
        Self {
            task: String::new(),
            verified: false,
            teaching: false,
            keep_open: false,
            visual: false,
            visual_cursor: true,
            visual_click_pulse: true,
            visual_human_mouse: true,
            visual_mouse_speed: 1.0,
            visual_scale: 1.0,
            visual_color: "#3BA7FF".into(),
            visual_click_hold: Duration::from_millis(180),
            session_created_here: false,
        }
    }
}

/// Execute a web task against an attached session.
///
/// Returns the finalised report; `report.json` and `status.json` are
/// already persisted when this returns. Errors are only possible before
/// bootstrap completes (unreachable target, unparseable task, dead
/// session); they map to exit codes 2-5 at the CLI.
pub async fn run_web_task(
    opts: WebRunOptions,
    session: SessionRecord,
    registry: &SessionRegistry,
    paths: &RunPaths,
    status_path: &Path,
    cfg: &BridgeConfig,
    progress: impl Fn(usize, usize, &str),
) -> Result<RunReport, warden_types::WardenError> {
    let url = extract_task_url(&opts.task)
        .map_err(|e| warden_types::WardenError::Parse(e.to_string()))?
        .ok_or_else(|| {
            warden_types::WardenError::Parse("web mode requires an explicit URL in task".into())
        })?;
    preflight_target_reachable(&url).await?;

    let plan = parse_plan(&opts.task)
        .map_err(|e| warden_types::WardenError::Parse(e.to_string()))?;
    let driver = PageDriver::attach(session.cdp_port)
        .await
        .map_err(|e| warden_types::WardenError::Bootstrap(e.to_string()))?;

    let mut run = WebRun::new(opts, cfg, registry, session, driver, paths, url, plan);
    run.execute(&progress).await;
    let report = run.finalize(status_path).await;
    Ok(report)
}

/// TCP reachability preflight. Dev servers often bind IPv4 only, so
/// `localhost` is probed as 127.0.0.1 first.
async fn preflight_target_reachable(url: &str) -> Result<(), warden_types::WardenError> {
    let parsed = url::Url::parse(url)
        .map_err(|_| warden_types::WardenError::Parse(format!("invalid URL: {url}")))?;
    let host = parsed.host_str().unwrap_or_default().to_string();
    let port = parsed
        .port()
        .unwrap_or(if parsed.scheme() == "https" { 443 } else { 80 });
    let candidates: Vec<String> = if host == "localhost" || host == "0.0.0.0" {
        vec!["127.0.0.1".into(), "localhost".into(), "::1".into()]
    } else {
        vec![host]
    };
    for candidate in candidates {
        let attempt = tokio::time::timeout(
            Duration::from_millis(1200),
            tokio::net::TcpStream::connect((candidate.as_str(), port)),
        )
        .await;
        if matches!(attempt, Ok(Ok(_))) {
            return Ok(());
        }
    }
    Err(warden_types::WardenError::Bootstrap(format!(
        "web target not reachable: {url}"
    )))
}

/// Are two URLs the same origin and path (query ignored)?
pub fn same_origin_path(current: &str, target: &str) -> bool {
    let (Ok(current), Ok(target)) = (url::Url::parse(current), url::Url::parse(target)) else {
        return false;
    };
    if current.host_str().is_none() {
        return false;
    }
    current.scheme() == target.scheme()
        && current.host_str() == target.host_str()
        && current.port_or_known_default() == target.port_or_known_default()
        && normalized_path(&current) == normalized_path(&target)
}

fn normalized_path(url: &url::Url) -> &str {
    match url.path() {
        "" => "/",
        path => path,
    }
}

/// Unpack a bulk-in-cards step value (`card_selector||required_text`).
/// The card selector defaults to `.track-card`, the text filter to none.
fn split_packed_cards(packed: &str) -> (String, String) {
    let (card, text) = match packed.split_once("||") {
        Some((card, text)) => (card.trim(), text.trim()),
        None => (packed.trim(), ""),
    };
    let card = if card.is_empty() { ".track-card" } else { card };
    (card.to_string(), text.to_string())
}

/// Outcome of one interactive attempt ladder.
enum LadderOutcome {
    /// The step landed; the fallback selector (if any) is carried.
    Done { selector_used: Option<String> },
    /// All candidates failed within the retry budget.
    Exhausted { attempted: String },
    /// A step or run deadline cut the ladder short.
    DeadlineHit { attempted: String },
    /// The watchdog called the attempt stuck mid-ladder.
    Stuck { attempted: String },
    /// The page or browser is gone.
    Crashed,
}

/// Why the step loop stopped before plan exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopBreak {
    Crash,
    Timeout,
    Handoff,
    RunTimeout,
}

struct WebRun<'a> {
    opts: WebRunOptions,
    cfg: &'a BridgeConfig,
    registry: &'a SessionRegistry,
    session: SessionRecord,
    driver: PageDriver,
    paths: &'a RunPaths,
    url: String,
    plan: Vec<WebStep>,

    actions: Vec<String>,
    observations: Vec<String>,
    console_errors: Vec<String>,
    network_findings: Vec<String>,
    ui_findings: Vec<String>,
    evidence_paths: Vec<String>,
    learning_notes: Vec<String>,
    outcomes: Vec<StepOutcome>,

    watchdog: WatchdogState,
    wd_cfg: WatchdogConfig,
    deadline: Deadline,
    learning: LearningStore,
    context: Option<LearningContext>,
    request_methods: HashMap<String, String>,

    result: RunResult,
    interactive_step: usize,
    last_mouse: (f64, f64),
    control_enabled: bool,
    force_keep_open: bool,
    wait_for_learning: bool,
    failed_target_for_teaching: String,
    handoff_where: String,
}

impl<'a> WebRun<'a> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        opts: WebRunOptions,
        cfg: &'a BridgeConfig,
        registry: &'a SessionRegistry,
        session: SessionRecord,
        driver: PageDriver,
        paths: &'a RunPaths,
        url: String,
        plan: Vec<WebStep>,
    ) -> Self {
        let learning = LearningStore::in_dir(&registry.dir().parent().map(|p| p.join("learning")).unwrap_or_else(|| PathBuf::from("runs/learning")));
        Self {
            wd_cfg: WatchdogConfig::from(cfg),
            deadline: Deadline::start_run(cfg.run_hard_timeout),
            opts,
            cfg,
            registry,
            session,
            driver,
            paths,
            url,
            plan,
            actions: Vec::new(),
            observations: Vec::new(),
            console_errors: Vec::new(),
            network_findings: Vec::new(),
            ui_findings: Vec::new(),
            evidence_paths: Vec::new(),
            learning_notes: Vec::new(),
            outcomes: Vec::new(),
            watchdog: WatchdogState::default(),
            learning,
            context: None,
            request_methods: HashMap::new(),
            result: RunResult::Success,
            interactive_step: 0,
            last_mouse: (12.0, 12.0),
            control_enabled: false,
            force_keep_open: false,
            wait_for_learning: false,
            failed_target_for_teaching: String::new(),
            handoff_where: String::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Main phases
    // -----------------------------------------------------------------------

    async fn execute(&mut self, progress: &impl Fn(usize, usize, &str)) {
        if let Err(err) = self.bootstrap().await {
            tracing::warn!(error = %err, "web bootstrap degraded");
            self.ui_findings.push(format!("bootstrap degraded: {err}"));
        }

        let break_reason = self.step_loop(progress).await;
        self.pump_observers().await;

        if self.wait_for_learning {
            self.learning_window().await;
        }
        if matches!(break_reason, Some(LoopBreak::Crash)) {
            self.result = RunResult::Failed;
        }
    }

    /// Navigate, install observers and overlay, capture the baseline
    /// context evidence, and auto-insert the demo-login step if the page
    /// asks for it.
    async fn bootstrap(&mut self) -> Result<(), BrowserError> {
        if self.opts.visual {
            self.actions.push("cmd: playwright visual on".into());
        }

        let initial_url = self.driver.current_url().await.unwrap_or_default();
        let initial_title = self.driver.title().await;
        self.observations
            .push(format!("Initial url/title: {initial_url} | {initial_title}"));

        if same_origin_path(&initial_url, &self.url) {
            self.observations
                .push("Navigation skipped (already at target)".into());
        } else {
            let budget = self.deadline.effective_budget(Duration::from_secs(30));
            self.driver.navigate(&self.url, budget).await?;
            self.actions.push(format!("cmd: playwright open {}", self.url));
            self.observations.push(format!("Opened URL: {}", self.url));
        }

        let title = self.driver.title().await;
        self.observations.push(format!("Page title: {title}"));
        let landmarks = self
            .driver
            .evaluate(LearningContext::LANDMARK_JS)
            .await
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        self.context = Some(LearningContext::derive(&self.url, &title, &landmarks));

        self.install_overlays(true).await;
        let _ = self
            .registry
            .mark_controlled(&self.session.session_id, true, Some(&self.url), Some(&title))
            .await;
        self.control_enabled = true;

        // Baseline context evidence before any step runs.
        let context_path = self.evidence_file("step_0_context.png");
        if self.driver.screenshot_to_file(&context_path).await.is_ok() {
            self.push_evidence(&context_path);
        }
        let snippet = self.driver.body_snippet(500).await;
        self.ui_findings.push(format!(
            "context title={title} url={} body[:500]={snippet}",
            self.driver.current_url().await.unwrap_or_default(),
        ));

        // Conditional login: click the demo button only when the page shows
        // it enabled and the task did not already ask for it (dedup rule).
        let demo = self.driver.probe_text("Entrar demo").await;
        let demo_available =
            demo.present == Some(true) && demo.visible == Some(true) && demo.enabled != Some(false);
        if demo_available {
            if plan_requests_login_click(&self.plan) {
                self.observations.push(
                    "Login step already requested by task; skipping auto demo click insertion"
                        .into(),
                );
            } else {
                self.observations
                    .push("Login state detected: Entrar demo present and enabled".into());
                let at = usize::from(
                    self.plan
                        .first()
                        .is_some_and(|s| s.kind == StepKind::OpenUrl),
                );
                self.plan
                    .insert(at, WebStep::new(StepKind::MaybeClickText, "Entrar demo"));
            }
        } else {
            self.observations.push("demo not present; already authed".into());
            self.ui_findings.push("demo not present; already authed".into());
        }

        // Baseline for observer-derived progress.
        let baseline = self.observer_useful_events().await;
        self.watchdog.seed_observer_baseline(baseline);
        Ok(())
    }

    /// Serial step loop. Returns the break reason, or `None` when the plan
    /// ran to exhaustion.
    async fn step_loop(&mut self, progress: &impl Fn(usize, usize, &str)) -> Option<LoopBreak> {
        let steps = self.plan.clone();
        let total = steps.len();
        for (idx, step) in steps.iter().enumerate() {
            let idx = idx + 1;
            let signature = step_signature(idx, total, step);
            let learning_target = step.learning_target().unwrap_or_default().to_string();
            self.watchdog
                .update_step_signature(&signature, &learning_target);
            progress(idx, total, &format!("web step {idx}/{total}: {step}"));

            if self.runtime_closed().await {
                append_run_crash_findings(&mut self.ui_findings);
                return Some(LoopBreak::Crash);
            }
            if self.deadline.run_expired() {
                self.handle_run_timeout().await;
                return Some(LoopBreak::RunTimeout);
            }
            self.pump_observers().await;
            if self.opts.teaching && self.watchdog_stuck_check("watchdog:loop").await {
                return Some(LoopBreak::Handoff);
            }
            if self.opts.visual {
                self.ensure_overlays().await;
            }

            let broke = match step.kind {
                StepKind::OpenUrl => self.run_open_url_step(idx, step).await,
                StepKind::WaitSelector | StepKind::WaitText => {
                    self.run_wait_step(idx, step).await
                }
                StepKind::VerifyVisible => {
                    self.run_verify_step(idx, step).await;
                    None
                }
                StepKind::WindowOp => {
                    self.record_outcome(
                        StepOutcome::new(idx, step.clone(), StepStatus::Skipped)
                            .with_reason("window ops run in gui mode"),
                    );
                    None
                }
                _ => self.run_interactive_step(idx, step).await,
            };
            if let Some(reason) = broke {
                return Some(reason);
            }
        }
        None
    }

    // -----------------------------------------------------------------------
    // Step kinds
    // -----------------------------------------------------------------------

    async fn run_open_url_step(&mut self, idx: usize, step: &WebStep) -> Option<LoopBreak> {
        // Navigation already happened during bootstrap; re-running the plan
        // step only verifies we are still on target.
        let current = self.driver.current_url().await.unwrap_or_default();
        if same_origin_path(&current, &step.target) {
            self.record_outcome(StepOutcome::new(idx, step.clone(), StepStatus::Ok));
            self.watchdog.mark_progress();
            return None;
        }
        let budget = self.deadline.effective_budget(Duration::from_secs(30));
        match self.driver.navigate(&step.target, budget).await {
            Ok(()) => {
                self.record_outcome(StepOutcome::new(idx, step.clone(), StepStatus::Ok));
                self.watchdog.mark_progress();
                None
            }
            Err(err) if err.is_page_closed() => {
                append_run_crash_findings(&mut self.ui_findings);
                Some(LoopBreak::Crash)
            }
            Err(err) => {
                self.console_errors
                    .push(format!("Navigation failed on step {idx}: {err}"));
                self.record_outcome(StepOutcome::new(idx, step.clone(), StepStatus::Timeout));
                self.result = self.fail_or_partial();
                Some(LoopBreak::Timeout)
            }
        }
    }

    async fn run_wait_step(&mut self, idx: usize, step: &WebStep) -> Option<LoopBreak> {
        self.deadline.begin_step(self.cfg.step_hard_timeout);
        if !self.frame_guard(idx, step).await {
            return Some(LoopBreak::Handoff);
        }
        let budget = self.deadline.effective_budget(self.cfg.wait_timeout);
        let waited = match step.kind {
            StepKind::WaitSelector => self.driver.wait_for_selector(&step.target, budget).await,
            _ => self.driver.wait_for_text(&step.target, budget).await,
        };
        self.deadline.clear_step();

        match waited {
            Ok(()) => {
                let (verb, noun) = match step.kind {
                    StepKind::WaitSelector => ("selector", "selector visible"),
                    _ => ("text", "text visible"),
                };
                self.actions
                    .push(format!("cmd: playwright wait {verb}:{}", step.target));
                self.observations
                    .push(format!("Wait {verb} step {idx}: {}", step.target));
                self.ui_findings
                    .push(format!("step {idx} verify {noun}: {}", step.target));
                self.record_outcome(StepOutcome::new(idx, step.clone(), StepStatus::Ok));
                self.watchdog.mark_progress();
                None
            }
            Err(err) if err.is_page_closed() => {
                append_run_crash_findings(&mut self.ui_findings);
                Some(LoopBreak::Crash)
            }
            Err(err) if err.is_timeout() => {
                if self.should_soft_skip_wait_timeout(idx, step) {
                    self.observations.push(
                        "teaching wait soft-skip: timed out on wait_text but next step is Stop"
                            .into(),
                    );
                    self.ui_findings.push(format!(
                        "step {idx} soft-skip wait timeout on {step} (teaching)"
                    ));
                    self.record_outcome(
                        StepOutcome::new(idx, step.clone(), StepStatus::Skipped)
                            .with_reason("teaching soft-skip"),
                    );
                    return None;
                }
                self.capture_timeout_evidence(&format!("step_{idx}_timeout.png")).await;
                self.console_errors
                    .push(format!("Timeout on step {idx}: {step}"));
                append_wait_timeout_findings(
                    &mut self.ui_findings,
                    idx,
                    step,
                    self.cfg.wait_timeout.as_millis(),
                );
                self.record_outcome(StepOutcome::new(idx, step.clone(), StepStatus::Timeout));
                self.result = self.fail_or_partial();
                Some(LoopBreak::Timeout)
            }
            Err(err) => {
                self.console_errors
                    .push(format!("Wait step {idx} failed: {err}"));
                self.record_outcome(StepOutcome::new(idx, step.clone(), StepStatus::Timeout));
                self.result = self.fail_or_partial();
                Some(LoopBreak::Timeout)
            }
        }
    }

    /// Verify the previous step's target (or the page when none) is still
    /// visible; the verdict lands as a finding tied to the preceding step.
    async fn run_verify_step(&mut self, idx: usize, step: &WebStep) {
        let previous = self
            .plan
            .get(idx.saturating_sub(2))
            .map(|s| s.target.clone())
            .unwrap_or_default();
        let visible = if previous.is_empty() {
            true
        } else if previous.starts_with('#') || previous.starts_with('.') || previous.starts_with('[')
        {
            self.driver.probe_selector(&previous).await.visible == Some(true)
        } else {
            self.driver.probe_text(&previous).await.visible == Some(true)
        };
        let url = self.driver.current_url().await.unwrap_or_default();
        let title = self.driver.title().await;
        if visible {
            self.ui_findings.push(format!(
                "step {} verify visible result: url={url}, title={title}",
                idx.saturating_sub(1).max(1),
            ));
        } else {
            self.ui_findings.push(format!(
                "step {} verify failed: '{previous}' not visible (url={url})",
                idx.saturating_sub(1).max(1),
            ));
            if self.result == RunResult::Success {
                self.result = RunResult::Partial;
            }
        }
        self.record_outcome(StepOutcome::new(idx, step.clone(), StepStatus::Ok));
        self.watchdog.mark_progress();
    }

    async fn run_interactive_step(&mut self, idx: usize, step: &WebStep) -> Option<LoopBreak> {
        self.deadline.begin_step(self.cfg.step_hard_timeout);
        let outcome = self.run_interactive_step_inner(idx, step).await;
        self.deadline.clear_step();
        outcome
    }

    async fn run_interactive_step_inner(&mut self, idx: usize, step: &WebStep) -> Option<LoopBreak> {
        if !self.frame_guard(idx, step).await {
            return Some(LoopBreak::Handoff);
        }

        // Applicability precheck: a disabled or absent target skips without
        // consuming the retry budget.
        let state = match step.kind {
            StepKind::ClickText | StepKind::MaybeClickText => {
                self.driver.probe_text(&step.target).await
            }
            _ => self.driver.probe_selector(&step.target).await,
        };
        let text_target = matches!(step.kind, StepKind::ClickText | StepKind::MaybeClickText);
        if let Some(reason) = state.not_applicable_reason(text_target) {
            self.observations
                .push(format!("Step {idx} skipped (not applicable): {reason}"));
            self.ui_findings
                .push(format!("step {idx} skipped_not_applicable: {reason}"));
            self.record_outcome(
                StepOutcome::new(idx, step.clone(), StepStatus::Skipped).with_reason(reason),
            );
            self.watchdog.mark_progress();
            return None;
        }

        self.interactive_step += 1;
        let step_num = self.interactive_step;
        let before = self.evidence_file(&format!("step_{step_num}_before.png"));
        if self.driver.screenshot_to_file(&before).await.is_ok() {
            self.push_evidence(&before);
        }

        let ladder = self.apply_with_ladder(idx, step_num, step).await;
        match ladder {
            LadderOutcome::Done { selector_used } => {
                tokio::time::sleep(POST_ACTION_PAUSE).await;
                let after = self.evidence_file(&format!("step_{step_num}_after.png"));
                if self.driver.screenshot_to_file(&after).await.is_ok() {
                    self.push_evidence(&after);
                }
                if let Some(selector) = &selector_used {
                    self.learning_notes.push(format!(
                        "selector used for target '{}': {selector}",
                        step.target
                    ));
                    if let Some(context) = &self.context {
                        let _ = self.learning.record_success(
                            &context.state_key,
                            &step.target,
                            selector,
                            None,
                        );
                        let _ = self.learning.append_audit(
                            &step.target,
                            selector,
                            &context.state_key,
                            "auto_retry",
                        );
                    }
                }
                let mut outcome = StepOutcome::new(idx, step.clone(), StepStatus::Ok);
                outcome.selector_used = selector_used;
                self.record_outcome(outcome);
                self.watchdog.mark_progress();
                if self.opts.visual {
                    self.ensure_overlays().await;
                }
                None
            }
            LadderOutcome::Crashed => {
                append_run_crash_findings(&mut self.ui_findings);
                Some(LoopBreak::Crash)
            }
            LadderOutcome::DeadlineHit { attempted } => {
                self.handle_interactive_timeout(idx, step_num, step, &attempted)
                    .await
            }
            LadderOutcome::Stuck { attempted } => {
                self.trigger_stuck_handoff(
                    "stuck",
                    &attempted,
                    &format!(
                        "Me he atascado en: {}. Te cedo el control para que me ayudes.",
                        self.watchdog.current_step_signature
                    ),
                    "step unchanged/no useful progress within stuck thresholds during teaching mode",
                    true,
                )
                .await;
                self.record_outcome(StepOutcome::new(idx, step.clone(), StepStatus::Stuck));
                Some(LoopBreak::Handoff)
            }
            LadderOutcome::Exhausted { attempted } => {
                if self.opts.teaching && step.is_teachable() {
                    self.learning_notes.push(format!("failed target: {}", step.target));
                    append_target_not_found_findings(&mut self.ui_findings, step_num, step);
                    self.failed_target_for_teaching = step.target.clone();
                    self.force_keep_open = true;
                    self.wait_for_learning = true;
                    let _ = overlay::show_notice(
                        &self.driver,
                        &format!("No encuentro el botón: {}. Te cedo el control.", step.target),
                        "orange",
                    )
                    .await;
                    self.record_outcome(StepOutcome::new(
                        idx,
                        step.clone(),
                        StepStatus::TargetNotFound,
                    ));
                    self.result = RunResult::Partial;
                    Some(LoopBreak::Handoff)
                } else if matches!(step.kind, StepKind::MaybeClickText) {
                    // Optional step: absence is fine.
                    self.observations
                        .push(format!("Step {idx}: maybe click not present: {}", step.target));
                    self.ui_findings
                        .push(format!("step {idx} verify optional click skipped: {}", step.target));
                    self.record_outcome(
                        StepOutcome::new(idx, step.clone(), StepStatus::Skipped)
                            .with_reason("optional target absent"),
                    );
                    None
                } else {
                    self.handle_interactive_timeout(idx, step_num, step, &attempted)
                        .await
                }
            }
        }
    }

    /// Candidate ladder with retries. Learned selectors go first, then the
    /// literal step, then heuristic fallbacks. Teaching mode gets scroll
    /// replays and extra rounds; plain mode gets a single pass over the
    /// learned + literal candidates.
    async fn apply_with_ladder(
        &mut self,
        idx: usize,
        step_num: usize,
        step: &WebStep,
    ) -> LadderOutcome {
        let candidates = self.candidates_for(step);
        let attempts = if self.opts.teaching { 1 + MAX_RETRIES } else { 1 };
        let mut attempted_parts: Vec<String> = Vec::new();
        let baseline_events = self.observer_useful_events().await;
        let started = tokio::time::Instant::now();

        for attempt in 1..=attempts {
            if self.deadline.expired() {
                attempted_parts.push("deadline=step_or_run".into());
                return LadderOutcome::DeadlineHit {
                    attempted: attempted_parts.join(", "),
                };
            }
            attempted_parts.push(format!("retry={}", attempt - 1));
            if attempt > 1 {
                self.replay_scroll_hints(step).await;
                attempted_parts.push("scroll=main+page".into());
                self.ui_findings.push(format!(
                    "step {step_num} retry {}/{MAX_RETRIES}: scrolled and re-attempting",
                    attempt - 1
                ));
                let shot = self.evidence_file(&format!("step_{step_num}_retry_{}_before.png", attempt - 1));
                if self.driver.screenshot_to_file(&shot).await.is_ok() {
                    self.push_evidence(&shot);
                }
            }

            for candidate in &candidates {
                if self.deadline.expired() {
                    attempted_parts.push("deadline=step_or_run".into());
                    return LadderOutcome::DeadlineHit {
                        attempted: attempted_parts.join(", "),
                    };
                }
                if candidate.kind == StepKind::ClickSelector {
                    attempted_parts.push(format!("selector={}", candidate.target));
                }
                match self.apply_candidate(idx, step_num, step, candidate).await {
                    Ok(()) => {
                        if attempt > 1 {
                            let shot = self
                                .evidence_file(&format!("step_{step_num}_retry_{}_after.png", attempt - 1));
                            if self.driver.screenshot_to_file(&shot).await.is_ok() {
                                self.push_evidence(&shot);
                            }
                        }
                        let selector_used = (candidate.kind == StepKind::ClickSelector
                            && candidate.target != step.target)
                            .then(|| candidate.target.clone());
                        if let Some(selector) = &selector_used {
                            self.observations.push(format!(
                                "step {step_num} used stable selector fallback: {selector}"
                            ));
                        }
                        return LadderOutcome::Done { selector_used };
                    }
                    Err(err) if err.is_page_closed() => return LadderOutcome::Crashed,
                    Err(err) => {
                        tracing::debug!(candidate = %candidate, error = %err, "candidate failed");
                        // A learned selector that stopped resolving loses
                        // rank after repeated misses.
                        if let (Some(context), StepKind::ClickSelector) =
                            (&self.context, candidate.kind)
                        {
                            if candidate.target != step.target {
                                let _ = self.learning.record_failure(
                                    &context.state_key,
                                    &step.target,
                                    &candidate.target,
                                );
                            }
                        }
                        if self.opts.teaching
                            && self.attempt_is_stuck(started, baseline_events).await
                        {
                            self.ui_findings.push(format!(
                                "stuck detected on step {step_num}: elapsed>{:?} and no useful observer events",
                                self.cfg.stuck_interactive
                            ));
                            return LadderOutcome::Stuck {
                                attempted: attempted_parts.join(", "),
                            };
                        }
                    }
                }
            }
        }
        LadderOutcome::Exhausted {
            attempted: attempted_parts.join(", "),
        }
    }

    /// Build the candidate list: learned ≻ explicit ≻ heuristic.
    fn candidates_for(&self, step: &WebStep) -> Vec<WebStep> {
        let mut out: Vec<WebStep> = Vec::new();
        let learned: Vec<String> = match (&self.context, step.kind) {
            (Some(context), StepKind::ClickText | StepKind::ClickSelector) => self
                .learning
                .selectors_for(&context.state_key, &step.target)
                .into_iter()
                .map(|entry| entry.selector)
                // An explicit selector target only accepts itself from the
                // store; learned alternatives are for text targets.
                .filter(|selector| {
                    step.kind != StepKind::ClickSelector || selector == &step.target
                })
                .collect(),
            _ => Vec::new(),
        };
        for selector in learned {
            if selector != step.target {
                out.push(WebStep::new(StepKind::ClickSelector, selector));
            }
        }
        out.push(step.clone());
        match step.kind {
            StepKind::ClickText if !is_generic_play_label(&step.target) => {
                for selector in stable_selectors_for_target(&step.target) {
                    out.push(WebStep::new(StepKind::ClickSelector, selector));
                }
            }
            StepKind::ClickSelector => {
                for hint in semantic_hints_for_selector(&step.target) {
                    for selector in stable_selectors_for_target(&hint) {
                        out.push(WebStep::new(StepKind::ClickSelector, selector));
                    }
                    out.push(WebStep::new(StepKind::ClickText, hint));
                }
            }
            _ => {}
        }
        out
    }

    /// Perform one candidate primitive and record its action/observation on
    /// success.
    async fn apply_candidate(
        &mut self,
        _idx: usize,
        step_num: usize,
        _original: &WebStep,
        candidate: &WebStep,
    ) -> Result<(), BrowserError> {
        let budget = self.deadline.effective_budget(self.cfg.interactive_timeout);
        match candidate.kind {
            StepKind::ClickSelector => {
                self.click_with_style(&candidate.target, None, budget).await?;
                self.actions
                    .push(format!("cmd: playwright click selector:{}", candidate.target));
                self.observations
                    .push(format!("Clicked selector in step {step_num}: {}", candidate.target));
            }
            StepKind::ClickText | StepKind::MaybeClickText => {
                match self.click_with_style(&candidate.target, Some(&candidate.target), budget).await {
                    Ok(()) => {}
                    Err(err)
                        if !err.is_timeout()
                            && is_login_target(&candidate.target)
                            && self.looks_authenticated().await =>
                    {
                        // The login button vanished because the session is
                        // already signed in; that is success, not failure.
                        self.observations.push(format!(
                            "Step {step_num}: target '{}' not found; authenticated state detected.",
                            candidate.target
                        ));
                        self.ui_findings.push(format!(
                            "step {step_num} verify authenticated session already active"
                        ));
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                }
                let verb = if candidate.kind == StepKind::MaybeClickText {
                    "maybe click"
                } else {
                    "click"
                };
                self.actions
                    .push(format!("cmd: playwright {verb} text:{}", candidate.target));
                self.observations
                    .push(format!("Clicked text in step {step_num}: {}", candidate.target));
            }
            StepKind::FillSelector => {
                self.driver
                    .fill_selector(&candidate.target, &candidate.value, budget)
                    .await?;
                self.actions.push(format!(
                    "cmd: playwright fill selector:{} text:{}",
                    candidate.target, candidate.value
                ));
                self.observations.push(format!(
                    "Filled input in step {step_num}: selector={}, text={}",
                    candidate.target, candidate.value
                ));
            }
            StepKind::SelectLabel => {
                self.driver
                    .select_option(&candidate.target, Some(&candidate.value), None, budget)
                    .await?;
                self.actions.push(format!(
                    "cmd: playwright select selector:{} label:{}",
                    candidate.target, candidate.value
                ));
                self.observations.push(format!(
                    "Selected option by label in step {step_num}: selector={}, label={}",
                    candidate.target, candidate.value
                ));
            }
            StepKind::SelectValue => {
                self.driver
                    .select_option(&candidate.target, None, Some(&candidate.value), budget)
                    .await?;
                self.actions.push(format!(
                    "cmd: playwright select selector:{} value:{}",
                    candidate.target, candidate.value
                ));
                self.observations.push(format!(
                    "Selected option by value in step {step_num}: selector={}, value={}",
                    candidate.target, candidate.value
                ));
            }
            StepKind::BulkClickInCards => {
                let (card_selector, required_text) = split_packed_cards(&candidate.value);
                let clicked = self
                    .bulk_click_in_cards(&candidate.target, &card_selector, &required_text, budget)
                    .await?;
                self.actions.push(format!(
                    "cmd: playwright bulk_click_in_cards selector:{} cards:{card_selector} text:{required_text}",
                    candidate.target
                ));
                self.observations.push(format!(
                    "Bulk click in cards step {step_num}: selector={}, card={card_selector}, \
                     text={required_text}, clicked={clicked}",
                    candidate.target
                ));
                self.ui_findings.push(format!(
                    "step {step_num} verify bulk click in cards: clicked={clicked}, selector={}",
                    candidate.target
                ));
                return Ok(());
            }
            StepKind::BulkClickUntilEmpty => {
                let clicked = self.bulk_click_until_empty(&candidate.target, budget).await?;
                self.actions.push(format!(
                    "cmd: playwright bulk_click_until_empty selector:{}",
                    candidate.target
                ));
                self.observations.push(format!(
                    "Bulk click until empty step {step_num}: selector={}, clicked={clicked}",
                    candidate.target
                ));
                self.ui_findings.push(format!(
                    "step {step_num} verify bulk click until empty: clicked={clicked}, selector={}",
                    candidate.target
                ));
                return Ok(());
            }
            _ => {
                return Err(BrowserError::Protocol {
                    detail: format!("unsupported interactive candidate: {candidate}"),
                })
            }
        }
        let url = self.driver.current_url().await.unwrap_or_default();
        let title = self.driver.title().await;
        self.ui_findings.push(format!(
            "step {step_num} verify visible result: url={url}, title={title}"
        ));
        Ok(())
    }

    /// Click with the visual style flags applied: human-mouse trajectory
    /// and press-hold when enabled, direct trusted click otherwise.
    async fn click_with_style(
        &mut self,
        target: &str,
        text: Option<&str>,
        budget: Duration,
    ) -> Result<(), BrowserError> {
        if !(self.opts.visual && self.opts.visual_human_mouse) {
            return match text {
                Some(text) => self.driver.click_text(text, budget).await,
                None => self.driver.click_selector(target, budget).await,
            };
        }
        let destination = match text {
            Some(text) => self.driver.locate_text(text, budget).await?,
            None => self.driver.locate_selector(target, budget).await?,
        };
        let steps = (24.0 / self.opts.visual_mouse_speed.max(0.2)).round() as usize;
        let path =
            warden_browser::driver::human_mouse_path(self.last_mouse, destination, steps.max(6));
        let pause = Duration::from_millis((16.0 / self.opts.visual_mouse_speed.max(0.2)) as u64);
        self.driver.trace_mouse_path(&path, pause).await?;
        self.driver
            .click_at_with_hold(destination.0, destination.1, self.opts.visual_click_hold)
            .await?;
        self.last_mouse = destination;
        Ok(())
    }

    /// Click the target button inside every visible matching card,
    /// scrolling and rescanning until no new cards show up. Clicking zero
    /// buttons is a valid outcome (nothing matched), not an error.
    async fn bulk_click_in_cards(
        &mut self,
        button_selector: &str,
        card_selector: &str,
        required_text: &str,
        budget: Duration,
    ) -> Result<usize, BrowserError> {
        let mut seen: Vec<String> = Vec::new();
        let mut clicked = 0usize;
        let mut no_new_rounds = 0u32;
        for _round in 0..18 {
            if self.deadline.expired() {
                break;
            }
            let (selectors, reached_bottom) = self
                .driver
                .scan_card_buttons(card_selector, button_selector, required_text, &seen)
                .await;
            if selectors.is_empty() {
                no_new_rounds += 1;
            }
            for selector in &selectors {
                if self.deadline.expired() {
                    break;
                }
                match self.click_with_style(selector, None, budget).await {
                    Ok(()) => {
                        seen.push(selector.clone());
                        clicked += 1;
                    }
                    Err(err) if err.is_page_closed() => return Err(err),
                    // A card that re-rendered away mid-round shows up again
                    // on the next scan if it still matters.
                    Err(_) => {}
                }
            }
            if no_new_rounds >= 2 && reached_bottom {
                break;
            }
            if no_new_rounds >= 3 {
                break;
            }
            if reached_bottom && selectors.is_empty() {
                break;
            }
            self.scroll_page(120, 160).await;
        }
        Ok(clicked)
    }

    /// Keep clicking every visible match of `button_selector` until a scan
    /// pass comes back empty. The app removing clicked rows is what drains
    /// the scan; a pass cap bounds runaway pages.
    async fn bulk_click_until_empty(
        &mut self,
        button_selector: &str,
        budget: Duration,
    ) -> Result<usize, BrowserError> {
        let mut clicked = 0usize;
        for _pass in 0..24 {
            if self.deadline.expired() {
                break;
            }
            let selectors = self.driver.scan_visible_selectors(button_selector, &[]).await;
            if selectors.is_empty() {
                break;
            }
            for selector in &selectors {
                if self.deadline.expired() {
                    break;
                }
                match self.click_with_style(selector, None, budget).await {
                    Ok(()) => clicked += 1,
                    Err(err) if err.is_page_closed() => return Err(err),
                    Err(_) => {}
                }
            }
            tokio::time::sleep(Duration::from_millis(110)).await;
        }
        Ok(clicked)
    }

    /// Scroll the main container (when present) and the page.
    async fn scroll_page(&self, amount: i64, pause_ms: u64) {
        let _ = self
            .driver
            .evaluate(&format!(
                r#"(() => {{
                    const main = document.querySelector('main,[role="main"],#main,.main,#__next,.app,[data-testid="main"]');
                    if (main && typeof main.scrollBy === 'function') main.scrollBy(0, {amount});
                    window.scrollBy(0, {amount});
                }})()"#,
            ))
            .await;
        tokio::time::sleep(Duration::from_millis(pause_ms)).await;
    }

    async fn attempt_is_stuck(
        &mut self,
        started: tokio::time::Instant,
        baseline_events: usize,
    ) -> bool {
        let elapsed = started.elapsed();
        if elapsed > self.cfg.stuck_step.max(Duration::from_millis(100)) {
            return true;
        }
        if elapsed <= self.cfg.stuck_interactive.max(Duration::from_millis(100)) {
            return false;
        }
        let current = self.observer_useful_events().await;
        current <= baseline_events
    }

    async fn replay_scroll_hints(&mut self, step: &WebStep) {
        if let Some(context) = &self.context {
            for entry in self.learning.selectors_for(&context.state_key, &step.target) {
                if let Some(hint) = entry.scroll_hints.first() {
                    let _ = self
                        .driver
                        .evaluate(&format!("window.scrollTo(0, {hint})"))
                        .await;
                    tokio::time::sleep(Duration::from_millis(140)).await;
                    return;
                }
            }
        }
        // Container first, then page.
        self.scroll_page(180, 140).await;
    }

    // -----------------------------------------------------------------------
    // Stuck handling and handoff
    // -----------------------------------------------------------------------

    /// Frame guard: force main-frame focus before any interaction or wait.
    /// Returns false when the step must abort into a handoff.
    async fn frame_guard(&mut self, idx: usize, step: &WebStep) -> bool {
        if frame::force_main_frame_context(&self.driver, self.cfg.stuck_iframe).await {
            return true;
        }
        // Could not escape the iframe: disable its pointer events and try
        // once more before giving up.
        let token = frame::disable_player_iframe_pointer_events(&self.driver).await;
        let recovered = frame::force_main_frame_context(&self.driver, Duration::from_secs(2)).await;
        let _ = frame::restore_iframe_pointer_events(&self.driver, token).await;
        if recovered {
            return true;
        }

        crate::findings::append_iframe_focus_findings(
            &mut self.ui_findings,
            &self.watchdog.current_step_signature,
            "main-frame-first precheck failed",
            "unable to return focus/context to main frame before step",
        );
        let _ = overlay::show_notice(
            &self.driver,
            "Me he quedado dentro de YouTube iframe. Te cedo el control.",
            "orange",
        )
        .await;
        self.record_outcome(StepOutcome::new(idx, step.clone(), StepStatus::StuckIframe));
        self.failed_target_for_teaching = step.target.clone();
        self.force_keep_open = true;
        self.release_control_for_handoff(false).await;
        self.result = RunResult::Partial;
        false
    }

    /// Watchdog poll outside primitives; true means handoff happened.
    async fn watchdog_stuck_check(&mut self, attempted: &str) -> bool {
        let useful = self.observer_useful_events().await;
        self.watchdog.poll_observer(useful);
        let locked = frame::iframe_focus_locked(&self.driver).await;
        match self.watchdog.evaluate(&self.wd_cfg, locked) {
            Some(StuckReason::IframeFocus) => {
                crate::findings::append_iframe_focus_findings(
                    &mut self.ui_findings,
                    &self.watchdog.current_step_signature,
                    &format!("{attempted}, iframe_focus>{:?}", self.wd_cfg.stuck_iframe),
                    "focus/cursor remained in iframe without useful progress",
                );
                let _ = overlay::show_notice(
                    &self.driver,
                    "Me he quedado dentro de YouTube iframe. Te cedo el control.",
                    "orange",
                )
                .await;
                self.force_keep_open = true;
                self.release_control_for_handoff(false).await;
                self.result = RunResult::Partial;
                true
            }
            Some(StuckReason::Stuck) => {
                self.failed_target_for_teaching =
                    self.watchdog.current_learning_target.clone();
                self.trigger_stuck_handoff(
                    "stuck",
                    attempted,
                    &format!(
                        "Me he atascado en: {}. Te cedo el control para que me ayudes.",
                        self.watchdog.current_step_signature
                    ),
                    "step unchanged/no useful progress within stuck thresholds during teaching mode",
                    true,
                )
                .await;
                true
            }
            None => false,
        }
    }

    async fn handle_run_timeout(&mut self) {
        if self.opts.teaching {
            self.trigger_stuck_handoff(
                "run_timeout",
                "run hard timeout exceeded",
                "He excedido el tiempo máximo del run. Te cedo el control.",
                "run exceeded BRIDGE_WEB_RUN_HARD_TIMEOUT_SECONDS without completing all steps",
                true,
            )
            .await;
        } else {
            let where_ = if self.watchdog.current_step_signature.is_empty() {
                "web-run".to_string()
            } else {
                self.watchdog.current_step_signature.clone()
            };
            self.ui_findings.push("what_failed=run_timeout".into());
            self.ui_findings.push(format!("where={where_}"));
            self.ui_findings.push(
                "why_likely=run exceeded BRIDGE_WEB_RUN_HARD_TIMEOUT_SECONDS without completing all steps"
                    .into(),
            );
            self.ui_findings.push("attempted=run hard timeout exceeded".into());
            self.ui_findings.push("next_best_action=inspect logs and retry".into());
        }
        // Hard timeout: partial if anything landed, failed otherwise.
        self.result = if self.ok_interactive_outcomes() > 0 {
            RunResult::Partial
        } else {
            RunResult::Failed
        };
    }

    async fn handle_interactive_timeout(
        &mut self,
        idx: usize,
        step_num: usize,
        step: &WebStep,
        attempted: &str,
    ) -> Option<LoopBreak> {
        self.capture_timeout_evidence(&format!("step_{step_num}_timeout.png")).await;
        self.console_errors.push(format!(
            "Timeout on interactive step {step_num}: {step}"
        ));
        append_interactive_timeout_findings(
            &mut self.ui_findings,
            step_num,
            step,
            self.cfg.interactive_timeout.as_millis(),
        );
        self.record_outcome(StepOutcome::new(idx, step.clone(), StepStatus::Timeout));

        if self.opts.teaching {
            self.trigger_stuck_handoff(
                "interactive_timeout",
                attempted,
                "El paso interactivo superó el tiempo límite. Te cedo el control.",
                "interactive retries exceeded hard timeout without completing action",
                true,
            )
            .await;
            self.result = RunResult::Partial;
            Some(LoopBreak::Handoff)
        } else {
            self.result = self.fail_or_partial();
            Some(LoopBreak::Timeout)
        }
    }

    /// Common handoff transition: notice, release, learning window, action
    /// marker, structured findings.
    async fn trigger_stuck_handoff(
        &mut self,
        what_failed: &str,
        attempted: &str,
        notice: &str,
        why_likely: &str,
        wait_for_learning: bool,
    ) {
        self.handoff_where = self.watchdog.current_step_signature.clone();
        let _ = overlay::show_notice(&self.driver, notice, "orange").await;
        self.force_keep_open = true;
        self.wait_for_learning = wait_for_learning;
        self.release_control_for_handoff(wait_for_learning).await;

        let marker = "cmd: playwright release control (teaching handoff)";
        if !self.actions.iter().any(|a| a == marker) {
            self.actions.push(marker.to_string());
        }
        self.ui_findings.push(notice.to_string());
        if !self.ui_findings.iter().any(|f| f == "control released") {
            self.ui_findings.push("control released".into());
        }
        self.ui_findings.push(format!("what_failed={what_failed}"));
        self.ui_findings.push(format!("where={}", self.handoff_where));
        self.ui_findings.push(format!(
            "attempted={}",
            if attempted.is_empty() { "watchdog" } else { attempted }
        ));
        self.ui_findings.push("next_best_action=human_assist".into());
        self.ui_findings.push(format!("why_likely={why_likely}"));
        self.result = RunResult::Partial;
    }

    /// Release assistant control and flip the overlay to the handoff state.
    async fn release_control_for_handoff(&mut self, learning: bool) {
        let url = self.driver.current_url().await.ok();
        let title = self.driver.title().await;
        let _ = self
            .registry
            .mark_controlled(
                &self.session.session_id,
                false,
                url.as_deref(),
                Some(&title),
            )
            .await;
        if learning {
            let _ = self
                .registry
                .notify_learning_state(&self.session, true, self.cfg.learning_window)
                .await;
        }
        let color = if learning {
            ControlColor::Orange
        } else {
            ControlColor::Green
        };
        let _ = overlay::set_control_border(&self.driver, Some(color.as_str())).await;
        let state = overlay::top_bar_state(
            &self.session.session_id,
            url.as_deref().unwrap_or_default(),
            &title,
            &self.session.control_url().unwrap_or_default(),
            color,
        );
        let _ = overlay::update_top_bar(&self.driver, &state).await;
        self.control_enabled = false;
    }

    // -----------------------------------------------------------------------
    // Learning window
    // -----------------------------------------------------------------------

    /// Wait for a useful manual click during the learning window, persist
    /// it, and resume the stuck step with the learned selector.
    async fn learning_window(&mut self) {
        let _ = self
            .registry
            .notify_learning_state(&self.session, true, self.cfg.learning_window)
            .await;
        let guard = frame::disable_player_iframe_pointer_events(&self.driver).await;
        let capture = self.capture_manual_learning().await;
        let _ = frame::restore_iframe_pointer_events(&self.driver, guard).await;

        match capture {
            Some(capture) => {
                let selector = if capture.selector.is_empty() {
                    stable_selectors_for_target(&capture.target)
                        .into_iter()
                        .next()
                        .unwrap_or_default()
                } else {
                    capture.selector.clone()
                };
                if !selector.is_empty() {
                    if let Some(context) = &self.context {
                        let _ = self.learning.record_success(
                            &context.state_key,
                            &capture.failed_target,
                            &selector,
                            Some(capture.scroll_y),
                        );
                        let _ = self.learning.append_audit(
                            &capture.failed_target,
                            &selector,
                            &context.state_key,
                            "manual",
                        );
                    }
                }
                if let Ok(artifacts) =
                    write_teaching_artifacts(&self.paths.learning_dir(), &capture)
                {
                    for path in artifacts {
                        self.push_evidence(&path);
                    }
                }
                let _ = overlay::show_notice(
                    &self.driver,
                    &format!(
                        "Gracias, ya he aprendido dónde está {}. Ya continúo yo.",
                        if capture.failed_target.is_empty() {
                            "ese control"
                        } else {
                            capture.failed_target.as_str()
                        }
                    ),
                    "green",
                )
                .await;
                self.observations.push(format!(
                    "Teaching mode learned selector from manual action: {selector}"
                ));
                self.ui_findings.push(format!(
                    "Gracias, ya he aprendido dónde está el botón {}. Ya continúo yo.",
                    capture.failed_target
                ));

                if self.resume_after_learning(&selector, &capture.failed_target).await {
                    self.observations
                        .push("teaching resume: action replayed after learning".into());
                } else {
                    self.ui_findings.push("learning_resume=failed".into());
                }
            }
            None => {
                // Window expired with nothing useful: leave the session
                // under user control and report partial.
                self.ui_findings.push("learning_capture=none".into());
            }
        }

        let _ = overlay::clear_notice(&self.driver).await;
        let _ = self
            .registry
            .notify_learning_state(&self.session, false, Duration::from_secs(1))
            .await;
        let url = self.driver.current_url().await.ok();
        let title = self.driver.title().await;
        let state = overlay::top_bar_state(
            &self.session.session_id,
            url.as_deref().unwrap_or_default(),
            &title,
            &self.session.control_url().unwrap_or_default(),
            ControlColor::Green,
        );
        let _ = overlay::update_top_bar(&self.driver, &state).await;
        let _ = overlay::set_control_border(&self.driver, Some("green")).await;
    }

    /// Poll the agent's recent events for a relevant manual click until the
    /// learning window closes.
    async fn capture_manual_learning(&mut self) -> Option<TeachingCapture> {
        let deadline = tokio::time::Instant::now() + self.cfg.learning_window;
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
        while tokio::time::Instant::now() < deadline {
            let snapshot = match self.registry.request_state(&self.session).await {
                Ok(snapshot) => snapshot,
                Err(_) => return None,
            };
            let events = snapshot
                .get("recent_events")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for event in events.iter().rev() {
                let key = format!(
                    "{}|{}|{}",
                    event.get("created_at").and_then(Value::as_str).unwrap_or(""),
                    event.get("kind").and_then(Value::as_str).unwrap_or(""),
                    event.get("selector").and_then(Value::as_str).unwrap_or(""),
                );
                if !seen.insert(key) {
                    continue;
                }
                if event.get("kind").and_then(Value::as_str) != Some("click") {
                    continue;
                }
                let selector = event.get("selector").and_then(Value::as_str).unwrap_or("");
                let target = event.get("target").and_then(Value::as_str).unwrap_or("");
                let text = event.get("text").and_then(Value::as_str).unwrap_or("");
                if !is_relevant_manual_click(
                    selector,
                    target,
                    text,
                    &self.failed_target_for_teaching,
                ) {
                    let label = if self.failed_target_for_teaching.is_empty() {
                        "objetivo esperado".to_string()
                    } else {
                        self.failed_target_for_teaching.clone()
                    };
                    let hint = stable_selectors_for_target(&label)
                        .into_iter()
                        .next()
                        .unwrap_or(label.clone());
                    let _ = overlay::show_notice(
                        &self.driver,
                        &format!(
                            "Ese click no coincide. El objetivo es '{label}'. Prueba con: {hint}"
                        ),
                        "red",
                    )
                    .await;
                    continue;
                }
                return Some(TeachingCapture {
                    failed_target: if self.failed_target_for_teaching.is_empty() {
                        target.to_string()
                    } else {
                        self.failed_target_for_teaching.clone()
                    },
                    selector: selector.to_string(),
                    target: target.to_string(),
                    url: event
                        .get("url")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    state_key: self
                        .context
                        .as_ref()
                        .map(|c| c.state_key.clone())
                        .unwrap_or_default(),
                    scroll_y: event.get("scroll_y").and_then(Value::as_i64).unwrap_or(0),
                    timestamp: event
                        .get("created_at")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
            tokio::time::sleep(Duration::from_millis(700)).await;
        }
        None
    }

    /// Replay the stuck step with the freshly learned selector.
    async fn resume_after_learning(&mut self, selector: &str, target: &str) -> bool {
        let selector = selector.trim();
        if selector.is_empty() {
            return false;
        }
        let budget = Duration::from_millis(3500);
        if self.driver.wait_for_selector(selector, budget).await.is_err() {
            return false;
        }
        if self.driver.click_selector(selector, budget).await.is_err() {
            return false;
        }
        self.actions.push(format!(
            "cmd: playwright click selector:{selector} (learning-resume)"
        ));
        self.observations
            .push(format!("learning-resume clicked selector: {selector}"));
        self.ui_findings
            .push(format!("learning_resume=success target={target}"));
        true
    }

    // -----------------------------------------------------------------------
    // Observers and evidence
    // -----------------------------------------------------------------------

    /// Drain CDP events into console/network findings, stamped with the
    /// current step, and forward error-grade ones to the control agent so
    /// incident state survives the run.
    async fn pump_observers(&mut self) {
        for event in self.driver.drain_events().await {
            match event.method.as_str() {
                "Network.requestWillBeSent" => {
                    let id = event
                        .params
                        .pointer("/requestId")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let method = event
                        .params
                        .pointer("/request/method")
                        .and_then(Value::as_str)
                        .unwrap_or("GET")
                        .to_string();
                    if !id.is_empty() {
                        self.request_methods.insert(id, method);
                    }
                }
                "Network.responseReceived" => {
                    let status = event
                        .params
                        .pointer("/response/status")
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                    if status >= 400 {
                        let url = event
                            .params
                            .pointer("/response/url")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        let method = event
                            .params
                            .pointer("/requestId")
                            .and_then(Value::as_str)
                            .and_then(|id| self.request_methods.get(id))
                            .map(String::as_str)
                            .unwrap_or("GET");
                        self.network_findings.push(format!("{method} {url} {status}"));
                        self.registry
                            .post_event(
                                &self.session,
                                "network_error",
                                serde_json::json!({ "url": url, "status": status }),
                            )
                            .await;
                    }
                }
                "Network.loadingFailed" => {
                    let error_text = event
                        .params
                        .pointer("/errorText")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown");
                    // Benign teardown noise (aborted fetches on navigation)
                    // stays out of the findings.
                    if error_text != "net::ERR_ABORTED" {
                        let method = event
                            .params
                            .pointer("/requestId")
                            .and_then(Value::as_str)
                            .and_then(|id| self.request_methods.get(id))
                            .map(String::as_str)
                            .unwrap_or("GET");
                        self.network_findings
                            .push(format!("FAILED {method} request: {error_text}"));
                        self.registry
                            .post_event(
                                &self.session,
                                "network_error",
                                serde_json::json!({ "status": 0, "message": error_text }),
                            )
                            .await;
                    }
                }
                "Log.entryAdded" => {
                    let level = event
                        .params
                        .pointer("/entry/level")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if level == "error" {
                        let text = event
                            .params
                            .pointer("/entry/text")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        self.console_errors.push(text.clone());
                        self.registry
                            .post_event(
                                &self.session,
                                "console_error",
                                serde_json::json!({ "message": text }),
                            )
                            .await;
                    }
                }
                "Runtime.exceptionThrown" => {
                    let text = event
                        .params
                        .pointer("/exceptionDetails/exception/description")
                        .and_then(Value::as_str)
                        .or_else(|| {
                            event
                                .params
                                .pointer("/exceptionDetails/text")
                                .and_then(Value::as_str)
                        })
                        .unwrap_or("uncaught exception")
                        .to_string();
                    self.console_errors.push(text.clone());
                    self.registry
                        .post_event(
                            &self.session,
                            "page_error",
                            serde_json::json!({ "message": text }),
                        )
                        .await;
                }
                _ => {}
            }
        }
    }

    async fn observer_useful_events(&self) -> usize {
        match self.registry.request_state(&self.session).await {
            Ok(snapshot) => useful_event_count(&snapshot, self.cfg.noise_mode),
            Err(_) => 0,
        }
    }

    async fn install_overlays(&mut self, with_border: bool) {
        let title = self.driver.title().await;
        let state = overlay::top_bar_state(
            &self.session.session_id,
            &self.url,
            &title,
            &self.session.control_url().unwrap_or_default(),
            derive_control_color(ControlFlags {
                controlled: true,
                learning_active: false,
                incident_open: false,
                agent_online: true,
            }),
        );
        if let Err(err) = overlay::install_top_bar(&self.driver, &state).await {
            self.ui_findings
                .push(format!("visual overlay install failed; degraded mode: {err}"));
        }
        if self.opts.visual && self.opts.visual_cursor {
            let _ = overlay::install_visual_cursor(
                &self.driver,
                &self.opts.visual_color,
                self.opts.visual_scale,
                self.opts.visual_click_pulse,
            )
            .await;
        }
        if with_border {
            let _ = overlay::set_control_border(&self.driver, Some("blue")).await;
        }
    }

    /// Navigations wipe injected DOM; re-install when the markers are gone.
    async fn ensure_overlays(&mut self) {
        if !overlay::overlay_ready(&self.driver, self.opts.visual_cursor).await {
            self.install_overlays(self.control_enabled).await;
        }
    }

    async fn capture_timeout_evidence(&mut self, name: &str) {
        let path = self.evidence_file(name);
        if self.driver.screenshot_to_file(&path).await.is_ok() {
            self.push_evidence(&path);
        }
    }

    fn evidence_file(&self, name: &str) -> PathBuf {
        self.paths.evidence_dir().join(name)
    }

    fn push_evidence(&mut self, path: &Path) {
        let display = path
            .strip_prefix(std::env::current_dir().unwrap_or_default())
            .unwrap_or(path);
        self.evidence_paths.push(display.to_string_lossy().into_owned());
    }

    fn record_outcome(&mut self, outcome: StepOutcome) {
        self.outcomes.push(outcome);
    }

    fn ok_interactive_outcomes(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.step.is_interactive() && o.status == StepStatus::Ok)
            .count()
    }

    /// Failure classification for a broken run: anything that already
    /// landed keeps the run at `partial`; a run with zero ok interactive
    /// outcomes is `failed`.
    fn fail_or_partial(&self) -> RunResult {
        if self.ok_interactive_outcomes() > 0 {
            RunResult::Partial
        } else {
            RunResult::Failed
        }
    }

    async fn runtime_closed(&self) -> bool {
        self.driver.is_closed().await
    }

    async fn looks_authenticated(&self) -> bool {
        let probe = self.driver.probe_selector(".track-card").await;
        if probe.visible == Some(true) {
            return true;
        }
        for hint in [
            "cerrar sesion",
            "cerrar sesión",
            "logout",
            "sign out",
            "dashboard",
            "mi cuenta",
            "perfil",
        ] {
            if self.driver.probe_text(hint).await.present == Some(true) {
                return true;
            }
        }
        false
    }

    fn should_soft_skip_wait_timeout(&self, idx: usize, step: &WebStep) -> bool {
        if !self.opts.teaching || step.kind != StepKind::WaitText {
            return false;
        }
        if !step.target.to_lowercase().contains("now playing") {
            return false;
        }
        self.plan.iter().skip(idx).any(|later| {
            matches!(
                later.kind,
                StepKind::ClickSelector | StepKind::ClickText | StepKind::MaybeClickText
            ) && {
                let probe = format!("{later}").to_lowercase();
                probe.contains("stop") || probe.contains("#player-stop-btn")
            }
        })
    }

    // -----------------------------------------------------------------------
    // Finalisation
    // -----------------------------------------------------------------------

    /// Classify the result, release/close the session, and persist the
    /// report and status (status last). Never panics; late failures become
    /// findings.
    async fn finalize(mut self, status_path: &Path) -> RunReport {
        // Release control unless a handoff already did and wants the user
        // to keep it.
        if self.control_enabled {
            let _ = overlay::set_control_border(&self.driver, None).await;
            if !self.ui_findings.iter().any(|f| f == "control released") {
                self.ui_findings.push("control released".into());
            }
            let url = self.driver.current_url().await.ok();
            let title = self.driver.title().await;
            let _ = self
                .registry
                .mark_controlled(
                    &self.session.session_id,
                    false,
                    url.as_deref(),
                    Some(&title),
                )
                .await;
        }
        let _ = self
            .registry
            .set_current_run(&self.session.session_id, None);

        if self.opts.session_created_here && !self.opts.keep_open && !self.force_keep_open {
            let _ = overlay::destroy_top_bar(&self.driver).await;
            let _ = self.registry.close_session(&self.session.session_id).await;
        }

        for note in std::mem::take(&mut self.learning_notes) {
            self.observations.push(format!("learning: {note}"));
        }
        self.enforce_report_invariants();

        let steps_count = self.plan.len();
        let where_default = if self.watchdog.current_step_signature.is_empty() {
            "web-run".to_string()
        } else {
            self.watchdog.current_step_signature.clone()
        };
        self.enforce_verified_evidence();
        let result = finalize_result(
            self.result,
            self.force_keep_open,
            &self.console_errors,
            &self.network_findings,
            self.opts.verified,
            steps_count,
            &mut self.ui_findings,
            &where_default,
        );

        let report = RunReport {
            task_id: self.paths.run_id.clone(),
            goal: format!("web: {}", self.url),
            actions: self.actions.clone(),
            observations: self.observations.clone(),
            console_errors: self.console_errors.clone(),
            network_findings: self.network_findings.clone(),
            ui_findings: self.ui_findings.clone(),
            result,
            evidence_paths: self.evidence_paths.clone(),
        };

        if let Err(err) = write_json_atomic(&self.paths.report_path, &report) {
            tracing::error!(error = %err, "report write failed");
        }
        let status = StatusUpdate::completed(
            &self.paths.run_id,
            &self.paths.run_dir,
            &self.opts.task,
            &self.paths.report_path,
            result.as_str(),
        );
        if let Err(err) = warden_report::write_status(status_path, &status) {
            tracing::error!(error = %err, "status write failed");
        }
        report
    }

    /// Engine-authored entries are correct by construction; this is the
    /// belt-and-braces audit at finalisation: every action must match
    /// `cmd: ...` and every evidence path must resolve inside the run
    /// directory. Violations are dropped and recorded as guardrail
    /// findings rather than shipped.
    fn enforce_report_invariants(&mut self) {
        let before = self.actions.len();
        self.actions.retain(|action| {
            action
                .strip_prefix("cmd: ")
                .is_some_and(|rest| !rest.trim().is_empty())
        });
        if self.actions.len() != before {
            self.ui_findings
                .push("guardrail: dropped malformed action entries at finalisation".into());
        }

        let run_root = self
            .paths
            .run_dir
            .canonicalize()
            .unwrap_or_else(|_| self.paths.run_dir.clone());
        let mut dropped: Vec<String> = Vec::new();
        self.evidence_paths.retain(|raw| {
            let path = Path::new(raw);
            let resolved = if path.is_absolute() {
                path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
            } else {
                std::env::current_dir()
                    .map(|cwd| cwd.join(path))
                    .and_then(|p| p.canonicalize())
                    .unwrap_or_else(|_| path.to_path_buf())
            };
            let ok = resolved.starts_with(&run_root) || path.starts_with(&self.paths.run_dir);
            if !ok {
                dropped.push(raw.clone());
            }
            ok
        });
        for raw in dropped {
            self.ui_findings
                .push(format!("guardrail: dropped evidence path outside run dir: {raw}"));
        }
    }

    /// Under `--verified`, every ok interactive outcome must have non-empty
    /// before/after evidence on disk (P4).
    fn enforce_verified_evidence(&mut self) {
        if !self.opts.verified {
            return;
        }
        let mut missing = Vec::new();
        let mut step_num = 0usize;
        for outcome in &self.outcomes {
            if !outcome.step.is_interactive() {
                continue;
            }
            // Evidence numbering follows interactive attempts, including
            // ones that later failed; skipped steps never got a number.
            if outcome.status == StepStatus::Skipped {
                continue;
            }
            step_num += 1;
            if outcome.status != StepStatus::Ok {
                continue;
            }
            for phase in ["before", "after"] {
                let path = self.evidence_file(&format!("step_{step_num}_{phase}.png"));
                let ok = path
                    .metadata()
                    .map(|m| m.is_file() && m.len() > 0)
                    .unwrap_or(false);
                if !ok {
                    missing.push(format!("step_{step_num}_{phase}.png"));
                }
            }
        }
        if !missing.is_empty() {
            self.result = RunResult::Failed;
            self.ui_findings
                .push("what_failed=verified_evidence_missing".into());
            self.ui_findings
                .push(format!("where=evidence:{}", missing.join(",")));
            self.ui_findings
                .push("why_likely=screenshot capture failed around an interactive step".into());
            self.ui_findings.push("attempted=verified evidence audit".into());
            self.ui_findings
                .push("next_best_action=rerun without --verified or fix capture".into());
        }
    }
}
