//! Per-run watchdog: useful-progress tracking and stuck detection.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use warden_types::{BridgeConfig, NoiseMode};

/// Why the watchdog wants a handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckReason {
    /// Focus is iframe-locked past the iframe window with no progress.
    IframeFocus,
    /// Step signature unchanged, or no useful progress, past its window.
    Stuck,
}

/// Stuck thresholds, pulled from the bridge config.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    pub stuck_iframe: Duration,
    pub stuck_step: Duration,
    pub stuck_interactive: Duration,
}

impl From<&BridgeConfig> for WatchdogConfig {
    fn from(cfg: &BridgeConfig) -> Self {
        Self {
            stuck_iframe: cfg.stuck_iframe,
            stuck_step: cfg.stuck_step,
            stuck_interactive: cfg.stuck_interactive,
        }
    }
}

/// Mutable watchdog state, ticked by the engine.
#[derive(Debug, Clone)]
pub struct WatchdogState {
    pub current_step_signature: String,
    pub current_learning_target: String,
    last_step_change: Instant,
    last_progress_event: Instant,
    last_useful_events: usize,
}

impl Default for WatchdogState {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            current_step_signature: String::new(),
            current_learning_target: String::new(),
            last_step_change: now,
            last_progress_event: now,
            last_useful_events: 0,
        }
    }
}

impl WatchdogState {
    /// Move to a new step signature; a changed signature is itself
    /// progress.
    pub fn update_step_signature(&mut self, signature: &str, learning_target: &str) {
        if signature != self.current_step_signature {
            self.current_step_signature = signature.to_string();
            let now = Instant::now();
            self.last_step_change = now;
            self.last_progress_event = now;
        }
        self.current_learning_target = learning_target.to_string();
    }

    /// Mark useful progress: an action appended, a non-trivial finding, or
    /// a filtered DOM change.
    pub fn mark_progress(&mut self) {
        self.last_progress_event = Instant::now();
    }

    /// Fold in the observer's useful-event counter; growth is progress.
    pub fn poll_observer(&mut self, useful_event_count: usize) {
        if useful_event_count > self.last_useful_events {
            self.last_useful_events = useful_event_count;
            self.last_progress_event = Instant::now();
        }
    }

    pub fn seed_observer_baseline(&mut self, useful_event_count: usize) {
        self.last_useful_events = useful_event_count;
    }

    /// Evaluate the stuck predicates. `iframe_focus_locked` is the live
    /// probe result from the frame guard.
    pub fn evaluate(&self, cfg: &WatchdogConfig, iframe_focus_locked: bool) -> Option<StuckReason> {
        if self.current_step_signature.is_empty() {
            return None;
        }
        let now = Instant::now();
        let since_progress = now.duration_since(self.last_progress_event);
        let since_step_change = now.duration_since(self.last_step_change);

        if iframe_focus_locked && since_progress > cfg.stuck_iframe.max(Duration::from_millis(100)) {
            return Some(StuckReason::IframeFocus);
        }
        if since_step_change > cfg.stuck_step.max(Duration::from_millis(100)) {
            return Some(StuckReason::Stuck);
        }
        if since_progress > cfg.stuck_interactive.max(Duration::from_millis(100)) {
            return Some(StuckReason::Stuck);
        }
        None
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().duration_since(self.last_progress_event)
    }
}

/// Count useful events in an agent `/state` snapshot.
///
/// Clicks and error-grade findings always count. In `debug` noise mode,
/// scrolls and mouse moves count too (open question (b): resolved as the
/// full pointer-activity set); in `minimal` they never do, so manual
/// fidgeting during USER CONTROL cannot mask a stuck run.
pub fn useful_event_count(snapshot: &Value, noise_mode: NoiseMode) -> usize {
    let Some(events) = snapshot.get("recent_events").and_then(Value::as_array) else {
        return 0;
    };
    events
        .iter()
        .filter(|event| {
            let kind = event
                .get("kind")
                .and_then(Value::as_str)
                .unwrap_or_default();
            match kind {
                "click" | "manual_click" | "network_warn" | "network_error" | "console_error"
                | "page_error" => true,
                "scroll" | "mousemove" => noise_mode == NoiseMode::Debug,
                _ => false,
            }
        })
        .count()
}
