//! Loopback control agent.
//!
//! One agent process per session, serving the overlay's buttons and the
//! observer event stream over plain HTTP on 127.0.0.1. The agent owns the
//! in-memory incident/ack/learning state; the session record on disk stays
//! the source of truth for identity and liveness. The top bar polls
//! `GET /state`, so releasing or acking becomes visible within one poll
//! cycle without any push channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use warden_types::{derive_control_color, ControlFlags, NoiseMode, WardenError};

use crate::record::{SessionRecord, SessionState};
use crate::registry::SessionRegistry;

const EVENT_BUFFER: usize = 120;
const RECENT_EVENTS: usize = 12;

/// One observed event, post-noise-filter.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ObservedEvent {
    pub kind: String,
    pub severity: String,
    pub message: String,
    pub url: String,
    pub status: i64,
    pub target: String,
    pub selector: String,
    pub text: String,
    pub x: i64,
    pub y: i64,
    pub scroll_y: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    pub created_at: String,
}

/// In-memory agent state: bounded event ring, incident flag, ack counters,
/// learning window.
pub struct AgentRuntime {
    noise_mode: NoiseMode,
    events: VecDeque<ObservedEvent>,
    incident_open: bool,
    last_error: String,
    error_count: u64,
    ack_count: u64,
    last_ack_at: String,
    last_ack_by: String,
    learning_until: Option<Instant>,
}

impl AgentRuntime {
    pub fn new(noise_mode: NoiseMode) -> Self {
        Self {
            noise_mode,
            events: VecDeque::with_capacity(EVENT_BUFFER),
            incident_open: false,
            last_error: String::new(),
            error_count: 0,
            ack_count: 0,
            last_ack_at: String::new(),
            last_ack_by: String::new(),
            learning_until: None,
        }
    }

    /// Ingest one `/event` body: `{kind, step, payload, ts}` (a legacy
    /// flat `type` field is tolerated).
    pub fn record_event(&mut self, body: &Value) {
        let kind = body
            .get("kind")
            .or_else(|| body.get("type"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .trim()
            .to_lowercase();
        let payload = body.get("payload").cloned().unwrap_or_else(|| body.clone());

        match kind.as_str() {
            "learning_on" => {
                let seconds = payload
                    .get("window_seconds")
                    .or_else(|| body.get("window_seconds"))
                    .and_then(Value::as_f64)
                    .unwrap_or(25.0)
                    .clamp(1.0, 600.0);
                self.set_learning_active(Duration::from_secs_f64(seconds));
                return;
            }
            "learning_off" => {
                self.set_learning_inactive();
                return;
            }
            _ => {}
        }

        let controlled = payload
            .get("controlled")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let learning = payload
            .get("learning_active")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || self.learning_active();
        if self.noise_mode == NoiseMode::Minimal
            && !controlled
            && !learning
            && matches!(kind.as_str(), "click" | "mousemove" | "scroll")
        {
            return;
        }

        let message = text_field(&payload, "message", 400);
        let status = payload.get("status").and_then(Value::as_i64).unwrap_or(0);
        let severity = event_severity(&kind, status, &message);
        let event = ObservedEvent {
            severity: severity.to_string(),
            message,
            url: text_field(&payload, "url", 300),
            status,
            target: text_field(&payload, "target", 180),
            selector: text_field(&payload, "selector", 240),
            text: text_field(&payload, "text", 240),
            x: payload.get("x").and_then(Value::as_i64).unwrap_or(0),
            y: payload.get("y").and_then(Value::as_i64).unwrap_or(0),
            scroll_y: payload.get("scroll_y").and_then(Value::as_i64).unwrap_or(0),
            step: body
                .get("step")
                .and_then(Value::as_u64)
                .map(|s| s as usize),
            created_at: Utc::now().to_rfc3339(),
            kind,
        };

        if event.severity == "error" {
            self.incident_open = true;
            self.error_count += 1;
            let reason = if !event.message.is_empty() {
                event.message.clone()
            } else if !event.url.is_empty() {
                event.url.clone()
            } else {
                event.kind.clone()
            };
            self.last_error = reason.chars().take(220).collect();
        }
        if self.events.len() >= EVENT_BUFFER {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn set_learning_active(&mut self, window: Duration) {
        self.learning_until = Some(Instant::now() + window);
    }

    pub fn set_learning_inactive(&mut self) {
        self.learning_until = None;
    }

    pub fn learning_active(&self) -> bool {
        self.learning_until.is_some_and(|until| Instant::now() < until)
    }

    pub fn acknowledge_incident(&mut self, actor: &str) {
        self.incident_open = false;
        self.last_error.clear();
        self.ack_count += 1;
        self.last_ack_at = Utc::now().to_rfc3339();
        self.last_ack_by = actor.chars().take(40).collect();
    }

    pub fn incident_open(&self) -> bool {
        self.incident_open
    }

    /// Observer-state portion of the `/state` payload.
    pub fn snapshot(&self) -> Value {
        let recent: Vec<&ObservedEvent> = self
            .events
            .iter()
            .rev()
            .take(RECENT_EVENTS)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        json!({
            "incident_open": self.incident_open,
            "last_error": self.last_error,
            "error_count": self.error_count,
            "ack_count": self.ack_count,
            "last_ack_at": self.last_ack_at,
            "last_ack_by": self.last_ack_by,
            "learning_active": self.learning_active(),
            "observer_noise_mode": self.noise_mode.as_str(),
            "last_event_at": recent.last().map(|e| e.created_at.clone()).unwrap_or_default(),
            "recent_events": recent,
        })
    }
}

/// Severity ladder for observed events.
///
/// 4xx network responses are usually auth/input flow noise; 5xx and status 0
/// are service failures. A couple of notorious console messages are demoted
/// to warnings so they do not open incidents.
fn event_severity(kind: &str, status: i64, message: &str) -> &'static str {
    let low = message.to_lowercase();
    match kind {
        "click" | "mousemove" | "scroll" | "manual_click" => "info",
        "network_warn" | "console_warn" => "warn",
        "network_error" => {
            if status == 0 || status >= 500 {
                "error"
            } else {
                "warn"
            }
        }
        "console_error" | "page_error" => {
            if low.contains("resizeobserver loop limit exceeded")
                || (low.contains("favicon.ico") && low.contains("404"))
            {
                "warn"
            } else {
                "error"
            }
        }
        _ => "warn",
    }
}

fn text_field(payload: &Value, key: &str, max: usize) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .chars()
        .take(max)
        .collect()
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

struct AgentState {
    runtime: Mutex<AgentRuntime>,
    registry: SessionRegistry,
    session_id: String,
    port: u16,
    shutdown_tx: watch::Sender<bool>,
}

impl AgentState {
    /// Refresh the record without spawning a second agent: this process IS
    /// the agent, so the agent fields are pinned to ourselves.
    async fn refreshed_record(&self) -> Result<SessionRecord, WardenError> {
        let mut record = self.registry.load(&self.session_id)?;
        if self.registry.browser_alive(&record).await {
            record.state = SessionState::Open;
            if let Some(target) =
                crate::registry::cdp_primary_target(record.cdp_port).await
            {
                if let Some(url) = target.get("url").and_then(Value::as_str) {
                    if !url.is_empty() {
                        record.url = url.to_string();
                    }
                }
                record.title = target
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
            }
        } else {
            record.state = SessionState::Closed;
            record.controlled = false;
        }
        record.agent_pid = std::process::id() as i32;
        record.control_port = self.port;
        record.last_seen_at = Utc::now().to_rfc3339();
        crate::record::save_record(self.registry.dir(), &record)?;
        Ok(record)
    }

    async fn state_payload(&self, record: &SessionRecord) -> Value {
        let runtime = self.runtime.lock().await;
        let flags = ControlFlags {
            controlled: record.controlled,
            learning_active: runtime.learning_active(),
            incident_open: runtime.incident_open(),
            agent_online: record.state == SessionState::Open,
        };
        let color = derive_control_color(flags);
        let mut payload = json!({
            "session_id": record.session_id,
            "state": record.state,
            "url": record.url,
            "title": record.title,
            "controlled": record.controlled,
            "agent_online": true,
            "control_port": self.port,
            "control_url": format!("http://127.0.0.1:{}", self.port),
            "color": color.as_str(),
            "label": color.label(),
            "last_seen_at": record.last_seen_at,
            "updated_at_utc": Utc::now().to_rfc3339(),
        });
        if let (Value::Object(base), Value::Object(extra)) =
            (&mut payload, runtime.snapshot())
        {
            base.extend(extra);
        }
        payload
    }
}

/// Serve the control agent until a `close` action arrives. Blocks.
pub async fn run_control_agent(
    sessions_dir: std::path::PathBuf,
    session_id: String,
    port: u16,
) -> Result<(), WardenError> {
    let noise_mode = std::env::var("BRIDGE_OBSERVER_NOISE_MODE")
        .map(|raw| NoiseMode::from_env_value(&raw))
        .unwrap_or_default();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let state = Arc::new(AgentState {
        runtime: Mutex::new(AgentRuntime::new(noise_mode)),
        registry: SessionRegistry::new(sessions_dir),
        session_id,
        port,
        shutdown_tx,
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/state", get(state_handler))
        .route("/event", post(event_handler))
        .route("/action", post(action_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| WardenError::Session(format!("agent bind failed on port {port}: {e}")))?;
    tracing::info!(port, "control agent listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|&done| done).await;
        })
        .await
        .map_err(|e| WardenError::Session(format!("control agent server error: {e}")))
}

async fn health_handler(State(state): State<Arc<AgentState>>) -> impl IntoResponse {
    Json(json!({ "ok": true, "session_id": state.session_id }))
}

async fn state_handler(State(state): State<Arc<AgentState>>) -> impl IntoResponse {
    match state.refreshed_record().await {
        Ok(record) => {
            let payload = state.state_payload(&record).await;
            (StatusCode::OK, Json(payload))
        }
        Err(err) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": err.to_string() })),
        ),
    }
}

async fn event_handler(
    State(state): State<Arc<AgentState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    if !body.is_object() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_event_payload" })),
        );
    }
    state.runtime.lock().await.record_event(&body);
    (StatusCode::OK, Json(json!({ "ok": true })))
}

async fn action_handler(
    State(state): State<Arc<AgentState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let action = body
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_lowercase();

    let result = match action.as_str() {
        "refresh" => state.refreshed_record().await,
        "ack" => {
            state.runtime.lock().await.acknowledge_incident("operator");
            state.refreshed_record().await
        }
        "release" => {
            // Release clears control and the learning window; an open
            // incident is retained until explicitly acked.
            state.runtime.lock().await.set_learning_inactive();
            state
                .registry
                .mark_controlled(&state.session_id, false, None, None)
                .await
        }
        "close" => state.registry.close_session(&state.session_id).await,
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unsupported action: {other}") })),
            );
        }
    };

    match result {
        Ok(record) => {
            let snapshot = state.state_payload(&record).await;
            if action == "close" {
                let _ = state.shutdown_tx.send(true);
            }
            (StatusCode::OK, Json(json!({ "ok": true, "state": snapshot })))
        }
        Err(err) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": err.to_string() })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn click_event(selector: &str, controlled: bool) -> Value {
        json!({
            "kind": "click",
            "payload": {
                "selector": selector,
                "target": "Stop",
                "url": "http://localhost:5173/catalog",
                "controlled": controlled,
            }
        })
    }

    #[test]
    fn minimal_mode_drops_uncontrolled_clicks() {
        let mut runtime = AgentRuntime::new(NoiseMode::Minimal);
        runtime.record_event(&click_event("#player-stop-btn", false));
        assert_eq!(runtime.snapshot()["recent_events"].as_array().unwrap().len(), 0);

        // Controlled clicks survive the filter.
        runtime.record_event(&click_event("#player-stop-btn", true));
        assert_eq!(runtime.snapshot()["recent_events"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn learning_window_admits_manual_clicks() {
        let mut runtime = AgentRuntime::new(NoiseMode::Minimal);
        runtime.set_learning_active(Duration::from_secs(30));
        runtime.record_event(&click_event("#player-stop-btn", false));
        let snap = runtime.snapshot();
        assert_eq!(snap["recent_events"].as_array().unwrap().len(), 1);
        assert_eq!(snap["learning_active"], true);
    }

    #[test]
    fn debug_mode_keeps_noise() {
        let mut runtime = AgentRuntime::new(NoiseMode::Debug);
        runtime.record_event(&json!({"kind": "scroll", "payload": {"scroll_y": 120}}));
        runtime.record_event(&json!({"kind": "mousemove", "payload": {"x": 4, "y": 5}}));
        assert_eq!(runtime.snapshot()["recent_events"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn error_events_open_incident_until_ack() {
        let mut runtime = AgentRuntime::new(NoiseMode::Minimal);
        runtime.record_event(&json!({
            "kind": "console_error",
            "payload": {"message": "TypeError: x is undefined"}
        }));
        assert!(runtime.incident_open());
        assert_eq!(runtime.snapshot()["error_count"], 1);

        runtime.acknowledge_incident("operator");
        assert!(!runtime.incident_open());
        assert_eq!(runtime.snapshot()["ack_count"], 1);
        assert_eq!(runtime.snapshot()["last_error"], "");
    }

    #[test]
    fn severity_ladder() {
        assert_eq!(event_severity("click", 0, ""), "info");
        assert_eq!(event_severity("network_error", 404, ""), "warn");
        assert_eq!(event_severity("network_error", 500, ""), "error");
        assert_eq!(event_severity("network_error", 0, ""), "error");
        assert_eq!(event_severity("console_error", 0, "boom"), "error");
        assert_eq!(
            event_severity("console_error", 0, "ResizeObserver loop limit exceeded"),
            "warn"
        );
        assert_eq!(
            event_severity("console_error", 0, "favicon.ico 404 not found"),
            "warn"
        );
        assert_eq!(event_severity("whatever", 0, ""), "warn");
    }

    #[test]
    fn learning_on_off_via_events() {
        let mut runtime = AgentRuntime::new(NoiseMode::Minimal);
        runtime.record_event(&json!({"kind": "learning_on", "payload": {"window_seconds": 10}}));
        assert!(runtime.learning_active());
        runtime.record_event(&json!({"kind": "learning_off"}));
        assert!(!runtime.learning_active());
    }

    #[test]
    fn event_ring_is_bounded() {
        let mut runtime = AgentRuntime::new(NoiseMode::Debug);
        for i in 0..200 {
            runtime.record_event(&json!({
                "kind": "console_warn",
                "payload": {"message": format!("warn {i}")}
            }));
        }
        assert!(runtime.events.len() <= EVENT_BUFFER);
        let snap = runtime.snapshot();
        let recent = snap["recent_events"].as_array().unwrap();
        assert_eq!(recent.len(), RECENT_EVENTS);
        assert_eq!(recent.last().unwrap()["message"], "warn 199");
    }

    #[test]
    fn legacy_type_field_accepted() {
        let mut runtime = AgentRuntime::new(NoiseMode::Minimal);
        runtime.record_event(&json!({"type": "page_error", "message": "old shape"}));
        assert!(runtime.incident_open());
    }
}
