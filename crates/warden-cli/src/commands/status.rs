//! `status` and `logs`.

use serde_json::json;
use warden_report::{read_status, tail_lines, RunStore};
use warden_session::{SessionRegistry, SessionState};
use warden_types::WardenError;

/// Latest run status plus a refreshed view of the last web session.
pub async fn status_command() -> anyhow::Result<()> {
    let store = RunStore::default_location();
    let mut payload = match read_status(&store.status_path())? {
        Some(status) => serde_json::to_value(status)?,
        None => json!({ "status": "no-runs" }),
    };

    let registry = SessionRegistry::new(store.sessions_dir());
    if let Some(session_id) = registry.last_session_id() {
        // Liveness is recomputed before reporting; a dead browser shows up
        // as closed here, never as a stale "open".
        if let Ok(session) = registry.load_and_refresh(&session_id).await {
            payload["web_session"] = json!({
                "session_id": session.session_id,
                "url": session.url,
                "title": session.title,
                "controlled": session.controlled,
                "state": session.state,
                "last_seen_at": session.last_seen_at,
            });
            if session.state == SessionState::Open && registry.agent_online(&session).await {
                if let Ok(agent_state) = registry.request_state(&session).await {
                    for key in ["color", "label", "incident_open", "learning_active"] {
                        if let Some(value) = agent_state.get(key) {
                            payload["web_session"][key] = value.clone();
                        }
                    }
                }
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

/// Tail the three logs of the latest run.
pub fn logs_command(tail: usize) -> anyhow::Result<()> {
    let store = RunStore::default_location();
    let status = read_status(&store.status_path())?
        .ok_or_else(|| WardenError::InvalidArgs("no runs available yet".into()))?;
    let run_dir = status.run_dir;
    let mut lines: Vec<String> = Vec::new();
    for name in ["bridge.log", "oi_stdout.log", "oi_stderr.log"] {
        lines.extend(tail_lines(&run_dir.join(name), tail));
    }
    println!("{}", lines.join("\n"));
    Ok(())
}
