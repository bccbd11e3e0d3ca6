//! `live` and `watch`: stream observer events from a session's control
//! agent. Both consume only `GET /state` snapshots.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use warden_report::RunStore;
use warden_session::{SessionRegistry, SessionState};
use warden_types::WardenError;

const POLL_INTERVAL: Duration = Duration::from_millis(1500);

/// Stream every event with its severity until the session closes or the
/// user interrupts.
pub async fn live_command(session_ref: &str) -> anyhow::Result<()> {
    stream_events(session_ref, None, false, false).await
}

/// Like `live`, filtered to warn/error, with optional since-last cursor and
/// terminal-bell notification.
pub async fn watch_command(
    session_ref: &str,
    only: Option<&str>,
    since_last: bool,
    notify: bool,
) -> anyhow::Result<()> {
    stream_events(session_ref, only, since_last, notify).await
}

async fn stream_events(
    session_ref: &str,
    only: Option<&str>,
    since_last: bool,
    notify: bool,
) -> anyhow::Result<()> {
    let store = RunStore::default_location();
    let registry = SessionRegistry::new(store.sessions_dir());
    let session_id = registry.resolve_session_ref(session_ref)?;
    let mut session = registry.load_and_refresh(&session_id).await?;
    if session.state != SessionState::Open {
        return Err(WardenError::Session(format!(
            "session {session_id} is closed; run web-open first"
        ))
        .into());
    }

    let cursor_path = cursor_path(&store, &session_id);
    let mut last_seen = if since_last {
        std::fs::read_to_string(&cursor_path).unwrap_or_default()
    } else {
        String::new()
    };
    let mut seen: HashSet<String> = HashSet::new();

    eprintln!("watching session {session_id} (ctrl-c to stop)");
    loop {
        if !registry.agent_online(&session).await {
            eprintln!("control agent offline; stopping");
            break;
        }
        let snapshot = match registry.request_state(&session).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                eprintln!("state poll failed: {err}");
                break;
            }
        };
        let events = snapshot
            .get("recent_events")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for event in &events {
            let created_at = event
                .get("created_at")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let kind = event.get("kind").and_then(Value::as_str).unwrap_or("?");
            let severity = event
                .get("severity")
                .and_then(Value::as_str)
                .unwrap_or("info");
            let key = format!("{created_at}|{kind}");
            if !seen.insert(key) {
                continue;
            }
            if !last_seen.is_empty() && created_at <= last_seen.as_str() {
                continue;
            }
            if let Some(filter) = only {
                if severity != filter {
                    continue;
                }
            }
            let detail = event
                .get("message")
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty())
                .or_else(|| event.get("selector").and_then(Value::as_str))
                .or_else(|| event.get("url").and_then(Value::as_str))
                .unwrap_or("");
            println!("{created_at} [{severity}] {kind} {detail}");
            if notify && matches!(severity, "warn" | "error") {
                // Terminal bell; terminal emulators map this to a visual or
                // audible alert.
                print!("\x07");
            }
            if created_at > last_seen.as_str() {
                last_seen = created_at.to_string();
            }
        }
        if since_last && !last_seen.is_empty() {
            let _ = std::fs::write(&cursor_path, &last_seen);
        }

        tokio::time::sleep(POLL_INTERVAL).await;
        session = match registry.load_and_refresh(&session_id).await {
            Ok(refreshed) if refreshed.state == SessionState::Open => refreshed,
            _ => {
                eprintln!("session closed; stopping");
                break;
            }
        };
    }
    Ok(())
}

fn cursor_path(store: &RunStore, session_id: &str) -> PathBuf {
    store
        .sessions_dir()
        .join(format!(".watch-cursor-{session_id}"))
}
