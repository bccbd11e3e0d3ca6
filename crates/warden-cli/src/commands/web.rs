//! `web-open` / `web-release` / `web-close`.

use serde_json::json;
use warden_report::RunStore;
use warden_session::{SessionRegistry, SessionState};

fn registry() -> SessionRegistry {
    SessionRegistry::new(RunStore::default_location().sessions_dir())
}

/// Reuse the last live session or create a fresh one.
pub async fn web_open(url: Option<&str>) -> anyhow::Result<()> {
    let registry = registry();
    let session = match registry.last_session_id() {
        Some(last) => match registry.load_and_refresh(&last).await {
            Ok(existing) if existing.state == SessionState::Open => existing,
            _ => registry.create_session(url).await?,
        },
        None => registry.create_session(url).await?,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "session_id": session.session_id,
            "url": session.url,
            "title": session.title,
            "controlled": session.controlled,
            "state": session.state,
        }))?
    );
    Ok(())
}

/// Release assistant control. An open incident is retained; only `ack`
/// clears it.
pub async fn web_release(session_ref: &str) -> anyhow::Result<()> {
    let registry = registry();
    let session_id = registry.resolve_session_ref(session_ref)?;
    let session = registry.load_and_refresh(&session_id).await?;
    if registry.agent_online(&session).await {
        // The agent updates the record and the overlay picks the change up
        // on its next state poll.
        let _ = registry.request_action(&session, "release").await?;
    } else {
        registry
            .mark_controlled(&session_id, false, None, None)
            .await?;
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "session_id": session_id,
            "controlled": false,
            "result": "released",
        }))?
    );
    Ok(())
}

/// Close the browser and stop the control agent.
pub async fn web_close(session_ref: &str) -> anyhow::Result<()> {
    let registry = registry();
    let session_id = registry.resolve_session_ref(session_ref)?;
    let session = registry.load_and_refresh(&session_id).await?;
    if registry.agent_online(&session).await {
        let _ = registry.request_action(&session, "close").await;
    }
    // Direct close as well: covers a dead agent and makes the command
    // idempotent.
    let closed = registry.close_session(&session_id).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "session_id": closed.session_id,
            "controlled": false,
            "state": closed.state,
        }))?
    );
    Ok(())
}
