//! Control-agent HTTP surface: health, event ingestion, incident ack, and
//! the release/ack color transitions, against a real loopback server with a
//! synthetic session record (no browser attached).

use std::time::Duration;

use serde_json::json;
use warden_session::record::{save_record, SessionRecord, SessionState};
use warden_session::run_control_agent;

fn free_port() -> u16 {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn synthetic_record(dir: &std::path::Path, session_id: &str, port: u16) {
    let record = SessionRecord {
        session_id: session_id.into(),
        // Our own pid is alive, but the CDP port is closed, so the agent
        // reports the session as closed without a browser to talk to.
        pid: std::process::id() as i32,
        cdp_port: free_port(),
        user_data_dir: dir.join("user-data"),
        browser_binary: "chromium".into(),
        url: "http://localhost:5173/".into(),
        title: "App".into(),
        controlled: false,
        state: SessionState::Open,
        agent_pid: 0,
        control_port: port,
        current_run_id: None,
        created_at: "2025-01-01T00:00:00Z".into(),
        last_seen_at: "2025-01-01T00:00:00Z".into(),
    };
    save_record(dir, &record).unwrap();
}

async fn wait_for_health(client: &reqwest::Client, base: &str) {
    for _ in 0..50 {
        if client
            .get(format!("{base}/health"))
            .timeout(Duration::from_millis(300))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("control agent never became healthy");
}

#[tokio::test]
async fn agent_serves_state_events_and_ack() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    synthetic_record(dir.path(), "test-session", port);

    let sessions_dir = dir.path().to_path_buf();
    let server = tokio::spawn(async move {
        let _ = run_control_agent(sessions_dir, "test-session".into(), port).await;
    });

    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{port}");
    wait_for_health(&client, &base).await;

    // Health carries the session id.
    let health: serde_json::Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["session_id"], "test-session");

    // Initial state: no incident, gray (agent online but session closed,
    // since no browser answers on the CDP port).
    let state: serde_json::Value = client
        .get(format!("{base}/state"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(state["incident_open"], false);
    assert_eq!(state["agent_online"], true);

    // A console error opens an incident and turns the state red.
    let resp = client
        .post(format!("{base}/event"))
        .json(&json!({"kind": "console_error", "payload": {"message": "TypeError: boom"}}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let state: serde_json::Value = client
        .get(format!("{base}/state"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(state["incident_open"], true);
    assert_eq!(state["color"], "red");
    assert_eq!(state["error_count"], 1);
    assert!(state["last_error"]
        .as_str()
        .unwrap()
        .contains("TypeError"));

    // Ack clears the incident and bumps the counter.
    let ack: serde_json::Value = client
        .post(format!("{base}/action"))
        .json(&json!({"action": "ack"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ack["ok"], true);
    assert_eq!(ack["state"]["incident_open"], false);
    assert_eq!(ack["state"]["ack_count"], 1);

    // Unknown actions are rejected.
    let resp = client
        .post(format!("{base}/action"))
        .json(&json!({"action": "explode"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    // Learning window toggles are visible in the snapshot.
    client
        .post(format!("{base}/event"))
        .json(&json!({"kind": "learning_on", "payload": {"window_seconds": 30}}))
        .send()
        .await
        .unwrap();
    let state: serde_json::Value = client
        .get(format!("{base}/state"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(state["learning_active"], true);

    server.abort();
}

#[tokio::test]
async fn release_action_retains_open_incident() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    synthetic_record(dir.path(), "release-session", port);

    let sessions_dir = dir.path().to_path_buf();
    let server = tokio::spawn(async move {
        let _ = run_control_agent(sessions_dir, "release-session".into(), port).await;
    });

    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{port}");
    wait_for_health(&client, &base).await;

    client
        .post(format!("{base}/event"))
        .json(&json!({"kind": "page_error", "payload": {"message": "crash"}}))
        .send()
        .await
        .unwrap();

    let release: serde_json::Value = client
        .post(format!("{base}/action"))
        .json(&json!({"action": "release"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(release["ok"], true);
    // Release clears control but never the incident; only ack does.
    assert_eq!(release["state"]["controlled"], false);
    assert_eq!(release["state"]["incident_open"], true);
    assert_eq!(release["state"]["color"], "red");

    server.abort();
}
