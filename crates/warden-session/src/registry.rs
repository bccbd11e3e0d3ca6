//! Session lifecycle: spawn, probe, refresh, close.
//!
//! Liveness is always derived, never trusted from disk: a session is alive
//! iff its browser pid responds, its CDP endpoint answers, and its control
//! agent pings. `status` and every attach recompute this before acting.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use warden_types::WardenError;

use crate::record::{
    acquire_lock, load_record, record_path, save_record, SessionRecord, SessionState,
};

const BROWSER_CANDIDATES: [&str; 4] = [
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
];

/// Registry over `runs/web_sessions/`.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    dir: PathBuf,
}

impl SessionRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Spawn a browser with a remote-debugging endpoint, start its control
    /// agent, and persist the record. Fails with a bootstrap error if either
    /// endpoint never comes up.
    pub async fn create_session(&self, initial_url: Option<&str>) -> Result<SessionRecord, WardenError> {
        std::fs::create_dir_all(&self.dir)?;
        let session_id = self.allocate_session_id()?;
        let session_dir = self.dir.join(&session_id);
        let user_data_dir = session_dir.join("user-data");
        std::fs::create_dir_all(&user_data_dir)?;

        let browser = find_browser_binary()
            .ok_or_else(|| WardenError::Bootstrap("no Chromium browser found in PATH".into()))?;
        let cdp_port = free_loopback_port()?;
        let start_url = initial_url.unwrap_or("about:blank");

        let stdout = std::fs::File::create(session_dir.join("browser_stdout.log"))?;
        let stderr = std::fs::File::create(session_dir.join("browser_stderr.log"))?;
        let child = std::process::Command::new(&browser)
            .arg(format!("--remote-debugging-port={cdp_port}"))
            .arg(format!("--user-data-dir={}", user_data_dir.display()))
            .arg("--new-window")
            .arg(start_url)
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| WardenError::Bootstrap(format!("browser spawn failed: {e}")))?;

        wait_for_cdp(cdp_port, Duration::from_secs(15)).await?;

        let now = Utc::now().to_rfc3339();
        let mut record = SessionRecord {
            session_id: session_id.clone(),
            pid: child.id() as i32,
            cdp_port,
            user_data_dir,
            browser_binary: browser,
            url: start_url.to_string(),
            title: String::new(),
            controlled: false,
            state: SessionState::Open,
            agent_pid: 0,
            control_port: 0,
            current_run_id: None,
            created_at: now.clone(),
            last_seen_at: now,
        };
        self.ensure_control_agent(&mut record).await?;
        save_record(&self.dir, &record)?;
        self.set_last_session_id(&session_id)?;
        tracing::info!(session_id = %session_id, cdp_port, "web session created");
        Ok(record)
    }

    fn allocate_session_id(&self) -> Result<String, WardenError> {
        let base = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        for attempt in 0..100u32 {
            let candidate = if attempt == 0 {
                base.clone()
            } else {
                format!("{base}-{attempt:02}")
            };
            if !record_path(&self.dir, &candidate).exists()
                && !self.dir.join(&candidate).exists()
            {
                std::fs::create_dir_all(self.dir.join(&candidate))?;
                return Ok(candidate);
            }
        }
        Err(WardenError::Session(
            "could not allocate unique session id".into(),
        ))
    }

    // -----------------------------------------------------------------------
    // Loading and liveness
    // -----------------------------------------------------------------------

    pub fn load(&self, session_id: &str) -> Result<SessionRecord, WardenError> {
        load_record(&self.dir, session_id)
    }

    /// Load and bring liveness/url/title up to date.
    pub async fn load_and_refresh(&self, session_id: &str) -> Result<SessionRecord, WardenError> {
        let record = self.load(session_id)?;
        self.refresh(record).await
    }

    /// `(pid alive) ∧ (cdp reachable)` — the browser half of liveness.
    pub async fn browser_alive(&self, record: &SessionRecord) -> bool {
        pid_alive(record.pid) && cdp_alive(record.cdp_port).await
    }

    /// Is the control agent responding on its port?
    pub async fn agent_online(&self, record: &SessionRecord) -> bool {
        if record.agent_pid <= 0 || record.control_port == 0 {
            return false;
        }
        pid_alive(record.agent_pid) && agent_ping(record.control_port).await
    }

    /// Recompute liveness, resync url/title from the primary CDP target,
    /// restart a dead control agent, and persist the updated record.
    pub async fn refresh(&self, mut record: SessionRecord) -> Result<SessionRecord, WardenError> {
        let alive = self.browser_alive(&record).await;
        if alive {
            record.state = SessionState::Open;
            if let Some(target) = cdp_primary_target(record.cdp_port).await {
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
            self.ensure_control_agent(&mut record).await?;
        } else {
            record.state = SessionState::Closed;
            record.controlled = false;
            record.agent_pid = 0;
            record.control_port = 0;
        }
        record.last_seen_at = Utc::now().to_rfc3339();
        save_record(&self.dir, &record)?;
        Ok(record)
    }

    /// Flip assistant control. A closed session can never be controlled.
    pub async fn mark_controlled(
        &self,
        session_id: &str,
        controlled: bool,
        url: Option<&str>,
        title: Option<&str>,
    ) -> Result<SessionRecord, WardenError> {
        let mut record = self.load_and_refresh(session_id).await?;
        record.controlled = controlled && record.state == SessionState::Open;
        if let Some(url) = url {
            record.url = url.to_string();
        }
        if let Some(title) = title {
            record.title = title.to_string();
        }
        record.last_seen_at = Utc::now().to_rfc3339();
        save_record(&self.dir, &record)?;
        Ok(record)
    }

    /// Record which run currently owns the attached page.
    pub fn set_current_run(
        &self,
        session_id: &str,
        run_id: Option<&str>,
    ) -> Result<(), WardenError> {
        let _lock = acquire_lock(&self.dir, session_id)?;
        let mut record = self.load(session_id)?;
        record.current_run_id = run_id.map(String::from);
        drop(_lock);
        save_record(&self.dir, &record)
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Terminate the browser (TERM, then KILL after a grace period), stop
    /// the agent, and persist the closed record.
    pub async fn close_session(&self, session_id: &str) -> Result<SessionRecord, WardenError> {
        let mut record = self.load_and_refresh(session_id).await?;
        if pid_alive(record.pid) {
            let _ = kill(Pid::from_raw(record.pid), Signal::SIGTERM);
            for _ in 0..20 {
                if !pid_alive(record.pid) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if pid_alive(record.pid) {
                let _ = kill(Pid::from_raw(record.pid), Signal::SIGKILL);
            }
        }
        if record.agent_pid > 0 && record.agent_pid != std::process::id() as i32 {
            let _ = kill(Pid::from_raw(record.agent_pid), Signal::SIGTERM);
        }
        record.state = SessionState::Closed;
        record.controlled = false;
        record.agent_pid = 0;
        record.control_port = 0;
        record.last_seen_at = Utc::now().to_rfc3339();
        save_record(&self.dir, &record)?;
        tracing::info!(session_id = %session_id, "web session closed");
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Control agent
    // -----------------------------------------------------------------------

    /// Spawn the control agent if it is not already online. The agent is
    /// this same binary re-invoked with the hidden `control-agent`
    /// subcommand, detached from the run's lifetime.
    pub async fn ensure_control_agent(&self, record: &mut SessionRecord) -> Result<(), WardenError> {
        if record.control_port > 0 && self.agent_online(record).await {
            return Ok(());
        }
        let control_port = free_loopback_port()?;
        let session_dir = self.dir.join(&record.session_id);
        std::fs::create_dir_all(&session_dir)?;
        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(session_dir.join("agent_stdout.log"))?;
        let stderr = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(session_dir.join("agent_stderr.log"))?;

        let exe = std::env::current_exe()
            .map_err(|e| WardenError::Session(format!("cannot locate own binary: {e}")))?;
        let child = std::process::Command::new(exe)
            .arg("control-agent")
            .arg("--session-id")
            .arg(&record.session_id)
            .arg("--port")
            .arg(control_port.to_string())
            .arg("--sessions-dir")
            .arg(&self.dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| WardenError::Session(format!("control agent spawn failed: {e}")))?;

        wait_for_agent(control_port, Duration::from_secs(8)).await?;
        record.control_port = control_port;
        record.agent_pid = child.id() as i32;
        Ok(())
    }

    /// Ask the agent for its `/state` snapshot.
    pub async fn request_state(&self, record: &SessionRecord) -> Result<Value, WardenError> {
        let url = record
            .control_url()
            .ok_or_else(|| WardenError::Session("session control agent offline".into()))?;
        let response = reqwest::Client::new()
            .get(format!("{url}/state"))
            .timeout(Duration::from_secs(4))
            .send()
            .await
            .map_err(|e| WardenError::Session(format!("agent state request failed: {e}")))?;
        response
            .json()
            .await
            .map_err(|e| WardenError::Session(format!("agent state payload invalid: {e}")))
    }

    /// Post an action (`refresh|release|close|ack`) to the agent.
    pub async fn request_action(
        &self,
        record: &SessionRecord,
        action: &str,
    ) -> Result<Value, WardenError> {
        let url = record
            .control_url()
            .ok_or_else(|| WardenError::Session("session control agent offline".into()))?;
        let response = reqwest::Client::new()
            .post(format!("{url}/action"))
            .json(&serde_json::json!({ "action": action }))
            .timeout(Duration::from_secs(4))
            .send()
            .await
            .map_err(|e| WardenError::Session(format!("agent action failed ({action}): {e}")))?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WardenError::Session(format!(
                "agent action failed ({action}): {body}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| WardenError::Session(format!("agent action payload invalid: {e}")))
    }

    /// Forward an engine-observed event (console/network/page error) to the
    /// agent so incident state stays coherent across runs. Best effort.
    pub async fn post_event(&self, record: &SessionRecord, kind: &str, payload: Value) {
        let Some(url) = record.control_url() else {
            return;
        };
        let _ = reqwest::Client::new()
            .post(format!("{url}/event"))
            .json(&serde_json::json!({ "kind": kind, "payload": payload }))
            .timeout(Duration::from_secs(2))
            .send()
            .await;
    }

    /// Notify the agent of a learning-window transition.
    pub async fn notify_learning_state(
        &self,
        record: &SessionRecord,
        active: bool,
        window: Duration,
    ) -> Result<(), WardenError> {
        let Some(url) = record.control_url() else {
            return Ok(());
        };
        let body = if active {
            serde_json::json!({ "type": "learning_on", "window_seconds": window.as_secs() })
        } else {
            serde_json::json!({ "type": "learning_off" })
        };
        let _ = reqwest::Client::new()
            .post(format!("{url}/event"))
            .json(&body)
            .timeout(Duration::from_secs(2))
            .send()
            .await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Last-session index
    // -----------------------------------------------------------------------

    pub fn set_last_session_id(&self, session_id: &str) -> Result<(), WardenError> {
        std::fs::create_dir_all(&self.dir)?;
        let tmp = self.dir.join(format!(".index.tmp-{}", std::process::id()));
        let body = serde_json::to_string_pretty(
            &serde_json::json!({ "last_session_id": session_id }),
        )?;
        std::fs::write(&tmp, body + "\n")?;
        std::fs::rename(tmp, self.dir.join("index.json"))?;
        Ok(())
    }

    pub fn last_session_id(&self) -> Option<String> {
        let raw = std::fs::read_to_string(self.dir.join("index.json")).ok()?;
        let value: Value = serde_json::from_str(&raw).ok()?;
        value
            .get("last_session_id")
            .and_then(Value::as_str)
            .map(String::from)
    }

    /// Resolve `last` to the most recent session id, pass anything else
    /// through.
    pub fn resolve_session_ref(&self, session_ref: &str) -> Result<String, WardenError> {
        if session_ref != "last" {
            return Ok(session_ref.to_string());
        }
        self.last_session_id()
            .ok_or_else(|| WardenError::Session("no previous web session recorded".into()))
    }
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

/// Signal-0 probe.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    kill(Pid::from_raw(pid), None).is_ok()
}

async fn http_ok(url: &str) -> bool {
    reqwest::Client::new()
        .get(url)
        .timeout(Duration::from_millis(1500))
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false)
}

pub async fn cdp_alive(port: u16) -> bool {
    http_ok(&format!("http://127.0.0.1:{port}/json/version")).await
}

pub async fn agent_ping(port: u16) -> bool {
    http_ok(&format!("http://127.0.0.1:{port}/health")).await
}

/// First `page`-type entry of the CDP target list.
pub async fn cdp_primary_target(port: u16) -> Option<Value> {
    let url = format!("http://127.0.0.1:{port}/json/list");
    let payload: Value = reqwest::Client::new()
        .get(&url)
        .timeout(Duration::from_millis(1500))
        .send()
        .await
        .ok()?
        .json()
        .await
        .ok()?;
    payload
        .as_array()?
        .iter()
        .find(|item| item.get("type").and_then(Value::as_str) == Some("page"))
        .cloned()
}

async fn wait_for_cdp(port: u16, budget: Duration) -> Result<(), WardenError> {
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if cdp_alive(port).await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    Err(WardenError::Bootstrap(format!(
        "timed out waiting for browser debugging endpoint on port {port}"
    )))
}

async fn wait_for_agent(port: u16, budget: Duration) -> Result<(), WardenError> {
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if agent_ping(port).await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    Err(WardenError::Session(format!(
        "timed out waiting for session control agent on port {port}"
    )))
}

fn free_loopback_port() -> Result<u16, WardenError> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

fn find_browser_binary() -> Option<String> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        for name in BROWSER_CANDIDATES {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(name.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_probe_rejects_nonsense() {
        assert!(!pid_alive(0));
        assert!(!pid_alive(-5));
        // Our own pid is alive by definition.
        assert!(pid_alive(std::process::id() as i32));
    }

    #[test]
    fn free_port_is_nonzero() {
        let port = free_loopback_port().unwrap();
        assert!(port > 0);
    }

    #[test]
    fn last_session_index_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path());
        assert!(registry.last_session_id().is_none());
        registry.set_last_session_id("20250101-000000").unwrap();
        assert_eq!(
            registry.last_session_id().as_deref(),
            Some("20250101-000000")
        );
        assert_eq!(
            registry.resolve_session_ref("last").unwrap(),
            "20250101-000000"
        );
        assert_eq!(registry.resolve_session_ref("abc").unwrap(), "abc");
    }

    #[test]
    fn resolve_last_without_index_errors() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path());
        assert!(registry.resolve_session_ref("last").is_err());
    }
}
