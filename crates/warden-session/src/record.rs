//! Session records persisted under `runs/web_sessions/`.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use warden_types::WardenError;

/// Lifecycle of a persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Open,
    Closed,
}

/// One persistent browser session.
///
/// `current_run_id` breaks the session↔run cycle by index: the run stores
/// `attach_session_id`, the session stores the run id, and resolution goes
/// through the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    /// Browser process id.
    pub pid: i32,
    /// Remote-debugging port.
    pub cdp_port: u16,
    pub user_data_dir: PathBuf,
    pub browser_binary: String,
    pub url: String,
    pub title: String,
    pub controlled: bool,
    pub state: SessionState,
    /// Control-agent process id; 0 when offline.
    #[serde(default)]
    pub agent_pid: i32,
    /// Control-agent loopback port; 0 when offline.
    #[serde(default)]
    pub control_port: u16,
    #[serde(default)]
    pub current_run_id: Option<String>,
    pub created_at: String,
    pub last_seen_at: String,
}

impl SessionRecord {
    pub fn control_url(&self) -> Option<String> {
        (self.control_port > 0).then(|| format!("http://127.0.0.1:{}", self.control_port))
    }

    pub fn cdp_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.cdp_port)
    }
}

/// Atomically rewrite a session record while holding its advisory lock.
///
/// The lock file sits next to the record so concurrent CLIs (a `web-run`
/// attaching while `status` refreshes liveness) serialize their rewrites.
pub fn save_record(dir: &Path, record: &SessionRecord) -> Result<(), WardenError> {
    fs::create_dir_all(dir)?;
    let _lock = acquire_lock(dir, &record.session_id)?;
    let path = record_path(dir, &record.session_id);
    let tmp = dir.join(format!(".{}.tmp-{}", record.session_id, std::process::id()));
    let mut body = serde_json::to_string_pretty(record)?;
    body.push('\n');
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a session record by id.
pub fn load_record(dir: &Path, session_id: &str) -> Result<SessionRecord, WardenError> {
    let path = record_path(dir, session_id);
    if !path.exists() {
        return Err(WardenError::Session(format!(
            "unknown session_id: {session_id}"
        )));
    }
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn record_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{session_id}.json"))
}

/// Exclusive advisory lock for one session id. Released on drop.
pub fn acquire_lock(dir: &Path, session_id: &str) -> Result<SessionLock, WardenError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!(".{session_id}.lock"));
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)?;
    file.lock_exclusive()?;
    Ok(SessionLock { file })
}

/// Held advisory lock; unlocking happens on drop.
pub struct SessionLock {
    file: File,
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(session_id: &str) -> SessionRecord {
        SessionRecord {
            session_id: session_id.into(),
            pid: 4242,
            cdp_port: 9222,
            user_data_dir: PathBuf::from("/tmp/profile"),
            browser_binary: "chromium".into(),
            url: "about:blank".into(),
            title: String::new(),
            controlled: false,
            state: SessionState::Open,
            agent_pid: 0,
            control_port: 0,
            current_run_id: None,
            created_at: "2025-01-01T00:00:00Z".into(),
            last_seen_at: "2025-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let record = sample("20250101-000000");
        save_record(dir.path(), &record).unwrap();
        let loaded = load_record(dir.path(), "20250101-000000").unwrap();
        assert_eq!(loaded.session_id, record.session_id);
        assert_eq!(loaded.state, SessionState::Open);
        assert_eq!(loaded.control_url(), None);
    }

    #[test]
    fn unknown_session_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_record(dir.path(), "nope").unwrap_err();
        assert!(err.to_string().contains("unknown session_id"));
    }

    #[test]
    fn tolerates_records_missing_agent_fields() {
        // Records written before the control agent existed have no
        // agent_pid/control_port; defaults keep them loadable.
        let dir = tempfile::tempdir().unwrap();
        let raw = serde_json::json!({
            "session_id": "old",
            "pid": 1,
            "cdp_port": 9222,
            "user_data_dir": "/tmp/p",
            "browser_binary": "chromium",
            "url": "about:blank",
            "title": "",
            "controlled": false,
            "state": "open",
            "created_at": "2025-01-01T00:00:00Z",
            "last_seen_at": "2025-01-01T00:00:00Z"
        });
        fs::write(
            record_path(dir.path(), "old"),
            serde_json::to_string(&raw).unwrap(),
        )
        .unwrap();
        let loaded = load_record(dir.path(), "old").unwrap();
        assert_eq!(loaded.agent_pid, 0);
        assert_eq!(loaded.control_port, 0);
    }

    #[test]
    fn lock_is_reentrant_across_drops() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _lock = acquire_lock(dir.path(), "s1").unwrap();
        }
        // Released on drop; a second acquisition must not deadlock.
        let _again = acquire_lock(dir.path(), "s1").unwrap();
    }
}
