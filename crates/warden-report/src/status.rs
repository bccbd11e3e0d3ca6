//! Global status index.
//!
//! `runs/status.json` always describes the most recent run. It is written
//! at run start (`running`), on progress ticks, and — last of all side
//! effects — at finalisation (`completed`), so no run is ever left
//! `running` after a clean or watchdog exit (I5/P1).

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use warden_types::WardenError;

use crate::store::write_json_atomic;

/// One status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub task: String,
    /// `running` while in flight, then the final result string.
    pub result: String,
    /// `running` or `completed`.
    pub state: String,
    pub report_path: PathBuf,
    pub updated_at_utc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_current: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_total: Option<usize>,
}

impl StatusUpdate {
    pub fn running(
        run_id: &str,
        run_dir: &Path,
        task: &str,
        report_path: &Path,
        progress: &str,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            run_dir: run_dir.to_path_buf(),
            task: task.to_string(),
            result: "running".into(),
            state: "running".into(),
            report_path: report_path.to_path_buf(),
            updated_at_utc: Utc::now().to_rfc3339(),
            progress: Some(progress.to_string()),
            step_current: None,
            step_total: None,
        }
    }

    pub fn completed(
        run_id: &str,
        run_dir: &Path,
        task: &str,
        report_path: &Path,
        result: &str,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            run_dir: run_dir.to_path_buf(),
            task: task.to_string(),
            result: result.to_string(),
            state: "completed".into(),
            report_path: report_path.to_path_buf(),
            updated_at_utc: Utc::now().to_rfc3339(),
            progress: None,
            step_current: None,
            step_total: None,
        }
    }

    pub fn with_steps(mut self, current: usize, total: usize) -> Self {
        self.step_current = Some(current);
        self.step_total = Some(total);
        self
    }
}

/// Atomically replace the status index.
pub fn write_status(status_path: &Path, update: &StatusUpdate) -> Result<(), WardenError> {
    write_json_atomic(status_path, update)
}

/// Read the status index; `None` when no run has happened yet.
pub fn read_status(status_path: &Path) -> Result<Option<StatusUpdate>, WardenError> {
    if !status_path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(status_path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_then_completed_transition() {
        let base = tempfile::tempdir().unwrap();
        let status_path = base.path().join("status.json");
        let run_dir = base.path().join("runs/x");
        let report = run_dir.join("report.json");

        let running = StatusUpdate::running("x", &run_dir, "task", &report, "run started")
            .with_steps(1, 4);
        write_status(&status_path, &running).unwrap();
        let read = read_status(&status_path).unwrap().unwrap();
        assert_eq!(read.state, "running");
        assert_eq!(read.step_current, Some(1));

        let done = StatusUpdate::completed("x", &run_dir, "task", &report, "partial");
        write_status(&status_path, &done).unwrap();
        let read = read_status(&status_path).unwrap().unwrap();
        assert_eq!(read.state, "completed");
        assert_eq!(read.result, "partial");
        assert!(read.progress.is_none());
    }

    #[test]
    fn missing_status_is_none() {
        let base = tempfile::tempdir().unwrap();
        assert!(read_status(&base.path().join("status.json")).unwrap().is_none());
    }
}
