//! Per-run workspace allocation and artifact persistence.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use warden_types::WardenError;

/// Root of all persisted run state, relative to the working directory.
pub const RUNS_DIR: &str = "runs";

/// Paths inside one run directory.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub bridge_log: PathBuf,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub report_path: PathBuf,
}

impl RunPaths {
    pub fn evidence_dir(&self) -> PathBuf {
        self.run_dir.join("evidence")
    }

    pub fn learning_dir(&self) -> PathBuf {
        self.run_dir.join("learning")
    }

    /// Per-run writable home for the operator-agent subprocess.
    pub fn oi_home(&self) -> PathBuf {
        self.run_dir.join(".oi_home")
    }
}

/// Allocator and accessor for run directories under a base directory.
#[derive(Debug, Clone)]
pub struct RunStore {
    base: PathBuf,
}

impl RunStore {
    /// Store rooted at `<base>/runs`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into().join(RUNS_DIR),
        }
    }

    /// Store rooted at `runs/` in the working directory.
    pub fn default_location() -> Self {
        Self {
            base: PathBuf::from(RUNS_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.base
    }

    pub fn status_path(&self) -> PathBuf {
        self.base.join("status.json")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.base.join("web_sessions")
    }

    pub fn learning_dir(&self) -> PathBuf {
        self.base.join("learning")
    }

    /// Allocate a fresh run directory. The id is a UTC second stamp with a
    /// `-NN` suffix on collision; a hundred same-second runs is treated as a
    /// hard failure rather than an infinite loop.
    pub fn create_run(&self) -> Result<RunPaths, WardenError> {
        fs::create_dir_all(&self.base)?;
        let base_id = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        for attempt in 0..100u32 {
            let run_id = if attempt == 0 {
                base_id.clone()
            } else {
                format!("{base_id}-{attempt:02}")
            };
            let run_dir = self.base.join(&run_id);
            if run_dir.exists() {
                continue;
            }
            fs::create_dir_all(&run_dir)?;
            return Ok(RunPaths {
                bridge_log: run_dir.join("bridge.log"),
                stdout_log: run_dir.join("oi_stdout.log"),
                stderr_log: run_dir.join("oi_stderr.log"),
                report_path: run_dir.join("report.json"),
                run_id,
                run_dir,
            });
        }
        Err(WardenError::Io(std::io::Error::other(
            "could not allocate unique run directory",
        )))
    }

    /// Prepare the evidence and `.oi_home` subtrees for gui/web runs.
    pub fn prepare_run_dirs(&self, paths: &RunPaths, with_evidence: bool) -> Result<(), WardenError> {
        if with_evidence {
            fs::create_dir_all(paths.evidence_dir())?;
        }
        fs::create_dir_all(paths.oi_home().join(".cache"))?;
        fs::create_dir_all(paths.oi_home().join(".config"))?;
        Ok(())
    }
}

/// Append one line to a log file, creating it on first use.
pub fn append_log(path: &Path, message: &str) -> Result<(), WardenError> {
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", message.trim_end())?;
    Ok(())
}

/// Last `count` lines of a file; empty if it does not exist.
pub fn tail_lines(path: &Path, count: usize) -> Vec<String> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].iter().map(|s| s.to_string()).collect()
}

/// Serialize `value` and atomically replace `path` (temp file + rename in
/// the same directory). Readers observe either the old or the new content.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), WardenError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');
    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".into()),
        std::process::id()
    ));
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
