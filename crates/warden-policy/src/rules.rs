//! Built-in guardrail rule tables.
//!
//! The allowlists are observation-only on purpose: the executor may look at
//! the system, never change it. Web mode has no shell surface at all; its
//! only permitted actions are the engine-internal `playwright ...` strings.

use serde::{Deserialize, Serialize};

/// Execution backend selected for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Shell,
    Gui,
    Web,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Gui => "gui",
            Self::Web => "web",
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "shell" => Ok(Self::Shell),
            "gui" => Ok(Self::Gui),
            "web" => Ok(Self::Web),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

/// Observation commands the shell executor may run.
pub const SHELL_ALLOWED_PREFIXES: &[&str] = &[
    "cat", "curl", "date", "echo", "env", "find", "grep", "head", "hostname", "ifconfig", "ip",
    "ls", "netstat", "ping", "printenv", "ps", "pwd", "rg", "sed", "tail", "top", "uname",
    "uptime", "wc", "which", "whoami", "xwininfo", "xdotool", "wmctrl",
];

/// GUI mode adds the X11 screenshot tools on top of the shell set.
pub const GUI_EXTRA_PREFIXES: &[&str] = &["import", "scrot"];

/// Web mode: only engine-authored pseudo-commands.
pub const WEB_ALLOWED_PREFIXES: &[&str] = &["playwright"];

/// Tokens that always block a command, wherever they appear.
pub const BLOCKED_TOKENS: &[&str] = &[
    "rm",
    "rmdir",
    "mv",
    "dd",
    "mkfs",
    "shutdown",
    "reboot",
    "poweroff",
    "kill",
    "killall",
    "pkill",
    "chmod",
    "chown",
    "git",
    "pip",
    "pip3",
    "apt",
    "apt-get",
    "npm",
    "yarn",
    "pnpm",
    "docker",
    "kubectl",
    "tee",
    ">",
    ">>",
    ":(){:|:&};:",
];

/// Tokens that mark a command as sensitive (allowed, but confirmation
/// required unless `--confirm-sensitive`).
pub const SENSITIVE_TOKENS: &[&str] = &["sudo", "ssh", "scp", "curl", "wget"];

/// GUI actions that change state and therefore count as sensitive.
pub const GUI_STATE_CHANGING_TOKENS: &[&str] = &["xdotool click", "xdotool key", "xdotool type"];

/// Source-file extensions the code-edit intent detector looks for.
pub const CODE_EXTENSIONS: &[&str] = &[
    ".py", ".js", ".ts", ".tsx", ".jsx", ".java", ".go", ".rs", ".cpp", ".c", ".h", ".cs", ".rb",
    ".php", ".swift", ".kt",
];

/// The command-prefix allowlist for a mode.
pub fn mode_allowlist(mode: RunMode) -> Vec<&'static str> {
    match mode {
        RunMode::Shell => SHELL_ALLOWED_PREFIXES.to_vec(),
        RunMode::Gui => {
            let mut all: Vec<&str> = SHELL_ALLOWED_PREFIXES
                .iter()
                .chain(GUI_EXTRA_PREFIXES.iter())
                .copied()
                .collect();
            all.sort_unstable();
            all
        }
        RunMode::Web => WEB_ALLOWED_PREFIXES.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gui_allowlist_is_shell_plus_screenshot_tools() {
        let gui = mode_allowlist(RunMode::Gui);
        assert!(gui.contains(&"scrot"));
        assert!(gui.contains(&"import"));
        assert!(gui.contains(&"xdotool"));
        for prefix in SHELL_ALLOWED_PREFIXES {
            assert!(gui.contains(prefix), "gui allowlist lost {prefix}");
        }
    }

    #[test]
    fn web_allowlist_is_engine_only() {
        assert_eq!(mode_allowlist(RunMode::Web), vec!["playwright"]);
    }

    #[test]
    fn mode_parses_from_str() {
        assert_eq!("web".parse::<RunMode>().unwrap(), RunMode::Web);
        assert!("desktop".parse::<RunMode>().is_err());
    }
}
