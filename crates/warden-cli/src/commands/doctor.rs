//! Runtime prerequisite checks (`doctor`) and the run preflight built on
//! them.

use serde_json::json;
use warden_policy::RunMode;
use warden_types::WardenError;

/// One named check with its verdict.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RuntimeCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

fn check(name: &str, ok: bool, detail: impl Into<String>) -> RuntimeCheck {
    RuntimeCheck {
        name: name.into(),
        ok,
        detail: detail.into(),
    }
}

/// Collect the checks for a mode.
pub async fn collect_runtime_checks(mode: RunMode) -> Vec<RuntimeCheck> {
    let mut checks = Vec::new();

    if matches!(mode, RunMode::Shell | RunMode::Gui) {
        let has_key = !std::env::var("OPENAI_API_KEY").unwrap_or_default().is_empty();
        checks.push(check(
            "openai_api_key",
            has_key,
            if has_key {
                "OPENAI_API_KEY present"
            } else {
                "Missing OPENAI_API_KEY"
            },
        ));

        let dns_ok = tokio::net::lookup_host("api.openai.com:443").await.is_ok();
        checks.push(check(
            "dns_api_openai",
            dns_ok,
            if dns_ok {
                "api.openai.com resolvable"
            } else {
                "Cannot resolve api.openai.com"
            },
        ));

        let command =
            std::env::var("OI_BRIDGE_COMMAND").unwrap_or_else(|_| "interpreter".into());
        let found = which(&command);
        checks.push(check(
            "interpreter_binary",
            found.is_some(),
            match &found {
                Some(path) => format!("Using {path}"),
                None => format!("{command} not found in PATH"),
            },
        ));
    }

    if mode == RunMode::Gui {
        let display = std::env::var("DISPLAY").unwrap_or_default();
        checks.push(check(
            "display_env",
            !display.is_empty(),
            format!("DISPLAY={}", if display.is_empty() { "<unset>" } else { &display }),
        ));
        for tool in ["xdotool", "wmctrl", "xwininfo"] {
            let found = which(tool).is_some();
            checks.push(check(
                &format!("tool_{tool}"),
                found,
                format!("{tool} {}", if found { "found" } else { "missing" }),
            ));
        }
        let screenshot = which("scrot").is_some() || which("import").is_some();
        checks.push(check(
            "tool_screenshot",
            screenshot,
            if screenshot {
                "scrot/import available"
            } else {
                "Missing both scrot and import"
            },
        ));
    }

    if mode == RunMode::Web {
        let browser = ["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"]
            .iter()
            .find_map(|name| which(name));
        checks.push(check(
            "web_browser_binary",
            browser.is_some(),
            match &browser {
                Some(path) => format!("Using {path}"),
                None => "No Chromium browser binary found in PATH".to_string(),
            },
        ));
    }

    checks
}

/// `doctor --mode <m>`: print the checks and fail the process when any
/// check fails.
pub async fn doctor_command(mode: &str) -> anyhow::Result<()> {
    let mode: RunMode = mode
        .parse()
        .map_err(|e: String| WardenError::InvalidArgs(e))?;
    let checks = collect_runtime_checks(mode).await;
    let ok = checks.iter().all(|c| c.ok);
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "mode": mode.as_str(),
            "ok": ok,
            "checks": checks,
        }))?
    );
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// Run preflight: a failed check aborts before any run state is created.
pub async fn preflight_runtime(mode: RunMode) -> Result<(), WardenError> {
    let failed: Vec<String> = collect_runtime_checks(mode)
        .await
        .into_iter()
        .filter(|c| !c.ok)
        .map(|c| c.name)
        .collect();
    if failed.is_empty() {
        Ok(())
    } else {
        Err(WardenError::Bootstrap(format!(
            "runtime preflight failed: {}. Run `warden doctor --mode {}` for details",
            failed.join("; "),
            mode.as_str(),
        )))
    }
}

/// Minimal PATH lookup.
fn which(name: &str) -> Option<String> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate.to_string_lossy().into_owned());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn which_finds_sh() {
        assert!(which("sh").is_some());
        assert!(which("definitely-not-a-binary-xyz").is_none());
    }

    #[tokio::test]
    async fn web_checks_only_probe_browser() {
        let checks = collect_runtime_checks(RunMode::Web).await;
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].name, "web_browser_binary");
    }

    #[tokio::test]
    async fn gui_checks_include_display_and_tools() {
        let checks = collect_runtime_checks(RunMode::Gui).await;
        let names: Vec<&str> = checks.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"display_env"));
        assert!(names.contains(&"tool_xdotool"));
        assert!(names.contains(&"tool_screenshot"));
        assert!(names.contains(&"openai_api_key"));
    }
}
