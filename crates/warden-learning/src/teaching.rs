//! Per-run teaching artifacts.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use warden_types::WardenError;

/// A manual click captured during a learning window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeachingCapture {
    /// The target the engine was stuck on.
    pub failed_target: String,
    /// Selector-ish path of the element the user clicked.
    pub selector: String,
    /// Visible text of the clicked element.
    pub target: String,
    pub url: String,
    pub state_key: String,
    /// Page scroll offset at capture time, replayed as a hint on retries.
    #[serde(default)]
    pub scroll_y: i64,
    pub timestamp: String,
}

/// Persist the capture as `teaching_<stamp>.json` and a small markdown
/// companion in the run's `learning/` directory. Returns both paths.
pub fn write_teaching_artifacts(
    learning_dir: &Path,
    capture: &TeachingCapture,
) -> Result<Vec<PathBuf>, WardenError> {
    std::fs::create_dir_all(learning_dir)?;
    let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let json_path = learning_dir.join(format!("teaching_{stamp}.json"));
    let md_path = learning_dir.join(format!("teaching_{stamp}.md"));

    let mut body = serde_json::to_string_pretty(capture)?;
    body.push('\n');
    std::fs::write(&json_path, body)?;

    let md = format!(
        "# Teaching Artifact\n\n\
         - failed_target: `{}`\n\
         - selector: `{}`\n\
         - click_target_text: `{}`\n\
         - timestamp: `{}`\n\
         - url: `{}`\n\
         - state_key: `{}`\n",
        capture.failed_target,
        capture.selector,
        capture.target,
        capture.timestamp,
        capture.url,
        capture.state_key,
    );
    std::fs::write(&md_path, md)?;
    Ok(vec![json_path, md_path])
}

/// Is a manual click semantically consistent with the stuck objective?
///
/// Overlay chrome and top-bar buttons never qualify. With no failed target
/// recorded, any main-document click qualifies. Otherwise the target token
/// (or its id selector) must appear in the clicked element's selector,
/// text, or label.
pub fn is_relevant_manual_click(
    selector: &str,
    target_text: &str,
    element_text: &str,
    failed_target: &str,
) -> bool {
    let selector = selector.trim().to_lowercase();
    let target_text = target_text.trim().to_lowercase();
    let element_text = element_text.trim().to_lowercase();

    if selector.contains("__warden_") {
        return false;
    }
    if matches!(
        target_text.as_str(),
        "release" | "close" | "refresh" | "clear incident" | "ack"
    ) {
        return false;
    }

    let raw = failed_target.trim().to_lowercase();
    if raw.is_empty() {
        return true;
    }
    let probe = raw
        .rsplit(':')
        .next()
        .unwrap_or(&raw)
        .trim()
        .trim_matches(|c| c == '\'' || c == '"')
        .to_string();
    if probe.is_empty() {
        return true;
    }
    if probe.starts_with('#') && selector.contains(&probe) {
        return true;
    }
    let token: String = probe
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if token.is_empty() {
        return true;
    }
    if selector.contains(&token) || target_text.contains(&token) || element_text.contains(&token) {
        return true;
    }
    // Partial-word match only for the semantic play/stop controls, where
    // ids like #player-stop-btn should match a "Stop" objective.
    let parts: Vec<&str> = token.split(' ').filter(|p| p.len() >= 3).collect();
    !parts.is_empty()
        && parts.iter().any(|p| selector.contains(p))
        && (parts.contains(&"stop") || parts.contains(&"play"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture() -> TeachingCapture {
        TeachingCapture {
            failed_target: "Stop".into(),
            selector: "#player-stop-btn".into(),
            target: "Stop".into(),
            url: "http://localhost:5173/catalog".into(),
            state_key: "localhost/catalog|app".into(),
            scroll_y: 380,
            timestamp: "2025-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn artifacts_written_as_pair() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_teaching_artifacts(dir.path(), &capture()).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].extension().unwrap() == "json");
        assert!(paths[1].extension().unwrap() == "md");
        let json = std::fs::read_to_string(&paths[0]).unwrap();
        assert!(json.contains("#player-stop-btn"));
        let md = std::fs::read_to_string(&paths[1]).unwrap();
        assert!(md.contains("failed_target: `Stop`"));
    }

    #[test]
    fn overlay_chrome_clicks_irrelevant() {
        assert!(!is_relevant_manual_click("#__warden_top_bar", "Release", "", "Stop"));
        assert!(!is_relevant_manual_click("button.x", "Release", "", "Stop"));
        assert!(!is_relevant_manual_click("button.x", "Clear incident", "", "Stop"));
    }

    #[test]
    fn token_containment_matches() {
        assert!(is_relevant_manual_click("#player-stop-btn", "", "", "Stop"));
        assert!(is_relevant_manual_click("button.x", "Stop", "", "Stop"));
        assert!(is_relevant_manual_click("button.x", "", "Stop playback", "Stop"));
        assert!(!is_relevant_manual_click("#volume-slider", "", "Volume", "Stop"));
    }

    #[test]
    fn id_target_matches_by_selector() {
        assert!(is_relevant_manual_click(
            "div > #player-stop-btn",
            "",
            "",
            "#player-stop-btn"
        ));
    }

    #[test]
    fn empty_failed_target_accepts_main_document_clicks() {
        assert!(is_relevant_manual_click("button.primary", "Continue", "", ""));
    }
}
