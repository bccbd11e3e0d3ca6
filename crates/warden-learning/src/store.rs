//! Global learned-selector store.
//!
//! Layout on disk (`runs/learning/web_teaching_selectors.json`):
//!
//! ```json
//! { "<state_key>": { "<target_key>": [
//!     {"selector": "#player-stop-btn", "success_count": 3,
//!      "failure_streak": 0, "scroll_hints": [420],
//!      "last_used_at": "..."} ] } }
//! ```
//!
//! Ranking: primary entries ordered by `success_count` descending, ties by
//! insertion order (newest first, matching front-insertion on capture);
//! entries demoted by two consecutive resolution failures sort behind all
//! primaries but are never erased (P6).

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use warden_types::WardenError;

/// Demotion threshold: failures-to-resolve before an entry drops to
/// fallback rank.
const DEMOTE_AFTER_FAILURES: u32 = 2;
/// Ranked entries kept per target.
const MAX_PER_TARGET: usize = 6;

/// One learned selector with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedSelector {
    pub selector: String,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub failure_streak: u32,
    /// Scroll offsets (page y) that preceded the successful click, replayed
    /// before retries.
    #[serde(default)]
    pub scroll_hints: Vec<i64>,
    #[serde(default)]
    pub last_used_at: String,
}

impl LearnedSelector {
    fn demoted(&self) -> bool {
        self.failure_streak >= DEMOTE_AFTER_FAILURES
    }
}

type StoreMap = BTreeMap<String, BTreeMap<String, Vec<LearnedSelector>>>;

/// Handle on the global store file.
#[derive(Debug, Clone)]
pub struct LearningStore {
    path: PathBuf,
}

impl LearningStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Conventional location under a `runs/learning` directory.
    pub fn in_dir(learning_dir: &Path) -> Self {
        Self::new(learning_dir.join("web_teaching_selectors.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load tolerantly: a missing or corrupt store is an empty one, never a
    /// run-stopping error.
    pub fn load(&self) -> StoreMap {
        let Ok(raw) = fs::read_to_string(&self.path) else {
            return StoreMap::new();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    /// Selectors for a target in priority order. Demoted entries rank after
    /// primaries; within each group, success count descending then
    /// insertion order.
    pub fn selectors_for(&self, state_key: &str, target: &str) -> Vec<LearnedSelector> {
        let map = self.load();
        let Some(bucket) = map.get(state_key) else {
            return Vec::new();
        };
        let mut merged: Vec<LearnedSelector> = Vec::new();
        let raw_key = target.trim().to_lowercase();
        for key in [normalize_target_key(target, ""), raw_key] {
            if key.is_empty() {
                continue;
            }
            for entry in bucket.get(&key).into_iter().flatten() {
                if !merged.iter().any(|e| e.selector == entry.selector) {
                    merged.push(entry.clone());
                }
            }
        }
        let mut primaries: Vec<LearnedSelector> = Vec::new();
        let mut fallbacks: Vec<LearnedSelector> = Vec::new();
        for entry in merged {
            if entry.demoted() {
                fallbacks.push(entry);
            } else {
                primaries.push(entry);
            }
        }
        // Stable sort keeps insertion order inside equal success counts.
        primaries.sort_by(|a, b| b.success_count.cmp(&a.success_count));
        fallbacks.sort_by(|a, b| b.success_count.cmp(&a.success_count));
        primaries.extend(fallbacks);
        primaries
    }

    /// Record a selector that just worked for `target` on `state_key`.
    ///
    /// New selectors insert at the front; existing ones gain a success and
    /// reset their failure streak. Non-specific selectors (text heuristics,
    /// overlay chrome) are refused.
    pub fn record_success(
        &self,
        state_key: &str,
        target: &str,
        selector: &str,
        scroll_hint: Option<i64>,
    ) -> Result<bool, WardenError> {
        let target_key = normalize_target_key(target, selector);
        let selector = selector.trim();
        if target_key.is_empty() || selector.is_empty() || state_key.trim().is_empty() {
            return Ok(false);
        }
        if !is_specific_selector(selector) {
            return Ok(false);
        }

        self.mutate(|map| {
            let bucket = map.entry(state_key.to_string()).or_default();
            let entries = bucket.entry(target_key.clone()).or_default();
            if let Some(entry) = entries.iter_mut().find(|e| e.selector == selector) {
                entry.success_count += 1;
                entry.failure_streak = 0;
                entry.last_used_at = Utc::now().to_rfc3339();
                if let Some(hint) = scroll_hint {
                    if !entry.scroll_hints.contains(&hint) {
                        entry.scroll_hints.push(hint);
                        entry.scroll_hints.truncate(4);
                    }
                }
            } else {
                entries.insert(
                    0,
                    LearnedSelector {
                        selector: selector.to_string(),
                        success_count: 1,
                        failure_streak: 0,
                        scroll_hints: scroll_hint.into_iter().collect(),
                        last_used_at: Utc::now().to_rfc3339(),
                    },
                );
                entries.truncate(MAX_PER_TARGET);
            }
        })?;
        Ok(true)
    }

    /// Record that a learned selector failed to resolve. Two consecutive
    /// failures demote it to fallback rank; its success count is untouched.
    pub fn record_failure(
        &self,
        state_key: &str,
        target: &str,
        selector: &str,
    ) -> Result<(), WardenError> {
        let target_key = normalize_target_key(target, selector);
        self.mutate(|map| {
            if let Some(entries) = map
                .get_mut(state_key)
                .and_then(|bucket| bucket.get_mut(&target_key))
            {
                if let Some(entry) = entries.iter_mut().find(|e| e.selector == selector) {
                    entry.failure_streak = entry.failure_streak.saturating_add(1);
                }
            }
        })
    }

    /// Read-modify-write under the store's advisory lock.
    fn mutate(&self, apply: impl FnOnce(&mut StoreMap)) -> Result<(), WardenError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_path = self.path.with_extension("lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        lock.lock_exclusive()?;

        let mut map = self.load();
        apply(&mut map);

        let tmp = self.path.with_extension(format!("tmp-{}", std::process::id()));
        let mut body = serde_json::to_string_pretty(&map)?;
        body.push('\n');
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        fs2::FileExt::unlock(&lock)?;
        Ok(())
    }

    /// Append one line to the markdown audit next to the store.
    pub fn append_audit(
        &self,
        target: &str,
        selector: &str,
        state_key: &str,
        source: &str,
    ) -> Result<(), WardenError> {
        let Some(dir) = self.path.parent() else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;
        let audit = dir.join("web_teaching_audit.md");
        let mut file = OpenOptions::new().create(true).append(true).open(audit)?;
        use std::io::Write;
        writeln!(
            file,
            "- {} target=`{target}` selector=`{selector}` source=`{source}`\n  - context: {state_key}",
            Utc::now().to_rfc3339(),
        )?;
        Ok(())
    }
}

/// Normalise a step target into a store key: lowercase, strip the
/// `kind:` prefix and quotes, collapse punctuation. Step signatures
/// ("step 3/5 click_text:...") never become keys.
pub fn normalize_target_key(raw: &str, selector: &str) -> String {
    let text = raw.trim().to_lowercase();
    if text.is_empty() && selector.trim().is_empty() {
        return String::new();
    }
    if text.starts_with("step ") && (text.contains("click_") || text.contains("wait_")) {
        return String::new();
    }
    let probe = text
        .rsplit(':')
        .next()
        .unwrap_or(&text)
        .trim()
        .trim_matches(|c| c == '\'' || c == '"')
        .to_string();
    let cleaned: String = probe
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    cleaned.chars().take(48).collect()
}

/// Only selectors precise enough to survive a page change persist: ids and
/// data-test attributes, never text heuristics or overlay chrome.
pub fn is_specific_selector(selector: &str) -> bool {
    let low = selector.trim().to_lowercase();
    if low.is_empty() || low.contains(":has-text(") || low.contains("__warden_") {
        return false;
    }
    low.starts_with('#')
        || low.starts_with("[data-testid")
        || low.starts_with("[data-test")
        || low.starts_with("[id=")
        || low.starts_with("[aria-label=")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LearningStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LearningStore::in_dir(dir.path());
        (dir, store)
    }

    #[test]
    fn record_and_retrieve() {
        let (_dir, store) = store();
        assert!(store
            .record_success("localhost/catalog|app", "Stop", "#player-stop-btn", Some(420))
            .unwrap());
        let found = store.selectors_for("localhost/catalog|app", "Stop");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].selector, "#player-stop-btn");
        assert_eq!(found[0].success_count, 1);
        assert_eq!(found[0].scroll_hints, vec![420]);
        // Different screen: nothing.
        assert!(store.selectors_for("other/page|x", "Stop").is_empty());
    }

    #[test]
    fn success_count_is_monotonic() {
        let (_dir, store) = store();
        for _ in 0..3 {
            store
                .record_success("k", "Stop", "#player-stop-btn", None)
                .unwrap();
        }
        let found = store.selectors_for("k", "Stop");
        assert_eq!(found[0].success_count, 3);

        store.record_failure("k", "Stop", "#player-stop-btn").unwrap();
        let found = store.selectors_for("k", "Stop");
        // Failure never decrements the success count.
        assert_eq!(found[0].success_count, 3);
    }

    #[test]
    fn two_failures_demote_but_do_not_erase() {
        let (_dir, store) = store();
        store.record_success("k", "Stop", "#old-stop", None).unwrap();
        store.record_success("k", "Stop", "#new-stop", None).unwrap();
        store.record_success("k", "Stop", "#new-stop", None).unwrap();

        // #new-stop has more successes and ranks first.
        let found = store.selectors_for("k", "Stop");
        assert_eq!(found[0].selector, "#new-stop");

        store.record_failure("k", "Stop", "#new-stop").unwrap();
        let found = store.selectors_for("k", "Stop");
        assert_eq!(found[0].selector, "#new-stop", "one failure is not demotion");

        store.record_failure("k", "Stop", "#new-stop").unwrap();
        let found = store.selectors_for("k", "Stop");
        assert_eq!(found[0].selector, "#old-stop");
        // Demoted, not erased.
        assert!(found.iter().any(|e| e.selector == "#new-stop"));
    }

    #[test]
    fn ties_keep_insertion_order_newest_first() {
        let (_dir, store) = store();
        store.record_success("k", "Stop", "#first", None).unwrap();
        store.record_success("k", "Stop", "#second", None).unwrap();
        let found = store.selectors_for("k", "Stop");
        // Equal success counts: the newer capture leads.
        assert_eq!(found[0].selector, "#second");
        assert_eq!(found[1].selector, "#first");
    }

    #[test]
    fn unspecific_selectors_refused() {
        let (_dir, store) = store();
        assert!(!store
            .record_success("k", "Stop", "button:has-text(\"Stop\")", None)
            .unwrap());
        assert!(!store
            .record_success("k", "Stop", "#__warden_top_bar", None)
            .unwrap());
        assert!(!store.record_success("k", "Stop", "div.btn", None).unwrap());
        assert!(store.selectors_for("k", "Stop").is_empty());
    }

    #[test]
    fn per_target_cap_enforced() {
        let (_dir, store) = store();
        for i in 0..10 {
            store
                .record_success("k", "Stop", &format!("#stop-{i}"), None)
                .unwrap();
        }
        assert!(store.selectors_for("k", "Stop").len() <= MAX_PER_TARGET);
    }

    #[test]
    fn corrupt_store_treated_as_empty() {
        let (_dir, store) = store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "not json at all").unwrap();
        assert!(store.load().is_empty());
        // And a write self-heals it.
        store.record_success("k", "Stop", "#x", None).unwrap();
        assert_eq!(store.selectors_for("k", "Stop").len(), 1);
    }

    #[test]
    fn target_key_normalisation() {
        assert_eq!(normalize_target_key("Stop", ""), "stop");
        assert_eq!(normalize_target_key("click_text:'Entrar demo'", ""), "entrar demo");
        assert_eq!(normalize_target_key("step 3/5 click_text:Stop", ""), "");
        assert_eq!(normalize_target_key("  ", ""), "");
        assert_eq!(normalize_target_key("¡Reproducir!", ""), "reproducir");
    }

    #[test]
    fn specific_selector_detection() {
        assert!(is_specific_selector("#player-stop-btn"));
        assert!(is_specific_selector("[data-testid=\"stop\"]"));
        assert!(is_specific_selector("[aria-label=\"Stop\"]"));
        assert!(!is_specific_selector("button:has-text(\"Stop\")"));
        assert!(!is_specific_selector("#__warden_cursor"));
        assert!(!is_specific_selector("a.nav-link"));
        assert!(!is_specific_selector(""));
    }

    #[test]
    fn audit_lines_appended() {
        let (_dir, store) = store();
        store.append_audit("stop", "#player-stop-btn", "k", "manual").unwrap();
        store.append_audit("stop", "#player-stop-btn", "k", "auto_retry").unwrap();
        let audit = store.path().parent().unwrap().join("web_teaching_audit.md");
        let content = fs::read_to_string(audit).unwrap();
        assert_eq!(content.matches("target=`stop`").count(), 2);
        assert!(content.contains("source=`manual`"));
    }
}
