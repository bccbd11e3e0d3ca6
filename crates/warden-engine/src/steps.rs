//! Task-text parsing into a frozen plan of typed steps.
//!
//! The grammar is a set of literal markers (English and Spanish) matched by
//! span: overlapping captures are resolved first-match-wins, bare quoted
//! click texts outside any marker span are appended, and the surviving
//! captures are ordered by their position in the task. The resulting plan
//! is frozen; nothing downstream may reorder it.

use std::sync::OnceLock;

use regex::Regex;
use warden_types::{StepKind, WebStep};

/// Fatal parse failures. All of them abort the run before any backend is
/// touched.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unparseable task: {0}")]
    UnparseableTask(String),
    #[error("ambiguous url: task names {0} distinct URLs")]
    AmbiguousUrl(usize),
    #[error("invalid url token: {0}")]
    InvalidUrl(String),
    #[error("empty plan: no URL and no recognisable steps")]
    EmptyPlan,
}

fn re(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("step grammar regex"))
}

macro_rules! grammar {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static CELL: OnceLock<Regex> = OnceLock::new();
            re(&CELL, $pattern)
        }
    };
}

grammar!(url_re, r#"https?://[^\s"'<>]+"#);
grammar!(
    click_text_re,
    r#"(?i)(?:click|haz\s+click|pulsa|presiona)[^"'<>]{0,120}["'“”]([^"'“”]{1,120})["'“”]"#
);
grammar!(
    click_selector_re,
    r#"(?i)(?:click|haz\s+click|pulsa|presiona)\s+(?:en\s+)?(?:el\s+)?selector\s*[=:]?\s*["'“”]([^"'“”]{1,160})["'“”]"#
);
grammar!(
    click_selector_unquoted_re,
    r#"(?i)(?:click|haz\s+click|pulsa|presiona)\s+(?:en\s+)?(?:el\s+)?selector\s*[=:]?\s*([#.\[][^\s,;]{1,200})"#
);
grammar!(
    bulk_click_in_cards_re,
    r#"(?i)bulk\s+click\s+(?:selector\s*)?["'“”]([^"'“”]{1,160})["'“”]\s+(?:in|on)\s+cards\s+["'“”]([^"'“”]{1,120})["'“”]\s+where\s+text\s+["'“”]([^"'“”]{1,120})["'“”]"#
);
grammar!(
    bulk_click_until_empty_re,
    r#"(?i)bulk\s+click\s+(?:selector\s*)?["'“”]([^"'“”]{1,160})["'“”]\s+until\s+empty"#
);
grammar!(
    fill_re,
    r#"(?i)(?:type|fill|escribe|rellena|teclea)\b[^\n\r]{0,80}?(?:text|texto)?\s*[=:]?\s*["'“”]([^"'“”]{1,240})["'“”][^\n\r]{0,120}?(?:in|into|en)\s+(?:selector\s*[=:]?\s*)?["'“”]([^"'“”]{1,160})["'“”]"#
);
grammar!(
    fill_alt_re,
    r#"(?i)(?:type|fill|escribe|rellena|teclea)\b[^\n\r]{0,80}?(?:in|into|en)\s+(?:selector\s*[=:]?\s*)?["'“”]([^"'“”]{1,160})["'“”][^\n\r]{0,120}?(?:text|texto)?\s*[=:]?\s*["'“”]([^"'“”]{1,240})["'“”]"#
);
grammar!(
    select_label_re,
    r#"(?i)\b(?:select|selecciona)\b[^\n\r]{0,120}?(?:label|texto|opci[oó]n|option)?\s*[=:]?\s*["'“”]([^"'“”]{1,120})["'“”][^\n\r]{0,120}?(?:from|en)\s+(?:selector\s*[=:]?\s*)?["'“”]([^"'“”]{1,160})["'“”]"#
);
grammar!(
    select_value_re,
    r#"(?i)\b(?:select|selecciona)\b[^\n\r]{0,80}?value\s*[=:]?\s*["'“”]([^"'“”]{1,120})["'“”][^\n\r]{0,80}?(?:from|en)\s+(?:selector\s*[=:]?\s*)?["'“”]([^"'“”]{1,160})["'“”]"#
);
grammar!(
    wait_selector_re,
    r#"(?i)(?:wait|espera)(?:\s+for)?\s+selector\s*[=:]?\s*["'“”]([^"'“”]{1,160})["'“”]"#
);
grammar!(
    wait_text_re,
    r#"(?i)(?:wait|espera)(?:\s+for)?\s+text\s*[=:]?\s*["'“”]([^"'“”]{1,160})["'“”]"#
);
grammar!(window_simple_re, r#"(?i)\bwindow:(list|active)\b"#);
grammar!(
    window_arg_re,
    r#"(?i)\bwindow:(activate|open)\s+([^\n\r,;]{1,120})"#
);
grammar!(verify_re, r#"(?i)\b(?:verify|verifica)\s+visible\b"#);

/// Trailing punctuation stripped from URL captures.
const URL_TRAILING: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '}', '"', '\''];

/// Extract the task's single explicit URL.
///
/// Trailing punctuation and closing quotes are stripped; more than one
/// distinct URL is ambiguous and fatal; a token that survives stripping but
/// is not an absolute http(s) URL is fatal.
pub fn extract_task_url(task: &str) -> Result<Option<String>, ParseError> {
    let mut urls: Vec<String> = Vec::new();
    for capture in url_re().find_iter(task) {
        let cleaned = capture.as_str().trim_end_matches(URL_TRAILING).to_string();
        if !urls.contains(&cleaned) {
            urls.push(cleaned);
        }
    }
    match urls.len() {
        0 => Ok(None),
        1 => {
            let candidate = urls.remove(0);
            let parsed = url::Url::parse(&candidate)
                .map_err(|_| ParseError::InvalidUrl(candidate.clone()))?;
            if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
                return Err(ParseError::InvalidUrl(candidate));
            }
            Ok(Some(candidate))
        }
        n => Err(ParseError::AmbiguousUrl(n)),
    }
}

/// Parse the full plan for a web task: the `open-url` step (when a URL is
/// present) followed by the marker-derived steps in task order.
pub fn parse_plan(task: &str) -> Result<Vec<WebStep>, ParseError> {
    let url = extract_task_url(task)?;
    let mut steps: Vec<WebStep> = Vec::new();
    if let Some(url) = &url {
        steps.push(WebStep::new(StepKind::OpenUrl, url.clone()));
    }
    steps.extend(parse_marker_steps(task));
    if steps.is_empty() {
        return Err(ParseError::EmptyPlan);
    }
    Ok(steps)
}

/// Marker steps only (no `open-url`), ordered by span start.
pub fn parse_marker_steps(task: &str) -> Vec<WebStep> {
    let mut captures: Vec<(usize, usize, WebStep)> = Vec::new();

    for m in bulk_click_in_cards_re().captures_iter(task) {
        let span = m.get(0).expect("match 0");
        // Card selector and required text travel packed in `value`.
        let packed = format!("{}||{}", m[2].trim(), m[3].trim());
        captures.push((
            span.start(),
            span.end(),
            WebStep::with_value(StepKind::BulkClickInCards, m[1].trim(), packed),
        ));
    }
    for m in bulk_click_until_empty_re().captures_iter(task) {
        let span = m.get(0).expect("match 0");
        captures.push((
            span.start(),
            span.end(),
            WebStep::new(StepKind::BulkClickUntilEmpty, m[1].trim()),
        ));
    }
    for m in fill_re().captures_iter(task) {
        let span = m.get(0).expect("match 0");
        captures.push((
            span.start(),
            span.end(),
            WebStep::with_value(StepKind::FillSelector, m[2].trim(), m[1].trim()),
        ));
    }
    for m in fill_alt_re().captures_iter(task) {
        let span = m.get(0).expect("match 0");
        captures.push((
            span.start(),
            span.end(),
            WebStep::with_value(StepKind::FillSelector, m[1].trim(), m[2].trim()),
        ));
    }
    for m in select_value_re().captures_iter(task) {
        let span = m.get(0).expect("match 0");
        captures.push((
            span.start(),
            span.end(),
            WebStep::with_value(StepKind::SelectValue, m[2].trim(), m[1].trim()),
        ));
    }
    for m in select_label_re().captures_iter(task) {
        let span = m.get(0).expect("match 0");
        captures.push((
            span.start(),
            span.end(),
            WebStep::with_value(StepKind::SelectLabel, m[2].trim(), m[1].trim()),
        ));
    }
    for m in wait_selector_re().captures_iter(task) {
        let span = m.get(0).expect("match 0");
        captures.push((
            span.start(),
            span.end(),
            WebStep::new(StepKind::WaitSelector, m[1].trim()),
        ));
    }
    for m in wait_text_re().captures_iter(task) {
        let span = m.get(0).expect("match 0");
        captures.push((
            span.start(),
            span.end(),
            WebStep::new(StepKind::WaitText, m[1].trim()),
        ));
    }
    for m in click_selector_re().captures_iter(task) {
        let span = m.get(0).expect("match 0");
        captures.push((
            span.start(),
            span.end(),
            WebStep::new(StepKind::ClickSelector, m[1].trim()),
        ));
    }
    for m in click_selector_unquoted_re().captures_iter(task) {
        let span = m.get(0).expect("match 0");
        captures.push((
            span.start(),
            span.end(),
            WebStep::new(StepKind::ClickSelector, m[1].trim()),
        ));
    }
    for m in window_simple_re().captures_iter(task) {
        let span = m.get(0).expect("match 0");
        captures.push((
            span.start(),
            span.end(),
            WebStep::new(StepKind::WindowOp, m[1].to_lowercase()),
        ));
    }
    for m in window_arg_re().captures_iter(task) {
        let span = m.get(0).expect("match 0");
        captures.push((
            span.start(),
            span.end(),
            WebStep::with_value(StepKind::WindowOp, m[1].to_lowercase(), m[2].trim()),
        ));
    }
    for m in verify_re().find_iter(task) {
        captures.push((
            m.start(),
            m.end(),
            WebStep::new(StepKind::VerifyVisible, ""),
        ));
    }

    // Span de-overlap: earliest capture wins, later overlapping ones drop.
    captures.sort_by_key(|(start, _, _)| *start);
    let mut filtered: Vec<(usize, usize, WebStep)> = Vec::new();
    let mut last_end = 0usize;
    for (start, end, step) in captures {
        if start >= last_end {
            last_end = end;
            filtered.push((start, end, step));
        }
    }

    // Bare quoted click texts outside every consumed span.
    let spans: Vec<(usize, usize)> = filtered.iter().map(|(s, e, _)| (*s, *e)).collect();
    for m in click_text_re().captures_iter(task) {
        let span = m.get(0).expect("match 0");
        let overlaps = spans
            .iter()
            .any(|(s, e)| span.start() < *e && span.end() > *s);
        if !overlaps {
            filtered.push((
                span.start(),
                span.start(),
                WebStep::new(StepKind::ClickText, m[1].trim()),
            ));
        }
    }

    filtered.sort_by_key(|(start, _, _)| *start);
    filtered.into_iter().map(|(_, _, step)| step).collect()
}

/// Would this plan already click a login/demo control? Drives the dedup
/// rule that keeps the auto-inserted demo click from doubling up.
pub fn plan_requests_login_click(steps: &[WebStep]) -> bool {
    steps.iter().any(|step| {
        matches!(step.kind, StepKind::ClickText | StepKind::MaybeClickText)
            && is_login_target(&step.target)
    })
}

/// Login-ish labels in both languages.
pub fn is_login_target(text: &str) -> bool {
    matches!(
        text.trim().to_lowercase().as_str(),
        "entrar demo" | "entrar" | "login" | "sign in" | "iniciar sesión"
    )
}

/// Generic play labels must not be clicked without disambiguation.
pub fn is_generic_play_label(text: &str) -> bool {
    matches!(
        text.trim().to_lowercase().as_str(),
        "reproducir" | "play" | "play local"
    )
}

/// Heuristic selector ladder for a text target, used as the last retry
/// tier after learned and explicit selectors.
pub fn stable_selectors_for_target(target: &str) -> Vec<String> {
    let clean = target.trim();
    if clean.is_empty() {
        return Vec::new();
    }
    let escaped = clean.replace('"', "\\\"");
    vec![
        format!("button:has-text(\"{escaped}\")"),
        format!("[role=\"button\"]:has-text(\"{escaped}\")"),
        format!("a:has-text(\"{escaped}\")"),
        format!("[aria-label*=\"{escaped}\" i]"),
        format!("[title*=\"{escaped}\" i]"),
    ]
}

/// Semantic text hints for an opaque selector target, used when the literal
/// selector stops resolving.
pub fn semantic_hints_for_selector(selector: &str) -> Vec<String> {
    let low = selector.trim().to_lowercase();
    let mut hints = Vec::new();
    if low.contains("stop") {
        hints.push("Stop".to_string());
    }
    if low.contains("play") || low.contains("reproducir") {
        hints.push("Reproducir".to_string());
    }
    hints
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_trailing_punctuation_stripped() {
        let url = extract_task_url(
            "abre http://localhost:5173, haz click en botón \"Entrar demo\"",
        )
        .unwrap();
        assert_eq!(url.as_deref(), Some("http://localhost:5173"));

        let url = extract_task_url("open http://localhost:5173/app).").unwrap();
        assert_eq!(url.as_deref(), Some("http://localhost:5173/app"));
    }

    #[test]
    fn multiple_distinct_urls_ambiguous() {
        let err = extract_task_url("open http://a.test and http://b.test").unwrap_err();
        assert_eq!(err, ParseError::AmbiguousUrl(2));
        // The same URL twice is not ambiguous.
        let url = extract_task_url("open http://a.test then reload http://a.test").unwrap();
        assert_eq!(url.as_deref(), Some("http://a.test"));
    }

    #[test]
    fn scenario_url_plus_demo_click() {
        let plan =
            parse_plan("abre http://localhost:5173, haz click en botón \"Entrar demo\"").unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].kind, StepKind::OpenUrl);
        assert_eq!(plan[0].target, "http://localhost:5173");
        assert_eq!(plan[1].kind, StepKind::ClickText);
        assert_eq!(plan[1].target, "Entrar demo");
    }

    #[test]
    fn selector_and_wait_markers() {
        let plan = parse_plan(
            "open http://localhost:5173 then click selector:\"#player-stop-btn\" \
             and wait selector:\".track-card\" and wait text:\"Now playing\"",
        )
        .unwrap();
        let kinds: Vec<StepKind> = plan.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StepKind::OpenUrl,
                StepKind::ClickSelector,
                StepKind::WaitSelector,
                StepKind::WaitText,
            ]
        );
        assert_eq!(plan[1].target, "#player-stop-btn");
        assert_eq!(plan[3].target, "Now playing");
    }

    #[test]
    fn unquoted_selector_accepted() {
        let steps = parse_marker_steps("haz click en selector #cta-main");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].kind, StepKind::ClickSelector);
        assert_eq!(steps[0].target, "#cta-main");
    }

    #[test]
    fn fill_both_orders() {
        let steps = parse_marker_steps("fill \"demo@example.com\" in selector \"#email\"");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].kind, StepKind::FillSelector);
        assert_eq!(steps[0].target, "#email");
        assert_eq!(steps[0].value, "demo@example.com");

        let steps = parse_marker_steps("escribe en selector \"#q\" texto: \"beethoven\"");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].target, "#q");
        assert_eq!(steps[0].value, "beethoven");
    }

    #[test]
    fn select_label_and_value() {
        let steps = parse_marker_steps("select \"Fast\" from selector \"#speed\"");
        assert_eq!(steps[0].kind, StepKind::SelectLabel);
        assert_eq!(steps[0].target, "#speed");
        assert_eq!(steps[0].value, "Fast");

        let steps = parse_marker_steps("select value \"x2\" from \"#speed\"");
        assert_eq!(steps[0].kind, StepKind::SelectValue);
        assert_eq!(steps[0].value, "x2");
    }

    #[test]
    fn bulk_click_in_cards_packs_card_and_text() {
        let steps = parse_marker_steps(
            "bulk click selector \"#add-btn\" in cards \".track-card\" where text \"READY\"",
        );
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].kind, StepKind::BulkClickInCards);
        assert_eq!(steps[0].target, "#add-btn");
        assert_eq!(steps[0].value, ".track-card||READY");
    }

    #[test]
    fn bulk_click_until_empty_parsed() {
        let steps =
            parse_marker_steps("bulk click \"[id^=playlist-track-remove-]\" until empty");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].kind, StepKind::BulkClickUntilEmpty);
        assert_eq!(steps[0].target, "[id^=playlist-track-remove-]");
        assert!(steps[0].value.is_empty());
    }

    #[test]
    fn bulk_markers_do_not_leak_a_click_text_step() {
        let steps = parse_marker_steps(
            "bulk click \"#remove\" in cards \".card\" where text \"done\" then wait text:\"Empty\"",
        );
        let kinds: Vec<StepKind> = steps.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![StepKind::BulkClickInCards, StepKind::WaitText]);
    }

    #[test]
    fn window_ops_parsed() {
        let steps = parse_marker_steps("window:list then window:activate Calculator");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].kind, StepKind::WindowOp);
        assert_eq!(steps[0].target, "list");
        assert_eq!(steps[1].target, "activate");
        assert_eq!(steps[1].value, "Calculator");
    }

    #[test]
    fn spans_do_not_double_count() {
        // "click selector:..." must not also produce a click_text for the
        // quoted selector body.
        let steps = parse_marker_steps("haz click en selector \"#login-btn\"");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].kind, StepKind::ClickSelector);
    }

    #[test]
    fn order_follows_task_text() {
        let steps = parse_marker_steps(
            "wait text:\"Catálogo\" then click \"Reproducir\" then wait text:\"Now playing\"",
        );
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].kind, StepKind::WaitText);
        assert_eq!(steps[1].kind, StepKind::ClickText);
        assert_eq!(steps[2].kind, StepKind::WaitText);
    }

    #[test]
    fn empty_plan_rejected() {
        assert_eq!(parse_plan("do something vague").unwrap_err(), ParseError::EmptyPlan);
    }

    #[test]
    fn plan_serde_roundtrip() {
        let plan = parse_plan(
            "open http://localhost:5173 click \"Entrar demo\" wait selector:\".cards\"",
        )
        .unwrap();
        let json = serde_json::to_string(&plan).unwrap();
        let back: Vec<WebStep> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn login_dedup_predicate() {
        let plan = parse_plan("abre http://x.test y haz click en \"Entrar demo\"").unwrap();
        assert!(plan_requests_login_click(&plan));
        let plan = parse_plan("abre http://x.test y haz click en \"Stop\"").unwrap();
        assert!(!plan_requests_login_click(&plan));
    }

    #[test]
    fn stable_selector_ladder() {
        let ladder = stable_selectors_for_target("Entrar demo");
        assert_eq!(ladder.len(), 5);
        assert_eq!(ladder[0], "button:has-text(\"Entrar demo\")");
        assert!(ladder[3].contains("aria-label"));
        assert!(stable_selectors_for_target("  ").is_empty());
    }

    #[test]
    fn semantic_hints() {
        assert_eq!(semantic_hints_for_selector("#player-stop-btn"), vec!["Stop"]);
        assert_eq!(
            semantic_hints_for_selector("#play-toggle"),
            vec!["Reproducir"]
        );
        assert!(semantic_hints_for_selector("#volume").is_empty());
    }

    #[test]
    fn generic_play_labels() {
        assert!(is_generic_play_label("Reproducir"));
        assert!(is_generic_play_label(" play "));
        assert!(!is_generic_play_label("Reproducir pista 3"));
    }
}
