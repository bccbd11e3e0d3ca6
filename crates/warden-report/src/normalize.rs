//! Narrative-executor output normalisation.
//!
//! The operator agent emits free text with, somewhere inside it, hopefully
//! one JSON object resembling the canonical report. This module treats that
//! stdout as a lossy channel: it scans for candidate objects, scores them by
//! overlap with the report key set, coerces near-miss shapes (dicts inside
//! string lists, free-text result values), drops unknown fields, and
//! deduplicates arrays. The projection is idempotent.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::{Map, Value};
use warden_types::{RunReport, RunResult, WardenError, REPORT_KEYS};

/// Extract the best report candidate from raw executor stdout.
pub fn parse_executor_report(raw_output: &str) -> Result<RunReport, WardenError> {
    let mut best_report: Option<RunReport> = None;
    let mut best_report_score = -1i32;
    let mut best_payload: Option<Map<String, Value>> = None;
    let mut best_score = -1i32;
    let mut last_error: Option<String> = None;

    for (idx, ch) in raw_output.char_indices() {
        if ch != '{' {
            continue;
        }
        let Some(payload) = parse_leading_object(&raw_output[idx..]) else {
            continue;
        };

        let score = candidate_score(&payload);
        if score > best_score {
            best_score = score;
            best_payload = Some(payload.clone());
        }
        match normalize_payload(payload) {
            Ok(report) => {
                if score >= best_report_score {
                    best_report = Some(report);
                    best_report_score = score;
                }
            }
            Err(err) => last_error = Some(err.to_string()),
        }
    }

    if let Some(report) = best_report {
        return Ok(report);
    }
    if let Some(payload) = best_payload {
        // One more attempt for error-message quality on the best candidate.
        match normalize_payload(payload) {
            Ok(report) => return Ok(report),
            Err(err) => last_error = Some(err.to_string()),
        }
    }
    match last_error {
        Some(detail) => Err(WardenError::Report(format!(
            "JSON found but report is invalid: {detail}"
        ))),
        None => Err(WardenError::Report(
            "no valid JSON object found in executor output".into(),
        )),
    }
}

/// Project an arbitrary JSON object onto the canonical report schema.
///
/// Unknown keys are dropped; list fields are coerced to deduplicated string
/// lists; `result` goes through the lossy token heuristic. All nine
/// canonical keys must be present after projection.
pub fn normalize_payload(mut payload: Map<String, Value>) -> Result<RunReport, WardenError> {
    let known: BTreeSet<&str> = REPORT_KEYS.iter().copied().collect();
    payload.retain(|key, _| known.contains(key.as_str()));

    let missing: Vec<&str> = REPORT_KEYS
        .iter()
        .copied()
        .filter(|key| !payload.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        return Err(WardenError::Report(format!(
            "missing keys: {}",
            missing.join(", ")
        )));
    }

    for key in [
        "actions",
        "observations",
        "console_errors",
        "network_findings",
        "ui_findings",
        "evidence_paths",
    ] {
        let coerced = coerce_string_list(&payload[key]);
        payload.insert(key.to_string(), Value::Array(coerced));
    }
    let result = coerce_result(&payload["result"]);
    payload.insert("result".into(), Value::String(result.as_str().to_string()));

    RunReport::deserialize(Value::Object(payload))
        .map_err(|err| WardenError::Report(err.to_string()))
}

/// Parse one JSON value at the start of `text`, tolerating trailing bytes.
fn parse_leading_object(text: &str) -> Option<Map<String, Value>> {
    let mut stream = serde_json::Deserializer::from_str(text).into_iter::<Value>();
    match stream.next() {
        Some(Ok(Value::Object(map))) => Some(map),
        _ => None,
    }
}

/// How report-like a candidate object is: number of canonical keys present.
fn candidate_score(payload: &Map<String, Value>) -> i32 {
    REPORT_KEYS
        .iter()
        .filter(|key| payload.contains_key(**key))
        .count() as i32
}

/// Coerce a value into a deduplicated list of strings.
///
/// Dict items collapse to `"action: details"` when those keys are present;
/// everything else is stringified. Order is preserved, first occurrence wins.
fn coerce_string_list(value: &Value) -> Vec<Value> {
    let items: Vec<String> = match value {
        Value::Array(items) => items.iter().map(coerce_string_item).collect(),
        other => vec![coerce_string_item(other)],
    };
    let mut seen = BTreeSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .map(Value::String)
        .collect()
}

fn coerce_string_item(item: &Value) -> String {
    match item {
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            let action = map
                .get("action")
                .map(value_to_text)
                .unwrap_or_default();
            let details = map
                .get("details")
                .map(value_to_text)
                .unwrap_or_default();
            match (action.trim(), details.trim()) {
                ("", "") => Value::Object(map.clone()).to_string(),
                (action, "") => action.to_string(),
                ("", details) => details.to_string(),
                (action, details) => format!("{action}: {details}"),
            }
        }
        other => value_to_text(other),
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Lossy result coercion for narrative output.
///
/// Exact matches pass through; otherwise failure tokens beat partial tokens
/// beat success tokens; anything unrecognisable lands on `partial` because a
/// report that cannot state its own result has not proven success.
pub fn coerce_result(value: &Value) -> RunResult {
    let text = value_to_text(value).trim().to_lowercase();
    if let Some(exact) = RunResult::parse_strict(&text) {
        return exact;
    }
    if ["fail", "error", "denied", "blocked"]
        .iter()
        .any(|t| text.contains(t))
    {
        return RunResult::Failed;
    }
    if ["partial", "unable", "missing", "not ", "can't"]
        .iter()
        .any(|t| text.contains(t))
    {
        return RunResult::Partial;
    }
    if ["success", "completed", "done", "ok"]
        .iter()
        .any(|t| text.contains(t))
    {
        return RunResult::Success;
    }
    RunResult::Partial
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_payload() -> String {
        serde_json::json!({
            "task_id": "20250101-000000",
            "goal": "observe",
            "actions": ["cmd: ls -la"],
            "observations": ["listed files"],
            "console_errors": [],
            "network_findings": [],
            "ui_findings": [],
            "result": "success",
            "evidence_paths": []
        })
        .to_string()
    }

    #[test]
    fn extracts_report_from_noise() {
        let noisy = format!(
            "Thinking about the task...\n{{\"note\": \"scratch\"}}\n{}\nDone!",
            full_payload()
        );
        let report = parse_executor_report(&noisy).unwrap();
        assert_eq!(report.task_id, "20250101-000000");
        assert_eq!(report.result, RunResult::Success);
    }

    #[test]
    fn prefers_higher_scoring_candidate() {
        // A partial object with some report keys appears first; the full
        // report later must still win.
        let noisy = format!(
            "{{\"task_id\": \"bogus\", \"result\": \"failed\"}} junk {}",
            full_payload()
        );
        let report = parse_executor_report(&noisy).unwrap();
        assert_eq!(report.goal, "observe");
        assert_eq!(report.result, RunResult::Success);
    }

    #[test]
    fn no_json_is_an_error() {
        let err = parse_executor_report("nothing here").unwrap_err();
        assert!(err.to_string().contains("no valid JSON"));
    }

    #[test]
    fn unknown_fields_dropped() {
        let mut value: Map<String, Value> =
            serde_json::from_str(&full_payload()).unwrap();
        value.insert("extra".into(), Value::String("drop me".into()));
        let report = normalize_payload(value).unwrap();
        let round = serde_json::to_value(&report).unwrap();
        assert!(round.get("extra").is_none());
    }

    #[test]
    fn missing_keys_rejected() {
        let mut value: Map<String, Value> =
            serde_json::from_str(&full_payload()).unwrap();
        value.remove("goal");
        let err = normalize_payload(value).unwrap_err();
        assert!(err.to_string().contains("goal"));
    }

    #[test]
    fn list_coercion_handles_dicts_and_scalars() {
        let coerced = coerce_string_list(&serde_json::json!([
            "plain",
            {"action": "cmd: ls", "details": "list"},
            {"action": "cmd: pwd"},
            {"details": "only details"},
            42,
            "plain"
        ]));
        let texts: Vec<&str> = coerced.iter().map(|v| v.as_str().unwrap()).collect();
        assert_eq!(
            texts,
            vec!["plain", "cmd: ls: list", "cmd: pwd", "only details", "42"]
        );
    }

    #[test]
    fn result_coercion_heuristics() {
        assert_eq!(coerce_result(&"success".into()), RunResult::Success);
        assert_eq!(coerce_result(&"Task FAILED badly".into()), RunResult::Failed);
        assert_eq!(coerce_result(&"unable to reach target".into()), RunResult::Partial);
        assert_eq!(coerce_result(&"everything completed".into()), RunResult::Success);
        assert_eq!(coerce_result(&"shrug".into()), RunResult::Partial);
        // Failure tokens dominate success tokens.
        assert_eq!(
            coerce_result(&"completed with errors".into()),
            RunResult::Failed
        );
    }

    #[test]
    fn normalisation_is_idempotent() {
        let noisy = format!("prefix {} suffix", full_payload());
        let once = parse_executor_report(&noisy).unwrap();
        let again =
            parse_executor_report(&serde_json::to_string(&once).unwrap()).unwrap();
        assert_eq!(once, again);
    }
}
