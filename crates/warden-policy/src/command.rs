//! Command-level guardrail checks.
//!
//! A command is accepted only when its first token is on the mode allowlist
//! and no blocked token appears anywhere in it. Sensitive tokens keep the
//! command allowed but demand explicit confirmation.

use warden_types::WardenError;

use crate::rules::{BLOCKED_TOKENS, CODE_EXTENSIONS, SENSITIVE_TOKENS, SHELL_ALLOWED_PREFIXES};

/// Verdict for one candidate command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardrailDecision {
    pub allowed: bool,
    pub reason: String,
    pub sensitive: bool,
}

impl GuardrailDecision {
    fn reject(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            sensitive: false,
        }
    }

    fn allow(reason: impl Into<String>, sensitive: bool) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            sensitive,
        }
    }
}

/// Does the task text ask for a source-code modification?
///
/// Edit verbs alone are fine ("verifica el botón editar"); the rule fires
/// only when an edit verb co-occurs with a code-file extension.
pub fn task_violates_code_edit_rule(task: &str) -> bool {
    let normalized = task.to_lowercase();
    let edit_words = [
        "edit",
        "modify",
        "write",
        "refactor",
        "patch",
        "implement",
        "create file",
    ];
    if !edit_words.iter().any(|word| normalized.contains(word)) {
        return false;
    }
    CODE_EXTENSIONS.iter().any(|ext| normalized.contains(ext))
}

/// Sensitive tokens mentioned by the task text, for upfront confirmation.
pub fn task_has_sensitive_intent(task: &str) -> Vec<&'static str> {
    let normalized = task.to_lowercase();
    SENSITIVE_TOKENS
        .iter()
        .copied()
        .filter(|token| contains_word(&normalized, token))
        .collect()
}

/// Evaluate one shell command against the blocklist and an allowlist.
pub fn evaluate_command(command: &str, allowlist: &[&str]) -> GuardrailDecision {
    let parts = match shlex::split(command) {
        Some(parts) => parts,
        None => return GuardrailDecision::reject("Malformed shell command"),
    };
    if parts.is_empty() {
        return GuardrailDecision::reject("Empty command");
    }

    for blocked in BLOCKED_TOKENS {
        if parts.iter().any(|part| part == blocked) || contains_word(command, blocked) {
            return GuardrailDecision::reject(format!("Blocked command token detected: {blocked}"));
        }
    }

    let prefix = parts[0].as_str();
    if !allowlist.contains(&prefix) {
        return GuardrailDecision::reject(format!("Command not in allowlist: {prefix}"));
    }

    let sensitive = SENSITIVE_TOKENS
        .iter()
        .any(|token| parts.iter().any(|part| part == token) || contains_word(command, token));
    if sensitive {
        GuardrailDecision::allow("Sensitive command requires explicit confirmation", true)
    } else {
        GuardrailDecision::allow("Allowed command", false)
    }
}

/// Evaluate against the default shell allowlist.
pub fn evaluate_shell_command(command: &str) -> GuardrailDecision {
    evaluate_command(command, SHELL_ALLOWED_PREFIXES)
}

/// Gate sensitive actions behind `--confirm-sensitive` or an interactive
/// terminal. `stdin_is_tty` is injected so the rule stays testable.
pub fn require_sensitive_confirmation(
    sensitive_items: &[String],
    auto_confirm: bool,
    stdin_is_tty: bool,
    confirm: impl FnOnce(&[String]) -> bool,
) -> Result<(), WardenError> {
    if sensitive_items.is_empty() || auto_confirm {
        return Ok(());
    }
    if !stdin_is_tty {
        return Err(WardenError::Guardrail(
            "Sensitive actions detected but no TTY for confirmation. \
             Use --confirm-sensitive to proceed."
                .into(),
        ));
    }
    if confirm(sensitive_items) {
        Ok(())
    } else {
        Err(WardenError::Guardrail(
            "Sensitive actions rejected by user".into(),
        ))
    }
}

/// Word-boundary containment without allocating a regex per token.
fn contains_word(haystack: &str, needle: &str) -> bool {
    // Punctuation-only tokens (redirects, the fork bomb) match as plain
    // substrings; word tokens require non-alphanumeric boundaries.
    if !needle.chars().any(|c| c.is_ascii_alphanumeric()) {
        return haystack.contains(needle);
    }
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let abs = start + pos;
        let end = abs + needle.len();
        let before_ok = abs == 0
            || !haystack[..abs]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        let after_ok = end == haystack.len()
            || !haystack[end..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if before_ok && after_ok {
            return true;
        }
        start = abs + 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{mode_allowlist, RunMode};

    #[test]
    fn code_edit_rule_needs_verb_and_extension() {
        assert!(task_violates_code_edit_rule("edit src/main.rs to add a flag"));
        assert!(task_violates_code_edit_rule("please modify app.py"));
        assert!(!task_violates_code_edit_rule("click the edit button"));
        assert!(!task_violates_code_edit_rule("open http://localhost:5173 and verify"));
    }

    #[test]
    fn blocked_tokens_rejected_everywhere() {
        let d = evaluate_shell_command("ls -la && rm -rf /");
        assert!(!d.allowed);
        assert!(d.reason.contains("rm"));

        let d = evaluate_shell_command("echo hi > /etc/passwd");
        assert!(!d.allowed);
    }

    #[test]
    fn allowlist_enforced_on_prefix() {
        assert!(evaluate_shell_command("ls -la").allowed);
        assert!(evaluate_shell_command("grep -r token .").allowed);
        let d = evaluate_shell_command("python3 -c 'print(1)'");
        assert!(!d.allowed);
        assert!(d.reason.contains("python3"));
    }

    #[test]
    fn sensitive_commands_flagged_not_blocked() {
        let d = evaluate_shell_command("curl http://localhost:5173/health");
        assert!(d.allowed);
        assert!(d.sensitive);
    }

    #[test]
    fn malformed_quotes_rejected() {
        let d = evaluate_shell_command("echo \"unterminated");
        assert!(!d.allowed);
        assert_eq!(d.reason, "Malformed shell command");
    }

    #[test]
    fn web_allowlist_blocks_shell_binaries() {
        let allow = mode_allowlist(RunMode::Web);
        assert!(!evaluate_command("ls -la", &allow).allowed);
        assert!(evaluate_command("playwright click text:Entrar demo", &allow).allowed);
    }

    #[test]
    fn sensitive_intent_extraction() {
        let hits = task_has_sensitive_intent("use curl to fetch, then ssh into the box");
        assert_eq!(hits, vec!["ssh", "curl"]);
        assert!(task_has_sensitive_intent("curling is a sport").is_empty());
    }

    #[test]
    fn confirmation_paths() {
        let items = vec!["curl http://x".to_string()];
        // Auto-confirm short-circuits.
        assert!(require_sensitive_confirmation(&items, true, false, |_| false).is_ok());
        // No TTY and no auto-confirm: hard error.
        let err = require_sensitive_confirmation(&items, false, false, |_| true).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        // Interactive rejection.
        assert!(require_sensitive_confirmation(&items, false, true, |_| false).is_err());
        // Interactive acceptance.
        assert!(require_sensitive_confirmation(&items, false, true, |_| true).is_ok());
        // Nothing sensitive: trivially ok.
        assert!(require_sensitive_confirmation(&[], false, false, |_| false).is_ok());
    }
}
