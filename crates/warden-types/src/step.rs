//! Typed web steps.
//!
//! A plan is a frozen ordered list of [`WebStep`]s derived from the task
//! text by the parser in `warden-engine`. Steps are immutable after the
//! plan is frozen; components downstream never reorder them.

use serde::{Deserialize, Serialize};

/// The primitive a single step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Navigate the page to the task URL.
    OpenUrl,
    /// Click the first visible element containing the target text.
    ClickText,
    /// Click the target text if present; silently skip otherwise. Used for
    /// the auto-inserted demo-login step.
    MaybeClickText,
    /// Click the first element matching a CSS selector.
    ClickSelector,
    /// Click the target button inside every visible card matching the
    /// packed `value` (`card_selector||required_text`), scanning and
    /// scrolling until no new cards appear.
    BulkClickInCards,
    /// Keep clicking every visible element matching the target selector
    /// until the page stops producing matches.
    BulkClickUntilEmpty,
    /// Fill an input matched by selector with `value`.
    FillSelector,
    /// Choose a `<select>` option by visible label.
    SelectLabel,
    /// Choose a `<select>` option by value attribute.
    SelectValue,
    /// Wait until a selector is visible.
    WaitSelector,
    /// Wait until text is visible in the main document.
    WaitText,
    /// Evaluate a visibility predicate and record the verdict as a finding.
    VerifyVisible,
    /// GUI window operation (`window:list|active|activate|open`), routed to
    /// the window backend outside the web engine.
    WindowOp,
}

/// One primitive in a frozen plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebStep {
    pub kind: StepKind,
    /// Text or selector, depending on `kind`.
    pub target: String,
    /// Secondary payload: fill text, select label/value, window argument.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

impl WebStep {
    pub fn new(kind: StepKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            value: String::new(),
        }
    }

    pub fn with_value(kind: StepKind, target: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            value: value.into(),
        }
    }

    /// Interactive steps take the evidence/retry path and count toward the
    /// `actions[]` / ok-outcome parity check (P5).
    pub fn is_interactive(&self) -> bool {
        matches!(
            self.kind,
            StepKind::ClickText
                | StepKind::MaybeClickText
                | StepKind::ClickSelector
                | StepKind::BulkClickInCards
                | StepKind::BulkClickUntilEmpty
                | StepKind::FillSelector
                | StepKind::SelectLabel
                | StepKind::SelectValue
        )
    }

    /// Step kinds whose failure can open a teaching handoff.
    pub fn is_teachable(&self) -> bool {
        matches!(
            self.kind,
            StepKind::ClickText
                | StepKind::ClickSelector
                | StepKind::BulkClickInCards
                | StepKind::BulkClickUntilEmpty
                | StepKind::FillSelector
        )
    }

    /// The label the learning store indexes this step under, if any.
    pub fn learning_target(&self) -> Option<&str> {
        let teachable = matches!(
            self.kind,
            StepKind::ClickText
                | StepKind::MaybeClickText
                | StepKind::ClickSelector
                | StepKind::FillSelector
                | StepKind::SelectLabel
                | StepKind::SelectValue
        );
        let target = self.target.trim();
        (teachable && !target.is_empty()).then_some(target)
    }
}

impl std::fmt::Display for WebStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            StepKind::OpenUrl => "open_url",
            StepKind::ClickText => "click_text",
            StepKind::MaybeClickText => "maybe_click_text",
            StepKind::ClickSelector => "click_selector",
            StepKind::BulkClickInCards => "bulk_click_in_cards",
            StepKind::BulkClickUntilEmpty => "bulk_click_until_empty",
            StepKind::FillSelector => "fill_selector",
            StepKind::SelectLabel => "select_label",
            StepKind::SelectValue => "select_value",
            StepKind::WaitSelector => "wait_selector",
            StepKind::WaitText => "wait_text",
            StepKind::VerifyVisible => "verify_visible",
            StepKind::WindowOp => "window_op",
        };
        write!(f, "{kind}:{}", self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interactive_classification() {
        assert!(WebStep::new(StepKind::ClickText, "Entrar demo").is_interactive());
        assert!(WebStep::new(StepKind::FillSelector, "#q").is_interactive());
        assert!(
            WebStep::new(StepKind::BulkClickUntilEmpty, "[id^=\"remove-\"]").is_interactive()
        );
        assert!(!WebStep::new(StepKind::WaitText, "Now playing").is_interactive());
        assert!(!WebStep::new(StepKind::OpenUrl, "http://x").is_interactive());
    }

    #[test]
    fn bulk_kinds_are_teachable_but_carry_no_learning_target() {
        let bulk = WebStep::with_value(
            StepKind::BulkClickInCards,
            "[data-testid=\"remove\"]",
            ".track-card||ready",
        );
        assert!(bulk.is_teachable());
        assert_eq!(bulk.learning_target(), None);
    }

    #[test]
    fn learning_target_only_for_teachable_kinds() {
        let step = WebStep::new(StepKind::ClickText, "Stop");
        assert_eq!(step.learning_target(), Some("Stop"));
        let wait = WebStep::new(StepKind::WaitSelector, ".player");
        assert_eq!(wait.learning_target(), None);
        let blank = WebStep::new(StepKind::ClickText, "  ");
        assert_eq!(blank.learning_target(), None);
    }

    #[test]
    fn serde_uses_snake_case_kinds() {
        let step = WebStep::with_value(StepKind::FillSelector, "#user", "demo");
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["kind"], "fill_selector");
        let back: WebStep = serde_json::from_value(json).unwrap();
        assert_eq!(back, step);
    }
}
