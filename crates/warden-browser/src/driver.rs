//! Page-level automation primitives.
//!
//! The driver keeps all DOM work inside injected JavaScript evaluated via
//! `Runtime.evaluate` and performs real interactions through trusted
//! `Input.dispatchMouseEvent`/`dispatchKeyEvent` commands, so application
//! event handlers see clicks indistinguishable from a human's.
//!
//! Every waiting primitive takes an explicit budget derived from the step
//! and run deadlines; there is no ambient timeout.

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde_json::{json, Value};

use crate::cdp::{CdpClient, CdpEvent};
use crate::error::BrowserError;

/// Poll interval for visibility waits.
const POLL_MS: u64 = 120;

/// Applicability probe result: present ∧ visible ∧ enabled gates every
/// interactive step. `None` means the probe itself failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetState {
    pub present: Option<bool>,
    pub visible: Option<bool>,
    pub enabled: Option<bool>,
}

impl TargetState {
    /// Reason the step is not applicable, if any. A disabled target or an
    /// absent text target skips the step without consuming retries.
    pub fn not_applicable_reason(&self, text_target: bool) -> Option<String> {
        if self.enabled == Some(false) {
            return Some(format!(
                "target disabled in current context (present={:?}, visible={:?}, enabled={:?})",
                self.present, self.visible, self.enabled
            ));
        }
        if text_target && self.present == Some(false) && self.visible == Some(false) {
            return Some(format!(
                "target text not present/visible in current context \
                 (present={:?}, visible={:?}, enabled={:?})",
                self.present, self.visible, self.enabled
            ));
        }
        None
    }
}

/// JS helpers shared by the lookup snippets. `__wardenFind` resolves a CSS
/// selector; `__wardenFindText` walks visible elements for a case-sensitive
/// substring match, skipping `<option>` and overlay chrome so hidden
/// dropdown entries never shadow the real control.
const FINDER_JS: &str = r#"
const __wardenVisible = (el) => {
  if (!el || !el.getClientRects || el.getClientRects().length === 0) return false;
  const style = window.getComputedStyle(el);
  if (style.visibility === 'hidden' || style.display === 'none' || style.opacity === '0') return false;
  const rect = el.getBoundingClientRect();
  return rect.width > 0 && rect.height > 0;
};
const __wardenFind = (selector) => document.querySelector(selector);
const __wardenFindText = (needle) => {
  const lower = String(needle).toLowerCase();
  const all = document.body ? document.body.querySelectorAll('*') : [];
  let best = null;
  for (const el of all) {
    if (el.tagName === 'OPTION' || el.tagName === 'SCRIPT' || el.tagName === 'STYLE') continue;
    if (el.id && String(el.id).startsWith('__warden_')) continue;
    if (!__wardenVisible(el)) continue;
    const text = (el.innerText || el.textContent || '').trim().toLowerCase();
    if (!text.includes(lower)) continue;
    if (!best || best.contains(el)) best = el;
  }
  return best;
};
"#;

/// High-level page driver over one CDP connection.
pub struct PageDriver {
    client: CdpClient,
}

impl PageDriver {
    /// Attach to the first page target on a local debugging port and enable
    /// the Page, Runtime, Network, and Log domains.
    pub async fn attach(port: u16) -> Result<Self, BrowserError> {
        let client = CdpClient::connect_to_port(port).await?;
        for domain in ["Page", "Runtime", "Network", "Log"] {
            client.enable_domain(domain).await?;
        }
        Ok(Self { client })
    }

    pub fn from_client(client: CdpClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &CdpClient {
        &self.client
    }

    /// Drain buffered CDP events (console, network, page errors).
    pub async fn drain_events(&self) -> Vec<CdpEvent> {
        self.client.drain_events().await
    }

    // -----------------------------------------------------------------------
    // Navigation and evaluation
    // -----------------------------------------------------------------------

    /// Navigate and wait for `document.readyState` to leave `loading`.
    pub async fn navigate(&self, url: &str, budget: Duration) -> Result<(), BrowserError> {
        let result = self
            .client
            .command_with_timeout("Page.navigate", json!({ "url": url }), budget)
            .await?;
        if let Some(error_text) = result.get("errorText").and_then(Value::as_str) {
            if !error_text.is_empty() {
                return Err(BrowserError::NavigationFailed {
                    reason: error_text.to_string(),
                });
            }
        }
        self.wait_until(
            "document.readyState === 'interactive' || document.readyState === 'complete'",
            budget,
            "navigation",
        )
        .await
    }

    /// Evaluate an expression in the page, returning its JSON value.
    pub async fn evaluate(&self, expression: &str) -> Result<Value, BrowserError> {
        self.evaluate_with_timeout(expression, Duration::from_secs(10)).await
    }

    pub async fn evaluate_with_timeout(
        &self,
        expression: &str,
        budget: Duration,
    ) -> Result<Value, BrowserError> {
        let result = self
            .client
            .command_with_timeout(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
                budget,
            )
            .await?;

        if let Some(exception) = result.get("exceptionDetails") {
            let message = exception
                .pointer("/exception/description")
                .and_then(Value::as_str)
                .or_else(|| exception.get("text").and_then(Value::as_str))
                .unwrap_or("unknown exception")
                .to_string();
            return Err(BrowserError::JsException { message });
        }
        Ok(result
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub async fn current_url(&self) -> Result<String, BrowserError> {
        let value = self.evaluate("window.location.href").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// Page title; empty when the execution context is mid-navigation.
    pub async fn title(&self) -> String {
        match self.evaluate("document.title").await {
            Ok(value) => value.as_str().unwrap_or_default().to_string(),
            Err(_) => String::new(),
        }
    }

    /// Leading body text, whitespace-collapsed, for the context finding.
    pub async fn body_snippet(&self, max_chars: usize) -> String {
        let expr = "document.body && document.body.innerText ? document.body.innerText.slice(0, 800) : ''";
        match self.evaluate(expr).await {
            Ok(value) => {
                let collapsed: String = value
                    .as_str()
                    .unwrap_or_default()
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ");
                collapsed.chars().take(max_chars).collect()
            }
            Err(_) => String::new(),
        }
    }

    /// Cheap liveness probe: can the page still evaluate?
    pub async fn is_closed(&self) -> bool {
        self.evaluate_with_timeout("1", Duration::from_millis(1200))
            .await
            .is_err()
    }

    // -----------------------------------------------------------------------
    // Target probing
    // -----------------------------------------------------------------------

    /// Probe a CSS-selector target's applicability.
    pub async fn probe_selector(&self, selector: &str) -> TargetState {
        let expr = format!(
            "(() => {{ {FINDER_JS} const el = __wardenFind({sel});
               if (!el) return {{present: false, visible: false, enabled: null}};
               return {{present: true, visible: __wardenVisible(el),
                        enabled: !('disabled' in el) || !el.disabled}}; }})()",
            sel = js_string(selector),
        );
        self.probe_with(&expr).await
    }

    /// Probe a text target's applicability.
    pub async fn probe_text(&self, needle: &str) -> TargetState {
        let expr = format!(
            "(() => {{ {FINDER_JS} const el = __wardenFindText({text});
               if (!el) return {{present: false, visible: false, enabled: null}};
               return {{present: true, visible: true,
                        enabled: !('disabled' in el) || !el.disabled}}; }})()",
            text = js_string(needle),
        );
        self.probe_with(&expr).await
    }

    async fn probe_with(&self, expr: &str) -> TargetState {
        match self.evaluate_with_timeout(expr, Duration::from_millis(1500)).await {
            Ok(value) => TargetState {
                present: value.get("present").and_then(Value::as_bool),
                visible: value.get("visible").and_then(Value::as_bool),
                enabled: value.get("enabled").and_then(Value::as_bool),
            },
            Err(_) => TargetState::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Interactions
    // -----------------------------------------------------------------------

    /// Click the first element matching `selector`, waiting for visibility.
    pub async fn click_selector(&self, selector: &str, budget: Duration) -> Result<(), BrowserError> {
        let (x, y) = self.locate_selector(selector, budget).await?;
        self.click_at(x, y).await
    }

    /// Click the first visible element containing `text`.
    pub async fn click_text(&self, text: &str, budget: Duration) -> Result<(), BrowserError> {
        let (x, y) = self.locate_text(text, budget).await?;
        self.click_at(x, y).await
    }

    /// Scroll a selector target into view and return its visible center.
    pub async fn locate_selector(
        &self,
        selector: &str,
        budget: Duration,
    ) -> Result<(f64, f64), BrowserError> {
        self.center_of(&format!("__wardenFind({})", js_string(selector)), selector, budget)
            .await
    }

    /// Scroll a text target into view and return its visible center.
    pub async fn locate_text(&self, text: &str, budget: Duration) -> Result<(f64, f64), BrowserError> {
        self.center_of(&format!("__wardenFindText({})", js_string(text)), text, budget)
            .await
    }

    /// Dispatch a trusted left click at viewport coordinates.
    pub async fn click_at(&self, x: f64, y: f64) -> Result<(), BrowserError> {
        for phase in ["mousePressed", "mouseReleased"] {
            self.client
                .command(
                    "Input.dispatchMouseEvent",
                    json!({
                        "type": phase,
                        "x": x,
                        "y": y,
                        "button": "left",
                        "clickCount": 1,
                    }),
                )
                .await?;
        }
        Ok(())
    }

    /// Move the pointer through `points` with a short pause between steps;
    /// the visual cursor overlay follows these trusted events.
    pub async fn trace_mouse_path(
        &self,
        points: &[(f64, f64)],
        pause: Duration,
    ) -> Result<(), BrowserError> {
        for (x, y) in points {
            self.client
                .command(
                    "Input.dispatchMouseEvent",
                    json!({ "type": "mouseMoved", "x": x, "y": y }),
                )
                .await?;
            tokio::time::sleep(pause).await;
        }
        Ok(())
    }

    /// Press-and-hold click used by the human-mouse visual mode.
    pub async fn click_at_with_hold(
        &self,
        x: f64,
        y: f64,
        hold: Duration,
    ) -> Result<(), BrowserError> {
        self.client
            .command(
                "Input.dispatchMouseEvent",
                json!({ "type": "mousePressed", "x": x, "y": y, "button": "left", "clickCount": 1 }),
            )
            .await?;
        tokio::time::sleep(hold).await;
        self.client
            .command(
                "Input.dispatchMouseEvent",
                json!({ "type": "mouseReleased", "x": x, "y": y, "button": "left", "clickCount": 1 }),
            )
            .await?;
        Ok(())
    }

    /// Fill an input matched by `selector` using the native value setter so
    /// framework change-tracking (React/Vue) observes the edit.
    pub async fn fill_selector(
        &self,
        selector: &str,
        value: &str,
        budget: Duration,
    ) -> Result<(), BrowserError> {
        self.wait_for_selector(selector, budget).await?;
        let expr = format!(
            "(() => {{ {FINDER_JS} const el = __wardenFind({sel});
               if (!el) return 'missing';
               el.focus();
               const proto = el.tagName === 'TEXTAREA'
                 ? window.HTMLTextAreaElement.prototype
                 : window.HTMLInputElement.prototype;
               const setter = Object.getOwnPropertyDescriptor(proto, 'value');
               if (setter && setter.set) setter.set.call(el, {val}); else el.value = {val};
               el.dispatchEvent(new Event('input', {{bubbles: true}}));
               el.dispatchEvent(new Event('change', {{bubbles: true}}));
               return 'ok'; }})()",
            sel = js_string(selector),
            val = js_string(value),
        );
        match self.evaluate(&expr).await?.as_str() {
            Some("ok") => Ok(()),
            _ => Err(BrowserError::ElementNotFound {
                target: selector.to_string(),
            }),
        }
    }

    /// Choose a `<select>` option. Label match is attempted first, then the
    /// value attribute, mirroring how tasks phrase either form.
    pub async fn select_option(
        &self,
        selector: &str,
        label: Option<&str>,
        value: Option<&str>,
        budget: Duration,
    ) -> Result<String, BrowserError> {
        self.wait_for_selector(selector, budget).await?;
        let expr = format!(
            "(() => {{ {FINDER_JS} const el = __wardenFind({sel});
               if (!el || el.tagName !== 'SELECT') return 'missing';
               const label = {label};
               const value = {value};
               let chosen = null;
               if (label !== null) {{
                 chosen = Array.from(el.options).find(o => o.label.trim() === label || o.text.trim() === label);
               }}
               if (!chosen && value !== null) {{
                 chosen = Array.from(el.options).find(o => o.value === value);
               }}
               if (!chosen) return 'no_option';
               el.value = chosen.value;
               el.dispatchEvent(new Event('input', {{bubbles: true}}));
               el.dispatchEvent(new Event('change', {{bubbles: true}}));
               return chosen.value; }})()",
            sel = js_string(selector),
            label = label.map(js_string).unwrap_or_else(|| "null".into()),
            value = value.map(js_string).unwrap_or_else(|| "null".into()),
        );
        match self.evaluate(&expr).await? {
            Value::String(result) if result == "missing" => Err(BrowserError::ElementNotFound {
                target: selector.to_string(),
            }),
            Value::String(result) if result == "no_option" => {
                Err(BrowserError::ElementNotInteractable {
                    reason: format!(
                        "no option matching label={label:?} value={value:?} in {selector}"
                    ),
                })
            }
            Value::String(chosen) => Ok(chosen),
            other => Err(BrowserError::Protocol {
                detail: format!("unexpected select result: {other}"),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Waits
    // -----------------------------------------------------------------------

    /// Wait until `selector` is visible.
    pub async fn wait_for_selector(&self, selector: &str, budget: Duration) -> Result<(), BrowserError> {
        let predicate = format!(
            "(() => {{ {FINDER_JS} const el = __wardenFind({sel});
               return !!el && __wardenVisible(el); }})()",
            sel = js_string(selector),
        );
        self.wait_until(&predicate, budget, &format!("selector {selector}"))
            .await
    }

    /// Wait until `text` is visible in the main document. Hidden elements
    /// (collapsed `<option>` entries in particular) never satisfy the wait.
    pub async fn wait_for_text(&self, text: &str, budget: Duration) -> Result<(), BrowserError> {
        let predicate = format!(
            "(() => {{ {FINDER_JS} return !!__wardenFindText({needle}); }})()",
            needle = js_string(text),
        );
        self.wait_until(&predicate, budget, &format!("text {text}")).await
    }

    async fn wait_until(
        &self,
        predicate: &str,
        budget: Duration,
        what: &str,
    ) -> Result<(), BrowserError> {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            match self
                .evaluate_with_timeout(predicate, Duration::from_millis(1500))
                .await
            {
                Ok(Value::Bool(true)) => return Ok(()),
                Ok(_) => {}
                // Evaluation hiccups during navigation are retried until the
                // budget runs out.
                Err(BrowserError::JsException { .. }) | Err(BrowserError::Timeout { .. }) => {}
                Err(other) => return Err(other),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BrowserError::WaitTimeout {
                    what: what.to_string(),
                    duration: budget,
                });
            }
            tokio::time::sleep(Duration::from_millis(POLL_MS)).await;
        }
    }

    /// Scroll-into-view + visible center of the element produced by a finder
    /// expression, polling until the budget expires.
    async fn center_of(
        &self,
        finder: &str,
        label: &str,
        budget: Duration,
    ) -> Result<(f64, f64), BrowserError> {
        let expr = format!(
            "(() => {{ {FINDER_JS} const el = {finder};
               if (!el) return null;
               el.scrollIntoView({{block: 'center', inline: 'center'}});
               if (!__wardenVisible(el)) return 'occluded';
               const rect = el.getBoundingClientRect();
               return {{x: rect.left + rect.width / 2, y: rect.top + rect.height / 2}}; }})()",
        );
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            match self
                .evaluate_with_timeout(&expr, Duration::from_millis(1500))
                .await
            {
                Ok(Value::Object(rect)) => {
                    let x = rect.get("x").and_then(Value::as_f64);
                    let y = rect.get("y").and_then(Value::as_f64);
                    if let (Some(x), Some(y)) = (x, y) {
                        return Ok((x, y));
                    }
                }
                Ok(Value::String(_)) => {
                    // Present but occluded: keep polling; apps animate in.
                }
                Ok(_) | Err(BrowserError::JsException { .. }) => {}
                Err(BrowserError::Timeout { .. }) => {}
                Err(other) => return Err(other),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BrowserError::WaitTimeout {
                    what: format!("target {label}"),
                    duration: budget,
                });
            }
            tokio::time::sleep(Duration::from_millis(POLL_MS)).await;
        }
    }

    // -----------------------------------------------------------------------
    // Bulk scanning
    // -----------------------------------------------------------------------

    /// Scan visible cards for an addressable, enabled button. Returns the
    /// stable selectors (`#id` or `[data-testid=...]` only) of unseen
    /// buttons plus whether the page scroll has reached the bottom, so the
    /// caller knows when another scroll-and-rescan round is pointless.
    pub async fn scan_card_buttons(
        &self,
        card_selector: &str,
        button_selector: &str,
        required_text: &str,
        seen: &[String],
    ) -> (Vec<String>, bool) {
        let expr = format!(
            r#"(() => {{
  const cardSelector = {card};
  const buttonSelector = {button};
  const need = String({text} || '').trim().toLowerCase();
  const seenSelectors = {seen};
  const cards = Array.from(document.querySelectorAll(cardSelector));
  const out = [];
  const vh = window.innerHeight || 0;
  for (const card of cards) {{
    const r = card.getBoundingClientRect();
    const visible = r.height > 0 && r.bottom > 0 && r.top < vh;
    if (!visible) continue;
    const text = String(card.textContent || '').toLowerCase();
    if (need && !text.includes(need)) continue;
    const btn = card.querySelector(buttonSelector);
    if (!btn) continue;
    const disabled = !!(btn.disabled || btn.getAttribute('aria-disabled') === 'true');
    if (disabled) continue;
    const id = String(btn.id || '').trim();
    const testid = String(btn.getAttribute('data-testid') || '').trim();
    let selector = '';
    if (id) selector = '#' + id;
    else if (testid) selector = '[data-testid="' + testid + '"]';
    if (!selector) continue;
    if (seenSelectors.includes(selector)) continue;
    out.push(selector);
  }}
  const maxY = Math.max(
    0,
    ((document.documentElement && document.documentElement.scrollHeight) || 0) -
      (window.innerHeight || 0)
  );
  const reachedBottom = (window.scrollY || 0) >= (maxY - 2);
  return {{ selectors: out, reachedBottom }};
}})()"#,
            card = js_string(card_selector),
            button = js_string(button_selector),
            text = js_string(required_text),
            seen = serde_json::to_string(seen).unwrap_or_else(|_| "[]".into()),
        );
        match self.evaluate(&expr).await {
            Ok(value) => {
                let selectors = string_list(value.get("selectors"));
                let reached_bottom = value
                    .get("reachedBottom")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                (selectors, reached_bottom)
            }
            Err(_) => (Vec::new(), false),
        }
    }

    /// Stable selectors of all visible, enabled elements matching
    /// `button_selector` that are not in `seen`.
    pub async fn scan_visible_selectors(
        &self,
        button_selector: &str,
        seen: &[String],
    ) -> Vec<String> {
        let expr = format!(
            r#"(() => {{
  const buttonSelector = {button};
  const seenSelectors = {seen};
  const nodes = Array.from(document.querySelectorAll(buttonSelector));
  const out = [];
  const vh = window.innerHeight || 0;
  for (const btn of nodes) {{
    const r = btn.getBoundingClientRect();
    const visible = r.height > 0 && r.bottom > 0 && r.top < vh;
    if (!visible) continue;
    const disabled = !!(btn.disabled || btn.getAttribute('aria-disabled') === 'true');
    if (disabled) continue;
    const id = String(btn.id || '').trim();
    const testid = String(btn.getAttribute('data-testid') || '').trim();
    let selector = '';
    if (id) selector = '#' + id;
    else if (testid) selector = '[data-testid="' + testid + '"]';
    if (!selector) continue;
    if (seenSelectors.includes(selector)) continue;
    out.push(selector);
  }}
  return out;
}})()"#,
            button = js_string(button_selector),
            seen = serde_json::to_string(seen).unwrap_or_else(|_| "[]".into()),
        );
        match self.evaluate(&expr).await {
            Ok(value) => string_list(Some(&value)),
            Err(_) => Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Keyboard and screenshots
    // -----------------------------------------------------------------------

    /// Press Escape in the page (frame-guard uses this to break focus).
    pub async fn press_escape(&self) -> Result<(), BrowserError> {
        for phase in ["keyDown", "keyUp"] {
            self.client
                .command(
                    "Input.dispatchKeyEvent",
                    json!({
                        "type": phase,
                        "key": "Escape",
                        "code": "Escape",
                        "windowsVirtualKeyCode": 27,
                    }),
                )
                .await?;
        }
        Ok(())
    }

    /// Capture a PNG screenshot into `path`. Returns the byte count.
    pub async fn screenshot_to_file(&self, path: &Path) -> Result<usize, BrowserError> {
        let result = self
            .client
            .command("Page.captureScreenshot", json!({ "format": "png" }))
            .await?;
        let data = result
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::Protocol {
                detail: "captureScreenshot returned no data".into(),
            })?;
        let bytes = B64.decode(data).map_err(|e| BrowserError::Protocol {
            detail: format!("screenshot base64 decode failed: {e}"),
        })?;
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(path, &bytes).map_err(|e| BrowserError::Protocol {
            detail: format!("screenshot write failed: {e}"),
        })?;
        Ok(bytes.len())
    }
}

/// Encode a Rust string as a JS string literal (JSON escaping is valid JS).
pub fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".into())
}

/// Non-empty strings out of a JSON array value.
fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Interpolated human-like path between two points: eased steps with a
/// slight arc, used by the visual human-mouse mode.
pub fn human_mouse_path(from: (f64, f64), to: (f64, f64), steps: usize) -> Vec<(f64, f64)> {
    let steps = steps.max(2);
    let (x0, y0) = from;
    let (x1, y1) = to;
    let arc = ((x1 - x0).abs() + (y1 - y0).abs()) * 0.08;
    (0..=steps)
        .map(|i| {
            let t = i as f64 / steps as f64;
            // Smoothstep easing with a perpendicular bump peaking mid-path.
            let eased = t * t * (3.0 - 2.0 * t);
            let bump = (t * std::f64::consts::PI).sin() * arc;
            (
                x0 + (x1 - x0) * eased - (y1 - y0).signum() * bump * 0.2,
                y0 + (y1 - y0) * eased + bump * 0.2,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn js_string_escapes_quotes_and_newlines() {
        assert_eq!(js_string("Entrar demo"), "\"Entrar demo\"");
        assert_eq!(js_string("a\"b"), "\"a\\\"b\"");
        assert_eq!(js_string("line\nbreak"), "\"line\\nbreak\"");
    }

    #[test]
    fn target_state_skip_reasons() {
        let disabled = TargetState {
            present: Some(true),
            visible: Some(true),
            enabled: Some(false),
        };
        assert!(disabled
            .not_applicable_reason(false)
            .unwrap()
            .contains("disabled"));

        let absent_text = TargetState {
            present: Some(false),
            visible: Some(false),
            enabled: None,
        };
        assert!(absent_text
            .not_applicable_reason(true)
            .unwrap()
            .contains("not present"));
        // Absent selector targets go through the normal retry path instead.
        assert!(absent_text.not_applicable_reason(false).is_none());

        let healthy = TargetState {
            present: Some(true),
            visible: Some(true),
            enabled: Some(true),
        };
        assert!(healthy.not_applicable_reason(true).is_none());
    }

    #[test]
    fn human_mouse_path_endpoints_and_length() {
        let path = human_mouse_path((0.0, 0.0), (100.0, 50.0), 12);
        assert_eq!(path.len(), 13);
        let (sx, sy) = path[0];
        let (ex, ey) = *path.last().unwrap();
        assert!(sx.abs() < 1e-6 && sy.abs() < 1e-6);
        assert!((ex - 100.0).abs() < 1e-6 && (ey - 50.0).abs() < 1e-6);
    }

    #[test]
    fn human_mouse_path_minimum_steps() {
        let path = human_mouse_path((5.0, 5.0), (6.0, 6.0), 0);
        assert!(path.len() >= 3);
    }

    #[test]
    fn string_list_filters_non_strings_and_blanks() {
        let value = serde_json::json!(["#a", "  ", "[data-testid=\"x\"]", 7, null, " #b "]);
        assert_eq!(
            string_list(Some(&value)),
            vec!["#a", "[data-testid=\"x\"]", "#b"]
        );
        assert!(string_list(None).is_empty());
        assert!(string_list(Some(&serde_json::json!({"not": "a list"}))).is_empty());
    }

    #[test]
    fn finder_js_skips_options_and_overlay_chrome() {
        // The snippet is injected verbatim; guard the invariants the waits
        // rely on (no OPTION matches, no overlay self-matches).
        assert!(FINDER_JS.contains("el.tagName === 'OPTION'"));
        assert!(FINDER_JS.contains("__warden_"));
    }
}
