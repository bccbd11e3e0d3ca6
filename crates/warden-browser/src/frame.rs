//! Main-frame-first focus guard.
//!
//! Embedded players (YouTube in particular) steal keyboard focus into their
//! iframe, after which selector lookups and key events silently target the
//! wrong document. Before every interaction or wait the engine forces focus
//! back to the main document; if focus stays locked past the configured
//! window the step escalates to `stuck_iframe_focus`.

use std::time::Duration;

use serde_json::Value;

use crate::driver::PageDriver;
use crate::error::BrowserError;

/// Is the active element an iframe (or inside one)?
pub async fn iframe_focus_locked(driver: &PageDriver) -> bool {
    let expr = r#"
        (() => {
          const active = document.activeElement;
          if (!active) return false;
          if (String(active.tagName || '').toUpperCase() === 'IFRAME') return true;
          return !!document.querySelector('iframe:focus,iframe:focus-within');
        })()
    "#;
    matches!(driver.evaluate(expr).await, Ok(Value::Bool(true)))
}

/// Blur any focused iframe, press Escape, and re-anchor focus on the main
/// document body. Retries until focus sticks or `max_wait` elapses.
pub async fn force_main_frame_context(driver: &PageDriver, max_wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + max_wait.max(Duration::from_millis(100));
    loop {
        let _ = driver
            .evaluate(
                r#"(() => {
                    const active = document.activeElement;
                    if (active && String(active.tagName || '').toUpperCase() === 'IFRAME') {
                      try { active.blur(); } catch (_e) {}
                    }
                })()"#,
            )
            .await;
        let _ = driver.press_escape().await;
        let _ = driver
            .evaluate(
                r#"(() => {
                    if (!document.body) return false;
                    if (typeof document.body.focus === 'function') document.body.focus();
                    try {
                      const evt = new MouseEvent('click', {bubbles: true, cancelable: true, view: window});
                      document.body.dispatchEvent(evt);
                    } catch (_e) {}
                    return true;
                })()"#,
            )
            .await;

        let in_main = matches!(
            driver.evaluate("!!document.body && window === window.top").await,
            Ok(Value::Bool(true))
        );
        if in_main && !iframe_focus_locked(driver).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
    }
}

/// Opaque token for restoring an iframe whose pointer events were disabled.
#[derive(Debug, Clone)]
pub struct IframeGuardToken(Value);

/// Disable `pointer-events` on the focused embedded-player iframe so manual
/// teaching clicks land on the host document. Returns a restore token, or
/// `None` when no such iframe holds focus.
pub async fn disable_player_iframe_pointer_events(
    driver: &PageDriver,
) -> Option<IframeGuardToken> {
    let expr = r#"
        (() => {
          const active = document.activeElement;
          let frame = null;
          if (active && String(active.tagName || '').toUpperCase() === 'IFRAME') frame = active;
          if (!frame) frame = document.querySelector('iframe:focus,iframe:focus-within');
          if (!frame) return null;
          const src = String(frame.getAttribute('src') || '').toLowerCase();
          const embedded = src.includes('youtube.com') ||
                           src.includes('youtube-nocookie.com') ||
                           src.includes('youtu.be');
          if (!embedded) return null;
          const prev = String(frame.style.pointerEvents || '');
          frame.setAttribute('data-warden-prev-pe', prev || '__EMPTY__');
          frame.style.pointerEvents = 'none';
          const all = Array.from(document.querySelectorAll('iframe'));
          return { idx: all.indexOf(frame), id: String(frame.id || ''), prev };
        })()
    "#;
    match driver.evaluate(expr).await {
        Ok(token @ Value::Object(_)) => Some(IframeGuardToken(token)),
        _ => None,
    }
}

/// Restore pointer events disabled by
/// [`disable_player_iframe_pointer_events`]. Best effort: a navigated-away
/// page simply has nothing to restore.
pub async fn restore_iframe_pointer_events(
    driver: &PageDriver,
    token: Option<IframeGuardToken>,
) -> Result<(), BrowserError> {
    let Some(IframeGuardToken(token)) = token else {
        return Ok(());
    };
    let expr = format!(
        r#"((tok) => {{
            if (!tok || typeof tok !== 'object') return;
            const all = Array.from(document.querySelectorAll('iframe'));
            let frame = null;
            if (tok.id) frame = document.getElementById(String(tok.id));
            if (!frame && Number.isInteger(tok.idx) && tok.idx >= 0 && tok.idx < all.length) {{
              frame = all[tok.idx];
            }}
            if (!frame) return;
            const prevAttr = frame.getAttribute('data-warden-prev-pe');
            const prev = prevAttr === '__EMPTY__' ? '' : String(prevAttr || tok.prev || '');
            frame.style.pointerEvents = prev;
            frame.removeAttribute('data-warden-prev-pe');
        }})({token})"#,
    );
    driver.evaluate(&expr).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_token_wraps_object() {
        let token = IframeGuardToken(serde_json::json!({"idx": 0, "id": "yt", "prev": ""}));
        assert!(token.0.is_object());
    }

    #[test]
    fn restore_script_embeds_token_json() {
        // The restore expression is built by interpolation; make sure a
        // token with quotes in the id cannot break out of the script.
        let token = serde_json::json!({"idx": 1, "id": "a\"b", "prev": "auto"});
        let embedded = format!("({token})");
        assert!(embedded.contains("a\\\"b"));
    }
}
