//! In-page control overlay: top bar, control borders, notices, cursor.
//!
//! The overlay is injected as a page script whose buttons talk to the
//! long-lived loopback control agent owned by the session, not to the run.
//! Buttons therefore keep working after a run finishes. All overlay DOM ids
//! carry the `__warden_` prefix so observers and the learning capture can
//! tell chrome apart from application UI.

use serde_json::{json, Value};

use crate::driver::{js_string, PageDriver};
use crate::error::BrowserError;

/// Top-bar colors per control state, keyed by `warden_types::ControlColor`.
fn color_hex(color: &str) -> &'static str {
    match color {
        "blue" => "#3BA7FF",
        "orange" => "#F59E0B",
        "red" => "#EF4444",
        "green" => "#10B981",
        _ => "#9CA3AF",
    }
}

/// Install the top bar and the manual-activity observer.
///
/// `state` is the session snapshot (`session_id`, `control_url`, `color`,
/// `label`, booleans). The script is idempotent: re-running it refreshes the
/// state instead of duplicating nodes. The observer posts clicks and scrolls
/// to the agent's `/event` endpoint with the element's selector-ish path, so
/// teaching mode can learn from manual clicks.
pub async fn install_top_bar(driver: &PageDriver, state: &Value) -> Result<(), BrowserError> {
    let script = format!(
        r#"((state) => {{
  const BAR_ID = '__warden_top_bar';
  const postAgent = (path, body) => {{
    try {{
      if (!state.control_url) return;
      fetch(state.control_url + path, {{
        method: 'POST',
        headers: {{'Content-Type': 'application/json'}},
        body: JSON.stringify(body),
      }}).catch(() => {{}});
    }} catch (_e) {{}}
  }};

  const cssPath = (el) => {{
    if (!el || !el.tagName) return '';
    if (el.id) return '#' + el.id;
    const attrs = ['data-testid', 'data-test', 'aria-label'];
    for (const name of attrs) {{
      const v = el.getAttribute && el.getAttribute(name);
      if (v) return '[' + name + '="' + v + '"]';
    }}
    let path = el.tagName.toLowerCase();
    if (el.className && typeof el.className === 'string') {{
      const cls = el.className.trim().split(/\s+/).slice(0, 2).join('.');
      if (cls) path += '.' + cls;
    }}
    return path;
  }};

  if (!window.__wardenObserverInstalled) {{
    window.__wardenObserverInstalled = true;
    document.addEventListener('click', (evt) => {{
      const el = evt.target;
      const inChrome = el && el.closest && !!el.closest('#' + BAR_ID);
      postAgent('/event', {{ kind: 'click', payload: {{
        selector: inChrome ? '__warden_chrome' : cssPath(el),
        target: (el && (el.innerText || el.value || '') || '').slice(0, 120).trim(),
        text: (el && el.textContent || '').slice(0, 200).trim(),
        url: String(window.location.href),
        x: Math.round(evt.clientX), y: Math.round(evt.clientY),
        controlled: !!(window.__wardenState && window.__wardenState.controlled),
        learning_active: !!(window.__wardenState && window.__wardenState.learning_active),
      }} }});
    }}, true);
    document.addEventListener('scroll', () => {{
      postAgent('/event', {{ kind: 'scroll', payload: {{
        scroll_y: Math.round(window.scrollY || 0), url: String(window.location.href) }} }});
    }}, true);
    window.addEventListener('error', (evt) => {{
      postAgent('/event', {{ kind: 'page_error', payload: {{
        message: String(evt.message || '').slice(0, 400), url: String(window.location.href) }} }});
    }});
    // State poll: release/ack done through the agent become visible here
    // within one cycle even after the run that installed the bar is gone.
    window.__wardenStatePoll = setInterval(() => {{
      if (!state.control_url) return;
      fetch(state.control_url + '/state')
        .then((resp) => resp.json())
        .then((snap) => {{
          if (snap && snap.color && window.__wardenUpdateTopBarState) {{
            snap.control_url = state.control_url;
            window.__wardenUpdateTopBarState(snap);
          }}
        }})
        .catch(() => {{}});
    }}, 2000);
  }}

  let bar = document.getElementById(BAR_ID);
  if (!bar) {{
    bar = document.createElement('div');
    bar.id = BAR_ID;
    bar.style.cssText = [
      'position:fixed', 'top:-34px', 'left:0', 'right:0', 'height:30px',
      'display:flex', 'align-items:center', 'gap:10px', 'padding:0 12px',
      'background:rgba(17,24,39,0.92)', 'color:#E5E7EB',
      'font:12px/1 monospace', 'z-index:2147483646',
      'transition:top 220ms ease', 'border-bottom:2px solid transparent',
    ].join(';');

    const dot = document.createElement('span');
    dot.id = '__warden_top_bar_dot';
    dot.style.cssText = 'width:9px;height:9px;border-radius:50%;display:inline-block';
    const label = document.createElement('span');
    label.id = '__warden_top_bar_label';
    const title = document.createElement('span');
    title.id = '__warden_top_bar_title';
    title.style.cssText = 'opacity:0.7;overflow:hidden;white-space:nowrap;flex:1';
    bar.appendChild(dot);
    bar.appendChild(label);
    bar.appendChild(title);

    const mkButton = (name, action) => {{
      const btn = document.createElement('button');
      btn.textContent = name;
      btn.style.cssText = [
        'background:transparent', 'color:#E5E7EB', 'border:1px solid #4B5563',
        'border-radius:6px', 'padding:3px 8px', 'font:11px monospace', 'cursor:pointer',
      ].join(';');
      btn.addEventListener('click', (evt) => {{
        evt.stopPropagation();
        postAgent('/action', {{ action }});
      }});
      bar.appendChild(btn);
    }};
    mkButton('Refresh', 'refresh');
    mkButton('Release', 'release');
    mkButton('Clear incident', 'ack');
    mkButton('Close', 'close');

    const hotArea = document.createElement('div');
    hotArea.id = '__warden_top_bar_hot';
    hotArea.style.cssText =
      'position:fixed;top:0;left:0;right:0;height:8px;z-index:2147483645';
    hotArea.addEventListener('mouseenter', () => {{ bar.style.top = '0px'; }});
    bar.addEventListener('mouseleave', () => {{
      if (!window.__wardenBarPinned) bar.style.top = '-26px';
    }});
    document.documentElement.appendChild(hotArea);
    document.documentElement.appendChild(bar);
    // Animated entry: slide in, then retreat to the reveal strip.
    setTimeout(() => {{ bar.style.top = '0px'; }}, 30);
    setTimeout(() => {{
      if (!window.__wardenBarPinned) bar.style.top = '-26px';
    }}, 2600);
  }}

  window.__wardenUpdateTopBarState = (next) => {{
    window.__wardenState = next || {{}};
    const color = String(next && next.color || 'gray');
    const HEX = {{ blue: '#3BA7FF', orange: '#F59E0B', red: '#EF4444', green: '#10B981', gray: '#9CA3AF' }};
    const hex = (next && next.color_hex) || HEX[color] || HEX.gray;
    const dot = document.getElementById('__warden_top_bar_dot');
    const label = document.getElementById('__warden_top_bar_label');
    const title = document.getElementById('__warden_top_bar_title');
    const barEl = document.getElementById(BAR_ID);
    if (dot) dot.style.background = hex;
    if (label) label.textContent = String(next && next.label || color.toUpperCase());
    if (title) title.textContent = String(next && next.title || next && next.url || '');
    if (barEl) barEl.style.borderBottomColor = hex;
    window.__wardenBarPinned = color === 'orange' || color === 'red';
    if (window.__wardenBarPinned && barEl) barEl.style.top = '0px';
  }};
  window.__wardenDestroyTopBar = () => {{
    if (window.__wardenStatePoll) {{
      clearInterval(window.__wardenStatePoll);
      window.__wardenStatePoll = null;
    }}
    for (const id of [BAR_ID, '__warden_top_bar_hot']) {{
      const el = document.getElementById(id);
      if (el) el.remove();
    }}
  }};
  window.__wardenUpdateTopBarState(state);
}})({state})"#,
        state = embed_state(state),
    );
    driver.evaluate(&script).await.map(|_| ())
}

/// Push a fresh state snapshot into an already-installed top bar.
pub async fn update_top_bar(driver: &PageDriver, state: &Value) -> Result<(), BrowserError> {
    let script = format!(
        "window.__wardenUpdateTopBarState && window.__wardenUpdateTopBarState({})",
        embed_state(state),
    );
    driver.evaluate(&script).await.map(|_| ())
}

/// Remove the top bar and its hot area.
pub async fn destroy_top_bar(driver: &PageDriver) -> Result<(), BrowserError> {
    driver
        .evaluate("window.__wardenDestroyTopBar && window.__wardenDestroyTopBar()")
        .await
        .map(|_| ())
}

/// Full-viewport border signalling who holds control. One border at a time:
/// installing any variant removes the others first.
pub async fn set_control_border(
    driver: &PageDriver,
    color: Option<&str>,
) -> Result<(), BrowserError> {
    let script = format!(
        r#"((hex) => {{
  const ID = '__warden_control_border';
  const existing = document.getElementById(ID);
  if (!hex) {{ if (existing) existing.remove(); return; }}
  let el = existing;
  if (!el) {{
    el = document.createElement('div');
    el.id = ID;
    el.style.cssText = [
      'position:fixed', 'inset:0', 'box-sizing:border-box',
      'pointer-events:none', 'z-index:2147483645',
    ].join(';');
    document.documentElement.appendChild(el);
  }}
  el.style.border = '3px solid ' + hex;
}})({hex})"#,
        hex = color
            .map(|c| js_string(color_hex(c)))
            .unwrap_or_else(|| "null".into()),
    );
    driver.evaluate(&script).await.map(|_| ())
}

/// Bottom-center notice used for handoff / thanks / wrong-click messages.
/// `tone` selects the background: orange (handoff), green (thanks), red
/// (wrong click).
pub async fn show_notice(driver: &PageDriver, message: &str, tone: &str) -> Result<(), BrowserError> {
    let background = match tone {
        "green" => "rgba(16,185,129,0.96)",
        "red" => "rgba(239,68,68,0.96)",
        _ => "rgba(245,158,11,0.95)",
    };
    let script = format!(
        r#"((message, background) => {{
  const ID = '__warden_handoff_notice';
  let el = document.getElementById(ID);
  if (!el) {{
    el = document.createElement('div');
    el.id = ID;
    el.style.cssText = [
      'position:fixed', 'left:50%', 'bottom:18px', 'transform:translateX(-50%)',
      'padding:10px 14px', 'border-radius:10px', 'color:#fff',
      'font:13px/1.3 monospace', 'z-index:2147483647',
      'box-shadow:0 8px 18px rgba(0,0,0,0.3)',
    ].join(';');
    document.documentElement.appendChild(el);
  }}
  el.style.background = background;
  el.textContent = String(message || '');
}})({message}, {background})"#,
        message = js_string(message),
        background = js_string(background),
    );
    driver.evaluate(&script).await.map(|_| ())
}

/// Remove the notice if present.
pub async fn clear_notice(driver: &PageDriver) -> Result<(), BrowserError> {
    driver
        .evaluate(
            "(() => { const el = document.getElementById('__warden_handoff_notice'); \
             if (el) el.remove(); })()",
        )
        .await
        .map(|_| ())
}

/// Install the visual cursor dot and click pulse that follow trusted input
/// events in visual mode.
pub async fn install_visual_cursor(
    driver: &PageDriver,
    color: &str,
    scale: f64,
    click_pulse: bool,
) -> Result<(), BrowserError> {
    let script = format!(
        r#"((hex, scale, pulseOn) => {{
  if (window.__wardenCursorInstalled) return;
  window.__wardenCursorInstalled = true;
  const size = Math.max(8, Math.round(14 * scale));
  const cursor = document.createElement('div');
  cursor.id = '__warden_cursor';
  cursor.style.cssText = [
    'position:fixed', 'width:' + size + 'px', 'height:' + size + 'px',
    'border-radius:50%', 'background:' + hex, 'opacity:0.85',
    'pointer-events:none', 'z-index:2147483647', 'left:-40px', 'top:-40px',
    'transition:left 40ms linear, top 40ms linear',
  ].join(';');
  document.documentElement.appendChild(cursor);
  document.addEventListener('mousemove', (evt) => {{
    cursor.style.left = (evt.clientX - size / 2) + 'px';
    cursor.style.top = (evt.clientY - size / 2) + 'px';
  }}, true);
  document.addEventListener('mousedown', (evt) => {{
    if (!pulseOn) return;
    const pulse = document.createElement('div');
    const d = Math.round(34 * scale);
    pulse.style.cssText = [
      'position:fixed', 'width:' + d + 'px', 'height:' + d + 'px',
      'left:' + (evt.clientX - d / 2) + 'px', 'top:' + (evt.clientY - d / 2) + 'px',
      'border:2px solid ' + hex, 'border-radius:50%', 'opacity:0.9',
      'pointer-events:none', 'z-index:2147483647',
      'transition:transform 420ms ease-out, opacity 420ms ease-out',
    ].join(';');
    document.documentElement.appendChild(pulse);
    requestAnimationFrame(() => {{
      pulse.style.transform = 'scale(1.9)';
      pulse.style.opacity = '0';
    }});
    setTimeout(() => pulse.remove(), 500);
  }}, true);
}})({hex}, {scale}, {pulse})"#,
        hex = js_string(color),
        scale = scale,
        pulse = click_pulse,
    );
    driver.evaluate(&script).await.map(|_| ())
}

/// Is the overlay (top bar, and cursor when expected) still installed?
/// Navigations wipe injected DOM; the engine re-installs when this is false.
pub async fn overlay_ready(driver: &PageDriver, cursor_expected: bool) -> bool {
    let expr = format!(
        "!!document.getElementById('__warden_top_bar') && ({} || !!document.getElementById('__warden_cursor'))",
        if cursor_expected { "false" } else { "true" },
    );
    matches!(driver.evaluate(&expr).await, Ok(Value::Bool(true)))
}

/// Session snapshot enriched with the derived color/label/hex the top-bar
/// script consumes.
pub fn top_bar_state(
    session_id: &str,
    url: &str,
    title: &str,
    control_url: &str,
    color: warden_types::ControlColor,
) -> Value {
    json!({
        "session_id": session_id,
        "url": url,
        "title": title,
        "control_url": control_url,
        "color": color.as_str(),
        "color_hex": color_hex(color.as_str()),
        "label": color.label(),
        "controlled": color == warden_types::ControlColor::Blue,
        "learning_active": color == warden_types::ControlColor::Orange,
    })
}

fn embed_state(state: &Value) -> String {
    serde_json::to_string(state).unwrap_or_else(|_| "{}".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_types::ControlColor;

    #[test]
    fn color_hex_mapping() {
        assert_eq!(color_hex("blue"), "#3BA7FF");
        assert_eq!(color_hex("orange"), "#F59E0B");
        assert_eq!(color_hex("red"), "#EF4444");
        assert_eq!(color_hex("green"), "#10B981");
        assert_eq!(color_hex("anything-else"), "#9CA3AF");
    }

    #[test]
    fn top_bar_state_carries_derived_fields() {
        let state = top_bar_state(
            "s-1",
            "http://localhost:5173",
            "App",
            "http://127.0.0.1:9400",
            ControlColor::Orange,
        );
        assert_eq!(state["color"], "orange");
        assert_eq!(state["label"], "LEARNING");
        assert_eq!(state["learning_active"], true);
        assert_eq!(state["controlled"], false);
    }

    #[test]
    fn state_embedding_is_json() {
        let state = json!({"control_url": "http://127.0.0.1:1\"; alert(1); //"});
        let embedded = embed_state(&state);
        // Quotes stay escaped inside the JSON literal.
        assert!(embedded.contains("\\\""));
    }
}
