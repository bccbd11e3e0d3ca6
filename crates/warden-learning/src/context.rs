//! Screen-context identity for learned selectors.
//!
//! A learned selector only makes sense on the screen it was taught on. The
//! context key combines the page origin and path with a signature of the
//! screen's stable features (title hint plus heading/landmark text), so the
//! same SPA route with different content still shares its learned
//! selectors.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity of one screen/state for the learning store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearningContext {
    pub hostname: String,
    pub path: String,
    pub title_hint: String,
    /// Primary index key for the store.
    pub state_key: String,
    /// Stable hash of the screen signature, for disambiguation when two
    /// screens share host/path/title.
    pub screen_signature: String,
}

impl LearningContext {
    /// Build a context from the page URL, title, and landmark text (heading
    /// and nav text joined, may be empty).
    pub fn derive(url: &str, title: &str, landmarks: &str) -> Self {
        let (hostname, path) = match url::Url::parse(url) {
            Ok(parsed) => (
                parsed.host_str().unwrap_or_default().to_lowercase(),
                if parsed.path().is_empty() {
                    "/".to_string()
                } else {
                    parsed.path().to_string()
                },
            ),
            Err(_) => (String::new(), "/".to_string()),
        };
        let title_hint: String = collapse_ws(title).to_lowercase().chars().take(80).collect();
        let state_key = format!("{hostname}{path}|{title_hint}");

        let mut hasher = Sha256::new();
        hasher.update(state_key.as_bytes());
        hasher.update(b"|");
        hasher.update(collapse_ws(landmarks).to_lowercase().as_bytes());
        let screen_signature = hex_prefix(&hasher.finalize(), 16);

        Self {
            hostname,
            path,
            title_hint,
            state_key,
            screen_signature,
        }
    }

    /// JS expression collecting the landmark text used for the signature.
    pub const LANDMARK_JS: &'static str = "(() => {
        const parts = [];
        for (const el of document.querySelectorAll('h1,h2,[role=\"navigation\"],nav,[role=\"main\"]')) {
          const text = (el.innerText || '').trim();
          if (text) parts.push(text.slice(0, 120));
          if (parts.length >= 8) break;
        }
        return parts.join(' | ');
    })()";
}

fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in bytes {
        if out.len() >= chars {
            break;
        }
        out.push_str(&format!("{byte:02x}"));
    }
    out.truncate(chars);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_builds_stable_key() {
        let a = LearningContext::derive(
            "http://localhost:5173/catalog?x=1",
            "  My   App ",
            "Catalog | Player",
        );
        assert_eq!(a.hostname, "localhost");
        assert_eq!(a.path, "/catalog");
        assert_eq!(a.state_key, "localhost/catalog|my app");

        // Same inputs, same signature.
        let b = LearningContext::derive(
            "http://localhost:5173/catalog?other=2",
            "My App",
            "Catalog | Player",
        );
        assert_eq!(a.state_key, b.state_key);
        assert_eq!(a.screen_signature, b.screen_signature);
    }

    #[test]
    fn different_landmarks_change_signature_not_key() {
        let a = LearningContext::derive("http://localhost:5173/", "App", "Login");
        let b = LearningContext::derive("http://localhost:5173/", "App", "Dashboard");
        assert_eq!(a.state_key, b.state_key);
        assert_ne!(a.screen_signature, b.screen_signature);
    }

    #[test]
    fn invalid_url_still_produces_context() {
        let ctx = LearningContext::derive("not a url", "t", "");
        assert_eq!(ctx.hostname, "");
        assert_eq!(ctx.path, "/");
        assert!(!ctx.screen_signature.is_empty());
    }

    #[test]
    fn signature_is_fixed_width_hex() {
        let ctx = LearningContext::derive("http://x.test/", "t", "l");
        assert_eq!(ctx.screen_signature.len(), 16);
        assert!(ctx.screen_signature.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
