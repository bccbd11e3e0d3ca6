//! Browser-layer error types.

use std::time::Duration;

/// Errors from the CDP transport and the page driver.
#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    /// WebSocket connection to the DevTools endpoint failed.
    #[error("failed to connect to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// No debuggable page target was found on the endpoint.
    #[error("no page target available on CDP port {port}")]
    NoPageTarget { port: u16 },

    /// Navigation returned an error (e.g. net::ERR_CONNECTION_REFUSED).
    #[error("navigation failed: {reason}")]
    NavigationFailed { reason: String },

    /// A CDP command did not answer within its budget.
    #[error("CDP command {method} timed out after {duration:?}")]
    Timeout { method: String, duration: Duration },

    /// A selector/text wait ran out of time.
    #[error("wait for {what} timed out after {duration:?}")]
    WaitTimeout { what: String, duration: Duration },

    /// The target element does not exist.
    #[error("element not found: {target}")]
    ElementNotFound { target: String },

    /// The target exists but cannot be interacted with.
    #[error("element not interactable: {reason}")]
    ElementNotInteractable { reason: String },

    /// Page-side JavaScript threw.
    #[error("page script exception: {message}")]
    JsException { message: String },

    /// The browser reported a protocol-level error object.
    #[error("CDP error {code}: {message}")]
    CdpError { code: i64, message: String },

    /// Transport closed or produced an unintelligible frame.
    #[error("protocol failure: {detail}")]
    Protocol { detail: String },
}

impl BrowserError {
    /// Timeouts feed the retry/handoff path; everything else is treated as
    /// a step failure immediately.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::WaitTimeout { .. })
    }

    /// Does this error mean the page or browser is gone? Those end the run
    /// instead of the step.
    pub fn is_page_closed(&self) -> bool {
        match self {
            Self::Protocol { detail } => {
                let low = detail.to_lowercase();
                low.contains("closed") || low.contains("connection reset")
            }
            Self::ConnectionFailed { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_classification() {
        assert!(BrowserError::Timeout {
            method: "Page.navigate".into(),
            duration: Duration::from_secs(8),
        }
        .is_timeout());
        assert!(BrowserError::WaitTimeout {
            what: "selector .track-card".into(),
            duration: Duration::from_secs(12),
        }
        .is_timeout());
        assert!(!BrowserError::ElementNotFound { target: "#x".into() }.is_timeout());
    }

    #[test]
    fn page_closed_classification() {
        assert!(BrowserError::Protocol {
            detail: "WebSocket connection closed".into()
        }
        .is_page_closed());
        assert!(!BrowserError::JsException { message: "x".into() }.is_page_closed());
    }
}
