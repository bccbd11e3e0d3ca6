//! Chrome DevTools Protocol transport.
//!
//! JSON-RPC over the DevTools WebSocket: auto-incrementing command ids
//! correlated back to callers through oneshot channels, events fanned out on
//! an unbounded channel. A background task owns the read half; pending
//! commands are failed when the socket drops so no caller hangs forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::BrowserError;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<CommandOutcome>>>>;

/// An asynchronous event pushed by the browser (console entry, network
/// response, lifecycle notification, ...).
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

#[derive(Debug)]
enum CommandOutcome {
    Result(Value),
    Error { code: i64, message: String },
}

/// Metadata for one debuggable target from the `/json/list` discovery
/// endpoint.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PageTarget {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub ws_url: String,
}

/// Find the first `page`-type target on a local CDP port.
pub async fn discover_page_target(port: u16) -> Result<PageTarget, BrowserError> {
    let url = format!("http://127.0.0.1:{port}/json/list");
    let targets: Vec<PageTarget> = reqwest::Client::new()
        .get(&url)
        .timeout(Duration::from_millis(1500))
        .send()
        .await
        .map_err(|e| BrowserError::ConnectionFailed {
            url: url.clone(),
            reason: e.to_string(),
        })?
        .json()
        .await
        .map_err(|e| BrowserError::Protocol {
            detail: format!("bad /json/list payload: {e}"),
        })?;

    targets
        .into_iter()
        .find(|t| t.kind == "page" && !t.ws_url.is_empty())
        .ok_or(BrowserError::NoPageTarget { port })
}

/// Handle to one DevTools WebSocket connection.
pub struct CdpClient {
    next_id: AtomicU64,
    pending: Pending,
    writer: Mutex<WsSink>,
    event_rx: Mutex<mpsc::UnboundedReceiver<CdpEvent>>,
    _reader: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a page target's WebSocket debugger URL.
    pub async fn connect(ws_url: &str) -> Result<Self, BrowserError> {
        tracing::debug!(url = ws_url, "connecting DevTools WebSocket");
        let (stream, _) = tokio_tungstenite::connect_async(ws_url).await.map_err(|e| {
            BrowserError::ConnectionFailed {
                url: ws_url.to_string(),
                reason: e.to_string(),
            }
        })?;
        let (writer, reader) = stream.split();

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reader_pending = Arc::clone(&pending);
        let reader_task = tokio::spawn(async move {
            read_loop(reader, reader_pending, event_tx).await;
        });

        Ok(Self {
            next_id: AtomicU64::new(1),
            pending,
            writer: Mutex::new(writer),
            event_rx: Mutex::new(event_rx),
            _reader: reader_task,
        })
    }

    /// Connect to the first page target on a local debugging port.
    pub async fn connect_to_port(port: u16) -> Result<Self, BrowserError> {
        let target = discover_page_target(port).await?;
        Self::connect(&target.ws_url).await
    }

    /// Send a command and await its result with the default 30 s budget.
    pub async fn command(&self, method: &str, params: Value) -> Result<Value, BrowserError> {
        self.command_with_timeout(method, params, Duration::from_secs(30))
            .await
    }

    /// Send a command and await its result within `budget`.
    pub async fn command_with_timeout(
        &self,
        method: &str,
        params: Value,
        budget: Duration,
    ) -> Result<Value, BrowserError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = json!({ "id": id, "method": method, "params": params });
        let text = frame.to_string();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        {
            let mut writer = self.writer.lock().await;
            writer
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| BrowserError::Protocol {
                    detail: format!("WebSocket send failed: {e}"),
                })?;
        }

        let outcome = match tokio::time::timeout(budget, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                return Err(BrowserError::Protocol {
                    detail: "response channel closed".into(),
                })
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(BrowserError::Timeout {
                    method: method.to_string(),
                    duration: budget,
                });
            }
        };

        match outcome {
            CommandOutcome::Result(value) => Ok(value),
            CommandOutcome::Error { code, message } => {
                Err(BrowserError::CdpError { code, message })
            }
        }
    }

    /// Enable a CDP domain; most domains only emit events after this.
    pub async fn enable_domain(&self, domain: &str) -> Result<(), BrowserError> {
        self.command(&format!("{domain}.enable"), json!({})).await?;
        Ok(())
    }

    /// Drain any events already received, without blocking.
    pub async fn drain_events(&self) -> Vec<CdpEvent> {
        let mut rx = self.event_rx.lock().await;
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    /// Await the next event, or `None` when the connection has dropped.
    pub async fn next_event(&self) -> Option<CdpEvent> {
        self.event_rx.lock().await.recv().await
    }
}

/// Background read loop: dispatches responses to pending commands and fans
/// out events. On socket close, all pending commands fail.
async fn read_loop(mut reader: WsSource, pending: Pending, event_tx: mpsc::UnboundedSender<CdpEvent>) {
    while let Some(frame) = reader.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                tracing::warn!(error = %err, "DevTools WebSocket read failed");
                break;
            }
        };

        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "unparseable CDP frame");
                continue;
            }
        };

        match classify_frame(&value) {
            Some(CdpFrame::Response { id, outcome }) => {
                if let Some(tx) = pending.lock().await.remove(&id) {
                    let _ = tx.send(outcome);
                }
            }
            Some(CdpFrame::Event(event)) => {
                let _ = event_tx.send(event);
            }
            None => {}
        }
    }

    let mut pending = pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(CommandOutcome::Error {
            code: -1,
            message: "WebSocket connection closed".into(),
        });
    }
}

enum CdpFrame {
    Response { id: u64, outcome: CommandOutcome },
    Event(CdpEvent),
}

/// Split an incoming frame into response (has `id`) or event (has `method`).
fn classify_frame(value: &Value) -> Option<CdpFrame> {
    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let outcome = match value.get("error") {
            Some(err) => CommandOutcome::Error {
                code: err.get("code").and_then(Value::as_i64).unwrap_or(-1),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown CDP error")
                    .to_string(),
            },
            None => CommandOutcome::Result(value.get("result").cloned().unwrap_or(Value::Null)),
        };
        return Some(CdpFrame::Response { id, outcome });
    }
    let method = value.get("method")?.as_str()?.to_string();
    Some(CdpFrame::Event(CdpEvent {
        method,
        params: value.get("params").cloned().unwrap_or(Value::Null),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_frames_classified_by_id() {
        let frame = json!({"id": 7, "result": {"frameId": "F1"}});
        match classify_frame(&frame) {
            Some(CdpFrame::Response { id, outcome }) => {
                assert_eq!(id, 7);
                match outcome {
                    CommandOutcome::Result(value) => assert_eq!(value["frameId"], "F1"),
                    other => panic!("expected result, got {other:?}"),
                }
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn error_frames_carry_code_and_message() {
        let frame = json!({"id": 2, "error": {"code": -32602, "message": "Invalid params"}});
        match classify_frame(&frame) {
            Some(CdpFrame::Response { outcome, .. }) => match outcome {
                CommandOutcome::Error { code, message } => {
                    assert_eq!(code, -32602);
                    assert_eq!(message, "Invalid params");
                }
                other => panic!("expected error, got {other:?}"),
            },
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn event_frames_classified_by_method() {
        let frame = json!({"method": "Page.loadEventFired", "params": {"timestamp": 1.5}});
        match classify_frame(&frame) {
            Some(CdpFrame::Event(event)) => {
                assert_eq!(event.method, "Page.loadEventFired");
                assert_eq!(event.params["timestamp"], 1.5);
            }
            _ => panic!("expected event"),
        }
    }

    #[test]
    fn frames_with_id_are_never_events() {
        // A malformed frame carrying both id and method is a response.
        let frame = json!({"id": 1, "method": "Page.navigate", "result": {}});
        assert!(matches!(
            classify_frame(&frame),
            Some(CdpFrame::Response { .. })
        ));
    }

    #[test]
    fn junk_frames_dropped() {
        assert!(classify_frame(&json!({"params": {"x": 1}})).is_none());
        assert!(classify_frame(&json!(42)).is_none());
    }

    #[test]
    fn target_deserialization_tolerates_missing_fields() {
        let raw = r#"[{"type": "page", "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/A"},
                      {"type": "background_page"}]"#;
        let targets: Vec<PageTarget> = serde_json::from_str(raw).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].kind, "page");
        assert!(targets[1].ws_url.is_empty());
    }
}
