//! Chrome DevTools Protocol client — thin mux over `tokio-tungstenite`.
//!
//! Only implements the commands the pipeline actually needs (target
//! creation, flat session attach, emulation, screencast, screenshot), not
//! the entire protocol. One WebSocket connects to the browser endpoint;
//! commands are multiplexed by id, and page events are parsed into a
//! tagged [`PageEvent`] and routed to the owning device session by the
//! flat session id. Unknown event shapes are dropped explicitly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::error::CastError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Pending CDP command waiting for its response.
type PendingTx = oneshot::Sender<Result<Value, String>>;

/// Name of the page-bound binding used for DOM-change notifications.
pub const MUTATION_BINDING: &str = "__tilecast_mutation";

/// Per-command response deadline.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

// ── PageEvent ────────────────────────────────────────────────────

/// Typed page events delivered to a device session.
#[derive(Debug)]
pub enum PageEvent {
    /// A screencast frame arrived (already acknowledged and
    /// base64-decoded).
    ScreencastFrame {
        /// Encoded image bytes (PNG).
        data: Vec<u8>,
    },
    /// The page's mutation observer fired.
    MutationHint,
    /// The browser detached the target's session.
    Detached,
}

/// Internal CDP command message.
struct CdpCommand {
    method: String,
    params: Value,
    session_id: Option<String>,
    response_tx: PendingTx,
}

// ── Browser ──────────────────────────────────────────────────────

/// A connection to one running browser's DevTools endpoint.
///
/// Shared by every device session; each session owns a target created
/// through it and receives its page events through a registered route.
pub struct Browser {
    cmd_tx: mpsc::Sender<CdpCommand>,
    routes: Arc<Mutex<HashMap<String, mpsc::Sender<PageEvent>>>>,
    _handler: JoinHandle<()>,
}

impl Browser {
    /// Connect to a DevTools endpoint.
    ///
    /// Accepts either a `ws://` / `wss://` debugger URL directly, or an
    /// `http://` / `https://` base which is resolved via
    /// `GET /json/version` → `webSocketDebuggerUrl`.
    pub async fn connect(endpoint: &str) -> Result<Self, CastError> {
        let ws_url = if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
            endpoint.to_string()
        } else {
            discover_ws_url(endpoint).await?
        };

        let (ws, _) = connect_async(&ws_url)
            .await
            .map_err(|e| CastError::BrowserNotReady(format!("WebSocket connect: {e}")))?;

        let routes: Arc<Mutex<HashMap<String, mpsc::Sender<PageEvent>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (cmd_tx, cmd_rx) = mpsc::channel::<CdpCommand>(64);
        let handler = tokio::spawn(handler_loop(ws, cmd_rx, Arc::clone(&routes)));

        Ok(Self {
            cmd_tx,
            routes,
            _handler: handler,
        })
    }

    /// Send a browser-level command.
    pub async fn command(&self, method: &str, params: Value) -> Result<Value, CastError> {
        self.send_cdp(method, params, None).await
    }

    /// Send a command scoped to an attached target session.
    pub async fn session_command(
        &self,
        session_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, CastError> {
        self.send_cdp(method, params, Some(session_id.to_string()))
            .await
    }

    /// Create a blank page target with the given viewport.
    pub async fn create_target(&self, width: u32, height: u32) -> Result<String, CastError> {
        let result = self
            .command(
                "Target.createTarget",
                json!({ "url": "about:blank", "width": width, "height": height }),
            )
            .await?;
        result["targetId"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| CastError::CommandFailed {
                method: "Target.createTarget".into(),
                reason: "no targetId in response".into(),
            })
    }

    /// Attach a flat session to a target; events for it will carry the
    /// returned session id.
    pub async fn attach(&self, target_id: &str) -> Result<String, CastError> {
        let result = self
            .command(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        result["sessionId"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| CastError::CommandFailed {
                method: "Target.attachToTarget".into(),
                reason: "no sessionId in response".into(),
            })
    }

    /// Close a target.
    pub async fn close_target(&self, target_id: &str) -> Result<(), CastError> {
        self.command("Target.closeTarget", json!({ "targetId": target_id }))
            .await?;
        Ok(())
    }

    /// Route page events for `session_id` to `tx`.
    pub fn register_route(&self, session_id: &str, tx: mpsc::Sender<PageEvent>) {
        self.routes.lock().insert(session_id.to_string(), tx);
    }

    /// Stop routing events for `session_id`.
    pub fn unregister_route(&self, session_id: &str) {
        self.routes.lock().remove(session_id);
    }

    // ── Internal ─────────────────────────────────────────────────

    async fn send_cdp(
        &self,
        method: &str,
        params: Value,
        session_id: Option<String>,
    ) -> Result<Value, CastError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(CdpCommand {
                method: method.into(),
                params,
                session_id,
                response_tx: tx,
            })
            .await
            .map_err(|_| CastError::CommandFailed {
                method: method.into(),
                reason: "handler closed".into(),
            })?;

        let result = tokio::time::timeout(COMMAND_TIMEOUT, rx)
            .await
            .map_err(|_| CastError::Timeout(COMMAND_TIMEOUT))?
            .map_err(|_| CastError::CommandFailed {
                method: method.into(),
                reason: "response dropped".into(),
            })?;

        result.map_err(|reason| CastError::CommandFailed {
            method: method.into(),
            reason,
        })
    }
}

/// Resolve an HTTP DevTools base URL to the browser WebSocket URL.
async fn discover_ws_url(endpoint: &str) -> Result<String, CastError> {
    let url = format!("{}/json/version", endpoint.trim_end_matches('/'));
    let resp = reqwest::get(&url)
        .await
        .map_err(|e| CastError::BrowserNotReady(format!("{url}: {e}")))?;
    let body: Value = resp
        .json()
        .await
        .map_err(|e| CastError::BrowserNotReady(format!("{url}: {e}")))?;
    body["webSocketDebuggerUrl"]
        .as_str()
        .map(String::from)
        .ok_or_else(|| CastError::BrowserNotReady("no webSocketDebuggerUrl in /json/version".into()))
}

// ── Handler loop ─────────────────────────────────────────────────

/// CDP WebSocket handler loop.
///
/// Receives commands from [`Browser`], writes them to the socket, and
/// routes responses back by id. Parses events into [`PageEvent`]s and
/// forwards them by session id; screencast frames are acknowledged here,
/// before the owning session ever sees them, so ack latency does not
/// depend on frame processing.
async fn handler_loop(
    ws: WsStream,
    mut cmd_rx: mpsc::Receiver<CdpCommand>,
    routes: Arc<Mutex<HashMap<String, mpsc::Sender<PageEvent>>>>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut pending: HashMap<u64, PendingTx> = HashMap::new();
    let mut next_id: u64 = 1;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                let id = next_id;
                next_id += 1;
                let mut msg = json!({
                    "id": id,
                    "method": cmd.method,
                    "params": cmd.params,
                });
                if let Some(session) = cmd.session_id {
                    msg["sessionId"] = Value::String(session);
                }
                pending.insert(id, cmd.response_tx);
                if ws_tx.send(Message::Text(msg.to_string().into())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(val) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };

                if let Some(id) = val.get("id").and_then(Value::as_u64) {
                    // Response to a command. Unknown ids (e.g. fire-and-
                    // forget acks) are dropped.
                    if let Some(tx) = pending.remove(&id) {
                        if let Some(err) = val.get("error") {
                            let reason = err["message"].as_str().unwrap_or("CDP error");
                            let _ = tx.send(Err(reason.into()));
                        } else {
                            let _ = tx.send(Ok(val["result"].clone()));
                        }
                    }
                    continue;
                }

                if let Some(method) = val.get("method").and_then(Value::as_str) {
                    handle_event(method, &val, &routes, &mut ws_tx, &mut next_id).await;
                }
            }
        }
    }

    debug!("CDP handler loop ended");
}

/// Parse a CDP event envelope into a [`PageEvent`] and route it.
async fn handle_event(
    method: &str,
    envelope: &Value,
    routes: &Arc<Mutex<HashMap<String, mpsc::Sender<PageEvent>>>>,
    ws_tx: &mut (impl Sink<Message> + Unpin),
    next_id: &mut u64,
) {
    let params = &envelope["params"];
    match method {
        "Page.screencastFrame" => {
            let Some(target_session) = envelope["sessionId"].as_str() else {
                return;
            };

            // Ack first so the browser keeps producing; failures here are
            // ignored (the fallback capture covers a stalled screencast).
            if let Some(ack_id) = params["sessionId"].as_u64() {
                let id = *next_id;
                *next_id += 1;
                let ack = json!({
                    "id": id,
                    "method": "Page.screencastFrameAck",
                    "params": { "sessionId": ack_id },
                    "sessionId": target_session,
                });
                let _ = ws_tx.send(Message::Text(ack.to_string().into())).await;
            }

            let Some(b64) = params["data"].as_str() else {
                return;
            };
            let Ok(data) = base64::engine::general_purpose::STANDARD.decode(b64) else {
                warn!("screencast frame with undecodable payload");
                return;
            };
            route(routes, target_session, PageEvent::ScreencastFrame { data });
        }
        "Runtime.bindingCalled" => {
            if params["name"].as_str() == Some(MUTATION_BINDING) {
                if let Some(session) = envelope["sessionId"].as_str() {
                    route(routes, session, PageEvent::MutationHint);
                }
            }
        }
        "Target.detachedFromTarget" => {
            if let Some(session) = params["sessionId"].as_str() {
                route(routes, session, PageEvent::Detached);
            }
        }
        other => {
            trace!(method = other, "ignoring CDP event");
        }
    }
}

fn route(
    routes: &Arc<Mutex<HashMap<String, mpsc::Sender<PageEvent>>>>,
    session_id: &str,
    event: PageEvent,
) {
    let tx = routes.lock().get(session_id).cloned();
    if let Some(tx) = tx {
        // Coalescing is the session's job; if it is saturated, dropping
        // the event here is equivalent to the browser dropping frames.
        if tx.try_send(event).is_err() {
            trace!(session = session_id, "session event channel full, dropping");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
