//! WebSocket front door for display clients.
//!
//! Each client connects, sends one JSON hello naming its device and
//! streaming config, and then receives binary tile packets until it
//! disconnects. Text frames after the hello are control messages.
//!
//! ## Client protocol
//!
//! Hello (first frame, text):
//! ```json
//! { "deviceId": "kitchen-panel", "config": { "width": 800, ... },
//!   "url": "https://grafana.local/d/abc" }
//! ```
//!
//! Control (any later text frame):
//! ```json
//! { "type": "navigate", "url": "..." }
//! { "type": "fullFrame" }
//! { "type": "selfTest" }
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use tilecast_core::pipeline::broadcast::{ClientLink, LinkBackend, LinkMessage};
use tilecast_core::pipeline::registry::DeviceRegistry;
use tilecast_core::{Broadcaster, CastError, DeviceConfig};

use crate::config::ServerConfig;

/// How long a client gets to send its hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

// ── Client messages ──────────────────────────────────────────────

/// First frame a display client sends after connecting.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceHello {
    device_id: String,
    #[serde(default)]
    config: DeviceConfig,
    #[serde(default)]
    url: Option<String>,
}

/// Text frames after the hello.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ControlMessage {
    Navigate { url: String },
    FullFrame,
    SelfTest,
}

// ── StreamService ────────────────────────────────────────────────

/// The accept loop and per-client glue.
pub struct StreamService {
    config: ServerConfig,
    registry: Arc<DeviceRegistry>,
    broadcaster: Arc<Broadcaster>,
    next_client_id: AtomicU64,
}

impl StreamService {
    pub fn new(
        config: ServerConfig,
        registry: Arc<DeviceRegistry>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            config,
            registry,
            broadcaster,
            next_client_id: AtomicU64::new(1),
        }
    }

    /// Accept display clients until the process shuts down.
    pub async fn run(self: Arc<Self>) -> Result<(), CastError> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        info!("listening for display clients on {}", self.config.bind_addr());

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = this.handle_client(stream, peer).await {
                    debug!("client {peer}: {e}");
                }
            });
        }
    }

    // ── Internal ─────────────────────────────────────────────────

    async fn handle_client(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), CastError> {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| CastError::Other(format!("websocket handshake: {e}")))?;
        let (ws_tx, mut ws_rx) = ws.split();

        // Hello must arrive promptly.
        let hello = tokio::time::timeout(HELLO_TIMEOUT, ws_rx.next())
            .await
            .map_err(|_| CastError::Timeout(HELLO_TIMEOUT))?;
        let Some(Ok(Message::Text(text))) = hello else {
            return Err(CastError::Other("expected hello text frame".into()));
        };
        let hello: DeviceHello = serde_json::from_str(&text)
            .map_err(|e| CastError::Other(format!("malformed hello: {e}")))?;
        if hello.device_id.is_empty() {
            return Err(CastError::Other("hello with empty deviceId".into()));
        }

        let device_id = hello.device_id.clone();
        info!(device = %device_id, %peer, "display client connected");

        self.registry
            .ensure_device(&device_id, hello.config.normalized())
            .await?;
        if let Some(url) = hello.url {
            self.registry.navigate(&device_id, url).await;
        }

        // Register the connection; previous viewers of this device are
        // replaced.
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (link, backend) = ClientLink::channel(client_id);
        self.broadcaster.add_client(&device_id, link.clone());
        tokio::spawn(write_loop(backend, ws_tx));

        // Control messages until the socket closes.
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => self.handle_control(&device_id, &text).await,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {} // binary/ping/pong from clients is ignored
            }
        }

        info!(device = %device_id, %peer, "display client disconnected");
        self.broadcaster.remove_client(&device_id, client_id);
        link.close();
        Ok(())
    }

    async fn handle_control(&self, device_id: &str, text: &str) {
        match serde_json::from_str::<ControlMessage>(text) {
            Ok(ControlMessage::Navigate { url }) => {
                self.registry.navigate(device_id, url).await;
            }
            Ok(ControlMessage::FullFrame) => {
                self.registry.request_full_frame(device_id).await;
            }
            Ok(ControlMessage::SelfTest) => {
                self.broadcaster.start_self_test(device_id, epoch_ms());
            }
            Err(e) => {
                debug!(device = device_id, "ignoring unknown control message: {e}");
            }
        }
    }
}

/// Drain a link's packets onto the WebSocket, keeping the buffered-bytes
/// counter honest: bytes count as buffered until the sink accepts them.
async fn write_loop(
    mut backend: LinkBackend,
    mut ws_tx: impl futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
) {
    while let Some(msg) = backend.rx.recv().await {
        match msg {
            LinkMessage::Packet(data) => {
                let len = data.len();
                if ws_tx.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
                backend.buffered.fetch_sub(len, Ordering::Relaxed);
            }
            LinkMessage::Close => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }
    backend.open.store(false, Ordering::Relaxed);
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_parses_with_partial_config() {
        let hello: DeviceHello = serde_json::from_str(
            r#"{"deviceId": "kitchen", "config": {"width": 400, "height": 300}, "url": "https://x"}"#,
        )
        .unwrap();
        assert_eq!(hello.device_id, "kitchen");
        assert_eq!(hello.config.width, 400);
        assert_eq!(hello.config.tile_size, DeviceConfig::default().tile_size);
        assert_eq!(hello.url.as_deref(), Some("https://x"));
    }

    #[test]
    fn hello_without_config_takes_defaults() {
        let hello: DeviceHello = serde_json::from_str(r#"{"deviceId": "d"}"#).unwrap();
        assert_eq!(hello.config, DeviceConfig::default());
        assert!(hello.url.is_none());
    }

    #[test]
    fn hello_without_device_id_is_rejected() {
        let hello: Result<DeviceHello, _> = serde_json::from_str(r#"{"config": {}}"#);
        assert!(hello.is_err());
    }

    #[test]
    fn control_messages_parse() {
        let msg: ControlMessage =
            serde_json::from_str(r#"{"type": "navigate", "url": "https://x"}"#).unwrap();
        assert!(matches!(msg, ControlMessage::Navigate { .. }));

        let msg: ControlMessage = serde_json::from_str(r#"{"type": "fullFrame"}"#).unwrap();
        assert!(matches!(msg, ControlMessage::FullFrame));

        let msg: ControlMessage = serde_json::from_str(r#"{"type": "selfTest"}"#).unwrap();
        assert!(matches!(msg, ControlMessage::SelfTest));
    }

    #[test]
    fn unknown_control_type_is_an_error() {
        let msg: Result<ControlMessage, _> = serde_json::from_str(r#"{"type": "reboot"}"#);
        assert!(msg.is_err());
    }
}
