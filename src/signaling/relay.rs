//! WebSocket signaling relay.
//!
//! A pure message router: peers connect, get a temporary identifier, usually
//! rebind it to an address via `register`, and from then on the relay forwards
//! offer/answer/ice-candidate/file-request/file-response frames verbatim to
//! whichever connection currently holds the `to` identifier. The relay never
//! inspects `data` and keeps no state across restarts.
//!
//! The same listener answers plain-HTTP `GET /health` probes with a JSON
//! status document.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Duration};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use uuid::Uuid;

use crate::signaling::message::{now_ms, SignalingMessage};

/// Liveness sweep period: ping every connection and purge the dead ones.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Frames queued per client before slow consumers block routing to them.
const CLIENT_BUFFER: usize = 64;

/// One registered endpoint: the id of the underlying connection plus the
/// handle its writer task consumes from.
#[derive(Clone)]
struct ClientHandle {
    conn_id: Uuid,
    tx: mpsc::Sender<Message>,
}

type Registry = Arc<Mutex<HashMap<String, ClientHandle>>>;

/// The relay process. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct SignalingRelay {
    clients: Registry,
    started_at: Instant,
}

impl Default for SignalingRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingRelay {
    pub fn new() -> Self {
        Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
            started_at: Instant::now(),
        }
    }

    /// Bind and serve until ctrl-c. On shutdown every open client connection
    /// is closed before the listener is dropped.
    pub async fn run(&self, bind: &str) -> Result<()> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("Failed to bind {}", bind))?;
        eprintln!("Signaling relay listening on ws://{}", bind);
        eprintln!("Health check: http://{}/health", bind);

        tokio::select! {
            result = self.serve(listener) => result,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Shutting down signaling relay...");
                self.close_all().await;
                Ok(())
            }
        }
    }

    /// Accept loop: one task per connection. The registry is only touched
    /// under its mutex.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.spawn_sweeper();
        loop {
            let (stream, addr) = listener.accept().await.context("Accept failed")?;
            log::debug!("Connection from {}", addr);
            let relay = self.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.handle_connection(stream).await {
                    log::warn!("Connection from {} ended with error: {}", addr, e);
                }
            });
        }
    }

    /// Number of currently registered identifiers.
    pub async fn connected_clients(&self) -> usize {
        self.clients.lock().await.len()
    }

    async fn close_all(&self) {
        let clients = self.clients.lock().await;
        for handle in clients.values() {
            let _ = handle.tx.try_send(Message::Close(None));
        }
    }

    /// Ping all connections on a fixed interval and drop registry entries
    /// whose writer task has gone away, so silent drops cannot leak ids.
    fn spawn_sweeper(&self) {
        let clients = self.clients.clone();
        tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                let mut clients = clients.lock().await;
                let before = clients.len();
                clients.retain(|id, handle| {
                    if handle.tx.is_closed() {
                        log::info!("Sweeping dead client: {}", id);
                        false
                    } else {
                        let _ = handle.tx.try_send(Message::Ping(Vec::new()));
                        true
                    }
                });
                let swept = before - clients.len();
                if swept > 0 || !clients.is_empty() {
                    log::debug!("Heartbeat: {} active clients ({} swept)", clients.len(), swept);
                }
            }
        });
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        // The health probe shares the WebSocket port. Peek the request line;
        // anything else goes through the normal WebSocket handshake.
        let mut head = [0u8; 16];
        let n = stream.peek(&mut head).await.unwrap_or(0);
        if head[..n].starts_with(b"GET /health ") {
            return self.serve_health(stream).await;
        }

        let ws = accept_async(stream)
            .await
            .context("WebSocket handshake failed")?;
        let (mut ws_write, mut ws_read) = ws.split();

        let conn_id = Uuid::new_v4();
        let temp_id = temp_client_id();
        let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_BUFFER);
        {
            let mut clients = self.clients.lock().await;
            clients.insert(temp_id.clone(), ClientHandle { conn_id, tx: tx.clone() });
        }
        log::info!("New client connected: {}", temp_id);

        // Writer task: sole owner of the sink. Routing and replies all go
        // through the mpsc handle.
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let close = matches!(msg, Message::Close(_));
                if ws_write.send(msg).await.is_err() {
                    break;
                }
                if close {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let confirmation = SignalingMessage::connection(&temp_id);
        let _ = tx
            .send(Message::Text(serde_json::to_string(&confirmation)?))
            .await;

        // The identifier this connection is currently registered under.
        let mut bound_id = temp_id;

        while let Some(frame) = ws_read.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    self.handle_frame(&text, &tx, conn_id, &mut bound_id).await;
                }
                Ok(Message::Ping(payload)) => {
                    let _ = tx.send(Message::Pong(payload)).await;
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::warn!("WebSocket error for {}: {}", bound_id, e);
                    break;
                }
            }
        }

        log::info!("Client disconnected: {}", bound_id);
        // Remove every identifier bound to this connection. Identifiers are
        // never reused.
        let mut clients = self.clients.lock().await;
        clients.retain(|_, handle| handle.conn_id != conn_id);
        drop(clients);

        writer.abort();
        Ok(())
    }

    async fn handle_frame(
        &self,
        text: &str,
        reply: &mpsc::Sender<Message>,
        conn_id: Uuid,
        bound_id: &mut String,
    ) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Non-JSON frame from {}: {}", bound_id, e);
                send_json(reply, &SignalingMessage::format_error(&e.to_string())).await;
                return;
            }
        };

        let msg_type = value.get("type").and_then(Value::as_str).unwrap_or("");
        log::debug!("Message from {}: {}", bound_id, msg_type);

        match msg_type {
            "register" => {
                self.handle_register(&value, reply, conn_id, bound_id).await;
            }
            "offer" | "answer" | "ice-candidate" | "file-request" | "file-response" => {
                self.route(text, &value, reply, bound_id).await;
            }
            "ping" => {
                let pong = serde_json::json!({ "type": "pong", "timestamp": now_ms() });
                let _ = reply.send(Message::Text(pong.to_string())).await;
            }
            other => {
                log::debug!("Unknown message type from {}: {}", bound_id, other);
            }
        }
    }

    /// Rebind this connection from its current identifier to the supplied
    /// address. A missing or empty address fails silently (log only): a
    /// validation gap inherited from the original protocol.
    async fn handle_register(
        &self,
        value: &Value,
        _reply: &mpsc::Sender<Message>,
        conn_id: Uuid,
        bound_id: &mut String,
    ) {
        let address = value
            .pointer("/data/address")
            .or_else(|| value.get("address"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if address.is_empty() {
            log::warn!("Registration from {} failed: no address provided", bound_id);
            return;
        }

        let mut clients = self.clients.lock().await;
        let Some(handle) = clients.get(bound_id.as_str()).cloned() else {
            log::warn!("Registration from unknown connection {}", bound_id);
            return;
        };
        debug_assert_eq!(handle.conn_id, conn_id);
        clients.remove(bound_id.as_str());
        clients.insert(address.to_string(), handle);
        log::info!("Client {} registered as {}", bound_id, address);
        *bound_id = address.to_string();
    }

    /// Forward the frame verbatim to `to`, or report a routing failure back
    /// to the sender. Routing errors are recoverable: the sender may retry.
    ///
    /// Delivery is `try_send`: each connection's loop must stay independent
    /// of every other peer's backpressure, so a target whose buffer is full
    /// is treated the same as a target that is gone.
    async fn route(&self, text: &str, value: &Value, reply: &mpsc::Sender<Message>, from: &str) {
        let to = value.get("to").and_then(Value::as_str).unwrap_or("");

        let target = {
            let clients = self.clients.lock().await;
            clients.get(to).cloned()
        };

        let delivered = match target {
            Some(handle) => handle.tx.try_send(Message::Text(text.to_string())).is_ok(),
            None => false,
        };

        if delivered {
            log::debug!("Routed {} from {} to {}", value["type"], from, to);
        } else {
            log::info!("Target client {} not found or disconnected", to);
            match serde_json::from_str::<SignalingMessage>(text) {
                Ok(original) => {
                    send_json(reply, &SignalingMessage::routing_error(to, original)).await;
                }
                Err(e) => {
                    send_json(reply, &SignalingMessage::format_error(&e.to_string())).await;
                }
            }
        }
    }

    async fn serve_health(&self, mut stream: TcpStream) -> Result<()> {
        // Drain the request head before replying.
        let mut discard = [0u8; 1024];
        use tokio::io::AsyncReadExt;
        let _ = stream.read(&mut discard).await;

        let body = serde_json::json!({
            "status": "healthy",
            "connectedClients": self.connected_clients().await,
            "uptime": self.started_at.elapsed().as_secs(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
        .to_string();

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

async fn send_json(tx: &mpsc::Sender<Message>, msg: &SignalingMessage) {
    match serde_json::to_string(msg) {
        Ok(text) => {
            let _ = tx.send(Message::Text(text)).await;
        }
        Err(e) => log::error!("Failed to encode reply: {}", e),
    }
}

/// Server-generated temporary identifier, assigned at connect and replaced
/// once the client registers a real address.
fn temp_client_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("client_{}_{}", now_ms(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_ids_are_unique_and_prefixed() {
        let a = temp_client_id();
        let b = temp_client_id();
        assert!(a.starts_with("client_"));
        assert_ne!(a, b);
    }
}
