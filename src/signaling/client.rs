//! Signaling client: one relay connection per endpoint.
//!
//! Maintains the WebSocket to the relay, registers the local address on
//! connect, dispatches inbound frames to registered per-type handlers, and
//! reconnects automatically on unexpected close: up to five attempts with a
//! linearly increasing delay, then a terminal failed state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::{SplitStream, StreamExt};
use futures::SinkExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::signaling::message::{FileTransferRequest, MessageType, SignalingMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsRead = SplitStream<WsStream>;

/// Inbound frame handler. One per message type; registering a second handler
/// for the same type replaces the first.
pub type Handler = Box<dyn Fn(SignalingMessage) + Send + Sync>;

/// Consecutive reconnection attempts before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Base reconnection delay; attempt `n` waits `n * BASE`.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Relay connection lifecycle as seen by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Attempt `n` of [`MAX_RECONNECT_ATTEMPTS`] is pending.
    Reconnecting(u32),
    /// Reconnection attempts are exhausted. Terminal.
    Failed,
    /// Deliberately disconnected by the caller.
    Disconnected,
}

struct ClientInner {
    url: String,
    address: String,
    handlers: std::sync::Mutex<HashMap<MessageType, Handler>>,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    state_tx: watch::Sender<ConnectionState>,
    closed: AtomicBool,
    base_delay: Duration,
}

/// Handle to the relay connection. Cheap to clone.
#[derive(Clone)]
pub struct SignalingClient {
    inner: Arc<ClientInner>,
}

impl SignalingClient {
    /// Open the relay connection and register `address`. An initial
    /// connection failure is returned to the caller; automatic reconnection
    /// only covers later unexpected closes.
    pub async fn connect(url: &str, address: &str) -> Result<Self> {
        Self::connect_with_delay(url, address, RECONNECT_BASE_DELAY).await
    }

    /// Like [`connect`](Self::connect) with a custom reconnect base delay.
    /// Tests use a short delay to exercise the retry policy quickly.
    pub async fn connect_with_delay(
        url: &str,
        address: &str,
        base_delay: Duration,
    ) -> Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to signaling relay at {}", url))?;

        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        let inner = Arc::new(ClientInner {
            url: url.to_string(),
            address: address.to_string(),
            handlers: std::sync::Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
            state_tx,
            closed: AtomicBool::new(false),
            base_delay,
        });

        let ws_read = Self::install_session(&inner, ws).await?;
        Self::spawn_driver(inner.clone(), ws_read);

        Ok(Self { inner })
    }

    /// Local peer identifier, as registered at the relay.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Register the handler for one message type, replacing any previous one.
    pub fn on_message<F>(&self, msg_type: MessageType, handler: F)
    where
        F: Fn(SignalingMessage) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .expect("handler registry poisoned")
            .insert(msg_type, Box::new(handler));
    }

    /// Register a handler that forwards frames of `msg_type` into a channel.
    /// Convenience over [`on_message`](Self::on_message) for async consumers;
    /// the single-handler-per-type replacement rule still applies.
    pub fn subscribe(&self, msg_type: MessageType) -> mpsc::Receiver<SignalingMessage> {
        let (tx, rx) = mpsc::channel(32);
        self.on_message(msg_type, move |msg| {
            let _ = tx.try_send(msg);
        });
        rx
    }

    /// Send a raw frame. Fails fast when the transport is not currently open;
    /// callers should check connectivity before initiating work.
    pub async fn send(&self, msg: &SignalingMessage) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            anyhow::bail!("Not connected to signaling relay");
        }
        let guard = self.inner.outbound.lock().await;
        let tx = guard
            .as_ref()
            .context("Not connected to signaling relay")?;
        let text = serde_json::to_string(msg)?;
        tx.send(Message::Text(text))
            .await
            .map_err(|_| anyhow::anyhow!("Signaling connection closed"))
    }

    pub async fn send_offer(&self, to: &str, offer: Value) -> Result<()> {
        self.send(&SignalingMessage::offer(&self.inner.address, to, offer))
            .await
    }

    pub async fn send_answer(&self, to: &str, answer: Value) -> Result<()> {
        self.send(&SignalingMessage::answer(&self.inner.address, to, answer))
            .await
    }

    pub async fn send_ice_candidate(&self, to: &str, candidate: Value) -> Result<()> {
        self.send(&SignalingMessage::ice_candidate(
            &self.inner.address,
            to,
            candidate,
        ))
        .await
    }

    pub async fn send_file_request(&self, request: &FileTransferRequest) -> Result<()> {
        self.send(&SignalingMessage::file_request(request)).await
    }

    pub async fn send_file_response(&self, to: &str, file_id: &str, accepted: bool) -> Result<()> {
        self.send(&SignalingMessage::file_response(
            &self.inner.address,
            to,
            file_id,
            accepted,
        ))
        .await
    }

    /// Liveness probe; the relay echoes a `pong` frame.
    pub async fn send_ping(&self) -> Result<()> {
        self.send(&SignalingMessage::ping()).await
    }

    /// Close the connection deliberately. Suppresses reconnection and clears
    /// all handlers.
    pub async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(tx) = self.inner.outbound.lock().await.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        self.inner
            .handlers
            .lock()
            .expect("handler registry poisoned")
            .clear();
        self.inner.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Wire up one WebSocket: writer task, outbound handle, register frame.
    /// Returns the read half for the driver loop.
    async fn install_session(inner: &Arc<ClientInner>, ws: WsStream) -> Result<WsRead> {
        let (mut ws_write, ws_read) = ws.split();
        let (tx, mut rx) = mpsc::channel::<Message>(64);

        tokio::spawn(async move {
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

        let register = SignalingMessage::register(&inner.address);
        tx.send(Message::Text(serde_json::to_string(&register)?))
            .await
            .map_err(|_| anyhow::anyhow!("Signaling connection closed during registration"))?;

        *inner.outbound.lock().await = Some(tx);
        inner.state_tx.send_replace(ConnectionState::Connected);
        Ok(ws_read)
    }

    /// Owns the read side for the connection's whole life: dispatch inbound
    /// frames, and on unexpected close run the bounded reconnect policy.
    fn spawn_driver(inner: Arc<ClientInner>, mut ws_read: WsRead) {
        tokio::spawn(async move {
            loop {
                Self::read_loop(&inner, &mut ws_read).await;

                *inner.outbound.lock().await = None;
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                log::warn!("Disconnected from signaling relay");

                match Self::reconnect(&inner).await {
                    Some(ws) => match Self::install_session(&inner, ws).await {
                        Ok(read) => ws_read = read,
                        Err(e) => {
                            log::error!("Failed to re-establish session: {}", e);
                            inner.state_tx.send_replace(ConnectionState::Failed);
                            return;
                        }
                    },
                    None => return,
                }
            }
        });
    }

    async fn read_loop(inner: &Arc<ClientInner>, ws_read: &mut WsRead) {
        while let Some(frame) = ws_read.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<SignalingMessage>(&text) {
                    Ok(msg) => Self::dispatch(inner, msg),
                    Err(e) => log::warn!("Failed to parse signaling message: {}", e),
                },
                Ok(Message::Ping(payload)) => {
                    let guard = inner.outbound.lock().await;
                    if let Some(tx) = guard.as_ref() {
                        let _ = tx.send(Message::Pong(payload)).await;
                    }
                }
                Ok(Message::Close(_)) => return,
                Ok(_) => {}
                Err(e) => {
                    log::warn!("Signaling socket error: {}", e);
                    return;
                }
            }
        }
    }

    fn dispatch(inner: &Arc<ClientInner>, msg: SignalingMessage) {
        let handlers = inner.handlers.lock().expect("handler registry poisoned");
        if let Some(handler) = handlers.get(&msg.msg_type) {
            handler(msg);
        } else {
            log::debug!("No handler for {:?} message", msg.msg_type);
        }
    }

    /// Up to [`MAX_RECONNECT_ATTEMPTS`] attempts with linearly increasing
    /// delay. Returns the new stream, or `None` after setting the terminal
    /// failed state.
    async fn reconnect(inner: &Arc<ClientInner>) -> Option<WsStream> {
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            inner.state_tx.send_replace(ConnectionState::Reconnecting(attempt));
            log::info!(
                "Attempting to reconnect... ({}/{})",
                attempt,
                MAX_RECONNECT_ATTEMPTS
            );
            tokio::time::sleep(inner.base_delay * attempt).await;

            if inner.closed.load(Ordering::SeqCst) {
                return None;
            }
            match connect_async(&inner.url).await {
                Ok((ws, _)) => return Some(ws),
                Err(e) => log::warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
        log::error!("Max reconnection attempts reached");
        inner.state_tx.send_replace(ConnectionState::Failed);
        None
    }
}
