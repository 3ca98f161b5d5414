//! # Collector transport
//!
//! ## Responsibility
//! Keeps at most one websocket open to the rtcstats collector and writes
//! [`OutboundMessage`]s to it.
//!
//! ## State machine
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected -> Connecting -> ...
//!                     |   ^
//!                     +---+  handshake failed, retry after reconnect_delay
//! ```
//! A channel error, a close frame from the collector, or a missed pong all
//! lead back to `Disconnected`, and a new handshake starts after
//! `reconnect_delay`. There is no terminal state while a handle is alive.
//!
//! ## Delivery
//! [`TransportHandle::send`] never blocks. Messages that reach the manager
//! while it is not `Connected` are dropped, not queued: a live stats stream
//! prefers fresh data over a backlog.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{PushError, Result};
use crate::messages::OutboundMessage;

/// Websocket sub-protocol announced to the collector.
pub const SUBPROTOCOL: &str = "1.0_JVB";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Link state as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting   => write!(f, "connecting"),
            ConnectionState::Connected    => write!(f, "connected"),
        }
    }
}

/// Settings for the collector link.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Collector URL (`ws://` or `wss://`).
    pub url: String,
    /// Value of `Sec-WebSocket-Protocol`.
    pub protocol: String,
    /// This agent's identity, sent as the handshake `Origin`.
    pub identity: String,
    /// Wait between a failure and the next handshake.
    pub reconnect_delay: Duration,
    /// Interval between keepalive pings.
    pub ping_interval: Duration,
}

impl TransportConfig {
    /// Create a config with sensible defaults.
    ///
    /// - protocol: [`SUBPROTOCOL`]
    /// - reconnect_delay: 5 s
    /// - ping_interval: 20 s
    pub fn new(url: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            protocol: SUBPROTOCOL.to_string(),
            identity: identity.into(),
            reconnect_delay: Duration::from_secs(5),
            ping_interval: Duration::from_secs(20),
        }
    }
}

/// Anything the poll loop can hand messages to.
pub trait MessageSink {
    /// Hand off one message. Must not block.
    fn send(&self, msg: OutboundMessage);
}

/// Cheap, cloneable sender side of the transport.
#[derive(Clone)]
pub struct TransportHandle {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    state: watch::Receiver<ConnectionState>,
    dropped: Arc<AtomicU64>,
}

impl TransportHandle {
    /// Current link state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Messages discarded because the link was down.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MessageSink for TransportHandle {
    fn send(&self, msg: OutboundMessage) {
        // Only fails once the manager task has exited.
        if self.tx.send(msg).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Why a connected session ended.
enum SessionEnd {
    /// The channel failed; reconnect.
    Lost(PushError),
    /// Every handle was dropped; shut down.
    HandlesClosed,
}

/// Owner of the collector websocket. Drive it with [`run`](Self::run).
pub struct TransportManager {
    config: TransportConfig,
    rx: mpsc::UnboundedReceiver<OutboundMessage>,
    state: watch::Sender<ConnectionState>,
    dropped: Arc<AtomicU64>,
}

impl TransportManager {
    /// Build a manager and the handle used to feed it.
    pub fn new(config: TransportConfig) -> (Self, TransportHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let dropped = Arc::new(AtomicU64::new(0));
        let manager = Self {
            config,
            rx,
            state: state_tx,
            dropped: Arc::clone(&dropped),
        };
        let handle = TransportHandle {
            tx,
            state: state_rx,
            dropped,
        };
        (manager, handle)
    }

    /// Connect, serve, and reconnect until every [`TransportHandle`] is gone.
    pub async fn run(mut self) {
        let mut consecutive_failures: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);

            let Some(result) = self.handshake_while_dropping().await else {
                debug!("transport: all handles dropped during handshake");
                return;
            };

            match result {
                Ok(ws) => {
                    consecutive_failures = 0;
                    self.discard_pending();
                    self.set_state(ConnectionState::Connected);
                    info!(url = %self.config.url, "transport: connected to collector");

                    match self.serve(ws).await {
                        SessionEnd::HandlesClosed => {
                            self.set_state(ConnectionState::Disconnected);
                            debug!("transport: all handles dropped, closing");
                            return;
                        }
                        SessionEnd::Lost(e) => {
                            warn!(error = %e, "transport: connection lost, reconnecting");
                        }
                    }
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    warn!(
                        error = %e,
                        consecutive_failures,
                        retry_in_ms = self.config.reconnect_delay.as_millis() as u64,
                        "transport: handshake failed"
                    );
                }
            }

            if !self.sleep_while_dropping(self.config.reconnect_delay).await {
                debug!("transport: all handles dropped during backoff");
                return;
            }
        }
    }

    /// Run the handshake, discarding any message that arrives meanwhile.
    /// `None` means every handle was dropped.
    async fn handshake_while_dropping(&mut self) -> Option<Result<WsStream>> {
        let connect = handshake(&self.config);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => return Some(result),
                msg = self.rx.recv() => match msg {
                    Some(msg) => discard(&self.dropped, &msg),
                    None => return None,
                },
            }
        }
    }

    /// Drop whatever was queued before the link came up.
    fn discard_pending(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            discard(&self.dropped, &msg);
        }
    }

    /// Wait `delay`, discarding any message that arrives meanwhile.
    /// Returns `false` if every handle was dropped.
    async fn sleep_while_dropping(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                msg = self.rx.recv() => match msg {
                    Some(msg) => discard(&self.dropped, &msg),
                    None => return false,
                },
            }
        }
    }

    /// Forward messages and keep the link alive until it fails.
    async fn serve(&mut self, ws: WsStream) -> SessionEnd {
        let url = self.config.url.clone();
        let lost = |detail: String| SessionEnd::Lost(PushError::Transport {
            url: url.clone(),
            detail,
        });

        let (mut sink, mut stream) = ws.split();
        let period = self.config.ping_interval;
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    let Some(msg) = msg else {
                        let _ = sink.close().await;
                        return SessionEnd::HandlesClosed;
                    };
                    let text = match serde_json::to_string(&msg) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, kind = msg.kind(), "transport: could not encode message");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        return lost(format!("write failed: {e}"));
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Close(reason))) => {
                        return lost(format!("closed by collector: {reason:?}"));
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        awaiting_pong = false;
                        debug!(len = text.len(), "transport: ignoring collector text frame");
                    }
                    Some(Ok(_)) => awaiting_pong = false,
                    Some(Err(e)) => return lost(format!("read failed: {e}")),
                    None => return lost("stream ended".to_string()),
                },
                _ = ping.tick() => {
                    if awaiting_pong {
                        return lost(format!("no pong within {}ms", period.as_millis()));
                    }
                    if let Err(e) = sink.send(WsMessage::Ping(Vec::new())).await {
                        return lost(format!("ping failed: {e}"));
                    }
                    awaiting_pong = true;
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

fn discard(dropped: &AtomicU64, msg: &OutboundMessage) {
    dropped.fetch_add(1, Ordering::Relaxed);
    debug!(
        kind = msg.kind(),
        stats_session_id = msg.stats_session_id(),
        "transport: link down, dropping message"
    );
}

/// Open the websocket with the configured sub-protocol and origin.
async fn handshake(config: &TransportConfig) -> Result<WsStream> {
    let err = |detail: String| PushError::Transport {
        url: config.url.clone(),
        detail,
    };

    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| err(format!("invalid request: {e}")))?;
    let protocol = HeaderValue::from_str(&config.protocol)
        .map_err(|e| err(format!("invalid protocol header: {e}")))?;
    let origin = HeaderValue::from_str(&config.identity)
        .map_err(|e| err(format!("invalid origin header: {e}")))?;
    request.headers_mut().insert("Sec-WebSocket-Protocol", protocol);
    request.headers_mut().insert("Origin", origin);

    let (ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| err(e.to_string()))?;
    Ok(ws)
}
