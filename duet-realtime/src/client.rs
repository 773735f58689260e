//! WebSocket client for the realtime server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, automatic reconnect)
//! - Handshake replay: the last `user:join` and every open
//!   `whiteboard:join` are re-sent after a reconnect, so the server
//!   answers with a fresh `whiteboard:sync`
//! - A notice stream of server events and connection changes
//!
//! The server keeps no per-connection resumption state. Events sent
//! while disconnected are not queued; `send` reports `ConnectionClosed`.

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientEvent, DrawingStroke, ProtocolError, ServerEvent, SessionId, UserId};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// What the application sees from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotice {
    /// Connection established (initially or after a reconnect)
    Connected,
    /// Connection lost
    Disconnected,
    /// Event pushed by the server
    Event(ServerEvent),
}

/// Bounded retry with capped exponential backoff.
///
/// Retry 0 is immediate; retry `n` waits
/// `initial_delay * multiplier^(n-1)`, never more than `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Never retry.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(retry.saturating_sub(1).min(64) as i32);
        Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Handshakes to replay on reconnect, in send order.
#[derive(Debug, Default)]
struct Handshakes {
    user: Option<ClientEvent>,
    whiteboards: Vec<(SessionId, ClientEvent)>,
}

impl Handshakes {
    fn remember(&mut self, event: &ClientEvent) {
        match event {
            ClientEvent::UserJoin { .. } => self.user = Some(event.clone()),
            ClientEvent::WhiteboardJoin { session_id, .. } => {
                self.whiteboards.retain(|(id, _)| id != session_id);
                self.whiteboards.push((session_id.clone(), event.clone()));
            }
            ClientEvent::WhiteboardLeave { session_id } => {
                self.whiteboards.retain(|(id, _)| id != session_id);
            }
            _ => {}
        }
    }

    fn replay(&self) -> Vec<ClientEvent> {
        self.user
            .iter()
            .cloned()
            .chain(self.whiteboards.iter().map(|(_, e)| e.clone()))
            .collect()
    }
}

/// State shared between the client handle and its connection tasks.
struct Shared {
    server_url: String,
    policy: ReconnectPolicy,
    state: RwLock<ConnectionState>,
    outgoing_tx: RwLock<Option<mpsc::Sender<String>>>,
    handshakes: Mutex<Handshakes>,
    event_tx: mpsc::Sender<ClientNotice>,
    /// Cleared by an explicit disconnect.
    auto_reconnect: AtomicBool,
    /// Bumped per established socket; stale reader tasks see a mismatch.
    generation: AtomicU64,
}

impl Shared {
    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    async fn connection_lost(self: Arc<Self>, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.outgoing_tx.write().await.take();
        let _ = self.event_tx.send(ClientNotice::Disconnected).await;

        if !self.auto_reconnect.load(Ordering::SeqCst) || self.policy.max_attempts == 0 {
            self.set_state(ConnectionState::Disconnected).await;
            return;
        }
        log::info!("Connection to {} lost, reconnecting", self.server_url);
        self.set_state(ConnectionState::Reconnecting).await;
        tokio::spawn(reconnect(self));
    }
}

/// Open one socket, replay handshakes and start the reader/writer tasks.
async fn establish(shared: Arc<Shared>) -> Result<(), ProtocolError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(shared.server_url.as_str())
        .await
        .map_err(|e| {
            log::debug!("Connect to {} failed: {e}", shared.server_url);
            ProtocolError::ConnectionClosed
        })?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();
    let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
    tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_writer.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_writer.close().await;
    });

    // Handshakes must reach the server before anything the app sends next.
    let replay = shared.handshakes.lock().await.replay();
    if !replay.is_empty() {
        log::info!("Replaying {} handshakes", replay.len());
    }
    for event in replay {
        out_tx
            .send(event.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
    }

    *shared.outgoing_tx.write().await = Some(out_tx);
    shared.set_state(ConnectionState::Connected).await;
    let _ = shared.event_tx.send(ClientNotice::Connected).await;

    let reader = shared.clone();
    tokio::spawn(async move {
        while let Some(msg) = ws_reader.next().await {
            match msg {
                Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                    Ok(event) => {
                        let _ = reader.event_tx.send(ClientNotice::Event(event)).await;
                    }
                    Err(e) => log::warn!("Undecodable server event: {e}"),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
        reader.connection_lost(generation).await;
    });

    Ok(())
}

fn reconnect(shared: Arc<Shared>) -> BoxFuture<'static, ()> {
    async move {
        for retry in 0..shared.policy.max_attempts {
            tokio::time::sleep(shared.policy.delay_for(retry)).await;
            if !shared.auto_reconnect.load(Ordering::SeqCst) {
                break;
            }
            match establish(shared.clone()).await {
                Ok(()) => {
                    log::info!("Reconnected to {} after {} retries", shared.server_url, retry + 1);
                    return;
                }
                Err(e) => log::warn!("Reconnect attempt {} to {} failed: {e}", retry + 1, shared.server_url),
            }
        }
        shared.set_state(ConnectionState::Disconnected).await;
    }
    .boxed()
}

/// The realtime client.
pub struct RealtimeClient {
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<ClientNotice>>,
}

impl RealtimeClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_policy(server_url, ReconnectPolicy::default())
    }

    pub fn with_policy(server_url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let shared = Shared {
            server_url: server_url.into(),
            policy,
            state: RwLock::new(ConnectionState::Disconnected),
            outgoing_tx: RwLock::new(None),
            handshakes: Mutex::new(Handshakes::default()),
            event_tx,
            auto_reconnect: AtomicBool::new(true),
            generation: AtomicU64::new(0),
        };
        Self {
            shared: Arc::new(shared),
            event_rx: Some(event_rx),
        }
    }

    /// Take the notice receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientNotice>> {
        self.event_rx.take()
    }

    /// Connect, retrying per the policy.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        let shared = &self.shared;
        shared.auto_reconnect.store(true, Ordering::SeqCst);
        shared.set_state(ConnectionState::Connecting).await;

        let mut last_error = match establish(shared.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        for retry in 0..shared.policy.max_attempts {
            shared.set_state(ConnectionState::Reconnecting).await;
            tokio::time::sleep(shared.policy.delay_for(retry)).await;
            match establish(shared.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => last_error = e,
            }
        }

        shared.set_state(ConnectionState::Disconnected).await;
        log::warn!("Giving up on {} after {} retries", shared.server_url, shared.policy.max_attempts);
        Err(last_error)
    }

    /// Close the socket and stop reconnecting.
    pub async fn disconnect(&self) {
        self.shared.auto_reconnect.store(false, Ordering::SeqCst);
        self.shared.outgoing_tx.write().await.take();
        self.shared.set_state(ConnectionState::Disconnected).await;
    }

    /// Send one event. Join events are remembered for replay.
    pub async fn send(&self, event: ClientEvent) -> Result<(), ProtocolError> {
        self.shared.handshakes.lock().await.remember(&event);
        let text = event.encode()?;
        let tx = self
            .shared
            .outgoing_tx
            .read()
            .await
            .clone()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(text).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn join_user(
        &self,
        user_id: UserId,
        peer_user_id: Option<UserId>,
        username: Option<String>,
    ) -> Result<(), ProtocolError> {
        self.send(ClientEvent::UserJoin {
            user_id,
            peer_user_id,
            username,
        })
        .await
    }

    pub async fn join_whiteboard(
        &self,
        session_id: SessionId,
        user_id: UserId,
        peer_user_id: Option<UserId>,
        username: Option<String>,
    ) -> Result<(), ProtocolError> {
        self.send(ClientEvent::WhiteboardJoin {
            session_id,
            user_id,
            peer_user_id,
            username,
        })
        .await
    }

    pub async fn send_stroke(&self, session_id: SessionId, stroke: DrawingStroke) -> Result<(), ProtocolError> {
        stroke.validate()?;
        self.send(ClientEvent::WhiteboardStroke { session_id, stroke }).await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientEvent::Ping).await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.shared.server_url
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.shared.policy
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.shared.auto_reconnect.store(false, Ordering::SeqCst);
        if let Ok(mut tx) = self.shared.outgoing_tx.try_write() {
            tx.take();
        }
    }
}
