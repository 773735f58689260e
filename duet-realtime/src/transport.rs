//! Per-connection lifecycle and event dispatch.
//!
//! ```text
//!             ┌──────────────── Hub ────────────────┐
//! frame ──► handle_text ──► dispatch ──┬─► ConnectionRegistry
//!                                      ├─► SignalingRelay
//!                                      └─► WhiteboardManager ──► SnapshotStore
//!                                                 │
//! socket ◄── outbound queue ◄── ConnectionHandle ◄┘
//! ```
//!
//! The hub owns all shared state and holds no socket. The server task
//! feeds it decoded frames and drains each connection's queue, so the
//! whole dispatch path can be driven directly in tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::protocol::{ClientEvent, ConnectionId, RemoteCursor, ServerEvent, SessionId, UserId};
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::server::{ServerConfig, ServerStats};
use crate::signaling::{RelayError, SignalingRelay};
use crate::storage::{MemoryStore, SnapshotStore};
use crate::whiteboard::{WhiteboardError, WhiteboardManager};

/// What the hub knows about one open connection.
///
/// Starts unidentified; `user:join` or `whiteboard:join` binds a user.
#[derive(Debug)]
pub struct ConnectionContext {
    handle: ConnectionHandle,
    user_id: Option<UserId>,
    username: Option<String>,
    peer_user_id: Option<UserId>,
}

impl ConnectionContext {
    fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            user_id: None,
            username: None,
            peer_user_id: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    pub fn is_identified(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    fn display_name(&self) -> String {
        match (&self.username, &self.user_id) {
            (Some(name), _) => name.clone(),
            (None, Some(user)) => user.to_string(),
            (None, None) => String::new(),
        }
    }
}

#[derive(Default)]
struct HubCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_events: AtomicU64,
}

/// Composition root: registry, relay, whiteboards and store.
pub struct Hub {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    relay: SignalingRelay,
    whiteboards: WhiteboardManager,
    store: Arc<dyn SnapshotStore>,
    counters: HubCounters,
    dropped: Arc<AtomicU64>,
}

impl Hub {
    pub fn new(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = SignalingRelay::new(registry.clone());
        let whiteboards = WhiteboardManager::new(registry.clone(), store.clone(), config.max_participants);
        Self {
            config,
            registry,
            relay,
            whiteboards,
            store,
            counters: HubCounters::default(),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Hub backed by a [`MemoryStore`].
    pub fn in_memory(config: ServerConfig) -> Self {
        Self::new(config, Arc::new(MemoryStore::new()))
    }

    /// Open a connection slot. The receiver is the connection's outbound queue.
    pub fn connect(&self) -> (ConnectionContext, mpsc::Receiver<Arc<ServerEvent>>) {
        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        self.counters.active_connections.fetch_add(1, Ordering::Relaxed);
        let (handle, rx) = ConnectionHandle::channel(self.config.outbound_capacity, self.dropped.clone());
        (ConnectionContext::new(handle), rx)
    }

    /// Decode one text frame and dispatch it. Malformed frames are
    /// answered with an `error` event.
    pub async fn handle_text(&self, ctx: &mut ConnectionContext, text: &str) {
        match ClientEvent::decode(text) {
            Ok(event) => self.dispatch(ctx, event).await,
            Err(e) => {
                log::warn!("Malformed event from connection {}: {e}", ctx.id());
                reply(ctx, ServerEvent::error(e.to_string()));
            }
        }
    }

    pub async fn dispatch(&self, ctx: &mut ConnectionContext, event: ClientEvent) {
        self.counters.total_events.fetch_add(1, Ordering::Relaxed);
        log::trace!("{} from connection {}", event.name(), ctx.id());

        match event {
            ClientEvent::UserJoin {
                user_id,
                peer_user_id,
                username,
            } => self.user_join(ctx, user_id, peer_user_id, username).await,

            ClientEvent::WhiteboardJoin {
                session_id,
                user_id,
                peer_user_id,
                username,
            } => {
                if ctx.user_id.as_ref() != Some(&user_id) {
                    self.identify(ctx, user_id.clone(), username.clone()).await;
                }
                let username = username.unwrap_or_else(|| ctx.display_name());
                let result = self
                    .whiteboards
                    .join(&session_id, &user_id, peer_user_id.as_ref(), &username, &ctx.handle)
                    .await;
                whiteboard_result(ctx, &session_id, result);
            }

            ClientEvent::WhiteboardLeave { session_id } => {
                let result = match ctx.user_id.clone() {
                    Some(user) => self.whiteboards.leave(&session_id, &user).await,
                    None => Err(WhiteboardError::NotIdentified),
                };
                whiteboard_result(ctx, &session_id, result);
            }

            ClientEvent::WhiteboardStroke { session_id, stroke } => {
                let result = match ctx.user_id.clone() {
                    Some(user) => self.whiteboards.append_stroke(&session_id, &user, stroke).await,
                    None => Err(WhiteboardError::NotIdentified),
                };
                whiteboard_result(ctx, &session_id, result);
            }

            ClientEvent::WhiteboardCursor { session_id, x, y } => {
                if let Some(user_id) = ctx.user_id.clone() {
                    let cursor = RemoteCursor {
                        user_id,
                        username: ctx.display_name(),
                        x,
                        y,
                    };
                    self.whiteboards.broadcast_cursor(&session_id, cursor).await;
                }
            }

            ClientEvent::WhiteboardClear { session_id } => {
                let result = match ctx.user_id.clone() {
                    Some(user) => self.whiteboards.clear(&session_id, &user).await,
                    None => Err(WhiteboardError::NotIdentified),
                };
                whiteboard_result(ctx, &session_id, result);
            }

            ClientEvent::WhiteboardSave {
                session_id,
                content,
                thumbnail,
            } => {
                let result = match ctx.user_id {
                    Some(_) => self.whiteboards.save_snapshot(&session_id, content, thumbnail).await,
                    None => Err(WhiteboardError::NotIdentified),
                };
                match result {
                    Ok(()) => reply(ctx, ServerEvent::Saved { session_id }),
                    Err(e) => whiteboard_error(ctx, &session_id, e),
                }
            }

            ClientEvent::CallInitiate { to_user_id, call_type } => {
                let result = match ctx.user_id.clone() {
                    Some(from) => self.relay.initiate_call(&from, &to_user_id, call_type).await,
                    None => Err(RelayError::NotIdentified),
                };
                match result {
                    Ok(call_id) => log::info!("Call {call_id} ringing {to_user_id}"),
                    Err(e) => call_error(ctx, to_user_id, e),
                }
            }

            ClientEvent::CallAccept { call_id, to_user_id } => {
                let result = match ctx.user_id.clone() {
                    Some(from) => self.relay.accept_call(&call_id, &from, &to_user_id).await,
                    None => Err(RelayError::NotIdentified),
                };
                relay_result(ctx, to_user_id, result);
            }

            ClientEvent::CallReject { call_id, to_user_id } => {
                let result = match ctx.user_id.clone() {
                    Some(from) => self.relay.reject_call(&call_id, &from, &to_user_id).await,
                    None => Err(RelayError::NotIdentified),
                };
                relay_result(ctx, to_user_id, result);
            }

            ClientEvent::WebRtcOffer {
                to_user_id,
                payload,
                call_id,
            } => {
                let result = match ctx.user_id.clone() {
                    Some(from) => self.relay.forward_offer(&from, &to_user_id, payload, call_id).await,
                    None => Err(RelayError::NotIdentified),
                };
                relay_result(ctx, to_user_id, result);
            }

            ClientEvent::WebRtcAnswer {
                to_user_id,
                payload,
                call_id,
            } => {
                let result = match ctx.user_id.clone() {
                    Some(from) => self.relay.forward_answer(&from, &to_user_id, payload, call_id).await,
                    None => Err(RelayError::NotIdentified),
                };
                relay_result(ctx, to_user_id, result);
            }

            ClientEvent::WebRtcIceCandidate {
                to_user_id,
                payload,
                call_id,
            } => {
                let result = match ctx.user_id.clone() {
                    Some(from) => {
                        self.relay
                            .forward_ice_candidate(&from, &to_user_id, payload, call_id)
                            .await
                    }
                    None => Err(RelayError::NotIdentified),
                };
                relay_result(ctx, to_user_id, result);
            }

            ClientEvent::CallEnd { to_user_id, call_id } => {
                // Advisory: an undeliverable hang-up is not reported back.
                if let Some(from) = ctx.user_id.clone() {
                    let _ = self.relay.end_call(&from, &to_user_id, call_id).await;
                }
            }

            ClientEvent::Ping => reply(ctx, ServerEvent::Pong),
        }
    }

    /// Tear down a closed connection.
    ///
    /// Only the connection still owning its user triggers the offline
    /// broadcast; a connection superseded by a newer login goes quietly.
    pub async fn disconnect(&self, ctx: ConnectionContext) {
        self.counters.active_connections.fetch_sub(1, Ordering::Relaxed);

        let Some(user_id) = self.registry.unregister(ctx.id()).await else {
            log::debug!("Connection {} closed without owning a user", ctx.id());
            return;
        };

        let mut notify: HashSet<UserId> = self.whiteboards.depart(&user_id).await;
        if let Some(peer) = ctx.peer_user_id {
            notify.insert(peer);
        }
        notify.remove(&user_id);

        let offline = Arc::new(ServerEvent::UserOffline {
            user_id: user_id.clone(),
        });
        let delivered = self.registry.deliver_to(&notify, offline).await;
        log::info!("User {user_id} offline ({delivered} peers notified)");
    }

    /// Evict idle sessions per the configured timeout.
    pub async fn reap_idle_sessions(&self) -> usize {
        let timeout = Duration::from_secs(self.config.session_idle_timeout_secs);
        self.whiteboards.evict_idle(timeout).await
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_events: self.counters.total_events.load(Ordering::Relaxed),
            dropped_deliveries: self.dropped.load(Ordering::Relaxed),
            online_users: self.registry.online_count().await,
            active_sessions: self.whiteboards.session_count().await,
            evicted_sessions: self.whiteboards.evicted_sessions(),
            strokes_appended: self.whiteboards.strokes_appended(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn relay(&self) -> &SignalingRelay {
        &self.relay
    }

    pub fn whiteboards(&self) -> &WhiteboardManager {
        &self.whiteboards
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    async fn user_join(
        &self,
        ctx: &mut ConnectionContext,
        user_id: UserId,
        peer_user_id: Option<UserId>,
        username: Option<String>,
    ) {
        self.identify(ctx, user_id.clone(), username).await;
        ctx.peer_user_id = peer_user_id.clone();

        let Some(peer) = peer_user_id else {
            return;
        };
        if let Some(peer_handle) = self.registry.resolve(&peer).await {
            peer_handle.deliver(Arc::new(ServerEvent::UserOnline { user_id }));
            reply(ctx, ServerEvent::UserOnline { user_id: peer });
        }
    }

    async fn identify(&self, ctx: &mut ConnectionContext, user_id: UserId, username: Option<String>) {
        if let Some(evicted) = self.registry.register(user_id.clone(), ctx.handle.clone()).await {
            log::info!(
                "User {user_id} re-joined on connection {}, superseding {}",
                ctx.id(),
                evicted.id()
            );
        } else {
            log::info!("User {user_id} identified on connection {}", ctx.id());
        }
        ctx.user_id = Some(user_id);
        if username.is_some() {
            ctx.username = username;
        }
    }
}

fn reply(ctx: &ConnectionContext, event: ServerEvent) {
    ctx.handle.deliver(Arc::new(event));
}

fn whiteboard_result<T>(ctx: &ConnectionContext, session_id: &SessionId, result: Result<T, WhiteboardError>) {
    if let Err(e) = result {
        whiteboard_error(ctx, session_id, e);
    }
}

fn whiteboard_error(ctx: &ConnectionContext, session_id: &SessionId, error: WhiteboardError) {
    match &error {
        WhiteboardError::Store(_) => log::error!("Whiteboard {session_id}: {error}"),
        _ => log::warn!("Whiteboard {session_id}: {error}"),
    }
    reply(
        ctx,
        ServerEvent::WhiteboardError {
            session_id: Some(session_id.clone()),
            message: error.to_string(),
        },
    );
}

fn relay_result(ctx: &ConnectionContext, to_user_id: UserId, result: Result<(), RelayError>) {
    if let Err(e) = result {
        call_error(ctx, to_user_id, e);
    }
}

fn call_error(ctx: &ConnectionContext, to_user_id: UserId, error: RelayError) {
    reply(
        ctx,
        ServerEvent::CallError {
            to_user_id: Some(to_user_id),
            message: error.to_string(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CallType, DrawingStroke, Point};

    type Rx = mpsc::Receiver<Arc<ServerEvent>>;

    fn hub() -> Hub {
        Hub::in_memory(ServerConfig::default())
    }

    fn drain(rx: &mut Rx) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push((*e).clone());
        }
        events
    }

    async fn joined(hub: &Hub, user: u64, peer: Option<u64>) -> (ConnectionContext, Rx) {
        let (mut ctx, rx) = hub.connect();
        hub.dispatch(
            &mut ctx,
            ClientEvent::UserJoin {
                user_id: UserId::from(user),
                peer_user_id: peer.map(UserId::from),
                username: None,
            },
        )
        .await;
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_user_join_presence_both_ways() {
        let hub = hub();
        let (_a, mut a_rx) = joined(&hub, 1, Some(2)).await;
        assert!(drain(&mut a_rx).is_empty());

        let (_b, mut b_rx) = joined(&hub, 2, Some(1)).await;
        assert_eq!(drain(&mut a_rx), vec![ServerEvent::UserOnline { user_id: UserId::from(2) }]);
        assert_eq!(drain(&mut b_rx), vec![ServerEvent::UserOnline { user_id: UserId::from(1) }]);
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_reply() {
        let hub = hub();
        let (mut ctx, mut rx) = hub.connect();
        hub.handle_text(&mut ctx, r#"{"event":"whiteboard:stroke","data":{}}"#).await;
        assert!(matches!(drain(&mut rx).as_slice(), [ServerEvent::Error { .. }]));
    }

    #[tokio::test]
    async fn test_unidentified_call_rejected() {
        let hub = hub();
        let (mut ctx, mut rx) = hub.connect();
        hub.dispatch(
            &mut ctx,
            ClientEvent::CallInitiate {
                to_user_id: UserId::from(2),
                call_type: CallType::Audio,
            },
        )
        .await;
        match drain(&mut rx).as_slice() {
            [ServerEvent::CallError { message, .. }] => assert!(message.contains("not joined")),
            other => panic!("Expected CallError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_to_offline_peer_reports_error() {
        let hub = hub();
        let (mut a, mut a_rx) = joined(&hub, 1, None).await;
        hub.dispatch(
            &mut a,
            ClientEvent::CallInitiate {
                to_user_id: UserId::from(2),
                call_type: CallType::Video,
            },
        )
        .await;
        assert_eq!(
            drain(&mut a_rx),
            vec![ServerEvent::CallError {
                to_user_id: Some(UserId::from(2)),
                message: "User 2 is offline".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_stroke_to_unknown_session_reports_error() {
        let hub = hub();
        let (mut a, mut a_rx) = joined(&hub, 1, None).await;
        let stroke = DrawingStroke {
            id: "s1".into(),
            user_id: UserId::from(1),
            points: vec![Point::new(0.0, 0.0)],
            color: "#000000".into(),
            brush_size: 1.0,
            opacity: 100.0,
            timestamp: 0,
        };
        hub.dispatch(
            &mut a,
            ClientEvent::WhiteboardStroke {
                session_id: SessionId::parse("nope").unwrap(),
                stroke,
            },
        )
        .await;
        assert!(matches!(
            drain(&mut a_rx).as_slice(),
            [ServerEvent::WhiteboardError { session_id: Some(_), .. }]
        ));
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let hub = hub();
        let (mut ctx, mut rx) = hub.connect();
        hub.dispatch(&mut ctx, ClientEvent::Ping).await;
        assert_eq!(drain(&mut rx), vec![ServerEvent::Pong]);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_peer_and_cleans_registry() {
        let hub = hub();
        let (a, _a_rx) = joined(&hub, 1, Some(2)).await;
        let (_b, mut b_rx) = joined(&hub, 2, Some(1)).await;
        drain(&mut b_rx);

        hub.disconnect(a).await;
        assert!(hub.registry().resolve(&UserId::from(1)).await.is_none());
        assert_eq!(drain(&mut b_rx), vec![ServerEvent::UserOffline { user_id: UserId::from(1) }]);

        let stats = hub.stats().await;
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.online_users, 1);
    }

    #[tokio::test]
    async fn test_superseded_connection_disconnects_quietly() {
        let hub = hub();
        let (old, _old_rx) = joined(&hub, 1, Some(2)).await;
        let (_b, mut b_rx) = joined(&hub, 2, Some(1)).await;
        let (_new, _new_rx) = joined(&hub, 1, Some(2)).await;
        drain(&mut b_rx);

        hub.disconnect(old).await;
        assert!(hub.registry().is_online(&UserId::from(1)).await);
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn test_whiteboard_join_identifies_connection() {
        let hub = hub();
        let (mut ctx, mut rx) = hub.connect();
        hub.dispatch(
            &mut ctx,
            ClientEvent::WhiteboardJoin {
                session_id: SessionId::parse("wb-1").unwrap(),
                user_id: UserId::from(7),
                peer_user_id: None,
                username: Some("grace".into()),
            },
        )
        .await;
        assert!(ctx.is_identified());
        assert!(hub.registry().is_online(&UserId::from(7)).await);
        assert!(matches!(drain(&mut rx).as_slice(), [ServerEvent::WhiteboardSync { .. }]));
    }
}
