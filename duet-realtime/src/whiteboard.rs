//! Whiteboard sessions: one authoritative, append-only stroke log per
//! session, fanned out to the other participants as strokes arrive.
//!
//! ```text
//! whiteboard:join ──► get_or_create ──► sync (caller only) + user-joined (others)
//! whiteboard:stroke ─► append under session lock ──► stroke-received (others)
//! whiteboard:clear ──► reset under session lock ──► cleared (everyone)
//! ```
//!
//! Each session sits behind its own mutex and every broadcast for a
//! session is queued while that lock is held, so the order peers
//! receive strokes in is the order of the log. Sessions never block
//! each other.
//!
//! Eviction persists a session under its own lock and then marks it
//! retired. Anyone who locks a retired session drops it from the table
//! and looks the id up again, so no write lands on a log that is gone.
//!
//! Consistency is eventual: live peers may briefly render concurrent
//! strokes from two authors in a different relative order than the log,
//! but any later join (or reconnect) gets the log order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::protocol::{DrawingStroke, RemoteCursor, ServerEvent, SessionId, UserId};
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::storage::{self, RenderedSnapshot, SnapshotStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum WhiteboardError {
    #[error("Session {0} does not exist; join it first")]
    SessionNotFound(SessionId),
    #[error("Session {session_id} is full ({capacity} participants)")]
    SessionFull { session_id: SessionId, capacity: usize },
    #[error("User {user_id} is not a participant of session {session_id}")]
    NotParticipant { session_id: SessionId, user_id: UserId },
    #[error("Connection has not joined as a user yet")]
    NotIdentified,
    #[error("Storage failure: {0}")]
    Store(#[from] StoreError),
}

/// One shared canvas.
///
/// The roster is an ordered set of user ids, not a fixed pair. It
/// starts with the joining user and their declared peer; further users
/// may be added up to the manager's participant cap.
#[derive(Debug)]
pub struct WhiteboardSession {
    session_id: SessionId,
    /// Ordered, de-duplicated participant roster.
    participants: Vec<UserId>,
    /// Participants that have joined and not left or disconnected.
    present: HashSet<UserId>,
    /// Server arrival order.
    strokes: Vec<DrawingStroke>,
    is_active: bool,
    created_at: SystemTime,
    last_activity: Instant,
}

impl WhiteboardSession {
    pub fn new(session_id: SessionId, user_id: UserId, peer_user_id: Option<UserId>) -> Self {
        let mut session = Self {
            session_id,
            participants: Vec::with_capacity(2),
            present: HashSet::new(),
            strokes: Vec::new(),
            is_active: true,
            created_at: SystemTime::now(),
            last_activity: Instant::now(),
        };
        session.add_participant(user_id);
        if let Some(peer) = peer_user_id {
            session.add_participant(peer);
        }
        session
    }

    fn with_strokes(mut self, strokes: Vec<DrawingStroke>) -> Self {
        self.strokes = strokes;
        self
    }

    /// Returns false if already on the roster.
    pub fn add_participant(&mut self, user_id: UserId) -> bool {
        if self.participants.contains(&user_id) {
            return false;
        }
        self.participants.push(user_id);
        true
    }

    pub fn remove_participant(&mut self, user_id: &UserId) -> bool {
        self.present.remove(user_id);
        let before = self.participants.len();
        self.participants.retain(|p| p != user_id);
        self.participants.len() != before
    }

    pub fn is_participant(&self, user_id: &UserId) -> bool {
        self.participants.contains(user_id)
    }

    pub fn is_present(&self, user_id: &UserId) -> bool {
        self.present.contains(user_id)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn participants(&self) -> &[UserId] {
        &self.participants
    }

    pub fn strokes(&self) -> &[DrawingStroke] {
        &self.strokes
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn others<'a>(&'a self, user_id: &'a UserId) -> impl Iterator<Item = &'a UserId> + 'a {
        self.participants.iter().filter(move |p| *p != user_id)
    }
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    /// The session was materialized by this join (fresh or rehydrated).
    pub created: bool,
    /// Strokes in the `sync` sent to the caller.
    pub stroke_count: usize,
}

type SharedSession = Arc<Mutex<WhiteboardSession>>;

pub struct WhiteboardManager {
    sessions: RwLock<HashMap<SessionId, SharedSession>>,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn SnapshotStore>,
    max_participants: usize,
    strokes_appended: AtomicU64,
    evicted_sessions: AtomicU64,
}

impl WhiteboardManager {
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn SnapshotStore>, max_participants: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            registry,
            store,
            max_participants: max_participants.max(2),
            strokes_appended: AtomicU64::new(0),
            evicted_sessions: AtomicU64::new(0),
        }
    }

    /// Attach `user_id` to the session (creating it on first join), send
    /// the full stroke log to `caller` and announce the join to the
    /// other participants.
    pub async fn join(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        peer_user_id: Option<&UserId>,
        username: &str,
        caller: &ConnectionHandle,
    ) -> Result<JoinOutcome, WhiteboardError> {
        let (mut session, created) = loop {
            let (session, created) = self.get_or_create(session_id, user_id, peer_user_id).await;
            let guard = session.clone().lock_owned().await;
            if guard.is_active {
                break (guard, created);
            }
            drop(guard);
            self.retire(session_id, &session).await;
        };

        if !session.is_participant(user_id) {
            if session.participants.len() >= self.max_participants {
                return Err(WhiteboardError::SessionFull {
                    session_id: session_id.clone(),
                    capacity: self.max_participants,
                });
            }
            // Sessions are keyed by id alone; a different pair reusing the id
            // lands in the same canvas.
            if session.participants.len() >= 2 {
                log::warn!(
                    "User {user_id} joined session {session_id} whose roster is {:?}",
                    session.participants
                );
            }
            session.add_participant(user_id.clone());
        }
        if let Some(peer) = peer_user_id {
            if !session.is_participant(peer) && session.participants.len() < self.max_participants {
                session.add_participant(peer.clone());
            }
        }
        session.present.insert(user_id.clone());
        session.touch();

        let stroke_count = session.strokes.len();
        caller.deliver(Arc::new(ServerEvent::WhiteboardSync {
            session_id: session_id.clone(),
            strokes: session.strokes.clone(),
            participants: session.participants.clone(),
        }));

        let joined = Arc::new(ServerEvent::UserJoined {
            session_id: session_id.clone(),
            user_id: user_id.clone(),
            username: username.to_string(),
        });
        self.registry.deliver_to(session.others(user_id), joined).await;

        log::info!(
            "User {user_id} joined whiteboard {session_id} ({stroke_count} strokes, {} participants)",
            session.participants.len()
        );
        Ok(JoinOutcome { created, stroke_count })
    }

    /// Append a stroke in arrival order and forward it to everyone but
    /// the sender. Returns how many connections it was queued for.
    ///
    /// Only roster members may draw. Stroke ids are not de-duplicated.
    pub async fn append_stroke(
        &self,
        session_id: &SessionId,
        sender: &UserId,
        stroke: DrawingStroke,
    ) -> Result<usize, WhiteboardError> {
        let mut session = self.lock_live(session_id).await?;
        Self::require_participant(&session, sender)?;

        session.strokes.push(stroke.clone());
        session.touch();
        self.strokes_appended.fetch_add(1, Ordering::Relaxed);

        let event = Arc::new(ServerEvent::StrokeReceived {
            session_id: session_id.clone(),
            stroke,
        });
        Ok(self.registry.deliver_to(session.others(sender), event).await)
    }

    /// Ephemeral cursor fan-out. Unknown sessions are a silent no-op.
    pub async fn broadcast_cursor(&self, session_id: &SessionId, cursor: RemoteCursor) -> usize {
        let Ok(mut session) = self.lock_live(session_id).await else {
            return 0;
        };
        session.touch();

        log::trace!("Cursor {} ({}, {}) in {session_id}", cursor.user_id, cursor.x, cursor.y);
        let sender = cursor.user_id.clone();
        let event = Arc::new(ServerEvent::CursorMoved {
            session_id: session_id.clone(),
            cursor,
        });
        self.registry.deliver_to(session.others(&sender), event).await
    }

    /// Empty the log and tell every participant, the initiator included.
    pub async fn clear(&self, session_id: &SessionId, cleared_by: &UserId) -> Result<usize, WhiteboardError> {
        let mut session = self.lock_live(session_id).await?;
        Self::require_participant(&session, cleared_by)?;

        let dropped = session.strokes.len();
        session.strokes.clear();
        session.touch();

        let event = Arc::new(ServerEvent::Cleared {
            session_id: session_id.clone(),
            cleared_by: cleared_by.clone(),
        });
        let delivered = self.registry.deliver_to(session.participants.iter(), event).await;
        log::info!("Whiteboard {session_id} cleared by {cleared_by} ({dropped} strokes dropped)");
        Ok(delivered)
    }

    /// Remove `user_id` from the roster and announce it.
    pub async fn leave(&self, session_id: &SessionId, user_id: &UserId) -> Result<(), WhiteboardError> {
        let mut session = self.lock_live(session_id).await?;
        if session.remove_participant(user_id) {
            let event = Arc::new(ServerEvent::UserLeft {
                session_id: session_id.clone(),
                user_id: user_id.clone(),
            });
            self.registry.deliver_to(session.participants.iter(), event).await;
            log::info!("User {user_id} left whiteboard {session_id}");
        }
        Ok(())
    }

    /// Hand a rendered canvas to the store. In-memory strokes are untouched.
    pub async fn save_snapshot(
        &self,
        session_id: &SessionId,
        content: String,
        thumbnail: Option<String>,
    ) -> Result<(), WhiteboardError> {
        let id = session_id.clone();
        let snapshot = RenderedSnapshot::new(content, thumbnail);
        storage::blocking(&self.store, move |store| store.save_rendered(&id, &snapshot)).await?;
        log::info!("Saved rendered snapshot of whiteboard {session_id}");
        Ok(())
    }

    /// Mark `user_id` absent everywhere after their connection closed.
    ///
    /// Sends `user-left` to the affected sessions and returns every
    /// co-participant, for the offline presence broadcast.
    pub async fn depart(&self, user_id: &UserId) -> HashSet<UserId> {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut co_participants = HashSet::new();

        for session in sessions {
            let mut session = session.lock().await;
            if !session.is_active || !session.present.remove(user_id) {
                continue;
            }
            let others: Vec<UserId> = session.others(user_id).cloned().collect();
            let event = Arc::new(ServerEvent::UserLeft {
                session_id: session.session_id.clone(),
                user_id: user_id.clone(),
            });
            self.registry.deliver_to(&others, event).await;
            co_participants.extend(others);
        }
        co_participants
    }

    /// Persist and drop sessions idle for at least `idle_timeout` with no
    /// present participant still online. Returns how many were evicted.
    ///
    /// Only the session being persisted is locked while the store writes;
    /// the table lock is taken briefly to collect candidates and to drop
    /// the retired entries.
    pub async fn evict_idle(&self, idle_timeout: Duration) -> usize {
        let candidates: Vec<(SessionId, SharedSession)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, session)| (id.clone(), session.clone()))
            .collect();
        let mut evicted = 0;

        for (id, shared) in candidates {
            let mut session = shared.lock().await;
            if !session.is_active || session.idle_for() < idle_timeout {
                continue;
            }
            let mut anyone_online = false;
            for user in &session.present {
                if self.registry.is_online(user).await {
                    anyone_online = true;
                    break;
                }
            }
            if anyone_online {
                continue;
            }

            let strokes = session.strokes.clone();
            let key = id.clone();
            match storage::blocking(&self.store, move |store| store.save_strokes(&key, &strokes)).await {
                Ok(()) => session.is_active = false,
                Err(e) => {
                    log::error!("Failed to persist whiteboard {id}, keeping it in memory: {e}");
                    continue;
                }
            }
            drop(session);

            self.retire(&id, &shared).await;
            evicted += 1;
            log::info!("Whiteboard {id} evicted after {}s idle", idle_timeout.as_secs());
        }

        self.evicted_sessions.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Current stroke log of a live session.
    pub async fn snapshot(&self, session_id: &SessionId) -> Option<Vec<DrawingStroke>> {
        let session = self.lock_live(session_id).await.ok()?;
        Some(session.strokes.clone())
    }

    pub async fn participants(&self, session_id: &SessionId) -> Option<Vec<UserId>> {
        let session = self.lock_live(session_id).await.ok()?;
        Some(session.participants.clone())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn strokes_appended(&self) -> u64 {
        self.strokes_appended.load(Ordering::Relaxed)
    }

    pub fn evicted_sessions(&self) -> u64 {
        self.evicted_sessions.load(Ordering::Relaxed)
    }

    async fn session(&self, session_id: &SessionId) -> Result<SharedSession, WhiteboardError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| WhiteboardError::SessionNotFound(session_id.clone()))
    }

    /// Lock the live session for `session_id`, skipping past a retired one.
    async fn lock_live(&self, session_id: &SessionId) -> Result<OwnedMutexGuard<WhiteboardSession>, WhiteboardError> {
        loop {
            let session = self.session(session_id).await?;
            let guard = session.clone().lock_owned().await;
            if guard.is_active {
                return Ok(guard);
            }
            drop(guard);
            self.retire(session_id, &session).await;
        }
    }

    /// Drop `session` from the table unless the id already points elsewhere.
    async fn retire(&self, session_id: &SessionId, session: &SharedSession) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(session_id).is_some_and(|current| Arc::ptr_eq(current, session)) {
            sessions.remove(session_id);
        }
    }

    fn require_participant(session: &WhiteboardSession, user_id: &UserId) -> Result<(), WhiteboardError> {
        if session.is_participant(user_id) {
            Ok(())
        } else {
            Err(WhiteboardError::NotParticipant {
                session_id: session.session_id.clone(),
                user_id: user_id.clone(),
            })
        }
    }

    /// Look up a session, materializing it (from the store if it was
    /// evicted earlier) when absent.
    async fn get_or_create(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        peer_user_id: Option<&UserId>,
    ) -> (SharedSession, bool) {
        if let Ok(session) = self.session(session_id).await {
            return (session, false);
        }

        let key = session_id.clone();
        let persisted = match storage::blocking(&self.store, move |store| store.load_strokes(&key)).await {
            Ok(strokes) => {
                log::info!("Rehydrated whiteboard {session_id} with {} strokes", strokes.len());
                strokes
            }
            Err(StoreError::NotFound(_)) => Vec::new(),
            Err(e) => {
                log::error!("Failed to load whiteboard {session_id}, starting empty: {e}");
                Vec::new()
            }
        };

        let mut sessions = self.sessions.write().await;
        // Double-check: another join may have won the race.
        if let Some(session) = sessions.get(session_id) {
            return (session.clone(), false);
        }
        let session = WhiteboardSession::new(session_id.clone(), user_id.clone(), peer_user_id.cloned())
            .with_strokes(persisted);
        let session = Arc::new(Mutex::new(session));
        sessions.insert(session_id.clone(), session.clone());
        (session, true)
    }
}
