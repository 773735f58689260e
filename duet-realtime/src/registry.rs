//! Connection registry: user identity → live connection.
//!
//! Last join wins. Registering a user that already has a connection
//! silently replaces the old entry; the evicted connection stays open
//! but no longer receives anything addressed to the user.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::{ConnectionId, ServerEvent, UserId};

/// Sending half of one client's outbound queue.
///
/// Delivery is best-effort: a full queue drops the event.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<Arc<ServerEvent>>,
    connected_at: SystemTime,
    dropped: Arc<AtomicU64>,
}

impl ConnectionHandle {
    /// Create a handle plus the receiver its transport task drains.
    pub fn channel(
        capacity: usize,
        dropped: Arc<AtomicU64>,
    ) -> (Self, mpsc::Receiver<Arc<ServerEvent>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ConnectionId::new(),
            sender,
            connected_at: SystemTime::now(),
            dropped,
        };
        (handle, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    /// Queue an event for this connection. Returns false if it was dropped.
    pub fn deliver(&self, event: Arc<ServerEvent>) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Outbound queue full for connection {}, event dropped", self.id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    by_user: HashMap<UserId, ConnectionHandle>,
    by_connection: HashMap<ConnectionId, UserId>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `user_id` to `handle` and mark the user online.
    ///
    /// Returns the connection that previously held the user, if it was
    /// a different one.
    pub async fn register(&self, user_id: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut inner = self.inner.write().await;

        // A connection re-identifying as someone else gives up its old identity.
        if let Some(previous_user) = inner.by_connection.insert(handle.id, user_id.clone()) {
            if previous_user != user_id
                && inner.by_user.get(&previous_user).map(ConnectionHandle::id) == Some(handle.id)
            {
                inner.by_user.remove(&previous_user);
            }
        }

        let evicted = inner.by_user.insert(user_id, handle.clone());
        match evicted {
            Some(old) if old.id != handle.id => {
                inner.by_connection.remove(&old.id);
                Some(old)
            }
            _ => None,
        }
    }

    /// Drop the mapping owned by `connection_id`.
    ///
    /// Returns the user that went offline, or `None` if the connection
    /// was never identified or had already been superseded.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<UserId> {
        let mut inner = self.inner.write().await;
        let user_id = inner.by_connection.remove(&connection_id)?;
        match inner.by_user.get(&user_id) {
            Some(handle) if handle.id == connection_id => {
                inner.by_user.remove(&user_id);
                Some(user_id)
            }
            _ => None,
        }
    }

    /// Absent means offline, not an error.
    pub async fn resolve(&self, user_id: &UserId) -> Option<ConnectionHandle> {
        self.inner.read().await.by_user.get(user_id).cloned()
    }

    pub async fn is_online(&self, user_id: &UserId) -> bool {
        self.inner.read().await.by_user.contains_key(user_id)
    }

    /// User currently bound to a connection.
    pub async fn user_of(&self, connection_id: ConnectionId) -> Option<UserId> {
        self.inner.read().await.by_connection.get(&connection_id).cloned()
    }

    /// Deliver one event to every online user in `targets`.
    ///
    /// Offline targets are skipped. Returns how many were queued.
    pub async fn deliver_to<'a, I>(&self, targets: I, event: Arc<ServerEvent>) -> usize
    where
        I: IntoIterator<Item = &'a UserId>,
    {
        let inner = self.inner.read().await;
        targets
            .into_iter()
            .filter_map(|user| inner.by_user.get(user))
            .filter(|handle| handle.deliver(event.clone()))
            .count()
    }

    pub async fn online_count(&self) -> usize {
        self.inner.read().await.by_user.len()
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        self.inner.read().await.by_user.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ConnectionHandle, mpsc::Receiver<Arc<ServerEvent>>) {
        ConnectionHandle::channel(8, Arc::new(AtomicU64::new(0)))
    }

    #[tokio::test]
    async fn test_register_resolve_unregister() {
        let registry = ConnectionRegistry::new();
        let alice = UserId::from(1);
        let (conn, _rx) = handle();

        assert!(registry.register(alice.clone(), conn.clone()).await.is_none());
        assert!(registry.is_online(&alice).await);
        assert_eq!(registry.resolve(&alice).await.map(|h| h.id()), Some(conn.id()));

        assert_eq!(registry.unregister(conn.id()).await, Some(alice.clone()));
        assert!(!registry.is_online(&alice).await);
        assert!(registry.resolve(&alice).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_user_is_absent() {
        let registry = ConnectionRegistry::new();
        assert!(registry.resolve(&UserId::from(404)).await.is_none());
        assert!(!registry.is_online(&UserId::from(404)).await);
    }

    #[tokio::test]
    async fn test_unregister_unidentified_connection() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = handle();
        assert!(registry.unregister(conn.id()).await.is_none());
    }

    #[tokio::test]
    async fn test_last_join_wins() {
        let registry = ConnectionRegistry::new();
        let alice = UserId::from(1);
        let (laptop, _rx1) = handle();
        let (phone, _rx2) = handle();

        registry.register(alice.clone(), laptop.clone()).await;
        let evicted = registry.register(alice.clone(), phone.clone()).await;
        assert_eq!(evicted.map(|h| h.id()), Some(laptop.id()));

        // The superseded connection closing must not take the user offline.
        assert!(registry.unregister(laptop.id()).await.is_none());
        assert_eq!(registry.resolve(&alice).await.map(|h| h.id()), Some(phone.id()));

        assert_eq!(registry.unregister(phone.id()).await, Some(alice.clone()));
        assert!(!registry.is_online(&alice).await);
    }

    #[tokio::test]
    async fn test_reregister_same_connection() {
        let registry = ConnectionRegistry::new();
        let alice = UserId::from(1);
        let (conn, _rx) = handle();

        registry.register(alice.clone(), conn.clone()).await;
        assert!(registry.register(alice.clone(), conn.clone()).await.is_none());
        assert_eq!(registry.online_count().await, 1);
    }

    #[tokio::test]
    async fn test_connection_changes_identity() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = handle();

        registry.register(UserId::from(1), conn.clone()).await;
        registry.register(UserId::from(2), conn.clone()).await;

        assert!(!registry.is_online(&UserId::from(1)).await);
        assert!(registry.is_online(&UserId::from(2)).await);
        assert_eq!(registry.user_of(conn.id()).await, Some(UserId::from(2)));
    }

    #[tokio::test]
    async fn test_deliver_to_skips_offline() {
        let registry = ConnectionRegistry::new();
        let (conn, mut rx) = handle();
        registry.register(UserId::from(1), conn).await;

        let targets = [UserId::from(1), UserId::from(2)];
        let delivered = registry.deliver_to(&targets, Arc::new(ServerEvent::Pong)).await;
        assert_eq!(delivered, 1);
        assert_eq!(*rx.recv().await.unwrap(), ServerEvent::Pong);
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let dropped = Arc::new(AtomicU64::new(0));
        let (conn, _rx) = ConnectionHandle::channel(1, dropped.clone());

        assert!(conn.deliver(Arc::new(ServerEvent::Pong)));
        assert!(!conn.deliver(Arc::new(ServerEvent::Pong)));
        assert_eq!(dropped.load(Ordering::Relaxed), 1);
    }
}
