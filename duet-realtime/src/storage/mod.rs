//! Snapshot persistence for whiteboard sessions.
//!
//! The live stroke log is in-memory only; storage is touched at three
//! points:
//!
//! ```text
//! whiteboard:save ──► save_rendered()      (rendered canvas + thumbnail)
//! idle eviction   ──► save_strokes()       (stroke log of the evicted session)
//! first join      ──► load_strokes()       (rehydrate an evicted session)
//! ```
//!
//! Stores are synchronous. Async callers go through [`blocking`] so a
//! slow disk suspends only the event that issued the call.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, SessionMetadata, StoreConfig};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

use crate::protocol::{DrawingStroke, SessionId};

/// Rendered canvas handed over by a client on `whiteboard:save`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedSnapshot {
    /// Rendered content (typically a data URL or serialized canvas).
    pub content: String,
    pub thumbnail: Option<String>,
    /// Seconds since epoch.
    pub saved_at: u64,
}

impl RenderedSnapshot {
    pub fn new(content: impl Into<String>, thumbnail: Option<String>) -> Self {
        Self {
            content: content.into(),
            thumbnail,
            saved_at: unix_now(),
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable side of the whiteboard manager.
pub trait SnapshotStore: Send + Sync {
    fn save_rendered(&self, session_id: &SessionId, snapshot: &RenderedSnapshot) -> Result<(), StoreError>;

    fn load_rendered(&self, session_id: &SessionId) -> Result<RenderedSnapshot, StoreError>;

    /// Replace the persisted stroke log of a session.
    fn save_strokes(&self, session_id: &SessionId, strokes: &[DrawingStroke]) -> Result<(), StoreError>;

    fn load_strokes(&self, session_id: &SessionId) -> Result<Vec<DrawingStroke>, StoreError>;

    fn list_sessions(&self) -> Result<Vec<SessionId>, StoreError>;

    fn delete_session(&self, session_id: &SessionId) -> Result<(), StoreError>;
}

/// Run a store call on tokio's blocking pool.
pub async fn blocking<T, F>(store: &Arc<dyn SnapshotStore>, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn SnapshotStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StoreError::DatabaseError(format!("storage task failed: {e}")))?
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
