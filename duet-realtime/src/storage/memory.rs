//! In-process snapshot store. Used when no storage path is configured.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::{RenderedSnapshot, SnapshotStore, StoreError};
use crate::protocol::{DrawingStroke, SessionId};

#[derive(Default)]
struct Entry {
    rendered: Option<RenderedSnapshot>,
    strokes: Option<Vec<DrawingStroke>>,
}

#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<SessionId, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemoryStore {
    fn save_rendered(&self, session_id: &SessionId, snapshot: &RenderedSnapshot) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.entry(session_id.clone()).or_default().rendered = Some(snapshot.clone());
        Ok(())
    }

    fn load_rendered(&self, session_id: &SessionId) -> Result<RenderedSnapshot, StoreError> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(session_id)
            .and_then(|e| e.rendered.clone())
            .ok_or_else(|| StoreError::NotFound(session_id.clone()))
    }

    fn save_strokes(&self, session_id: &SessionId, strokes: &[DrawingStroke]) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.entry(session_id.clone()).or_default().strokes = Some(strokes.to_vec());
        Ok(())
    }

    fn load_strokes(&self, session_id: &SessionId) -> Result<Vec<DrawingStroke>, StoreError> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(session_id)
            .and_then(|e| e.strokes.clone())
            .ok_or_else(|| StoreError::NotFound(session_id.clone()))
    }

    fn list_sessions(&self) -> Result<Vec<SessionId>, StoreError> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        Ok(sessions.keys().cloned().collect())
    }

    fn delete_session(&self, session_id: &SessionId) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(session_id);
        Ok(())
    }
}
