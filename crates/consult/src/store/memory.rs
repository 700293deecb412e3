//! In-process store

use super::ConsultStore;
use crate::recording::Recording;
use crate::session::Session;
use crate::signaling::message::SignalingMessage;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Store backed by in-memory maps; contents are lost on restart
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
    recordings: RwLock<HashMap<String, Recording>>,
    chat: RwLock<HashMap<String, Vec<SignalingMessage>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `PersistenceUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::PersistenceUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

impl ConsultStore for MemoryStore {
    fn save_session(&self, session: &Session) -> Result<()> {
        self.check()?;
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn load_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.check()?;
        Ok(self.sessions.read().get(session_id).cloned())
    }

    fn save_recording(&self, recording: &Recording) -> Result<()> {
        self.check()?;
        self.recordings
            .write()
            .insert(recording.id.clone(), recording.clone());
        Ok(())
    }

    fn load_recording(&self, recording_id: &str) -> Result<Option<Recording>> {
        self.check()?;
        Ok(self.recordings.read().get(recording_id).cloned())
    }

    fn list_recordings(&self, session_id: &str) -> Result<Vec<Recording>> {
        self.check()?;
        let mut recordings: Vec<Recording> = self
            .recordings
            .read()
            .values()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect();
        recordings.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(recordings)
    }

    fn delete_recording(&self, recording_id: &str) -> Result<bool> {
        self.check()?;
        Ok(self.recordings.write().remove(recording_id).is_some())
    }

    fn save_chat_history(&self, session_id: &str, messages: &[SignalingMessage]) -> Result<()> {
        self.check()?;
        self.chat
            .write()
            .insert(session_id.to_string(), messages.to_vec());
        Ok(())
    }

    fn load_chat_history(&self, session_id: &str) -> Result<Vec<SignalingMessage>> {
        self.check()?;
        Ok(self
            .chat
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}
