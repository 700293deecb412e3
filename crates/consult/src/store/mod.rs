//! Persistence of sessions, recordings and chat history
//!
//! Stores are synchronous; async code reaches them through [`run_blocking`]
//! so a slow disk never stalls a session actor's executor thread. The core
//! never retries a failed store call.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::config::{StoreBackend, StoreConfig};
use crate::recording::Recording;
use crate::session::Session;
use crate::signaling::message::SignalingMessage;
use crate::{Error, Result};
use std::sync::Arc;

/// Session, recording and chat persistence
pub trait ConsultStore: Send + Sync + 'static {
    /// Insert or replace a session record
    fn save_session(&self, session: &Session) -> Result<()>;

    fn load_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Insert or replace recording metadata
    fn save_recording(&self, recording: &Recording) -> Result<()>;

    fn load_recording(&self, recording_id: &str) -> Result<Option<Recording>>;

    /// Recordings of a session, oldest first
    fn list_recordings(&self, session_id: &str) -> Result<Vec<Recording>>;

    /// Returns whether a record was removed
    fn delete_recording(&self, recording_id: &str) -> Result<bool>;

    /// Replace the stored chat history of a session
    fn save_chat_history(&self, session_id: &str, messages: &[SignalingMessage]) -> Result<()>;

    /// Chat history, ordered by message id
    fn load_chat_history(&self, session_id: &str) -> Result<Vec<SignalingMessage>>;
}

/// Open the configured backend
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn ConsultStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Sqlite => {
            let path = config.path.as_ref().ok_or_else(|| {
                Error::InvalidConfig("store.path is required for the sqlite backend".to_string())
            })?;
            Ok(Arc::new(SqliteStore::open(path)?))
        }
    }
}

/// Run a store call on the blocking thread pool
pub async fn run_blocking<T, F>(store: &Arc<dyn ConsultStore>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn ConsultStore) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| Error::PersistenceUnavailable(format!("store task failed: {}", e)))?
}
