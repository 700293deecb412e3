//! SQLite store
//!
//! Records are kept as JSON documents next to the columns used for lookup.

use super::ConsultStore;
use crate::recording::Recording;
use crate::session::Session;
use crate::signaling::message::SignalingMessage;
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::info;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id          TEXT PRIMARY KEY,
    status      TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    body        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS recordings (
    id          TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    body        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_recordings_session ON recordings (session_id);
CREATE TABLE IF NOT EXISTS chat_messages (
    session_id  TEXT NOT NULL,
    message_id  INTEGER NOT NULL,
    body        TEXT NOT NULL,
    PRIMARY KEY (session_id, message_id)
);
";

fn db_err(e: rusqlite::Error) -> Error {
    Error::PersistenceUnavailable(format!("sqlite: {}", e))
}

/// Store backed by a SQLite database file
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database and apply the schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        info!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl ConsultStore for SqliteStore {
    fn save_session(&self, session: &Session) -> Result<()> {
        let body = serde_json::to_string(session)?;
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO sessions (id, status, created_at, body)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    session.id,
                    session.status.to_string(),
                    session.created_at.to_rfc3339(),
                    body
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn load_session(&self, session_id: &str) -> Result<Option<Session>> {
        let body: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT body FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        body.map(|b| serde_json::from_str(&b).map_err(Error::from))
            .transpose()
    }

    fn save_recording(&self, recording: &Recording) -> Result<()> {
        let body = serde_json::to_string(recording)?;
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO recordings (id, session_id, created_at, body)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    recording.id,
                    recording.session_id,
                    recording.created_at.to_rfc3339(),
                    body
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn load_recording(&self, recording_id: &str) -> Result<Option<Recording>> {
        let body: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT body FROM recordings WHERE id = ?1",
                params![recording_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        body.map(|b| serde_json::from_str(&b).map_err(Error::from))
            .transpose()
    }

    fn list_recordings(&self, session_id: &str) -> Result<Vec<Recording>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT body FROM recordings WHERE session_id = ?1 ORDER BY created_at ASC",
            )
            .map_err(db_err)?;
        let bodies = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(db_err)?;

        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(Error::from))
            .collect()
    }

    fn delete_recording(&self, recording_id: &str) -> Result<bool> {
        let removed = self
            .conn
            .lock()
            .execute(
                "DELETE FROM recordings WHERE id = ?1",
                params![recording_id],
            )
            .map_err(db_err)?;
        Ok(removed > 0)
    }

    fn save_chat_history(&self, session_id: &str, messages: &[SignalingMessage]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "DELETE FROM chat_messages WHERE session_id = ?1",
            params![session_id],
        )
        .map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO chat_messages (session_id, message_id, body) VALUES (?1, ?2, ?3)",
                )
                .map_err(db_err)?;
            for message in messages {
                let body = serde_json::to_string(message)?;
                stmt.execute(params![session_id, message.id as i64, body])
                    .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }

    fn load_chat_history(&self, session_id: &str) -> Result<Vec<SignalingMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT body FROM chat_messages WHERE session_id = ?1 ORDER BY message_id ASC",
            )
            .map_err(db_err)?;
        let bodies = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(db_err)?;

        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(Error::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ParticipantRole, SessionStatus, SessionType};
    use crate::signaling::message::MessageKind;
    use chrono::Utc;

    fn session() -> Session {
        Session {
            id: "sess-1".to_string(),
            participant_a_id: "patientA".to_string(),
            participant_b_id: "providerB".to_string(),
            session_type: SessionType::Video,
            status: SessionStatus::Ended,
            scheduled_time: None,
            created_at: Utc::now(),
            ended_at: Some(Utc::now()),
            notes: Some("follow-up".to_string()),
            connection_quality_last: None,
            end_reason: None,
            status_reason: None,
            participants: Vec::new(),
            negotiated: true,
        }
    }

    #[test]
    fn test_session_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consult.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.save_session(&session()).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.load_session("sess-1").unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Ended);
        assert_eq!(loaded.notes.as_deref(), Some("follow-up"));
        assert!(store.load_session("missing").unwrap().is_none());
    }

    #[test]
    fn test_chat_history_replaced_and_ordered() {
        let store = SqliteStore::open_in_memory().unwrap();
        let messages: Vec<SignalingMessage> = (1..=3)
            .rev()
            .map(|id| SignalingMessage {
                id,
                session_id: "sess-1".to_string(),
                kind: MessageKind::Chat,
                sender_id: "patientA".to_string(),
                sender_role: ParticipantRole::Patient,
                payload: serde_json::json!(format!("m{}", id)),
                sent_at: Utc::now(),
            })
            .collect();

        store.save_chat_history("sess-1", &messages).unwrap();
        store.save_chat_history("sess-1", &messages).unwrap();

        let ids: Vec<u64> = store
            .load_chat_history("sess-1")
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
