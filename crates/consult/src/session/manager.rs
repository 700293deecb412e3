//! Session lifecycle manager
//!
//! Front door to the per-session actors. The manager owns the registry
//! (session id → actor handle) and the collaborators every actor shares;
//! it never mutates session state itself.

use super::actor::{
    ActorContext, Command, RelayOutcome, SessionActor, SessionHandle, UnpersistedSessions,
};
use super::model::{
    EndReason, JoinResult, ParticipantRole, Session, SessionId, SessionStatus, SessionType,
};
use crate::config::ConsultConfig;
use crate::media::{MediaChunk, PeerTransport};
use crate::quality::{
    ConnectionQuality, MonitorHandle, QualityMonitor, QualitySink, QualityUpdate,
};
use crate::recording::{IngestStream, RecordableStream, Recording, RecordingId, RecordingPipeline};
use crate::signaling::channel::SignalingChannel;
use crate::signaling::message::{MessageId, OutboundSignal, SignalingMessage};
use crate::signaling::relay::SignalingRelay;
use crate::store::{run_blocking, ConsultStore};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};
use uuid::Uuid;

struct ManagerInner {
    ctx: ActorContext,
    monitor: QualityMonitor,
    ingests: DashMap<RecordingId, Arc<IngestStream>>,
}

/// Creates sessions and routes requests to their actors
///
/// Cloning is cheap; all clones share one registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(config: &ConsultConfig, store: Arc<dyn ConsultStore>) -> Self {
        let pipeline = Arc::new(RecordingPipeline::new(
            config.recording.directory.clone(),
            Arc::clone(&store),
        ));
        let ctx = ActorContext {
            config: config.session.clone(),
            relay: Arc::new(SignalingRelay::new()),
            pipeline,
            store,
            registry: Arc::new(DashMap::new()),
            unpersisted: Arc::new(UnpersistedSessions::new()),
        };

        Self {
            inner: Arc::new(ManagerInner {
                ctx,
                monitor: QualityMonitor::new(&config.quality),
                ingests: DashMap::new(),
            }),
        }
    }

    pub fn signaling_relay(&self) -> &Arc<SignalingRelay> {
        &self.inner.ctx.relay
    }

    pub fn pipeline(&self) -> &Arc<RecordingPipeline> {
        &self.inner.ctx.pipeline
    }

    /// Number of sessions with a live actor
    pub fn live_session_count(&self) -> usize {
        self.inner.ctx.registry.len()
    }

    /// Ended sessions whose final record the store has not accepted yet
    pub fn unpersisted_session_count(&self) -> usize {
        self.inner.ctx.unpersisted.len()
    }

    /// Retry saving ended sessions left over from a store outage
    ///
    /// Returns how many were saved.
    pub async fn flush_unpersisted(&self) -> usize {
        let mut saved = 0;
        for ended in self.inner.ctx.unpersisted.snapshot() {
            let session_id = ended.session.id.clone();
            let result = run_blocking(&self.inner.ctx.store, move |store| {
                store.save_session(&ended.session)?;
                store.save_chat_history(&ended.session.id, &ended.history)
            })
            .await;
            match result {
                Ok(()) => {
                    self.inner.ctx.unpersisted.remove(&session_id);
                    saved += 1;
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Ended session still unsaved");
                }
            }
        }
        saved
    }

    /// Create a session
    ///
    /// The session is SCHEDULED when `scheduled_time` lies in the future,
    /// otherwise WAITING.
    ///
    /// # Errors
    ///
    /// - `InvalidParticipants` if either id is empty or both are equal
    /// - `PersistenceUnavailable` if the initial record cannot be saved
    pub async fn create_session(
        &self,
        participant_a_id: &str,
        participant_b_id: &str,
        session_type: SessionType,
        scheduled_time: Option<DateTime<Utc>>,
        notes: Option<String>,
    ) -> Result<Session> {
        let a = participant_a_id.trim();
        let b = participant_b_id.trim();
        if a.is_empty() || b.is_empty() {
            return Err(Error::InvalidParticipants(
                "participant ids must not be empty".to_string(),
            ));
        }
        if a == b {
            return Err(Error::InvalidParticipants(format!(
                "a session needs two distinct participants, got {} twice",
                a
            )));
        }

        let now = Utc::now();
        let status = match scheduled_time {
            Some(at) if at > now => SessionStatus::Scheduled,
            _ => SessionStatus::Waiting,
        };

        let session = Session {
            id: Uuid::new_v4().to_string(),
            participant_a_id: a.to_string(),
            participant_b_id: b.to_string(),
            session_type,
            status,
            scheduled_time,
            created_at: now,
            ended_at: None,
            notes,
            connection_quality_last: None,
            end_reason: None,
            status_reason: None,
            participants: Vec::new(),
            negotiated: false,
        };

        let record = session.clone();
        run_blocking(&self.inner.ctx.store, move |store| store.save_session(&record)).await?;

        SessionActor::spawn(session.clone(), self.inner.ctx.clone());
        info!(
            session_id = %session.id,
            session_type = ?session.session_type,
            status = %session.status,
            "Session created"
        );
        Ok(session)
    }

    /// Bind a participant to a session
    ///
    /// Re-joining with the same identity and role is idempotent.
    pub async fn join(
        &self,
        session_id: &str,
        participant_id: &str,
        role: ParticipantRole,
    ) -> Result<JoinResult> {
        let participant_id = participant_id.to_string();
        self.request(session_id, |reply| Command::Join {
            participant_id,
            role,
            reply,
        })
        .await
    }

    /// Attach a participant's signaling channel and replay missed chat
    pub async fn register_channel(
        &self,
        session_id: &str,
        participant_id: &str,
        channel: Arc<dyn SignalingChannel>,
        resume_after: Option<MessageId>,
    ) -> Result<Session> {
        let participant_id = participant_id.to_string();
        self.request(session_id, |reply| Command::RegisterChannel {
            participant_id,
            channel,
            resume_after,
            reply,
        })
        .await
    }

    /// Mark a participant disconnected and start its grace period
    pub async fn leave(&self, session_id: &str, participant_id: &str) -> Result<Session> {
        self.send_leave(session_id, participant_id, None).await
    }

    /// Like [`leave`](Self::leave), but only if `channel_id` is still the
    /// participant's current channel
    pub async fn leave_channel(
        &self,
        session_id: &str,
        participant_id: &str,
        channel_id: &str,
    ) -> Result<Session> {
        self.send_leave(session_id, participant_id, Some(channel_id.to_string()))
            .await
    }

    async fn send_leave(
        &self,
        session_id: &str,
        participant_id: &str,
        channel_id: Option<String>,
    ) -> Result<Session> {
        let participant_id = participant_id.to_string();
        self.request(session_id, |reply| Command::Leave {
            participant_id,
            channel_id,
            reply,
        })
        .await
    }

    /// End a session; ending an ended session returns its final state
    pub async fn end(
        &self,
        session_id: &str,
        reason: EndReason,
        notes: Option<String>,
    ) -> Result<Session> {
        let Some(handle) = self.live_handle(session_id) else {
            if self.inner.ctx.unpersisted.contains(session_id) {
                return Err(Error::SessionEnded(session_id.to_string()));
            }
            return match self.load_stored(session_id).await? {
                Some(session) => Ok(session),
                None => Err(Error::SessionNotFound(session_id.to_string())),
            };
        };

        let (reply, rx) = oneshot::channel();
        let sent = handle
            .tx
            .send(Command::End {
                reason,
                notes,
                reply,
            })
            .await;

        match sent {
            Ok(()) => match rx.await {
                Ok(result) => result,
                Err(_) => Ok(handle.snapshot.borrow().clone()),
            },
            Err(_) => Ok(handle.snapshot.borrow().clone()),
        }
    }

    /// Current state of a session, live or stored
    pub async fn get(&self, session_id: &str) -> Result<Session> {
        if let Some(handle) = self.live_handle(session_id) {
            return Ok(handle.snapshot.borrow().clone());
        }
        if let Some(ended) = self.inner.ctx.unpersisted.get(session_id) {
            return Ok(ended.session);
        }
        self.load_stored(session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Read-only feed of session snapshots
    pub fn subscribe(&self, session_id: &str) -> Result<watch::Receiver<Session>> {
        self.live_handle(session_id)
            .map(|handle| handle.snapshot)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Forward a negotiation or control message to the other participant
    ///
    /// A disconnected recipient is not an error; see
    /// [`RelayOutcome::delivery`].
    pub async fn relay(
        &self,
        session_id: &str,
        sender_id: &str,
        signal: OutboundSignal,
    ) -> Result<RelayOutcome> {
        let sender_id = sender_id.to_string();
        self.request(session_id, |reply| Command::Relay {
            sender_id,
            signal,
            reply,
        })
        .await
    }

    /// Publish a chat message to the session in its total order
    pub async fn send_chat(
        &self,
        session_id: &str,
        sender_id: &str,
        text: &str,
        echo: bool,
    ) -> Result<SignalingMessage> {
        let sender_id = sender_id.to_string();
        let text = text.to_string();
        self.request(session_id, |reply| Command::Chat {
            sender_id,
            text,
            echo,
            reply,
        })
        .await
    }

    /// Chat history, from the live session or the store once it ended
    pub async fn chat_history(&self, session_id: &str) -> Result<Vec<SignalingMessage>> {
        if self.live_handle(session_id).is_some() {
            match self
                .request(session_id, |reply| Command::ChatHistory { reply })
                .await
            {
                Err(Error::SessionEnded(_)) => {}
                other => return other,
            }
        }
        if let Some(ended) = self.inner.ctx.unpersisted.get(session_id) {
            return Ok(ended.history);
        }

        let id = session_id.to_string();
        let (session, history) = run_blocking(&self.inner.ctx.store, move |store| {
            Ok((store.load_session(&id)?, store.load_chat_history(&id)?))
        })
        .await?;
        match session {
            Some(_) => Ok(history),
            None => Err(Error::SessionNotFound(session_id.to_string())),
        }
    }

    /// Cache the latest quality classification on the session
    pub async fn report_quality(
        &self,
        session_id: &str,
        quality: ConnectionQuality,
    ) -> Result<Session> {
        self.request(session_id, |reply| Command::ReportQuality { quality, reply })
            .await
    }

    /// Record a participant's media failure as the session's status reason
    ///
    /// The status itself is left unchanged, so a WAITING session can still
    /// activate once the participant retries.
    pub async fn report_media_failure(
        &self,
        session_id: &str,
        participant_id: &str,
        failure: &Error,
    ) -> Result<Session> {
        if !failure.is_media_error() {
            return Err(Error::InvalidData(format!(
                "{} is not a media failure",
                failure.kind()
            )));
        }
        let participant_id = participant_id.to_string();
        let reason = failure.to_string();
        self.request(session_id, |reply| Command::ReportMediaFailure {
            participant_id,
            reason,
            reply,
        })
        .await
    }

    /// Sink that feeds monitor output back into the session
    pub fn quality_sink(&self, session_id: &str) -> SessionQualitySink {
        SessionQualitySink {
            manager: self.clone(),
            session_id: session_id.to_string(),
        }
    }

    /// Sample `transport` until the session ends or the transport is lost
    ///
    /// Uses the configured interval when `interval` is `None`.
    pub fn monitor_quality(
        &self,
        session_id: &str,
        transport: Arc<dyn PeerTransport>,
        interval: Option<Duration>,
    ) -> Result<MonitorHandle> {
        let snapshots = self.subscribe(session_id)?;
        if !snapshots.borrow().session_type.has_media() {
            return Err(Error::InvalidData(format!(
                "session {} has no media transport",
                session_id
            )));
        }
        let interval = interval.unwrap_or_else(|| self.inner.monitor.default_interval());
        Ok(self.inner.monitor.start_monitoring(
            transport,
            interval,
            snapshots,
            Arc::new(self.quality_sink(session_id)),
        ))
    }

    pub async fn stop_monitoring(&self, handle: &MonitorHandle) {
        self.inner.monitor.stop_monitoring(handle).await;
    }

    /// Start recording `stream` on behalf of a joined participant
    ///
    /// The session must be ACTIVE; the participant's role becomes the
    /// recording's owner.
    pub async fn start_recording(
        &self,
        session_id: &str,
        participant_id: &str,
        stream: Arc<dyn RecordableStream>,
    ) -> Result<Recording> {
        let participant_id = participant_id.to_string();
        self.request(session_id, |reply| Command::StartRecording {
            participant_id,
            stream,
            reply,
        })
        .await
    }

    /// Start a recording fed by uploaded chunks
    pub async fn open_ingest(&self, session_id: &str, participant_id: &str) -> Result<Recording> {
        let stream = Arc::new(IngestStream::new());
        let recording = self
            .start_recording(session_id, participant_id, stream.clone())
            .await?;
        self.inner.ingests.insert(recording.id.clone(), stream);
        Ok(recording)
    }

    /// Append one uploaded chunk to an ingest recording
    ///
    /// Waits while the recorder's queue is full; `Ok` means the chunk will
    /// be part of the finalized recording.
    pub async fn push_ingest_chunk(&self, recording_id: &str, chunk: MediaChunk) -> Result<()> {
        if !self.inner.ctx.pipeline.is_capturing(recording_id) {
            self.inner.ingests.remove(recording_id);
            return Err(Error::NoActiveStream(format!(
                "recording {} is not capturing",
                recording_id
            )));
        }
        let stream = self
            .inner
            .ingests
            .get(recording_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                Error::NoActiveStream(format!("recording {} has no upload stream", recording_id))
            })?;
        stream.push(chunk).await
    }

    fn close_ingest(&self, recording_id: &str) {
        if let Some((_, stream)) = self.inner.ingests.remove(recording_id) {
            stream.close();
        }
    }

    /// Stop and finalize a recording
    pub async fn stop_recording(&self, recording_id: &str) -> Result<Recording> {
        self.close_ingest(recording_id);
        self.inner.ctx.pipeline.stop_recording(recording_id).await
    }

    /// Session owning `recording_id`
    pub async fn recording_session(&self, recording_id: &str) -> Result<SessionId> {
        self.inner.ctx.pipeline.recording_session(recording_id).await
    }

    pub async fn list_recordings(&self, session_id: &str) -> Result<Vec<Recording>> {
        self.inner.ctx.pipeline.list_recordings(session_id).await
    }

    /// Delete a recording's bytes and metadata
    pub async fn delete_recording(&self, recording_id: &str) -> Result<()> {
        self.close_ingest(recording_id);
        self.inner.ctx.pipeline.delete_recording(recording_id).await
    }

    /// End every live session with `server_shutdown`
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self
            .inner
            .ctx
            .registry
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        info!(sessions = ids.len(), "Ending live sessions for shutdown");
        for id in ids {
            if let Err(e) = self.end(&id, EndReason::ServerShutdown, None).await {
                warn!(session_id = %id, error = %e, "Failed to end session during shutdown");
            }
        }

        for entry in self.inner.ingests.iter() {
            entry.value().close();
        }
        self.inner.ingests.clear();

        let pending = self.unpersisted_session_count();
        if pending > 0 {
            let saved = self.flush_unpersisted().await;
            if saved < pending {
                warn!(unsaved = pending - saved, "Ended sessions lost at shutdown");
            }
        }
    }

    fn live_handle(&self, session_id: &str) -> Option<SessionHandle> {
        self.inner
            .ctx
            .registry
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    async fn load_stored(&self, session_id: &str) -> Result<Option<Session>> {
        let id = session_id.to_string();
        run_blocking(&self.inner.ctx.store, move |store| store.load_session(&id)).await
    }

    /// Send a command to the session's actor and wait for its reply
    async fn request<T, F>(&self, session_id: &str, make: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> Command,
    {
        let Some(handle) = self.live_handle(session_id) else {
            return match self.load_stored(session_id).await? {
                Some(_) => Err(Error::SessionEnded(session_id.to_string())),
                None => Err(Error::SessionNotFound(session_id.to_string())),
            };
        };

        let (reply, rx) = oneshot::channel();
        handle
            .tx
            .send(make(reply))
            .await
            .map_err(|_| Error::SessionEnded(session_id.to_string()))?;
        rx.await
            .map_err(|_| Error::SessionEnded(session_id.to_string()))?
    }
}

/// Routes quality monitor output into one session
pub struct SessionQualitySink {
    manager: SessionManager,
    session_id: SessionId,
}

#[async_trait]
impl QualitySink for SessionQualitySink {
    async fn report(&self, update: QualityUpdate) {
        let result = match update {
            QualityUpdate::Sample(sample) => {
                self.manager
                    .report_quality(&self.session_id, sample.quality)
                    .await
            }
            QualityUpdate::TransportLost { state } => {
                warn!(session_id = %self.session_id, ?state, "Peer transport lost");
                self.manager
                    .report_quality(&self.session_id, ConnectionQuality::Poor)
                    .await
            }
        };
        if let Err(e) = result {
            if !matches!(e, Error::SessionEnded(_)) {
                warn!(session_id = %self.session_id, error = %e, "Failed to record quality update");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::VirtualTransport;
    use crate::signaling::channel::{MpscChannel, OutboundFrame};
    use crate::signaling::message::MessageKind;
    use crate::signaling::relay::Delivery;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc;

    fn manager_with(config: ConsultConfig) -> (SessionManager, Arc<MemoryStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let config = config.with_recording_dir(dir.path());
        let manager = SessionManager::new(&config, store.clone());
        (manager, store, dir)
    }

    fn manager() -> (SessionManager, Arc<MemoryStore>, tempfile::TempDir) {
        manager_with(ConsultConfig::default())
    }

    async fn active_session(manager: &SessionManager) -> Session {
        let session = manager
            .create_session("patientA", "providerB", SessionType::Video, None, None)
            .await
            .unwrap();
        manager
            .join(&session.id, "patientA", ParticipantRole::Patient)
            .await
            .unwrap();
        manager
            .join(&session.id, "providerB", ParticipantRole::Provider)
            .await
            .unwrap();
        manager.get(&session.id).await.unwrap()
    }

    fn methods(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(OutboundFrame::Text(frame)) = rx.try_recv() {
            let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
            out.push(json["method"].as_str().unwrap_or_default().to_string());
        }
        out
    }

    #[tokio::test]
    async fn test_create_rejects_bad_participants() {
        let (manager, _, _dir) = manager();
        for (a, b) in [("", "providerB"), ("patientA", " "), ("patientA", "patientA")] {
            let result = manager
                .create_session(a, b, SessionType::Video, None, None)
                .await;
            assert!(matches!(result, Err(Error::InvalidParticipants(_))), "{:?}", (a, b));
        }
        assert_eq!(manager.live_session_count(), 0);
    }

    #[tokio::test]
    async fn test_future_schedule_starts_scheduled() {
        let (manager, _, _dir) = manager();
        let at = Utc::now() + chrono::Duration::hours(1);
        let session = manager
            .create_session("patientA", "providerB", SessionType::Audio, Some(at), None)
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Scheduled);

        let joined = manager
            .join(&session.id, "patientA", ParticipantRole::Patient)
            .await
            .unwrap();
        assert_eq!(joined.session.status, SessionStatus::Waiting);
        assert!(manager.signaling_relay().session_count() == 1);
    }

    #[tokio::test]
    async fn test_second_join_activates() {
        let (manager, _, _dir) = manager();
        let session = manager
            .create_session("patientA", "providerB", SessionType::Video, None, None)
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Waiting);

        let first = manager
            .join(&session.id, "patientA", ParticipantRole::Patient)
            .await
            .unwrap();
        assert_eq!(first.session.status, SessionStatus::Waiting);
        assert!(!first.activated);

        let second = manager
            .join(&session.id, "providerB", ParticipantRole::Provider)
            .await
            .unwrap();
        assert!(second.activated);
        assert_eq!(second.session.status, SessionStatus::Active);
        assert!(manager.signaling_relay().is_active(&session.id));
    }

    #[tokio::test]
    async fn test_third_identity_is_rejected() {
        let (manager, _, _dir) = manager();
        let session = active_session(&manager).await;

        let result = manager
            .join(&session.id, "intruderC", ParticipantRole::Guest)
            .await;
        assert!(matches!(result, Err(Error::SessionFull(_))));
        assert_eq!(manager.get(&session.id).await.unwrap().participants.len(), 2);
    }

    #[tokio::test]
    async fn test_unrostered_identity_rejected_before_slots_fill() {
        let (manager, _, _dir) = manager();
        let session = manager
            .create_session("patientA", "providerB", SessionType::Video, None, None)
            .await
            .unwrap();

        let result = manager
            .join(&session.id, "intruderC", ParticipantRole::Guest)
            .await;
        assert!(matches!(result, Err(Error::InvalidParticipants(_))));

        manager
            .join(&session.id, "patientA", ParticipantRole::Patient)
            .await
            .unwrap();
        let result = manager
            .join(&session.id, "intruderC", ParticipantRole::Guest)
            .await;
        assert!(matches!(result, Err(Error::InvalidParticipants(_))));
        assert_eq!(manager.get(&session.id).await.unwrap().participants.len(), 1);
    }

    #[tokio::test]
    async fn test_rejoin_is_idempotent() {
        let (manager, _, _dir) = manager();
        let session = active_session(&manager).await;

        let again = manager
            .join(&session.id, "patientA", ParticipantRole::Patient)
            .await
            .unwrap();
        assert!(again.rejoined);
        assert!(!again.activated);
        assert_eq!(again.session.status, SessionStatus::Active);

        let wrong_role = manager
            .join(&session.id, "patientA", ParticipantRole::Provider)
            .await;
        assert!(matches!(wrong_role, Err(Error::InvalidParticipants(_))));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (manager, _, _dir) = manager();
        let result = manager
            .join("missing", "patientA", ParticipantRole::Patient)
            .await;
        assert!(matches!(result, Err(Error::SessionNotFound(_))));
        assert!(matches!(
            manager.end("missing", EndReason::EndedByParticipant, None).await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_end_is_idempotent_and_persisted() {
        let (manager, store, _dir) = manager();
        let session = active_session(&manager).await;

        let ended = manager
            .end(&session.id, EndReason::EndedByParticipant, Some("follow up in 2 weeks".into()))
            .await
            .unwrap();
        assert_eq!(ended.status, SessionStatus::Ended);
        assert_eq!(ended.end_reason, Some(EndReason::EndedByParticipant));
        assert!(ended.ended_at.is_some());

        let again = manager
            .end(&session.id, EndReason::IdleTimeout, None)
            .await
            .unwrap();
        assert_eq!(again.status, SessionStatus::Ended);
        assert_eq!(again.end_reason, Some(EndReason::EndedByParticipant));
        assert_eq!(again.notes.as_deref(), Some("follow up in 2 weeks"));

        assert_eq!(manager.live_session_count(), 0);
        assert_eq!(manager.signaling_relay().session_count(), 0);
        let stored = store.load_session(&session.id).unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Ended);

        let late = manager
            .join(&session.id, "patientA", ParticipantRole::Patient)
            .await;
        assert!(matches!(late, Err(Error::SessionEnded(_))));
    }

    #[tokio::test]
    async fn test_end_survives_store_outage() {
        let (manager, store, _dir) = manager();
        let session = active_session(&manager).await;

        store.set_unavailable(true);
        let result = manager
            .end(&session.id, EndReason::EndedByParticipant, None)
            .await;
        assert!(matches!(result, Err(Error::PersistenceUnavailable(_))));

        // the transition itself happened and is observable
        let snapshot = manager.get(&session.id).await.unwrap();
        assert_eq!(snapshot.status, SessionStatus::Ended);
        let chat = manager.send_chat(&session.id, "patientA", "hello", true).await;
        assert!(matches!(chat, Err(Error::SessionEnded(_))));
    }

    #[tokio::test]
    async fn test_store_outage_does_not_keep_ended_sessions_live() {
        let (manager, store, _dir) = manager();
        let session = active_session(&manager).await;
        manager
            .send_chat(&session.id, "patientA", "before the outage", true)
            .await
            .unwrap();

        store.set_unavailable(true);
        assert!(manager
            .end(&session.id, EndReason::EndedByParticipant, None)
            .await
            .is_err());

        assert_eq!(manager.live_session_count(), 0);
        assert_eq!(manager.unpersisted_session_count(), 1);
        assert_eq!(
            manager.get(&session.id).await.unwrap().status,
            SessionStatus::Ended
        );
        assert_eq!(manager.chat_history(&session.id).await.unwrap().len(), 1);
        assert!(matches!(
            manager.join(&session.id, "patientA", ParticipantRole::Patient).await,
            Err(Error::SessionEnded(_))
        ));

        assert_eq!(manager.flush_unpersisted().await, 0);
        store.set_unavailable(false);
        assert_eq!(manager.flush_unpersisted().await, 1);
        assert_eq!(manager.unpersisted_session_count(), 0);
        let stored = manager.get(&session.id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Ended);
        assert_eq!(manager.chat_history(&session.id).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_end_racing_chat_and_join_fails_with_session_ended() {
        for _ in 0..20 {
            let (manager, _, _dir) = manager();
            let session = active_session(&manager).await;

            let chats: Vec<_> = (0..8)
                .map(|i| {
                    let manager = manager.clone();
                    let id = session.id.clone();
                    tokio::spawn(async move {
                        manager
                            .send_chat(&id, "patientA", &format!("message {}", i), true)
                            .await
                            .map(|_| ())
                    })
                })
                .collect();
            let joins: Vec<_> = (0..4)
                .map(|_| {
                    let manager = manager.clone();
                    let id = session.id.clone();
                    tokio::spawn(async move {
                        manager
                            .join(&id, "providerB", ParticipantRole::Provider)
                            .await
                            .map(|_| ())
                    })
                })
                .collect();
            let ender = {
                let manager = manager.clone();
                let id = session.id.clone();
                tokio::spawn(async move {
                    manager.end(&id, EndReason::EndedByParticipant, None).await
                })
            };

            ender.await.unwrap().unwrap();
            for task in chats.into_iter().chain(joins) {
                match task.await.unwrap() {
                    Ok(()) | Err(Error::SessionEnded(_)) => {}
                    Err(other) => panic!("expected SessionEnded, got {:?}", other),
                }
            }
            assert!(matches!(
                manager.send_chat(&session.id, "patientA", "late", true).await,
                Err(Error::SessionEnded(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_relay_never_echoes_to_sender() {
        let (manager, _, _dir) = manager();
        let session = active_session(&manager).await;

        let (a_channel, mut a_rx) = MpscChannel::new(32);
        let (b_channel, mut b_rx) = MpscChannel::new(32);
        manager
            .register_channel(&session.id, "patientA", a_channel, None)
            .await
            .unwrap();
        manager
            .register_channel(&session.id, "providerB", b_channel, None)
            .await
            .unwrap();
        methods(&mut a_rx);
        methods(&mut b_rx);

        let outcome = manager
            .relay(
                &session.id,
                "patientA",
                OutboundSignal::new(MessageKind::Offer, serde_json::json!("v=0")),
            )
            .await
            .unwrap();
        assert_eq!(outcome.delivery, Delivery::Delivered);

        assert_eq!(methods(&mut b_rx), vec!["session.signal"]);
        assert!(methods(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn test_relay_before_activation_is_dropped_quietly() {
        let (manager, _, _dir) = manager();
        let session = manager
            .create_session("patientA", "providerB", SessionType::Video, None, None)
            .await
            .unwrap();
        manager
            .join(&session.id, "patientA", ParticipantRole::Patient)
            .await
            .unwrap();

        let outcome = manager
            .relay(
                &session.id,
                "patientA",
                OutboundSignal::new(MessageKind::Offer, serde_json::json!("v=0")),
            )
            .await
            .unwrap();
        assert!(outcome.message.is_none());
        assert!(matches!(outcome.delivery, Delivery::Dropped(_)));
    }

    #[tokio::test]
    async fn test_answer_marks_negotiated() {
        let (manager, _, _dir) = manager();
        let session = active_session(&manager).await;
        let (a_channel, _a_rx) = MpscChannel::new(32);
        manager
            .register_channel(&session.id, "patientA", a_channel, None)
            .await
            .unwrap();

        manager
            .relay(
                &session.id,
                "providerB",
                OutboundSignal::new(MessageKind::Answer, serde_json::json!("v=0")),
            )
            .await
            .unwrap();
        assert!(manager.get(&session.id).await.unwrap().negotiated);
    }

    #[tokio::test]
    async fn test_chat_ids_are_monotonic() {
        let (manager, _, _dir) = manager();
        let session = active_session(&manager).await;

        let mut last = 0;
        for i in 0..5 {
            let sender = if i % 2 == 0 { "patientA" } else { "providerB" };
            let message = manager
                .send_chat(&session.id, sender, &format!("msg {}", i), true)
                .await
                .unwrap();
            assert!(message.id > last);
            last = message.id;
        }

        let history = manager.chat_history(&session.id).await.unwrap();
        assert_eq!(history.len(), 5);

        manager
            .end(&session.id, EndReason::EndedByParticipant, None)
            .await
            .unwrap();
        let stored = manager.chat_history(&session.id).await.unwrap();
        assert_eq!(stored, history);
    }

    #[tokio::test]
    async fn test_chat_requires_active_session() {
        let (manager, _, _dir) = manager();
        let session = manager
            .create_session("patientA", "providerB", SessionType::ChatOnly, None, None)
            .await
            .unwrap();
        manager
            .join(&session.id, "patientA", ParticipantRole::Patient)
            .await
            .unwrap();
        let result = manager.send_chat(&session.id, "patientA", "hi", true).await;
        assert!(matches!(result, Err(Error::SessionNotActive(_))));
    }

    #[tokio::test]
    async fn test_chat_only_session_is_not_sampled() {
        let (manager, _, _dir) = manager();
        let session = manager
            .create_session("patientA", "providerB", SessionType::ChatOnly, None, None)
            .await
            .unwrap();
        let result = manager.monitor_quality(&session.id, Arc::new(VirtualTransport::new()), None);
        assert!(matches!(result, Err(Error::InvalidData(_))));
    }

    #[tokio::test]
    async fn test_reconnect_replays_missed_chat() {
        let (manager, _, _dir) = manager();
        let session = active_session(&manager).await;

        manager
            .send_chat(&session.id, "patientA", "are you there?", true)
            .await
            .unwrap();

        let (b_channel, mut b_rx) = MpscChannel::new(32);
        manager
            .register_channel(&session.id, "providerB", b_channel, None)
            .await
            .unwrap();
        let received = methods(&mut b_rx);
        assert!(received.contains(&"chat.message".to_string()));
    }

    #[tokio::test]
    async fn test_register_channel_for_unjoined_participant() {
        let (manager, _, _dir) = manager();
        let session = manager
            .create_session("patientA", "providerB", SessionType::Video, None, None)
            .await
            .unwrap();
        let (channel, _rx) = MpscChannel::new(8);
        let result = manager
            .register_channel(&session.id, "providerB", channel, None)
            .await;
        assert!(matches!(result, Err(Error::InvalidParticipants(_))));
    }

    #[tokio::test]
    async fn test_grace_period_expiry_ends_session() {
        let mut config = ConsultConfig::default();
        config.session.grace_period_ms = 50;
        let (manager, _, _dir) = manager_with(config);
        let session = active_session(&manager).await;
        let mut updates = manager.subscribe(&session.id).unwrap();

        manager.leave(&session.id, "providerB").await.unwrap();
        let ended = updates
            .wait_for(|s| s.status.is_terminal())
            .await
            .unwrap()
            .clone();
        assert_eq!(ended.end_reason, Some(EndReason::ParticipantLeft));
    }

    #[tokio::test]
    async fn test_rejoin_within_grace_keeps_session() {
        let mut config = ConsultConfig::default();
        config.session.grace_period_ms = 100;
        let (manager, _, _dir) = manager_with(config);
        let session = active_session(&manager).await;

        manager.leave(&session.id, "providerB").await.unwrap();
        let (channel, _rx) = MpscChannel::new(8);
        manager
            .join(&session.id, "providerB", ParticipantRole::Provider)
            .await
            .unwrap();
        manager
            .register_channel(&session.id, "providerB", channel, None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        let current = manager.get(&session.id).await.unwrap();
        assert_eq!(current.status, SessionStatus::Active);
        assert!(current.binding("providerB").unwrap().connected);
    }

    #[tokio::test]
    async fn test_media_failure_keeps_waiting_with_reason() {
        let (manager, _, _dir) = manager();
        let session = manager
            .create_session("patientA", "providerB", SessionType::Video, None, None)
            .await
            .unwrap();
        manager
            .join(&session.id, "patientA", ParticipantRole::Patient)
            .await
            .unwrap();

        let updated = manager
            .report_media_failure(
                &session.id,
                "patientA",
                &Error::MediaAccessDenied("camera".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Waiting);
        assert!(updated.status_reason.unwrap().contains("Media access denied"));

        let not_media = manager
            .report_media_failure(&session.id, "patientA", &Error::SessionFull("x".into()))
            .await;
        assert!(matches!(not_media, Err(Error::InvalidData(_))));
    }

    #[tokio::test]
    async fn test_quality_sink_updates_session() {
        let (manager, _, _dir) = manager();
        let session = active_session(&manager).await;
        let sink = manager.quality_sink(&session.id);

        sink.report(QualityUpdate::Sample(crate::quality::QualitySample::lost()))
            .await;
        let current = manager.get(&session.id).await.unwrap();
        assert_eq!(current.connection_quality_last, Some(ConnectionQuality::Poor));
    }

    #[tokio::test]
    async fn test_ingest_recording_round_trip() {
        let (manager, _, _dir) = manager();
        let session = active_session(&manager).await;

        let recording = manager.open_ingest(&session.id, "providerB").await.unwrap();
        assert_eq!(recording.owner_role, ParticipantRole::Provider);
        manager
            .push_ingest_chunk(
                &recording.id,
                MediaChunk::new(vec![7u8; 64], Duration::from_millis(500)),
            )
            .await
            .unwrap();

        let finalized = manager.stop_recording(&recording.id).await.unwrap();
        assert!(finalized.is_finalized());
        assert_eq!(finalized.size_bytes, 64);
        assert!(matches!(
            manager
                .push_ingest_chunk(&recording.id, MediaChunk::new(vec![1u8], Duration::ZERO))
                .await,
            Err(Error::NoActiveStream(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_ends_everything() {
        let (manager, _, _dir) = manager();
        let first = active_session(&manager).await;
        let second = manager
            .create_session("patientC", "providerD", SessionType::Audio, None, None)
            .await
            .unwrap();

        manager.shutdown().await;
        assert_eq!(manager.live_session_count(), 0);
        for id in [&first.id, &second.id] {
            let session = manager.get(id).await.unwrap();
            assert_eq!(session.end_reason, Some(EndReason::ServerShutdown));
        }
    }
}
