//! Per-session actor
//!
//! All state of one session (status, membership, message counter, chat
//! log and timers) lives in a single task and changes only in response to
//! inbox commands or the task's own deadlines. Every change is published
//! as a [`Session`] snapshot on a watch channel and as a `session.state`
//! frame to the session's connected channels.

use super::model::{
    EndReason, JoinResult, ParticipantBinding, ParticipantId, ParticipantRole, Session,
    SessionId, SessionStatus,
};
use crate::chat::ChatLog;
use crate::config::SessionConfig;
use crate::quality::ConnectionQuality;
use crate::recording::{RecordableStream, Recording, RecordingPipeline};
use crate::signaling::channel::SignalingChannel;
use crate::signaling::message::{MessageId, MessageKind, OutboundSignal, SignalingMessage};
use crate::signaling::protocol::JsonRpcNotification;
use crate::signaling::relay::{ActivationEvent, Delivery, SignalingRelay};
use crate::store::{run_blocking, ConsultStore};
use crate::{Error, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Result of a relay request
#[derive(Debug, Clone, PartialEq)]
pub struct RelayOutcome {
    /// The stamped message; `None` when the session was not relaying
    pub message: Option<SignalingMessage>,
    pub delivery: Delivery,
}

/// Requests handled by a session actor
pub(crate) enum Command {
    Join {
        participant_id: ParticipantId,
        role: ParticipantRole,
        reply: oneshot::Sender<Result<JoinResult>>,
    },
    RegisterChannel {
        participant_id: ParticipantId,
        channel: Arc<dyn SignalingChannel>,
        resume_after: Option<MessageId>,
        reply: oneshot::Sender<Result<Session>>,
    },
    Leave {
        participant_id: ParticipantId,
        channel_id: Option<String>,
        reply: oneshot::Sender<Result<Session>>,
    },
    Relay {
        sender_id: ParticipantId,
        signal: OutboundSignal,
        reply: oneshot::Sender<Result<RelayOutcome>>,
    },
    Chat {
        sender_id: ParticipantId,
        text: String,
        echo: bool,
        reply: oneshot::Sender<Result<SignalingMessage>>,
    },
    ChatHistory {
        reply: oneshot::Sender<Result<Vec<SignalingMessage>>>,
    },
    ReportQuality {
        quality: ConnectionQuality,
        reply: oneshot::Sender<Result<Session>>,
    },
    ReportMediaFailure {
        participant_id: ParticipantId,
        reason: String,
        reply: oneshot::Sender<Result<Session>>,
    },
    StartRecording {
        participant_id: ParticipantId,
        stream: Arc<dyn RecordableStream>,
        reply: oneshot::Sender<Result<Recording>>,
    },
    End {
        reason: EndReason,
        notes: Option<String>,
        reply: oneshot::Sender<Result<Session>>,
    },
}

/// Cheap handle to a running session actor
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub(crate) tx: mpsc::Sender<Command>,
    pub(crate) snapshot: watch::Receiver<Session>,
}

/// Most ended-but-unsaved sessions kept for reads during a store outage
const UNPERSISTED_LIMIT: usize = 1024;

/// Final state of a session whose end could not be saved
#[derive(Clone)]
pub(crate) struct EndedSession {
    pub(crate) session: Session,
    pub(crate) history: Vec<SignalingMessage>,
}

/// Ended sessions the store has not accepted yet
///
/// Bounded; the oldest entry is dropped when full.
pub(crate) struct UnpersistedSessions {
    entries: DashMap<SessionId, EndedSession>,
    capacity: usize,
}

impl UnpersistedSessions {
    pub(crate) fn new() -> Self {
        Self::with_capacity(UNPERSISTED_LIMIT)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn insert(&self, ended: EndedSession) {
        while self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().session.ended_at)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(id) => {
                    self.entries.remove(&id);
                    warn!(session_id = %id, "Dropped unsaved ended session");
                }
                None => break,
            }
        }
        self.entries.insert(ended.session.id.clone(), ended);
    }

    pub(crate) fn get(&self, session_id: &str) -> Option<EndedSession> {
        self.entries.get(session_id).map(|entry| entry.value().clone())
    }

    pub(crate) fn contains(&self, session_id: &str) -> bool {
        self.entries.contains_key(session_id)
    }

    pub(crate) fn remove(&self, session_id: &str) {
        self.entries.remove(session_id);
    }

    pub(crate) fn snapshot(&self) -> Vec<EndedSession> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Collaborators shared by all session actors
#[derive(Clone)]
pub(crate) struct ActorContext {
    pub(crate) config: SessionConfig,
    pub(crate) relay: Arc<SignalingRelay>,
    pub(crate) pipeline: Arc<RecordingPipeline>,
    pub(crate) store: Arc<dyn ConsultStore>,
    pub(crate) registry: Arc<DashMap<SessionId, SessionHandle>>,
    pub(crate) unpersisted: Arc<UnpersistedSessions>,
}

pub(crate) struct SessionActor {
    session: Session,
    ctx: ActorContext,
    snapshot_tx: watch::Sender<Session>,
    chat: ChatLog,
    next_message_id: MessageId,
    grace_deadlines: HashMap<ParticipantId, Instant>,
    idle_deadline: Option<Instant>,
}

impl SessionActor {
    /// Spawn the actor for a freshly created session and register its handle
    pub(crate) fn spawn(session: Session, ctx: ActorContext) -> SessionHandle {
        let (tx, rx) = mpsc::channel(ctx.config.inbox_capacity);
        let (snapshot_tx, snapshot) = watch::channel(session.clone());

        if session.status.accepts_channels() {
            ctx.relay.open_session(&session.id);
        }

        let handle = SessionHandle { tx, snapshot };
        ctx.registry.insert(session.id.clone(), handle.clone());

        let actor = SessionActor {
            chat: ChatLog::new(session.id.clone(), ctx.config.chat_history_limit),
            session,
            ctx,
            snapshot_tx,
            next_message_id: 0,
            grace_deadlines: HashMap::new(),
            idle_deadline: None,
        };
        tokio::spawn(actor.run(rx));
        handle
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        debug!(session_id = %self.session.id, status = %self.session.status, "Session actor started");

        while !self.session.status.is_terminal() {
            let deadline = self.next_deadline();
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        // every handle is gone; nobody can reach this session any more
                        let _ = self.finish(EndReason::ServerShutdown, None).await;
                    }
                },
                _ = sleep_until_opt(deadline) => self.on_deadline().await,
            }
        }

        // answer whatever raced with the end transition
        rx.close();
        while let Ok(command) = rx.try_recv() {
            self.handle(command).await;
        }

        debug!(session_id = %self.session.id, "Session actor stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.grace_deadlines
            .values()
            .copied()
            .chain(self.idle_deadline)
            .min()
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Join {
                participant_id,
                role,
                reply,
            } => {
                let _ = reply.send(self.join(participant_id, role));
            }
            Command::RegisterChannel {
                participant_id,
                channel,
                resume_after,
                reply,
            } => {
                let _ = reply.send(self.register_channel(participant_id, channel, resume_after));
            }
            Command::Leave {
                participant_id,
                channel_id,
                reply,
            } => {
                let _ = reply.send(self.leave(&participant_id, channel_id.as_deref()));
            }
            Command::Relay {
                sender_id,
                signal,
                reply,
            } => {
                let _ = reply.send(self.relay(&sender_id, signal));
            }
            Command::Chat {
                sender_id,
                text,
                echo,
                reply,
            } => {
                let _ = reply.send(self.chat(&sender_id, text, echo));
            }
            Command::ChatHistory { reply } => {
                let _ = reply.send(Ok(self.chat.history()));
            }
            Command::ReportQuality { quality, reply } => {
                let _ = reply.send(self.report_quality(quality));
            }
            Command::ReportMediaFailure {
                participant_id,
                reason,
                reply,
            } => {
                let _ = reply.send(self.report_media_failure(&participant_id, reason));
            }
            Command::StartRecording {
                participant_id,
                stream,
                reply,
            } => {
                let result = self.start_recording(&participant_id, stream).await;
                let _ = reply.send(result);
            }
            Command::End {
                reason,
                notes,
                reply,
            } => {
                let result = if self.session.status.is_terminal() {
                    Ok(self.session.clone())
                } else {
                    self.finish(reason, notes).await
                };
                let _ = reply.send(result);
            }
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.session.status.is_terminal() {
            return Err(Error::SessionEnded(self.session.id.clone()));
        }
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        self.ensure_live()?;
        if self.session.status != SessionStatus::Active {
            return Err(Error::SessionNotActive(format!(
                "session {} is {}",
                self.session.id, self.session.status
            )));
        }
        Ok(())
    }

    fn bound_role(&self, participant_id: &str) -> Result<ParticipantRole> {
        self.session
            .binding(participant_id)
            .map(|b| b.role)
            .ok_or_else(|| {
                Error::InvalidParticipants(format!(
                    "{} has not joined session {}",
                    participant_id, self.session.id
                ))
            })
    }

    fn join(&mut self, participant_id: ParticipantId, role: ParticipantRole) -> Result<JoinResult> {
        self.ensure_live()?;

        if let Some(binding) = self.session.binding(&participant_id) {
            if binding.role != role {
                return Err(Error::InvalidParticipants(format!(
                    "{} is bound to session {} as {}, not {}",
                    participant_id, self.session.id, binding.role, role
                )));
            }
            self.grace_deadlines.remove(&participant_id);
            debug!(session_id = %self.session.id, participant_id = %participant_id, "Participant rejoined");
            return Ok(JoinResult {
                session: self.session.clone(),
                rejoined: true,
                activated: false,
            });
        }

        if !self.session.is_rostered(&participant_id) {
            let detail = format!(
                "session {} is reserved for {} and {}",
                self.session.id, self.session.participant_a_id, self.session.participant_b_id
            );
            // with both slots taken this is a third distinct identity
            return Err(if self.session.participants.len() >= 2 {
                Error::SessionFull(detail)
            } else {
                Error::InvalidParticipants(detail)
            });
        }

        self.session.participants.push(ParticipantBinding {
            participant_id: participant_id.clone(),
            role,
            connected: false,
        });

        if self.session.status == SessionStatus::Scheduled {
            self.set_status(SessionStatus::Waiting);
            self.ctx.relay.open_session(&self.session.id);
        }

        let mut activated = false;
        if self.session.participants.len() == 2 && self.session.status == SessionStatus::Waiting {
            self.set_status(SessionStatus::Active);
            let event = ActivationEvent::new(
                self.session.id.clone(),
                self.session
                    .participants
                    .iter()
                    .map(|p| p.participant_id.clone())
                    .collect(),
            );
            self.ctx.relay.activate(&event);
            self.touch();
            activated = true;
        }

        info!(
            session_id = %self.session.id,
            participant_id = %participant_id,
            role = %role,
            status = %self.session.status,
            "Participant joined"
        );
        self.publish();

        Ok(JoinResult {
            session: self.session.clone(),
            rejoined: false,
            activated,
        })
    }

    fn register_channel(
        &mut self,
        participant_id: ParticipantId,
        channel: Arc<dyn SignalingChannel>,
        resume_after: Option<MessageId>,
    ) -> Result<Session> {
        self.ensure_live()?;
        if !self.session.status.accepts_channels() {
            return Err(Error::SessionNotActive(format!(
                "session {} is {}",
                self.session.id, self.session.status
            )));
        }
        self.bound_role(&participant_id)?;

        self.ctx
            .relay
            .register_channel(&self.session.id, &participant_id, channel)?;
        self.grace_deadlines.remove(&participant_id);
        self.set_connected(&participant_id, true);
        self.publish();

        self.chat.replay(&self.ctx.relay, &participant_id, resume_after);
        Ok(self.session.clone())
    }

    fn leave(&mut self, participant_id: &str, channel_id: Option<&str>) -> Result<Session> {
        if self.session.status.is_terminal() {
            return Ok(self.session.clone());
        }
        self.bound_role(participant_id)?;

        let removed = self
            .ctx
            .relay
            .unregister_channel(&self.session.id, participant_id, channel_id);
        if !removed && channel_id.is_some() {
            debug!(session_id = %self.session.id, participant_id = %participant_id, "Ignoring close of a superseded channel");
            return Ok(self.session.clone());
        }

        let grace = self.ctx.config.grace_period();
        self.grace_deadlines
            .insert(participant_id.to_string(), Instant::now() + grace);
        self.set_connected(participant_id, false);

        info!(
            session_id = %self.session.id,
            participant_id = %participant_id,
            grace_ms = grace.as_millis() as u64,
            "Participant left, grace period started"
        );
        self.publish();
        Ok(self.session.clone())
    }

    fn relay(&mut self, sender_id: &str, signal: OutboundSignal) -> Result<RelayOutcome> {
        if signal.kind == MessageKind::Chat {
            let text = signal.payload.as_str().unwrap_or_default().to_string();
            let message = self.chat(sender_id, text, false)?;
            return Ok(RelayOutcome {
                message: Some(message),
                delivery: Delivery::Delivered,
            });
        }

        self.ensure_live()?;
        let sender_role = self.bound_role(sender_id)?;

        if self.session.status != SessionStatus::Active {
            warn!(
                session_id = %self.session.id,
                sender_id = %sender_id,
                kind = %signal.kind,
                status = %self.session.status,
                "Dropping message for session that is not active"
            );
            return Ok(RelayOutcome {
                message: None,
                delivery: Delivery::Dropped(format!("session is {}", self.session.status)),
            });
        }

        let message = self.stamp(sender_id, sender_role, signal);
        let recipient = self
            .session
            .counterpart(sender_id)
            .unwrap_or_default()
            .to_string();
        let delivery = self.ctx.relay.route(&message, &recipient);
        self.touch();

        if message.kind == MessageKind::Answer && delivery.is_delivered() && !self.session.negotiated {
            self.session.negotiated = true;
            info!(session_id = %self.session.id, "Offer/answer exchange completed");
            self.publish();
        }

        Ok(RelayOutcome {
            message: Some(message),
            delivery,
        })
    }

    fn chat(&mut self, sender_id: &str, text: String, echo: bool) -> Result<SignalingMessage> {
        self.ensure_active()?;
        let sender_role = self.bound_role(sender_id)?;

        let message = self.stamp(
            sender_id,
            sender_role,
            OutboundSignal::new(MessageKind::Chat, serde_json::Value::String(text)),
        );
        let participants: Vec<ParticipantId> = self
            .session
            .participants
            .iter()
            .map(|p| p.participant_id.clone())
            .collect();

        self.chat
            .publish(&self.ctx.relay, message.clone(), &participants, echo);
        self.touch();
        Ok(message)
    }

    fn stamp(
        &mut self,
        sender_id: &str,
        sender_role: ParticipantRole,
        signal: OutboundSignal,
    ) -> SignalingMessage {
        self.next_message_id += 1;
        SignalingMessage {
            id: self.next_message_id,
            session_id: self.session.id.clone(),
            kind: signal.kind,
            sender_id: sender_id.to_string(),
            sender_role,
            payload: signal.payload,
            sent_at: Utc::now(),
        }
    }

    fn report_quality(&mut self, quality: ConnectionQuality) -> Result<Session> {
        self.ensure_live()?;
        if self.session.connection_quality_last != Some(quality) {
            debug!(session_id = %self.session.id, quality = %quality, "Connection quality changed");
            self.session.connection_quality_last = Some(quality);
            self.publish();
        }
        Ok(self.session.clone())
    }

    fn report_media_failure(&mut self, participant_id: &str, reason: String) -> Result<Session> {
        self.ensure_live()?;
        self.bound_role(participant_id)?;

        let status_reason = format!("{}: {}", participant_id, reason);
        warn!(
            session_id = %self.session.id,
            participant_id = %participant_id,
            reason = %reason,
            status = %self.session.status,
            "Participant media unavailable"
        );
        self.session.status_reason = Some(status_reason);
        self.publish();
        Ok(self.session.clone())
    }

    async fn start_recording(
        &mut self,
        participant_id: &str,
        stream: Arc<dyn RecordableStream>,
    ) -> Result<Recording> {
        self.ensure_active()?;
        let owner_role = self.bound_role(participant_id)?;
        self.ctx
            .pipeline
            .start_recording(&self.session.id, owner_role, stream)
            .await
    }

    async fn on_deadline(&mut self) {
        let now = Instant::now();

        if let Some(idle) = self.idle_deadline {
            if idle <= now {
                self.idle_deadline = None;
                if self.session.status == SessionStatus::Active {
                    info!(session_id = %self.session.id, "No signaling traffic within idle window");
                    let _ = self.finish(EndReason::IdleTimeout, None).await;
                    return;
                }
            }
        }

        let expired: Vec<ParticipantId> = self
            .grace_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(participant, _)| participant.clone())
            .collect();

        for participant_id in expired {
            self.grace_deadlines.remove(&participant_id);
            let still_gone = self
                .session
                .binding(&participant_id)
                .map(|b| !b.connected)
                .unwrap_or(false);
            if !still_gone {
                continue;
            }

            let nobody_connected = self.session.participants.iter().all(|p| !p.connected);
            let should_end = match self.session.status {
                SessionStatus::Active => true,
                SessionStatus::Waiting => nobody_connected,
                _ => false,
            };
            if should_end {
                info!(session_id = %self.session.id, participant_id = %participant_id, "Grace period expired without rejoin");
                let _ = self.finish(EndReason::ParticipantLeft, None).await;
                return;
            }
        }
    }

    /// ENDED transition and cleanup
    ///
    /// The status flips before any await, so commands answered afterwards
    /// see a terminal session.
    async fn finish(&mut self, reason: EndReason, notes: Option<String>) -> Result<Session> {
        self.session.status = SessionStatus::Ended;
        self.session.ended_at = Some(Utc::now());
        self.session.end_reason = Some(reason);
        if notes.is_some() {
            self.session.notes = notes;
        }
        for binding in &mut self.session.participants {
            binding.connected = false;
        }
        self.grace_deadlines.clear();
        self.idle_deadline = None;

        // recordings are final before anyone observes ENDED
        self.ctx.pipeline.finalize_session(&self.session.id).await;

        info!(session_id = %self.session.id, reason = %reason, "Session ended");
        self.publish();
        self.ctx.relay.teardown(&self.session.id);

        let session = self.session.clone();
        let history = self.chat.history();
        let persisted = run_blocking(&self.ctx.store, move |store| {
            store.save_session(&session)?;
            store.save_chat_history(&session.id, &history)
        })
        .await;

        let result = match persisted {
            Ok(()) => Ok(self.session.clone()),
            Err(e) => {
                error!(session_id = %self.session.id, error = %e, "Failed to persist ended session");
                self.ctx.unpersisted.insert(EndedSession {
                    session: self.session.clone(),
                    history: self.chat.history(),
                });
                Err(e)
            }
        };
        // reads fall through to the unsaved cache or the store from here on
        self.ctx.registry.remove(&self.session.id);
        result
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.session.status != status {
            info!(session_id = %self.session.id, from = %self.session.status, to = %status, "Session status changed");
            self.session.status = status;
        }
    }

    fn set_connected(&mut self, participant_id: &str, connected: bool) {
        if let Some(binding) = self
            .session
            .participants
            .iter_mut()
            .find(|p| p.participant_id == participant_id)
        {
            binding.connected = connected;
        }
    }

    /// Reset the idle watchdog
    fn touch(&mut self) {
        if self.session.status == SessionStatus::Active {
            self.idle_deadline = Some(Instant::now() + self.ctx.config.idle_timeout());
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.session.clone());
        match JsonRpcNotification::state(&self.session).to_json() {
            Ok(frame) => self.ctx.relay.broadcast_frame(&self.session.id, &frame),
            Err(e) => warn!(session_id = %self.session.id, error = %e, "Failed to encode session state"),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
