//! Signaling relay
//!
//! Maps (session, participant) to the participant's current channel and
//! forwards messages to the other side. Routes exist only while a session
//! is WAITING or ACTIVE; messages are forwarded only while it is ACTIVE.
//! Delivery is non-blocking and best-effort: a disconnected or congested
//! recipient loses the message.

use super::channel::SignalingChannel;
use super::message::SignalingMessage;
use super::protocol::JsonRpcNotification;
use crate::session::{ParticipantId, SessionId};
use crate::{Error, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Emitted by the session when its second participant is admitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationEvent {
    pub session_id: SessionId,
    pub participants: Vec<ParticipantId>,
}

impl ActivationEvent {
    pub fn new(session_id: impl Into<SessionId>, participants: Vec<ParticipantId>) -> Self {
        Self {
            session_id: session_id.into(),
            participants,
        }
    }
}

/// Outcome of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Recipient has no open channel
    Disconnected,
    /// Session is not relaying or the recipient's queue rejected the frame
    Dropped(String),
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered)
    }
}

struct SessionRoutes {
    active: bool,
    channels: HashMap<ParticipantId, Arc<dyn SignalingChannel>>,
}

/// Registry of participant channels per session
#[derive(Default)]
pub struct SignalingRelay {
    routes: DashMap<SessionId, SessionRoutes>,
}

impl SignalingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept channel registrations for a session (it became WAITING)
    pub fn open_session(&self, session_id: &str) {
        self.routes
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRoutes {
                active: false,
                channels: HashMap::new(),
            });
    }

    /// Start forwarding messages for the activated session
    pub fn activate(&self, event: &ActivationEvent) {
        if let Some(mut routes) = self.routes.get_mut(&event.session_id) {
            routes.active = true;
            info!(
                session_id = %event.session_id,
                participants = ?event.participants,
                "Relay activated"
            );
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.routes
            .get(session_id)
            .map(|r| r.active)
            .unwrap_or(false)
    }

    /// Bind `channel` to a participant, superseding any previous channel
    ///
    /// The superseded channel is closed and returned.
    ///
    /// # Errors
    ///
    /// `SessionNotActive` if the session is not WAITING or ACTIVE.
    pub fn register_channel(
        &self,
        session_id: &str,
        participant_id: &str,
        channel: Arc<dyn SignalingChannel>,
    ) -> Result<Option<Arc<dyn SignalingChannel>>> {
        let mut routes = self.routes.get_mut(session_id).ok_or_else(|| {
            Error::SessionNotActive(format!(
                "session {} does not accept signaling channels",
                session_id
            ))
        })?;

        let channel_id = channel.channel_id().to_string();
        let previous = routes
            .channels
            .insert(participant_id.to_string(), channel)
            .filter(|old| old.channel_id() != channel_id);
        drop(routes);

        if let Some(old) = &previous {
            info!(
                session_id = %session_id,
                participant_id = %participant_id,
                old_channel = %old.channel_id(),
                new_channel = %channel_id,
                "Signaling channel superseded"
            );
            old.close();
        } else {
            debug!(session_id = %session_id, participant_id = %participant_id, channel_id = %channel_id, "Signaling channel registered");
        }
        Ok(previous)
    }

    /// Remove a participant's channel
    ///
    /// With `channel_id` set, only that exact channel is removed, so a
    /// superseded connection cannot unregister its replacement.
    pub fn unregister_channel(
        &self,
        session_id: &str,
        participant_id: &str,
        channel_id: Option<&str>,
    ) -> bool {
        let Some(mut routes) = self.routes.get_mut(session_id) else {
            return false;
        };
        let matches = match (routes.channels.get(participant_id), channel_id) {
            (Some(current), Some(expected)) => current.channel_id() == expected,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            routes.channels.remove(participant_id);
            debug!(session_id = %session_id, participant_id = %participant_id, "Signaling channel unregistered");
        }
        matches
    }

    /// Whether the participant currently has an open channel
    pub fn is_connected(&self, session_id: &str, participant_id: &str) -> bool {
        self.routes
            .get(session_id)
            .and_then(|r| r.channels.get(participant_id).map(|c| c.is_open()))
            .unwrap_or(false)
    }

    /// Forward `message` to `recipient`
    ///
    /// Never fails: undeliverable messages are logged and dropped.
    pub fn route(&self, message: &SignalingMessage, recipient: &str) -> Delivery {
        if !self.is_active(&message.session_id) {
            warn!(
                session_id = %message.session_id,
                message_id = message.id,
                kind = %message.kind,
                "Dropping message, session is not relaying"
            );
            return Delivery::Dropped("session not active".to_string());
        }

        let frame = match JsonRpcNotification::relayed(message).to_json() {
            Ok(frame) => frame,
            Err(e) => return Delivery::Dropped(e.to_string()),
        };
        let delivery = self.send_frame(&message.session_id, recipient, frame);

        match &delivery {
            Delivery::Delivered => debug!(
                session_id = %message.session_id,
                message_id = message.id,
                kind = %message.kind,
                sender_id = %message.sender_id,
                recipient = %recipient,
                "Message relayed"
            ),
            Delivery::Disconnected => warn!(
                session_id = %message.session_id,
                message_id = message.id,
                kind = %message.kind,
                recipient = %recipient,
                "Dropping message, recipient not connected"
            ),
            Delivery::Dropped(reason) => warn!(
                session_id = %message.session_id,
                message_id = message.id,
                kind = %message.kind,
                recipient = %recipient,
                reason = %reason,
                "Dropping message"
            ),
        }
        delivery
    }

    /// Queue a pre-encoded frame for one participant
    pub fn send_frame(&self, session_id: &str, participant_id: &str, frame: String) -> Delivery {
        let channel = self
            .routes
            .get(session_id)
            .and_then(|r| r.channels.get(participant_id).cloned());

        match channel {
            Some(channel) if channel.is_open() => match channel.send(frame) {
                Ok(()) => Delivery::Delivered,
                Err(e) => Delivery::Dropped(e.to_string()),
            },
            _ => Delivery::Disconnected,
        }
    }

    /// Queue a frame for every registered participant
    pub fn broadcast_frame(&self, session_id: &str, frame: &str) {
        let channels: Vec<Arc<dyn SignalingChannel>> = self
            .routes
            .get(session_id)
            .map(|r| r.channels.values().cloned().collect())
            .unwrap_or_default();

        for channel in channels {
            if let Err(e) = channel.send(frame.to_string()) {
                debug!(session_id = %session_id, channel_id = %channel.channel_id(), error = %e, "Broadcast frame not queued");
            }
        }
    }

    /// Drop the routing entry of a session
    ///
    /// Channels stay open; their connections may still receive responses.
    pub fn teardown(&self, session_id: &str) {
        if let Some((_, routes)) = self.routes.remove(session_id) {
            info!(session_id = %session_id, channels = routes.channels.len(), "Relay torn down");
        }
    }

    /// Number of sessions with open routes
    pub fn session_count(&self) -> usize {
        self.routes.len()
    }
}
