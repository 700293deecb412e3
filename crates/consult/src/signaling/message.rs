//! Relayed signaling messages

use crate::session::{ParticipantId, ParticipantRole, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monotonic per-session message id
pub type MessageId = u64;

/// Kind of relayed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Offer,
    Answer,
    IceCandidate,
    Chat,
    Control,
}

impl MessageKind {
    /// Offer, answer and ICE candidates
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            MessageKind::Offer | MessageKind::Answer | MessageKind::IceCandidate
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Offer => write!(f, "offer"),
            MessageKind::Answer => write!(f, "answer"),
            MessageKind::IceCandidate => write!(f, "ice_candidate"),
            MessageKind::Chat => write!(f, "chat"),
            MessageKind::Control => write!(f, "control"),
        }
    }
}

/// A message relayed between the two participants of a session
///
/// `payload` is opaque to the relay: SDP text, an ICE candidate object,
/// chat text or a control directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub kind: MessageKind,
    pub sender_id: ParticipantId,
    pub sender_role: ParticipantRole,
    pub payload: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

impl SignalingMessage {
    /// Chat text, if this is a chat message
    pub fn chat_text(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Chat => self.payload.as_str(),
            _ => None,
        }
    }
}

/// Outgoing message before the session assigns id and timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSignal {
    pub kind: MessageKind,
    pub payload: serde_json::Value,
}

impl OutboundSignal {
    pub fn new(kind: MessageKind, payload: serde_json::Value) -> Self {
        Self { kind, payload }
    }

    pub fn control(directive: serde_json::Value) -> Self {
        Self::new(MessageKind::Control, directive)
    }
}
