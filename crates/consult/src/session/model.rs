//! Session data model
//!
//! `Session` is both the persisted record and the read-only snapshot the
//! session actor publishes after every change.

use crate::quality::ConnectionQuality;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session identifier
pub type SessionId = String;

/// Participant identifier (pre-validated by the identity layer)
pub type ParticipantId = String;

/// Kind of consultation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Video,
    Audio,
    ChatOnly,
}

impl SessionType {
    /// Whether the session carries a media transport at all
    pub fn has_media(&self) -> bool {
        !matches!(self, SessionType::ChatOnly)
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Created for a future time, nobody has joined yet
    Scheduled,
    /// Waiting for the second participant
    Waiting,
    /// Both participants admitted
    Active,
    /// Terminated, read-only
    Ended,
    /// Terminated abnormally, read-only
    Failed,
}

impl SessionStatus {
    /// ENDED and FAILED are terminal and immutable
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Failed)
    }

    /// Statuses under which signaling channels may be registered
    pub fn accepts_channels(&self) -> bool {
        matches!(self, SessionStatus::Waiting | SessionStatus::Active)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Scheduled => write!(f, "SCHEDULED"),
            SessionStatus::Waiting => write!(f, "WAITING"),
            SessionStatus::Active => write!(f, "ACTIVE"),
            SessionStatus::Ended => write!(f, "ENDED"),
            SessionStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Role a participant joins with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Patient,
    Provider,
    Family,
    Guest,
}

impl std::fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParticipantRole::Patient => write!(f, "patient"),
            ParticipantRole::Provider => write!(f, "provider"),
            ParticipantRole::Family => write!(f, "family"),
            ParticipantRole::Guest => write!(f, "guest"),
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// A participant ended the call
    EndedByParticipant,
    /// No signaling traffic within the idle window
    IdleTimeout,
    /// A participant left and did not return within the grace period
    ParticipantLeft,
    /// The server is shutting down
    ServerShutdown,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::EndedByParticipant => write!(f, "ended_by_participant"),
            EndReason::IdleTimeout => write!(f, "idle_timeout"),
            EndReason::ParticipantLeft => write!(f, "participant_left"),
            EndReason::ServerShutdown => write!(f, "server_shutdown"),
        }
    }
}

/// A participant bound to one of the two session slots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantBinding {
    pub participant_id: ParticipantId,
    pub role: ParticipantRole,
    /// A signaling channel is currently registered
    pub connected: bool,
}

/// One consultation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub participant_a_id: ParticipantId,
    pub participant_b_id: ParticipantId,
    pub session_type: SessionType,
    pub status: SessionStatus,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub connection_quality_last: Option<ConnectionQuality>,
    pub end_reason: Option<EndReason>,
    /// Explicit reason the session is stuck (e.g. denied camera permission)
    pub status_reason: Option<String>,
    /// Participants that have joined, in join order (at most two)
    pub participants: Vec<ParticipantBinding>,
    /// At least one offer/answer pair crossed the relay
    pub negotiated: bool,
}

impl Session {
    /// Whether `participant_id` is one of the two rostered identities
    pub fn is_rostered(&self, participant_id: &str) -> bool {
        self.participant_a_id == participant_id || self.participant_b_id == participant_id
    }

    /// Binding for a joined participant
    pub fn binding(&self, participant_id: &str) -> Option<&ParticipantBinding> {
        self.participants
            .iter()
            .find(|p| p.participant_id == participant_id)
    }

    /// The other rostered identity
    pub fn counterpart(&self, participant_id: &str) -> Option<&str> {
        if self.participant_a_id == participant_id {
            Some(&self.participant_b_id)
        } else if self.participant_b_id == participant_id {
            Some(&self.participant_a_id)
        } else {
            None
        }
    }
}

/// Result of a successful join
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResult {
    /// Session state after the join
    pub session: Session,
    /// The identity was already bound (reconnection)
    pub rejoined: bool,
    /// This join moved the session to ACTIVE
    pub activated: bool,
}
