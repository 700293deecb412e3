//! Error types for the consultation session core

/// Result type alias using the consult Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in consultation session operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Participant ids are empty or identical
    #[error("Invalid participants: {0}")]
    InvalidParticipants(String),

    /// Session id is unknown
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Both participant slots are bound to other identities
    #[error("Session full: {0}")]
    SessionFull(String),

    /// Session is not in a state that accepts this operation
    #[error("Session not active: {0}")]
    SessionNotActive(String),

    /// Session has ended (or failed) and is read-only
    #[error("Session ended: {0}")]
    SessionEnded(String),

    /// Platform denied camera/microphone/screen permission
    #[error("Media access denied: {0}")]
    MediaAccessDenied(String),

    /// No device matches the requested constraints
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    /// SDP/ICE negotiation failed or was invoked in the wrong state
    #[error("Negotiation error: {0}")]
    NegotiationError(String),

    /// Another offer/answer exchange is still pending on this transport
    #[error("Negotiation in progress: {0}")]
    NegotiationInProgress(String),

    /// Stream has no live tracks, or recording was never started
    #[error("No active stream: {0}")]
    NoActiveStream(String),

    /// A recording is already running for this stream
    #[error("Recording already active: {0}")]
    RecordingAlreadyActive(String),

    /// External persistence layer failed
    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid data format
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PersistenceUnavailable(_)
                | Error::NegotiationInProgress(_)
                | Error::WebSocketError(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error concerns session state or membership
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidParticipants(_)
                | Error::SessionNotFound(_)
                | Error::SessionFull(_)
                | Error::SessionNotActive(_)
                | Error::SessionEnded(_)
        )
    }

    /// Check if this error comes from local media or negotiation
    pub fn is_media_error(&self) -> bool {
        matches!(
            self,
            Error::MediaAccessDenied(_)
                | Error::MediaUnavailable(_)
                | Error::NegotiationError(_)
                | Error::NegotiationInProgress(_)
        )
    }

    /// Stable kind name, as surfaced to signaling clients
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidParticipants(_) => "InvalidParticipants",
            Error::SessionNotFound(_) => "SessionNotFound",
            Error::SessionFull(_) => "SessionFull",
            Error::SessionNotActive(_) => "SessionNotActive",
            Error::SessionEnded(_) => "SessionEnded",
            Error::MediaAccessDenied(_) => "MediaAccessDenied",
            Error::MediaUnavailable(_) => "MediaUnavailable",
            Error::NegotiationError(_) => "NegotiationError",
            Error::NegotiationInProgress(_) => "NegotiationInProgress",
            Error::NoActiveStream(_) => "NoActiveStream",
            Error::RecordingAlreadyActive(_) => "RecordingAlreadyActive",
            Error::PersistenceUnavailable(_) => "PersistenceUnavailable",
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::InvalidData(_) => "InvalidData",
            Error::SerializationError(_) => "SerializationError",
            Error::WebSocketError(_) => "WebSocketError",
            Error::WebRtcError(_) => "WebRtcError",
            Error::InternalError(_) | Error::IoError(_) | Error::Other(_) => "InternalError",
        }
    }

    /// JSON-RPC error code for this error
    pub fn rpc_code(&self) -> i32 {
        use crate::signaling::protocol::error_codes;

        match self {
            Error::InvalidParticipants(_) => error_codes::INVALID_PARTICIPANTS,
            Error::SessionNotFound(_) => error_codes::SESSION_NOT_FOUND,
            Error::SessionFull(_) => error_codes::SESSION_FULL,
            Error::SessionNotActive(_) => error_codes::SESSION_NOT_ACTIVE,
            Error::SessionEnded(_) => error_codes::SESSION_ENDED,
            Error::MediaAccessDenied(_) => error_codes::MEDIA_ACCESS_DENIED,
            Error::MediaUnavailable(_) => error_codes::MEDIA_UNAVAILABLE,
            Error::NegotiationError(_) => error_codes::NEGOTIATION_ERROR,
            Error::NegotiationInProgress(_) => error_codes::NEGOTIATION_IN_PROGRESS,
            Error::NoActiveStream(_) => error_codes::NO_ACTIVE_STREAM,
            Error::RecordingAlreadyActive(_) => error_codes::RECORDING_ALREADY_ACTIVE,
            Error::PersistenceUnavailable(_) => error_codes::PERSISTENCE_UNAVAILABLE,
            Error::InvalidData(_) | Error::SerializationError(_) => error_codes::INVALID_PARAMS,
            _ => error_codes::INTERNAL_ERROR,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}
