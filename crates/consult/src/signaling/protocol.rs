//! JSON-RPC 2.0 signaling protocol types

use super::message::{MessageId, MessageKind, SignalingMessage};
use crate::media::{IceCandidate, TrackKind};
use crate::quality::ConnectionQuality;
use crate::session::{ParticipantRole, Session, SessionType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// JSON-RPC 2.0 protocol version
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Method name to invoke
    pub method: String,

    /// Method parameters
    #[serde(default)]
    pub params: serde_json::Value,

    /// Request ID for matching with response (absent for notifications)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 response (success)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub result: serde_json::Value,
    pub id: serde_json::Value,
}

/// JSON-RPC 2.0 error response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub jsonrpc: String,
    pub error: ErrorObject,
    pub id: serde_json::Value,
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    /// Error code
    pub code: i32,

    /// Human-readable error message
    pub message: String,

    /// Additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Server-initiated JSON-RPC 2.0 notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    pub params: serde_json::Value,
}

/// JSON-RPC error codes
pub mod error_codes {
    /// Invalid JSON was received
    pub const PARSE_ERROR: i32 = -32700;

    /// The JSON sent is not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;

    /// The method does not exist / is not available
    pub const METHOD_NOT_FOUND: i32 = -32601;

    /// Invalid method parameter(s)
    pub const INVALID_PARAMS: i32 = -32602;

    /// Internal JSON-RPC error
    pub const INTERNAL_ERROR: i32 = -32603;

    // Consultation error codes

    pub const INVALID_PARTICIPANTS: i32 = -32010;
    pub const SESSION_NOT_FOUND: i32 = -32011;
    pub const SESSION_FULL: i32 = -32012;
    pub const SESSION_NOT_ACTIVE: i32 = -32013;
    pub const SESSION_ENDED: i32 = -32014;
    pub const MEDIA_ACCESS_DENIED: i32 = -32015;
    pub const MEDIA_UNAVAILABLE: i32 = -32016;
    pub const NEGOTIATION_ERROR: i32 = -32017;
    pub const NEGOTIATION_IN_PROGRESS: i32 = -32018;
    pub const NO_ACTIVE_STREAM: i32 = -32019;
    pub const RECORDING_ALREADY_ACTIVE: i32 = -32020;
    pub const PERSISTENCE_UNAVAILABLE: i32 = -32021;
}

/// Method names
pub mod methods {
    pub const SESSION_CREATE: &str = "session.create";
    pub const SESSION_JOIN: &str = "session.join";
    pub const SESSION_LEAVE: &str = "session.leave";
    pub const SESSION_END: &str = "session.end";
    pub const SESSION_GET: &str = "session.get";

    pub const SIGNAL_OFFER: &str = "signal.offer";
    pub const SIGNAL_ANSWER: &str = "signal.answer";
    pub const SIGNAL_ICE_CANDIDATE: &str = "signal.ice_candidate";
    pub const SIGNAL_CONTROL: &str = "signal.control";

    pub const CHAT_SEND: &str = "chat.send";
    pub const CHAT_HISTORY: &str = "chat.history";

    pub const MEDIA_TOGGLE: &str = "media.toggle";
    pub const MEDIA_START_SCREEN_SHARE: &str = "media.start_screen_share";
    pub const MEDIA_STOP_SCREEN_SHARE: &str = "media.stop_screen_share";
    pub const MEDIA_REPORT_FAILURE: &str = "media.report_failure";

    pub const QUALITY_REPORT: &str = "quality.report";

    pub const RECORDING_START: &str = "recording.start";
    pub const RECORDING_CHUNK: &str = "recording.chunk";
    pub const RECORDING_STOP: &str = "recording.stop";
    pub const RECORDING_LIST: &str = "recording.list";
    pub const RECORDING_DELETE: &str = "recording.delete";

    // Server notifications
    pub const NOTIFY_SIGNAL: &str = "session.signal";
    pub const NOTIFY_CHAT: &str = "chat.message";
    pub const NOTIFY_STATE: &str = "session.state";
}

/// Parameters for session.create
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateSessionParams {
    pub participant_a_id: String,
    pub participant_b_id: String,
    pub session_type: SessionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Parameters for session.join
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinParams {
    pub session_id: String,
    pub participant_id: String,
    pub role: ParticipantRole,
    /// Last chat message id the client has seen; later messages are replayed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_after: Option<MessageId>,
}

/// Parameters naming only a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRefParams {
    pub session_id: String,
}

/// Parameters for session.end
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndSessionParams {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Parameters for signal.offer and signal.answer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SdpParams {
    pub session_id: String,
    pub sdp: String,
}

/// Parameters for signal.ice_candidate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceCandidateParams {
    pub session_id: String,
    #[serde(flatten)]
    pub candidate: IceCandidate,
}

/// Parameters for signal.control
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlParams {
    pub session_id: String,
    pub directive: serde_json::Value,
}

/// Parameters for chat.send
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSendParams {
    pub session_id: String,
    pub text: String,
    /// Echo the message back to the sender (default: true)
    #[serde(default = "default_echo")]
    pub echo: bool,
}

fn default_echo() -> bool {
    true
}

/// Parameters for media.toggle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaToggleParams {
    pub session_id: String,
    pub kind: TrackKind,
    pub enabled: bool,
}

/// Parameters for media.report_failure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaFailureParams {
    pub session_id: String,
    /// `MediaAccessDenied` or `MediaUnavailable`
    pub error: String,
    #[serde(default)]
    pub message: String,
}

/// Parameters for quality.report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityReportParams {
    pub session_id: String,
    pub quality: ConnectionQuality,
}

/// Parameters for recording.chunk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingChunkParams {
    pub recording_id: String,
    /// Base64 encoded chunk bytes
    pub data: String,
    pub duration_ms: u64,
}

/// Parameters naming only a recording
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingRefParams {
    pub recording_id: String,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request
    pub fn new(method: &str, params: serde_json::Value, id: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize JSON-RPC request: {}", e))
        })
    }

    /// Parse from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize JSON-RPC request: {}",
                e
            ))
        })
    }

    /// Deserialize `params` into a typed parameter struct
    pub fn parse_params<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        serde_json::from_value(self.params.clone()).map_err(|e| {
            crate::Error::InvalidData(format!("Invalid params for {}: {}", self.method, e))
        })
    }
}

impl JsonRpcResponse {
    /// Create a new JSON-RPC response
    pub fn new(result: serde_json::Value, id: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result,
            id,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to serialize JSON-RPC response: {}",
                e
            ))
        })
    }
}

impl JsonRpcError {
    /// Create a new JSON-RPC error
    pub fn new(code: i32, message: String, id: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            error: ErrorObject {
                code,
                message,
                data: None,
            },
            id,
        }
    }

    /// Error response for a core error; `data.kind` carries the error name
    pub fn from_error(error: &crate::Error, id: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            error: ErrorObject {
                code: error.rpc_code(),
                message: error.to_string(),
                data: Some(serde_json::json!({ "kind": error.kind() })),
            },
            id,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize JSON-RPC error: {}", e))
        })
    }
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }

    /// `session.signal` or `chat.message` carrying a relayed message
    pub fn relayed(message: &SignalingMessage) -> Self {
        let method = match message.kind {
            MessageKind::Chat => methods::NOTIFY_CHAT,
            _ => methods::NOTIFY_SIGNAL,
        };
        Self::new(method, serde_json::json!({ "message": message }))
    }

    /// `session.state` carrying a session snapshot
    pub fn state(session: &Session) -> Self {
        Self::new(methods::NOTIFY_STATE, serde_json::json!({ "session": session }))
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to serialize JSON-RPC notification: {}",
                e
            ))
        })
    }
}
