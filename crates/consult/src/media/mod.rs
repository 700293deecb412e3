//! Media endpoint adapter
//!
//! Capability interfaces for local capture ([`MediaDevices`]) and the peer
//! transport ([`PeerTransport`]), plus [`MediaEndpoint`], which owns the
//! local tracks of one participant and serializes negotiation on top of
//! those capabilities.
//!
//! Backends:
//! - [`virtual_device`]: headless loopback devices and transport
//! - `webrtc` (cargo feature): `RTCPeerConnection` from webrtc-rs

pub mod endpoint;
pub mod track;
pub mod virtual_device;

#[cfg(feature = "webrtc")]
pub mod webrtc;

pub use endpoint::{EndpointEvent, MediaEndpoint, ScreenShareHandle, StopCause};
pub use track::{LocalStreamHandle, LocalTrack, TrackSource};
pub use virtual_device::{Permission, VirtualDevices, VirtualTransport};

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Requested local capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture microphone audio
    pub audio: bool,
    /// Capture camera video
    pub video: bool,
    /// Preferred device, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl MediaConstraints {
    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
            device_id: None,
        }
    }

    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
            device_id: None,
        }
    }
}

/// Encoded media unit produced by a capture source
#[derive(Debug, Clone)]
pub struct MediaChunk {
    pub data: Bytes,
    pub duration: Duration,
}

impl MediaChunk {
    pub fn new(data: impl Into<Bytes>, duration: Duration) -> Self {
        Self {
            data: data.into(),
            duration,
        }
    }
}

/// Peer transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// No further negotiation is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }
}

/// Cumulative transport counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description exchanged through signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate exchanged through signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Platform capture devices (camera, microphone, display)
///
/// Opening devices may block on user consent for an unbounded time;
/// callers apply their own timeout.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open camera and/or microphone tracks
    ///
    /// # Errors
    ///
    /// `MediaAccessDenied` when permission is refused, `MediaUnavailable`
    /// when no device matches the constraints.
    async fn open_user_media(&self, constraints: &MediaConstraints) -> Result<Vec<Arc<LocalTrack>>>;

    /// Open a screen capture video track
    async fn open_display_media(&self) -> Result<Arc<LocalTrack>>;
}

/// Peer media transport (one per endpoint)
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Add an outgoing sender for the track's kind
    async fn attach_track(&self, track: Arc<LocalTrack>) -> Result<()>;

    /// Swap the track feeding the sender of `kind` without renegotiation
    async fn replace_track(&self, kind: TrackKind, track: Option<Arc<LocalTrack>>) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Discard a pending local or remote offer and return to stable
    async fn rollback(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Current cumulative counters
    async fn stats(&self) -> Result<TransportStats>;

    fn state(&self) -> TransportState;

    async fn close(&self) -> Result<()>;
}
