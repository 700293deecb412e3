//! Headless loopback media backend
//!
//! `VirtualDevices` hands out synthetic tracks and `VirtualTransport`
//! records what was attached and negotiated. Used by the server when no
//! native backend is compiled in, and by tests to drive permission
//! denial, missing devices and transport failure.

use super::{
    IceCandidate, LocalTrack, MediaConstraints, MediaDevices, PeerTransport, SdpType,
    SessionDescription, TrackKind, TrackSource, TransportState, TransportStats,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Simulated platform permission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
}

/// Synthetic camera, microphone and display
#[derive(Debug)]
pub struct VirtualDevices {
    permission: Mutex<Permission>,
    has_camera: bool,
    has_microphone: bool,
    has_display: bool,
    consent_delay: Duration,
}

impl Default for VirtualDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualDevices {
    /// All devices present, permission granted
    pub fn new() -> Self {
        Self {
            permission: Mutex::new(Permission::Granted),
            has_camera: true,
            has_microphone: true,
            has_display: true,
            consent_delay: Duration::ZERO,
        }
    }

    pub fn with_permission(self, permission: Permission) -> Self {
        *self.permission.lock() = permission;
        self
    }

    pub fn without_camera(mut self) -> Self {
        self.has_camera = false;
        self
    }

    pub fn without_display(mut self) -> Self {
        self.has_display = false;
        self
    }

    /// Time each request waits on the simulated consent prompt
    pub fn with_consent_delay(mut self, delay: Duration) -> Self {
        self.consent_delay = delay;
        self
    }

    async fn await_consent(&self) {
        if !self.consent_delay.is_zero() {
            tokio::time::sleep(self.consent_delay).await;
        }
    }

    /// Change the permission answer for later requests
    pub fn set_permission(&self, permission: Permission) {
        *self.permission.lock() = permission;
    }

    fn check_permission(&self, what: &str) -> Result<()> {
        match *self.permission.lock() {
            Permission::Granted => Ok(()),
            Permission::Denied => Err(Error::MediaAccessDenied(format!(
                "{} permission denied",
                what
            ))),
        }
    }
}

#[async_trait]
impl MediaDevices for VirtualDevices {
    async fn open_user_media(&self, constraints: &MediaConstraints) -> Result<Vec<Arc<LocalTrack>>> {
        if !constraints.audio && !constraints.video {
            return Err(Error::MediaUnavailable(
                "constraints request neither audio nor video".to_string(),
            ));
        }
        self.await_consent().await;
        self.check_permission("camera/microphone")?;

        if constraints.video && !self.has_camera {
            return Err(Error::MediaUnavailable("no camera found".to_string()));
        }
        if constraints.audio && !self.has_microphone {
            return Err(Error::MediaUnavailable("no microphone found".to_string()));
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(
                TrackKind::Audio,
                TrackSource::Microphone,
                "virtual-microphone",
            ));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(
                TrackKind::Video,
                TrackSource::Camera,
                "virtual-camera",
            ));
        }
        Ok(tracks)
    }

    async fn open_display_media(&self) -> Result<Arc<LocalTrack>> {
        self.await_consent().await;
        self.check_permission("screen capture")?;
        if !self.has_display {
            return Err(Error::MediaUnavailable("no display to capture".to_string()));
        }
        Ok(LocalTrack::new(
            TrackKind::Video,
            TrackSource::Screen,
            "virtual-display",
        ))
    }
}

/// Loopback peer transport
///
/// SDP is synthesized from the attached senders. State and counters are
/// set from the outside with [`VirtualTransport::set_state`] and
/// [`VirtualTransport::set_stats`].
#[derive(Debug)]
pub struct VirtualTransport {
    state: Mutex<TransportState>,
    senders: Mutex<HashMap<TrackKind, Option<Arc<LocalTrack>>>>,
    stats: Mutex<TransportStats>,
    remote_description: Mutex<Option<SessionDescription>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    version: AtomicU64,
    rollbacks: AtomicU64,
}

impl Default for VirtualTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TransportState::New),
            senders: Mutex::new(HashMap::new()),
            stats: Mutex::new(TransportStats::default()),
            remote_description: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            version: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        }
    }

    pub fn set_state(&self, state: TransportState) {
        *self.state.lock() = state;
    }

    pub fn set_stats(&self, stats: TransportStats) {
        *self.stats.lock() = stats;
    }

    /// Track currently feeding the sender of `kind`
    pub fn sender_track(&self, kind: TrackKind) -> Option<Arc<LocalTrack>> {
        self.senders.lock().get(&kind).cloned().flatten()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().clone()
    }

    /// Number of pending offers discarded so far
    pub fn rollback_count(&self) -> u64 {
        self.rollbacks.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        let state = *self.state.lock();
        if state.is_terminal() {
            return Err(Error::WebRtcError(format!("transport is {:?}", state)));
        }
        Ok(())
    }

    fn synthesize(&self, sdp_type: SdpType) -> SessionDescription {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let mut sdp = format!("v=0\r\no=- 0 {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n", version);

        let senders = self.senders.lock();
        for kind in [TrackKind::Audio, TrackKind::Video] {
            if let Some(slot) = senders.get(&kind) {
                let direction = if slot.is_some() { "sendrecv" } else { "recvonly" };
                sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 0\r\na={}\r\n", kind, direction));
            }
        }

        SessionDescription { sdp_type, sdp }
    }
}

#[async_trait]
impl PeerTransport for VirtualTransport {
    async fn attach_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        self.ensure_open()?;
        self.senders.lock().insert(track.kind(), Some(track));
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: Option<Arc<LocalTrack>>) -> Result<()> {
        self.ensure_open()?;
        let mut senders = self.senders.lock();
        match senders.get_mut(&kind) {
            Some(slot) => {
                *slot = track;
                Ok(())
            }
            None => Err(Error::WebRtcError(format!("no {} sender to replace", kind))),
        }
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        self.set_state(TransportState::Connecting);
        Ok(self.synthesize(SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        Ok(self.synthesize(SdpType::Answer))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        if description.sdp_type == SdpType::Answer {
            self.set_state(TransportState::Connected);
        }
        *self.remote_description.lock() = Some(description);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
        Ok(*self.stats.lock())
    }

    fn state(&self) -> TransportState {
        *self.state.lock()
    }

    async fn close(&self) -> Result<()> {
        self.set_state(TransportState::Closed);
        Ok(())
    }
}
