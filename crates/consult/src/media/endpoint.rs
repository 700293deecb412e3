//! Per-participant media endpoint
//!
//! Owns local capture, track toggling, screen share substitution and the
//! offer/answer state of one [`PeerTransport`]. Capability failures are
//! surfaced unchanged and never retried here.

use super::{
    IceCandidate, LocalStreamHandle, LocalTrack, MediaConstraints, MediaDevices, PeerTransport,
    SdpType, SessionDescription, TrackKind,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a screen share stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCause {
    /// `stop_screen_share` was called
    Requested,
    /// The platform ended the capture (e.g. "stop sharing" in the OS UI)
    PlatformEnded,
}

/// Events emitted by a [`MediaEndpoint`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    TrackToggled { kind: TrackKind, enabled: bool },
    ScreenShareStarted { share_id: String },
    ScreenShareStopped { share_id: String, cause: StopCause },
    /// Outgoing video is back on the camera track (`None` if no camera was captured)
    CameraRestored { track_id: Option<String> },
}

/// An active screen share
#[derive(Debug, Clone)]
pub struct ScreenShareHandle {
    share_id: String,
    track: Arc<LocalTrack>,
}

impl ScreenShareHandle {
    pub fn share_id(&self) -> &str {
        &self.share_id
    }

    pub fn track(&self) -> &Arc<LocalTrack> {
        &self.track
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

struct EndpointState {
    stream: Option<Arc<LocalStreamHandle>>,
    screen: Option<ScreenShareHandle>,
    negotiation: NegotiationState,
}

/// Media endpoint for one participant
pub struct MediaEndpoint {
    endpoint_id: String,
    devices: Arc<dyn MediaDevices>,
    transport: Arc<dyn PeerTransport>,
    state: Mutex<EndpointState>,
    /// Serializes capture and screen share changes across their awaits
    media_ops: tokio::sync::Mutex<()>,
    events: broadcast::Sender<EndpointEvent>,
}

impl MediaEndpoint {
    pub fn new(devices: Arc<dyn MediaDevices>, transport: Arc<dyn PeerTransport>) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            endpoint_id: Uuid::new_v4().to_string(),
            devices,
            transport,
            state: Mutex::new(EndpointState {
                stream: None,
                screen: None,
                negotiation: NegotiationState::Stable,
            }),
            media_ops: tokio::sync::Mutex::new(()),
            events,
        })
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.events.subscribe()
    }

    /// Currently captured stream, if any
    pub fn local_stream(&self) -> Option<Arc<LocalStreamHandle>> {
        self.state.lock().stream.clone()
    }

    pub fn active_screen_share(&self) -> Option<ScreenShareHandle> {
        self.state.lock().screen.clone()
    }

    /// Acquire camera/microphone and attach the tracks to the transport
    ///
    /// # Errors
    ///
    /// `MediaAccessDenied` or `MediaUnavailable` from the device layer; no
    /// tracks are attached in that case. Concurrent callers share one capture.
    pub async fn start_local_capture(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<LocalStreamHandle>> {
        let _ops = self.media_ops.lock().await;
        if let Some(existing) = self.local_stream() {
            return Ok(existing);
        }

        let tracks = self.devices.open_user_media(constraints).await?;
        if tracks.is_empty() {
            return Err(Error::MediaUnavailable(
                "no tracks match the requested constraints".to_string(),
            ));
        }

        for track in &tracks {
            if let Err(e) = self.transport.attach_track(track.clone()).await {
                for track in &tracks {
                    track.stop();
                }
                return Err(e);
            }
        }

        let stream = Arc::new(LocalStreamHandle::new(tracks));
        info!(
            endpoint_id = %self.endpoint_id,
            stream_id = %stream.id(),
            tracks = stream.tracks().len(),
            "Local capture started"
        );

        let mut state = self.state.lock();
        Ok(state.stream.get_or_insert(stream).clone())
    }

    /// Enable or disable the captured track of `kind`
    ///
    /// A disabled track stays attached but carries no media.
    pub fn toggle_track(
        &self,
        stream: &LocalStreamHandle,
        kind: TrackKind,
        enabled: bool,
    ) -> Result<()> {
        let track = stream.track(kind).ok_or_else(|| {
            Error::MediaUnavailable(format!("stream {} has no {} track", stream.id(), kind))
        })?;

        if track.set_enabled(enabled) != enabled {
            debug!(endpoint_id = %self.endpoint_id, %kind, enabled, "Track toggled");
            let _ = self.events.send(EndpointEvent::TrackToggled { kind, enabled });
        }
        Ok(())
    }

    /// Replace outgoing camera video with a screen capture track
    ///
    /// Returns the existing share if one is already running. When the
    /// platform ends the capture, the camera track is restored
    /// automatically and `CameraRestored` is emitted.
    pub async fn start_screen_share(self: &Arc<Self>) -> Result<ScreenShareHandle> {
        let _ops = self.media_ops.lock().await;
        if let Some(existing) = self.active_screen_share() {
            return Ok(existing);
        }

        let track = self.devices.open_display_media().await?;
        if let Err(e) = self
            .transport
            .replace_track(TrackKind::Video, Some(track.clone()))
            .await
        {
            track.stop();
            return Err(e);
        }

        let handle = ScreenShareHandle {
            share_id: Uuid::new_v4().to_string(),
            track: track.clone(),
        };
        self.state.lock().screen = Some(handle.clone());

        info!(endpoint_id = %self.endpoint_id, share_id = %handle.share_id, "Screen share started");
        let _ = self.events.send(EndpointEvent::ScreenShareStarted {
            share_id: handle.share_id.clone(),
        });

        let endpoint = Arc::downgrade(self);
        let share_id = handle.share_id.clone();
        tokio::spawn(async move {
            track.ended().await;
            if let Some(endpoint) = endpoint.upgrade() {
                if let Err(e) = endpoint
                    .finish_screen_share(&share_id, StopCause::PlatformEnded)
                    .await
                {
                    warn!(share_id = %share_id, error = %e, "Failed to restore camera after screen share ended");
                }
            }
        });

        Ok(handle)
    }

    /// Stop sharing and put the camera track back; no-op if the share already ended
    pub async fn stop_screen_share(&self, handle: &ScreenShareHandle) -> Result<()> {
        self.finish_screen_share(&handle.share_id, StopCause::Requested)
            .await
    }

    async fn finish_screen_share(&self, share_id: &str, cause: StopCause) -> Result<()> {
        let _ops = self.media_ops.lock().await;
        let (share, camera) = {
            let mut state = self.state.lock();
            match state.screen.as_ref() {
                Some(active) if active.share_id == share_id => {}
                _ => return Ok(()),
            }
            let camera = state
                .stream
                .as_ref()
                .and_then(|s| s.track(TrackKind::Video).cloned());
            (state.screen.take(), camera)
        };

        if let Some(share) = share {
            share.track.stop();
            let _ = self.events.send(EndpointEvent::ScreenShareStopped {
                share_id: share.share_id.clone(),
                cause,
            });
        }

        self.transport
            .replace_track(TrackKind::Video, camera.clone())
            .await?;

        info!(endpoint_id = %self.endpoint_id, share_id = %share_id, ?cause, "Camera restored");
        let _ = self.events.send(EndpointEvent::CameraRestored {
            track_id: camera.map(|t| t.id().to_string()),
        });
        Ok(())
    }

    fn ensure_negotiable(&self) -> Result<()> {
        if self.state.lock().stream.is_none() {
            return Err(Error::NegotiationError(
                "local capture has not started".to_string(),
            ));
        }
        let transport_state = self.transport.state();
        if transport_state.is_terminal() {
            return Err(Error::NegotiationError(format!(
                "transport is {:?}",
                transport_state
            )));
        }
        Ok(())
    }

    /// Create a local offer
    ///
    /// # Errors
    ///
    /// `NegotiationInProgress` while a previous offer/answer exchange has
    /// not completed, `NegotiationError` before capture or after transport
    /// failure.
    pub async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_negotiable()?;
        {
            let mut state = self.state.lock();
            if state.negotiation != NegotiationState::Stable {
                return Err(Error::NegotiationInProgress(format!(
                    "endpoint {} is in {:?}",
                    self.endpoint_id, state.negotiation
                )));
            }
            state.negotiation = NegotiationState::HaveLocalOffer;
        }

        match self.transport.create_offer().await {
            Ok(offer) => Ok(offer),
            Err(e) => {
                self.state.lock().negotiation = NegotiationState::Stable;
                Err(Error::NegotiationError(e.to_string()))
            }
        }
    }

    /// Abandon a pending offer/answer exchange
    ///
    /// Used when the peer's answer was lost or the peer reconnected. Rolls
    /// the transport back to stable so a fresh offer can be created.
    /// Returns `false` if nothing was pending.
    pub async fn restart_negotiation(&self) -> Result<bool> {
        let pending = self.state.lock().negotiation;
        if pending == NegotiationState::Stable {
            return Ok(false);
        }

        self.transport
            .rollback()
            .await
            .map_err(|e| Error::NegotiationError(e.to_string()))?;
        self.state.lock().negotiation = NegotiationState::Stable;
        info!(endpoint_id = %self.endpoint_id, abandoned = ?pending, "Negotiation restarted");
        Ok(true)
    }

    /// Create an answer to the applied remote offer
    pub async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_negotiable()?;
        if self.state.lock().negotiation != NegotiationState::HaveRemoteOffer {
            return Err(Error::NegotiationError(
                "no remote offer to answer".to_string(),
            ));
        }

        let answer = self
            .transport
            .create_answer()
            .await
            .map_err(|e| Error::NegotiationError(e.to_string()))?;
        self.state.lock().negotiation = NegotiationState::Stable;
        Ok(answer)
    }

    /// Apply an offer or answer received through signaling
    ///
    /// A remote offer arriving while a local offer is pending wins: the
    /// local offer is rolled back first.
    pub async fn apply_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_negotiable()?;
        let next = {
            let state = self.state.lock();
            match (description.sdp_type, state.negotiation) {
                (SdpType::Offer, _) => NegotiationState::HaveRemoteOffer,
                (SdpType::Answer, NegotiationState::HaveLocalOffer) => NegotiationState::Stable,
                (SdpType::Answer, current) => {
                    return Err(Error::NegotiationError(format!(
                        "unexpected answer in {:?}",
                        current
                    )))
                }
            }
        };

        if description.sdp_type == SdpType::Offer && self.restart_negotiation().await? {
            debug!(endpoint_id = %self.endpoint_id, "Pending local offer replaced by remote offer");
        }

        self.transport
            .set_remote_description(description)
            .await
            .map_err(|e| Error::NegotiationError(e.to_string()))?;
        self.state.lock().negotiation = next;
        Ok(())
    }

    pub async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_negotiable()?;
        self.transport
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| Error::NegotiationError(e.to_string()))
    }

    /// Stop all local tracks and close the transport
    pub async fn close(&self) -> Result<()> {
        let (stream, screen) = {
            let mut state = self.state.lock();
            (state.stream.take(), state.screen.take())
        };
        if let Some(share) = screen {
            share.track.stop();
        }
        if let Some(stream) = stream {
            stream.stop();
        }
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Permission, TransportState, VirtualDevices, VirtualTransport};
    use std::time::Duration;

    fn endpoint() -> (Arc<MediaEndpoint>, Arc<VirtualTransport>) {
        let transport = Arc::new(VirtualTransport::new());
        let endpoint = MediaEndpoint::new(Arc::new(VirtualDevices::new()), transport.clone());
        (endpoint, transport)
    }

    #[tokio::test]
    async fn test_offer_before_capture_rejected() {
        let (endpoint, _) = endpoint();
        let result = endpoint.create_offer().await;
        assert!(matches!(result, Err(Error::NegotiationError(_))));
    }

    #[tokio::test]
    async fn test_denied_permission_surfaces_unchanged() {
        let transport = Arc::new(VirtualTransport::new());
        let devices = VirtualDevices::new().with_permission(Permission::Denied);
        let endpoint = MediaEndpoint::new(Arc::new(devices), transport.clone());

        let result = endpoint
            .start_local_capture(&MediaConstraints::audio_video())
            .await;
        assert!(matches!(result, Err(Error::MediaAccessDenied(_))));
        assert!(transport.sender_track(TrackKind::Video).is_none());
    }

    #[tokio::test]
    async fn test_capture_succeeds_after_permission_granted() {
        let transport = Arc::new(VirtualTransport::new());
        let devices = Arc::new(VirtualDevices::new().with_permission(Permission::Denied));
        let endpoint = MediaEndpoint::new(devices.clone(), transport.clone());

        assert!(endpoint
            .start_local_capture(&MediaConstraints::audio_video())
            .await
            .is_err());

        devices.set_permission(Permission::Granted);
        endpoint
            .start_local_capture(&MediaConstraints::audio_video())
            .await
            .unwrap();
        assert!(transport.sender_track(TrackKind::Video).is_some());
    }

    #[tokio::test]
    async fn test_screen_share_without_display() {
        let transport = Arc::new(VirtualTransport::new());
        let devices = VirtualDevices::new().without_display();
        let endpoint = MediaEndpoint::new(Arc::new(devices), transport);
        endpoint
            .start_local_capture(&MediaConstraints::audio_video())
            .await
            .unwrap();

        let result = endpoint.start_screen_share().await;
        assert!(matches!(result, Err(Error::MediaUnavailable(_))));
        assert!(endpoint.active_screen_share().is_none());
    }

    #[tokio::test]
    async fn test_second_offer_while_pending() {
        let (endpoint, _) = endpoint();
        endpoint
            .start_local_capture(&MediaConstraints::audio_video())
            .await
            .unwrap();

        endpoint.create_offer().await.unwrap();
        let second = endpoint.create_offer().await;
        assert!(matches!(second, Err(Error::NegotiationInProgress(_))));

        endpoint
            .apply_remote_description(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert!(endpoint.create_offer().await.is_ok());
    }

    #[tokio::test]
    async fn test_restart_after_lost_answer() {
        let (endpoint, transport) = endpoint();
        endpoint
            .start_local_capture(&MediaConstraints::audio_video())
            .await
            .unwrap();

        assert!(!endpoint.restart_negotiation().await.unwrap());
        endpoint.create_offer().await.unwrap();
        // the answer never arrives
        assert!(matches!(
            endpoint.create_offer().await,
            Err(Error::NegotiationInProgress(_))
        ));

        assert!(endpoint.restart_negotiation().await.unwrap());
        assert_eq!(transport.rollback_count(), 1);
        let offer = endpoint.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        endpoint
            .apply_remote_description(SessionDescription::answer("v=0"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_remote_offer_replaces_pending_local_offer() {
        let (endpoint, transport) = endpoint();
        endpoint
            .start_local_capture(&MediaConstraints::audio_video())
            .await
            .unwrap();

        endpoint.create_offer().await.unwrap();
        endpoint
            .apply_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert_eq!(transport.rollback_count(), 1);

        let answer = endpoint.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        assert!(endpoint.create_offer().await.is_ok());
    }

    #[tokio::test]
    async fn test_answer_flow() {
        let (endpoint, _) = endpoint();
        endpoint
            .start_local_capture(&MediaConstraints::audio_only())
            .await
            .unwrap();

        assert!(matches!(
            endpoint.create_answer().await,
            Err(Error::NegotiationError(_))
        ));
        endpoint
            .apply_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        let answer = endpoint.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
    }

    #[tokio::test]
    async fn test_failed_transport_rejects_negotiation() {
        let (endpoint, transport) = endpoint();
        endpoint
            .start_local_capture(&MediaConstraints::audio_video())
            .await
            .unwrap();
        transport.set_state(TransportState::Failed);

        let result = endpoint
            .add_remote_ice_candidate(IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            })
            .await;
        assert!(matches!(result, Err(Error::NegotiationError(_))));
    }

    #[tokio::test]
    async fn test_toggle_keeps_track_attached() {
        let (endpoint, transport) = endpoint();
        let stream = endpoint
            .start_local_capture(&MediaConstraints::audio_video())
            .await
            .unwrap();

        endpoint
            .toggle_track(&stream, TrackKind::Audio, false)
            .unwrap();
        let sender = transport.sender_track(TrackKind::Audio).unwrap();
        assert!(!sender.is_enabled());
        assert!(sender.is_live());
    }

    #[tokio::test]
    async fn test_platform_end_restores_camera() {
        let (endpoint, transport) = endpoint();
        let stream = endpoint
            .start_local_capture(&MediaConstraints::audio_video())
            .await
            .unwrap();
        let camera_id = stream.track(TrackKind::Video).unwrap().id().to_string();
        let mut events = endpoint.subscribe();

        let share = endpoint.start_screen_share().await.unwrap();
        assert_eq!(
            transport.sender_track(TrackKind::Video).unwrap().id(),
            share.track().id()
        );

        share.track().stop();

        let restored = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(EndpointEvent::CameraRestored { track_id }) = events.recv().await {
                    return track_id;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(restored.as_deref(), Some(camera_id.as_str()));
        assert_eq!(
            transport.sender_track(TrackKind::Video).unwrap().id(),
            camera_id
        );
        assert!(endpoint.active_screen_share().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_capture_shares_one_stream() {
        let transport = Arc::new(VirtualTransport::new());
        let devices = VirtualDevices::new().with_consent_delay(Duration::from_millis(20));
        let endpoint = MediaEndpoint::new(Arc::new(devices), transport.clone());
        let constraints = MediaConstraints::audio_video();

        let (a, b) = tokio::join!(
            endpoint.start_local_capture(&constraints),
            endpoint.start_local_capture(&constraints)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.id(), b.id());
        assert_eq!(
            transport.sender_track(TrackKind::Video).unwrap().id(),
            a.track(TrackKind::Video).unwrap().id()
        );
        assert!(a.track(TrackKind::Video).unwrap().is_live());
    }

    #[tokio::test]
    async fn test_concurrent_screen_share_starts_once() {
        let transport = Arc::new(VirtualTransport::new());
        let devices = VirtualDevices::new().with_consent_delay(Duration::from_millis(20));
        let endpoint = MediaEndpoint::new(Arc::new(devices), transport.clone());
        endpoint
            .start_local_capture(&MediaConstraints::audio_video())
            .await
            .unwrap();
        let mut events = endpoint.subscribe();

        let (a, b) = tokio::join!(endpoint.start_screen_share(), endpoint.start_screen_share());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.share_id(), b.share_id());
        assert_eq!(a.track().id(), b.track().id());
        assert_eq!(
            transport.sender_track(TrackKind::Video).unwrap().id(),
            a.track().id()
        );

        let mut started = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EndpointEvent::ScreenShareStarted { .. }) {
                started += 1;
            }
        }
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn test_explicit_stop_is_idempotent() {
        let (endpoint, _) = endpoint();
        endpoint
            .start_local_capture(&MediaConstraints::audio_video())
            .await
            .unwrap();

        let share = endpoint.start_screen_share().await.unwrap();
        endpoint.stop_screen_share(&share).await.unwrap();
        endpoint.stop_screen_share(&share).await.unwrap();
        assert!(!share.track().is_live());
    }
}
