//! Native peer transport over webrtc-rs
//!
//! One `TrackLocalStaticSample` is created per media kind when the first
//! local track of that kind is attached. The sample track stays bound to
//! its RTP sender for the lifetime of the connection; replacing a track
//! only switches which [`LocalTrack`] feeds it, so screen share never
//! needs a new offer.

use super::{
    IceCandidate, LocalTrack, PeerTransport, SdpType, SessionDescription, TrackKind,
    TransportState, TransportStats,
};
use crate::config::IceConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

struct SampleSender {
    track: Arc<TrackLocalStaticSample>,
    pump: Option<JoinHandle<()>>,
}

/// `PeerTransport` backed by an `RTCPeerConnection`
pub struct WebRtcPeerTransport {
    connection_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    state: Arc<Mutex<TransportState>>,
    senders: Mutex<HashMap<TrackKind, SampleSender>>,
}

impl WebRtcPeerTransport {
    /// Create a peer connection with default codecs and the configured ICE servers
    pub async fn new(ice: &IceConfig) -> Result<Self> {
        let connection_id = uuid::Uuid::new_v4().to_string();

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = ice
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(ice.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        let peer_connection = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to create peer connection: {}", e)))?,
        );

        let state = Arc::new(Mutex::new(TransportState::New));
        let state_clone = Arc::clone(&state);
        let id_clone = connection_id.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let next = match s {
                    RTCPeerConnectionState::New => Some(TransportState::New),
                    RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
                    RTCPeerConnectionState::Connected => Some(TransportState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(TransportState::Failed),
                    RTCPeerConnectionState::Closed => Some(TransportState::Closed),
                    _ => None,
                };
                if let Some(next) = next {
                    let previous = std::mem::replace(&mut *state_clone.lock(), next);
                    if previous != next {
                        debug!(connection_id = %id_clone, ?previous, ?next, "Transport state changed");
                    }
                }
                Box::pin(async {})
            },
        ));

        info!(connection_id = %connection_id, "Peer connection created");

        Ok(Self {
            connection_id,
            peer_connection,
            state,
            senders: Mutex::new(HashMap::new()),
        })
    }

    fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
        match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        }
    }

    /// Forward frames from `source` into the sample track until either ends
    fn spawn_pump(sample_track: Arc<TrackLocalStaticSample>, source: Arc<LocalTrack>) -> JoinHandle<()> {
        let mut frames = source.subscribe_frames();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = source.ended() => break,
                    frame = frames.recv() => match frame {
                        Ok(chunk) => {
                            let sample = Sample {
                                data: chunk.data,
                                duration: chunk.duration,
                                ..Default::default()
                            };
                            if let Err(e) = sample_track.write_sample(&sample).await {
                                warn!(track_id = %source.id(), error = %e, "Failed to write sample");
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(track_id = %source.id(), skipped, "Sample pump lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    async fn local_description(&self, sdp_type: SdpType) -> Result<SessionDescription> {
        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::NegotiationError("no local description".to_string()))?;
        Ok(SessionDescription {
            sdp_type,
            sdp: local.sdp,
        })
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    async fn attach_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        let kind = track.kind();
        let existing = self
            .senders
            .lock()
            .get(&kind)
            .map(|sender| sender.track.clone());

        let sample_track = match existing {
            Some(sample_track) => sample_track,
            None => {
                let sample_track = Arc::new(TrackLocalStaticSample::new(
                    Self::codec_for(kind),
                    format!("{}-{}", kind, self.connection_id),
                    format!("stream-{}", self.connection_id),
                ));
                self.peer_connection
                    .add_track(sample_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(|e| Error::WebRtcError(format!("Failed to add {} track: {}", kind, e)))?;
                sample_track
            }
        };

        let pump = Self::spawn_pump(sample_track.clone(), track);
        let previous = self.senders.lock().insert(
            kind,
            SampleSender {
                track: sample_track,
                pump: Some(pump),
            },
        );
        if let Some(handle) = previous.and_then(|s| s.pump) {
            handle.abort();
        }
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: Option<Arc<LocalTrack>>) -> Result<()> {
        let mut senders = self.senders.lock();
        let sender = senders
            .get_mut(&kind)
            .ok_or_else(|| Error::WebRtcError(format!("no {} sender to replace", kind)))?;

        if let Some(pump) = sender.pump.take() {
            pump.abort();
        }
        sender.pump = track.map(|source| Self::spawn_pump(sender.track.clone(), source));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::NegotiationError(format!("Failed to create offer: {}", e)))?;
        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::NegotiationError(format!("Failed to set local description: {}", e)))?;
        self.local_description(SdpType::Offer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::NegotiationError(format!("Failed to create answer: {}", e)))?;
        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::NegotiationError(format!("Failed to set local description: {}", e)))?;
        self.local_description(SdpType::Answer).await
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| Error::NegotiationError(format!("Failed to parse SDP: {}", e)))?;

        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::NegotiationError(format!("Failed to set remote description: {}", e)))
    }

    async fn rollback(&self) -> Result<()> {
        let local = match self.peer_connection.signaling_state() {
            RTCSignalingState::HaveLocalOffer => true,
            RTCSignalingState::HaveRemoteOffer => false,
            _ => return Ok(()),
        };
        let pending = if local {
            self.peer_connection.pending_local_description().await
        } else {
            self.peer_connection.pending_remote_description().await
        };

        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        rollback.sdp = pending.map(|d| d.sdp).unwrap_or_default();

        let result = if local {
            self.peer_connection.set_local_description(rollback).await
        } else {
            self.peer_connection.set_remote_description(rollback).await
        };
        result.map_err(|e| Error::NegotiationError(format!("Failed to roll back offer: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::NegotiationError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn stats(&self) -> Result<TransportStats> {
        let report = self.peer_connection.get_stats().await;
        let mut stats = TransportStats::default();

        for stat in report.reports.values() {
            match stat {
                StatsReportType::OutboundRTP(rtp) => {
                    stats.packets_sent += rtp.packets_sent;
                    stats.bytes_sent += rtp.bytes_sent;
                }
                StatsReportType::InboundRTP(rtp) => {
                    stats.packets_received += rtp.packets_received;
                    stats.bytes_received += rtp.bytes_received;
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    stats.packets_lost += remote.packets_lost.max(0) as u64;
                }
                _ => {}
            }
        }

        Ok(stats)
    }

    fn state(&self) -> TransportState {
        *self.state.lock()
    }

    async fn close(&self) -> Result<()> {
        let pumps: Vec<JoinHandle<()>> = self
            .senders
            .lock()
            .values_mut()
            .filter_map(|s| s.pump.take())
            .collect();
        for pump in pumps {
            pump.abort();
        }

        info!(connection_id = %self.connection_id, "Closing peer connection");
        *self.state.lock() = TransportState::Closed;
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close connection: {}", e)))
    }
}
