//! Local media tracks and streams

use super::{MediaChunk, TrackKind};
use crate::recording::{ChunkFeed, RecordableStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

const FRAME_BUFFER: usize = 64;
const CHUNK_BUFFER: usize = 256;

/// Where a track's media comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

/// One outgoing audio or video track
///
/// A disabled track still exists on the transport but carries no frames.
/// Once ended (by the platform or by [`LocalTrack::stop`]) it never
/// becomes live again.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    label: String,
    enabled: AtomicBool,
    ended_tx: watch::Sender<bool>,
    frames: broadcast::Sender<MediaChunk>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, source: TrackSource, label: impl Into<String>) -> Arc<Self> {
        let (ended_tx, _) = watch::channel(false);
        let (frames, _) = broadcast::channel(FRAME_BUFFER);
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            kind,
            source,
            label: label.into(),
            enabled: AtomicBool::new(true),
            ended_tx,
            frames,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Returns the previous value
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::SeqCst)
    }

    pub fn is_live(&self) -> bool {
        !*self.ended_tx.borrow()
    }

    /// End the track; idempotent
    pub fn stop(&self) {
        self.ended_tx.send_replace(true);
    }

    /// Resolves once the track has ended
    pub async fn ended(&self) {
        let mut rx = self.ended_tx.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    /// Feed a captured frame to the transport senders
    ///
    /// Frames are discarded while the track is disabled or ended.
    pub fn push_frame(&self, chunk: MediaChunk) -> bool {
        if !self.is_live() || !self.is_enabled() {
            return false;
        }
        self.frames.send(chunk).is_ok()
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<MediaChunk> {
        self.frames.subscribe()
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Handle to a participant's captured camera/microphone stream
///
/// Besides the individual tracks, the handle carries the muxed chunk feed
/// that recordings subscribe to.
pub struct LocalStreamHandle {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
    chunks: broadcast::Sender<MediaChunk>,
}

impl LocalStreamHandle {
    pub fn new(tracks: Vec<Arc<LocalTrack>>) -> Self {
        let (chunks, _) = broadcast::channel(CHUNK_BUFFER);
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
            chunks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    /// First track of `kind`, if captured
    pub fn track(&self, kind: TrackKind) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// Publish a muxed chunk to recording subscribers
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, chunk: MediaChunk) -> usize {
        if !self.has_live_tracks() {
            return 0;
        }
        self.chunks.send(chunk).unwrap_or(0)
    }

    /// End every track of the stream
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl RecordableStream for LocalStreamHandle {
    fn stream_id(&self) -> &str {
        &self.id
    }

    fn has_live_tracks(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }

    fn subscribe(&self) -> ChunkFeed {
        ChunkFeed::Live(self.chunks.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_disabled_track_drops_frames() {
        let track = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        let mut rx = track.subscribe_frames();

        assert!(track.set_enabled(false));
        assert!(!track.push_frame(MediaChunk::new(vec![1u8], Duration::from_millis(20))));
        assert!(rx.try_recv().is_err());

        track.set_enabled(true);
        assert!(track.push_frame(MediaChunk::new(vec![2u8], Duration::from_millis(20))));
        assert_eq!(rx.try_recv().unwrap().data.as_ref(), &[2u8]);
    }

    #[tokio::test]
    async fn test_stop_resolves_ended() {
        let track = LocalTrack::new(TrackKind::Video, TrackSource::Screen, "screen");
        assert!(track.is_live());

        let waiter = {
            let track = track.clone();
            tokio::spawn(async move { track.ended().await })
        };
        track.stop();
        track.stop();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!track.is_live());
    }

    #[test]
    fn test_stream_without_live_tracks_publishes_nothing() {
        let audio = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        let stream = LocalStreamHandle::new(vec![audio]);
        let _rx = stream.subscribe();

        assert_eq!(stream.publish(MediaChunk::new(vec![0u8; 4], Duration::from_millis(10))), 1);
        stream.stop();
        assert!(!stream.has_live_tracks());
        assert_eq!(stream.publish(MediaChunk::new(vec![0u8; 4], Duration::from_millis(10))), 0);
    }
}
