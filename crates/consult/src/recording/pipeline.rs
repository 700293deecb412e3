//! Recording pipeline
//!
//! Each recording is a capture task writing chunks to
//! `{directory}/{recording_id}.rec`. Finalization goes through a
//! `OnceCell`, so explicit stop, session end and shutdown all observe the
//! same single finalized [`Recording`]. Once the finalized record is in
//! the store the in-memory entry is dropped and later lookups go to the
//! store.

use super::{ChunkFeed, FeedEvent, RecordableStream, Recording, RecordingId};
use crate::media::MediaChunk;
use crate::session::{ParticipantRole, SessionId};
use crate::store::{run_blocking, ConsultStore};
use crate::{Error, Result};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy)]
struct CaptureStats {
    bytes: u64,
    duration: Duration,
    chunks: u64,
}

struct ActiveRecording {
    pending: Recording,
    stream_id: String,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<CaptureStats>>>,
    finalized: OnceCell<Recording>,
    persisted: AtomicBool,
}

/// Captures streams to storage and tracks recordings per session
pub struct RecordingPipeline {
    directory: PathBuf,
    store: Arc<dyn ConsultStore>,
    recordings: DashMap<RecordingId, Arc<ActiveRecording>>,
    active_streams: DashMap<String, RecordingId>,
}

impl RecordingPipeline {
    pub fn new(directory: impl Into<PathBuf>, store: Arc<dyn ConsultStore>) -> Self {
        Self {
            directory: directory.into(),
            store,
            recordings: DashMap::new(),
            active_streams: DashMap::new(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Begin capturing `stream`
    ///
    /// # Errors
    ///
    /// - `NoActiveStream` if the stream has no live tracks
    /// - `RecordingAlreadyActive` if this stream is already being recorded
    /// - `IoError` if the output file cannot be created
    pub async fn start_recording(
        &self,
        session_id: &str,
        owner_role: ParticipantRole,
        stream: Arc<dyn RecordableStream>,
    ) -> Result<Recording> {
        if !stream.has_live_tracks() {
            return Err(Error::NoActiveStream(format!(
                "stream {} has no live tracks",
                stream.stream_id()
            )));
        }

        let recording_id = Uuid::new_v4().to_string();
        let stream_id = stream.stream_id().to_string();
        match self.active_streams.entry(stream_id.clone()) {
            Entry::Occupied(existing) => {
                return Err(Error::RecordingAlreadyActive(format!(
                    "stream {} is recorded by {}",
                    stream_id,
                    existing.get()
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(recording_id.clone());
            }
        }

        let path = self.directory.join(format!("{}.rec", recording_id));
        let file = match self.create_output(&path).await {
            Ok(file) => file,
            Err(e) => {
                self.active_streams.remove(&stream_id);
                return Err(e);
            }
        };

        let pending = Recording {
            id: recording_id.clone(),
            session_id: session_id.to_string(),
            storage_ref: path.to_string_lossy().into_owned(),
            duration_seconds: 0.0,
            size_bytes: 0,
            created_at: Utc::now(),
            owner_role,
            finalized_at: None,
        };

        // subscribe before spawning so no chunk published after this call is missed
        let chunks = stream.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(capture(recording_id.clone(), file, chunks, stop_rx));

        self.recordings.insert(
            recording_id.clone(),
            Arc::new(ActiveRecording {
                pending: pending.clone(),
                stream_id,
                stop_tx,
                task: Mutex::new(Some(task)),
                finalized: OnceCell::new(),
                persisted: AtomicBool::new(false),
            }),
        );

        info!(
            recording_id = %recording_id,
            session_id = %session_id,
            owner_role = %owner_role,
            path = %path.display(),
            "Recording started"
        );
        Ok(pending)
    }

    async fn create_output(&self, path: &Path) -> Result<File> {
        tokio::fs::create_dir_all(&self.directory).await?;
        Ok(File::create(path).await?)
    }

    /// Stop capturing and finalize; returns the same record on every call
    ///
    /// # Errors
    ///
    /// `NoActiveStream` if no recording with this id was ever started.
    pub async fn stop_recording(&self, recording_id: &str) -> Result<Recording> {
        let active = self
            .recordings
            .get(recording_id)
            .map(|entry| Arc::clone(entry.value()));

        match active {
            Some(active) => Ok(self.finalize(&active).await),
            None => {
                let id = recording_id.to_string();
                let stored = run_blocking(&self.store, move |s| s.load_recording(&id)).await?;
                stored.ok_or_else(|| {
                    Error::NoActiveStream(format!("recording {} was never started", recording_id))
                })
            }
        }
    }

    /// Finalize every unfinished recording of a session
    pub async fn finalize_session(&self, session_id: &str) -> Vec<Recording> {
        let active: Vec<Arc<ActiveRecording>> = self
            .recordings
            .iter()
            .filter(|entry| {
                entry.pending.session_id == session_id && entry.finalized.get().is_none()
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut finalized = Vec::with_capacity(active.len());
        for recording in active {
            finalized.push(self.finalize(&recording).await);
        }
        if !finalized.is_empty() {
            info!(session_id = %session_id, count = finalized.len(), "Session recordings finalized");
        }
        finalized
    }

    async fn finalize(&self, active: &Arc<ActiveRecording>) -> Recording {
        let recording = active
            .finalized
            .get_or_init(|| async {
                active.stop_tx.send_replace(true);
                let task = active.task.lock().take();

                let stats = match task {
                    Some(task) => match task.await {
                        Ok(stats) => stats,
                        Err(e) => {
                            error!(recording_id = %active.pending.id, error = %e, "Capture task failed");
                            let size = tokio::fs::metadata(&active.pending.storage_ref)
                                .await
                                .map(|m| m.len())
                                .unwrap_or(0);
                            CaptureStats {
                                bytes: size,
                                ..Default::default()
                            }
                        }
                    },
                    None => CaptureStats::default(),
                };

                let recording = Recording {
                    duration_seconds: stats.duration.as_secs_f64(),
                    size_bytes: stats.bytes,
                    finalized_at: Some(Utc::now()),
                    ..active.pending.clone()
                };

                self.active_streams
                    .remove_if(&active.stream_id, |_, id| *id == recording.id);

                let record = recording.clone();
                match run_blocking(&self.store, move |s| s.save_recording(&record)).await {
                    Ok(()) => active.persisted.store(true, Ordering::Release),
                    Err(e) => {
                        // kept in memory so stop and list still find it
                        error!(recording_id = %recording.id, error = %e, "Failed to persist recording metadata");
                    }
                }

                info!(
                    recording_id = %recording.id,
                    session_id = %recording.session_id,
                    size_bytes = recording.size_bytes,
                    duration_seconds = recording.duration_seconds,
                    chunks = stats.chunks,
                    "Recording finalized"
                );
                recording
            })
            .await
            .clone();

        if active.persisted.load(Ordering::Acquire) {
            self.recordings
                .remove_if(&recording.id, |_, entry| Arc::ptr_eq(entry, active));
        }
        recording
    }

    /// Session a recording belongs to, live or stored
    ///
    /// # Errors
    ///
    /// `NoActiveStream` if no recording with this id exists.
    pub async fn recording_session(&self, recording_id: &str) -> Result<SessionId> {
        let live = self
            .recordings
            .get(recording_id)
            .map(|entry| entry.pending.session_id.clone());
        if let Some(session_id) = live {
            return Ok(session_id);
        }

        let id = recording_id.to_string();
        let stored = run_blocking(&self.store, move |s| s.load_recording(&id)).await?;
        stored.map(|r| r.session_id).ok_or_else(|| {
            Error::NoActiveStream(format!("recording {} does not exist", recording_id))
        })
    }

    /// Recordings of a session: finalized ones from the store plus any in progress
    pub async fn list_recordings(&self, session_id: &str) -> Result<Vec<Recording>> {
        let id = session_id.to_string();
        let mut recordings = run_blocking(&self.store, move |s| s.list_recordings(&id)).await?;

        for entry in self.recordings.iter() {
            if entry.pending.session_id != session_id {
                continue;
            }
            if recordings.iter().any(|r| r.id == entry.pending.id) {
                continue;
            }
            let current = entry
                .finalized
                .get()
                .cloned()
                .unwrap_or_else(|| entry.pending.clone());
            recordings.push(current);
        }

        recordings.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(recordings)
    }

    /// Remove a recording's bytes and metadata
    ///
    /// An in-progress recording is finalized first.
    pub async fn delete_recording(&self, recording_id: &str) -> Result<()> {
        let recording = self.stop_recording(recording_id).await?;

        match tokio::fs::remove_file(&recording.storage_ref).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(recording_id = %recording_id, "Recording file already gone");
            }
            Err(e) => return Err(e.into()),
        }

        let id = recording_id.to_string();
        run_blocking(&self.store, move |s| s.delete_recording(&id)).await?;
        self.recordings.remove(recording_id);

        info!(recording_id = %recording_id, session_id = %recording.session_id, "Recording deleted");
        Ok(())
    }

    /// Number of recordings still capturing
    pub fn active_count(&self) -> usize {
        self.active_streams.len()
    }

    /// Whether `recording_id` was started and is not finalized yet
    pub fn is_capturing(&self, recording_id: &str) -> bool {
        self.recordings
            .get(recording_id)
            .map(|entry| entry.finalized.get().is_none())
            .unwrap_or(false)
    }
}

async fn capture(
    recording_id: String,
    mut file: File,
    mut chunks: ChunkFeed,
    mut stop_rx: watch::Receiver<bool>,
) -> CaptureStats {
    let mut stats = CaptureStats::default();

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            event = chunks.recv() => match event {
                FeedEvent::Chunk(chunk) => write_chunk(&recording_id, &mut file, &chunk, &mut stats).await,
                FeedEvent::Skipped(skipped) => {
                    warn!(recording_id = %recording_id, skipped, "Recording fell behind live stream, chunks skipped");
                }
                FeedEvent::Closed => {
                    debug!(recording_id = %recording_id, "Recorded stream closed");
                    break;
                }
            },
        }
    }

    // chunks accepted before the stop still belong to the recording
    chunks.close();
    while let Some(event) = chunks.try_recv() {
        match event {
            FeedEvent::Chunk(chunk) => write_chunk(&recording_id, &mut file, &chunk, &mut stats).await,
            FeedEvent::Skipped(skipped) => {
                warn!(recording_id = %recording_id, skipped, "Recording fell behind live stream, chunks skipped");
            }
            FeedEvent::Closed => break,
        }
    }

    if let Err(e) = file.flush().await {
        error!(recording_id = %recording_id, error = %e, "Failed to flush recording");
    }
    stats
}

async fn write_chunk(recording_id: &str, file: &mut File, chunk: &MediaChunk, stats: &mut CaptureStats) {
    if let Err(e) = file.write_all(&chunk.data).await {
        error!(recording_id = %recording_id, error = %e, "Failed to write recording chunk");
        return;
    }
    stats.bytes += chunk.data.len() as u64;
    stats.duration += chunk.duration;
    stats.chunks += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalStreamHandle, LocalTrack, TrackKind, TrackSource};
    use crate::recording::IngestStream;
    use crate::store::MemoryStore;

    fn pipeline(dir: &Path) -> (RecordingPipeline, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (RecordingPipeline::new(dir, store.clone()), store)
    }

    #[tokio::test]
    async fn test_start_without_live_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(dir.path());

        let track = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        let stream = Arc::new(LocalStreamHandle::new(vec![track]));
        stream.stop();

        let result = pipeline
            .start_recording("sess-1", ParticipantRole::Provider, stream)
            .await;
        assert!(matches!(result, Err(Error::NoActiveStream(_))));
    }

    #[tokio::test]
    async fn test_second_recording_of_same_stream() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(dir.path());
        let track = LocalTrack::new(TrackKind::Video, TrackSource::Camera, "camera");
        let stream = Arc::new(LocalStreamHandle::new(vec![track]));

        let first = pipeline
            .start_recording("sess-1", ParticipantRole::Provider, stream.clone())
            .await
            .unwrap();
        let second = pipeline
            .start_recording("sess-1", ParticipantRole::Provider, stream.clone())
            .await;
        assert!(matches!(second, Err(Error::RecordingAlreadyActive(_))));

        // after finalization the stream may be recorded again
        pipeline.stop_recording(&first.id).await.unwrap();
        assert!(pipeline
            .start_recording("sess-1", ParticipantRole::Provider, stream)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_accounts_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, store) = pipeline(dir.path());
        let stream = Arc::new(IngestStream::new());

        let recording = pipeline
            .start_recording("sess-1", ParticipantRole::Patient, stream.clone())
            .await
            .unwrap();

        stream
            .push(MediaChunk::new(vec![0u8; 100], Duration::from_millis(500)))
            .await
            .unwrap();
        stream
            .push(MediaChunk::new(vec![0u8; 50], Duration::from_millis(250)))
            .await
            .unwrap();

        let first = pipeline.stop_recording(&recording.id).await.unwrap();
        let second = pipeline.stop_recording(&recording.id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.size_bytes, 150);
        assert!((first.duration_seconds - 0.75).abs() < 1e-9);
        assert!(first.is_finalized());

        let on_disk = tokio::fs::metadata(&first.storage_ref).await.unwrap();
        assert_eq!(on_disk.len(), 150);
        assert_eq!(store.load_recording(&first.id).unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_stop_unknown_recording() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(dir.path());
        let result = pipeline.stop_recording("nope").await;
        assert!(matches!(result, Err(Error::NoActiveStream(_))));
    }

    #[tokio::test]
    async fn test_concurrent_finalize_yields_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(dir.path());
        let pipeline = Arc::new(pipeline);
        let stream = Arc::new(IngestStream::new());

        let recording = pipeline
            .start_recording("sess-1", ParticipantRole::Provider, stream.clone())
            .await
            .unwrap();
        stream
            .push(MediaChunk::new(vec![7u8; 10], Duration::from_millis(100)))
            .await
            .unwrap();

        let by_stop = {
            let pipeline = pipeline.clone();
            let id = recording.id.clone();
            tokio::spawn(async move { pipeline.stop_recording(&id).await.unwrap() })
        };
        let by_end = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.finalize_session("sess-1").await })
        };

        let stopped = by_stop.await.unwrap();
        let ended = by_end.await.unwrap();
        for other in ended {
            assert_eq!(other, stopped);
        }
        assert_eq!(pipeline.active_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_removes_file_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, store) = pipeline(dir.path());
        let stream = Arc::new(IngestStream::new());

        let recording = pipeline
            .start_recording("sess-1", ParticipantRole::Provider, stream)
            .await
            .unwrap();
        pipeline.delete_recording(&recording.id).await.unwrap();

        assert!(tokio::fs::metadata(&recording.storage_ref).await.is_err());
        assert!(store.load_recording(&recording.id).unwrap().is_none());
        assert!(pipeline.list_recordings("sess-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_burst_larger_than_queue_is_fully_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(dir.path());
        let stream = Arc::new(IngestStream::with_capacity(8));

        let recording = pipeline
            .start_recording("sess-1", ParticipantRole::Patient, stream.clone())
            .await
            .unwrap();

        let mut accepted = 0u64;
        for _ in 0..1000 {
            stream
                .push(MediaChunk::new(vec![3u8; 10], Duration::from_millis(20)))
                .await
                .unwrap();
            accepted += 10;
        }

        let finalized = pipeline.stop_recording(&recording.id).await.unwrap();
        assert_eq!(finalized.size_bytes, accepted);
        assert!((finalized.duration_seconds - 20.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_finalized_recording_leaves_memory() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(dir.path());
        let stream = Arc::new(IngestStream::new());

        let recording = pipeline
            .start_recording("sess-1", ParticipantRole::Provider, stream)
            .await
            .unwrap();
        let finalized = pipeline.stop_recording(&recording.id).await.unwrap();

        assert!(pipeline.recordings.is_empty());
        assert!(!pipeline.is_capturing(&recording.id));
        assert_eq!(pipeline.stop_recording(&recording.id).await.unwrap(), finalized);
        assert_eq!(
            pipeline.recording_session(&recording.id).await.unwrap(),
            "sess-1"
        );
        assert_eq!(pipeline.list_recordings("sess-1").await.unwrap(), vec![finalized]);
    }

    #[tokio::test]
    async fn test_recording_session_of_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(dir.path());
        let result = pipeline.recording_session("nope").await;
        assert!(matches!(result, Err(Error::NoActiveStream(_))));
    }
}
