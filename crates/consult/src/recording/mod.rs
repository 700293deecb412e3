//! Session recording
//!
//! [`RecordingPipeline`] captures chunks from a [`RecordableStream`] into a
//! file under the recordings directory and finalizes each recording exactly
//! once. [`IngestStream`] is a stream fed from outside the process (chunks
//! uploaded over signaling).

pub mod ingest;
pub mod pipeline;

pub use ingest::IngestStream;
pub use pipeline::RecordingPipeline;

use crate::media::MediaChunk;
use crate::session::{ParticipantRole, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc};

/// Recording identifier
pub type RecordingId = String;

/// A finalized (or in-progress) recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub id: RecordingId,
    pub session_id: SessionId,
    /// Location of the stored bytes
    pub storage_ref: String,
    pub duration_seconds: f64,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub owner_role: ParticipantRole,
    /// `None` until finalized
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Recording {
    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }
}

/// Source of chunks that can be recorded
pub trait RecordableStream: Send + Sync {
    /// Stable id; at most one active recording per stream id
    fn stream_id(&self) -> &str;

    fn has_live_tracks(&self) -> bool;

    /// Chunks published from now on; the feed closes with the stream
    fn subscribe(&self) -> ChunkFeed;
}

/// Chunk source of one capture
pub enum ChunkFeed {
    /// Live fan-out; a recorder that falls behind skips chunks
    Live(broadcast::Receiver<MediaChunk>),
    /// Lossless queue; producers wait for the recorder
    Queued(mpsc::Receiver<MediaChunk>),
}

/// One step of a [`ChunkFeed`]
#[derive(Debug)]
pub enum FeedEvent {
    Chunk(MediaChunk),
    /// Chunks lost by a lagging live subscriber
    Skipped(u64),
    Closed,
}

impl ChunkFeed {
    pub async fn recv(&mut self) -> FeedEvent {
        match self {
            ChunkFeed::Live(rx) => match rx.recv().await {
                Ok(chunk) => FeedEvent::Chunk(chunk),
                Err(RecvError::Lagged(skipped)) => FeedEvent::Skipped(skipped),
                Err(RecvError::Closed) => FeedEvent::Closed,
            },
            ChunkFeed::Queued(rx) => match rx.recv().await {
                Some(chunk) => FeedEvent::Chunk(chunk),
                None => FeedEvent::Closed,
            },
        }
    }

    /// Next chunk already buffered; `None` when nothing is left
    pub fn try_recv(&mut self) -> Option<FeedEvent> {
        match self {
            ChunkFeed::Live(rx) => match rx.try_recv() {
                Ok(chunk) => Some(FeedEvent::Chunk(chunk)),
                Err(TryRecvError::Lagged(skipped)) => Some(FeedEvent::Skipped(skipped)),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
            },
            ChunkFeed::Queued(rx) => rx.try_recv().ok().map(FeedEvent::Chunk),
        }
    }

    /// Refuse further queued chunks; those already queued stay readable
    pub fn close(&mut self) {
        if let ChunkFeed::Queued(rx) = self {
            rx.close();
        }
    }
}
