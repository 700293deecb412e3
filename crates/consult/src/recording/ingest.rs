//! Recordable stream fed by uploaded chunks

use super::{ChunkFeed, RecordableStream};
use crate::media::MediaChunk;
use crate::{Error, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

const INGEST_BUFFER: usize = 256;

/// Stream whose chunks arrive from a remote client
///
/// Chunks go through a bounded queue to a single recorder. A full queue
/// makes [`IngestStream::push`] wait, so an accepted chunk is always
/// written. Live until [`IngestStream::close`].
pub struct IngestStream {
    id: String,
    tx: Mutex<Option<mpsc::Sender<MediaChunk>>>,
    rx: Mutex<Option<mpsc::Receiver<MediaChunk>>>,
}

impl Default for IngestStream {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStream {
    pub fn new() -> Self {
        Self::with_capacity(INGEST_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            id: Uuid::new_v4().to_string(),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Queue one chunk for the recorder, waiting while the queue is full
    ///
    /// # Errors
    ///
    /// `NoActiveStream` once the stream is closed or its recorder stopped.
    pub async fn push(&self, chunk: MediaChunk) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| Error::NoActiveStream(format!("ingest stream {} is closed", self.id)))?;
        tx.send(chunk).await.map_err(|_| {
            Error::NoActiveStream(format!("ingest stream {} is no longer recorded", self.id))
        })
    }

    /// End the stream; idempotent
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

impl RecordableStream for IngestStream {
    fn stream_id(&self) -> &str {
        &self.id
    }

    fn has_live_tracks(&self) -> bool {
        self.tx.lock().is_some()
    }

    /// The queue has one consumer; later subscribers get a closed feed
    fn subscribe(&self) -> ChunkFeed {
        match self.rx.lock().take() {
            Some(rx) => ChunkFeed::Queued(rx),
            None => ChunkFeed::Queued(mpsc::channel(1).1),
        }
    }
}
