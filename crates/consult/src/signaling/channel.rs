//! Participant signaling channels
//!
//! A channel is the server's outbound path to one connected participant.
//! Sends never block: a full or closed queue is reported to the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Why a frame could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSendError {
    Closed,
    Full,
}

impl std::fmt::Display for ChannelSendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelSendError::Closed => write!(f, "channel closed"),
            ChannelSendError::Full => write!(f, "channel queue full"),
        }
    }
}

/// Outbound path to one participant
pub trait SignalingChannel: Send + Sync {
    /// Unique id of this connection
    fn channel_id(&self) -> &str;

    /// Queue a text frame without waiting
    fn send(&self, frame: String) -> std::result::Result<(), ChannelSendError>;

    /// Close the underlying connection; idempotent
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Frame handed to a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// `SignalingChannel` over a bounded mpsc queue
pub struct MpscChannel {
    id: String,
    tx: mpsc::Sender<OutboundFrame>,
    open: AtomicBool,
}

impl MpscChannel {
    /// Create a channel and the receiver its writer task drains
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let channel = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            tx,
            open: AtomicBool::new(true),
        });
        (channel, rx)
    }
}

impl SignalingChannel for MpscChannel {
    fn channel_id(&self) -> &str {
        &self.id
    }

    fn send(&self, frame: String) -> std::result::Result<(), ChannelSendError> {
        if !self.is_open() {
            return Err(ChannelSendError::Closed);
        }
        self.tx.try_send(OutboundFrame::Text(frame)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelSendError::Full,
            mpsc::error::TrySendError::Closed(_) => {
                self.open.store(false, Ordering::SeqCst);
                ChannelSendError::Closed
            }
        })
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.try_send(OutboundFrame::Close);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }
}
