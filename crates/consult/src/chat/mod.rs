//! Chat ordering layer
//!
//! Chat messages get their id from the session's single message counter,
//! so every participant observes one total order. A bounded history is
//! kept per session; a participant that reconnects is replayed everything
//! after the last message it acknowledged (or the last one queued to it).
//! Delivery is therefore at-least-once: replayed messages keep their ids
//! and clients de-duplicate on `id`.

use crate::session::ParticipantId;
use crate::signaling::message::{MessageId, SignalingMessage};
use crate::signaling::protocol::JsonRpcNotification;
use crate::signaling::relay::{Delivery, SignalingRelay};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

/// Per-session chat history and delivery watermarks
#[derive(Debug)]
pub struct ChatLog {
    session_id: String,
    limit: usize,
    history: VecDeque<SignalingMessage>,
    delivered_through: HashMap<ParticipantId, MessageId>,
}

impl ChatLog {
    pub fn new(session_id: impl Into<String>, limit: usize) -> Self {
        Self {
            session_id: session_id.into(),
            limit: limit.max(1),
            history: VecDeque::new(),
            delivered_through: HashMap::new(),
        }
    }

    /// Record a message; the oldest entry is evicted beyond the bound
    pub fn append(&mut self, message: SignalingMessage) {
        self.history.push_back(message);
        while self.history.len() > self.limit {
            self.history.pop_front();
        }
    }

    /// Append `message` and deliver it to `participants`
    ///
    /// The sender is included only when `echo` is set. Participants that
    /// are not connected get it on their next replay.
    pub fn publish(
        &mut self,
        relay: &SignalingRelay,
        message: SignalingMessage,
        participants: &[ParticipantId],
        echo: bool,
    ) {
        let frame = match JsonRpcNotification::relayed(&message).to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Failed to encode chat message");
                return;
            }
        };

        for participant in participants {
            if participant == &message.sender_id && !echo {
                self.mark_delivered(participant, message.id);
                continue;
            }
            match relay.send_frame(&self.session_id, participant, frame.clone()) {
                Delivery::Delivered => self.mark_delivered(participant, message.id),
                other => debug!(
                    session_id = %self.session_id,
                    message_id = message.id,
                    participant_id = %participant,
                    outcome = ?other,
                    "Chat message held for replay"
                ),
            }
        }

        self.append(message);
    }

    /// Replay buffered messages to a (re)connected participant
    ///
    /// `resume_after` is the last id the client reports having seen; when
    /// absent, the server-side watermark is used. Returns the number of
    /// messages queued.
    pub fn replay(
        &mut self,
        relay: &SignalingRelay,
        participant_id: &str,
        resume_after: Option<MessageId>,
    ) -> usize {
        let after = resume_after
            .or_else(|| self.delivered_through.get(participant_id).copied())
            .unwrap_or(0);

        let pending: Vec<SignalingMessage> = self
            .history
            .iter()
            .filter(|m| m.id > after)
            .cloned()
            .collect();

        let mut replayed = 0;
        for message in pending {
            let frame = match JsonRpcNotification::relayed(&message).to_json() {
                Ok(frame) => frame,
                Err(_) => continue,
            };
            if !relay
                .send_frame(&self.session_id, participant_id, frame)
                .is_delivered()
            {
                break;
            }
            self.mark_delivered(participant_id, message.id);
            replayed += 1;
        }

        if replayed > 0 {
            debug!(session_id = %self.session_id, participant_id = %participant_id, replayed, after, "Chat history replayed");
        }
        replayed
    }

    fn mark_delivered(&mut self, participant_id: &str, id: MessageId) {
        let entry = self
            .delivered_through
            .entry(participant_id.to_string())
            .or_insert(0);
        if id > *entry {
            *entry = id;
        }
    }

    /// Messages in order, oldest first
    pub fn history(&self) -> Vec<SignalingMessage> {
        self.history.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}
