//! WebSocket connection handler
//!
//! One task per connection reads JSON-RPC requests and dispatches them to
//! the [`SessionManager`]. Everything the server writes (responses and
//! notifications) goes through the connection's [`MpscChannel`], drained
//! by a writer task, so a slow client never blocks a session actor.

use crate::media::{IceCandidate, MediaChunk, SessionDescription};
use crate::session::{EndReason, ParticipantId, SessionId, SessionManager};
use crate::signaling::channel::{MpscChannel, OutboundFrame, SignalingChannel};
use crate::signaling::message::{MessageKind, OutboundSignal};
use crate::signaling::protocol::{
    error_codes, methods, ChatSendParams, ControlParams, CreateSessionParams, EndSessionParams,
    IceCandidateParams, JoinParams, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    MediaFailureParams, MediaToggleParams, QualityReportParams, RecordingChunkParams,
    RecordingRefParams, SdpParams, SessionRefParams,
};
use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Message, Result as WsResult},
};
use tracing::{debug, error, info, warn};

/// State shared by all connections of one server
pub struct SharedState {
    pub manager: SessionManager,
    /// Outbound queue size per connection
    pub channel_capacity: usize,
}

impl SharedState {
    pub fn new(manager: SessionManager, channel_capacity: usize) -> Self {
        Self {
            manager,
            channel_capacity,
        }
    }
}

/// The (session, participant) a connection joined as
#[derive(Debug, Clone)]
struct Binding {
    session_id: SessionId,
    participant_id: ParticipantId,
}

/// Per-connection request context
struct Connection {
    state: Arc<SharedState>,
    channel: Arc<MpscChannel>,
    binding: Option<Binding>,
}

/// Handle a single WebSocket connection
pub async fn handle_connection(
    stream: TcpStream,
    state: Arc<SharedState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> WsResult<()> {
    let addr = stream.peer_addr()?;
    let ws_stream = accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (channel, mut outbound) = MpscChannel::new(state.channel_capacity);
    info!(peer_addr = %addr, channel_id = %channel.channel_id(), "WebSocket connection opened");

    // forward queued frames to the socket
    let writer_channel_id = channel.channel_id().to_string();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let result = match frame {
                OutboundFrame::Text(text) => ws_tx.send(Message::Text(text)).await,
                OutboundFrame::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = result {
                debug!(channel_id = %writer_channel_id, error = %e, "Failed to write WebSocket frame");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut connection = Connection {
        state,
        channel,
        binding: None,
    };

    loop {
        let message = tokio::select! {
            message = ws_rx.next() => message,
            _ = shutdown_rx.recv() => {
                debug!(peer_addr = %addr, "Closing connection for server shutdown");
                break;
            }
        };

        match message {
            Some(Ok(Message::Text(text))) => connection.handle_text(&text).await,
            Some(Ok(Message::Close(_))) | None => {
                info!(peer_addr = %addr, "WebSocket connection closed by client");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(peer_addr = %addr, error = %e, "WebSocket error");
                break;
            }
        }

        if !connection.channel.is_open() {
            // superseded by a newer connection of the same participant
            break;
        }
    }

    connection.disconnect().await;
    if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
        debug!(peer_addr = %addr, "Writer task did not finish in time");
    }
    Ok(())
}

impl Connection {
    async fn handle_text(&mut self, text: &str) {
        let request = match JsonRpcRequest::from_json(text) {
            Ok(request) => request,
            Err(e) => {
                let response = JsonRpcError::new(
                    error_codes::PARSE_ERROR,
                    format!("Failed to parse JSON-RPC request: {}", e),
                    Value::Null,
                );
                self.reply(response.to_json());
                return;
            }
        };

        let request_id = request.id.clone();
        let method = request.method.clone();
        debug!(channel_id = %self.channel.channel_id(), method = %method, "JSON-RPC request");

        let outcome = self.dispatch(request).await;

        // requests without an id are notifications and get no response
        let Some(id) = request_id else {
            if let Err(Some(e)) = outcome {
                warn!(method = %method, error = %e, "Notification failed");
            }
            return;
        };

        match outcome {
            Ok(result) => self.reply(JsonRpcResponse::new(result, id).to_json()),
            Err(Some(e)) => {
                debug!(method = %method, error = %e, kind = e.kind(), "Request failed");
                self.reply(JsonRpcError::from_error(&e, id).to_json());
            }
            Err(None) => {
                let response = JsonRpcError::new(
                    error_codes::METHOD_NOT_FOUND,
                    format!("Unknown method: {}", method),
                    id,
                );
                self.reply(response.to_json());
            }
        }
    }

    fn reply(&self, frame: Result<String>) {
        match frame {
            Ok(frame) => {
                if let Err(e) = self.channel.send(frame) {
                    warn!(channel_id = %self.channel.channel_id(), error = %e, "Response dropped");
                }
            }
            Err(e) => error!(error = %e, "Failed to encode JSON-RPC response"),
        }
    }

    /// `Err(None)` means the method is unknown
    async fn dispatch(&mut self, request: JsonRpcRequest) -> std::result::Result<Value, Option<Error>> {
        let result = match request.method.as_str() {
            methods::SESSION_CREATE => self.create(&request).await,
            methods::SESSION_JOIN => self.join(&request).await,
            methods::SESSION_LEAVE => self.leave(&request).await,
            methods::SESSION_END => self.end(&request).await,
            methods::SESSION_GET => self.get(&request).await,
            methods::SIGNAL_OFFER => self.sdp(&request, MessageKind::Offer).await,
            methods::SIGNAL_ANSWER => self.sdp(&request, MessageKind::Answer).await,
            methods::SIGNAL_ICE_CANDIDATE => self.ice_candidate(&request).await,
            methods::SIGNAL_CONTROL => self.control(&request).await,
            methods::CHAT_SEND => self.chat_send(&request).await,
            methods::CHAT_HISTORY => self.chat_history(&request).await,
            methods::MEDIA_TOGGLE => self.media_toggle(&request).await,
            methods::MEDIA_START_SCREEN_SHARE => {
                self.screen_share(&request, "screen_share_started").await
            }
            methods::MEDIA_STOP_SCREEN_SHARE => {
                self.screen_share(&request, "screen_share_stopped").await
            }
            methods::MEDIA_REPORT_FAILURE => self.media_failure(&request).await,
            methods::QUALITY_REPORT => self.quality_report(&request).await,
            methods::RECORDING_START => self.recording_start(&request).await,
            methods::RECORDING_CHUNK => self.recording_chunk(&request).await,
            methods::RECORDING_STOP => self.recording_stop(&request).await,
            methods::RECORDING_LIST => self.recording_list(&request).await,
            methods::RECORDING_DELETE => self.recording_delete(&request).await,
            _ => return Err(None),
        };
        result.map_err(Some)
    }

    fn manager(&self) -> &SessionManager {
        &self.state.manager
    }

    /// Binding of this connection to `session_id`
    fn bound(&self, session_id: &str) -> Result<&Binding> {
        self.binding
            .as_ref()
            .filter(|b| b.session_id == session_id)
            .ok_or_else(|| {
                Error::InvalidParticipants(format!(
                    "connection has not joined session {}",
                    session_id
                ))
            })
    }

    async fn create(&self, request: &JsonRpcRequest) -> Result<Value> {
        let params: CreateSessionParams = request.parse_params()?;
        let session = self
            .manager()
            .create_session(
                &params.participant_a_id,
                &params.participant_b_id,
                params.session_type,
                params.scheduled_time,
                params.notes,
            )
            .await?;
        Ok(json!({ "session": session }))
    }

    async fn join(&mut self, request: &JsonRpcRequest) -> Result<Value> {
        let params: JoinParams = request.parse_params()?;
        let joined = self
            .manager()
            .join(&params.session_id, &params.participant_id, params.role)
            .await?;

        if let Some(previous) = self.binding.take() {
            if previous.session_id != params.session_id
                || previous.participant_id != params.participant_id
            {
                self.release(&previous).await;
            }
        }

        let channel: Arc<dyn SignalingChannel> = self.channel.clone();
        let session = self
            .manager()
            .register_channel(
                &params.session_id,
                &params.participant_id,
                channel,
                params.resume_after,
            )
            .await?;
        self.binding = Some(Binding {
            session_id: params.session_id,
            participant_id: params.participant_id,
        });

        Ok(json!({
            "session": session,
            "rejoined": joined.rejoined,
            "activated": joined.activated,
            "channel_id": self.channel.channel_id(),
        }))
    }

    async fn leave(&mut self, request: &JsonRpcRequest) -> Result<Value> {
        let params: SessionRefParams = request.parse_params()?;
        let binding = self.bound(&params.session_id)?.clone();
        let session = self
            .manager()
            .leave_channel(
                &binding.session_id,
                &binding.participant_id,
                self.channel.channel_id(),
            )
            .await?;
        self.binding = None;
        Ok(json!({ "session": session }))
    }

    async fn end(&mut self, request: &JsonRpcRequest) -> Result<Value> {
        let params: EndSessionParams = request.parse_params()?;
        self.bound(&params.session_id)?;
        let session = self
            .manager()
            .end(&params.session_id, EndReason::EndedByParticipant, params.notes)
            .await?;
        Ok(json!({ "session": session }))
    }

    async fn get(&self, request: &JsonRpcRequest) -> Result<Value> {
        let params: SessionRefParams = request.parse_params()?;
        let session = self.manager().get(&params.session_id).await?;
        Ok(json!({ "session": session }))
    }

    async fn relay(&self, session_id: &str, signal: OutboundSignal) -> Result<Value> {
        let binding = self.bound(session_id)?;
        let outcome = self
            .manager()
            .relay(&binding.session_id, &binding.participant_id, signal)
            .await?;
        Ok(json!({
            "message_id": outcome.message.map(|m| m.id),
            "delivered": outcome.delivery.is_delivered(),
        }))
    }

    async fn sdp(&self, request: &JsonRpcRequest, kind: MessageKind) -> Result<Value> {
        let params: SdpParams = request.parse_params()?;
        let description = match kind {
            MessageKind::Answer => SessionDescription::answer(params.sdp),
            _ => SessionDescription::offer(params.sdp),
        };
        let signal = OutboundSignal::new(kind, serde_json::to_value(description)?);
        self.relay(&params.session_id, signal).await
    }

    async fn ice_candidate(&self, request: &JsonRpcRequest) -> Result<Value> {
        let params: IceCandidateParams = request.parse_params()?;
        let candidate: IceCandidate = params.candidate;
        let signal = OutboundSignal::new(MessageKind::IceCandidate, serde_json::to_value(candidate)?);
        self.relay(&params.session_id, signal).await
    }

    async fn control(&self, request: &JsonRpcRequest) -> Result<Value> {
        let params: ControlParams = request.parse_params()?;
        self.relay(&params.session_id, OutboundSignal::control(params.directive))
            .await
    }

    async fn chat_send(&self, request: &JsonRpcRequest) -> Result<Value> {
        let params: ChatSendParams = request.parse_params()?;
        let binding = self.bound(&params.session_id)?;
        let message = self
            .manager()
            .send_chat(
                &binding.session_id,
                &binding.participant_id,
                &params.text,
                params.echo,
            )
            .await?;
        Ok(json!({ "message_id": message.id, "sent_at": message.sent_at }))
    }

    async fn chat_history(&self, request: &JsonRpcRequest) -> Result<Value> {
        let params: SessionRefParams = request.parse_params()?;
        let messages = self.manager().chat_history(&params.session_id).await?;
        Ok(json!({ "messages": messages }))
    }

    async fn media_toggle(&self, request: &JsonRpcRequest) -> Result<Value> {
        let params: MediaToggleParams = request.parse_params()?;
        let directive = json!({
            "action": "track_toggled",
            "kind": params.kind,
            "enabled": params.enabled,
        });
        self.relay(&params.session_id, OutboundSignal::control(directive))
            .await
    }

    async fn screen_share(&self, request: &JsonRpcRequest, action: &str) -> Result<Value> {
        let params: SessionRefParams = request.parse_params()?;
        self.relay(
            &params.session_id,
            OutboundSignal::control(json!({ "action": action })),
        )
        .await
    }

    async fn media_failure(&self, request: &JsonRpcRequest) -> Result<Value> {
        let params: MediaFailureParams = request.parse_params()?;
        let binding = self.bound(&params.session_id)?;
        let failure = match params.error.as_str() {
            "MediaAccessDenied" => Error::MediaAccessDenied(params.message),
            "MediaUnavailable" => Error::MediaUnavailable(params.message),
            other => {
                return Err(Error::InvalidData(format!(
                    "unsupported media failure kind: {}",
                    other
                )))
            }
        };
        let session = self
            .manager()
            .report_media_failure(&binding.session_id, &binding.participant_id, &failure)
            .await?;
        Ok(json!({ "session": session }))
    }

    async fn quality_report(&self, request: &JsonRpcRequest) -> Result<Value> {
        let params: QualityReportParams = request.parse_params()?;
        self.bound(&params.session_id)?;
        let session = self
            .manager()
            .report_quality(&params.session_id, params.quality)
            .await?;
        Ok(json!({ "quality": session.connection_quality_last }))
    }

    async fn recording_start(&self, request: &JsonRpcRequest) -> Result<Value> {
        let params: SessionRefParams = request.parse_params()?;
        let binding = self.bound(&params.session_id)?;
        let recording = self
            .manager()
            .open_ingest(&binding.session_id, &binding.participant_id)
            .await?;
        Ok(json!({ "recording": recording }))
    }

    /// Require this connection to be joined to the recording's session
    async fn bound_recording(&self, recording_id: &str) -> Result<&Binding> {
        let session_id = self.manager().recording_session(recording_id).await?;
        self.bound(&session_id)
    }

    async fn recording_chunk(&self, request: &JsonRpcRequest) -> Result<Value> {
        let params: RecordingChunkParams = request.parse_params()?;
        self.bound_recording(&params.recording_id).await?;
        let data = BASE64
            .decode(params.data.as_bytes())
            .map_err(|e| Error::InvalidData(format!("chunk is not valid base64: {}", e)))?;
        let size = data.len();
        self.manager()
            .push_ingest_chunk(
                &params.recording_id,
                MediaChunk::new(data, Duration::from_millis(params.duration_ms)),
            )
            .await?;
        Ok(json!({ "accepted_bytes": size }))
    }

    async fn recording_stop(&self, request: &JsonRpcRequest) -> Result<Value> {
        let params: RecordingRefParams = request.parse_params()?;
        self.bound_recording(&params.recording_id).await?;
        let recording = self.manager().stop_recording(&params.recording_id).await?;
        Ok(json!({ "recording": recording }))
    }

    async fn recording_list(&self, request: &JsonRpcRequest) -> Result<Value> {
        let params: SessionRefParams = request.parse_params()?;
        self.bound(&params.session_id)?;
        let recordings = self.manager().list_recordings(&params.session_id).await?;
        Ok(json!({ "recordings": recordings }))
    }

    async fn recording_delete(&self, request: &JsonRpcRequest) -> Result<Value> {
        let params: RecordingRefParams = request.parse_params()?;
        self.bound_recording(&params.recording_id).await?;
        self.manager().delete_recording(&params.recording_id).await?;
        Ok(json!({ "deleted": true }))
    }

    /// Leave the session this connection was bound to
    async fn release(&self, binding: &Binding) {
        match self
            .manager()
            .leave_channel(
                &binding.session_id,
                &binding.participant_id,
                self.channel.channel_id(),
            )
            .await
        {
            Ok(_) | Err(Error::SessionEnded(_)) | Err(Error::SessionNotFound(_)) => {}
            Err(e) => warn!(
                session_id = %binding.session_id,
                participant_id = %binding.participant_id,
                error = %e,
                "Failed to leave session on disconnect"
            ),
        }
    }

    async fn disconnect(&mut self) {
        if let Some(binding) = self.binding.take() {
            info!(
                session_id = %binding.session_id,
                participant_id = %binding.participant_id,
                "Participant connection closed"
            );
            self.release(&binding).await;
        }
        self.channel.close();
    }
}
