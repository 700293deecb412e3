//! Signaling: message types, the JSON-RPC wire protocol, participant
//! channels, the relay and the WebSocket server

pub mod channel;
pub mod message;
pub mod protocol;
pub mod relay;
pub mod websocket;

pub use channel::{ChannelSendError, MpscChannel, OutboundFrame, SignalingChannel};
pub use message::{MessageId, MessageKind, OutboundSignal, SignalingMessage};
pub use relay::{ActivationEvent, Delivery, SignalingRelay};
pub use websocket::{WebSocketServerHandle, WebSocketSignalingServer};
