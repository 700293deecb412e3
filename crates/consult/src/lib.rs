//! Virtual consultation session core
//!
//! Two participants (typically a patient and a provider) meet in a
//! session. This crate owns everything between the identity layer and the
//! browser: session lifecycle, signaling relay, chat ordering, connection
//! quality classification and recording.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Browser / native clients                                │
//! │  ↓ JSON-RPC 2.0 over WebSocket                           │
//! │  WebSocketSignalingServer (one task per connection)      │
//! │  ↓                                                       │
//! │  SessionManager ── registry: session id → actor handle   │
//! │  └─ SessionActor (one task per session)                  │
//! │     ├─ status, membership, grace and idle timers         │
//! │     ├─ ChatLog (total order, bounded replay buffer)      │
//! │     ├─ SignalingRelay (participant → channel routes)     │
//! │     ├─ RecordingPipeline (forced finalize on end)        │
//! │     └─ ConsultStore (memory or SQLite)                   │
//! │  QualityMonitor ── samples a PeerTransport while ACTIVE  │
//! │  MediaEndpoint ── capture, mute, screen share, SDP/ICE   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use telehealth_consult::config::ConsultConfig;
//!
//! let config = ConsultConfig::default();
//! assert!(config.validate().is_ok());
//! assert_eq!(config.session.chat_history_limit, 256);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use telehealth_consult::config::ConsultConfig;
//! use telehealth_consult::session::{ParticipantRole, SessionManager, SessionType};
//! use telehealth_consult::store::MemoryStore;
//!
//! # async fn example() -> telehealth_consult::Result<()> {
//! let manager = SessionManager::new(&ConsultConfig::default(), Arc::new(MemoryStore::new()));
//!
//! let session = manager
//!     .create_session("patientA", "providerB", SessionType::Video, None, None)
//!     .await?;
//! manager.join(&session.id, "patientA", ParticipantRole::Patient).await?;
//! let joined = manager.join(&session.id, "providerB", ParticipantRole::Provider).await?;
//! assert!(joined.activated);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod chat;
pub mod config;
pub mod error;
pub mod media;
pub mod quality;
pub mod recording;
pub mod session;
pub mod signaling;
pub mod store;

pub use config::ConsultConfig;
pub use error::{Error, Result};
pub use session::{SessionManager, SessionStatus};
pub use signaling::{WebSocketServerHandle, WebSocketSignalingServer};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
