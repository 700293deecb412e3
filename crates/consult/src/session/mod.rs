//! Session lifecycle
//!
//! One actor task per session owns its status, membership, message
//! counter and timers. [`SessionManager`] is the thread-safe front door:
//! it keeps the registry of live actors and turns calls into inbox
//! commands.

mod actor;
pub mod manager;
pub mod model;

pub use actor::RelayOutcome;
pub use manager::{SessionManager, SessionQualitySink};
pub use model::{
    EndReason, JoinResult, ParticipantBinding, ParticipantId, ParticipantRole, Session,
    SessionId, SessionStatus, SessionType,
};
