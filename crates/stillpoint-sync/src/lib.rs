//! Stillpoint sync: keeps a group of participants in one meditation session
//! looking at the same state and the same countdown.
//!
//! Responsibilities:
//! - tracking who is present from relay presence events and heartbeats
//! - electing exactly one host from the roster, deterministically
//! - replicating the host's whole session state with last-writer-wins
//! - deriving the countdown from a shared start epoch so peers never drift

pub mod clock;
pub mod config;
pub mod context;
pub mod election;
pub mod error;
pub mod heartbeat;
pub mod participant;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod state;
pub mod timer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use context::{SessionContext, SessionNotice};
pub use election::elect;
pub use error::{SyncError, SyncResult};
pub use participant::{Participant, ParticipantId, ParticipantStatus, PresenceMeta};
pub use presence::{PresenceTracker, RosterChange};
pub use session::SessionHandle;
pub use state::{
    ApplyOutcome, PracticeKind, Revision, SessionMutation, SessionState, StateSnapshot,
    StateStore,
};
pub use timer::{Completion, TimerEngine, TimerPhase};
