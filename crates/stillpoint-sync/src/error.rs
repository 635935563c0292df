use stillpoint_relay::RelayError;
use thiserror::Error;

use crate::participant::ParticipantId;
use crate::state::Revision;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("presence lost: relay connection closed")]
    PresenceLost,
    #[error("{local} is not the session host (host: {host:?})")]
    NotAuthorized {
        local: ParticipantId,
        host: Option<ParticipantId>,
    },
    #[error("stale state {incoming} discarded; {applied} already applied")]
    StaleState { incoming: Revision, applied: Revision },
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("invalid mutation: {0}")]
    InvalidMutation(String),
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
}

pub type SyncResult<T> = Result<T, SyncError>;
