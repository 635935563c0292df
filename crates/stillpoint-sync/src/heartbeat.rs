use std::time::Duration;

use stillpoint_relay::{Relay, RelayError, RelayHandle};
use tracing::trace;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::participant::{ParticipantStatus, PresenceMeta};

/// Periodic re-announcement of the local presence entry. Any participant
/// whose announcements stop for longer than the grace period is treated as
/// gone by everyone else, host or not.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    meta: PresenceMeta,
    interval: Duration,
    grace_ms: u64,
    beats: u64,
}

impl Heartbeat {
    pub fn new(meta: PresenceMeta, config: &SyncConfig) -> Self {
        Self {
            meta,
            interval: config.heartbeat_interval(),
            grace_ms: config.presence_grace_ms,
            beats: 0,
        }
    }

    pub fn meta(&self) -> &PresenceMeta {
        &self.meta
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn grace_ms(&self) -> u64 {
        self.grace_ms
    }

    pub fn beats(&self) -> u64 {
        self.beats
    }

    /// Returns true when the status actually changed.
    pub fn set_status(&mut self, status: ParticipantStatus) -> bool {
        let changed = self.meta.status != status;
        self.meta.status = status;
        changed
    }

    pub fn announce(&mut self, relay: &dyn Relay, handle: &RelayHandle) -> SyncResult<()> {
        let meta = serde_json::to_value(&self.meta)
            .map_err(|err| SyncError::Relay(RelayError::Encode(err.to_string())))?;
        relay.track(handle, meta)?;
        self.beats += 1;
        trace!(
            target = "stillpoint.sync",
            participant = %self.meta.id,
            beats = self.beats,
            "heartbeat"
        );
        Ok(())
    }

    pub fn is_expired(&self, last_seen_ms: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(last_seen_ms) > self.grace_ms
    }
}
