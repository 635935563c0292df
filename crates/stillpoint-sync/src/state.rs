//! Canonical session state, the mutations a host may issue, and the
//! single-writer store every peer keeps a copy of.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::participant::ParticipantId;

pub const MAX_VOLUME: u8 = 100;
pub const MAX_DURATION_MINUTES: u32 = 720;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PracticeKind {
    #[default]
    Breathwork,
    BodyScan,
    LovingKindness,
    OpenAwareness,
    Visualization,
    Silent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub is_playing: bool,
    pub practice: PracticeKind,
    pub duration_minutes: u32,
    pub volume: u8,
    /// Present exactly while `is_playing`.
    pub synchronized_start_ms: Option<u64>,
    /// Elapsed time of earlier run segments, folded in on pause.
    #[serde(default)]
    pub elapsed_before_ms: u64,
    pub background_audio: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            is_playing: false,
            practice: PracticeKind::default(),
            duration_minutes: 10,
            volume: 50,
            synchronized_start_ms: None,
            elapsed_before_ms: 0,
            background_audio: None,
        }
    }
}

impl SessionState {
    pub fn duration_ms(&self) -> u64 {
        u64::from(self.duration_minutes) * 60_000
    }

    /// Time left in the current run, derived from the shared epoch. Never
    /// accumulated; callers recompute on every sample.
    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        let budget = self.duration_ms().saturating_sub(self.elapsed_before_ms);
        match (self.is_playing, self.synchronized_start_ms) {
            (true, Some(epoch)) => budget.saturating_sub(now_ms.saturating_sub(epoch)),
            _ => budget,
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.is_playing != self.synchronized_start_ms.is_some() {
            return Err(SyncError::MalformedMessage(format!(
                "is_playing={} but synchronized_start_ms={:?}",
                self.is_playing, self.synchronized_start_ms
            )));
        }
        if self.volume > MAX_VOLUME {
            return Err(SyncError::MalformedMessage(format!(
                "volume {} out of range",
                self.volume
            )));
        }
        if self.duration_minutes == 0 || self.duration_minutes > MAX_DURATION_MINUTES {
            return Err(SyncError::MalformedMessage(format!(
                "duration {} minutes out of range",
                self.duration_minutes
            )));
        }
        Ok(())
    }

    /// Produce the state after `mutation`. `self` is left untouched.
    pub fn apply(&self, mutation: &SessionMutation, now_ms: u64) -> SyncResult<SessionState> {
        let mut next = self.clone();
        match mutation {
            SessionMutation::Play => {
                if !next.is_playing {
                    if next.elapsed_before_ms >= next.duration_ms() {
                        next.elapsed_before_ms = 0;
                    }
                    next.is_playing = true;
                    next.synchronized_start_ms = Some(now_ms);
                }
            }
            SessionMutation::Pause => {
                if let (true, Some(epoch)) = (next.is_playing, next.synchronized_start_ms) {
                    let segment = now_ms.saturating_sub(epoch);
                    next.elapsed_before_ms = next
                        .elapsed_before_ms
                        .saturating_add(segment)
                        .min(next.duration_ms());
                }
                next.is_playing = false;
                next.synchronized_start_ms = None;
            }
            SessionMutation::Stop => {
                next.is_playing = false;
                next.synchronized_start_ms = None;
                next.elapsed_before_ms = 0;
            }
            SessionMutation::SelectPractice { practice } => {
                next.require_stopped("practice")?;
                if next.practice != *practice {
                    next.practice = *practice;
                    next.elapsed_before_ms = 0;
                }
            }
            SessionMutation::SetDuration { minutes } => {
                next.require_stopped("duration")?;
                if *minutes == 0 || *minutes > MAX_DURATION_MINUTES {
                    return Err(SyncError::InvalidMutation(format!(
                        "duration must be 1..={MAX_DURATION_MINUTES} minutes, got {minutes}"
                    )));
                }
                if next.duration_minutes != *minutes {
                    next.duration_minutes = *minutes;
                    next.elapsed_before_ms = 0;
                }
            }
            SessionMutation::SetVolume { volume } => {
                if *volume > MAX_VOLUME {
                    return Err(SyncError::InvalidMutation(format!(
                        "volume must be 0..={MAX_VOLUME}, got {volume}"
                    )));
                }
                next.volume = *volume;
            }
            SessionMutation::SetBackgroundAudio { reference } => {
                next.background_audio = reference.clone();
            }
        }
        Ok(next)
    }

    fn require_stopped(&self, field: &str) -> SyncResult<()> {
        if self.is_playing {
            return Err(SyncError::InvalidMutation(format!(
                "{field} cannot change while playing"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionMutation {
    Play,
    Pause,
    Stop,
    SelectPractice { practice: PracticeKind },
    SetDuration { minutes: u32 },
    SetVolume { volume: u8 },
    SetBackgroundAudio { reference: Option<String> },
}

/// Broadcast stamp. Ordered by `seq`, then `issued_at_ms`, then `issuer`.
///
/// `seq` is a Lamport counter: a host issues one past the highest sequence
/// it has applied or issued, so a new host supersedes its predecessor even
/// when its clock runs behind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Revision {
    pub seq: u64,
    pub issued_at_ms: u64,
    pub issuer: ParticipantId,
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{} by {}", self.seq, self.issued_at_ms, self.issuer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: SessionState,
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Duplicate,
}

/// Whole-state, last-writer-wins store. Only the host stages mutations;
/// everyone (host included) receives snapshots.
#[derive(Debug, Default)]
pub struct StateStore {
    current: SessionState,
    applied: Option<Revision>,
    last_issued_seq: u64,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SessionState {
        &self.current
    }

    pub fn revision(&self) -> Option<&Revision> {
        self.applied.as_ref()
    }

    /// Latest applied snapshot; `None` until something was staged or received.
    pub fn snapshot(&self) -> Option<StateSnapshot> {
        self.applied.as_ref().map(|revision| StateSnapshot {
            state: self.current.clone(),
            revision: revision.clone(),
        })
    }

    /// Build the snapshot `mutation` leads to, stamped with the next
    /// revision. Nothing is applied until the snapshot comes back through
    /// [`StateStore::receive`]. Authorization is the caller's job.
    pub fn stage(
        &mut self,
        mutation: &SessionMutation,
        issuer: &ParticipantId,
        now_ms: u64,
    ) -> SyncResult<StateSnapshot> {
        let state = self.current.apply(mutation, now_ms)?;
        let seen = self.applied.as_ref().map(|r| r.seq).unwrap_or(0);
        let seq = seen.max(self.last_issued_seq) + 1;
        self.last_issued_seq = seq;
        Ok(StateSnapshot {
            state,
            revision: Revision {
                seq,
                issued_at_ms: now_ms,
                issuer: issuer.clone(),
            },
        })
    }

    /// Replace the whole state with `snapshot` unless it is older than what
    /// is already applied.
    pub fn receive(&mut self, snapshot: StateSnapshot) -> SyncResult<ApplyOutcome> {
        snapshot.state.validate()?;
        if let Some(applied) = &self.applied {
            if snapshot.revision == *applied {
                return Ok(ApplyOutcome::Duplicate);
            }
            if snapshot.revision < *applied {
                return Err(SyncError::StaleState {
                    incoming: snapshot.revision,
                    applied: applied.clone(),
                });
            }
        }
        debug!(
            target = "stillpoint.sync",
            revision = %snapshot.revision,
            playing = snapshot.state.is_playing,
            "applied session state"
        );
        self.current = snapshot.state;
        self.applied = Some(snapshot.revision);
        Ok(ApplyOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> ParticipantId {
        ParticipantId::new("host")
    }

    #[test]
    fn play_stamps_epoch_and_pause_clears_it() {
        let idle = SessionState::default();
        let playing = idle.apply(&SessionMutation::Play, 1_000).expect("play");
        assert!(playing.is_playing);
        assert_eq!(playing.synchronized_start_ms, Some(1_000));
        playing.validate().expect("valid while playing");

        let replay = playing.apply(&SessionMutation::Play, 9_000).expect("play again");
        assert_eq!(replay.synchronized_start_ms, Some(1_000), "no re-stamp while playing");

        let paused = playing.apply(&SessionMutation::Pause, 61_000).expect("pause");
        assert!(!paused.is_playing);
        assert_eq!(paused.synchronized_start_ms, None);
        assert_eq!(paused.elapsed_before_ms, 60_000);
        paused.validate().expect("valid while paused");
    }

    #[test]
    fn resume_restamps_and_keeps_remaining() {
        let state = SessionState::default()
            .apply(&SessionMutation::Play, 0)
            .and_then(|s| s.apply(&SessionMutation::Pause, 120_000))
            .expect("play then pause");
        assert_eq!(state.remaining_ms(999_999), 480_000, "paused value is frozen");

        let resumed = state.apply(&SessionMutation::Play, 500_000).expect("resume");
        assert_eq!(resumed.synchronized_start_ms, Some(500_000));
        assert_eq!(resumed.remaining_ms(500_000), 480_000);
        assert_eq!(resumed.remaining_ms(530_000), 450_000);
    }

    #[test]
    fn remaining_never_goes_negative_or_exceeds_duration() {
        let playing = SessionState::default()
            .apply(&SessionMutation::Play, 10_000)
            .expect("play");
        assert_eq!(playing.remaining_ms(10_000 + 11 * 60_000), 0);
        // Epoch ahead of the local clock (skew) reads as not yet started.
        assert_eq!(playing.remaining_ms(5_000), 600_000);
    }

    #[test]
    fn practice_and_duration_are_frozen_while_playing() {
        let playing = SessionState::default()
            .apply(&SessionMutation::Play, 0)
            .expect("play");
        for mutation in [
            SessionMutation::SetDuration { minutes: 20 },
            SessionMutation::SelectPractice {
                practice: PracticeKind::BodyScan,
            },
        ] {
            assert!(matches!(
                playing.apply(&mutation, 1),
                Err(SyncError::InvalidMutation(_))
            ));
        }
        let louder = playing
            .apply(&SessionMutation::SetVolume { volume: 80 }, 1)
            .expect("volume changes while playing");
        assert_eq!(louder.volume, 80);
    }

    #[test]
    fn changing_duration_while_paused_resets_progress() {
        let paused = SessionState::default()
            .apply(&SessionMutation::Play, 0)
            .and_then(|s| s.apply(&SessionMutation::Pause, 60_000))
            .expect("play then pause");
        let longer = paused
            .apply(&SessionMutation::SetDuration { minutes: 20 }, 61_000)
            .expect("set duration");
        assert_eq!(longer.elapsed_before_ms, 0);
        assert_eq!(longer.remaining_ms(0), 20 * 60_000);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let idle = SessionState::default();
        assert!(idle
            .apply(&SessionMutation::SetVolume { volume: 101 }, 0)
            .is_err());
        assert!(idle
            .apply(&SessionMutation::SetDuration { minutes: 0 }, 0)
            .is_err());
        let mut broken = idle.clone();
        broken.is_playing = true;
        assert!(matches!(
            broken.validate(),
            Err(SyncError::MalformedMessage(_))
        ));
    }

    #[test]
    fn stage_bumps_lamport_sequence_past_received() {
        let mut store = StateStore::new();
        let first = store
            .stage(&SessionMutation::SetVolume { volume: 10 }, &host(), 5)
            .expect("stage");
        assert_eq!(first.revision.seq, 1);
        assert_eq!(store.state().volume, 50, "staging does not apply");
        assert!(store.revision().is_none());
        let retry = store
            .stage(&SessionMutation::SetVolume { volume: 10 }, &host(), 6)
            .expect("stage again");
        assert_eq!(retry.revision.seq, 2, "issued sequences never repeat");

        let mut follower = StateStore::new();
        follower.receive(first.clone()).expect("receive");
        let remote = StateSnapshot {
            state: first.state.clone(),
            revision: Revision {
                seq: 7,
                issued_at_ms: 1,
                issuer: "other".into(),
            },
        };
        follower.receive(remote).expect("newer seq applies");
        let next = follower
            .stage(&SessionMutation::Stop, &"follower".into(), 2)
            .expect("stage");
        assert_eq!(next.revision.seq, 8);
    }

    #[test]
    fn receive_is_idempotent_and_discards_older() {
        let mut host_store = StateStore::new();
        let older = host_store
            .stage(&SessionMutation::Play, &host(), 1_000)
            .expect("play");
        host_store.receive(older.clone()).expect("host applies own play");
        let newer = host_store
            .stage(&SessionMutation::Pause, &host(), 2_000)
            .expect("pause");
        assert_eq!(newer.state.elapsed_before_ms, 1_000);

        let mut peer = StateStore::new();
        assert_eq!(peer.receive(newer.clone()).expect("apply"), ApplyOutcome::Applied);
        assert_eq!(
            peer.receive(newer.clone()).expect("dup"),
            ApplyOutcome::Duplicate
        );
        assert!(matches!(
            peer.receive(older),
            Err(SyncError::StaleState { .. })
        ));
        assert_eq!(peer.state(), &newer.state);
    }

    #[test]
    fn concurrent_hosts_resolve_by_revision_order() {
        let base = SessionState::default();
        let a = StateSnapshot {
            state: base.apply(&SessionMutation::SetVolume { volume: 20 }, 0).expect("a"),
            revision: Revision {
                seq: 3,
                issued_at_ms: 100,
                issuer: "a".into(),
            },
        };
        let b = StateSnapshot {
            state: base.apply(&SessionMutation::SetVolume { volume: 70 }, 0).expect("b"),
            revision: Revision {
                seq: 3,
                issued_at_ms: 150,
                issuer: "b".into(),
            },
        };
        let mut one = StateStore::new();
        one.receive(a.clone()).expect("a first");
        one.receive(b.clone()).expect("b fresher");
        let mut two = StateStore::new();
        two.receive(b.clone()).expect("b first");
        assert!(two.receive(a).is_err());
        assert_eq!(one.state(), two.state());
        assert_eq!(one.state().volume, 70);
    }
}
