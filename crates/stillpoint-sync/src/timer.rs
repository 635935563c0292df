//! Countdown derived from the shared start epoch.
//!
//! The engine never decrements a counter. Every sample recomputes
//! `budget - (now - epoch)`, so a late tick or a blocked event loop costs
//! nothing: the next sample is exact again.

use tracing::debug;

use crate::state::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    Idle,
    Running,
    Paused,
    Completed,
}

/// Emitted once per `Running -> Completed` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub epoch_ms: u64,
}

#[derive(Debug)]
pub struct TimerEngine {
    phase: TimerPhase,
    epoch_ms: Option<u64>,
    budget_ms: u64,
    completed_epoch: Option<u64>,
    frozen_ms: Option<u64>,
}

impl Default for TimerEngine {
    fn default() -> Self {
        Self::new(&SessionState::default())
    }
}

impl TimerEngine {
    pub fn new(state: &SessionState) -> Self {
        Self {
            phase: TimerPhase::Idle,
            epoch_ms: None,
            budget_ms: state.duration_ms().saturating_sub(state.elapsed_before_ms),
            completed_epoch: None,
            frozen_ms: None,
        }
    }

    pub fn phase(&self) -> TimerPhase {
        self.phase
    }

    /// Re-derive the timer from a freshly applied state.
    ///
    /// Returns a completion when a run this engine was already counting down
    /// turns out to be over, e.g. after a long stall. A run that had already
    /// finished before this engine first saw it (a peer joining after the
    /// end) settles into `Completed` without a completion: that peer never
    /// sat through the countdown.
    pub fn arm(&mut self, state: &SessionState, now_ms: u64) -> Option<Completion> {
        self.budget_ms = state.duration_ms().saturating_sub(state.elapsed_before_ms);
        match (state.is_playing, state.synchronized_start_ms) {
            (true, Some(epoch)) => {
                let watched = self.phase == TimerPhase::Running && self.epoch_ms == Some(epoch);
                self.epoch_ms = Some(epoch);
                if self.completed_epoch == Some(epoch) {
                    self.phase = TimerPhase::Completed;
                    return None;
                }
                self.phase = TimerPhase::Running;
                if !watched && self.remaining_ms(now_ms) == 0 {
                    self.phase = TimerPhase::Completed;
                    self.completed_epoch = Some(epoch);
                    debug!(
                        target = "stillpoint.sync",
                        epoch_ms = epoch,
                        "run finished before it was observed"
                    );
                    return None;
                }
                self.tick(now_ms)
            }
            _ => {
                self.epoch_ms = None;
                self.phase = if state.elapsed_before_ms > 0 {
                    TimerPhase::Paused
                } else {
                    TimerPhase::Idle
                };
                None
            }
        }
    }

    pub fn tick(&mut self, now_ms: u64) -> Option<Completion> {
        if self.phase != TimerPhase::Running || self.frozen_ms.is_some() {
            return None;
        }
        let epoch = self.epoch_ms?;
        if self.remaining_ms(now_ms) > 0 || self.completed_epoch == Some(epoch) {
            return None;
        }
        self.phase = TimerPhase::Completed;
        self.completed_epoch = Some(epoch);
        debug!(target = "stillpoint.sync", epoch_ms = epoch, "countdown completed");
        Some(Completion { epoch_ms: epoch })
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        if let Some(frozen) = self.frozen_ms {
            return frozen;
        }
        match (self.phase, self.epoch_ms) {
            (TimerPhase::Completed, _) => 0,
            (TimerPhase::Running, Some(epoch)) => {
                self.budget_ms.saturating_sub(now_ms.saturating_sub(epoch))
            }
            _ => self.budget_ms,
        }
    }

    pub fn remaining_seconds(&self, now_ms: u64) -> f64 {
        self.remaining_ms(now_ms) as f64 / 1_000.0
    }

    /// Hold the displayed value while the relay is unreachable.
    pub fn freeze(&mut self, now_ms: u64) {
        if self.frozen_ms.is_none() {
            self.frozen_ms = Some(self.remaining_ms(now_ms));
        }
    }

    pub fn thaw(&mut self) {
        self.frozen_ms = None;
    }

    /// Stop for good; later ticks are no-ops until re-armed.
    pub fn stop(&mut self) {
        self.phase = TimerPhase::Idle;
        self.epoch_ms = None;
        self.frozen_ms = None;
    }
}
