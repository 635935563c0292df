//! Per-session state machine tying presence, election, state and timer
//! together. It performs no I/O beyond non-blocking relay calls, so the
//! runner can drive it from a single task and tests can drive it directly.

use std::sync::Arc;

use stillpoint_relay::{BroadcastEvent, PresenceEvent, Relay, RelayEvent, RelayHandle};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::election::elect;
use crate::error::{SyncError, SyncResult};
use crate::heartbeat::Heartbeat;
use crate::participant::{Participant, ParticipantId, ParticipantStatus, PresenceMeta};
use crate::presence::{PresenceTracker, RosterChange};
use crate::protocol::{
    self, Inbound, Relinquish, StateRequest, KIND_RELINQUISH, KIND_SESSION_STATE,
    KIND_STATE_REQUEST,
};
use crate::state::{ApplyOutcome, SessionMutation, SessionState, StateSnapshot, StateStore};
use crate::timer::{Completion, TimerEngine, TimerPhase};

/// Everything a UI layer may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    RosterChanged(Vec<Participant>),
    HostChanged {
        host: Option<ParticipantId>,
        local_is_host: bool,
    },
    StateApplied(StateSnapshot),
    Completed(Completion),
    Reconnecting,
    Reconnected,
    Left,
}

pub struct SessionContext {
    session_id: String,
    topic: String,
    local: ParticipantId,
    relay: Arc<dyn Relay>,
    clock: Arc<dyn Clock>,
    handle: Option<RelayHandle>,
    presence: PresenceTracker,
    store: StateStore,
    timer: TimerEngine,
    heartbeat: Heartbeat,
    host: Option<ParticipantId>,
    lost: bool,
    left: bool,
    notices: broadcast::Sender<SessionNotice>,
}

impl SessionContext {
    pub fn new(
        session_id: &str,
        local: PresenceMeta,
        relay: Arc<dyn Relay>,
        clock: Arc<dyn Clock>,
        config: &SyncConfig,
    ) -> Self {
        let (notices, _) = broadcast::channel(config.notice_buffer.max(1));
        let store = StateStore::new();
        let timer = TimerEngine::new(store.state());
        Self {
            session_id: session_id.to_string(),
            topic: protocol::session_topic(session_id),
            local: local.id.clone(),
            relay,
            clock,
            handle: None,
            presence: PresenceTracker::new(),
            store,
            timer,
            heartbeat: Heartbeat::new(local, config),
            host: None,
            lost: false,
            left: false,
            notices,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local
    }

    pub fn relay(&self) -> Arc<dyn Relay> {
        Arc::clone(&self.relay)
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    pub fn relay_handle(&self) -> Option<&RelayHandle> {
        self.handle.as_ref()
    }

    pub fn has_left(&self) -> bool {
        self.left
    }

    pub fn host(&self) -> Option<&ParticipantId> {
        self.host.as_ref()
    }

    pub fn is_local_host(&self) -> bool {
        self.host.as_ref() == Some(&self.local)
    }

    pub fn roster(&self) -> Vec<Participant> {
        self.presence.roster()
    }

    pub fn session_state(&self) -> SessionState {
        self.store.state().clone()
    }

    pub fn snapshot(&self) -> Option<StateSnapshot> {
        self.store.snapshot()
    }

    pub fn timer_phase(&self) -> TimerPhase {
        self.timer.phase()
    }

    pub fn remaining_seconds(&self) -> f64 {
        self.timer.remaining_seconds(self.clock.now_ms())
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    /// Bind to a fresh relay subscription: announce presence and ask peers
    /// for the current state.
    pub fn attach(&mut self, handle: RelayHandle) -> SyncResult<()> {
        if self.left {
            return Err(SyncError::PresenceLost);
        }
        self.heartbeat.announce(self.relay.as_ref(), &handle)?;
        let request = protocol::encode(&StateRequest {
            from: self.local.clone(),
        })?;
        self.relay.publish(&handle, KIND_STATE_REQUEST, request)?;
        self.handle = Some(handle);
        self.timer.thaw();
        if std::mem::take(&mut self.lost) {
            info!(
                target = "stillpoint.sync",
                session = %self.session_id,
                participant = %self.local,
                "presence restored"
            );
            self.notify(SessionNotice::Reconnected);
        }
        Ok(())
    }

    /// Relay connection dropped. Keep the last known state, freeze the
    /// countdown display and wait for [`SessionContext::attach`].
    pub fn presence_lost(&mut self) {
        if self.left || self.lost {
            return;
        }
        warn!(
            target = "stillpoint.sync",
            session = %self.session_id,
            participant = %self.local,
            "presence lost; freezing countdown"
        );
        self.handle = None;
        self.lost = true;
        self.timer.freeze(self.clock.now_ms());
        self.notify(SessionNotice::Reconnecting);
    }

    pub fn handle_event(&mut self, event: RelayEvent) -> SyncResult<()> {
        if self.left {
            return Ok(());
        }
        match event {
            RelayEvent::Presence(ev) => {
                self.on_presence(&ev);
                Ok(())
            }
            RelayEvent::Broadcast(ev) => self.on_broadcast(&ev),
        }
    }

    fn on_presence(&mut self, event: &PresenceEvent) {
        let change = self.presence.apply(event, self.clock.now_ms());
        if change.malformed > 0 {
            debug!(
                target = "stillpoint.sync",
                kind = event.kind.as_str(),
                malformed = change.malformed,
                "presence event carried malformed entries"
            );
        }
        self.after_roster_change(&change);
    }

    fn on_broadcast(&mut self, event: &BroadcastEvent) -> SyncResult<()> {
        match Inbound::decode(event)? {
            Inbound::State(snapshot) => self.receive(snapshot).map(|_| ()),
            Inbound::StateRequest(request) => self.answer_state_request(&request),
            Inbound::Relinquish(Relinquish { id }) => {
                info!(
                    target = "stillpoint.sync",
                    session = %self.session_id,
                    participant = %id,
                    "host relinquished"
                );
                if self.presence.remove(&id) {
                    self.after_roster_change(&RosterChange {
                        left: vec![id],
                        ..RosterChange::default()
                    });
                }
                Ok(())
            }
        }
    }

    /// Apply a snapshot from the relay (our own echoes included).
    pub fn receive(&mut self, snapshot: StateSnapshot) -> SyncResult<ApplyOutcome> {
        let outcome = self.store.receive(snapshot)?;
        if outcome == ApplyOutcome::Applied {
            let now = self.clock.now_ms();
            let completion = self.timer.arm(self.store.state(), now);
            if let Some(snapshot) = self.store.snapshot() {
                self.notify(SessionNotice::StateApplied(snapshot));
            }
            if let Some(completion) = completion {
                self.notify(SessionNotice::Completed(completion));
            }
        }
        Ok(outcome)
    }

    /// Host-only: apply `mutation` and broadcast the resulting snapshot.
    /// Rejected locally, with no relay traffic, for everyone else.
    pub fn propose(&mut self, mutation: SessionMutation) -> SyncResult<StateSnapshot> {
        if !self.is_local_host() {
            debug!(
                target = "stillpoint.sync",
                participant = %self.local,
                host = ?self.host,
                ?mutation,
                "rejecting proposal from non-host"
            );
            return Err(SyncError::NotAuthorized {
                local: self.local.clone(),
                host: self.host.clone(),
            });
        }
        let handle = self.handle.clone().ok_or(SyncError::PresenceLost)?;
        let snapshot = self
            .store
            .stage(&mutation, &self.local, self.clock.now_ms())?;
        let payload = protocol::encode(&snapshot)?;
        self.relay.publish(&handle, KIND_SESSION_STATE, payload)?;
        self.receive(snapshot.clone())?;
        debug!(
            target = "stillpoint.sync",
            revision = %snapshot.revision,
            ?mutation,
            "broadcast session state"
        );
        Ok(snapshot)
    }

    /// Any peer holding a snapshot answers, not just the host. A host that
    /// was swept while disconnected is re-elected on return and must learn
    /// the interim host's revisions before it writes again. Extra answers
    /// land as duplicates.
    fn answer_state_request(&mut self, request: &StateRequest) -> SyncResult<()> {
        if request.from == self.local {
            return Ok(());
        }
        let (Some(handle), Some(snapshot)) = (self.handle.as_ref(), self.store.snapshot()) else {
            return Ok(());
        };
        debug!(
            target = "stillpoint.sync",
            requester = %request.from,
            revision = %snapshot.revision,
            "answering state request"
        );
        let payload = protocol::encode(&snapshot)?;
        self.relay.publish(handle, KIND_SESSION_STATE, payload)?;
        Ok(())
    }

    pub fn tick(&mut self) -> Option<Completion> {
        let completion = self.timer.tick(self.clock.now_ms());
        if let Some(completion) = completion {
            info!(
                target = "stillpoint.sync",
                session = %self.session_id,
                epoch_ms = completion.epoch_ms,
                "session countdown complete"
            );
            self.notify(SessionNotice::Completed(completion));
        }
        completion
    }

    pub fn beat(&mut self) -> SyncResult<()> {
        let Some(handle) = self.handle.as_ref() else {
            return Ok(());
        };
        self.heartbeat.announce(self.relay.as_ref(), handle)
    }

    /// Remove participants whose heartbeats stopped; re-elect if needed.
    pub fn sweep(&mut self) -> Vec<ParticipantId> {
        let now = self.clock.now_ms();
        let heartbeat = &self.heartbeat;
        let expired = self
            .presence
            .expire_silent(&self.local, |last_seen| heartbeat.is_expired(last_seen, now));
        if !expired.is_empty() {
            self.after_roster_change(&RosterChange {
                left: expired.clone(),
                ..RosterChange::default()
            });
        }
        expired
    }

    pub fn set_status(&mut self, status: ParticipantStatus) -> SyncResult<()> {
        if self.heartbeat.set_status(status) {
            self.beat()?;
        }
        Ok(())
    }

    /// Leave the session: stop the timer, hand off hosting if we hold it and
    /// unsubscribe so peers converge without waiting for a timeout.
    pub fn leave(&mut self) -> SyncResult<()> {
        if self.left {
            return Ok(());
        }
        self.left = true;
        self.timer.stop();
        let result = match self.handle.take() {
            Some(handle) => self.release(&handle),
            None => Ok(()),
        };
        info!(
            target = "stillpoint.sync",
            session = %self.session_id,
            participant = %self.local,
            "left session"
        );
        self.notify(SessionNotice::Left);
        result
    }

    fn release(&mut self, handle: &RelayHandle) -> SyncResult<()> {
        if self.is_local_host() {
            let payload = protocol::encode(&Relinquish {
                id: self.local.clone(),
            })?;
            if let Err(err) = self.relay.publish(handle, KIND_RELINQUISH, payload) {
                warn!(target = "stillpoint.sync", error = %err, "failed to publish relinquish");
            }
        }
        self.relay.unsubscribe(handle)?;
        Ok(())
    }

    fn after_roster_change(&mut self, change: &RosterChange) {
        if change.is_empty() {
            return;
        }
        self.notify(SessionNotice::RosterChanged(self.presence.roster()));
        let host = elect(self.presence.participants());
        if host != self.host {
            info!(
                target = "stillpoint.sync",
                session = %self.session_id,
                previous = ?self.host,
                host = ?host,
                local = %self.local,
                "host changed"
            );
            self.host = host;
            self.notify(SessionNotice::HostChanged {
                host: self.host.clone(),
                local_is_host: self.is_local_host(),
            });
        }
    }

    fn notify(&self, notice: SessionNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use stillpoint_relay::{LocalRelay, Subscription};

    const SESSION: &str = "ctx";

    fn meta(id: &str, joined_at_ms: u64) -> PresenceMeta {
        PresenceMeta {
            id: id.into(),
            display_name: id.to_string(),
            joined_at_ms,
            status: ParticipantStatus::Active,
        }
    }

    struct Peer {
        ctx: SessionContext,
        sub: Subscription,
    }

    impl Peer {
        fn join(relay: &Arc<LocalRelay>, clock: &ManualClock, id: &str) -> Self {
            let mut ctx = SessionContext::new(
                SESSION,
                meta(id, clock.now_ms()),
                relay.clone(),
                Arc::new(clock.clone()),
                &SyncConfig::default(),
            );
            let sub = relay
                .subscribe(ctx.topic(), id)
                .expect("subscribe");
            ctx.attach(sub.handle.clone()).expect("attach");
            Self { ctx, sub }
        }

        /// Feed every queued relay event into the context.
        fn pump(&mut self) -> Vec<SyncError> {
            let mut errors = Vec::new();
            while let Ok(event) = self.sub.events.try_recv() {
                if let Err(err) = self.ctx.handle_event(event) {
                    errors.push(err);
                }
            }
            errors
        }
    }

    #[test]
    fn first_joiner_hosts_and_broadcasts() {
        let relay = Arc::new(LocalRelay::new());
        let clock = ManualClock::new(1_000);
        let mut a = Peer::join(&relay, &clock, "a");
        a.pump();
        assert!(a.ctx.is_local_host());

        clock.advance(5_000);
        let mut b = Peer::join(&relay, &clock, "b");
        a.pump();
        b.pump();
        assert!(a.ctx.is_local_host());
        assert!(!b.ctx.is_local_host());
        assert_eq!(b.ctx.host(), Some(&ParticipantId::new("a")));

        let snapshot = a.ctx.propose(SessionMutation::Play).expect("host proposes");
        assert_eq!(snapshot.state.synchronized_start_ms, Some(6_000));
        b.pump();
        assert_eq!(b.ctx.session_state(), a.ctx.session_state());
    }

    #[test]
    fn non_host_proposal_never_reaches_relay() {
        let relay = Arc::new(LocalRelay::new());
        let clock = ManualClock::new(0);
        let mut a = Peer::join(&relay, &clock, "a");
        clock.advance(10);
        let mut b = Peer::join(&relay, &clock, "b");
        a.pump();
        b.pump();

        let before = relay.published(b.ctx.topic());
        let err = b
            .ctx
            .propose(SessionMutation::SetVolume { volume: 3 })
            .expect_err("non-host rejected");
        assert!(matches!(err, SyncError::NotAuthorized { .. }));
        assert_eq!(relay.published(b.ctx.topic()), before);
        assert_eq!(b.ctx.session_state().volume, 50);
    }

    #[test]
    fn late_joiner_pulls_current_state() {
        let relay = Arc::new(LocalRelay::new());
        let clock = ManualClock::new(0);
        let mut a = Peer::join(&relay, &clock, "a");
        a.pump();
        a.ctx
            .propose(SessionMutation::SetDuration { minutes: 20 })
            .expect("set duration");
        a.ctx.propose(SessionMutation::Play).expect("play");
        a.pump();

        clock.advance(60_000);
        let mut c = Peer::join(&relay, &clock, "c");
        // a sees c's state request and answers it.
        a.pump();
        c.pump();
        assert_eq!(c.ctx.session_state().duration_minutes, 20);
        assert!(c.ctx.session_state().is_playing);
        assert!((c.ctx.remaining_seconds() - 1_140.0).abs() < 1e-9);
    }

    #[test]
    fn relinquish_hands_host_to_next_joiner() {
        let relay = Arc::new(LocalRelay::new());
        let clock = ManualClock::new(0);
        let mut a = Peer::join(&relay, &clock, "a");
        clock.advance(1);
        let mut b = Peer::join(&relay, &clock, "b");
        a.pump();
        b.pump();
        let mut notices = b.ctx.subscribe_notices();

        a.ctx.leave().expect("leave");
        assert!(a.ctx.has_left());
        b.pump();
        assert!(b.ctx.is_local_host());
        assert_eq!(b.ctx.roster().len(), 1);

        let mut saw_host_change = false;
        while let Ok(notice) = notices.try_recv() {
            if let SessionNotice::HostChanged { local_is_host, .. } = notice {
                saw_host_change |= local_is_host;
            }
        }
        assert!(saw_host_change);
        b.ctx
            .propose(SessionMutation::Play)
            .expect("new host proposes");
    }

    #[test]
    fn stale_and_malformed_broadcasts_are_reported_not_applied() {
        let relay = Arc::new(LocalRelay::new());
        let clock = ManualClock::new(0);
        let mut a = Peer::join(&relay, &clock, "a");
        clock.advance(1);
        let mut b = Peer::join(&relay, &clock, "b");
        a.pump();
        b.pump();

        let first = a.ctx.propose(SessionMutation::Play).expect("play");
        a.ctx.propose(SessionMutation::Pause).expect("pause");
        b.pump();

        // Re-deliver the older snapshot out of order.
        relay
            .publish(
                &a.sub.handle,
                KIND_SESSION_STATE,
                protocol::encode(&first).expect("encode"),
            )
            .expect("publish");
        relay
            .publish(&a.sub.handle, "bogus", bytes::Bytes::from_static(b"{}"))
            .expect("publish");
        let errors = b.pump();
        assert!(matches!(errors[0], SyncError::StaleState { .. }));
        assert!(matches!(errors[1], SyncError::MalformedMessage(_)));
        assert!(!b.ctx.session_state().is_playing);
    }

    #[test]
    fn presence_lost_freezes_then_resumes_on_attach() {
        let relay = Arc::new(LocalRelay::new());
        let clock = ManualClock::new(0);
        let mut a = Peer::join(&relay, &clock, "a");
        a.pump();
        a.ctx.propose(SessionMutation::Play).expect("play");
        a.pump();

        clock.advance(10_000);
        a.ctx.presence_lost();
        assert!(!a.ctx.is_connected());
        clock.advance(20_000);
        assert!((a.ctx.remaining_seconds() - 590.0).abs() < 1e-9);
        assert!(matches!(
            a.ctx.propose(SessionMutation::Pause),
            Err(SyncError::PresenceLost)
        ));

        let sub = relay.subscribe(a.ctx.topic(), "a").expect("resubscribe");
        a.ctx.attach(sub.handle.clone()).expect("reattach");
        a.sub = sub;
        a.pump();
        assert!((a.ctx.remaining_seconds() - 570.0).abs() < 1e-9);
    }

    #[test]
    fn silent_peer_is_swept_and_host_reelected() {
        let relay = Arc::new(LocalRelay::new());
        let clock = ManualClock::new(0);
        let mut a = Peer::join(&relay, &clock, "a");
        clock.advance(1);
        let mut b = Peer::join(&relay, &clock, "b");
        a.pump();
        b.pump();
        assert_eq!(b.ctx.host(), Some(&ParticipantId::new("a")));

        // a goes quiet; b keeps beating.
        relay.sever(&a.sub.handle);
        clock.advance(b.ctx.heartbeat().grace_ms() + 1);
        b.ctx.beat().expect("beat");
        b.pump();
        assert_eq!(b.ctx.sweep(), vec![ParticipantId::new("a")]);
        assert!(b.ctx.is_local_host());
    }

    #[test]
    fn swept_host_catches_up_before_writing_again() {
        let relay = Arc::new(LocalRelay::new());
        let clock = ManualClock::new(0);
        let mut a = Peer::join(&relay, &clock, "a");
        clock.advance(1);
        let mut b = Peer::join(&relay, &clock, "b");
        a.pump();
        b.pump();
        a.ctx
            .propose(SessionMutation::SetVolume { volume: 10 })
            .expect("a writes");
        b.pump();

        // a drops silently and b takes over after the grace period.
        relay.sever(&a.sub.handle);
        a.ctx.presence_lost();
        clock.advance(b.ctx.heartbeat().grace_ms() + 1);
        b.ctx.beat().expect("beat");
        b.pump();
        assert_eq!(b.ctx.sweep(), vec![ParticipantId::new("a")]);
        assert!(b.ctx.is_local_host());
        b.ctx
            .propose(SessionMutation::SetVolume { volume: 20 })
            .expect("b writes");
        b.ctx
            .propose(SessionMutation::SetVolume { volume: 30 })
            .expect("b writes again");
        b.pump();

        // a returns with the earlier join stamp and is host again.
        let sub = relay.subscribe(a.ctx.topic(), "a").expect("resubscribe");
        a.ctx.attach(sub.handle.clone()).expect("reattach");
        a.sub = sub;
        assert!(b.pump().is_empty());
        assert_eq!(b.ctx.host(), Some(&ParticipantId::new("a")));
        assert!(a.pump().is_empty());
        assert!(a.ctx.is_local_host());
        assert_eq!(a.ctx.session_state().volume, 30);

        let write = a
            .ctx
            .propose(SessionMutation::SetVolume { volume: 40 })
            .expect("returning host writes");
        assert_eq!(write.revision.seq, 4);
        assert!(b.pump().is_empty());
        assert_eq!(b.ctx.session_state(), a.ctx.session_state());
        assert_eq!(b.ctx.session_state().volume, 40);
    }

    #[test]
    fn completion_notice_fires_once() {
        let relay = Arc::new(LocalRelay::new());
        let clock = ManualClock::new(0);
        let mut a = Peer::join(&relay, &clock, "a");
        a.pump();
        a.ctx
            .propose(SessionMutation::SetDuration { minutes: 1 })
            .expect("duration");
        a.ctx.propose(SessionMutation::Play).expect("play");
        let mut notices = a.ctx.subscribe_notices();
        let mut completions = 0;
        for _ in 0..200 {
            clock.advance(500);
            if a.ctx.tick().is_some() {
                completions += 1;
            }
            a.pump();
        }
        assert_eq!(completions, 1);
        let mut completed_notices = 0;
        while let Ok(notice) = notices.try_recv() {
            if matches!(notice, SessionNotice::Completed(_)) {
                completed_notices += 1;
            }
        }
        assert_eq!(completed_notices, 1);
        assert_eq!(a.ctx.timer_phase(), TimerPhase::Completed);
    }
}
