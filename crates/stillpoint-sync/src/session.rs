use std::sync::Arc;

use parking_lot::Mutex;
use stillpoint_relay::{Relay, RelayEvent, RelayHandle};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::context::{SessionContext, SessionNotice};
use crate::error::{SyncError, SyncResult};
use crate::participant::{Participant, ParticipantId, ParticipantStatus, PresenceMeta};
use crate::state::{SessionMutation, SessionState, StateSnapshot};
use crate::timer::Completion;

/// UI-facing handle to one joined session.
///
/// A single runner task owns the relay subscription and drives the
/// [`SessionContext`]: relay events, timer ticks, heartbeats and the
/// silent-peer sweep are all serialized through it. Queries and proposals
/// from the handle take the context lock briefly and never wait on I/O.
pub struct SessionHandle {
    ctx: Arc<Mutex<SessionContext>>,
    shutdown: Option<oneshot::Sender<()>>,
    runner: Option<JoinHandle<()>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionHandle {
    /// Subscribe to `session_id` on `relay` and start the runner. Must be
    /// called from within a tokio runtime.
    pub fn join(
        session_id: &str,
        local: PresenceMeta,
        relay: Arc<dyn Relay>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        let config = config.sanitized();
        let mut ctx = SessionContext::new(session_id, local, Arc::clone(&relay), clock, &config);
        let subscription = relay.subscribe(ctx.topic(), ctx.local_id().as_str())?;
        if let Err(err) = ctx.attach(subscription.handle.clone()) {
            let _ = relay.unsubscribe(&subscription.handle);
            return Err(err);
        }
        info!(
            target = "stillpoint.sync",
            session = %session_id,
            participant = %ctx.local_id(),
            "joined session"
        );
        let ctx = Arc::new(Mutex::new(ctx));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let runner = tokio::spawn(run(
            Arc::clone(&ctx),
            subscription.events,
            config,
            shutdown_rx,
        ));
        Ok(Self {
            ctx,
            shutdown: Some(shutdown_tx),
            runner: Some(runner),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn local_id(&self) -> ParticipantId {
        self.ctx.lock().local_id().clone()
    }

    pub fn remaining_seconds(&self) -> f64 {
        self.ctx.lock().remaining_seconds()
    }

    pub fn session_state(&self) -> SessionState {
        self.ctx.lock().session_state()
    }

    pub fn snapshot(&self) -> Option<StateSnapshot> {
        self.ctx.lock().snapshot()
    }

    pub fn is_local_host(&self) -> bool {
        self.ctx.lock().is_local_host()
    }

    pub fn host(&self) -> Option<ParticipantId> {
        self.ctx.lock().host().cloned()
    }

    pub fn roster(&self) -> Vec<Participant> {
        self.ctx.lock().roster()
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.lock().is_connected()
    }

    /// Current relay subscription, if connected.
    pub fn relay_handle(&self) -> Option<RelayHandle> {
        self.ctx.lock().relay_handle().cloned()
    }

    pub fn propose(&self, mutation: SessionMutation) -> SyncResult<StateSnapshot> {
        self.ctx.lock().propose(mutation)
    }

    pub fn set_status(&self, status: ParticipantStatus) -> SyncResult<()> {
        self.ctx.lock().set_status(status)
    }

    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.ctx.lock().subscribe_notices()
    }

    /// Invoke `callback` once per completed countdown.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: Fn(Completion) + Send + 'static,
    {
        self.listen(move |notice| {
            if let SessionNotice::Completed(completion) = notice {
                callback(completion);
            }
        });
    }

    /// Invoke `callback` with the join-ordered roster after every change.
    pub fn on_roster_change<F>(&self, callback: F)
    where
        F: Fn(Vec<Participant>) + Send + 'static,
    {
        self.listen(move |notice| {
            if let SessionNotice::RosterChanged(roster) = notice {
                callback(roster);
            }
        });
    }

    fn listen<F>(&self, mut handler: F)
    where
        F: FnMut(SessionNotice) + Send + 'static,
    {
        let mut rx = self.notices();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(notice) => handler(notice),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target = "stillpoint.sync", skipped, "notice listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.listeners.lock().push(task);
    }

    /// Stop the runner, relinquish hosting if held, unsubscribe and drop all
    /// callback listeners.
    pub async fn leave(mut self) -> SyncResult<()> {
        self.stop_runner().await;
        let result = self.ctx.lock().leave();
        self.abort_listeners();
        result
    }

    async fn stop_runner(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(runner) = self.runner.take() {
            if let Err(err) = runner.await {
                if !err.is_cancelled() {
                    warn!(target = "stillpoint.sync", error = %err, "session runner failed");
                }
            }
        }
    }

    fn abort_listeners(&self) {
        for task in self.listeners.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for SessionHandle {
    /// Dropping without `leave` behaves like a crash: no leave, no
    /// relinquish. Peers notice through missing heartbeats.
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(runner) = self.runner.take() {
            runner.abort();
        }
        self.abort_listeners();
    }
}

async fn run(
    ctx: Arc<Mutex<SessionContext>>,
    mut events: mpsc::Receiver<RelayEvent>,
    config: SyncConfig,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = interval(config.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // `attach` already announced us; the first beat is one interval out.
    let first_beat = Instant::now() + config.heartbeat_interval();
    let mut heartbeat = tokio::time::interval_at(first_beat, config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep = tokio::time::interval_at(first_beat, config.heartbeat_interval());
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Some(event) => dispatch(&ctx, event),
                None => {
                    ctx.lock().presence_lost();
                    match reconnect(&ctx, &config, &mut shutdown).await {
                        Some(next) => events = next,
                        None => break,
                    }
                }
            },
            _ = ticker.tick() => {
                ctx.lock().tick();
            }
            _ = heartbeat.tick() => {
                if let Err(err) = ctx.lock().beat() {
                    warn!(target = "stillpoint.sync", error = %err, "heartbeat failed");
                }
            }
            _ = sweep.tick() => {
                ctx.lock().sweep();
            }
        }
    }
    debug!(target = "stillpoint.sync", "session runner stopped");
}

fn dispatch(ctx: &Mutex<SessionContext>, event: RelayEvent) {
    let result = ctx.lock().handle_event(event);
    match result {
        Ok(()) => {}
        Err(err @ SyncError::StaleState { .. }) => {
            debug!(target = "stillpoint.sync", error = %err, "discarded stale state");
        }
        Err(err @ SyncError::MalformedMessage(_)) => {
            warn!(target = "stillpoint.sync", error = %err, "dropped malformed message");
        }
        Err(err) => {
            warn!(target = "stillpoint.sync", error = %err, "failed to handle relay event");
        }
    }
}

/// Resubscribe with exponential backoff until it works or we are told to
/// stop. `None` means shutdown was requested.
async fn reconnect(
    ctx: &Mutex<SessionContext>,
    config: &SyncConfig,
    shutdown: &mut oneshot::Receiver<()>,
) -> Option<mpsc::Receiver<RelayEvent>> {
    let mut attempt: u32 = 0;
    loop {
        let delay = config.reconnect_delay(attempt);
        tokio::select! {
            _ = &mut *shutdown => return None,
            _ = sleep(delay) => {}
        }
        attempt = attempt.saturating_add(1);

        let (relay, topic, identity) = {
            let guard = ctx.lock();
            (
                guard.relay(),
                guard.topic().to_string(),
                guard.local_id().to_string(),
            )
        };
        let subscription = match relay.subscribe(&topic, &identity) {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(target = "stillpoint.sync", attempt, error = %err, "resubscribe failed");
                continue;
            }
        };
        let attached = ctx.lock().attach(subscription.handle.clone());
        match attached {
            Ok(()) => {
                info!(target = "stillpoint.sync", attempt, topic = %topic, "resubscribed");
                return Some(subscription.events);
            }
            Err(err) => {
                warn!(target = "stillpoint.sync", attempt, error = %err, "reattach failed");
                let _ = relay.unsubscribe(&subscription.handle);
            }
        }
    }
}
