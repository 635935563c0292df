//! Relay contract consumed by the session engine, plus an in-process relay.
//!
//! A relay scopes everything by topic. Subscribers receive two kinds of
//! events on their private channel: presence changes (`sync`, `join`,
//! `leave`) and opaque broadcasts published by any subscriber of the topic,
//! the publisher included.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelayHandle {
    pub topic: String,
    pub identity: String,
    id: u64,
}

impl RelayHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Sync,
    Join,
    Leave,
}

impl PresenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceKind::Sync => "sync",
            PresenceKind::Join => "join",
            PresenceKind::Leave => "leave",
        }
    }
}

/// One tracked presence. `meta` is whatever the owner last passed to `track`.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub key: String,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEvent {
    pub kind: PresenceKind,
    pub entries: Vec<PresenceEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEvent {
    pub kind: String,
    pub from: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Presence(PresenceEvent),
    Broadcast(BroadcastEvent),
}

/// A live subscription. When `events` yields `None` the connection is gone.
#[derive(Debug)]
pub struct Subscription {
    pub handle: RelayHandle,
    pub events: mpsc::Receiver<RelayEvent>,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay channel closed")]
    Closed,
    #[error("unknown relay handle {0} on topic {1}")]
    UnknownHandle(u64, String),
    #[error("relay payload encoding failed: {0}")]
    Encode(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

pub trait Relay: Send + Sync {
    fn subscribe(&self, topic: &str, identity: &str) -> RelayResult<Subscription>;
    fn publish(&self, handle: &RelayHandle, kind: &str, payload: Bytes) -> RelayResult<()>;
    /// Announce or refresh the caller's presence entry.
    fn track(&self, handle: &RelayHandle, meta: serde_json::Value) -> RelayResult<()>;
    fn unsubscribe(&self, handle: &RelayHandle) -> RelayResult<()>;
}

struct Subscriber {
    identity: String,
    tx: mpsc::Sender<RelayEvent>,
}

struct PresenceRecord {
    meta: serde_json::Value,
    last_seen: Instant,
}

#[derive(Default)]
struct TopicState {
    subscribers: HashMap<u64, Subscriber>,
    presence: HashMap<String, PresenceRecord>,
    published: u64,
}

impl TopicState {
    fn fan_out(&mut self, topic: &str, event: RelayEvent) {
        self.subscribers.retain(|id, sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    target = "stillpoint.relay",
                    topic,
                    subscriber = id,
                    identity = %sub.identity,
                    "subscriber buffer full; dropping event"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn entry_for(&self, key: &str) -> Option<PresenceEntry> {
        self.presence.get(key).map(|record| PresenceEntry {
            key: key.to_string(),
            meta: record.meta.clone(),
        })
    }

    fn snapshot(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self
            .presence
            .iter()
            .map(|(key, record)| PresenceEntry {
                key: key.clone(),
                meta: record.meta.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }
}

/// In-memory relay for tests, simulations and single-process deployments.
pub struct LocalRelay {
    topics: parking_lot::RwLock<HashMap<String, TopicState>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::with_buffer(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            topics: parking_lot::RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Number of broadcasts accepted on `topic` so far.
    pub fn published(&self, topic: &str) -> u64 {
        self.topics
            .read()
            .get(topic)
            .map(|state| state.published)
            .unwrap_or(0)
    }

    pub fn presence(&self, topic: &str) -> Vec<PresenceEntry> {
        self.topics
            .read()
            .get(topic)
            .map(TopicState::snapshot)
            .unwrap_or_default()
    }

    /// Drop a subscriber's connection without a leave. Its presence entry
    /// lingers until [`LocalRelay::reap_stale`] notices the missing heartbeats.
    pub fn sever(&self, handle: &RelayHandle) -> bool {
        let mut guard = self.topics.write();
        let Some(state) = guard.get_mut(&handle.topic) else {
            return false;
        };
        let removed = state.subscribers.remove(&handle.id).is_some();
        if removed {
            debug!(
                target = "stillpoint.relay",
                topic = %handle.topic,
                identity = %handle.identity,
                "severed subscriber"
            );
        }
        removed
    }

    /// Remove presence entries not refreshed within `ttl` and announce them as
    /// leaves. Returns how many entries were removed.
    pub fn reap_stale(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut guard = self.topics.write();
        let mut removed = 0;
        for (topic, state) in guard.iter_mut() {
            let expired: Vec<String> = state
                .presence
                .iter()
                .filter(|(_, record)| now.saturating_duration_since(record.last_seen) > ttl)
                .map(|(key, _)| key.clone())
                .collect();
            if expired.is_empty() {
                continue;
            }
            let entries: Vec<PresenceEntry> = expired
                .iter()
                .filter_map(|key| {
                    let entry = state.entry_for(key);
                    state.presence.remove(key);
                    entry
                })
                .collect();
            removed += entries.len();
            debug!(
                target = "stillpoint.relay",
                topic = %topic,
                count = entries.len(),
                "reaped stale presence"
            );
            state.fan_out(
                topic,
                RelayEvent::Presence(PresenceEvent {
                    kind: PresenceKind::Leave,
                    entries,
                }),
            );
        }
        removed
    }

    /// Spawn a task that reaps stale presence every `every`.
    pub fn spawn_reaper(
        self: &std::sync::Arc<Self>,
        every: Duration,
        ttl: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let relay = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                relay.reap_stale(ttl);
            }
        })
    }
}

impl Relay for LocalRelay {
    fn subscribe(&self, topic: &str, identity: &str) -> RelayResult<Subscription> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.topics.write();
        let state = guard.entry(topic.to_string()).or_default();
        // New subscribers start from a full presence snapshot.
        tx.try_send(RelayEvent::Presence(PresenceEvent {
            kind: PresenceKind::Sync,
            entries: state.snapshot(),
        }))
        .map_err(|_| RelayError::Closed)?;
        state.subscribers.insert(
            id,
            Subscriber {
                identity: identity.to_string(),
                tx,
            },
        );
        Ok(Subscription {
            handle: RelayHandle {
                topic: topic.to_string(),
                identity: identity.to_string(),
                id,
            },
            events: rx,
        })
    }

    fn publish(&self, handle: &RelayHandle, kind: &str, payload: Bytes) -> RelayResult<()> {
        let mut guard = self.topics.write();
        let state = guard
            .get_mut(&handle.topic)
            .filter(|state| state.subscribers.contains_key(&handle.id))
            .ok_or_else(|| RelayError::UnknownHandle(handle.id, handle.topic.clone()))?;
        state.published += 1;
        state.fan_out(
            &handle.topic,
            RelayEvent::Broadcast(BroadcastEvent {
                kind: kind.to_string(),
                from: handle.identity.clone(),
                payload,
            }),
        );
        Ok(())
    }

    fn track(&self, handle: &RelayHandle, meta: serde_json::Value) -> RelayResult<()> {
        let mut guard = self.topics.write();
        let state = guard
            .get_mut(&handle.topic)
            .filter(|state| state.subscribers.contains_key(&handle.id))
            .ok_or_else(|| RelayError::UnknownHandle(handle.id, handle.topic.clone()))?;
        state.presence.insert(
            handle.identity.clone(),
            PresenceRecord {
                meta: meta.clone(),
                last_seen: Instant::now(),
            },
        );
        state.fan_out(
            &handle.topic,
            RelayEvent::Presence(PresenceEvent {
                kind: PresenceKind::Join,
                entries: vec![PresenceEntry {
                    key: handle.identity.clone(),
                    meta,
                }],
            }),
        );
        Ok(())
    }

    fn unsubscribe(&self, handle: &RelayHandle) -> RelayResult<()> {
        let mut guard = self.topics.write();
        let state = guard
            .get_mut(&handle.topic)
            .ok_or_else(|| RelayError::UnknownHandle(handle.id, handle.topic.clone()))?;
        if state.subscribers.remove(&handle.id).is_none() {
            return Err(RelayError::UnknownHandle(handle.id, handle.topic.clone()));
        }
        let still_connected = state
            .subscribers
            .values()
            .any(|sub| sub.identity == handle.identity);
        if still_connected {
            return Ok(());
        }
        if let Some(entry) = state.entry_for(&handle.identity) {
            state.presence.remove(&handle.identity);
            state.fan_out(
                &handle.topic,
                RelayEvent::Presence(PresenceEvent {
                    kind: PresenceKind::Leave,
                    entries: vec![entry],
                }),
            );
        }
        Ok(())
    }
}
