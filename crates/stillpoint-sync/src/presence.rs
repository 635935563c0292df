//! Live roster for one session, fed by relay presence events.

use std::collections::BTreeMap;

use stillpoint_relay::{PresenceEntry, PresenceEvent, PresenceKind};
use tracing::{debug, warn};

use crate::participant::{Participant, ParticipantId, RawPresenceMeta};

/// What a presence event did to the roster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterChange {
    pub joined: Vec<ParticipantId>,
    pub updated: Vec<ParticipantId>,
    pub left: Vec<ParticipantId>,
    pub malformed: usize,
}

impl RosterChange {
    /// Membership changed. Status-only updates do not count.
    pub fn membership_changed(&self) -> bool {
        !self.joined.is_empty() || !self.left.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.updated.is_empty() && self.left.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PresenceTracker {
    roster: BTreeMap<ParticipantId, Participant>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &PresenceEvent, now_ms: u64) -> RosterChange {
        match event.kind {
            PresenceKind::Sync => self.on_sync(&event.entries, now_ms),
            PresenceKind::Join => self.on_join(&event.entries, now_ms),
            PresenceKind::Leave => self.on_leave(&event.entries),
        }
    }

    /// Replace the roster with the relay's full view.
    pub fn on_sync(&mut self, entries: &[PresenceEntry], now_ms: u64) -> RosterChange {
        let (parsed, malformed) = parse_entries(entries, now_ms);
        let mut next: BTreeMap<ParticipantId, Participant> = BTreeMap::new();
        for participant in parsed {
            next.insert(participant.id.clone(), participant);
        }

        let mut change = RosterChange {
            malformed,
            ..RosterChange::default()
        };
        for (id, participant) in &next {
            match self.roster.get(id) {
                None => change.joined.push(id.clone()),
                Some(prev) if !same_presence(prev, participant) => change.updated.push(id.clone()),
                Some(_) => {}
            }
        }
        change.left = self
            .roster
            .keys()
            .filter(|id| !next.contains_key(*id))
            .cloned()
            .collect();
        self.roster = next;
        debug!(
            target = "stillpoint.sync",
            size = self.roster.len(),
            joined = change.joined.len(),
            left = change.left.len(),
            "presence sync"
        );
        change
    }

    /// Upsert entries; a repeated join is a heartbeat refresh.
    pub fn on_join(&mut self, entries: &[PresenceEntry], now_ms: u64) -> RosterChange {
        let (parsed, malformed) = parse_entries(entries, now_ms);
        let mut change = RosterChange {
            malformed,
            ..RosterChange::default()
        };
        for participant in parsed {
            let id = participant.id.clone();
            match self.roster.insert(id.clone(), participant) {
                None => change.joined.push(id),
                Some(prev) => {
                    let current = &self.roster[&id];
                    if !same_presence(&prev, current) {
                        change.updated.push(id);
                    }
                }
            }
        }
        change
    }

    pub fn on_leave(&mut self, entries: &[PresenceEntry]) -> RosterChange {
        let mut change = RosterChange::default();
        for entry in entries {
            let id = entry
                .meta
                .get("id")
                .and_then(|v| v.as_str())
                .filter(|id| !id.is_empty())
                .unwrap_or(entry.key.as_str());
            if id.is_empty() {
                change.malformed += 1;
                continue;
            }
            let id = ParticipantId::new(id);
            if self.roster.remove(&id).is_some() {
                change.left.push(id);
            }
        }
        change
    }

    pub fn remove(&mut self, id: &ParticipantId) -> bool {
        self.roster.remove(id).is_some()
    }

    /// Drop participants whose `last_seen_ms` fails `is_expired`. `keep` is
    /// never expired (the local participant cannot observe its own silence).
    pub fn expire_silent<F>(&mut self, keep: &ParticipantId, is_expired: F) -> Vec<ParticipantId>
    where
        F: Fn(u64) -> bool,
    {
        let expired: Vec<ParticipantId> = self
            .roster
            .values()
            .filter(|p| &p.id != keep && is_expired(p.last_seen_ms))
            .map(|p| p.id.clone())
            .collect();
        for id in &expired {
            self.roster.remove(id);
        }
        if !expired.is_empty() {
            debug!(
                target = "stillpoint.sync",
                expired = ?expired,
                "expired silent participants"
            );
        }
        expired
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.roster.get(id)
    }

    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.roster.values()
    }

    /// Roster ordered by join time, then identity.
    pub fn roster(&self) -> Vec<Participant> {
        let mut out: Vec<Participant> = self.roster.values().cloned().collect();
        out.sort_by(|a, b| {
            a.joined_at_ms
                .cmp(&b.joined_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }
}

fn same_presence(a: &Participant, b: &Participant) -> bool {
    a.display_name == b.display_name && a.joined_at_ms == b.joined_at_ms && a.status == b.status
}

fn parse_entries(entries: &[PresenceEntry], now_ms: u64) -> (Vec<Participant>, usize) {
    let mut malformed = 0;
    let mut parsed = Vec::with_capacity(entries.len());
    for entry in entries {
        let participant = serde_json::from_value::<RawPresenceMeta>(entry.meta.clone())
            .ok()
            .and_then(|raw| raw.into_participant(now_ms));
        match participant {
            Some(p) => parsed.push(p),
            None => {
                malformed += 1;
                warn!(
                    target = "stillpoint.sync",
                    key = %entry.key,
                    "dropping malformed presence entry"
                );
            }
        }
    }
    (parsed, malformed)
}
