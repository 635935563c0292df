use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque participant identity. Ordered lexicographically, which the host
/// elector relies on for tie-breaks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    #[default]
    Active,
    Listening,
    Away,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub joined_at_ms: u64,
    pub status: ParticipantStatus,
    /// Local receipt time of the last join/heartbeat for this participant.
    pub last_seen_ms: u64,
}

/// Presence meta as carried by the relay. This is what `track` publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub id: ParticipantId,
    pub display_name: String,
    pub joined_at_ms: u64,
    #[serde(default)]
    pub status: ParticipantStatus,
}

/// Lenient view of inbound presence meta; anything may be missing.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawPresenceMeta {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub joined_at_ms: Option<u64>,
    #[serde(default)]
    pub status: Option<ParticipantStatus>,
}

impl RawPresenceMeta {
    /// `None` when the entry lacks an identity or a join stamp.
    pub(crate) fn into_participant(self, seen_at_ms: u64) -> Option<Participant> {
        let id = self.id.filter(|id| !id.trim().is_empty())?;
        let joined_at_ms = self.joined_at_ms?;
        Some(Participant {
            display_name: self.display_name.unwrap_or_else(|| id.clone()),
            id: ParticipantId(id),
            joined_at_ms,
            status: self.status.unwrap_or_default(),
            last_seen_ms: seen_at_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawPresenceMeta {
        serde_json::from_value(value).expect("lenient meta parses")
    }

    #[test]
    fn meta_round_trips_through_raw() {
        let meta = PresenceMeta {
            id: "ana".into(),
            display_name: "Ana".into(),
            joined_at_ms: 42,
            status: ParticipantStatus::Listening,
        };
        let value = serde_json::to_value(&meta).expect("encode");
        assert_eq!(value["status"], "listening");
        let participant = raw(value).into_participant(100).expect("valid");
        assert_eq!(participant.id, ParticipantId::new("ana"));
        assert_eq!(participant.joined_at_ms, 42);
        assert_eq!(participant.last_seen_ms, 100);
    }

    #[test]
    fn missing_id_or_join_stamp_is_rejected() {
        assert!(raw(json!({"joined_at_ms": 1})).into_participant(0).is_none());
        assert!(raw(json!({"id": "  ", "joined_at_ms": 1})).into_participant(0).is_none());
        assert!(raw(json!({"id": "ana"})).into_participant(0).is_none());
    }

    #[test]
    fn display_name_defaults_to_id() {
        let p = raw(json!({"id": "bo", "joined_at_ms": 7}))
            .into_participant(0)
            .expect("valid");
        assert_eq!(p.display_name, "bo");
        assert_eq!(p.status, ParticipantStatus::Active);
    }
}
