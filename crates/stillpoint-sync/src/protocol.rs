//! Broadcast kinds exchanged over the relay and their JSON payloads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use stillpoint_relay::{BroadcastEvent, RelayError};

use crate::error::{SyncError, SyncResult};
use crate::participant::ParticipantId;
use crate::state::StateSnapshot;

pub const KIND_SESSION_STATE: &str = "session_state";
pub const KIND_STATE_REQUEST: &str = "state_request";
pub const KIND_RELINQUISH: &str = "relinquish";

pub fn session_topic(session_id: &str) -> String {
    format!("session:{session_id}")
}

/// Sent on subscribe so a late joiner does not wait for the next mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRequest {
    pub from: ParticipantId,
}

/// Sent by a host that is leaving on purpose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relinquish {
    pub id: ParticipantId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    State(StateSnapshot),
    StateRequest(StateRequest),
    Relinquish(Relinquish),
}

impl Inbound {
    pub fn decode(event: &BroadcastEvent) -> SyncResult<Self> {
        match event.kind.as_str() {
            KIND_SESSION_STATE => parse(&event.payload).map(Inbound::State),
            KIND_STATE_REQUEST => parse(&event.payload).map(Inbound::StateRequest),
            KIND_RELINQUISH => {
                let relinquish: Relinquish = parse(&event.payload)?;
                if relinquish.id.as_str() != event.from {
                    return Err(SyncError::MalformedMessage(format!(
                        "relinquish for {} sent by {}",
                        relinquish.id, event.from
                    )));
                }
                Ok(Inbound::Relinquish(relinquish))
            }
            other => Err(SyncError::MalformedMessage(format!(
                "unknown broadcast kind {other:?}"
            ))),
        }
    }
}

pub fn encode<T: Serialize>(payload: &T) -> SyncResult<Bytes> {
    serde_json::to_vec(payload)
        .map(Bytes::from)
        .map_err(|err| SyncError::Relay(RelayError::Encode(err.to_string())))
}

fn parse<T: serde::de::DeserializeOwned>(payload: &[u8]) -> SyncResult<T> {
    serde_json::from_slice(payload).map_err(|err| SyncError::MalformedMessage(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Revision, SessionState};

    fn event(kind: &str, from: &str, payload: Bytes) -> BroadcastEvent {
        BroadcastEvent {
            kind: kind.to_string(),
            from: from.to_string(),
            payload,
        }
    }

    #[test]
    fn decodes_state_snapshot() {
        let snapshot = StateSnapshot {
            state: SessionState::default(),
            revision: Revision {
                seq: 1,
                issued_at_ms: 10,
                issuer: "a".into(),
            },
        };
        let payload = encode(&snapshot).expect("encode");
        let wire: serde_json::Value = serde_json::from_slice(&payload).expect("json");
        assert_eq!(wire["state"]["practice"], "breathwork");
        assert_eq!(wire["revision"]["issuer"], "a");
        match Inbound::decode(&event(KIND_SESSION_STATE, "a", payload)).expect("decode") {
            Inbound::State(decoded) => assert_eq!(decoded, snapshot),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn relinquish_must_come_from_the_leaver() {
        let payload = encode(&Relinquish { id: "a".into() }).expect("encode");
        assert!(Inbound::decode(&event(KIND_RELINQUISH, "a", payload.clone())).is_ok());
        assert!(matches!(
            Inbound::decode(&event(KIND_RELINQUISH, "b", payload)),
            Err(SyncError::MalformedMessage(_))
        ));
    }

    #[test]
    fn garbage_and_unknown_kinds_are_malformed() {
        for ev in [
            event(KIND_SESSION_STATE, "a", Bytes::from_static(b"{not json")),
            event(KIND_STATE_REQUEST, "a", Bytes::from_static(b"{}")),
            event("chat", "a", Bytes::from_static(b"{}")),
        ] {
            assert!(matches!(
                Inbound::decode(&ev),
                Err(SyncError::MalformedMessage(_))
            ));
        }
    }

    #[test]
    fn topic_is_scoped_by_session() {
        assert_eq!(session_topic("abc"), "session:abc");
    }
}
