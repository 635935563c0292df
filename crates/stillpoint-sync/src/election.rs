use crate::participant::{Participant, ParticipantId};

/// Pick the session host: earliest `joined_at_ms`, ties broken by the
/// lexicographically smallest identity. `None` for an empty roster.
///
/// Every peer that observes the same roster computes the same host, so the
/// result must be recomputed after each roster change and never cached
/// across one.
pub fn elect<'a, I>(roster: I) -> Option<ParticipantId>
where
    I: IntoIterator<Item = &'a Participant>,
{
    roster
        .into_iter()
        .min_by(|a, b| {
            a.joined_at_ms
                .cmp(&b.joined_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|p| p.id.clone())
}
