//! Property-based test generators using proptest.

use evsync_protocol::{Action, RawEvent, SyncStreamId};
use proptest::prelude::*;

/// Strategy for ids, including characters the stream key must escape.
pub fn arb_id() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9:%/_-]{1,12}"
}

/// Strategy for stream ids of every kind.
pub fn arb_stream_id() -> impl Strategy<Value = SyncStreamId> {
    prop_oneof![
        arb_id().prop_map(|user| SyncStreamId::core(user)),
        (arb_id(), arb_id(), 0u32..10)
            .prop_map(|(user, calendar, version)| SyncStreamId::calendar(user, calendar, version)),
        (arb_id(), arb_id()).prop_map(|(user, share)| SyncStreamId::drive(user, share)),
    ]
}

/// Strategy for actions.
pub fn arb_action() -> impl Strategy<Value = Action> {
    prop::sample::select(Action::ALL.to_vec())
}

/// Strategy for one event of one of `entity_types`, keyed from a small key
/// space so batches hit the same entity several times.
pub fn arb_event(entity_types: &'static [&'static str]) -> impl Strategy<Value = RawEvent> {
    (
        prop::sample::select(entity_types.to_vec()),
        0u8..8,
        arb_action(),
        prop::collection::vec(any::<u8>(), 0..16),
    )
        .prop_map(|(entity_type, key, action, body)| {
            let key = format!("k{}", key);
            match action {
                Action::Delete => RawEvent::delete(entity_type, key),
                action => RawEvent {
                    entity_type: entity_type.to_string(),
                    key,
                    action,
                    raw_entity: Some(body),
                },
            }
        })
}

/// Strategy for a batch of up to `max` events.
pub fn arb_events(
    entity_types: &'static [&'static str],
    max: usize,
) -> impl Strategy<Value = Vec<RawEvent>> {
    prop::collection::vec(arb_event(entity_types), 0..=max)
}
