//! Property tests for batch application.

use evsync_engine::{EngineConfig, LocalStore, MemoryStore, ProcessResult};
use evsync_protocol::{EventBatch, EventId, RawEvent, StreamKind, SyncStreamId};
use evsync_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::BTreeMap;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn order_of(name: &str) -> usize {
    ListenerChain::NAMES
        .iter()
        .position(|n| *n == name)
        .unwrap()
}

fn tables(store: &MemoryStore) -> Vec<BTreeMap<String, Vec<u8>>> {
    ListenerChain::NAMES
        .iter()
        .map(|name| store.table(name))
        .collect()
}

/// Applies `events` as one page on top of checkpoint `e1`, `times` times.
fn apply(events: &[RawEvent], times: usize) -> (ListenerChain, std::sync::Arc<MemoryStore>) {
    let chain = ListenerChain::new(StreamKind::Core);
    let stream = SyncStreamId::core("u1");
    let (engine, api, store) = mock_engine(stream.clone(), &chain.registry, EngineConfig::default());

    runtime().block_on(async {
        for _ in 0..times {
            // A crash before the checkpoint write replays the same page.
            store.set_checkpoint(&stream, &EventId::new("e1")).unwrap();
            api.push_events(
                &stream,
                Ok(EventBatch::new(events.to_vec(), EventId::new("e2"), false)),
            );
            let result = engine.process().await.unwrap();
            assert!(matches!(result, ProcessResult::Synced { .. }), "{:?}", result);
        }
    });
    (chain, store)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn replaying_a_batch_is_idempotent(events in arb_events(&ListenerChain::NAMES, 24)) {
        let (_, once) = apply(&events, 1);
        let (_, twice) = apply(&events, 2);
        prop_assert_eq!(tables(&once), tables(&twice));
        prop_assert_eq!(
            once.checkpoint(&SyncStreamId::core("u1")).unwrap(),
            Some(EventId::new("e2"))
        );
    }

    #[test]
    fn apply_hooks_respect_listener_order(events in arb_events(&ListenerChain::NAMES, 24)) {
        let (chain, _) = apply(&events, 1);

        let applied: Vec<(usize, Hook)> = chain
            .log
            .sequence()
            .into_iter()
            .filter(|(_, hook)| {
                matches!(hook, Hook::Create | Hook::Update | Hook::PartialUpdate | Hook::Delete)
            })
            .map(|(name, hook)| (order_of(&name), hook))
            .collect();

        let first_delete = applied
            .iter()
            .position(|(_, hook)| *hook == Hook::Delete)
            .unwrap_or(applied.len());
        let (upserts, deletes) = applied.split_at(first_delete);

        prop_assert!(upserts.iter().all(|(_, hook)| *hook != Hook::Delete));
        prop_assert!(deletes.iter().all(|(_, hook)| *hook == Hook::Delete));
        prop_assert!(upserts.windows(2).all(|w| w[0].0 <= w[1].0));
        prop_assert!(deletes.windows(2).all(|w| w[0].0 > w[1].0));
    }
}
