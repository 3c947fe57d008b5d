//! Test fixtures and engine helpers.
//!
//! Provides ready-made engines wired to mock or loopback APIs, and a JSON
//! replay format used by integration tests and the `evsync replay` command.

use crate::listeners::{CallLog, RecordingListener};
use crate::server::EventLogServer;
use evsync_engine::{
    ApiCall, EngineConfig, HttpEventApi, ListenerRegistry, LocalStore, LoopbackClient, MemoryStore,
    MockEventApi, ProcessResult, SyncEngine, SyncResult,
};
use evsync_protocol::{Action, EventBatch, EventId, RawEvent, StreamKind, SyncStreamId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// HTTP API talking to an in-process [`EventLogServer`].
pub type LoopbackApi = HttpEventApi<LoopbackClient<Arc<EventLogServer>>>;

/// Base URL used by loopback APIs.
pub const LOOPBACK_URL: &str = "https://events.test";

/// Creates an HTTP API routed to `server`.
pub fn loopback_api(server: Arc<EventLogServer>) -> LoopbackApi {
    HttpEventApi::new(LOOPBACK_URL, LoopbackClient::new(server))
}

/// Three listeners of one stream kind with orders 0, 1 and 2.
pub struct ListenerChain {
    /// Shared call log.
    pub log: CallLog,
    /// Listeners in order: `root`, `child`, `grandchild`.
    pub listeners: [Arc<RecordingListener>; 3],
    /// Registry holding the three listeners.
    pub registry: Arc<ListenerRegistry>,
}

impl ListenerChain {
    /// Names of the three listeners in ascending order.
    pub const NAMES: [&'static str; 3] = ["root", "child", "grandchild"];

    /// Creates the chain for `kind`. Listeners are registered in reverse
    /// order so tests do not depend on registration order.
    pub fn new(kind: StreamKind) -> Self {
        let log = CallLog::new();
        let listeners = [0, 1, 2].map(|order| {
            Arc::new(RecordingListener::new(
                Self::NAMES[order as usize],
                kind,
                order,
                log.clone(),
            ))
        });
        let registry = ListenerRegistry::builder()
            .register_shared(listeners[2].clone())
            .register_shared(listeners[1].clone())
            .register_shared(listeners[0].clone())
            .build();

        Self {
            log,
            listeners,
            registry: Arc::new(registry),
        }
    }

    /// Returns one event of each listener's entity type for `action`.
    pub fn events(&self, action: Action, key: &str) -> Vec<RawEvent> {
        Self::NAMES
            .iter()
            .map(|name| match action {
                Action::Delete => RawEvent::delete(*name, key),
                action => RawEvent {
                    entity_type: name.to_string(),
                    key: key.to_string(),
                    action,
                    raw_entity: Some(format!("{}:{}", name, key).into_bytes()),
                },
            })
            .collect()
    }
}

/// Creates a started engine with a mock API and an in-memory store.
pub fn mock_engine(
    stream: SyncStreamId,
    registry: &ListenerRegistry,
    config: EngineConfig,
) -> (
    Arc<SyncEngine<MockEventApi, MemoryStore>>,
    Arc<MockEventApi>,
    Arc<MemoryStore>,
) {
    let api = Arc::new(MockEventApi::new());
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(SyncEngine::new(
        stream,
        config,
        api.clone(),
        store.clone(),
        registry,
    ));
    engine.start();
    (engine, api, store)
}

/// A listener declared by a replay fixture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureListener {
    /// Listener name.
    pub name: String,
    /// Dependency rank.
    pub order: u32,
    /// Entity type consumed; defaults to the name.
    #[serde(default)]
    pub entity_type: Option<String>,
}

/// One event of a replay fixture. Bodies are UTF-8 text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureEvent {
    /// Entity type discriminator.
    pub entity_type: String,
    /// Entity key.
    pub key: String,
    /// Action.
    pub action: Action,
    /// Entity body.
    #[serde(default)]
    pub body: Option<String>,
}

impl FixtureEvent {
    /// Converts to a raw event.
    pub fn to_raw(&self) -> RawEvent {
        RawEvent {
            entity_type: self.entity_type.clone(),
            key: self.key.clone(),
            action: self.action,
            raw_entity: self.body.as_ref().map(|b| b.as_bytes().to_vec()),
        }
    }
}

/// One page of a replay fixture.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureBatch {
    /// Events of the page.
    #[serde(default)]
    pub events: Vec<FixtureEvent>,
    /// Whether the server reports more events.
    #[serde(default)]
    pub more: bool,
    /// Whether the server invalidates the checkpoint instead.
    #[serde(default)]
    pub refresh: bool,
}

/// A scripted sync session.
///
/// ```json
/// {
///   "stream": "core:user-1",
///   "listeners": [{ "name": "label", "order": 0 }],
///   "batches": [
///     { "events": [{ "entity_type": "label", "key": "l1", "action": "create", "body": "Inbox" }] }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayFixture {
    /// Stream being synced.
    pub stream: SyncStreamId,
    /// Listeners registered for the stream's kind.
    pub listeners: Vec<FixtureListener>,
    /// Checkpoint to start from. Without one, the first run establishes a
    /// baseline.
    #[serde(default)]
    pub checkpoint: Option<EventId>,
    /// Pages served in order.
    #[serde(default)]
    pub batches: Vec<FixtureBatch>,
}

/// Result of replaying a fixture.
#[derive(Debug)]
pub struct ReplayReport {
    /// Result of each `process()` run.
    pub results: Vec<ProcessResult>,
    /// Every listener call.
    pub log: CallLog,
    /// Final store.
    pub store: Arc<MemoryStore>,
    /// Final checkpoint.
    pub checkpoint: Option<EventId>,
}

impl ReplayFixture {
    /// Parses a fixture from JSON.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Loads a fixture from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Builds the listener registry declared by the fixture.
    pub fn registry(&self, log: &CallLog) -> ListenerRegistry {
        let kind = self.stream.kind();
        self.listeners
            .iter()
            .fold(ListenerRegistry::builder(), |builder, declared| {
                let mut listener =
                    RecordingListener::new(declared.name.clone(), kind, declared.order, log.clone());
                if let Some(entity_type) = &declared.entity_type {
                    listener = listener.with_entity_type(entity_type.clone());
                }
                builder.register(listener)
            })
            .build()
    }

    /// Runs every batch through a fresh engine.
    ///
    /// Batches are served as `f1`, `f2`, ...; the baseline, if needed, is
    /// `f0`. The engine runs until every batch was served, a run fails, or a
    /// reset happens.
    pub async fn run(&self, config: EngineConfig) -> SyncResult<ReplayReport> {
        let log = CallLog::new();
        let registry = self.registry(&log);
        let (engine, api, store) = mock_engine(self.stream.clone(), &registry, config);

        let mut results = Vec::new();
        match &self.checkpoint {
            Some(checkpoint) => store.set_checkpoint(&self.stream, checkpoint)?,
            None => {
                api.push_latest(&self.stream, Ok(EventId::new("f0")));
                results.push(engine.process().await?);
            }
        }

        for (i, batch) in self.batches.iter().enumerate() {
            let next = EventId::new(format!("f{}", i + 1));
            let page = if batch.refresh {
                EventBatch::refresh(next)
            } else {
                EventBatch::new(
                    batch.events.iter().map(FixtureEvent::to_raw).collect(),
                    next,
                    batch.more,
                )
            };
            api.push_events(&self.stream, Ok(page));
        }

        while served(&api) < self.batches.len() {
            let result = engine.process().await?;
            let stop = matches!(result, ProcessResult::Failed(_) | ProcessResult::Reset);
            results.push(result);
            if stop {
                break;
            }
        }

        let checkpoint = store.checkpoint(&self.stream)?;
        Ok(ReplayReport {
            results,
            log,
            store,
            checkpoint,
        })
    }
}

fn served(api: &MockEventApi) -> usize {
    api.calls()
        .iter()
        .filter(|c| matches!(c, ApiCall::Events(..)))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_events_cover_all_listeners() {
        let chain = ListenerChain::new(StreamKind::Core);
        let events = chain.events(Action::Update, "k1");
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].entity_type, "grandchild");
        assert_eq!(chain.registry.len(), 3);
    }

    #[test]
    fn fixture_parses() {
        let fixture = ReplayFixture::from_json(
            r#"{
                "stream": "calendar:u1:c1:2",
                "listeners": [{ "name": "event", "order": 0 }],
                "checkpoint": "x1",
                "batches": [
                    { "events": [{ "entity_type": "event", "key": "ev1", "action": "partial_update", "body": "{}" }] },
                    { "refresh": true }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(fixture.stream, SyncStreamId::calendar("u1", "c1", 2));
        assert_eq!(fixture.checkpoint, Some(EventId::new("x1")));
        assert_eq!(fixture.batches[0].events[0].action, Action::PartialUpdate);
        assert!(fixture.batches[1].refresh);
    }

    #[tokio::test]
    async fn replay_applies_batches_after_baseline() {
        let fixture = ReplayFixture::from_json(
            r#"{
                "stream": "core:u1",
                "listeners": [
                    { "name": "message", "order": 1 },
                    { "name": "label", "order": 0 }
                ],
                "batches": [
                    {
                        "events": [
                            { "entity_type": "message", "key": "m1", "action": "create", "body": "hi" },
                            { "entity_type": "label", "key": "l1", "action": "create", "body": "Inbox" }
                        ],
                        "more": true
                    },
                    { "events": [{ "entity_type": "label", "key": "l1", "action": "delete" }] }
                ]
            }"#,
        )
        .unwrap();

        let report = fixture.run(EngineConfig::default()).await.unwrap();

        assert!(matches!(
            report.results[0],
            ProcessResult::BaselineEstablished { .. }
        ));
        assert!(matches!(
            report.results[1],
            ProcessResult::Synced { pages: 2, events: 3, .. }
        ));
        assert_eq!(report.checkpoint, Some(EventId::new("f2")));
        assert_eq!(
            report.log.listeners_for(crate::listeners::Hook::Create),
            vec!["label".to_string(), "message".to_string()]
        );
        assert_eq!(report.store.len("message"), 1);
        assert_eq!(report.store.len("label"), 0);
    }
}
