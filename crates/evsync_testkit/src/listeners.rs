//! Recording listeners.
//!
//! A [`RecordingListener`] stores raw entity bodies in a table named after
//! its entity type and appends every lifecycle call to a shared [`CallLog`],
//! so tests can assert on cross-listener ordering.

use async_trait::async_trait;
use evsync_engine::{
    EntityListener, ListenerBucket, LocalStore, StoreTransaction, SyncError, SyncResult,
    TypedEvent, TypedEvents,
};
use evsync_protocol::{Action, EventBatch, StreamKind, SyncStreamId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// A listener lifecycle hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// `on_prepare`.
    Prepare,
    /// `on_create`.
    Create,
    /// `on_update`.
    Update,
    /// `on_partial_update`.
    PartialUpdate,
    /// `on_delete`.
    Delete,
    /// `on_success`.
    Success,
    /// `on_failure`.
    Failure,
    /// `on_complete`.
    Complete,
    /// `on_reset_all`.
    ResetAll,
}

impl Hook {
    /// Returns the hook applying `action`.
    pub fn for_action(action: Action) -> Self {
        match action {
            Action::Create => Hook::Create,
            Action::Update => Hook::Update,
            Action::PartialUpdate => Hook::PartialUpdate,
            Action::Delete => Hook::Delete,
        }
    }
}

/// One recorded hook call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Listener name.
    pub listener: String,
    /// Hook that was called.
    pub hook: Hook,
    /// Entity keys passed to the hook, in order.
    pub keys: Vec<String>,
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.listener, self.hook)?;
        if !self.keys.is_empty() {
            write!(f, " [{}]", self.keys.join(", "))?;
        }
        Ok(())
    }
}

/// Call log shared by several listeners.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a call.
    pub fn record(&self, listener: &str, hook: Hook, keys: Vec<String>) {
        self.0.lock().push(Call {
            listener: listener.to_string(),
            hook,
            keys,
        });
    }

    /// Returns every call so far.
    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().clone()
    }

    /// Returns `(listener, hook)` pairs of every call so far.
    pub fn sequence(&self) -> Vec<(String, Hook)> {
        self.0
            .lock()
            .iter()
            .map(|c| (c.listener.clone(), c.hook))
            .collect()
    }

    /// Returns the listener names of calls to `hook`, in call order.
    pub fn listeners_for(&self, hook: Hook) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|c| c.hook == hook)
            .map(|c| c.listener.clone())
            .collect()
    }

    /// Returns the number of calls to `hook`.
    pub fn count(&self, hook: Hook) -> usize {
        self.0.lock().iter().filter(|c| c.hook == hook).count()
    }

    /// Clears the log.
    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// A listener that stores raw bodies and records its calls.
///
/// Entities are stored in the table named after the entity type under the
/// key `{stream key}/{entity key}`, so a reset only removes the entities of
/// its own stream.
pub struct RecordingListener {
    name: String,
    entity_type: String,
    kind: StreamKind,
    order: u32,
    log: CallLog,
    fail_on: Mutex<Option<Action>>,
    fail_prepare: Mutex<bool>,
    fail_reset: Mutex<bool>,
}

impl RecordingListener {
    /// Creates a listener whose entity type equals its name.
    pub fn new(name: impl Into<String>, kind: StreamKind, order: u32, log: CallLog) -> Self {
        let name = name.into();
        Self {
            entity_type: name.clone(),
            name,
            kind,
            order,
            log,
            fail_on: Mutex::new(None),
            fail_prepare: Mutex::new(false),
            fail_reset: Mutex::new(false),
        }
    }

    /// Consumes events of `entity_type` instead of the listener name.
    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = entity_type.into();
        self
    }

    /// Returns the table this listener writes to.
    pub fn table(&self) -> &str {
        &self.entity_type
    }

    /// Returns the store key of `key` in `stream`.
    pub fn store_key(stream: &SyncStreamId, key: &str) -> String {
        format!("{}/{}", stream.key(), key)
    }

    /// Makes the apply hook of `action` fail until cleared.
    pub fn fail_on(&self, action: Option<Action>) {
        *self.fail_on.lock() = action;
    }

    /// Makes `on_prepare` fail until cleared.
    pub fn fail_prepare(&self, fail: bool) {
        *self.fail_prepare.lock() = fail;
    }

    /// Makes `on_reset_all` fail until cleared.
    pub fn fail_reset(&self, fail: bool) {
        *self.fail_reset.lock() = fail;
    }

    fn keys(events: &[TypedEvent<String, Vec<u8>>]) -> Vec<String> {
        events.iter().map(|e| e.key.clone()).collect()
    }

    fn check_failure(&self, action: Action) -> SyncResult<()> {
        if *self.fail_on.lock() == Some(action) {
            return Err(SyncError::listener(
                &self.name,
                Some(action),
                "injected failure",
            ));
        }
        Ok(())
    }

    fn upsert(
        &self,
        action: Action,
        stream: &SyncStreamId,
        events: &[TypedEvent<String, Vec<u8>>],
        txn: &mut dyn StoreTransaction,
    ) -> SyncResult<()> {
        self.log
            .record(&self.name, Hook::for_action(action), Self::keys(events));
        self.check_failure(action)?;
        for event in events {
            if let Some(body) = &event.entity {
                txn.put(&self.entity_type, &Self::store_key(stream, &event.key), body.clone())?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for RecordingListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingListener")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("order", &self.order)
            .finish()
    }
}

#[async_trait]
impl EntityListener for RecordingListener {
    type Key = String;
    type Entity = Vec<u8>;

    fn name(&self) -> &str {
        &self.name
    }

    fn stream_kind(&self) -> StreamKind {
        self.kind
    }

    fn order(&self) -> u32 {
        self.order
    }

    fn deserialize(
        &self,
        _stream: &SyncStreamId,
        batch: &EventBatch,
    ) -> SyncResult<Option<TypedEvents<Self>>> {
        let mut events = Vec::new();
        for event in batch.events_of(&self.entity_type) {
            let typed = match (&event.raw_entity, event.action) {
                (_, Action::Delete) => TypedEvent::delete(event.key.clone()),
                (Some(body), action) => TypedEvent::upsert(event.key.clone(), action, body.clone()),
                (None, action) => {
                    return Err(SyncError::Deserialize {
                        listener: self.name.clone(),
                        message: format!("{:?} event {} has no body", action, event.key),
                    })
                }
            };
            events.push(typed);
        }
        Ok((!events.is_empty()).then_some(events))
    }

    async fn on_prepare(
        &self,
        _stream: &SyncStreamId,
        bucket: &ListenerBucket<Self>,
        _store: &dyn LocalStore,
    ) -> SyncResult<()> {
        let keys = bucket.upserts().map(|e| e.key.clone()).collect();
        self.log.record(&self.name, Hook::Prepare, keys);
        if *self.fail_prepare.lock() {
            return Err(SyncError::transport_retryable("prepare fetch failed"));
        }
        Ok(())
    }

    fn on_create(
        &self,
        stream: &SyncStreamId,
        events: &[TypedEvent<String, Vec<u8>>],
        txn: &mut dyn StoreTransaction,
    ) -> SyncResult<()> {
        self.upsert(Action::Create, stream, events, txn)
    }

    fn on_update(
        &self,
        stream: &SyncStreamId,
        events: &[TypedEvent<String, Vec<u8>>],
        txn: &mut dyn StoreTransaction,
    ) -> SyncResult<()> {
        self.upsert(Action::Update, stream, events, txn)
    }

    fn on_partial_update(
        &self,
        stream: &SyncStreamId,
        events: &[TypedEvent<String, Vec<u8>>],
        txn: &mut dyn StoreTransaction,
    ) -> SyncResult<()> {
        self.upsert(Action::PartialUpdate, stream, events, txn)
    }

    fn on_delete(
        &self,
        stream: &SyncStreamId,
        events: &[TypedEvent<String, Vec<u8>>],
        txn: &mut dyn StoreTransaction,
    ) -> SyncResult<()> {
        self.log.record(&self.name, Hook::Delete, Self::keys(events));
        self.check_failure(Action::Delete)?;
        for event in events {
            txn.delete(&self.entity_type, &Self::store_key(stream, &event.key))?;
        }
        Ok(())
    }

    async fn on_success(&self, _stream: &SyncStreamId) {
        self.log.record(&self.name, Hook::Success, Vec::new());
    }

    async fn on_failure(&self, _stream: &SyncStreamId) {
        self.log.record(&self.name, Hook::Failure, Vec::new());
    }

    async fn on_complete(&self, _stream: &SyncStreamId) {
        self.log.record(&self.name, Hook::Complete, Vec::new());
    }

    async fn on_reset_all(&self, stream: &SyncStreamId, store: &dyn LocalStore) -> SyncResult<()> {
        self.log.record(&self.name, Hook::ResetAll, Vec::new());
        if *self.fail_reset.lock() {
            return Err(SyncError::store("reset failed"));
        }
        store.delete_prefix(&self.entity_type, &format!("{}/", stream.key()))?;
        Ok(())
    }
}
