//! Entity listeners.
//!
//! An [`EntityListener`] owns one entity type of one stream kind. The engine
//! hands it the events of each batch through this lifecycle:
//!
//! 1. [`deserialize`](EntityListener::deserialize) turns the raw batch into
//!    typed events, or `None` when the listener has nothing to contribute.
//! 2. [`on_prepare`](EntityListener::on_prepare) runs outside any transaction
//!    and may fetch missing foreign entities. It must be safe to retry.
//! 3. `on_create`, `on_update`, `on_partial_update` run in ascending `order`
//!    across listeners, then `on_delete` in descending `order`, all inside the
//!    one transaction of the batch. They must not perform network I/O.
//! 4. `on_success` or `on_failure`, then `on_complete`.
//!
//! [`on_reset_all`](EntityListener::on_reset_all) replaces all of the above
//! when the stream's checkpoint is invalidated.

use crate::batch::{ActionBucket, AnyBucket, BatchContext, TypedEvent};
use crate::error::{SyncError, SyncResult};
use crate::store::{LocalStore, StoreTransaction};
use async_trait::async_trait;
use evsync_protocol::{Action, EventBatch, StreamKind, SyncStreamId};
use std::fmt::Debug;
use std::sync::Arc;

/// Typed events produced by a listener.
pub type TypedEvents<L> =
    Vec<TypedEvent<<L as EntityListener>::Key, <L as EntityListener>::Entity>>;

/// Bucket type of a listener.
pub type ListenerBucket<L> =
    ActionBucket<<L as EntityListener>::Key, <L as EntityListener>::Entity>;

/// Handler for one entity type of one stream kind.
///
/// `order` is the distance from the stream's root entity: a listener whose
/// entities reference another listener's entities must have a strictly larger
/// order. Listeners with equal order must not depend on each other.
#[async_trait]
pub trait EntityListener: Send + Sync + 'static {
    /// Typed key of the entity.
    type Key: Clone + Debug + Send + Sync + 'static;
    /// Typed entity.
    type Entity: Clone + Debug + Send + Sync + 'static;

    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Stream kind this listener participates in.
    fn stream_kind(&self) -> StreamKind;

    /// Dependency rank.
    fn order(&self) -> u32;

    /// Extracts this listener's events from a raw batch.
    ///
    /// Returns `Ok(None)` if the batch holds nothing for this listener.
    fn deserialize(
        &self,
        stream: &SyncStreamId,
        batch: &EventBatch,
    ) -> SyncResult<Option<TypedEvents<Self>>>;

    /// Prepares created and updated entities before the transaction opens.
    async fn on_prepare(
        &self,
        _stream: &SyncStreamId,
        _bucket: &ListenerBucket<Self>,
        _store: &dyn LocalStore,
    ) -> SyncResult<()> {
        Ok(())
    }

    /// Applies created entities. Must be an upsert.
    fn on_create(
        &self,
        _stream: &SyncStreamId,
        _events: &[TypedEvent<Self::Key, Self::Entity>],
        _txn: &mut dyn StoreTransaction,
    ) -> SyncResult<()> {
        Ok(())
    }

    /// Applies updated entities. Must be an upsert.
    fn on_update(
        &self,
        _stream: &SyncStreamId,
        _events: &[TypedEvent<Self::Key, Self::Entity>],
        _txn: &mut dyn StoreTransaction,
    ) -> SyncResult<()> {
        Ok(())
    }

    /// Applies partially updated entities.
    fn on_partial_update(
        &self,
        _stream: &SyncStreamId,
        _events: &[TypedEvent<Self::Key, Self::Entity>],
        _txn: &mut dyn StoreTransaction,
    ) -> SyncResult<()> {
        Ok(())
    }

    /// Applies deletions.
    fn on_delete(
        &self,
        _stream: &SyncStreamId,
        _events: &[TypedEvent<Self::Key, Self::Entity>],
        _txn: &mut dyn StoreTransaction,
    ) -> SyncResult<()> {
        Ok(())
    }

    /// Called after the batch committed.
    async fn on_success(&self, _stream: &SyncStreamId) {}

    /// Called after the batch failed.
    async fn on_failure(&self, _stream: &SyncStreamId) {}

    /// Called after `on_success` or `on_failure`.
    async fn on_complete(&self, _stream: &SyncStreamId) {}

    /// Deletes every local entity of this listener's type for `stream`.
    ///
    /// Runs outside any engine transaction. May refetch a minimal baseline.
    async fn on_reset_all(&self, stream: &SyncStreamId, store: &dyn LocalStore)
        -> SyncResult<()>;
}

/// Type-erased listener used by the engine.
#[async_trait]
pub(crate) trait ErasedListener: Send + Sync {
    fn name(&self) -> &str;
    fn stream_kind(&self) -> StreamKind;
    fn order(&self) -> u32;

    /// Deserializes `batch` into slot `index` of `context`.
    fn collect(
        &self,
        stream: &SyncStreamId,
        batch: &EventBatch,
        context: &mut BatchContext,
        index: usize,
    ) -> SyncResult<()>;

    async fn prepare(
        &self,
        stream: &SyncStreamId,
        bucket: &dyn AnyBucket,
        store: &dyn LocalStore,
    ) -> SyncResult<()>;

    fn apply(
        &self,
        stream: &SyncStreamId,
        action: Action,
        bucket: &dyn AnyBucket,
        txn: &mut dyn StoreTransaction,
    ) -> SyncResult<()>;

    async fn success(&self, stream: &SyncStreamId);
    async fn failure(&self, stream: &SyncStreamId);
    async fn complete(&self, stream: &SyncStreamId);
    async fn reset_all(&self, stream: &SyncStreamId, store: &dyn LocalStore) -> SyncResult<()>;
}

struct Erased<L>(Arc<L>);

impl<L: EntityListener> Erased<L> {
    fn typed<'a>(&self, bucket: &'a dyn AnyBucket) -> SyncResult<&'a ListenerBucket<L>> {
        bucket
            .as_any()
            .downcast_ref::<ListenerBucket<L>>()
            .ok_or_else(|| {
                SyncError::listener(self.0.name(), None, "bucket belongs to another listener")
            })
    }
}

#[async_trait]
impl<L: EntityListener> ErasedListener for Erased<L> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn stream_kind(&self) -> StreamKind {
        self.0.stream_kind()
    }

    fn order(&self) -> u32 {
        self.0.order()
    }

    fn collect(
        &self,
        stream: &SyncStreamId,
        batch: &EventBatch,
        context: &mut BatchContext,
        index: usize,
    ) -> SyncResult<()> {
        let Some(events) = self.0.deserialize(stream, batch)? else {
            return Ok(());
        };

        let slot = context.slot_mut(index);
        if slot.is_none() {
            *slot = Some(Box::new(ListenerBucket::<L>::new()));
        }
        let bucket = slot
            .as_mut()
            .and_then(|b| b.as_any_mut().downcast_mut::<ListenerBucket<L>>())
            .ok_or_else(|| {
                SyncError::listener(self.0.name(), None, "bucket belongs to another listener")
            })?;
        bucket.extend(events);
        Ok(())
    }

    async fn prepare(
        &self,
        stream: &SyncStreamId,
        bucket: &dyn AnyBucket,
        store: &dyn LocalStore,
    ) -> SyncResult<()> {
        let bucket = self.typed(bucket)?;
        self.0.on_prepare(stream, bucket, store).await
    }

    fn apply(
        &self,
        stream: &SyncStreamId,
        action: Action,
        bucket: &dyn AnyBucket,
        txn: &mut dyn StoreTransaction,
    ) -> SyncResult<()> {
        let events = self.typed(bucket)?.events(action);
        match action {
            Action::Create => self.0.on_create(stream, events, txn),
            Action::Update => self.0.on_update(stream, events, txn),
            Action::PartialUpdate => self.0.on_partial_update(stream, events, txn),
            Action::Delete => self.0.on_delete(stream, events, txn),
        }
    }

    async fn success(&self, stream: &SyncStreamId) {
        self.0.on_success(stream).await
    }

    async fn failure(&self, stream: &SyncStreamId) {
        self.0.on_failure(stream).await
    }

    async fn complete(&self, stream: &SyncStreamId) {
        self.0.on_complete(stream).await
    }

    async fn reset_all(&self, stream: &SyncStreamId, store: &dyn LocalStore) -> SyncResult<()> {
        self.0.on_reset_all(stream, store).await
    }
}

/// Name and order of a registered listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    /// Listener name.
    pub name: String,
    /// Stream kind.
    pub stream_kind: StreamKind,
    /// Dependency rank.
    pub order: u32,
}

/// The static set of listeners of a process.
///
/// Built once with [`ListenerRegistry::builder`] and shared by every engine;
/// it cannot change while batches are applied.
///
/// # Example
///
/// ```rust,ignore
/// let listeners = ListenerRegistry::builder()
///     .register(LabelListener::new())
///     .register(MessageListener::new())
///     .build();
/// ```
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Vec<Arc<dyn ErasedListener>>,
}

impl ListenerRegistry {
    /// Starts building a registry.
    pub fn builder() -> ListenerRegistryBuilder {
        ListenerRegistryBuilder::default()
    }

    /// Returns the listeners of `kind` in ascending order. Listeners with
    /// equal order keep their registration order.
    pub(crate) fn for_kind(&self, kind: StreamKind) -> Vec<Arc<dyn ErasedListener>> {
        let mut listeners: Vec<_> = self
            .listeners
            .iter()
            .filter(|l| l.stream_kind() == kind)
            .cloned()
            .collect();
        listeners.sort_by_key(|l| l.order());
        listeners
    }

    /// Describes the listeners of `kind` in ascending order.
    pub fn describe(&self, kind: StreamKind) -> Vec<ListenerInfo> {
        self.for_kind(kind)
            .iter()
            .map(|l| ListenerInfo {
                name: l.name().to_string(),
                stream_kind: l.stream_kind(),
                order: l.order(),
            })
            .collect()
    }

    /// Returns true if any listener participates in `kind`.
    pub fn is_registered(&self, kind: StreamKind) -> bool {
        self.listeners.iter().any(|l| l.stream_kind() == kind)
    }

    /// Returns the number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Returns true if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.listeners.iter().map(|l| (l.name(), l.stream_kind(), l.order())))
            .finish()
    }
}

/// Builder for [`ListenerRegistry`].
#[derive(Default)]
pub struct ListenerRegistryBuilder {
    listeners: Vec<Arc<dyn ErasedListener>>,
}

impl ListenerRegistryBuilder {
    /// Registers a listener.
    pub fn register<L: EntityListener>(self, listener: L) -> Self {
        self.register_shared(Arc::new(listener))
    }

    /// Registers a listener the caller keeps a handle to.
    pub fn register_shared<L: EntityListener>(mut self, listener: Arc<L>) -> Self {
        self.listeners.push(Arc::new(Erased(listener)));
        self
    }

    /// Finishes the registry.
    pub fn build(self) -> ListenerRegistry {
        ListenerRegistry {
            listeners: self.listeners,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named {
        name: &'static str,
        kind: StreamKind,
        order: u32,
    }

    #[async_trait]
    impl EntityListener for Named {
        type Key = String;
        type Entity = ();

        fn name(&self) -> &str {
            self.name
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
            let events: Vec<_> = batch
                .events_of(self.name)
                .map(|e| TypedEvent::delete(e.key.clone()))
                .collect();
            Ok((!events.is_empty()).then_some(events))
        }

        async fn on_reset_all(&self, _: &SyncStreamId, _: &dyn LocalStore) -> SyncResult<()> {
            Ok(())
        }
    }

    fn named(name: &'static str, kind: StreamKind, order: u32) -> Named {
        Named { name, kind, order }
    }

    #[test]
    fn for_kind_sorts_by_order_and_filters() {
        let registry = ListenerRegistry::builder()
            .register(named("messages", StreamKind::Core, 2))
            .register(named("events", StreamKind::Calendar, 0))
            .register(named("labels", StreamKind::Core, 0))
            .register(named("addresses", StreamKind::Core, 1))
            .register(named("contacts", StreamKind::Core, 1))
            .build();

        let names: Vec<String> = registry
            .describe(StreamKind::Core)
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["labels", "addresses", "contacts", "messages"]);
        assert!(registry.is_registered(StreamKind::Calendar));
        assert!(!registry.is_registered(StreamKind::Drive));
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn collect_skips_listeners_without_events() {
        let registry = ListenerRegistry::builder()
            .register(named("labels", StreamKind::Core, 0))
            .register(named("messages", StreamKind::Core, 1))
            .build();
        let listeners = registry.for_kind(StreamKind::Core);
        let stream = SyncStreamId::core("u1");
        let batch = EventBatch::new(
            vec![evsync_protocol::RawEvent::delete("messages", "m1")],
            evsync_protocol::EventId::new("e2"),
            false,
        );

        let mut context = BatchContext::new(listeners.len());
        for (i, listener) in listeners.iter().enumerate() {
            listener.collect(&stream, &batch, &mut context, i).unwrap();
        }

        assert!(context.slot(0).is_none());
        assert_eq!(context.count(1, Action::Delete), 1);
    }
}
