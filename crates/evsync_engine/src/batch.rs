//! Per-batch event buckets.
//!
//! Every page of events gets a fresh [`BatchContext`] holding one
//! [`ActionBucket`] per participating listener. The context is owned by the
//! `process()` call that created it and dropped when the page is done, so no
//! bucket can leak into another batch or another stream.

use evsync_protocol::Action;
use std::any::Any;

/// A deserialized event owned by one listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedEvent<K, E> {
    /// Typed key of the entity.
    pub key: K,
    /// What happened to the entity.
    pub action: Action,
    /// Typed entity, absent for deletes.
    pub entity: Option<E>,
}

impl<K, E> TypedEvent<K, E> {
    /// Creates a create/update/partial-update event.
    pub fn upsert(key: K, action: Action, entity: E) -> Self {
        Self {
            key,
            action,
            entity: Some(entity),
        }
    }

    /// Creates a delete event.
    pub fn delete(key: K) -> Self {
        Self {
            key,
            action: Action::Delete,
            entity: None,
        }
    }
}

/// Events of one listener for one batch, grouped by action in log order.
#[derive(Debug, Clone)]
pub struct ActionBucket<K, E> {
    create: Vec<TypedEvent<K, E>>,
    update: Vec<TypedEvent<K, E>>,
    partial_update: Vec<TypedEvent<K, E>>,
    delete: Vec<TypedEvent<K, E>>,
}

impl<K, E> Default for ActionBucket<K, E> {
    fn default() -> Self {
        Self {
            create: Vec::new(),
            update: Vec::new(),
            partial_update: Vec::new(),
            delete: Vec::new(),
        }
    }
}

impl<K, E> ActionBucket<K, E> {
    /// Creates an empty bucket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an event to the list of its action.
    pub fn push(&mut self, event: TypedEvent<K, E>) {
        self.list_mut(event.action).push(event);
    }

    /// Adds every event of `events`.
    pub fn extend(&mut self, events: impl IntoIterator<Item = TypedEvent<K, E>>) {
        for event in events {
            self.push(event);
        }
    }

    /// Returns the events of one action.
    pub fn events(&self, action: Action) -> &[TypedEvent<K, E>] {
        match action {
            Action::Create => &self.create,
            Action::Update => &self.update,
            Action::PartialUpdate => &self.partial_update,
            Action::Delete => &self.delete,
        }
    }

    /// Iterates created, updated and partially updated events.
    pub fn upserts(&self) -> impl Iterator<Item = &TypedEvent<K, E>> {
        self.create
            .iter()
            .chain(self.update.iter())
            .chain(self.partial_update.iter())
    }

    /// Returns the number of events of one action.
    pub fn count(&self, action: Action) -> usize {
        self.events(action).len()
    }

    /// Returns the total number of events.
    pub fn len(&self) -> usize {
        Action::ALL.iter().map(|a| self.count(*a)).sum()
    }

    /// Returns true if the bucket holds no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the bucket holds any create or update.
    pub fn has_upserts(&self) -> bool {
        self.upserts().next().is_some()
    }

    fn list_mut(&mut self, action: Action) -> &mut Vec<TypedEvent<K, E>> {
        match action {
            Action::Create => &mut self.create,
            Action::Update => &mut self.update,
            Action::PartialUpdate => &mut self.partial_update,
            Action::Delete => &mut self.delete,
        }
    }
}

/// Object-safe view of an [`ActionBucket`] of any key/entity type.
pub(crate) trait AnyBucket: Send + Sync {
    fn count(&self, action: Action) -> usize;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<K, E> AnyBucket for ActionBucket<K, E>
where
    K: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn count(&self, action: Action) -> usize {
        ActionBucket::count(self, action)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Buckets of every listener of one stream for one batch.
///
/// Slot `i` belongs to the `i`-th listener of the stream kind in ascending
/// order. A slot is `None` when the listener had nothing to contribute.
pub(crate) struct BatchContext {
    slots: Vec<Option<Box<dyn AnyBucket>>>,
}

impl BatchContext {
    pub(crate) fn new(listeners: usize) -> Self {
        Self {
            slots: (0..listeners).map(|_| None).collect(),
        }
    }

    pub(crate) fn slot(&self, index: usize) -> Option<&dyn AnyBucket> {
        self.slots.get(index).and_then(|slot| slot.as_deref())
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> &mut Option<Box<dyn AnyBucket>> {
        &mut self.slots[index]
    }

    pub(crate) fn count(&self, index: usize, action: Action) -> usize {
        self.slot(index).map(|b| b.count(action)).unwrap_or(0)
    }

    pub(crate) fn has_upserts(&self, index: usize) -> bool {
        [Action::Create, Action::Update, Action::PartialUpdate]
            .iter()
            .any(|a| self.count(index, *a) > 0)
    }

    /// Returns true if listener `index` received any event.
    pub(crate) fn participated(&self, index: usize) -> bool {
        Action::ALL.iter().any(|a| self.count(index, *a) > 0)
    }

    pub(crate) fn total_events(&self) -> usize {
        (0..self.slots.len())
            .map(|i| Action::ALL.iter().map(|a| self.count(i, *a)).sum::<usize>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_groups_by_action() {
        let mut bucket: ActionBucket<u32, String> = ActionBucket::new();
        bucket.extend([
            TypedEvent::upsert(1, Action::Create, "a".to_string()),
            TypedEvent::delete(2),
            TypedEvent::upsert(3, Action::PartialUpdate, "c".to_string()),
            TypedEvent::upsert(4, Action::Create, "d".to_string()),
        ]);

        assert_eq!(bucket.count(Action::Create), 2);
        assert_eq!(bucket.count(Action::Update), 0);
        assert_eq!(bucket.len(), 4);
        assert_eq!(bucket.events(Action::Delete)[0].key, 2);
        let keys: Vec<u32> = bucket.upserts().map(|e| e.key).collect();
        assert_eq!(keys, vec![1, 4, 3]);
    }

    #[test]
    fn delete_only_bucket_has_no_upserts() {
        let mut bucket: ActionBucket<u32, ()> = ActionBucket::new();
        assert!(bucket.is_empty());
        bucket.push(TypedEvent::delete(1));
        assert!(!bucket.has_upserts());
        assert!(!bucket.is_empty());
    }

    #[test]
    fn context_tracks_participation() {
        let mut context = BatchContext::new(3);
        let mut bucket: ActionBucket<u32, ()> = ActionBucket::new();
        bucket.push(TypedEvent::delete(1));
        *context.slot_mut(1) = Some(Box::new(bucket));
        *context.slot_mut(2) = Some(Box::new(ActionBucket::<u32, ()>::new()));

        assert!(!context.participated(0));
        assert!(context.participated(1));
        assert!(!context.has_upserts(1));
        assert!(!context.participated(2));
        assert_eq!(context.total_events(), 1);

        let typed = context
            .slot(1)
            .and_then(|b| b.as_any().downcast_ref::<ActionBucket<u32, ()>>())
            .unwrap();
        assert_eq!(typed.count(Action::Delete), 1);
    }
}
