//! One engine per stream.

use crate::api::EventApi;
use crate::config::EngineConfig;
use crate::engine::SyncEngine;
use crate::listener::ListenerRegistry;
use crate::store::LocalStore;
use evsync_protocol::{SyncStreamId, UserId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Creates and caches the [`SyncEngine`] of each stream.
///
/// Every engine shares the registry's API client, store, listeners and
/// configuration. Repeated lookups of the same stream return the same engine
/// so its state and statistics survive across scheduled runs.
pub struct EngineRegistry<A: EventApi, S: LocalStore> {
    api: Arc<A>,
    store: Arc<S>,
    listeners: Arc<ListenerRegistry>,
    config: EngineConfig,
    engines: Mutex<HashMap<SyncStreamId, Arc<SyncEngine<A, S>>>>,
}

impl<A: EventApi, S: LocalStore> EngineRegistry<A, S> {
    /// Creates an empty registry.
    pub fn new(
        api: Arc<A>,
        store: Arc<S>,
        listeners: Arc<ListenerRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            api,
            store,
            listeners,
            config,
            engines: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the engine of `stream`, creating it on first use.
    ///
    /// New engines are started if `auto_start` is set.
    pub fn get_or_create(&self, stream: &SyncStreamId) -> Arc<SyncEngine<A, S>> {
        let mut engines = self.engines.lock();
        if let Some(engine) = engines.get(stream) {
            return engine.clone();
        }

        let engine = Arc::new(SyncEngine::new(
            stream.clone(),
            self.config.clone(),
            self.api.clone(),
            self.store.clone(),
            &self.listeners,
        ));
        if self.config.auto_start {
            engine.start();
        }
        debug!(stream = %stream, "created sync engine");
        engines.insert(stream.clone(), engine.clone());
        engine
    }

    /// Returns the engine of `stream` if it exists.
    pub fn get(&self, stream: &SyncStreamId) -> Option<Arc<SyncEngine<A, S>>> {
        self.engines.lock().get(stream).cloned()
    }

    /// Returns every stream with an engine.
    pub fn streams(&self) -> Vec<SyncStreamId> {
        let mut streams: Vec<_> = self.engines.lock().keys().cloned().collect();
        streams.sort_by_key(|s| s.key());
        streams
    }

    /// Returns the engines of `user`.
    pub fn engines_of(&self, user: &UserId) -> Vec<Arc<SyncEngine<A, S>>> {
        self.engines
            .lock()
            .values()
            .filter(|e| e.stream().user_id() == user)
            .cloned()
            .collect()
    }

    /// Stops every engine of `user`. Returns the number of engines stopped.
    pub fn stop_user(&self, user: &UserId) -> usize {
        let engines = self.engines_of(user);
        for engine in &engines {
            engine.stop();
        }
        engines.len()
    }

    /// Starts every engine of `user`. Returns the number of engines started.
    pub fn start_user(&self, user: &UserId) -> usize {
        let engines = self.engines_of(user);
        for engine in &engines {
            engine.start();
        }
        engines.len()
    }

    /// Stops, cancels and forgets every engine of `user`.
    ///
    /// Returns the removed engines; a run already in flight keeps its handle
    /// and finishes as cancelled.
    pub fn remove_user(&self, user: &UserId) -> Vec<Arc<SyncEngine<A, S>>> {
        let mut engines = self.engines.lock();
        let streams: Vec<_> = engines
            .keys()
            .filter(|s| s.user_id() == user)
            .cloned()
            .collect();

        let mut removed = Vec::with_capacity(streams.len());
        for stream in streams {
            if let Some(engine) = engines.remove(&stream) {
                engine.stop();
                engine.cancel();
                removed.push(engine);
            }
        }
        debug!(user = %user, removed = removed.len(), "removed sync engines");
        removed
    }

    /// Returns the shared store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the shared API client.
    pub fn api(&self) -> &Arc<A> {
        &self.api
    }
}
