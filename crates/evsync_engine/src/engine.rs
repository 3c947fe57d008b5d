//! Sync engine state machine.

use crate::api::EventApi;
use crate::batch::BatchContext;
use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::listener::{ErasedListener, ListenerRegistry};
use crate::store::LocalStore;
use evsync_protocol::{Action, EventBatch, EventId, SyncStreamId};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const UPSERT_ACTIONS: [Action; 3] = [Action::Create, Action::Update, Action::PartialUpdate];

/// Eligibility of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// `process()` is a no-op.
    Stopped,
    /// `process()` runs.
    Started,
}

impl EngineState {
    /// Returns true if the engine is eligible for processing.
    pub fn is_started(&self) -> bool {
        matches!(self, EngineState::Started)
    }
}

/// Why a `process()` call did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The engine is stopped or suspended.
    Stopped,
    /// Another run or a `suspend` block holds the engine.
    Busy,
}

/// Outcome of one `process()` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessResult {
    /// Nothing was done.
    Skipped(SkipReason),
    /// No checkpoint existed; the server's latest id was stored and no event
    /// was applied.
    BaselineEstablished {
        /// The stored checkpoint.
        event_id: EventId,
    },
    /// One or more pages were applied.
    Synced {
        /// Number of pages fetched.
        pages: u32,
        /// Number of events handed to listeners.
        events: usize,
        /// Checkpoint after the run.
        checkpoint: EventId,
        /// True if the page limit was hit while the server had more.
        more_pending: bool,
    },
    /// The checkpoint was invalidated; every listener was reset and the
    /// checkpoint removed. The next run establishes a new baseline.
    Reset,
    /// The run failed; the checkpoint did not move past the last committed
    /// batch.
    Failed(SyncError),
}

impl ProcessResult {
    /// Returns true for results that are not failures.
    pub fn is_success(&self) -> bool {
        !matches!(self, ProcessResult::Failed(_))
    }

    /// Returns the error of a failed run.
    pub fn error(&self) -> Option<&SyncError> {
        match self {
            ProcessResult::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Statistics about sync runs of one engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Number of runs that were not skipped.
    pub runs: u64,
    /// Number of committed batches.
    pub batches_applied: u64,
    /// Number of events in committed batches.
    pub events_applied: u64,
    /// Number of resets performed.
    pub resets: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Clears the suspended flag when a `suspend` block ends, even if the block
/// is dropped mid-way.
struct SuspendGuard<'a>(&'a AtomicBool);

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The sync engine of one stream.
///
/// Owns the stream's started/stopped state and drives
/// fetch → deserialize → prepare → apply → checkpoint. At most one
/// `process()` runs at a time; a second caller gets
/// [`SkipReason::Busy`] instead of waiting.
pub struct SyncEngine<A: EventApi, S: LocalStore> {
    stream: SyncStreamId,
    config: EngineConfig,
    api: Arc<A>,
    store: Arc<S>,
    listeners: Vec<Arc<dyn ErasedListener>>,
    state: RwLock<EngineState>,
    suspended: AtomicBool,
    gate: Mutex<()>,
    cancelled: AtomicBool,
    stats: RwLock<EngineStats>,
}

impl<A: EventApi, S: LocalStore> SyncEngine<A, S> {
    /// Creates a stopped engine for `stream`.
    pub fn new(
        stream: SyncStreamId,
        config: EngineConfig,
        api: Arc<A>,
        store: Arc<S>,
        listeners: &ListenerRegistry,
    ) -> Self {
        let listeners = listeners.for_kind(stream.kind());
        Self {
            stream,
            config,
            api,
            store,
            listeners,
            state: RwLock::new(EngineState::Stopped),
            suspended: AtomicBool::new(false),
            gate: Mutex::new(()),
            cancelled: AtomicBool::new(false),
            stats: RwLock::new(EngineStats::default()),
        }
    }

    /// Returns the stream this engine syncs.
    pub fn stream(&self) -> &SyncStreamId {
        &self.stream
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Gets the current state. A suspended engine is `Stopped`.
    pub fn state(&self) -> EngineState {
        if self.suspended.load(Ordering::SeqCst) {
            EngineState::Stopped
        } else {
            *self.state.read()
        }
    }

    /// Gets the current stats.
    pub fn stats(&self) -> EngineStats {
        self.stats.read().clone()
    }

    /// Returns true while a run or a `suspend` block holds the engine.
    pub fn is_busy(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Marks the engine eligible for processing. Does not trigger a run.
    ///
    /// Called inside a `suspend` block, takes effect when the block ends.
    pub fn start(&self) {
        let mut state = self.state.write();
        if !state.is_started() {
            *state = EngineState::Started;
            info!(stream = %self.stream, "sync engine started");
        }
    }

    /// Marks the engine ineligible. An in-flight run is allowed to finish.
    ///
    /// Called inside a `suspend` block, the engine stays stopped after it.
    pub fn stop(&self) {
        let mut state = self.state.write();
        if state.is_started() {
            *state = EngineState::Stopped;
            info!(stream = %self.stream, "sync engine stopped");
        }
    }

    /// Cancels the in-flight run, or the next one if none is running.
    ///
    /// The cancelled run ends at its next suspension point with
    /// [`SyncError::Cancelled`] without committing.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Clears a pending cancellation.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs `block` with the engine stopped and no batch in flight.
    ///
    /// Waits for an in-flight run to finish, then holds the engine for the
    /// whole block. Afterwards the engine is started or stopped according
    /// to the last `start`/`stop` call, including calls made by the block.
    pub async fn suspend<F, Fut, T>(&self, block: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _gate = self.gate.lock().await;
        self.suspended.store(true, Ordering::SeqCst);
        let _resume = SuspendGuard(&self.suspended);
        debug!(stream = %self.stream, "sync engine suspended");
        block().await
    }

    /// Runs one sync cycle.
    ///
    /// Expected failures are reported as [`ProcessResult::Failed`]; the only
    /// error returned is [`SyncError::UnregisteredStreamKind`].
    pub async fn process(&self) -> SyncResult<ProcessResult> {
        if self.listeners.is_empty() {
            return Err(SyncError::UnregisteredStreamKind(self.stream.kind()));
        }
        if !self.state().is_started() {
            return Ok(ProcessResult::Skipped(SkipReason::Stopped));
        }
        let Ok(_gate) = self.gate.try_lock() else {
            debug!(stream = %self.stream, "sync already in progress");
            return Ok(ProcessResult::Skipped(SkipReason::Busy));
        };
        // Re-check: a suspend block may have finished between the two checks.
        if !self.state().is_started() {
            return Ok(ProcessResult::Skipped(SkipReason::Stopped));
        }

        self.stats.write().runs += 1;
        let result = match self.sync_pages().await {
            Ok(result) => result,
            Err(SyncError::CheckpointInvalid) => self.reset().await,
            Err(e) => ProcessResult::Failed(e),
        };

        if let ProcessResult::Failed(e) = &result {
            if e.is_cancelled() {
                self.reset_cancel();
                info!(stream = %self.stream, "sync cancelled");
            } else {
                self.log_failure(e);
            }
            self.stats.write().last_error = Some(e.to_string());
        }
        Ok(result)
    }

    async fn remote<T>(&self, call: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout),
        }
    }

    async fn sync_pages(&self) -> SyncResult<ProcessResult> {
        self.check_cancelled()?;
        let Some(mut since) = self.store.checkpoint(&self.stream)? else {
            let latest = self.remote(self.api.latest_event_id(&self.stream)).await?;
            self.check_cancelled()?;
            self.store.set_checkpoint(&self.stream, &latest)?;
            info!(stream = %self.stream, event_id = %latest, "baseline established");
            return Ok(ProcessResult::BaselineEstablished { event_id: latest });
        };

        let mut pages = 0;
        let mut events = 0;
        loop {
            let batch = self.remote(self.api.events(&self.stream, &since)).await?;
            self.check_cancelled()?;
            if batch.refresh {
                return Err(SyncError::CheckpointInvalid);
            }
            pages += 1;

            events += self.apply_batch(&since, &batch).await?;
            since = batch.next_event_id;

            if !batch.more {
                return Ok(ProcessResult::Synced {
                    pages,
                    events,
                    checkpoint: since,
                    more_pending: false,
                });
            }
            if pages >= self.config.max_pages_per_run {
                debug!(stream = %self.stream, pages, "page limit reached");
                return Ok(ProcessResult::Synced {
                    pages,
                    events,
                    checkpoint: since,
                    more_pending: true,
                });
            }
        }
    }

    /// Applies one page in a fresh batch context and notifies listeners.
    async fn apply_batch(&self, since: &EventId, batch: &EventBatch) -> SyncResult<usize> {
        let mut context = BatchContext::new(self.listeners.len());
        let outcome = self.apply_context(since, batch, &mut context).await;
        self.notify(&context, outcome.is_ok()).await;

        if let Ok(events) = outcome {
            let mut stats = self.stats.write();
            stats.batches_applied += 1;
            stats.events_applied += events as u64;
        }
        outcome
    }

    async fn apply_context(
        &self,
        since: &EventId,
        batch: &EventBatch,
        context: &mut BatchContext,
    ) -> SyncResult<usize> {
        for (i, listener) in self.listeners.iter().enumerate() {
            listener
                .collect(&self.stream, batch, context, i)
                .map_err(|e| match e {
                    SyncError::Deserialize { .. } => e,
                    other => SyncError::Deserialize {
                        listener: listener.name().to_string(),
                        message: other.to_string(),
                    },
                })?;
        }
        let events = context.total_events();
        if events == 0 && batch.next_event_id == *since {
            return Ok(0);
        }

        for (i, listener) in self.listeners.iter().enumerate() {
            if !context.has_upserts(i) {
                continue;
            }
            let Some(bucket) = context.slot(i) else {
                continue;
            };
            listener
                .prepare(&self.stream, bucket, self.store.as_ref())
                .await
                .map_err(|e| attribute(listener.name(), None, e))?;
            self.check_cancelled()?;
        }

        let stream = &self.stream;
        let listeners = &self.listeners;
        let context = &*context;
        self.store.transaction(&mut |txn| {
            for (i, listener) in listeners.iter().enumerate() {
                let Some(bucket) = context.slot(i) else {
                    continue;
                };
                for action in UPSERT_ACTIONS {
                    if bucket.count(action) > 0 {
                        listener
                            .apply(stream, action, bucket, txn)
                            .map_err(|e| attribute(listener.name(), Some(action), e))?;
                    }
                }
            }
            for (i, listener) in listeners.iter().enumerate().rev() {
                let Some(bucket) = context.slot(i) else {
                    continue;
                };
                if bucket.count(Action::Delete) > 0 {
                    listener
                        .apply(stream, Action::Delete, bucket, txn)
                        .map_err(|e| attribute(listener.name(), Some(Action::Delete), e))?;
                }
            }
            txn.set_checkpoint(stream, &batch.next_event_id)
        })?;

        debug!(
            stream = %self.stream,
            events,
            checkpoint = %batch.next_event_id,
            "batch applied"
        );
        Ok(events)
    }

    async fn notify(&self, context: &BatchContext, committed: bool) {
        for (i, listener) in self.listeners.iter().enumerate() {
            if !context.participated(i) {
                continue;
            }
            if committed {
                listener.success(&self.stream).await;
            } else {
                listener.failure(&self.stream).await;
            }
            listener.complete(&self.stream).await;
        }
    }

    /// Resets every listener of the stream kind and removes the checkpoint.
    async fn reset(&self) -> ProcessResult {
        warn!(stream = %self.stream, "checkpoint invalidated, resetting stream");
        for listener in &self.listeners {
            if let Err(e) = self.check_cancelled() {
                return ProcessResult::Failed(e);
            }
            if let Err(e) = listener.reset_all(&self.stream, self.store.as_ref()).await {
                return ProcessResult::Failed(attribute(listener.name(), None, e));
            }
        }
        if let Err(e) = self.store.clear_checkpoint(&self.stream) {
            return ProcessResult::Failed(e);
        }
        self.stats.write().resets += 1;
        info!(stream = %self.stream, "stream reset");
        ProcessResult::Reset
    }

    fn log_failure(&self, error: &SyncError) {
        match error {
            SyncError::Listener {
                listener, action, ..
            } => warn!(
                stream = %self.stream,
                listener = %listener,
                action = ?action,
                error = %error,
                "batch failed"
            ),
            SyncError::Deserialize { listener, .. } => warn!(
                stream = %self.stream,
                listener = %listener,
                error = %error,
                "batch failed"
            ),
            _ => warn!(stream = %self.stream, error = %error, "sync failed"),
        }
    }
}

impl<A: EventApi, S: LocalStore> std::fmt::Debug for SyncEngine<A, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("stream", &self.stream)
            .field("state", &self.state())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Tags an error raised by a listener with the listener's name.
fn attribute(listener: &str, action: Option<Action>, error: SyncError) -> SyncError {
    match error {
        SyncError::Listener { .. } | SyncError::Cancelled => error,
        other => SyncError::listener(listener, action, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockEventApi;
    use crate::batch::TypedEvent;
    use crate::listener::{EntityListener, TypedEvents};
    use crate::store::{MemoryStore, StoreTransaction};
    use async_trait::async_trait;
    use evsync_protocol::{RawEvent, StreamKind};

    struct Labels;

    #[async_trait]
    impl EntityListener for Labels {
        type Key = String;
        type Entity = Vec<u8>;

        fn name(&self) -> &str {
            "labels"
        }

        fn stream_kind(&self) -> StreamKind {
            StreamKind::Core
        }

        fn order(&self) -> u32 {
            0
        }

        fn deserialize(
            &self,
            _stream: &SyncStreamId,
            batch: &EventBatch,
        ) -> SyncResult<Option<TypedEvents<Self>>> {
            let events: Vec<_> = batch
                .events_of("label")
                .map(|e| match &e.raw_entity {
                    Some(body) => TypedEvent::upsert(e.key.clone(), e.action, body.clone()),
                    None => TypedEvent::delete(e.key.clone()),
                })
                .collect();
            Ok((!events.is_empty()).then_some(events))
        }

        fn on_create(
            &self,
            _stream: &SyncStreamId,
            events: &[TypedEvent<String, Vec<u8>>],
            txn: &mut dyn StoreTransaction,
        ) -> SyncResult<()> {
            for event in events {
                if let Some(entity) = &event.entity {
                    txn.put("label", &event.key, entity.clone())?;
                }
            }
            Ok(())
        }

        async fn on_reset_all(
            &self,
            _stream: &SyncStreamId,
            store: &dyn LocalStore,
        ) -> SyncResult<()> {
            store.delete_prefix("label", "")?;
            Ok(())
        }
    }

    fn engine(api: Arc<MockEventApi>, store: Arc<MemoryStore>) -> SyncEngine<MockEventApi, MemoryStore> {
        let listeners = ListenerRegistry::builder().register(Labels).build();
        let engine = SyncEngine::new(
            SyncStreamId::core("u1"),
            EngineConfig::default(),
            api,
            store,
            &listeners,
        );
        engine.start();
        engine
    }

    #[tokio::test]
    async fn stopped_engine_skips() {
        let engine = engine(Arc::new(MockEventApi::new()), Arc::new(MemoryStore::new()));
        engine.stop();
        assert_eq!(
            engine.process().await.unwrap(),
            ProcessResult::Skipped(SkipReason::Stopped)
        );
        assert_eq!(engine.stats().runs, 0);
    }

    #[tokio::test]
    async fn unregistered_kind_is_a_defect() {
        let listeners = ListenerRegistry::builder().register(Labels).build();
        let engine = SyncEngine::new(
            SyncStreamId::drive("u1", "s1"),
            EngineConfig::default(),
            Arc::new(MockEventApi::new()),
            Arc::new(MemoryStore::new()),
            &listeners,
        );
        engine.start();
        let err = engine.process().await.unwrap_err();
        assert!(err.is_defect());
    }

    #[tokio::test]
    async fn applies_page_and_advances_checkpoint() {
        let api = Arc::new(MockEventApi::new());
        let store = Arc::new(MemoryStore::new());
        let stream = SyncStreamId::core("u1");
        store.set_checkpoint(&stream, &EventId::new("e1")).unwrap();
        api.push_events(
            &stream,
            Ok(EventBatch::new(
                vec![RawEvent::create("label", "l1", vec![1])],
                EventId::new("e2"),
                false,
            )),
        );

        let engine = engine(api, store.clone());
        let result = engine.process().await.unwrap();

        assert_eq!(
            result,
            ProcessResult::Synced {
                pages: 1,
                events: 1,
                checkpoint: EventId::new("e2"),
                more_pending: false,
            }
        );
        assert_eq!(store.get("label", "l1").unwrap(), Some(vec![1]));
        assert_eq!(store.checkpoint(&stream).unwrap(), Some(EventId::new("e2")));
        assert_eq!(engine.stats().batches_applied, 1);
    }

    #[tokio::test]
    async fn unchanged_empty_page_does_not_commit() {
        let api = Arc::new(MockEventApi::new());
        let store = Arc::new(MemoryStore::new());
        store
            .set_checkpoint(&SyncStreamId::core("u1"), &EventId::new("e1"))
            .unwrap();
        let commits = store.commit_count();

        let engine = engine(api, store.clone());
        let result = engine.process().await.unwrap();

        assert!(matches!(result, ProcessResult::Synced { events: 0, .. }));
        assert_eq!(store.commit_count(), commits);
    }

    #[tokio::test]
    async fn suspend_stops_and_restores() {
        let engine = engine(Arc::new(MockEventApi::new()), Arc::new(MemoryStore::new()));

        let engine_ref = &engine;
        let inner = engine
            .suspend(|| async move {
                assert!(engine_ref.is_busy());
                engine_ref.process().await.unwrap()
            })
            .await;

        assert_eq!(inner, ProcessResult::Skipped(SkipReason::Stopped));
        assert_eq!(engine.state(), EngineState::Started);
        assert!(!engine.is_busy());
    }

    #[tokio::test]
    async fn stop_inside_suspend_stays_stopped() {
        let engine = engine(Arc::new(MockEventApi::new()), Arc::new(MemoryStore::new()));

        let engine_ref = &engine;
        engine
            .suspend(|| async move {
                assert_eq!(engine_ref.state(), EngineState::Stopped);
                engine_ref.stop();
            })
            .await;

        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(
            engine.process().await.unwrap(),
            ProcessResult::Skipped(SkipReason::Stopped)
        );
    }

    #[tokio::test]
    async fn start_inside_suspend_waits_for_block() {
        let engine = engine(Arc::new(MockEventApi::new()), Arc::new(MemoryStore::new()));
        engine.stop();

        let engine_ref = &engine;
        engine
            .suspend(|| async move {
                engine_ref.start();
                assert_eq!(engine_ref.state(), EngineState::Stopped);
            })
            .await;

        assert_eq!(engine.state(), EngineState::Started);
    }

    #[tokio::test]
    async fn pending_cancel_fails_next_run_once() {
        let api = Arc::new(MockEventApi::new());
        let engine = engine(api.clone(), Arc::new(MemoryStore::new()));
        engine.cancel();

        let result = engine.process().await.unwrap();
        assert_eq!(result, ProcessResult::Failed(SyncError::Cancelled));
        assert!(api.calls().is_empty());

        api.push_latest(&SyncStreamId::core("u1"), Ok(EventId::new("e9")));
        let result = engine.process().await.unwrap();
        assert!(matches!(result, ProcessResult::BaselineEstablished { .. }));
    }
}
