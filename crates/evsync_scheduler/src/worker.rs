//! The unit of work the scheduler runs.

use crate::outcome::JobOutcome;
use async_trait::async_trait;
use evsync_engine::{EngineRegistry, EventApi, LocalStore, ProcessResult};
use evsync_protocol::SyncStreamId;
use std::sync::Arc;
use tracing::{debug, error};

/// Runs one sync attempt for a stream.
#[async_trait]
pub trait SyncWorker: Send + Sync {
    /// Runs once and reports how the job should be rescheduled.
    async fn do_work(&self, stream: &SyncStreamId) -> JobOutcome;
}

/// A [`SyncWorker`] that runs the stream's engine from an [`EngineRegistry`].
pub struct EngineWorker<A: EventApi, S: LocalStore> {
    engines: Arc<EngineRegistry<A, S>>,
}

impl<A: EventApi, S: LocalStore> EngineWorker<A, S> {
    /// Creates a worker over `engines`.
    pub fn new(engines: Arc<EngineRegistry<A, S>>) -> Self {
        Self { engines }
    }

    /// Returns the engine registry.
    pub fn engines(&self) -> &Arc<EngineRegistry<A, S>> {
        &self.engines
    }
}

#[async_trait]
impl<A, S> SyncWorker for EngineWorker<A, S>
where
    A: EventApi + 'static,
    S: LocalStore + 'static,
{
    async fn do_work(&self, stream: &SyncStreamId) -> JobOutcome {
        let engine = self.engines.get_or_create(stream);
        let result = engine.process().await;
        let outcome = JobOutcome::from_process(&result);

        match &result {
            Ok(ProcessResult::Failed(_)) | Ok(ProcessResult::Reset) => {
                debug!(stream = %stream, outcome = %outcome, "sync run did not complete");
            }
            Ok(result) => debug!(stream = %stream, result = ?result, "sync run finished"),
            Err(err) => error!(stream = %stream, error = %err, "sync engine misconfigured"),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evsync_engine::{EngineConfig, MemoryStore, MockEventApi, SyncError};
    use evsync_protocol::{EventId, StreamKind};
    use evsync_testkit::prelude::*;

    fn worker(chain: &ListenerChain) -> (EngineWorker<MockEventApi, MemoryStore>, Arc<MockEventApi>) {
        let api = Arc::new(MockEventApi::new());
        let engines = EngineRegistry::new(
            api.clone(),
            Arc::new(MemoryStore::new()),
            chain.registry.clone(),
            EngineConfig::default(),
        );
        (EngineWorker::new(Arc::new(engines)), api)
    }

    #[tokio::test]
    async fn baseline_then_sync_succeed() {
        let chain = ListenerChain::new(StreamKind::Core);
        let (worker, api) = worker(&chain);
        let stream = SyncStreamId::core("u1");

        api.push_latest(&stream, Ok(EventId::new("e1")));
        assert_eq!(worker.do_work(&stream).await, JobOutcome::Success);
        assert_eq!(worker.do_work(&stream).await, JobOutcome::Success);
        assert_eq!(
            worker.engines().get(&stream).map(|engine| engine.stats().runs),
            Some(2)
        );
    }

    #[tokio::test]
    async fn connection_loss_is_retried() {
        let chain = ListenerChain::new(StreamKind::Core);
        let (worker, api) = worker(&chain);
        api.set_connected(false);

        assert_eq!(
            worker.do_work(&SyncStreamId::core("u1")).await,
            JobOutcome::Retry
        );
    }

    #[tokio::test]
    async fn invalid_checkpoint_is_retried_after_reset() {
        let chain = ListenerChain::new(StreamKind::Core);
        let (worker, api) = worker(&chain);
        let stream = SyncStreamId::core("u1");

        api.push_latest(&stream, Ok(EventId::new("e1")));
        worker.do_work(&stream).await;
        api.push_events(&stream, Err(SyncError::CheckpointInvalid));

        assert_eq!(worker.do_work(&stream).await, JobOutcome::Retry);
        assert_eq!(chain.log.count(Hook::ResetAll), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_engine_is_retried() {
        let chain = ListenerChain::new(StreamKind::Core);
        let (worker, api) = worker(&chain);
        let stream = SyncStreamId::core("u1");
        api.set_delay(Some(std::time::Duration::from_secs(10)));
        api.push_latest(&stream, Ok(EventId::new("e1")));

        let (first, second) = tokio::join!(worker.do_work(&stream), async {
            tokio::task::yield_now().await;
            worker.do_work(&stream).await
        });
        assert_eq!(first, JobOutcome::Success);
        assert_eq!(second, JobOutcome::Retry);
    }

    #[tokio::test]
    async fn unregistered_kind_fails() {
        let chain = ListenerChain::new(StreamKind::Core);
        let (worker, _) = worker(&chain);

        assert_eq!(
            worker.do_work(&SyncStreamId::drive("u1", "s1")).await,
            JobOutcome::Failure
        );
    }
}
