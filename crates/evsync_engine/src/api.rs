//! Remote event log API abstraction.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use evsync_protocol::{EventBatch, EventId, SyncStreamId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Access to the remote event log of every stream.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, mock for testing, etc.). Implementations return
/// typed errors: connection problems as [`SyncError::Transport`], server error
/// payloads as [`SyncError::Api`] and a rejected `since` id as
/// [`SyncError::CheckpointInvalid`].
#[async_trait]
pub trait EventApi: Send + Sync {
    /// Fetches the current head of the stream's event log.
    async fn latest_event_id(&self, stream: &SyncStreamId) -> SyncResult<EventId>;

    /// Fetches the next page of events after `since`.
    async fn events(&self, stream: &SyncStreamId, since: &EventId) -> SyncResult<EventBatch>;
}

/// A call recorded by [`MockEventApi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    /// `latest_event_id(stream)`.
    Latest(SyncStreamId),
    /// `events(stream, since)`.
    Events(SyncStreamId, EventId),
}

/// A scripted event API for testing.
///
/// Responses are queued per stream and consumed in order. When no `events`
/// response is queued an empty, final page positioned at `since` is returned.
#[derive(Debug)]
pub struct MockEventApi {
    connected: AtomicBool,
    delay: Mutex<Option<Duration>>,
    latest: Mutex<HashMap<SyncStreamId, VecDeque<SyncResult<EventId>>>>,
    pages: Mutex<HashMap<SyncStreamId, VecDeque<SyncResult<EventBatch>>>>,
    calls: Mutex<Vec<ApiCall>>,
}

impl MockEventApi {
    /// Creates a new mock API.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            delay: Mutex::new(None),
            latest: Mutex::new(HashMap::new()),
            pages: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queues a `latest_event_id` response.
    pub fn push_latest(&self, stream: &SyncStreamId, response: SyncResult<EventId>) {
        self.latest
            .lock()
            .entry(stream.clone())
            .or_default()
            .push_back(response);
    }

    /// Queues an `events` response.
    pub fn push_events(&self, stream: &SyncStreamId, response: SyncResult<EventBatch>) {
        self.pages
            .lock()
            .entry(stream.clone())
            .or_default()
            .push_back(response);
    }

    /// Sets the connected state. A disconnected mock fails every call with a
    /// retryable transport error.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Delays every response by `delay`, simulating a slow server.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Returns all calls made so far.
    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().clone()
    }

    async fn respond(&self) -> SyncResult<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::transport_retryable("mock api disconnected"))
        }
    }
}

impl Default for MockEventApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventApi for MockEventApi {
    async fn latest_event_id(&self, stream: &SyncStreamId) -> SyncResult<EventId> {
        self.calls.lock().push(ApiCall::Latest(stream.clone()));
        self.respond().await?;
        self.latest
            .lock()
            .get_mut(stream)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| Err(SyncError::transport_fatal("no mock latest response set")))
    }

    async fn events(&self, stream: &SyncStreamId, since: &EventId) -> SyncResult<EventBatch> {
        self.calls
            .lock()
            .push(ApiCall::Events(stream.clone(), since.clone()));
        self.respond().await?;
        self.pages
            .lock()
            .get_mut(stream)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| Ok(EventBatch::new(Vec::new(), since.clone(), false)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_api_queues_in_order() {
        let api = MockEventApi::new();
        let stream = SyncStreamId::core("u1");
        api.push_latest(&stream, Ok(EventId::new("e1")));
        api.push_events(
            &stream,
            Ok(EventBatch::new(Vec::new(), EventId::new("e2"), true)),
        );

        assert_eq!(api.latest_event_id(&stream).await.unwrap(), EventId::new("e1"));
        let page = api.events(&stream, &EventId::new("e1")).await.unwrap();
        assert_eq!(page.next_event_id, EventId::new("e2"));

        // Empty queue answers with a final page at `since`.
        let page = api.events(&stream, &EventId::new("e2")).await.unwrap();
        assert_eq!(page.next_event_id, EventId::new("e2"));
        assert!(!page.more);

        assert_eq!(api.calls().len(), 3);
    }

    #[tokio::test]
    async fn mock_api_disconnected() {
        let api = MockEventApi::new();
        api.set_connected(false);
        let err = api
            .events(&SyncStreamId::core("u1"), &EventId::new("e"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn mock_api_delay() {
        let api = MockEventApi::new();
        let stream = SyncStreamId::core("u1");
        api.set_delay(Some(Duration::from_secs(10)));

        let started = tokio::time::Instant::now();
        api.events(&stream, &EventId::new("e1")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(10));
    }
}
